// Shared types for observer and dispatcher

//! Shared data structures
//!
//! Network association snapshots, the transition classification produced by
//! the observer, and the execution records handed to the log sink.

use chrono::{DateTime, SecondsFormat, Utc};
use std::path::PathBuf;

/// Point-in-time wireless association snapshot for one interface.
///
/// `ssid`/`bssid` of `None` means the interface is not associated.
#[derive(Debug, Clone)]
pub struct NetworkState {
    /// Interface the sample was taken from (e.g. `wlan0`)
    pub interface: String,
    /// Network name, absent when disconnected
    pub ssid: Option<String>,
    /// Access point hardware address, absent when disconnected
    pub bssid: Option<String>,
    /// Wall-clock time the sample was taken
    pub observed_at: DateTime<Utc>,
}

impl NetworkState {
    /// A disconnected snapshot for the given interface, stamped now.
    pub fn disconnected(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            ssid: None,
            bssid: None,
            observed_at: Utc::now(),
        }
    }

    /// An associated snapshot, stamped now.
    pub fn connected(interface: &str, ssid: &str, bssid: Option<&str>) -> Self {
        Self {
            interface: interface.to_string(),
            ssid: Some(ssid.to_string()),
            bssid: bssid.map(str::to_string),
            observed_at: Utc::now(),
        }
    }

    /// Whether two samples describe the same association.
    ///
    /// Timestamps are ignored; only identity fields count.
    pub fn same_association(&self, other: &NetworkState) -> bool {
        self.interface == other.interface && self.ssid == other.ssid && self.bssid == other.bssid
    }
}

/// Classified wireless state transition kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    /// Association with a network appeared (or moved to a different SSID)
    Connect,
    /// Association was lost
    Disconnect,
    /// Same SSID, different access point
    Roam,
    /// No observable change; filtered out before emission
    NoOp,
}

impl TransitionKind {
    /// Lowercase wire/log name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Connect => "connect",
            TransitionKind::Disconnect => "disconnect",
            TransitionKind::Roam => "roam",
            TransitionKind::NoOp => "noop",
        }
    }

    /// Parse a rule-file event kind token (case-insensitive).
    ///
    /// `NoOp` is not accepted: it never reaches the rule layer.
    pub fn parse(token: &str) -> Option<TransitionKind> {
        match token.trim().to_ascii_lowercase().as_str() {
            "connect" => Some(TransitionKind::Connect),
            "disconnect" => Some(TransitionKind::Disconnect),
            "roam" => Some(TransitionKind::Roam),
            _ => None,
        }
    }
}

/// Classify a new sample against the previously committed one.
pub fn classify(previous: &NetworkState, current: &NetworkState) -> TransitionKind {
    match (&previous.ssid, &current.ssid) {
        (None, Some(_)) => TransitionKind::Connect,
        (Some(_), None) => TransitionKind::Disconnect,
        (Some(prev), Some(cur)) if prev == cur => {
            if previous.bssid != current.bssid {
                TransitionKind::Roam
            } else {
                TransitionKind::NoOp
            }
        }
        // Direct hop between two different networks reads as joining the new one
        (Some(_), Some(_)) => TransitionKind::Connect,
        (None, None) => TransitionKind::NoOp,
    }
}

/// A debounced, classified state transition emitted by the observer.
#[derive(Debug, Clone)]
pub struct Transition {
    /// What happened
    pub kind: TransitionKind,
    /// Committed state before the change
    pub previous: NetworkState,
    /// Newly committed state
    pub current: NetworkState,
}

impl Transition {
    /// The SSID a rule pattern is matched against.
    ///
    /// The current SSID for connects and roams; the one that was left for
    /// disconnects.
    pub fn subject_ssid(&self) -> Option<&str> {
        self.current.ssid.as_deref().or(self.previous.ssid.as_deref())
    }

    /// Environment variables exposing the transition context to scripts.
    pub fn script_env(&self) -> Vec<(String, String)> {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        vec![
            ("WIFIWATCHER_EVENT".into(), self.kind.as_str().into()),
            ("WIFIWATCHER_INTERFACE".into(), self.current.interface.clone()),
            ("WIFIWATCHER_SSID".into(), opt(&self.current.ssid)),
            ("WIFIWATCHER_BSSID".into(), opt(&self.current.bssid)),
            ("WIFIWATCHER_PREV_SSID".into(), opt(&self.previous.ssid)),
            ("WIFIWATCHER_PREV_BSSID".into(), opt(&self.previous.bssid)),
            (
                "WIFIWATCHER_TIMESTAMP".into(),
                self.current
                    .observed_at
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        ]
    }
}

/// Final outcome of one script execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Script exited with status 0
    Success,
    /// Script exited with a non-zero status
    NonZeroExit,
    /// Script exceeded the execution timeout (or the shutdown drain budget)
    Timeout,
    /// Process creation failed
    SpawnError,
}

impl ExecOutcome {
    /// Lowercase log name of the outcome.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecOutcome::Success => "success",
            ExecOutcome::NonZeroExit => "nonzero-exit",
            ExecOutcome::Timeout => "timeout",
            ExecOutcome::SpawnError => "spawn-error",
        }
    }
}

/// Record of one dispatch attempt, finalized at process exit or timeout.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    /// Script that was (or failed to be) executed
    pub script: PathBuf,
    /// Transition that triggered the execution
    pub transition: Transition,
    /// Dispatch start time
    pub started: DateTime<Utc>,
    /// Process exit / timeout time
    pub finished: DateTime<Utc>,
    /// Exit code when the process ran to completion
    pub exit_code: Option<i32>,
    /// Final classification of the attempt
    pub outcome: ExecOutcome,
    /// Bounded tail of captured stdout+stderr (or the spawn error text)
    pub output_tail: String,
}
