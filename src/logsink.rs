// Append-only execution event log

//! Append-only execution event log
//!
//! Every dispatch outcome, dropped duplicate, transition, and component
//! warning becomes one line in the event log, flushed immediately so an
//! external viewer tails near-real-time output. Rotation and retention are
//! left to external tooling.
//!
//! Components hold a cheap [`LogHandle`] and send events over a channel; a
//! single writer task owns the output so lines never interleave.

use crate::types::{ExecutionRecord, Transition, TransitionKind};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Size of the event channel between components and the writer task.
const LOG_CHANNEL_SIZE: usize = 128;

/// Events recorded in the log.
#[derive(Debug)]
pub enum LogEvent {
    /// A finalized script execution attempt
    Exec(ExecutionRecord),
    /// A duplicate dispatch dropped because the same (script, kind) pair was
    /// still running
    Dropped {
        /// Script whose duplicate dispatch was dropped
        script: PathBuf,
        /// Transition kind of the dropped dispatch
        kind: TransitionKind,
    },
    /// A committed transition, as emitted by the observer
    Transition(Transition),
    /// A component warning (config load, observer subscription, ...)
    Warning {
        /// Component the warning originated from
        component: &'static str,
        /// Human-readable description
        message: String,
    },
    /// A lifecycle note (startup, reload, shutdown)
    Note {
        /// Component the note originated from
        component: &'static str,
        /// Human-readable description
        message: String,
    },
}

/// Cloneable sending side of the event log.
#[derive(Clone)]
pub struct LogHandle {
    tx: mpsc::Sender<LogEvent>,
}

impl LogHandle {
    /// Record an event. A full channel applies backpressure until the
    /// writer catches up; a closed channel (writer already gone during
    /// shutdown) drops the event silently instead of erroring.
    pub async fn send(&self, event: LogEvent) {
        let _ = self.tx.send(event).await;
    }

    /// Record a component warning.
    pub async fn warning(&self, component: &'static str, message: String) {
        self.send(LogEvent::Warning { component, message }).await;
    }

    /// Record a lifecycle note.
    pub async fn note(&self, component: &'static str, message: String) {
        self.send(LogEvent::Note { component, message }).await;
    }
}

/// Open the log target and spawn the writer task.
///
/// `target` of `None` writes to stdout, for setups where the external
/// supervisor redirects daemon output to the log file itself. The returned
/// task finishes once every [`LogHandle`] clone has been dropped and the
/// channel drained, flushing on the way out.
pub fn start(target: Option<&Path>) -> Result<(LogHandle, JoinHandle<()>)> {
    let mut writer: Box<dyn Write + Send> = match target {
        Some(path) => Box::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    };

    let (tx, mut rx) = mpsc::channel(LOG_CHANNEL_SIZE);
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let line = format_line(&event);
            if writeln!(writer, "{}", line).is_err() {
                log::error!("Failed to write event log line");
            }
            let _ = writer.flush();
        }
        let _ = writer.flush();
    });

    Ok((LogHandle { tx }, task))
}

fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Format one event as a single log line.
pub fn format_line(event: &LogEvent) -> String {
    match event {
        LogEvent::Exec(record) => {
            let duration_ms = (record.finished - record.started).num_milliseconds();
            let exit = match record.exit_code {
                Some(code) => code.to_string(),
                None => "-".to_string(),
            };
            let mut line = format!(
                "{} dispatch outcome={} event={} script={} exit={} duration_ms={}",
                stamp(record.finished),
                record.outcome.as_str(),
                record.transition.kind.as_str(),
                record.script.display(),
                exit,
                duration_ms,
            );
            if record.outcome != crate::types::ExecOutcome::Success
                && !record.output_tail.is_empty()
            {
                line.push_str(&format!(" output={:?}", record.output_tail));
            }
            line
        }
        LogEvent::Dropped { script, kind } => format!(
            "{} dispatch outcome=dropped event={} script={} reason=already-running",
            stamp(Utc::now()),
            kind.as_str(),
            script.display(),
        ),
        LogEvent::Transition(t) => format!(
            "{} observer event={} interface={} ssid={:?} bssid={:?} prev_ssid={:?}",
            stamp(t.current.observed_at),
            t.kind.as_str(),
            t.current.interface,
            t.current.ssid.as_deref().unwrap_or(""),
            t.current.bssid.as_deref().unwrap_or(""),
            t.previous.ssid.as_deref().unwrap_or(""),
        ),
        LogEvent::Warning { component, message } => {
            format!("{} {} warn msg={:?}", stamp(Utc::now()), component, message)
        }
        LogEvent::Note { component, message } => {
            format!("{} {} note msg={:?}", stamp(Utc::now()), component, message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecOutcome, NetworkState};
    use std::fs;

    fn sample_record(outcome: ExecOutcome, exit_code: Option<i32>) -> ExecutionRecord {
        let started = Utc::now();
        ExecutionRecord {
            script: PathBuf::from("/scripts/on_home.sh"),
            transition: Transition {
                kind: TransitionKind::Connect,
                previous: NetworkState::disconnected("wlan0"),
                current: NetworkState::connected("wlan0", "Home", Some("aa:bb")),
            },
            started,
            finished: started + chrono::Duration::milliseconds(42),
            exit_code,
            outcome,
            output_tail: String::new(),
        }
    }

    #[test]
    fn exec_line_contains_outcome_script_and_exit() {
        let line = format_line(&LogEvent::Exec(sample_record(ExecOutcome::Success, Some(0))));
        assert!(line.contains("dispatch outcome=success"));
        assert!(line.contains("event=connect"));
        assert!(line.contains("script=/scripts/on_home.sh"));
        assert!(line.contains("exit=0"));
        assert!(line.contains("duration_ms=42"));
    }

    #[test]
    fn failed_exec_line_includes_output_tail() {
        let mut record = sample_record(ExecOutcome::NonZeroExit, Some(3));
        record.output_tail = "mount: denied".to_string();
        let line = format_line(&LogEvent::Exec(record));
        assert!(line.contains("exit=3"));
        assert!(line.contains("output=\"mount: denied\""));
    }

    #[test]
    fn timeout_line_has_no_exit_code() {
        let line = format_line(&LogEvent::Exec(sample_record(ExecOutcome::Timeout, None)));
        assert!(line.contains("outcome=timeout"));
        assert!(line.contains("exit=-"));
    }

    #[test]
    fn dropped_line_names_reason() {
        let line = format_line(&LogEvent::Dropped {
            script: PathBuf::from("/scripts/x.sh"),
            kind: TransitionKind::Roam,
        });
        assert!(line.contains("outcome=dropped"));
        assert!(line.contains("event=roam"));
        assert!(line.contains("reason=already-running"));
    }

    #[tokio::test]
    async fn writer_appends_and_flushes_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("events.log");

        let (handle, task) = start(Some(&path)).unwrap();
        handle.warning("config", "line 3: bad".to_string()).await;
        handle.note("daemon", "started".to_string()).await;
        drop(handle);
        task.await.unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("config warn"));
        assert!(lines[1].contains("daemon note"));
    }

    #[tokio::test]
    async fn send_after_writer_is_gone_is_silent() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = LogHandle { tx };
        handle.note("daemon", "late event".to_string()).await;
        handle.warning("config", "late warning".to_string()).await;
    }

    #[tokio::test]
    async fn writer_appends_across_restarts() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("events.log");

        for _ in 0..2 {
            let (handle, task) = start(Some(&path)).unwrap();
            handle.note("daemon", "started".to_string()).await;
            drop(handle);
            task.await.unwrap();
        }

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
