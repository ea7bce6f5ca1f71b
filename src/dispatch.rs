// Script dispatcher with bounded concurrency

//! Script execution with bounded concurrency and timeouts
//!
//! The dispatcher turns each incoming transition into zero or more script
//! executions. Every dispatch decision reads exactly one rule snapshot. A
//! fair semaphore caps simultaneously running scripts system-wide (excess
//! dispatches queue in event order); a duplicate dispatch for a
//! `(script, kind)` pair that is still running is dropped, not queued, so a
//! flapping network cannot pile up a backlog. Script outcomes are recorded
//! and never escalate: a misbehaving script cannot crash the daemon.
//!
//! Process spawning sits behind the [`ProcessRunner`] capability so the
//! dispatch logic is testable without real child processes.

use crate::logsink::{LogEvent, LogHandle};
use crate::rules::ConfigStore;
use crate::types::{ExecOutcome, ExecutionRecord, Transition, TransitionKind};
use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;

/// One script invocation, fully described.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Script to execute
    pub script: PathBuf,
    /// Environment variables exposing the transition context
    pub env: Vec<(String, String)>,
    /// Per-execution timeout
    pub timeout: Duration,
}

/// What became of one invocation.
#[derive(Debug, Clone)]
pub struct ExecStatus {
    /// Final classification
    pub outcome: ExecOutcome,
    /// Exit code when the process ran to completion
    pub exit_code: Option<i32>,
    /// Bounded tail of captured stdout+stderr, or the spawn error text
    pub output_tail: String,
}

/// Capability for executing scripts as child processes.
///
/// `kill` is the shutdown broadcast: when it fires, the runner must
/// terminate the child and report [`ExecOutcome::Timeout`], the same
/// mechanism as the per-execution timer.
pub trait ProcessRunner: Send + Sync + 'static {
    /// Execute one invocation to completion, timeout, or kill.
    fn run(
        &self,
        invocation: Invocation,
        kill: watch::Receiver<bool>,
    ) -> impl Future<Output = ExecStatus> + Send;
}

/// Resolves when a shutdown kill is requested. A closed channel counts as
/// shutdown too, so an orphaned worker cannot outlive the daemon.
async fn wait_kill(kill: &mut watch::Receiver<bool>) {
    let _ = kill.wait_for(|requested| *requested).await;
}

/// Truncate captured output to its last `cap` bytes, keeping valid UTF-8.
fn output_tail(raw: &[u8], cap: usize) -> String {
    let start = raw.len().saturating_sub(cap);
    let tail = String::from_utf8_lossy(&raw[start..]);
    if start > 0 {
        // A cut landing mid-sequence leaves replacement characters up front
        tail.trim_start_matches('\u{FFFD}').to_string()
    } else {
        tail.into_owned()
    }
}

/// How long the pipe drain keeps running after the direct child has been
/// reaped. A script that leaves a background child (`foo &`) keeps the
/// pipes open past its own exit; its output is not ours to wait for.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Read a pipe to EOF in chunks, appending to the shared capture buffer.
async fn drain_pipe<P: AsyncRead + Unpin>(mut pipe: P, buf: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend_from_slice(&chunk[..n]),
        }
    }
}

/// Live runner backed by `tokio::process`.
pub struct TokioRunner {
    /// Bytes of stdout+stderr tail retained per execution
    pub output_tail_bytes: usize,
}

impl ProcessRunner for TokioRunner {
    async fn run(&self, invocation: Invocation, mut kill: watch::Receiver<bool>) -> ExecStatus {
        let mut cmd = Command::new(&invocation.script);
        cmd.envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecStatus {
                    outcome: ExecOutcome::SpawnError,
                    exit_code: None,
                    output_tail: e.to_string(),
                }
            }
        };

        // Drain both pipes concurrently so neither can fill up and stall
        // the child. The buffer is shared so whatever arrived is still
        // available if the drain has to be cut short.
        let captured: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_buf = captured.clone();
        let err_buf = captured.clone();
        let mut reader = tokio::spawn(async move {
            let read_out = async {
                if let Some(out) = stdout {
                    drain_pipe(out, out_buf).await;
                }
            };
            let read_err = async {
                if let Some(err) = stderr {
                    drain_pipe(err, err_buf).await;
                }
            };
            tokio::join!(read_out, read_err);
        });

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(invocation.timeout) => None,
            _ = wait_kill(&mut kill) => None,
        };

        let (outcome, exit_code) = match waited {
            Some(Ok(status)) => {
                if status.success() {
                    (ExecOutcome::Success, status.code())
                } else {
                    (ExecOutcome::NonZeroExit, status.code())
                }
            }
            Some(Err(e)) => {
                log::error!("Failed to wait on {}: {}", invocation.script.display(), e);
                (ExecOutcome::SpawnError, None)
            }
            None => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                (ExecOutcome::Timeout, None)
            }
        };

        // The child is reaped, but a lingering background child may still
        // hold the pipes open; the drain gets a bounded grace, not a wait
        // to pipe EOF.
        if tokio::time::timeout(PIPE_DRAIN_GRACE, &mut reader)
            .await
            .is_err()
        {
            reader.abort();
        }
        let raw = std::mem::take(&mut *captured.lock().unwrap_or_else(|e| e.into_inner()));
        ExecStatus {
            outcome,
            exit_code,
            output_tail: output_tail(&raw, self.output_tail_bytes),
        }
    }
}

/// Consumes transitions and runs matching scripts under the safety limits.
pub struct Dispatcher<R: ProcessRunner> {
    store: Arc<ConfigStore>,
    runner: Arc<R>,
    log: LogHandle,
    limiter: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<(PathBuf, TransitionKind)>>>,
    script_timeout: Duration,
    kill_tx: watch::Sender<bool>,
    workers: JoinSet<()>,
}

impl<R: ProcessRunner> Dispatcher<R> {
    /// Wire a dispatcher to its rule store, runner, and log sink.
    pub fn new(
        store: Arc<ConfigStore>,
        runner: Arc<R>,
        log: LogHandle,
        max_concurrent: usize,
        script_timeout: Duration,
    ) -> Self {
        Self {
            store,
            runner,
            log,
            limiter: Arc::new(Semaphore::new(max_concurrent)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            script_timeout,
            kill_tx: watch::channel(false).0,
            workers: JoinSet::new(),
        }
    }

    /// Consume transitions until the channel closes.
    pub async fn run(&mut self, rx: &mut mpsc::Receiver<Transition>) {
        while let Some(transition) = rx.recv().await {
            self.dispatch(transition).await;
        }
    }

    /// Dispatch one transition: resolve rules from a single snapshot and
    /// start a worker per matching rule. Waits for worker-pool capacity
    /// (FIFO), so excess dispatches queue in event order.
    pub async fn dispatch(&mut self, transition: Transition) {
        // Reap finished workers so the join set stays small
        while self.workers.try_join_next().is_some() {}

        let snapshot = self.store.current();
        let matched = snapshot.matching(&transition);
        if matched.is_empty() {
            log::debug!(
                "No rules match {} on {:?}",
                transition.kind.as_str(),
                transition.subject_ssid()
            );
            return;
        }
        log::debug!(
            "Snapshot v{}: {} rule(s) match {}",
            snapshot.version,
            matched.len(),
            transition.kind.as_str()
        );

        // Clone out what workers need; `matched` borrows the snapshot
        let scripts: Vec<PathBuf> = matched.iter().map(|r| r.script.clone()).collect();

        for script in scripts {
            let key = (script, transition.kind);

            let busy = {
                let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                !set.insert(key.clone())
            };
            if busy {
                log::info!(
                    "Dropping duplicate {} dispatch for {}",
                    transition.kind.as_str(),
                    key.0.display()
                );
                self.log
                    .send(LogEvent::Dropped {
                        script: key.0,
                        kind: key.1,
                    })
                    .await;
                continue;
            }

            let started = Utc::now();
            let Ok(permit) = self.limiter.clone().acquire_owned().await else {
                // Semaphore closed: shutting down
                return;
            };

            let invocation = Invocation {
                script: key.0.clone(),
                env: transition.script_env(),
                timeout: self.script_timeout,
            };
            let runner = self.runner.clone();
            let log = self.log.clone();
            let in_flight = self.in_flight.clone();
            let kill = self.kill_tx.subscribe();
            let transition = transition.clone();

            self.workers.spawn(async move {
                let status = runner.run(invocation, kill).await;
                let finished = Utc::now();
                {
                    let mut set = in_flight.lock().unwrap_or_else(|e| e.into_inner());
                    set.remove(&key);
                }
                log.send(LogEvent::Exec(ExecutionRecord {
                    script: key.0,
                    transition,
                    started,
                    finished,
                    exit_code: status.exit_code,
                    outcome: status.outcome,
                    output_tail: status.output_tail,
                }))
                .await;
                drop(permit);
            });
        }
    }

    /// Drain in-flight executions, bounded by `drain_timeout`; stragglers
    /// are force-killed through the same mechanism as the script timeout.
    pub async fn shutdown(mut self, drain_timeout: Duration) {
        let drained = tokio::time::timeout(drain_timeout, async {
            while self.workers.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            log::warn!(
                "In-flight scripts exceeded the {}s drain budget, killing them",
                drain_timeout.as_secs()
            );
            self.log
                .warning("dispatch", "drain timeout, killing remaining scripts".into())
                .await;
            let _ = self.kill_tx.send(true);

            // Killed children exit promptly; the extra window is only for
            // the kill to propagate before we abandon the workers.
            let killed = tokio::time::timeout(drain_timeout, async {
                while self.workers.join_next().await.is_some() {}
            })
            .await
            .is_ok();
            if !killed {
                self.workers.abort_all();
            }
        }
    }
}
