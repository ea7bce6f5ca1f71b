// Wi-Fi network change watcher daemon

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use wifiwatcher::{
    config::{self, Settings},
    dispatch::{Dispatcher, TokioRunner},
    logsink::{self, LogEvent, LogHandle},
    observer::{self, Observer, SampleSource},
    rules::ConfigStore,
    setup,
};

/// Size of the channel buffer for debounced transitions
const TRANSITION_CHANNEL_SIZE: usize = 32;

// Process exit codes, stable for the external service supervisor.
/// Clean shutdown
const EXIT_OK: u8 = 0;
/// Unrecoverable startup failure (settings, rules file, log sink)
const EXIT_STARTUP_FAILURE: u8 = 1;
/// Wireless subscription permanently failed; a process restart is expected
const EXIT_SUBSCRIPTION_LOST: u8 = 2;

#[derive(Parser)]
#[command(name = "wifiwatcher", version)]
#[command(about = "Monitor Wi-Fi network changes and execute scripts", long_about = None)]
struct Args {
    /// Run the monitoring daemon; does not return until terminated
    #[arg(long)]
    monitor: bool,

    /// Create a default configuration file and example scripts
    #[arg(long)]
    setup: bool,

    /// Path to the daemon settings file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.setup {
        return match setup::run_setup() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("wifiwatcher: setup failed: {:#}", e);
                ExitCode::from(EXIT_STARTUP_FAILURE)
            }
        };
    }

    if !args.monitor {
        eprintln!("wifiwatcher: nothing to do (pass --monitor or --setup, see --help)");
        return ExitCode::from(EXIT_STARTUP_FAILURE);
    }

    // Build custom Tokio runtime with limited thread pool
    // 2 threads is sufficient: 1 for the main loop, 1 for the D-Bus
    // monitor + script spawns
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("wifiwatcher")
        .thread_stack_size(2 * 1024 * 1024) // 2MB stack (vs 8MB default)
        .enable_time()
        .enable_io()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("wifiwatcher: failed to build runtime: {}", e);
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    match runtime.block_on(monitor(&args)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("wifiwatcher: {:#}", e);
            ExitCode::from(EXIT_STARTUP_FAILURE)
        }
    }
}

async fn monitor(args: &Args) -> Result<u8> {
    let settings = config::load_settings(args.config.as_deref())?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&settings.general.log_level),
    )
    .init();

    log::info!("Starting wifiwatcher daemon");
    log::info!(
        "Debounce window: {}s, poll interval: {}s, worker cap: {}, script timeout: {}s",
        settings.general.debounce_secs,
        settings.general.poll_interval_secs,
        settings.dispatch.max_concurrent,
        settings.dispatch.script_timeout_secs,
    );

    let (event_log, log_task) = logsink::start(settings.general.log_file.as_deref())?;

    let code = run_daemon(&settings, event_log).await;

    // Every component handle is gone by now; wait for the sink to flush
    let _ = log_task.await;
    code
}

async fn run_daemon(settings: &Settings, event_log: LogHandle) -> Result<u8> {
    // Config store
    let rules_path = settings.rules_path();
    let (store, warnings) = ConfigStore::load(rules_path.clone()).with_context(|| {
        format!(
            "Cannot load rules from {} (run 'wifiwatcher --setup' to create it)",
            rules_path.display()
        )
    })?;
    for warning in &warnings {
        log::warn!("{}", warning);
        event_log.warning("config", warning.clone()).await;
    }
    let store = Arc::new(store);
    log::info!(
        "Loaded {} rule(s) from {}",
        store.current().rules().len(),
        rules_path.display()
    );

    // Observer
    let interface = match &settings.general.monitor_interface {
        Some(iface) => iface.clone(),
        None => observer::detect_wireless_interface()?,
    };
    log::info!("Watching interface: {}", interface);

    let poll_interval = Duration::from_secs(settings.general.poll_interval_secs);
    let source = match observer::connect_with_retry(interface, poll_interval).await {
        Ok(source) => source,
        Err(e) => {
            log::error!("{:#}", e);
            event_log.warning("observer", format!("{:#}", e)).await;
            return Ok(EXIT_SUBSCRIPTION_LOST);
        }
    };

    run_loop(settings, store, source, event_log).await
}

/// Main daemon loop, generic over the sample source so the exit behavior
/// is testable without a live D-Bus connection.
async fn run_loop<S>(
    settings: &Settings,
    store: Arc<ConfigStore>,
    source: S,
    event_log: LogHandle,
) -> Result<u8>
where
    S: SampleSource + 'static,
{
    let rules_path = settings.rules_path();

    let (transition_tx, mut transition_rx) = mpsc::channel(TRANSITION_CHANNEL_SIZE);
    let obs = Observer::new(
        source,
        Duration::from_secs(settings.general.debounce_secs),
        transition_tx,
        event_log.clone(),
    );
    let mut observer_handle = tokio::spawn(obs.run());

    // Dispatcher
    let runner = Arc::new(TokioRunner {
        output_tail_bytes: settings.dispatch.output_tail_bytes,
    });
    let mut dispatcher = Dispatcher::new(
        store.clone(),
        runner,
        event_log.clone(),
        settings.dispatch.max_concurrent,
        Duration::from_secs(settings.dispatch.script_timeout_secs),
    );

    // Signal handlers: SIGTERM/SIGINT terminate, SIGHUP reloads rules
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to set up SIGHUP handler")?;

    event_log
        .note("daemon", format!("started, watching rules in {}", rules_path.display()))
        .await;
    log::info!("Daemon started successfully");

    let mut exit = EXIT_OK;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT");
                break;
            }

            _ = sighup.recv() => {
                log::info!("Received SIGHUP, reloading rules");
                match store.reload() {
                    Ok((count, warnings)) => {
                        for warning in &warnings {
                            log::warn!("{}", warning);
                            event_log.warning("config", warning.clone()).await;
                        }
                        event_log
                            .note("config", format!("reloaded, {} rule(s) active", count))
                            .await;
                    }
                    Err(e) => {
                        log::error!("Reload failed, keeping previous rules: {:#}", e);
                        event_log
                            .warning(
                                "config",
                                format!("reload failed, keeping previous rules: {:#}", e),
                            )
                            .await;
                    }
                }
            }

            // Observer task health (fail-fast: escalate to supervisor restart)
            result = &mut observer_handle => {
                exit = observer_exited(result, &event_log).await;
                break;
            }

            // Debounced transitions
            maybe = transition_rx.recv() => {
                match maybe {
                    Some(transition) => {
                        event_log.send(LogEvent::Transition(transition.clone())).await;
                        dispatcher.dispatch(transition).await;
                    }
                    // A closed channel means the observer is gone; the
                    // select may reach this branch before the handle
                    // branch, so pick up the observer's verdict here too
                    None => {
                        let result = (&mut observer_handle).await;
                        exit = observer_exited(result, &event_log).await;
                        break;
                    }
                }
            }
        }
    }

    // Stop intake, then drain in-flight executions bounded by the budget
    observer_handle.abort();
    drop(transition_rx);
    dispatcher
        .shutdown(Duration::from_secs(settings.dispatch.drain_timeout_secs))
        .await;

    event_log.note("daemon", "shutdown complete".into()).await;
    log::info!("Shutdown complete");
    Ok(exit)
}

/// Any observer completion while the daemon is running means the wireless
/// subscription is gone for good; the supervisor is expected to restart us.
async fn observer_exited(
    result: Result<Result<()>, tokio::task::JoinError>,
    event_log: &LogHandle,
) -> u8 {
    match result {
        Ok(Ok(())) => log::error!("Observer exited unexpectedly"),
        Ok(Err(e)) => log::error!("Observer failed: {:#}", e),
        Err(e) => log::error!("Observer panicked: {}", e),
    }
    event_log
        .warning(
            "observer",
            "wireless subscription lost, exiting for supervisor restart".into(),
        )
        .await;
    EXIT_SUBSCRIPTION_LOST
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use wifiwatcher::observer::ScriptedSource;
    use wifiwatcher::types::NetworkState;

    #[tokio::test(start_paused = true)]
    async fn permanent_sampling_failure_exits_with_subscription_code() {
        // The source fails past the retry budget; whichever select branch
        // notices first, the daemon must exit with the subscription-lost
        // code, never a clean zero.
        let dir = tempfile::TempDir::new().unwrap();
        let rules_file = dir.path().join("rules");
        std::fs::write(&rules_file, "# no rules\n").unwrap();
        let (store, _) = ConfigStore::load(rules_file).unwrap();

        let (event_log, log_task) =
            logsink::start(Some(&dir.path().join("events.log"))).unwrap();

        let entries: Vec<(Duration, Result<NetworkState>)> = (0..9)
            .map(|_| (Duration::from_millis(10), Err(anyhow!("bus down"))))
            .collect();

        let code = run_loop(
            &Settings::default(),
            Arc::new(store),
            ScriptedSource::new(entries),
            event_log,
        )
        .await
        .unwrap();
        assert_eq!(code, EXIT_SUBSCRIPTION_LOST);
        log_task.await.unwrap();
    }
}
