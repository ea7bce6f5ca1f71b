// NetworkManager wireless state observer via D-Bus

//! Wireless state sampling, debounce, and transition emission
//!
//! The observer samples the watched interface's association state from
//! NetworkManager over D-Bus, both on push notifications (property change
//! signals) and on a fixed poll interval as a fallback. Raw samples run
//! through a debouncer that suppresses association-negotiation flapping;
//! only transitions stable for the full window are classified and emitted.
//!
//! Sampling is abstracted behind the [`SampleSource`] capability so the
//! debounce and emission logic can be driven by a deterministic scripted
//! source in tests.

use crate::logsink::LogHandle;
use crate::types::{classify, NetworkState, Transition, TransitionKind};
use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::StreamExt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant, Interval};
use zbus::proxy::PropertyStream;
use zbus::zvariant::OwnedObjectPath;
use zbus::Connection;

/// Initial retry delay after a subscription/sampling failure (seconds)
const INITIAL_RETRY_DELAY_SECS: u64 = 1;

/// Retry delay cap for the exponential backoff (seconds)
const MAX_RETRY_DELAY_SECS: u64 = 30;

/// Consecutive failures tolerated before the observer escalates to a
/// daemon-fatal error and expects the external supervisor to restart us
const MAX_SUBSCRIPTION_RETRIES: u32 = 8;

/// D-Bus proxy for NetworkManager
#[zbus::proxy(
    interface = "org.freedesktop.NetworkManager",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager"
)]
trait NetworkManager {
    /// Look up the device object for an interface name
    fn get_device_by_ip_iface(&self, iface: &str) -> zbus::Result<OwnedObjectPath>;

    /// Get the primary connection object path
    #[zbus(property)]
    fn primary_connection(&self) -> zbus::Result<OwnedObjectPath>;
}

/// D-Bus proxy for wireless device
#[zbus::proxy(
    interface = "org.freedesktop.NetworkManager.Device.Wireless",
    default_service = "org.freedesktop.NetworkManager"
)]
trait WirelessDevice {
    /// Get the active access point object path
    #[zbus(property)]
    fn active_access_point(&self) -> zbus::Result<OwnedObjectPath>;
}

/// D-Bus proxy for access point
#[zbus::proxy(
    interface = "org.freedesktop.NetworkManager.AccessPoint",
    default_service = "org.freedesktop.NetworkManager"
)]
trait AccessPoint {
    /// Get the SSID as raw bytes
    #[zbus(property)]
    fn ssid(&self) -> zbus::Result<Vec<u8>>;

    /// Get the access point hardware address (BSSID)
    #[zbus(property)]
    fn hw_address(&self) -> zbus::Result<String>;
}

/// Source of raw association samples for one interface.
pub trait SampleSource: Send {
    /// Wait for the next notification or poll tick, then sample.
    fn next_sample(&mut self) -> impl Future<Output = Result<NetworkState>> + Send;

    /// Re-establish the underlying subscription after a failure.
    fn reconnect(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Live sample source backed by NetworkManager's D-Bus interface.
pub struct NetworkManagerSource {
    connection: Connection,
    nm: NetworkManagerProxy<'static>,
    changes: PropertyStream<'static, OwnedObjectPath>,
    interface: String,
    poll_interval: Duration,
    poll: Interval,
}

impl NetworkManagerSource {
    /// Connect to the system bus and subscribe to connection changes.
    pub async fn connect(interface: String, poll_interval: Duration) -> Result<Self> {
        let connection = Connection::system()
            .await
            .context("Failed to connect to system D-Bus")?;
        let nm = NetworkManagerProxy::builder(&connection)
            .build()
            .await
            .context("Failed to create NetworkManager proxy")?;
        let changes = nm.receive_primary_connection_changed().await;

        Ok(Self {
            connection,
            nm,
            changes,
            interface,
            poll_interval,
            poll: interval(poll_interval),
        })
    }

    /// Sample the current association state of the watched interface.
    ///
    /// Races where the access point vanishes mid-query read as disconnected;
    /// bus-level failures propagate so the caller can back off and retry.
    pub async fn sample(&self) -> Result<NetworkState> {
        let device = self
            .nm
            .get_device_by_ip_iface(&self.interface)
            .await
            .with_context(|| format!("No NetworkManager device for {}", self.interface))?;

        let wireless = WirelessDeviceProxy::builder(&self.connection)
            .path(&device)?
            .build()
            .await
            .context("Failed to create wireless device proxy")?;

        let ap_path = match wireless.active_access_point().await {
            Ok(path) => path,
            Err(_) => return Ok(NetworkState::disconnected(&self.interface)),
        };
        if ap_path.as_str() == "/" {
            return Ok(NetworkState::disconnected(&self.interface));
        }

        let ap = AccessPointProxy::builder(&self.connection)
            .path(&ap_path)?
            .build()
            .await
            .context("Failed to create access point proxy")?;

        let ssid = match ap.ssid().await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => return Ok(NetworkState::disconnected(&self.interface)),
        };
        let bssid = ap.hw_address().await.ok();

        Ok(NetworkState {
            interface: self.interface.clone(),
            ssid: Some(ssid),
            bssid,
            observed_at: Utc::now(),
        })
    }
}

impl SampleSource for NetworkManagerSource {
    async fn next_sample(&mut self) -> Result<NetworkState> {
        tokio::select! {
            change = self.changes.next() => {
                if change.is_none() {
                    anyhow::bail!("Lost NetworkManager property subscription");
                }
            }
            _ = self.poll.tick() => {}
        }
        self.sample().await
    }

    async fn reconnect(&mut self) -> Result<()> {
        *self = Self::connect(self.interface.clone(), self.poll_interval).await?;
        Ok(())
    }
}

/// Connect the live source, retrying with the observer's backoff policy.
///
/// Used at startup so a daemon racing NetworkManager's own startup does not
/// immediately die; persistent failure is an unrecoverable startup error.
pub async fn connect_with_retry(
    interface: String,
    poll_interval: Duration,
) -> Result<NetworkManagerSource> {
    let mut delay = Duration::from_secs(INITIAL_RETRY_DELAY_SECS);
    let mut attempt = 0u32;
    loop {
        match NetworkManagerSource::connect(interface.clone(), poll_interval).await {
            Ok(source) => return Ok(source),
            Err(e) => {
                attempt += 1;
                if attempt > MAX_SUBSCRIPTION_RETRIES {
                    return Err(e).context("Wireless subscription permanently unavailable");
                }
                log::warn!(
                    "Wireless subscription failed (attempt {}/{}), retrying in {}s: {:#}",
                    attempt,
                    MAX_SUBSCRIPTION_RETRIES,
                    delay.as_secs(),
                    e
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(MAX_RETRY_DELAY_SECS));
            }
        }
    }
}

/// Auto-detect the wireless interface by scanning `/sys/class/net`.
pub fn detect_wireless_interface() -> Result<String> {
    if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if entry.path().join("wireless").exists() {
                let name = name.to_string_lossy().to_string();
                log::info!("Auto-detected wireless interface: {}", name);
                return Ok(name);
            }
        }
    }
    anyhow::bail!(
        "Could not auto-detect a wireless interface. Please set monitor_interface in the settings file."
    )
}

/// Debounce state machine over raw association samples.
///
/// A candidate transition only commits once the new state has been stable
/// for the full window; flip-flops shorter than the window are absorbed.
/// The first sample ever seen seeds the committed state silently, so a
/// pre-existing association does not fire a spurious connect at startup.
pub struct Debouncer {
    window: Duration,
    committed: Option<NetworkState>,
    pending: Option<(NetworkState, Instant)>,
}

impl Debouncer {
    /// Create a debouncer with the given stability window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            committed: None,
            pending: None,
        }
    }

    /// Feed a raw sample. Returns a transition once a change has been
    /// stable for the window; `NoOp` classifications are filtered here and
    /// never reach the caller.
    pub fn observe(&mut self, sample: NetworkState, now: Instant) -> Option<Transition> {
        let committed = match &self.committed {
            Some(c) => c,
            None => {
                self.committed = Some(sample);
                return None;
            }
        };

        if committed.same_association(&sample) {
            // Bounced back to the committed state: the flap never happened
            self.pending = None;
            return None;
        }

        match &self.pending {
            Some((pending, since)) if pending.same_association(&sample) => {
                if now.duration_since(*since) >= self.window {
                    self.commit(sample)
                } else {
                    None
                }
            }
            _ => {
                // New candidate (or the candidate changed again): restart the window
                self.pending = Some((sample, now));
                None
            }
        }
    }

    /// When the pending candidate's stability window elapses, if ever.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(_, since)| *since + self.window)
    }

    /// Commit the pending candidate if its window has elapsed with no
    /// further samples arriving.
    pub fn expire(&mut self, now: Instant) -> Option<Transition> {
        let due = self.deadline()?;
        if now < due {
            return None;
        }
        let (state, _) = self.pending.take()?;
        self.commit(state)
    }

    fn commit(&mut self, state: NetworkState) -> Option<Transition> {
        self.pending = None;
        let previous = self.committed.replace(state.clone())?;
        let kind = classify(&previous, &state);
        if kind == TransitionKind::NoOp {
            return None;
        }
        Some(Transition {
            kind,
            previous,
            current: state,
        })
    }
}

/// Long-lived observer task: samples, debounces, emits transitions.
pub struct Observer<S> {
    source: S,
    debounce: Duration,
    tx: mpsc::Sender<Transition>,
    log: LogHandle,
}

impl<S: SampleSource> Observer<S> {
    /// Wire an observer to its sample source and output channel.
    pub fn new(source: S, debounce: Duration, tx: mpsc::Sender<Transition>, log: LogHandle) -> Self {
        Self {
            source,
            debounce,
            tx,
            log,
        }
    }

    /// Run until the consumer goes away (clean shutdown) or the sample
    /// source fails past the retry budget (daemon-fatal, `Err`).
    pub async fn run(mut self) -> Result<()> {
        let mut debouncer = Debouncer::new(self.debounce);
        let mut failures = 0u32;
        let mut delay = Duration::from_secs(INITIAL_RETRY_DELAY_SECS);

        loop {
            // While a candidate is pending, also wake when its window elapses
            let sampled = match debouncer.deadline() {
                Some(due) => tokio::select! {
                    sample = self.source.next_sample() => Some(sample),
                    _ = sleep_until(due) => None,
                },
                None => Some(self.source.next_sample().await),
            };

            let transition = match sampled {
                None => debouncer.expire(Instant::now()),
                Some(Ok(sample)) => {
                    failures = 0;
                    delay = Duration::from_secs(INITIAL_RETRY_DELAY_SECS);
                    debouncer.observe(sample, Instant::now())
                }
                Some(Err(e)) => {
                    failures += 1;
                    if failures > MAX_SUBSCRIPTION_RETRIES {
                        self.log
                            .warning(
                                "observer",
                                format!("wireless subscription lost permanently: {:#}", e),
                            )
                            .await;
                        return Err(e).context("Wireless subscription retry budget exhausted");
                    }
                    log::warn!(
                        "Wireless sampling failed (attempt {}/{}), retrying in {}s: {:#}",
                        failures,
                        MAX_SUBSCRIPTION_RETRIES,
                        delay.as_secs(),
                        e
                    );
                    self.log
                        .warning("observer", format!("sampling failed, retrying: {:#}", e))
                        .await;
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(MAX_RETRY_DELAY_SECS));
                    if let Err(e) = self.source.reconnect().await {
                        log::warn!("Reconnect failed: {:#}", e);
                    }
                    None
                }
            };

            if let Some(transition) = transition {
                log::info!(
                    "{}: {:?} -> {:?}",
                    transition.kind.as_str(),
                    transition.previous.ssid,
                    transition.current.ssid
                );
                if self.tx.send(transition).await.is_err() {
                    // Dispatcher gone: the daemon is shutting down
                    return Ok(());
                }
            }
        }
    }
}

/// Deterministic sample source replaying a scripted sequence, for tests.
///
/// Each entry waits its delay, then yields. Once the script is exhausted
/// the source blocks forever, like a quiet network.
pub struct ScriptedSource {
    script: std::vec::IntoIter<(Duration, Result<NetworkState>)>,
}

impl ScriptedSource {
    /// Build a source from `(delay, sample)` entries.
    pub fn new(entries: Vec<(Duration, Result<NetworkState>)>) -> Self {
        Self {
            script: entries.into_iter(),
        }
    }
}

impl SampleSource for ScriptedSource {
    async fn next_sample(&mut self) -> Result<NetworkState> {
        match self.script.next() {
            Some((delay, sample)) => {
                tokio::time::sleep(delay).await;
                sample
            }
            None => std::future::pending().await,
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        Ok(())
    }
}
