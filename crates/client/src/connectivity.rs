//! Connectivity detection and change notification.
//!
//! The monitor combines two inputs:
//! - an environment signal (the OS reporting network up/down), and
//! - an application-level probe against the backend health endpoint.
//!
//! The OS saying "offline" is trusted immediately; the OS saying "online" is
//! only believed once a probe confirms the backend is reachable. A single failed
//! probe marks the client offline, while coming back online takes
//! `recovery_probes` consecutive successes.
//!
//! Raw transitions are debounced: the settled state (what `status()` returns and
//! what handlers see) only changes after the raw state has been quiet for
//! `debounce`. A newer transition during the quiet period supersedes the older
//! one, so flapping produces at most one notification per settling interval.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

/// Connectivity state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// Online and the remote store answers.
    Online,
    /// Offline (network unreachable or backend unavailable).
    Offline,
}

impl ConnectivityState {
    pub fn is_online(self) -> bool {
        self == ConnectivityState::Online
    }

    fn from_reachable(reachable: bool) -> Self {
        if reachable {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityConfig {
    /// How often the background task probes the backend.
    pub probe_interval: Duration,
    /// A probe that takes longer than this counts as a failure.
    pub probe_timeout: Duration,
    /// Settling interval for raw transitions.
    pub debounce: Duration,
    /// Consecutive successful probes needed to go from offline to online.
    pub recovery_probes: u32,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(8),
            debounce: Duration::from_millis(1500),
            recovery_probes: 2,
        }
    }
}

/// Application-level reachability check.
#[async_trait]
pub trait Probe: Send + Sync {
    /// `true` when the backend answered successfully.
    async fn probe(&self) -> bool;
}

/// Probes by issuing `GET {api_url}/health`.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    /// Fails only when the HTTP client cannot be built (TLS backend setup).
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::debug!(url = %self.url, status = %resp.status(), "health probe rejected");
                false
            }
            Err(err) => {
                tracing::debug!(url = %self.url, error = %err, "health probe failed");
                false
            }
        }
    }
}

/// Probe with a fixed, settable answer (no backend involved).
#[derive(Debug)]
pub struct StaticProbe {
    reachable: AtomicBool,
}

impl StaticProbe {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
        }
    }

    pub fn set(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Probe for StaticProbe {
    async fn probe(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Identifier returned by [`ConnectivityMonitor::on_change`].
pub type HandlerId = u64;

type Handler = Arc<dyn Fn(ConnectivityState) + Send + Sync>;

#[derive(Debug)]
struct Detection {
    os_online: bool,
    consecutive_successes: u32,
}

/// Process-wide connectivity state, shared as `Arc<ConnectivityMonitor>`.
pub struct ConnectivityMonitor {
    probe: Arc<dyn Probe>,
    config: ConnectivityConfig,
    detection: Mutex<Detection>,
    /// Latest undebounced state.
    raw: watch::Sender<ConnectivityState>,
    /// Debounced state reported to callers.
    settled: watch::Sender<ConnectivityState>,
    handlers: Mutex<Vec<(HandlerId, Handler)>>,
    next_handler: AtomicU64,
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("state", &self.status())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConnectivityMonitor {
    /// Run the startup probe, then spawn the debounce and periodic-probe tasks.
    ///
    /// The background tasks only hold a weak reference and stop once the last
    /// `Arc` to the monitor is dropped.
    pub async fn start(probe: Arc<dyn Probe>, config: ConnectivityConfig) -> Arc<Self> {
        let reachable = run_probe(probe.as_ref(), config.probe_timeout).await;
        let initial = ConnectivityState::from_reachable(reachable);
        tracing::info!(state = ?initial, "connectivity initialized from startup probe");

        let (raw, _) = watch::channel(initial);
        let (settled, _) = watch::channel(initial);
        let monitor = Arc::new(Self {
            probe,
            detection: Mutex::new(Detection {
                os_online: true,
                consecutive_successes: if reachable { config.recovery_probes } else { 0 },
            }),
            config,
            raw,
            settled,
            handlers: Mutex::new(Vec::new()),
            next_handler: AtomicU64::new(1),
        });

        monitor.spawn_settler();
        monitor.spawn_prober();
        monitor
    }

    /// Current settled state.
    pub fn status(&self) -> ConnectivityState {
        *self.settled.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status().is_online()
    }

    /// Receiver of the settled state; wakes on every settled transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.settled.subscribe()
    }

    /// Register a callback invoked on every settled transition.
    pub fn on_change<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(ConnectivityState) + Send + Sync + 'static,
    {
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        lock(&self.handlers).push((id, Arc::new(handler)));
        id
    }

    /// Unregister a callback. Returns `false` if it was not registered.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = lock(&self.handlers);
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }

    /// Feed the OS-reported network state.
    ///
    /// "Down" is trusted immediately; "up" triggers a confirming probe.
    pub async fn report_signal(&self, os_online: bool) -> ConnectivityState {
        {
            let mut detection = lock(&self.detection);
            detection.os_online = os_online;
            if !os_online {
                detection.consecutive_successes = 0;
            }
        }

        if os_online {
            self.check_now().await
        } else {
            tracing::debug!("OS reports network down");
            self.propose(ConnectivityState::Offline);
            ConnectivityState::Offline
        }
    }

    /// Probe now and feed the result into the detector. Returns the raw state.
    pub async fn check_now(&self) -> ConnectivityState {
        let reachable = run_probe(self.probe.as_ref(), self.config.probe_timeout).await;
        self.record_probe(reachable)
    }

    /// Mark the client as offline right away (no debounce).
    ///
    /// Later probes keep updating the state as usual.
    pub fn set_offline(&self) {
        lock(&self.detection).consecutive_successes = 0;
        self.force(ConnectivityState::Offline);
    }

    /// Mark the client as online right away (no debounce).
    pub fn set_online(&self) {
        {
            let mut detection = lock(&self.detection);
            detection.os_online = true;
            detection.consecutive_successes = self.config.recovery_probes;
        }
        self.force(ConnectivityState::Online);
    }

    fn force(&self, state: ConnectivityState) {
        self.raw.send_replace(state);
        self.publish(state);
    }

    fn record_probe(&self, reachable: bool) -> ConnectivityState {
        let proposal = {
            let mut detection = lock(&self.detection);
            if !reachable {
                detection.consecutive_successes = 0;
                Some(ConnectivityState::Offline)
            } else {
                detection.consecutive_successes = detection.consecutive_successes.saturating_add(1);
                let currently_online = self.raw.borrow().is_online();
                if !detection.os_online {
                    // A probe alone does not override the OS saying the link is down.
                    None
                } else if currently_online
                    || detection.consecutive_successes >= self.config.recovery_probes
                {
                    Some(ConnectivityState::Online)
                } else {
                    tracing::debug!(
                        successes = detection.consecutive_successes,
                        needed = self.config.recovery_probes,
                        "probe succeeded while offline; waiting for more successes"
                    );
                    None
                }
            }
        };

        if let Some(state) = proposal {
            self.propose(state);
        }
        *self.raw.borrow()
    }

    fn propose(&self, state: ConnectivityState) {
        let changed = self.raw.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::debug!(state = ?state, "raw connectivity transition");
        }
    }

    fn publish(&self, state: ConnectivityState) {
        let changed = self.settled.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if !changed {
            return;
        }

        match state {
            ConnectivityState::Online => tracing::info!("connectivity: online"),
            ConnectivityState::Offline => tracing::warn!("connectivity: offline"),
        }

        let handlers: Vec<Handler> = lock(&self.handlers)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(state);
        }
    }

    fn spawn_settler(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut raw_rx = self.raw.subscribe();
        let debounce = self.config.debounce;

        tokio::spawn(async move {
            loop {
                if raw_rx.changed().await.is_err() {
                    return;
                }
                // Wait for a quiet period; a newer transition restarts it.
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(debounce) => break,
                        changed = raw_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
                let state = *raw_rx.borrow_and_update();
                match weak.upgrade() {
                    Some(monitor) => monitor.publish(state),
                    None => return,
                }
            }
        });
    }

    fn spawn_prober(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.config.probe_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else {
                    return;
                };
                monitor.check_now().await;
            }
        });
    }
}

async fn run_probe(probe: &dyn Probe, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, probe.probe())
        .await
        .unwrap_or(false)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(debounce_ms: u64, recovery_probes: u32) -> ConnectivityConfig {
        ConnectivityConfig {
            probe_interval: Duration::from_secs(3600),
            probe_timeout: Duration::from_secs(1),
            debounce: Duration::from_millis(debounce_ms),
            recovery_probes,
        }
    }

    fn recorder(monitor: &ConnectivityMonitor) -> Arc<Mutex<Vec<ConnectivityState>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        monitor.on_change(move |state| sink.lock().unwrap().push(state));
        seen
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test]
    async fn http_probe_gives_up_after_its_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accepts connections and never answers.
        tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                open.push(socket);
            }
        });

        let probe = HttpProbe::new(format!("http://{addr}/health"), Duration::from_millis(200)).unwrap();
        let reachable = tokio::time::timeout(Duration::from_secs(5), probe.probe())
            .await
            .expect("probe should time out on its own");
        assert!(!reachable);
    }

    #[tokio::test(start_paused = true)]
    async fn startup_probe_sets_initial_state() {
        let online = ConnectivityMonitor::start(Arc::new(StaticProbe::new(true)), config(100, 2)).await;
        assert!(online.is_online());

        let offline = ConnectivityMonitor::start(Arc::new(StaticProbe::new(false)), config(100, 2)).await;
        assert_eq!(offline.status(), ConnectivityState::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_produces_one_notification() {
        let probe = Arc::new(StaticProbe::new(true));
        let monitor = ConnectivityMonitor::start(probe.clone(), config(500, 1)).await;
        let seen = recorder(&monitor);

        probe.set(false);
        monitor.check_now().await;
        settle(100).await;
        probe.set(true);
        monitor.check_now().await;
        settle(100).await;
        probe.set(false);
        monitor.check_now().await;

        // Still inside the settling interval: nothing reported yet.
        settle(100).await;
        assert!(monitor.is_online());
        assert!(seen.lock().unwrap().is_empty());

        settle(600).await;
        assert_eq!(monitor.status(), ConnectivityState::Offline);
        assert_eq!(*seen.lock().unwrap(), vec![ConnectivityState::Offline]);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_transition_is_discarded() {
        let probe = Arc::new(StaticProbe::new(true));
        let monitor = ConnectivityMonitor::start(probe.clone(), config(500, 1)).await;
        let seen = recorder(&monitor);

        probe.set(false);
        monitor.check_now().await;
        settle(100).await;
        probe.set(true);
        monitor.check_now().await;

        settle(1000).await;
        assert!(monitor.is_online());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_needs_consecutive_successes() {
        let probe = Arc::new(StaticProbe::new(true));
        let monitor = ConnectivityMonitor::start(probe.clone(), config(10, 2)).await;
        let seen = recorder(&monitor);

        probe.set(false);
        monitor.check_now().await;
        settle(50).await;
        assert_eq!(monitor.status(), ConnectivityState::Offline);

        probe.set(true);
        monitor.check_now().await;
        settle(50).await;
        assert_eq!(monitor.status(), ConnectivityState::Offline);

        monitor.check_now().await;
        settle(50).await;
        assert!(monitor.is_online());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnectivityState::Offline, ConnectivityState::Online]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn os_signal_down_wins_over_probe() {
        let probe = Arc::new(StaticProbe::new(true));
        let monitor = ConnectivityMonitor::start(probe.clone(), config(10, 1)).await;

        assert_eq!(monitor.report_signal(false).await, ConnectivityState::Offline);
        assert_eq!(monitor.check_now().await, ConnectivityState::Offline);
        settle(50).await;
        assert_eq!(monitor.status(), ConnectivityState::Offline);

        assert_eq!(monitor.report_signal(true).await, ConnectivityState::Online);
        settle(50).await;
        assert!(monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn os_signal_up_requires_probe_confirmation() {
        let probe = Arc::new(StaticProbe::new(false));
        let monitor = ConnectivityMonitor::start(probe.clone(), config(10, 1)).await;

        assert_eq!(monitor.report_signal(true).await, ConnectivityState::Offline);
        settle(50).await;
        assert_eq!(monitor.status(), ConnectivityState::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_override_is_immediate_and_removed_handlers_are_silent() {
        let probe = Arc::new(StaticProbe::new(true));
        let monitor = ConnectivityMonitor::start(probe, config(10_000, 2)).await;
        let seen = recorder(&monitor);
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let id = monitor.on_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(monitor.remove_handler(id));
        assert!(!monitor.remove_handler(id));

        monitor.set_offline();
        assert_eq!(monitor.status(), ConnectivityState::Offline);
        monitor.set_online();
        assert!(monitor.is_online());

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnectivityState::Offline, ConnectivityState::Online]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_see_settled_state() {
        let probe = Arc::new(StaticProbe::new(true));
        let monitor = ConnectivityMonitor::start(probe.clone(), config(10, 1)).await;
        let mut rx = monitor.subscribe();

        probe.set(false);
        monitor.check_now().await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectivityState::Offline);
    }
}
