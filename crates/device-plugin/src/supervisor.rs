//! Serve-cycle supervision.
//!
//! [`DeviceManager::serve`] drives `Init → Discovering → Binding → Serving →
//! Restarting → …` until [`DeviceManager::stop`] moves it to `Stopped`. While
//! serving, a single event loop watches the stop token, the plugin socket
//! (the kubelet deletes it to force re-registration), the device root (new
//! accelerators require a fresh cycle) and the health update channel.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use error_stack::Report;
use tokio::fs;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::time::interval_at;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::discovery::DiscoveryScanner;
use crate::discovery::RetryPolicy;
use crate::error::PluginError;
use crate::error::PluginResult;
use crate::inventory::DeviceInventory;
use crate::plugin_service::register_with_kubelet;
use crate::plugin_service::ServeCycle;
use crate::types::DeviceNamePattern;
use crate::types::Health;
use crate::types::MountSpec;

/// Resource name the accelerators are advertised under.
pub const DEFAULT_RESOURCE_NAME: &str = "eicas.com/tpu";

/// Prefix of the plugin socket file name.
pub const DEFAULT_ENDPOINT_PREFIX: &str = "eicasTPU";

const HEALTH_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// directory holding the kubelet socket and the plugin sockets
    pub plugin_dir: PathBuf,
    /// file name of the kubelet registration socket
    pub kubelet_endpoint: String,
    pub endpoint_prefix: String,
    pub resource_name: String,
    pub socket_check_interval: Duration,
    pub device_check_interval: Duration,
    pub readiness_poll_interval: Duration,
    pub discovery_retry: RetryPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from(api_types::DEVICE_PLUGIN_PATH),
            kubelet_endpoint: api_types::KUBELET_SOCKET.to_string(),
            endpoint_prefix: DEFAULT_ENDPOINT_PREFIX.to_string(),
            resource_name: DEFAULT_RESOURCE_NAME.to_string(),
            socket_check_interval: Duration::from_secs(1),
            device_check_interval: Duration::from_secs(10),
            readiness_poll_interval: Duration::from_secs(1),
            discovery_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Init,
    Discovering,
    Binding,
    Serving,
    Restarting,
    Stopped,
}

/// Health change reported by an external probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthUpdate {
    pub id: String,
    pub health: Health,
}

/// Why the supervisory loop left a serve cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleExit {
    Stopped,
    SocketGone,
    DriftDetected,
}

/// Owns the device inventory and the serve cycles advertising it.
#[derive(Debug)]
pub struct DeviceManager {
    config: SupervisorConfig,
    scanner: DiscoveryScanner,
    inventory: Arc<DeviceInventory>,
    mounts: Arc<[MountSpec]>,
    stop: CancellationToken,
    state: watch::Sender<SupervisorState>,
    endpoint: watch::Sender<Option<PathBuf>>,
    health_tx: mpsc::Sender<HealthUpdate>,
    health_rx: Mutex<mpsc::Receiver<HealthUpdate>>,
    cycles: AtomicU64,
}

impl DeviceManager {
    pub fn new(
        config: SupervisorConfig,
        dev_directory: impl Into<PathBuf>,
        pattern: DeviceNamePattern,
        mounts: Vec<MountSpec>,
    ) -> Arc<Self> {
        let dev_directory = dev_directory.into();
        let (state, _) = watch::channel(SupervisorState::Init);
        let (endpoint, _) = watch::channel(None);
        let (health_tx, health_rx) = mpsc::channel(HEALTH_CHANNEL_CAPACITY);

        Arc::new(Self {
            config,
            scanner: DiscoveryScanner::new(&dev_directory, pattern.clone()),
            inventory: Arc::new(DeviceInventory::new(dev_directory, pattern)),
            mounts: Arc::from(mounts),
            stop: CancellationToken::new(),
            state,
            endpoint,
            health_tx,
            health_rx: Mutex::new(health_rx),
            cycles: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Socket of the current (or last) serve cycle.
    pub fn endpoint(&self) -> Option<PathBuf> {
        self.endpoint.borrow().clone()
    }

    pub fn inventory(&self) -> &Arc<DeviceInventory> {
        &self.inventory
    }

    /// Channel for external health probes; updates are applied by the
    /// supervisory loop.
    pub fn health_sender(&self) -> mpsc::Sender<HealthUpdate> {
        self.health_tx.clone()
    }

    /// Runs serve cycles until [`Self::stop`] is called.
    ///
    /// Socket loss and newly installed devices restart the cycle. Returns an
    /// error only for fatal conditions: bind or registration failures and an
    /// exhausted discovery retry budget.
    pub async fn serve(&self) -> PluginResult<()> {
        self.set_state(SupervisorState::Discovering);
        let result = self.run_cycles().await;
        if let Err(report) = &result {
            error!("device plugin manager failed: {report:?}");
        }
        self.set_state(SupervisorState::Stopped);
        result
    }

    async fn run_cycles(&self) -> PluginResult<()> {
        let mut health_updates = self.health_rx.lock().await;

        let kubelet_socket = self.config.plugin_dir.join(&self.config.kubelet_endpoint);
        let register = fs::try_exists(&kubelet_socket).await.unwrap_or(false);
        if register {
            info!(
                "kubelet socket {} found, registering every serve cycle",
                kubelet_socket.display()
            );
        } else {
            info!(
                "no kubelet socket at {}, serving without registration",
                kubelet_socket.display()
            );
        }

        if self.discover().await?.is_none() {
            return Ok(());
        }

        loop {
            if self.stop.is_cancelled() {
                return Ok(());
            }

            self.set_state(SupervisorState::Binding);
            let cycle = ServeCycle::start(
                self.next_endpoint(),
                self.inventory.clone(),
                self.mounts.clone(),
            )?;
            self.endpoint
                .send_replace(Some(cycle.endpoint().to_path_buf()));

            if register {
                // a kubelet that accepts but never answers must not block stop()
                let registered = select! {
                    _ = self.stop.cancelled() => None,
                    result = self.register(&cycle, &kubelet_socket) => Some(result),
                };
                match registered {
                    Some(Ok(())) => {}
                    Some(Err(report)) => {
                        self.teardown(cycle).await;
                        return Err(report);
                    }
                    None => {
                        info!("stopped before registration completed");
                        self.teardown(cycle).await;
                        return Ok(());
                    }
                }
            }

            self.set_state(SupervisorState::Serving);
            let exit = self
                .supervise(cycle.endpoint(), &mut health_updates)
                .await;
            self.teardown(cycle).await;

            match exit {
                CycleExit::Stopped => return Ok(()),
                CycleExit::SocketGone => info!("plugin socket removed, restarting serve cycle"),
                CycleExit::DriftDetected => info!("device set changed, restarting serve cycle"),
            }

            self.set_state(SupervisorState::Restarting);
            if self.discover().await?.is_none() {
                return Ok(());
            }
        }
    }

    async fn discover(&self) -> PluginResult<Option<usize>> {
        self.scanner
            .discover_with_retry(&self.inventory, &self.config.discovery_retry, &self.stop)
            .await
    }

    async fn register(&self, cycle: &ServeCycle, kubelet_socket: &Path) -> PluginResult<()> {
        cycle
            .wait_until_serving(self.config.readiness_poll_interval)
            .await?;
        info!("device-plugin server started serving");

        register_with_kubelet(
            kubelet_socket,
            &cycle.endpoint_name(),
            &self.config.resource_name,
        )
        .await?;
        info!("device-plugin registered with the kubelet");
        Ok(())
    }

    async fn supervise(
        &self,
        endpoint: &Path,
        health_updates: &mut mpsc::Receiver<HealthUpdate>,
    ) -> CycleExit {
        let mut socket_check = ticker(self.config.socket_check_interval);
        let mut device_check = ticker(self.config.device_check_interval);

        loop {
            select! {
                _ = self.stop.cancelled() => return CycleExit::Stopped,
                _ = socket_check.tick() => {
                    if let Err(e) = fs::symlink_metadata(endpoint).await {
                        info!("stopping device-plugin server at: {}", endpoint.display());
                        warn!("plugin socket check failed: {e}");
                        return CycleExit::SocketGone;
                    }
                }
                _ = device_check.tick() => {
                    if self.has_additional_devices().await {
                        return CycleExit::DriftDetected;
                    }
                }
                Some(update) = health_updates.recv() => {
                    if !self.inventory.set_health(&update.id, update.health).await {
                        info!(id = %update.id, health = %update.health, "health update did not change inventory");
                    }
                }
            }
        }
    }

    /// True when more devices are present than registered. Otherwise brings
    /// the health of registered devices in line with the entries present.
    async fn has_additional_devices(&self) -> bool {
        let found = match self.scanner.scan().await {
            Ok(found) => found,
            Err(report) => {
                error!("device check failed: {report:?}");
                return false;
            }
        };

        let registered = self.inventory.len().await;
        let present = found.len();
        if present > registered {
            info!(
                "Found {present} TPUs, while only {registered} are registered. Stopping device-plugin server."
            );
            return true;
        }

        self.inventory.refresh_health(&found).await;
        false
    }

    async fn teardown(&self, cycle: ServeCycle) {
        let endpoint = cycle.endpoint().to_path_buf();
        cycle.shutdown().await;
        if let Err(report) = remove_socket(&endpoint).await {
            warn!("{report:?}");
        }
    }

    fn next_endpoint(&self) -> PathBuf {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        self.config
            .plugin_dir
            .join(format!("{}-{millis}-{cycle}.sock", self.config.endpoint_prefix))
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = ?previous, to = ?state, "device plugin state changed");
        }
    }

    /// Removes the plugin socket, ends the serve loop and waits for its server
    /// to finish, then closes the health update channel. Safe to call more
    /// than once and before [`Self::serve`] has started.
    pub async fn stop(&self) -> PluginResult<()> {
        let endpoint = self.endpoint();
        if let Some(endpoint) = endpoint {
            info!("removing device plugin socket {}", endpoint.display());
            remove_socket(&endpoint).await?;
        }

        self.stop.cancel();

        let mut state = self.state.subscribe();
        // Init means serve() never ran; it will observe the cancelled token.
        let _ = state
            .wait_for(|state| matches!(state, SupervisorState::Init | SupervisorState::Stopped))
            .await;

        self.health_rx.lock().await.close();
        Ok(())
    }
}

/// Smallest period accepted for the supervisory timers.
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

fn ticker(period: Duration) -> tokio::time::Interval {
    // tokio panics on a zero period
    let period = period.max(MIN_CHECK_INTERVAL);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn remove_socket(path: &Path) -> PluginResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Report::new(e).change_context(PluginError::SocketCleanup {
            path: path.display().to_string(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::types::DEFAULT_DEVICE_PATTERN;

    fn manager(plugin_dir: &Path, dev_dir: &Path) -> Arc<DeviceManager> {
        let config = SupervisorConfig {
            plugin_dir: plugin_dir.to_path_buf(),
            socket_check_interval: Duration::from_millis(20),
            device_check_interval: Duration::from_millis(50),
            readiness_poll_interval: Duration::from_millis(20),
            discovery_retry: RetryPolicy {
                interval: Duration::from_millis(20),
                max_attempts: None,
            },
            ..SupervisorConfig::default()
        };
        let pattern = DeviceNamePattern::new(DEFAULT_DEVICE_PATTERN).expect("valid pattern");
        DeviceManager::new(config, dev_dir, pattern, Vec::new())
    }

    #[test(tokio::test)]
    async fn stop_before_serve_returns_immediately() {
        let plugin_dir = tempfile::tempdir().expect("plugin dir");
        let dev_dir = tempfile::tempdir().expect("dev dir");
        let manager = manager(plugin_dir.path(), dev_dir.path());

        tokio::time::timeout(Duration::from_secs(1), manager.stop())
            .await
            .expect("stop does not block")
            .expect("stop succeeds");
        manager.stop().await.expect("second stop is a no-op");

        // a later serve() sees the cancelled token and binds nothing
        manager.serve().await.expect("serve exits cleanly");
        assert_eq!(manager.state(), SupervisorState::Stopped);
        assert_eq!(manager.endpoint(), None);
    }

    #[test(tokio::test)]
    async fn stop_while_waiting_for_device_root() {
        let plugin_dir = tempfile::tempdir().expect("plugin dir");
        let dev_dir = tempfile::tempdir().expect("dev dir");
        let manager = manager(plugin_dir.path(), &dev_dir.path().join("missing"));

        let serving = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.serve().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.state(), SupervisorState::Discovering);

        manager.stop().await.expect("stop");
        serving
            .await
            .expect("serve task")
            .expect("serve exits cleanly");
        assert_eq!(manager.state(), SupervisorState::Stopped);
    }

    #[test(tokio::test)]
    async fn health_updates_reach_the_inventory() {
        let plugin_dir = tempfile::tempdir().expect("plugin dir");
        let dev_dir = tempfile::tempdir().expect("dev dir");
        std::fs::create_dir(dev_dir.path().join("card0")).expect("card0");
        let manager = manager(plugin_dir.path(), dev_dir.path());

        let serving = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.serve().await })
        };

        let mut revisions = manager.inventory().subscribe();
        manager
            .health_sender()
            .send(HealthUpdate {
                id: "card0".to_string(),
                health: Health::Unhealthy,
            })
            .await
            .expect("send health update");

        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.inventory().healthy_count().await != 0
                || manager.inventory().is_empty().await
            {
                revisions.changed().await.expect("inventory alive");
            }
        })
        .await
        .expect("update applied");

        manager.stop().await.expect("stop");
        serving.await.expect("serve task").expect("serve");
        assert!(manager.health_sender().is_closed());
    }

    #[test(tokio::test)]
    async fn zero_check_intervals_do_not_panic() {
        let plugin_dir = tempfile::tempdir().expect("plugin dir");
        let dev_dir = tempfile::tempdir().expect("dev dir");
        std::fs::create_dir(dev_dir.path().join("card0")).expect("card0");
        let config = SupervisorConfig {
            plugin_dir: plugin_dir.path().to_path_buf(),
            socket_check_interval: Duration::ZERO,
            device_check_interval: Duration::ZERO,
            ..SupervisorConfig::default()
        };
        let pattern = DeviceNamePattern::new(DEFAULT_DEVICE_PATTERN).expect("valid pattern");
        let manager = DeviceManager::new(config, dev_dir.path(), pattern, Vec::new());

        let serving = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.serve().await })
        };
        let mut state = manager.state.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|state| *state == SupervisorState::Serving),
        )
        .await
        .expect("reaches serving")
        .expect("state channel alive");
        tokio::time::sleep(Duration::from_millis(50)).await;

        manager.stop().await.expect("stop");
        serving
            .await
            .expect("serve task does not panic")
            .expect("serve exits cleanly");
    }

    #[test(tokio::test)]
    async fn endpoints_are_unique_per_cycle() {
        let plugin_dir = tempfile::tempdir().expect("plugin dir");
        let dev_dir = tempfile::tempdir().expect("dev dir");
        let manager = manager(plugin_dir.path(), dev_dir.path());

        let first = manager.next_endpoint();
        let second = manager.next_endpoint();
        assert!(first != second);
        assert!(first.starts_with(plugin_dir.path()));
        let name = first
            .file_name()
            .and_then(|name| name.to_str())
            .expect("file name");
        assert!(name.starts_with("eicasTPU-"));
        assert!(name.ends_with("-1.sock"));
    }
}
