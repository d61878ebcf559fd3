use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use error_stack::ResultExt;
use tokio::fs;
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::error::PluginError;
use crate::error::PluginResult;
use crate::inventory::DeviceInventory;
use crate::types::DeviceNamePattern;
use crate::types::Health;

/// How often, and how many times, discovery is retried while the device root
/// is unavailable. `max_attempts: None` retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

/// Walks the device root and reports the directory entries matching the
/// device name pattern.
#[derive(Debug, Clone)]
pub struct DiscoveryScanner {
    root: PathBuf,
    pattern: DeviceNamePattern,
}

impl DiscoveryScanner {
    pub fn new(root: impl Into<PathBuf>, pattern: DeviceNamePattern) -> Self {
        Self {
            root: root.into(),
            pattern,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of all matching device directories, sorted.
    pub async fn scan(&self) -> PluginResult<BTreeSet<String>> {
        let discovery_error = || PluginError::Discovery {
            path: self.root.display().to_string(),
        };

        let mut entries = fs::read_dir(&self.root)
            .await
            .change_context_lazy(discovery_error)?;

        let mut found = BTreeSet::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .change_context_lazy(discovery_error)?
        {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if self.pattern.matches(&name) {
                found.insert(name);
            }
        }
        Ok(found)
    }

    /// Marks every matching device healthy. Entries already in the inventory
    /// but not found again are left untouched.
    pub async fn discover(&self, inventory: &DeviceInventory) -> PluginResult<usize> {
        let found = self.scan().await?;
        for id in &found {
            debug!(id = %id, "found Eicas TPU");
            inventory.set_health(id, Health::Healthy).await;
        }
        Ok(found.len())
    }

    /// Number of matching devices, without touching the inventory.
    pub async fn count(&self) -> PluginResult<usize> {
        Ok(self.scan().await?.len())
    }

    /// Runs [`Self::discover`] until it succeeds, the retry budget runs out or
    /// `stop` is cancelled (`Ok(None)`).
    pub async fn discover_with_retry(
        &self,
        inventory: &DeviceInventory,
        policy: &RetryPolicy,
        stop: &CancellationToken,
    ) -> PluginResult<Option<usize>> {
        let mut attempts = 0u32;
        loop {
            if stop.is_cancelled() {
                return Ok(None);
            }

            attempts += 1;
            match self.discover(inventory).await {
                Ok(found) => {
                    info!(found, root = %self.root.display(), "device discovery completed");
                    return Ok(Some(found));
                }
                Err(report) => {
                    if policy.max_attempts.is_some_and(|max| attempts >= max) {
                        return Err(
                            report.change_context(PluginError::DiscoveryExhausted { attempts })
                        );
                    }
                    // Missing device roots are normal while the driver loads.
                    if attempts == 1 {
                        info!(
                            "device discovery failed, retrying every {:?}: {report:?}",
                            policy.interval
                        );
                    } else {
                        debug!(attempts, "device discovery failed: {report:?}");
                    }
                }
            }

            select! {
                _ = stop.cancelled() => return Ok(None),
                _ = sleep(policy.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::types::DEFAULT_DEVICE_PATTERN;

    fn pattern() -> DeviceNamePattern {
        DeviceNamePattern::new(DEFAULT_DEVICE_PATTERN).expect("valid pattern")
    }

    fn device_root(dirs: &[&str], files: &[&str]) -> tempfile::TempDir {
        let root = tempfile::tempdir().expect("create temp dir");
        for dir in dirs {
            std::fs::create_dir(root.path().join(dir)).expect("create device dir");
        }
        for file in files {
            std::fs::write(root.path().join(file), b"").expect("create file");
        }
        root
    }

    #[test(tokio::test)]
    async fn discover_adds_only_matching_directories() {
        let root = device_root(&["card0", "card1", "renderD128"], &["card2", "version"]);
        let scanner = DiscoveryScanner::new(root.path(), pattern());
        let inventory = DeviceInventory::new(root.path(), pattern());

        let found = scanner.discover(&inventory).await.expect("discover");

        assert_eq!(found, 2);
        let ids: Vec<String> = inventory
            .devices()
            .await
            .into_iter()
            .map(|device| device.id)
            .collect();
        assert_eq!(ids, vec!["card0".to_string(), "card1".to_string()]);
    }

    #[test(tokio::test)]
    async fn repeated_discovery_never_duplicates_entries() {
        let root = device_root(&["card0", "card1"], &[]);
        let scanner = DiscoveryScanner::new(root.path(), pattern());
        let inventory = DeviceInventory::new(root.path(), pattern());

        for _ in 0..3 {
            scanner.discover(&inventory).await.expect("discover");
        }
        assert_eq!(inventory.len().await, 2);
    }

    #[test(tokio::test)]
    async fn discovery_is_additive() {
        let root = device_root(&["card0", "card1"], &[]);
        let scanner = DiscoveryScanner::new(root.path(), pattern());
        let inventory = DeviceInventory::new(root.path(), pattern());
        scanner.discover(&inventory).await.expect("discover");

        std::fs::remove_dir(root.path().join("card1")).expect("remove card1");
        scanner.discover(&inventory).await.expect("discover again");

        assert_eq!(inventory.len().await, 2);
        assert_eq!(inventory.healthy_count().await, 2);
    }

    #[test(tokio::test)]
    async fn count_does_not_mutate_inventory() {
        let root = device_root(&["card0", "card1", "card2"], &[]);
        let scanner = DiscoveryScanner::new(root.path(), pattern());

        assert_eq!(scanner.count().await.expect("count"), 3);
    }

    #[test(tokio::test)]
    async fn missing_root_is_a_discovery_error() {
        let root = tempfile::tempdir().expect("create temp dir");
        let missing = root.path().join("not-mounted");
        let scanner = DiscoveryScanner::new(&missing, pattern());
        let inventory = DeviceInventory::new(&missing, pattern());

        let report = scanner
            .discover(&inventory)
            .await
            .expect_err("missing root must fail");
        assert_eq!(
            report.current_context(),
            &PluginError::Discovery {
                path: missing.display().to_string()
            }
        );
        assert!(inventory.is_empty().await);
    }

    #[test(tokio::test)]
    async fn retry_gives_up_after_max_attempts() {
        let root = tempfile::tempdir().expect("create temp dir");
        let missing = root.path().join("not-mounted");
        let scanner = DiscoveryScanner::new(&missing, pattern());
        let inventory = DeviceInventory::new(&missing, pattern());
        let policy = RetryPolicy {
            interval: Duration::from_millis(5),
            max_attempts: Some(3),
        };

        let report = scanner
            .discover_with_retry(&inventory, &policy, &CancellationToken::new())
            .await
            .expect_err("retry budget exhausted");
        assert_eq!(
            report.current_context(),
            &PluginError::DiscoveryExhausted { attempts: 3 }
        );
    }

    #[test(tokio::test)]
    async fn retry_succeeds_once_the_root_appears() {
        let root = tempfile::tempdir().expect("create temp dir");
        let devices = root.path().join("bmsophon");
        let scanner = DiscoveryScanner::new(&devices, pattern());
        let inventory = DeviceInventory::new(&devices, pattern());
        let policy = RetryPolicy {
            interval: Duration::from_millis(20),
            max_attempts: None,
        };

        // Populate a staging directory and rename it so the root appears atomically.
        let staging = root.path().join("staging");
        std::fs::create_dir_all(staging.join("card0")).expect("create card0");
        let mount = {
            let devices = devices.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(60)).await;
                std::fs::rename(staging, devices).expect("mount device root");
            })
        };

        let found = scanner
            .discover_with_retry(&inventory, &policy, &CancellationToken::new())
            .await
            .expect("discovery eventually succeeds");
        mount.await.expect("mount task");

        assert_eq!(found, Some(1));
    }

    #[test(tokio::test)]
    async fn retry_returns_none_when_stopped() {
        let root = tempfile::tempdir().expect("create temp dir");
        let missing = root.path().join("not-mounted");
        let scanner = DiscoveryScanner::new(&missing, pattern());
        let inventory = DeviceInventory::new(&missing, pattern());
        let stop = CancellationToken::new();
        stop.cancel();

        let found = scanner
            .discover_with_retry(&inventory, &RetryPolicy::default(), &stop)
            .await
            .expect("stop is not an error");
        assert_eq!(found, None);
    }
}
