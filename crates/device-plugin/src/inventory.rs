//! Device inventory shared between the supervisor and the gRPC handlers.
//!
//! The supervisor (through discovery and health updates) is the only writer;
//! gRPC handlers only read. Every membership or health change bumps a revision
//! published on a [`watch`] channel so `ListAndWatch` streams can re-send the
//! device list.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use tokio::sync::watch;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::PluginError;
use crate::error::PluginResult;
use crate::types::Device;
use crate::types::DeviceNamePattern;
use crate::types::DeviceSpec;
use crate::types::Health;
use crate::types::DEVICE_PERMISSIONS;

#[derive(Debug, Default)]
struct DeviceTable {
    devices: BTreeMap<String, Device>,
    /// healthy devices taken out of service because their entry disappeared
    vanished: BTreeSet<String>,
}

#[derive(Debug)]
pub struct DeviceInventory {
    root: PathBuf,
    pattern: DeviceNamePattern,
    table: RwLock<DeviceTable>,
    revision: watch::Sender<u64>,
}

impl DeviceInventory {
    pub fn new(root: impl Into<PathBuf>, pattern: DeviceNamePattern) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            root: root.into(),
            pattern,
            table: RwLock::new(DeviceTable::default()),
            revision,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sets the health of `id`, inserting it when unknown.
    ///
    /// Names that fail the device pattern are ignored. Returns whether the
    /// inventory changed.
    pub async fn set_health(&self, id: &str, health: Health) -> bool {
        if !self.pattern.matches(id) {
            debug!(id, "ignoring health update for a non-device name");
            return false;
        }

        let changed = {
            let mut table = self.table.write().await;
            // an explicit update overrides the vanished bookkeeping
            table.vanished.remove(id);
            match table.devices.get_mut(id) {
                Some(device) if device.health == health => false,
                Some(device) => {
                    device.health = health;
                    true
                }
                None => {
                    table.devices.insert(
                        id.to_string(),
                        Device {
                            id: id.to_string(),
                            health,
                        },
                    );
                    true
                }
            }
        };

        if changed {
            debug!(id, %health, "device health changed");
            self.revision.send_modify(|revision| *revision += 1);
        }
        changed
    }

    /// Syncs health with the entries currently present under the root.
    ///
    /// Healthy devices missing from `present` become unhealthy; devices taken
    /// out that way are healthy again once their entry is back. Health set
    /// through [`Self::set_health`] is left alone. Returns the number of
    /// devices that changed state.
    pub async fn refresh_health(&self, present: &BTreeSet<String>) -> usize {
        let mut changed = 0;
        {
            let mut guard = self.table.write().await;
            let table = &mut *guard;
            for device in table.devices.values_mut() {
                let is_present = present.contains(&device.id);
                if !is_present && device.health == Health::Healthy {
                    warn!(id = %device.id, "device entry disappeared, marking unhealthy");
                    device.health = Health::Unhealthy;
                    table.vanished.insert(device.id.clone());
                    changed += 1;
                } else if is_present && table.vanished.remove(&device.id) {
                    info!(id = %device.id, "device entry is back, marking healthy");
                    device.health = Health::Healthy;
                    changed += 1;
                }
            }
        }

        if changed > 0 {
            self.revision.send_modify(|revision| *revision += 1);
        }
        changed
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.devices.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.devices.is_empty()
    }

    /// Snapshot of all devices, ordered by id.
    pub async fn devices(&self) -> Vec<Device> {
        self.table.read().await.devices.values().cloned().collect()
    }

    pub async fn healthy_count(&self) -> usize {
        self.table
            .read()
            .await
            .devices
            .values()
            .filter(|device| device.health == Health::Healthy)
            .count()
    }

    /// Returns the device node to inject for `id`.
    pub async fn device_spec(&self, id: &str) -> PluginResult<DeviceSpec> {
        let table = self.table.read().await;
        self.spec_for(&table.devices, id)
    }

    /// Resolves every id under a single read lock; fails as a whole on the
    /// first id that is unknown or unhealthy.
    pub async fn device_specs(&self, ids: &[String]) -> PluginResult<Vec<DeviceSpec>> {
        let table = self.table.read().await;
        ids.iter().map(|id| self.spec_for(&table.devices, id)).collect()
    }

    fn spec_for(&self, devices: &BTreeMap<String, Device>, id: &str) -> PluginResult<DeviceSpec> {
        let device = devices.get(id).ok_or_else(|| {
            Report::new(PluginError::DeviceNotFound { id: id.to_string() })
        })?;
        if device.health != Health::Healthy {
            return Err(Report::new(PluginError::DeviceUnhealthy { id: id.to_string() }));
        }

        let path = self.root.join(id);
        Ok(DeviceSpec {
            host_path: path.clone(),
            container_path: path,
            permissions: DEVICE_PERMISSIONS,
        })
    }

    /// Receiver notified on every membership or health change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::types::DEFAULT_DEVICE_PATTERN;

    fn inventory() -> DeviceInventory {
        let pattern = DeviceNamePattern::new(DEFAULT_DEVICE_PATTERN).expect("valid pattern");
        DeviceInventory::new("/proc/bmsophon", pattern)
    }

    #[test(tokio::test)]
    async fn set_health_ignores_names_outside_the_pattern() {
        let inventory = inventory();

        assert!(!inventory.set_health("renderD128", Health::Healthy).await);
        assert!(!inventory.set_health("../card0", Health::Healthy).await);
        assert!(inventory.is_empty().await);
    }

    #[test(tokio::test)]
    async fn set_health_is_idempotent() {
        let inventory = inventory();
        let revisions = inventory.subscribe();

        assert!(inventory.set_health("card0", Health::Healthy).await);
        assert!(!inventory.set_health("card0", Health::Healthy).await);
        assert_eq!(inventory.len().await, 1);
        assert_eq!(*revisions.borrow(), 1);

        assert!(inventory.set_health("card0", Health::Unhealthy).await);
        assert_eq!(*revisions.borrow(), 2);
        assert_eq!(inventory.healthy_count().await, 0);
    }

    #[test(tokio::test)]
    async fn device_spec_for_unknown_device_fails_with_not_found() {
        let inventory = inventory();

        let report = inventory
            .device_spec("card7")
            .await
            .expect_err("unknown device must fail");
        assert_eq!(
            report.current_context(),
            &PluginError::DeviceNotFound {
                id: "card7".to_string()
            }
        );
    }

    #[test(tokio::test)]
    async fn device_spec_for_unhealthy_device_fails() {
        let inventory = inventory();
        inventory.set_health("card1", Health::Unhealthy).await;

        let report = inventory
            .device_spec("card1")
            .await
            .expect_err("unhealthy device must fail");
        assert_eq!(
            report.current_context(),
            &PluginError::DeviceUnhealthy {
                id: "card1".to_string()
            }
        );
    }

    #[test(tokio::test)]
    async fn device_spec_for_healthy_device_points_at_the_device_root() {
        let inventory = inventory();
        inventory.set_health("card2", Health::Healthy).await;

        let spec = inventory
            .device_spec("card2")
            .await
            .expect("healthy device should resolve");
        assert_eq!(spec.host_path, PathBuf::from("/proc/bmsophon/card2"));
        assert_eq!(spec.container_path, spec.host_path);
        assert_eq!(spec.permissions, "mrw");
    }

    #[test(tokio::test)]
    async fn device_specs_is_all_or_nothing() {
        let inventory = inventory();
        inventory.set_health("card0", Health::Healthy).await;

        let ids = vec!["card0".to_string(), "card9".to_string()];
        let report = inventory
            .device_specs(&ids)
            .await
            .expect_err("one unknown id fails the request");
        assert_eq!(
            report.current_context(),
            &PluginError::DeviceNotFound {
                id: "card9".to_string()
            }
        );

        let specs = inventory
            .device_specs(&["card0".to_string()])
            .await
            .expect("healthy id resolves");
        assert_eq!(specs.len(), 1);
    }

    #[test(tokio::test)]
    async fn missing_devices_become_unhealthy_until_they_return() {
        let inventory = inventory();
        inventory.set_health("card0", Health::Healthy).await;
        inventory.set_health("card1", Health::Healthy).await;

        let without_card1 = BTreeSet::from(["card0".to_string()]);
        assert_eq!(inventory.refresh_health(&without_card1).await, 1);
        assert_eq!(inventory.refresh_health(&without_card1).await, 0);
        assert_eq!(
            inventory.devices().await,
            vec![
                Device {
                    id: "card0".to_string(),
                    health: Health::Healthy
                },
                Device {
                    id: "card1".to_string(),
                    health: Health::Unhealthy
                },
            ]
        );

        let revisions = inventory.subscribe();
        let both = BTreeSet::from(["card0".to_string(), "card1".to_string()]);
        assert_eq!(inventory.refresh_health(&both).await, 1);
        assert_eq!(inventory.healthy_count().await, 2);
        assert!(revisions.has_changed().expect("inventory alive"));
        assert_eq!(inventory.refresh_health(&both).await, 0);
    }

    #[test(tokio::test)]
    async fn refresh_keeps_explicit_unhealthy_state() {
        let inventory = inventory();
        inventory.set_health("card0", Health::Unhealthy).await;
        inventory.set_health("card1", Health::Healthy).await;

        let present = BTreeSet::from(["card0".to_string(), "card1".to_string()]);
        assert_eq!(inventory.refresh_health(&present).await, 0);
        assert_eq!(inventory.healthy_count().await, 1);

        // vanished, then reported unhealthy by a probe: the probe wins
        inventory.refresh_health(&BTreeSet::from(["card0".to_string()])).await;
        inventory.set_health("card1", Health::Unhealthy).await;
        assert_eq!(inventory.refresh_health(&present).await, 0);
        assert_eq!(inventory.healthy_count().await, 0);
    }
}
