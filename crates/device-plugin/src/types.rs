use std::fmt;
use std::path::PathBuf;

use api_types::v1beta1;
use regex::Regex;

/// Name pattern of accelerator entries under the device root.
pub const DEFAULT_DEVICE_PATTERN: &str = r"^card[0-9]*$";

/// Cgroup permissions handed out for every allocated device node.
pub const DEVICE_PERMISSIONS: &str = "mrw";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    pub fn as_str(self) -> &'static str {
        match self {
            Health::Healthy => api_types::HEALTHY,
            Health::Unhealthy => api_types::UNHEALTHY,
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An accelerator advertised to the kubelet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub health: Health,
}

impl From<&Device> for v1beta1::Device {
    fn from(device: &Device) -> Self {
        Self {
            id: device.id.clone(),
            health: device.health.as_str().to_string(),
            topology: None,
        }
    }
}

/// Device node injected into a container for one allocated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub permissions: &'static str,
}

impl From<DeviceSpec> for v1beta1::DeviceSpec {
    fn from(spec: DeviceSpec) -> Self {
        Self {
            container_path: spec.container_path.to_string_lossy().into_owned(),
            host_path: spec.host_path.to_string_lossy().into_owned(),
            permissions: spec.permissions.to_string(),
        }
    }
}

/// Static host volume added to every allocation, independent of the devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

impl From<&MountSpec> for v1beta1::Mount {
    fn from(mount: &MountSpec) -> Self {
        Self {
            container_path: mount.container_path.to_string_lossy().into_owned(),
            host_path: mount.host_path.to_string_lossy().into_owned(),
            read_only: mount.read_only,
        }
    }
}

/// Compiled device name pattern, shared by discovery and the inventory guard.
#[derive(Debug, Clone)]
pub struct DeviceNamePattern(Regex);

impl DeviceNamePattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Self)
    }

    pub fn matches(&self, name: &str) -> bool {
        self.0.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn default_pattern_matches_card_entries_only() {
        let pattern = DeviceNamePattern::new(DEFAULT_DEVICE_PATTERN).expect("valid pattern");
        assert!(pattern.matches("card0"));
        assert!(pattern.matches("card12"));
        assert!(pattern.matches("card"));
        assert!(!pattern.matches("xcard0"));
        assert!(!pattern.matches("card0-render"));
        assert!(!pattern.matches("renderD128"));
    }

    #[test]
    fn device_converts_to_wire_health_strings() {
        let device = Device {
            id: "card3".to_string(),
            health: Health::Unhealthy,
        };
        let wire = v1beta1::Device::from(&device);
        assert_eq!(wire.id, "card3");
        assert_eq!(wire.health, "Unhealthy");
        assert!(wire.topology.is_none());
    }

    #[test]
    fn mount_spec_keeps_read_only_flag() {
        let mount = MountSpec {
            host_path: PathBuf::from("/opt/sophon"),
            container_path: PathBuf::from("/opt/sophon"),
            read_only: true,
        };
        let wire = v1beta1::Mount::from(&mount);
        assert_eq!(wire.host_path, "/opt/sophon");
        assert_eq!(wire.container_path, "/opt/sophon");
        assert!(wire.read_only);
    }
}
