//! Kubelet device plugin for Eicas TPU accelerators.
//!
//! The main components are:
//! - [`DiscoveryScanner`]: finds accelerator directories under the device root
//! - [`DeviceInventory`]: device ids and health, read by the gRPC handlers
//! - [`PluginService`]: the `v1beta1.DevicePlugin` gRPC service
//! - [`DeviceManager`]: serve-cycle supervision, restart on socket loss or new devices

pub mod config;
pub mod discovery;
pub mod error;
pub mod inventory;
pub mod plugin_service;
pub mod supervisor;
pub mod types;

pub use discovery::DiscoveryScanner;
pub use discovery::RetryPolicy;
pub use error::PluginError;
pub use error::PluginResult;
pub use inventory::DeviceInventory;
pub use plugin_service::PluginService;
pub use supervisor::DeviceManager;
pub use supervisor::HealthUpdate;
pub use supervisor::SupervisorConfig;
pub use supervisor::SupervisorState;
pub use types::Device;
pub use types::DeviceNamePattern;
pub use types::DeviceSpec;
pub use types::Health;
pub use types::MountSpec;
