use core::error::Error;

use derive_more::Display;
use error_stack::Report;

/// Result type for device plugin operations.
pub type PluginResult<T> = Result<T, Report<PluginError>>;

/// Errors that can occur while discovering, serving or registering devices.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// The device root could not be listed, e.g. the driver is not loaded yet
    #[display("Failed to list device directory {path}")]
    Discovery { path: String },

    /// Discovery kept failing for the configured number of attempts
    #[display("Device discovery gave up after {attempts} attempts")]
    DiscoveryExhausted { attempts: u32 },

    #[display("invalid allocation request with non-existing device {id}")]
    DeviceNotFound { id: String },

    #[display("invalid allocation request with unhealthy device {id}")]
    DeviceUnhealthy { id: String },

    /// The plugin socket could not be created
    #[display("Failed to bind device plugin socket {path}")]
    Bind { path: String },

    /// The gRPC server stopped before it became ready
    #[display("Device plugin server failed: {message}")]
    Serve { message: String },

    /// The kubelet rejected or could not receive the registration request
    #[display("Failed to register with kubelet at {socket}")]
    Registration { socket: String },

    #[display("Failed to remove device plugin socket {path}")]
    SocketCleanup { path: String },
}

impl Error for PluginError {}
