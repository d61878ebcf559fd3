use core::error::Error;

use derive_more::Display;
use error_stack::Report;

/// Result type for partitioning operations.
pub type PartitionResult<T> = Result<T, Report<PartitionError>>;

/// Fatal conditions of a partitioning run. Each one ends the run with a
/// non-zero exit status.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum PartitionError {
    /// The partition request exists but cannot be read or parsed
    #[display("Failed to parse partition config {path}")]
    ConfigParse { path: String },

    #[display("eicas-smi not found at {path}")]
    ToolNotFound { path: String },

    /// The management tool could not be started at all
    #[display("Failed to run {command}")]
    ToolInvocation { command: String },

    #[display("Failed to query the current MIG mode")]
    ModeQuery,

    /// The mode query answered with something other than Enabled/Disabled
    #[display("eicas-smi returned invalid output: {output}")]
    UnexpectedOutput { output: String },

    #[display("Failed to enable MIG mode")]
    EnableMode,

    #[display("Failed to trigger node reboot")]
    Reboot,

    /// Destroying existing instances failed for a reason other than there
    /// being none
    #[display("Failed to clean up existing GPU partitions")]
    Cleanup,

    #[display("{label} is not a valid partition size")]
    InvalidPartitionSize { label: String },

    #[display("Failed to create GPU partitions")]
    PartitionCreate,
}

impl Error for PartitionError {}
