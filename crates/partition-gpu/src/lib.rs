//! Splits the node's GPUs into MIG instances before the device plugin starts.
//!
//! [`PartitionOrchestrator`] reads the requested partition size, enables MIG
//! mode when needed (which takes a reboot) and otherwise replaces the existing
//! instances with the requested layout through `eicas-smi`.

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod profile;
pub mod reboot;
pub mod smi;

pub use config::PartitionArgs;
pub use config::PartitionRequest;
pub use error::PartitionError;
pub use error::PartitionResult;
pub use orchestrator::Outcome;
pub use orchestrator::PartitionOrchestrator;
pub use profile::PartitionPlan;
pub use profile::PartitionProfiles;
pub use reboot::RebootTrigger;
pub use reboot::SystemdReboot;
pub use smi::ManagementTool;
pub use smi::MigMode;
pub use smi::SmiTool;
