//! Helpers shared by the device plugin daemon and the partition tool.

mod build_info;
pub mod logging;
pub mod version;
