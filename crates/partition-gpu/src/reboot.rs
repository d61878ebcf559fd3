use std::io;

use error_stack::Report;

use crate::error::PartitionError;
use crate::error::PartitionResult;

/// Requests a node reboot.
pub trait RebootTrigger {
    fn reboot(&self) -> PartitionResult<()>;
}

/// Asks systemd for a graceful reboot by sending SIGRTMIN+5 to PID 1.
///
/// See the SIGNALS section of systemd(1).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemdReboot;

impl RebootTrigger for SystemdReboot {
    fn reboot(&self) -> PartitionResult<()> {
        let signal = libc::SIGRTMIN() + 5;
        tracing::info!(signal, "sending reboot signal to init");

        // SAFETY: kill has no memory safety requirements
        let rc = unsafe { libc::kill(1, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(Report::new(io::Error::last_os_error()).change_context(PartitionError::Reboot))
        }
    }
}
