//! Invocation of the `eicas-smi` management tool.

use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Output;

use error_stack::Report;
use error_stack::ResultExt;

use crate::error::PartitionError;
use crate::error::PartitionResult;

/// Marker eicas-smi prints, with a non-zero exit status, when there is
/// nothing to destroy.
const NO_INSTANCES_MARKER: &str = "No GPU instances found";

/// Captured result of one tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// True when the tool reported that no instances exist.
    pub fn reports_no_instances(&self) -> bool {
        self.stdout.contains(NO_INSTANCES_MARKER)
    }
}

impl From<Output> for ToolOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// External GPU management tool.
pub trait ManagementTool {
    /// Fails with [`PartitionError::ToolNotFound`] when the tool is not
    /// installed.
    fn ensure_available(&self) -> PartitionResult<()>;

    /// Runs the tool to completion. A non-zero exit status is reported
    /// through [`ToolOutput::success`]; only a failure to start is an error.
    fn run(&self, args: &[&str]) -> PartitionResult<ToolOutput>;
}

/// `eicas-smi` at a fixed path, run with [`std::process::Command`].
#[derive(Debug, Clone)]
pub struct SmiTool {
    path: PathBuf,
}

impl SmiTool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ManagementTool for SmiTool {
    fn ensure_available(&self) -> PartitionResult<()> {
        if self.path.exists() {
            Ok(())
        } else {
            Err(Report::new(PartitionError::ToolNotFound {
                path: self.path.display().to_string(),
            }))
        }
    }

    fn run(&self, args: &[&str]) -> PartitionResult<ToolOutput> {
        let command = format!("{} {}", self.path.display(), args.join(" "));
        tracing::info!("Running {}", command.trim_end());

        Command::new(&self.path)
            .args(args)
            .output()
            .map(ToolOutput::from)
            .change_context_lazy(|| PartitionError::ToolInvocation {
                command: command.trim_end().to_string(),
            })
    }
}

/// MIG mode reported by `--query-tpu=mig.mode.current`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigMode {
    Unknown,
    Disabled,
    Enabled,
}

impl MigMode {
    /// Reads the mode from the first whitespace separated token.
    pub fn parse(output: &str) -> Self {
        match output.split_whitespace().next() {
            Some("Enabled") => MigMode::Enabled,
            Some("Disabled") => MigMode::Disabled,
            _ => MigMode::Unknown,
        }
    }
}
