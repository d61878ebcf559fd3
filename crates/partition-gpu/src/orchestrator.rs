//! One-shot MIG partitioning run.
//!
//! `load config → resolve plan → check tool → check mode`, then either
//! `enable mode → reboot` or `clean up → create → verify`. Every command is
//! run to completion before the next one starts.

use std::path::PathBuf;
use std::process::ExitCode;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::error;
use tracing::info;

use crate::config::PartitionRequest;
use crate::error::PartitionError;
use crate::error::PartitionResult;
use crate::profile::PartitionPlan;
use crate::profile::PartitionProfiles;
use crate::reboot::RebootTrigger;
use crate::smi::ManagementTool;
use crate::smi::MigMode;
use crate::smi::ToolOutput;

const QUERY_MODE_ARGS: [&str; 2] = ["--query-tpu=mig.mode.current", "--format=csv,noheader"];
const ENABLE_MODE_ARGS: [&str; 2] = ["-mig", "1"];
const DESTROY_COMPUTE_INSTANCES_ARGS: [&str; 2] = ["mig", "-dci"];
const DESTROY_GPU_INSTANCES_ARGS: [&str; 2] = ["mig", "-dgi"];
const CREATE_COMPUTE_INSTANCES_ARGS: [&str; 2] = ["mig", "-cci"];

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No config file or no partition size requested
    NothingToDo,
    /// MIG mode was just enabled and only takes effect after a reboot
    RebootRequired,
    Partitioned,
}

impl Outcome {
    pub fn exit_code(self) -> ExitCode {
        match self {
            Outcome::NothingToDo | Outcome::Partitioned => ExitCode::SUCCESS,
            Outcome::RebootRequired => ExitCode::FAILURE,
        }
    }
}

pub struct PartitionOrchestrator<T, R> {
    config_path: PathBuf,
    tool: T,
    reboot: R,
    profiles: PartitionProfiles,
}

impl<T: ManagementTool, R: RebootTrigger> PartitionOrchestrator<T, R> {
    pub fn new(config_path: impl Into<PathBuf>, tool: T, reboot: R) -> Self {
        Self {
            config_path: config_path.into(),
            tool,
            reboot,
            profiles: PartitionProfiles::builtin(),
        }
    }

    pub fn run(&self) -> PartitionResult<Outcome> {
        let Some(request) = PartitionRequest::load(&self.config_path)? else {
            info!("No GPU config file given, nothing to do.");
            return Ok(Outcome::NothingToDo);
        };
        info!("Using tpu config: {request:?}");

        if request.gpu_partition_size.is_empty() {
            info!("No GPU partitions are required, exiting");
            return Ok(Outcome::NothingToDo);
        }

        // resolve before touching the GPUs so an unknown size changes nothing
        let plan = self.profiles.plan(&request.gpu_partition_size)?;

        self.tool.ensure_available()?;

        if !self.mig_mode_enabled()? {
            info!("MIG mode is not enabled. Enabling now.");
            self.enable_mig_mode()?;

            info!("Rebooting node to enable MIG mode");
            if let Err(report) = self.reboot.reboot() {
                error!("Failed to trigger node reboot after enabling MIG mode: {report:?}");
            }
            return Ok(Outcome::RebootRequired);
        }

        info!("MIG mode is enabled on all GPUs, proceeding to create GPU partitions.");

        info!("Cleaning up any existing GPU partitions");
        self.cleanup_partitions()?;

        info!("Creating new GPU partitions");
        self.create_partitions(&plan)?;

        self.verify();
        Ok(Outcome::Partitioned)
    }

    fn mig_mode_enabled(&self) -> PartitionResult<bool> {
        let output = self
            .tool
            .run(&QUERY_MODE_ARGS)
            .change_context(PartitionError::ModeQuery)?;
        if !output.success {
            return Err(with_output(Report::new(PartitionError::ModeQuery), &output));
        }

        match MigMode::parse(&output.stdout) {
            MigMode::Enabled => Ok(true),
            MigMode::Disabled => Ok(false),
            MigMode::Unknown => Err(Report::new(PartitionError::UnexpectedOutput {
                output: output.stdout.trim().to_string(),
            })),
        }
    }

    fn enable_mig_mode(&self) -> PartitionResult<()> {
        let output = self
            .tool
            .run(&ENABLE_MODE_ARGS)
            .change_context(PartitionError::EnableMode)?;
        if !output.success {
            return Err(with_output(Report::new(PartitionError::EnableMode), &output));
        }
        Ok(())
    }

    /// Compute instances live inside GPU instances, so they go first.
    fn cleanup_partitions(&self) -> PartitionResult<()> {
        for (args, kind) in [
            (DESTROY_COMPUTE_INSTANCES_ARGS, "compute instance"),
            (DESTROY_GPU_INSTANCES_ARGS, "gpu instance"),
        ] {
            let output = self
                .tool
                .run(&args)
                .change_context(PartitionError::Cleanup)?;
            if !output.success && !output.reports_no_instances() {
                return Err(with_output(Report::new(PartitionError::Cleanup), &output)
                    .attach_printable(format!("failed to destroy {kind}")));
            }
            info!("Output:\n {}", output.stdout);
        }
        Ok(())
    }

    /// No rollback on failure; the next run's cleanup removes leftovers.
    fn create_partitions(&self, plan: &PartitionPlan) -> PartitionResult<()> {
        let create_gpu_instances = ["mig", "-cgi", plan.as_str()];
        for (args, kind) in [
            (&create_gpu_instances[..], "GPU instances"),
            (&CREATE_COMPUTE_INSTANCES_ARGS[..], "compute instances"),
        ] {
            let output = self
                .tool
                .run(args)
                .change_context(PartitionError::PartitionCreate)?;
            if !output.success {
                return Err(
                    with_output(Report::new(PartitionError::PartitionCreate), &output)
                        .attach_printable(format!("failed to create {kind}")),
                );
            }
            info!("Output:\n {}", output.stdout);
        }
        Ok(())
    }

    fn verify(&self) {
        match self.tool.run(&[]) {
            Ok(output) if output.success => info!("Output:\n {}", output.stdout),
            Ok(output) => error!(
                "Failed to run eicas-smi, output: {}, stderr: {}",
                output.stdout, output.stderr
            ),
            Err(report) => error!("Failed to run eicas-smi: {report:?}"),
        }
    }
}

fn with_output(report: Report<PartitionError>, output: &ToolOutput) -> Report<PartitionError> {
    report.attach_printable(format!(
        "eicas-smi output: {}, stderr: {}",
        output.stdout.trim_end(),
        output.stderr.trim_end()
    ))
}
