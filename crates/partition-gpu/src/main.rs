use std::process::ExitCode;

use clap::Parser;
use partition_gpu::Outcome;
use partition_gpu::PartitionArgs;
use partition_gpu::PartitionOrchestrator;
use partition_gpu::SmiTool;
use partition_gpu::SystemdReboot;
use utils::logging;
use utils::version;

fn main() -> ExitCode {
    let args = PartitionArgs::parse();
    logging::init();

    tracing::info!("Starting GPU partitioning {}", &**version::VERSION);

    let orchestrator = PartitionOrchestrator::new(
        &args.tpu_config,
        SmiTool::new(&args.eicas_smi_path),
        SystemdReboot,
    );

    match orchestrator.run() {
        Ok(outcome) => {
            if outcome == Outcome::RebootRequired {
                // partitions cannot be created until the node is back up
                tracing::warn!("Node reboot required before GPU partitions can be created");
            }
            outcome.exit_code()
        }
        Err(report) => {
            tracing::error!("GPU partitioning failed: {report:?}");
            ExitCode::FAILURE
        }
    }
}
