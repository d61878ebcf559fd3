use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use clap::Parser;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use utils::version;

use crate::error::PartitionError;
use crate::error::PartitionResult;

pub const DEFAULT_SMI_PATH: &str = "/usr/local/eicas/bin/eicas-smi";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/eicas/gpu_config.json";

#[derive(Parser, Debug, Clone)]
#[command(about = "Partitions the node's GPUs into MIG instances", long_about, version = &**version::VERSION)]
pub struct PartitionArgs {
    #[arg(
        long,
        env = "EICAS_SMI_PATH",
        default_value = DEFAULT_SMI_PATH,
        value_hint = clap::ValueHint::FilePath,
        help = "Path where eicas-smi is installed"
    )]
    pub eicas_smi_path: PathBuf,

    #[arg(
        long,
        env = "EICAS_TPU_CONFIG",
        default_value = DEFAULT_CONFIG_PATH,
        value_hint = clap::ValueHint::FilePath,
        help = "File with GPU configurations for the device plugin"
    )]
    pub tpu_config: PathBuf,
}

/// Settings used to configure the GPUs on a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PartitionRequest {
    /// Partition size label such as `1g.5gb`; empty means no partitioning
    #[serde(rename = "GPUPartitionSize", alias = "gpuPartitionSize", default)]
    pub gpu_partition_size: String,
}

impl PartitionRequest {
    /// Reads the request at `path`. A missing file is `Ok(None)`.
    pub fn load(path: &Path) -> PartitionResult<Option<Self>> {
        let parse_error = || PartitionError::ConfigParse {
            path: path.display().to_string(),
        };

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Report::new(e).change_context(parse_error())),
        };

        serde_json::from_str(&content)
            .map(Some)
            .change_context_lazy(parse_error)
            .attach_printable_lazy(|| format!("config file contents: {content}"))
    }
}
