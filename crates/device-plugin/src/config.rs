use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use utils::version;

use crate::discovery::RetryPolicy;
use crate::supervisor::SupervisorConfig;
use crate::supervisor::DEFAULT_ENDPOINT_PREFIX;
use crate::supervisor::DEFAULT_RESOURCE_NAME;
use crate::types::DeviceNamePattern;
use crate::types::MountSpec;
use crate::types::DEFAULT_DEVICE_PATTERN;

#[derive(Parser, Debug, Clone)]
#[command(about = "Advertises Eicas TPU devices to the kubelet", long_about, version = &**version::VERSION)]
pub struct PluginArgs {
    #[arg(
        long,
        env = "EICAS_DEV_DIRECTORY",
        default_value = "/proc/bmsophon",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory where every accelerator appears as a sub directory"
    )]
    pub dev_directory: PathBuf,

    #[arg(
        long,
        env = "EICAS_DEVICE_PATTERN",
        default_value = DEFAULT_DEVICE_PATTERN,
        value_parser = parse_device_pattern,
        help = "Regular expression device directory names must match"
    )]
    pub device_pattern: DeviceNamePattern,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_PATH",
        default_value = api_types::DEVICE_PLUGIN_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory for the kubelet socket and the plugin sockets"
    )]
    pub plugin_dir: PathBuf,

    #[arg(
        long,
        env = "EICAS_KUBELET_ENDPOINT",
        default_value = api_types::KUBELET_SOCKET,
        help = "File name of the kubelet registration socket inside --plugin-dir"
    )]
    pub kubelet_endpoint: String,

    #[arg(
        long,
        env = "EICAS_ENDPOINT_PREFIX",
        default_value = DEFAULT_ENDPOINT_PREFIX,
        help = "Prefix of the plugin socket file name"
    )]
    pub endpoint_prefix: String,

    #[arg(
        long,
        env = "EICAS_RESOURCE_NAME",
        default_value = DEFAULT_RESOURCE_NAME,
        help = "Resource name the devices are advertised under"
    )]
    pub resource_name: String,

    #[arg(
        long = "mount",
        env = "EICAS_MOUNTS",
        value_delimiter = ',',
        default_value = "/opt/sophon:/opt/sophon:ro",
        value_parser = parse_mount_spec,
        help = "Static mount added to every allocation, HOST:CONTAINER[:ro|rw]; repeatable or comma separated"
    )]
    pub mounts: Vec<MountSpec>,

    #[arg(
        long,
        env = "EICAS_SOCKET_CHECK_INTERVAL_MS",
        default_value = "1000",
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Interval in milliseconds for checking that the plugin socket still exists"
    )]
    pub socket_check_interval_ms: u64,

    #[arg(
        long,
        env = "EICAS_DEVICE_CHECK_INTERVAL_MS",
        default_value = "10000",
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Interval in milliseconds for checking for newly installed devices"
    )]
    pub device_check_interval_ms: u64,

    #[arg(
        long,
        env = "DISCOVERY_RETRY_INTERVAL_MS",
        default_value = "5000",
        help = "Delay in milliseconds between device discovery attempts"
    )]
    pub discovery_retry_interval_ms: u64,

    #[arg(
        long,
        env = "DISCOVERY_MAX_ATTEMPTS",
        help = "Give up after this many failed discovery attempts (default: retry forever)"
    )]
    pub discovery_max_attempts: Option<u32>,

    #[arg(
        long,
        env = "EICAS_PLUGIN_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to this file, rotated daily"
    )]
    pub log_file: Option<PathBuf>,
}

impl PluginArgs {
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            plugin_dir: self.plugin_dir.clone(),
            kubelet_endpoint: self.kubelet_endpoint.clone(),
            endpoint_prefix: self.endpoint_prefix.clone(),
            resource_name: self.resource_name.clone(),
            socket_check_interval: Duration::from_millis(self.socket_check_interval_ms),
            device_check_interval: Duration::from_millis(self.device_check_interval_ms),
            discovery_retry: RetryPolicy {
                interval: Duration::from_millis(self.discovery_retry_interval_ms),
                max_attempts: self.discovery_max_attempts,
            },
            ..SupervisorConfig::default()
        }
    }
}

fn parse_device_pattern(s: &str) -> Result<DeviceNamePattern, String> {
    DeviceNamePattern::new(s).map_err(|e| format!("Invalid device pattern '{s}': {e}"))
}

/// Parse `HOST:CONTAINER[:ro|rw]`; mounts are read-only unless `rw` is given.
fn parse_mount_spec(s: &str) -> Result<MountSpec, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let (host, container, mode) = match parts.as_slice() {
        [host, container] => (*host, *container, "ro"),
        [host, container, mode] => (*host, *container, *mode),
        _ => return Err(format!("Invalid mount '{s}', expected HOST:CONTAINER[:ro|rw]")),
    };
    if host.is_empty() || container.is_empty() {
        return Err(format!("Invalid mount '{s}', paths must not be empty"));
    }
    let read_only = match mode {
        "ro" => true,
        "rw" => false,
        other => return Err(format!("Invalid mount mode '{other}' in '{s}', expected ro or rw")),
    };

    Ok(MountSpec {
        host_path: PathBuf::from(host),
        container_path: PathBuf::from(container),
        read_only,
    })
}
