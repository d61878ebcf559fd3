use anyhow::Result;
use clap::Parser;
use device_plugin::config::PluginArgs;
use device_plugin::DeviceManager;
use tokio::select;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let args = PluginArgs::parse();
    let _guard = logging::init_with_file(args.log_file.as_deref())?;

    tracing::info!("Starting eicas device plugin {}", &**version::VERSION);
    tracing::info!(
        dev_directory = %args.dev_directory.display(),
        plugin_dir = %args.plugin_dir.display(),
        resource_name = %args.resource_name,
        "device plugin configuration"
    );

    let manager = DeviceManager::new(
        args.supervisor_config(),
        args.dev_directory.clone(),
        args.device_pattern.clone(),
        args.mounts.clone(),
    );

    let mut serving = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.serve().await })
    };

    select! {
        signal = shutdown_signal() => {
            signal?;
            manager
                .stop()
                .await
                .map_err(|report| anyhow::anyhow!("failed to stop device plugin: {report:?}"))?;
        }
        result = &mut serving => {
            return result?.map_err(|report| anyhow::anyhow!("device plugin stopped: {report:?}"));
        }
    }

    serving
        .await?
        .map_err(|report| anyhow::anyhow!("device plugin stopped: {report:?}"))?;
    tracing::info!("device plugin stopped");
    Ok(())
}

/// Resolves on SIGTERM or SIGINT.
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }
    Ok(())
}
