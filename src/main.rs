use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use videogate::config::Config;
use videogate::context::ServiceContext;
use videogate::reload::ReloadManager;

/// Videogate - edge video transformation proxy core
#[derive(Parser, Debug)]
#[command(name = "videogate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration before logging so the logging section applies.
    let config = Config::from_file(&args.config)
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    videogate::logging::init_subscriber(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::info!(
        config_file = %args.config.display(),
        origins = config.origins().len(),
        "Configuration loaded successfully"
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let ctx = ServiceContext::with_memory_bindings(config)
            .map_err(|e| anyhow::anyhow!("Failed to build service context: {}", e))?;

        let reload = ReloadManager::new(args.config.clone());
        #[cfg(unix)]
        reload
            .register_signal_handler()
            .map_err(|e| anyhow::anyhow!("Failed to register SIGHUP handler: {}", e))?;

        tracing::info!("Service context initialized; handler ready for the shell");

        // The HTTP shell drives videogate::handler::handle_transform. This
        // binary stays up to service SIGHUP reloads for embedded shells.
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            if reload.is_reload_requested() {
                reload.clear_reload_request();
                match reload.apply(&ctx) {
                    Ok(()) => tracing::info!("configuration reloaded"),
                    Err(err) => {
                        tracing::warn!(error = %err, "reload failed, keeping previous config")
                    }
                }
            }
        }
    })
}
