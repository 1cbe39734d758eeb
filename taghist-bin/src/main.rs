use clap::Parser;
use std::{env::current_dir, path::PathBuf};
use taghist_common::Logger;
use taghist_core::{Historian, SimDevice};
use taghist_error::{THError, THResult};
use taghist_models::{constants::DEFAULT_CONFIG_FILE_NAME, Settings};
use tracing::info;

/// taghist - industrial telemetry historian
///
/// Polls tags out of configured controllers, fans out changed values to
/// subscribers and records a day-sharded history for range queries.
#[derive(Parser)]
#[command(name = "taghist")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "taghist historian", long_about = None)]
struct Cli {
    /// Custom config file with full path.
    ///
    /// If not specified, `taghist.toml` in the current working directory
    /// is used when present; otherwise built-in defaults apply.
    #[arg(short, long, env = "TH_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> THResult<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(p) => p,
        None => {
            let dir = current_dir()
                .map_err(|e| THError::from(format!("failed to get current directory: {e}")))?;
            dir.join(DEFAULT_CONFIG_FILE_NAME)
        }
    };

    let settings = Settings::new(&config_path.to_string_lossy())?;

    let mut logger = Logger::new(&settings.log);
    logger.initialize(&settings.log)?;

    info!(
        config = %config_path.display(),
        sources = settings.sources.len(),
        "starting taghist"
    );

    // The device transport is a boundary: real deployments plug a PLC
    // client factory in here. The built-in simulator keeps the daemon
    // runnable without hardware.
    let sim = SimDevice::new();
    let historian = Historian::new(settings, sim.factory()).await?;
    historian.start().await?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| THError::from(format!("failed to listen for shutdown signal: {e}")))?;
    info!("shutdown signal received");

    historian.shutdown().await?;
    Ok(())
}
