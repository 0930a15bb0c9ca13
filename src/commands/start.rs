use anyhow::Result;
use http_telemetry::{config, init_tracing_with_telemetry, pipeline::Telemetry, server};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const WRITER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Execute the start command
///
/// This will:
/// 1. Load configuration
/// 2. Assemble the telemetry pipeline (spawning the remote writer if configured)
/// 3. Install tracing with the telemetry layer
/// 4. Start the server
pub async fn execute(config_path: &Path) -> Result<()> {
    let cfg = config::load_config(config_path)?;

    let (telemetry, writer_handle) = Telemetry::from_config(&cfg)?;
    let telemetry = Arc::new(telemetry);

    init_tracing_with_telemetry(&cfg.server, telemetry.clone());
    config::warn_insecure_settings(&cfg);

    info!(
        target: http_telemetry::pipeline::TELEMETRY_TARGET,
        "{} {} started",
        cfg.plugin.app_name,
        cfg.plugin.api_version
    );

    // Closes the sinks before returning, so the remote writer winds down
    server::start_server(cfg, telemetry).await?;

    if let Some(handle) = writer_handle {
        match tokio::time::timeout(WRITER_EXIT_TIMEOUT, handle).await {
            Ok(Ok(())) => info!("Remote telemetry writer stopped"),
            Ok(Err(e)) => warn!("Remote telemetry writer failed: {}", e),
            Err(_) => warn!("Remote telemetry writer did not stop in time"),
        }
    }

    Ok(())
}
