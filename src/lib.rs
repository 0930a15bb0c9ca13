pub mod cache;
pub mod config;
pub mod correlation;
pub mod error;
pub mod exchange;
pub mod filter;
pub mod handlers;
pub mod metrics;
pub mod pipeline;
pub mod record;
pub mod server;
pub mod signals;
pub mod sink;

use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::ServerConfig;
use crate::pipeline::{Telemetry, TelemetryLayer};

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize diagnostic tracing on stderr
///
/// Note: This function can only be called once. Stdout is left to the
/// telemetry stream sink.
pub fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}

/// Initialize tracing with the telemetry layer attached
///
/// Events logged with `target: "telemetry"` are forwarded into the pipeline
/// as messages; everything else stays a stderr diagnostic.
pub fn init_tracing_with_telemetry(server: &ServerConfig, telemetry: Arc<Telemetry>) {
    let telemetry_layer = TelemetryLayer::new(telemetry);

    let result = if server.log_format == "json" {
        tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(env_filter(&server.log_level))
                .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
                .with(telemetry_layer),
        )
    } else {
        tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(env_filter(&server.log_level))
                .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
                .with(telemetry_layer),
        )
    };

    if let Err(e) = result {
        eprintln!("Warning: Failed to install telemetry layer: {}", e);
    }
}
