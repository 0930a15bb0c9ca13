use anyhow::Result;
use axum::{
    middleware,
    routing::{delete, get},
    Router,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    config::Config,
    handlers::{self, AppState},
    metrics,
    pipeline::{telemetry_middleware, Telemetry},
    signals::setup_signal_handlers,
};

/// Upper bound on the final sink flush during shutdown
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Start the telemetry-instrumented server
///
/// This function:
/// 1. Initializes metrics
/// 2. Sets up signal handlers for graceful shutdown
/// 3. Creates the Axum application
/// 4. Binds to the configured address
/// 5. Serves requests, then flushes the telemetry sinks on shutdown
pub async fn start_server(config: Config, telemetry: Arc<Telemetry>) -> Result<()> {
    info!("Initializing Prometheus metrics...");
    let metrics_handle = match metrics::init_metrics() {
        Ok(handle) => Some(Arc::new(handle)),
        Err(e) => {
            warn!("Metrics recorder unavailable: {:#}", e);
            None
        }
    };

    let (shutdown_tx, signal_handle) = setup_signal_handlers();
    let mut shutdown_rx = shutdown_tx.subscribe();

    let state = AppState {
        metrics: metrics_handle,
        ..AppState::default()
    };

    let app = create_router(&config, state, telemetry.clone());

    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    info!("Starting {} on {}", config.plugin.app_name, addr);
    info!(
        "Configuration: prefix '{}', sinks [{}], {} unrestricted routes",
        config.plugin.prefix,
        telemetry.sinks().names().join(", "),
        config.plugin.all_unrestricted_routes().len()
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Shutdown signal received, draining connections...");
        })
        .await?;

    telemetry.shutdown(SHUTDOWN_FLUSH_TIMEOUT).await;

    signal_handle.abort();
    info!("Server stopped gracefully");

    Ok(())
}

/// Create the Axum router with the plugin routes and the telemetry middleware
pub fn create_router(config: &Config, state: AppState, telemetry: Arc<Telemetry>) -> Router {
    let plugin_routes = Router::new()
        .route("/status", get(handlers::status::status))
        .route("/cache", delete(handlers::cache_admin::nuke_cache))
        .with_state(state.clone());

    let app = if config.plugin.prefix.is_empty() {
        Router::new().merge(plugin_routes)
    } else {
        Router::new().nest(&config.plugin.prefix, plugin_routes)
    };

    let app = app.route(
        "/metrics",
        get(handlers::metrics_handler::metrics).with_state(state),
    );

    instrument(app, telemetry)
}

/// Wrap any router so that every exchange it serves is recorded
pub fn instrument(router: Router, telemetry: Arc<Telemetry>) -> Router {
    router
        .layer(middleware::from_fn_with_state(telemetry, telemetry_middleware))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CLIENT_TIMESTAMP;
    use crate::filter::EventFilter;
    use crate::record::Bindings;
    use crate::sink::SinkSet;
    use axum::{body::Body, http::{Request, StatusCode}};
    use tower::ServiceExt;

    fn quiet_telemetry(config: &Config) -> Arc<Telemetry> {
        Arc::new(
            Telemetry::new(EventFilter::default(), SinkSet::new(Vec::new()), Bindings::current())
                .with_unrestricted_routes(config.plugin.all_unrestricted_routes()),
        )
    }

    #[tokio::test]
    async fn test_status_route_is_mounted_under_prefix() {
        let config = Config::default();
        let app = create_router(&config, AppState::default(), quiet_telemetry(&config));

        let response = app
            .oneshot(Request::get("/core/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(CLIENT_TIMESTAMP).is_none());
    }

    #[tokio::test]
    async fn test_empty_prefix_mounts_at_root() {
        let mut config = Config::default();
        config.plugin.prefix = String::new();
        let app = create_router(&config, AppState::default(), quiet_telemetry(&config));

        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cache_route_nukes_shared_cache() {
        let config = Config::default();
        let state = AppState::default();
        state
            .cache
            .get("core:status", || async { Ok(serde_json::Value::Null) })
            .await
            .unwrap();

        let app = create_router(&config, state.clone(), quiet_telemetry(&config));
        let response = app
            .oneshot(Request::delete("/core/cache").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.headers().get(CLIENT_TIMESTAMP).is_some());
        assert!(state.cache.is_empty());
    }
}
