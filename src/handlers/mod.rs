//! Routes the plugin mounts on the host application

pub mod cache_admin;
pub mod metrics_handler;
pub mod status;

use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::Value;
use std::sync::Arc;

use crate::cache::MemoCache;

/// Shared state for plugin routes
#[derive(Clone, Default)]
pub struct AppState {
    /// Memoized one-time loads, reset with `DELETE {prefix}/cache`
    pub cache: Arc<MemoCache<Value>>,
    pub metrics: Option<Arc<PrometheusHandle>>,
}
