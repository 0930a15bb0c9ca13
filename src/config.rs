use serde::{Deserialize, Serialize};
use std::path::Path;

/// Route fragments that never receive correlation stamping
pub const BUILTIN_UNRESTRICTED_ROUTES: [&str; 2] = ["/documentation", "/status"];

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub plugin: PluginConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3100,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PluginConfig {
    pub app_name: String,
    pub api_version: String,
    /// Mount point of the plugin's own routes
    pub prefix: String,
    /// Extra route fragments exempt from correlation stamping
    pub unrestricted_routes: Vec<String>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            app_name: "Application Name".to_string(),
            api_version: "v1".to_string(),
            prefix: "/core".to_string(),
            unrestricted_routes: Vec::new(),
        }
    }
}

impl PluginConfig {
    /// Built-in plus configured unrestricted route fragments
    pub fn all_unrestricted_routes(&self) -> Vec<String> {
        BUILTIN_UNRESTRICTED_ROUTES
            .iter()
            .map(|r| r.to_string())
            .chain(self.unrestricted_routes.iter().cloned())
            .collect()
    }

    /// Index base name derived from the application identity
    pub fn log_index(&self) -> String {
        format!("{}-{}", self.app_name, self.api_version)
            .to_lowercase()
            .replace(char::is_whitespace, "-")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Status whose error-less completions are not recorded
    pub suppressed_status: u16,
    /// Largest request/response body buffered for capture
    pub max_body_bytes: usize,
    /// Remote sink queue bound; the newest record is dropped when full
    pub queue_capacity: usize,
    pub remote: Option<RemoteStoreConfig>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            suppressed_status: 500,
            max_body_bytes: 1024 * 1024,
            queue_capacity: 1024,
            remote: None,
        }
    }
}

/// Indexed remote store (Elasticsearch-compatible bulk API)
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteStoreConfig {
    pub uri: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Index base name; records land in `<index>-<YYYY-MM-DD>`.
    /// Empty means derive from the plugin's app name and API version.
    pub index: String,
    pub batch_size: usize,
    pub flush_bytes: usize,
    pub flush_interval_ms: u64,
    /// Replica acknowledgements required before a batch counts as written
    pub wait_for_active_shards: String,
    /// Skip TLS certificate validation toward the store
    pub accept_invalid_certs: bool,
    pub timeout_seconds: u64,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            user: None,
            password: None,
            index: String::new(),
            batch_size: 10,
            flush_bytes: 16 * 1024,
            flush_interval_ms: 1000,
            wait_for_active_shards: "1".to_string(),
            accept_invalid_certs: false,
            timeout_seconds: 10,
        }
    }
}

impl Config {
    /// Remote store settings with the index base name resolved
    pub fn resolved_remote(&self) -> Option<RemoteStoreConfig> {
        self.telemetry.remote.clone().map(|mut remote| {
            if remote.index.trim().is_empty() {
                remote.index = self.plugin.log_index();
            }
            remote.index = remote.index.to_lowercase();
            remote
        })
    }
}

/// Load configuration from an optional TOML file layered with
/// `HTTP_TELEMETRY__*` environment variables
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(config::Environment::with_prefix("HTTP_TELEMETRY").separator("__"))
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    match cfg.server.log_format.as_str() {
        "text" | "json" => {}
        other => anyhow::bail!("Invalid log format '{}': expected 'text' or 'json'", other),
    }

    if !cfg.plugin.prefix.is_empty() && !cfg.plugin.prefix.starts_with('/') {
        anyhow::bail!("Plugin prefix '{}' must start with '/'", cfg.plugin.prefix);
    }

    if !(500..=599).contains(&cfg.telemetry.suppressed_status) {
        anyhow::bail!(
            "Suppressed status {} must be a server fault code (5xx)",
            cfg.telemetry.suppressed_status
        );
    }

    if cfg.telemetry.queue_capacity == 0 {
        anyhow::bail!("Telemetry queue capacity must be at least 1");
    }

    if let Some(remote) = &cfg.telemetry.remote {
        let url = url::Url::parse(&remote.uri)
            .map_err(|e| anyhow::anyhow!("Invalid remote store uri '{}': {}", remote.uri, e))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            anyhow::bail!("Remote store uri must use http or https, got '{}'", url.scheme());
        }
        if remote.batch_size == 0 {
            anyhow::bail!("Remote store batch size must be at least 1");
        }
        if remote.password.is_some() && remote.user.is_none() {
            anyhow::bail!("Remote store password is set without a user");
        }
    }

    Ok(())
}

/// Log settings that weaken transport security. Call once tracing is installed.
pub fn warn_insecure_settings(cfg: &Config) {
    if let Some(remote) = &cfg.telemetry.remote {
        if remote.accept_invalid_certs {
            tracing::warn!(
                uri = %remote.uri,
                "TLS certificate validation toward the remote store is disabled"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> Config {
        Config {
            telemetry: TelemetryConfig {
                remote: Some(RemoteStoreConfig {
                    uri: "https://localhost:9200".to_string(),
                    user: Some("elastic".to_string()),
                    password: Some("changeme".to_string()),
                    index: "Some-Index".to_string(),
                    ..RemoteStoreConfig::default()
                }),
                ..TelemetryConfig::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&Config::default()).is_ok());
        assert!(validate_config(&create_test_config()).is_ok());
    }

    #[test]
    fn test_validate_config_rejects_bad_log_format() {
        let mut cfg = create_test_config();
        cfg.server.log_format = "xml".to_string();

        let result = validate_config(&cfg);
        assert!(result.unwrap_err().to_string().contains("Invalid log format"));
    }

    #[test]
    fn test_validate_config_rejects_non_fault_suppressed_status() {
        let mut cfg = create_test_config();
        cfg.telemetry.suppressed_status = 404;

        let result = validate_config(&cfg);
        assert!(result.unwrap_err().to_string().contains("5xx"));
    }

    #[test]
    fn test_validate_config_rejects_bad_remote_uri() {
        let mut cfg = create_test_config();
        cfg.telemetry.remote.as_mut().unwrap().uri = "ftp://logs.internal".to_string();
        assert!(validate_config(&cfg).is_err());

        cfg.telemetry.remote.as_mut().unwrap().uri = "not a url".to_string();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_validate_config_rejects_zero_batch() {
        let mut cfg = create_test_config();
        cfg.telemetry.remote.as_mut().unwrap().batch_size = 0;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_tls_validation_is_on_by_default() {
        assert!(!RemoteStoreConfig::default().accept_invalid_certs);
    }

    #[test]
    fn test_unrestricted_routes_include_builtins() {
        let mut plugin = PluginConfig::default();
        plugin.unrestricted_routes.push("/health".to_string());

        assert_eq!(
            plugin.all_unrestricted_routes(),
            vec!["/documentation", "/status", "/health"]
        );
    }

    #[test]
    fn test_resolved_remote_index() {
        let cfg = create_test_config();
        assert_eq!(cfg.resolved_remote().unwrap().index, "some-index");

        let mut cfg = create_test_config();
        cfg.plugin.app_name = "Some App".to_string();
        cfg.telemetry.remote.as_mut().unwrap().index = String::new();
        assert_eq!(cfg.resolved_remote().unwrap().index, "some-app-v1");

        assert!(Config::default().resolved_remote().is_none());
    }

    #[test]
    fn test_load_config_from_missing_file_uses_defaults() {
        let cfg = load_config(Path::new("does-not-exist.toml")).unwrap();
        assert_eq!(cfg.server.port, 3100);
        assert_eq!(cfg.plugin.prefix, "/core");
        assert!(cfg.telemetry.remote.is_none());
    }

    #[derive(Clone, Default)]
    struct WarningRecorder(std::sync::Arc<std::sync::Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarningRecorder {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            struct Message(Option<String>);

            impl tracing::field::Visit for Message {
                fn record_debug(
                    &mut self,
                    field: &tracing::field::Field,
                    value: &dyn std::fmt::Debug,
                ) {
                    if field.name() == "message" {
                        self.0 = Some(format!("{:?}", value));
                    }
                }
            }

            if *event.metadata().level() == tracing::Level::WARN {
                let mut message = Message(None);
                event.record(&mut message);
                self.0.lock().unwrap().extend(message.0);
            }
        }
    }

    fn warnings_for(cfg: &Config) -> Vec<String> {
        use tracing_subscriber::prelude::*;

        let recorder = WarningRecorder::default();
        let subscriber = tracing_subscriber::registry().with(recorder.clone());
        tracing::subscriber::with_default(subscriber, || warn_insecure_settings(cfg));

        let warnings = recorder.0.lock().unwrap().clone();
        warnings
    }

    #[test]
    fn test_insecure_tls_is_warned_about() {
        let mut cfg = create_test_config();
        assert!(warnings_for(&cfg).is_empty());

        cfg.telemetry.remote.as_mut().unwrap().accept_invalid_certs = true;
        let warnings = warnings_for(&cfg);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("TLS certificate validation"));
    }
}
