use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use url::Url;

/// Engine configuration, loaded from `TRIBUTARY_`-prefixed environment
/// variables on top of built-in defaults. Nested fields use `__` as the
/// separator, e.g. `TRIBUTARY_SERVICE__BASE_URL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_url: String,
    /// Base64-encoded 32-byte AES-256-GCM key protecting stored credentials.
    pub encryption_key: String,
    pub proxy: Option<Url>,
    pub loglevel: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Token refresh attempts allowed per minute across all services.
    pub refresh_per_minute: u32,
    /// Fallback sleep when a 429 carries no usable wait hint.
    pub default_retry_delay_secs: u64,
    /// Sleep before the single 5xx retry.
    pub server_retry_delay_secs: u64,
    /// A 429 hinting a longer wait than this is treated as quota exhaustion.
    pub max_rate_limit_wait_secs: u64,
    /// Rolling window for the per-service request counter.
    pub rate_window_secs: u64,
    pub batch_size: usize,
    pub master_concurrency: usize,
    pub force_full_refresh: bool,
    pub service: ServiceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:tributary.sqlite".to_string(),
            encryption_key: String::new(),
            proxy: None,
            loglevel: "info".to_string(),
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
            refresh_per_minute: 10,
            default_retry_delay_secs: 1,
            server_retry_delay_secs: 1,
            max_rate_limit_wait_secs: 300,
            rate_window_secs: 3600,
            batch_size: 500,
            master_concurrency: 4,
            force_full_refresh: false,
            service: ServiceConfig::default(),
        }
    }
}

/// Declarative description of the one service the binary syncs. Provider
/// registries with many adapters live in the consuming scheduler; this keeps
/// the CLI runnable against any plain REST/JSON endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: Option<String>,
    pub base_url: Option<Url>,
    pub entity_path: Option<String>,
    pub entity_table: Option<String>,
    pub conflict_key: Option<String>,
    pub id_field: Option<String>,
    pub timestamp_field: Option<String>,
    /// JSON pointer to the record array inside the response, e.g. `/data`.
    pub items_pointer: Option<String>,
    pub start_param: Option<String>,
    pub end_param: Option<String>,
    pub chunk_mode: Option<String>,
    pub max_span_days: Option<i64>,
    pub max_items: Option<usize>,
    pub default_days: Option<i64>,
    pub margin_days: Option<i64>,
}

impl Config {
    pub fn load() -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Env::prefixed("TRIBUTARY_").split("__"))
            .extract()
    }
}
