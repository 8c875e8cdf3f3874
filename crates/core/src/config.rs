use serde::Deserialize;
use tracing::debug;

/// Root application configuration. Loaded from environment variables
/// with the prefix `DRIP_EXPRESS__` and TOML config files.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_workers_per_queue")]
    pub workers_per_queue: usize,
    /// How often the broker promotes due delayed jobs.
    #[serde(default = "default_promotion_interval_ms")]
    pub promotion_interval_ms: u64,
    /// How often the retention sweeper prunes terminal jobs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_completed_max_age_secs")]
    pub completed_max_age_secs: u64,
    #[serde(default = "default_completed_max_count")]
    pub completed_max_count: usize,
    #[serde(default = "default_failed_max_age_secs")]
    pub failed_max_age_secs: u64,
    #[serde(default = "default_failed_max_count")]
    pub failed_max_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// ISO-8601 duration applied to wait-for-open nodes with no explicit
    /// timeout.
    #[serde(default = "default_no_open_timeout")]
    pub default_no_open_timeout: String,
    /// ISO-8601 duration applied to wait-for-click nodes with no
    /// explicit timeout.
    #[serde(default = "default_no_click_timeout")]
    pub default_no_click_timeout: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_from_email")]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default = "default_sendgrid_api_key")]
    pub sendgrid_api_key: String,
    #[serde(default = "default_smtp_relay_url")]
    pub smtp_relay_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "drip-01".to_string()
}
fn default_workers_per_queue() -> usize {
    4
}
fn default_promotion_interval_ms() -> u64 {
    250
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_completed_max_age_secs() -> u64 {
    3600
}
fn default_completed_max_count() -> usize {
    100
}
fn default_failed_max_age_secs() -> u64 {
    86_400
}
fn default_failed_max_count() -> usize {
    50
}
fn default_no_open_timeout() -> String {
    "PT72H".to_string()
}
fn default_no_click_timeout() -> String {
    "PT24H".to_string()
}
fn default_from_email() -> String {
    "hello@dripexpress.io".to_string()
}
fn default_from_name() -> String {
    "DripExpress".to_string()
}
fn default_sendgrid_api_key() -> String {
    String::new()
}
fn default_smtp_relay_url() -> String {
    "smtp://localhost:587".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers_per_queue: default_workers_per_queue(),
            promotion_interval_ms: default_promotion_interval_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            completed_max_age_secs: default_completed_max_age_secs(),
            completed_max_count: default_completed_max_count(),
            failed_max_age_secs: default_failed_max_age_secs(),
            failed_max_count: default_failed_max_count(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_no_open_timeout: default_no_open_timeout(),
            default_no_click_timeout: default_no_click_timeout(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            from_email: default_from_email(),
            from_name: default_from_name(),
            sendgrid_api_key: default_sendgrid_api_key(),
            smtp_relay_url: default_smtp_relay_url(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            dispatch: DispatchConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("DRIP_EXPRESS")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            );

        let config = builder.build()?;
        let app: Self = config.try_deserialize()?;
        debug!(node_id = %app.node_id, "Configuration loaded from environment");
        Ok(app)
    }
}
