use serde::Deserialize;
use std::collections::BTreeMap;

/// Root application configuration. Loaded from environment variables
/// with the prefix `FUNNEL_INSIGHTS__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub reporting: ReportingConfig,
    #[serde(default)]
    pub benchmarks: BenchmarkConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Limits applied to every call against the event/session store.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportingConfig {
    #[serde(default = "default_period_days")]
    pub default_period_days: i64,
    #[serde(default = "default_journey_limit")]
    pub default_journey_limit: usize,
    /// How far before the order window sessions are searched for attribution.
    #[serde(default = "default_attribution_lookback_days")]
    pub attribution_lookback_days: i64,
}

/// A `{good, warning}` pair of stage-over-stage conversion percentages.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Threshold {
    pub good: f64,
    pub warning: f64,
}

/// Industry benchmarks keyed by funnel-transition name
/// (`start_rate`, `completion_rate`, `capture_rate`).
#[derive(Debug, Clone, Deserialize)]
pub struct BenchmarkConfig {
    #[serde(default = "default_thresholds")]
    pub thresholds: BTreeMap<String, Threshold>,
    #[serde(default = "default_tip_min_drop_off_pct")]
    pub tip_min_drop_off_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

// Default functions
fn default_node_id() -> String {
    "funnel-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_query_timeout_ms() -> u64 {
    5000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_period_days() -> i64 {
    30
}
fn default_journey_limit() -> usize {
    50
}
fn default_attribution_lookback_days() -> i64 {
    90
}
fn default_thresholds() -> BTreeMap<String, Threshold> {
    BTreeMap::from([
        (
            "start_rate".to_string(),
            Threshold {
                good: 60.0,
                warning: 40.0,
            },
        ),
        (
            "completion_rate".to_string(),
            Threshold {
                good: 70.0,
                warning: 50.0,
            },
        ),
        (
            "capture_rate".to_string(),
            Threshold {
                good: 85.0,
                warning: 70.0,
            },
        ),
    ])
}
fn default_tip_min_drop_off_pct() -> f64 {
    10.0
}
fn default_queue_capacity() -> usize {
    10_000
}
fn default_max_retries() -> u32 {
    5
}
fn default_initial_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_delivery_timeout_ms() -> u64 {
    10_000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: default_query_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            default_period_days: default_period_days(),
            default_journey_limit: default_journey_limit(),
            attribution_lookback_days: default_attribution_lookback_days(),
        }
    }
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            thresholds: default_thresholds(),
            tip_min_drop_off_pct: default_tip_min_drop_off_pct(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            queue_capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            store: StoreConfig::default(),
            reporting: ReportingConfig::default(),
            benchmarks: BenchmarkConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and an optional config file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("FUNNEL_INSIGHTS")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
