use crate::intelligence::health::HealthStatus;
use crate::providers::ServiceDescriptorConfig;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 8082;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 256;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub proxy: ProxySettings,
    pub intelligence: IntelligenceSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApplicationSettings {
    pub environment: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
        }
    }
}

/// Routing mode of the proxy listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// `/proxy/:service/:model/*rest` routing through the service registry
    #[default]
    Dynamic,
    /// Single fixed backend, proxied transparently
    Static,
}

/// Configuration object supplied by the embedding application.
///
/// Field names follow the collaborator's camelCase JSON; snake_case aliases
/// make the same fields reachable from config files and environment
/// variables (`LLM_BRIDGE__PROXY__API_URL`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxySettings {
    pub mode: ProxyMode,
    #[serde(alias = "api_url")]
    pub api_url: Option<String>,
    #[serde(alias = "api_key")]
    pub api_key: Option<String>,
    pub model: Option<String>,
    #[serde(alias = "max_tokens")]
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Outbound HTTP/HTTPS proxy URL
    pub proxy: Option<String>,
    #[serde(alias = "server_host")]
    pub server_host: String,
    #[serde(alias = "server_port")]
    pub server_port: u16,
    #[serde(alias = "openai_base_url")]
    pub openai_base_url: Option<String>,
    #[serde(alias = "openai_api_key")]
    pub openai_api_key: Option<String>,
    #[serde(alias = "big_model")]
    pub big_model: Option<String>,
    #[serde(alias = "middle_model")]
    pub middle_model: Option<String>,
    #[serde(alias = "small_model")]
    pub small_model: Option<String>,
    #[serde(alias = "expected_anthropic_api_key")]
    pub expected_anthropic_api_key: Option<String>,
    #[serde(alias = "request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(alias = "max_in_flight")]
    pub max_in_flight: usize,
    #[serde(alias = "max_retries")]
    pub max_retries: u32,
    #[serde(alias = "retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(alias = "max_request_bytes")]
    pub max_request_bytes: usize,
    /// Extra backends registered on top of the built-in catalog
    pub services: Vec<ServiceDescriptorConfig>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            mode: ProxyMode::default(),
            api_url: None,
            api_key: None,
            model: None,
            max_tokens: None,
            temperature: None,
            proxy: None,
            server_host: DEFAULT_SERVER_HOST.to_string(),
            server_port: DEFAULT_SERVER_PORT,
            openai_base_url: None,
            openai_api_key: None,
            big_model: None,
            middle_model: None,
            small_model: None,
            expected_anthropic_api_key: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            services: Vec::new(),
        }
    }
}

/// A single problem found by [`ProxySettings::validate`]
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` is not an http(s) URL: {value}")]
    InvalidUrl { field: &'static str, value: String },

    #[error("field `{field}` is out of range: {value}")]
    OutOfRange { field: &'static str, value: String },

    #[error("field `{0}` contains surrounding whitespace")]
    UntrimmedKey(&'static str),
}

impl ProxySettings {
    pub fn is_dynamic(&self) -> bool {
        self.mode == ProxyMode::Dynamic
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Whether the secondary vendor-translation route should be mounted
    pub fn has_secondary_backend(&self) -> bool {
        self.openai_base_url.is_some() && self.openai_api_key.is_some()
    }

    /// Check the settings without modifying them, reporting every problem
    pub fn validate(&self) -> Result<(), Vec<ConfigValidationError>> {
        let mut problems = Vec::new();

        if self.mode == ProxyMode::Static {
            if self.api_url.is_none() {
                problems.push(ConfigValidationError::MissingField("apiUrl"));
            }
            if self.api_key.is_none() {
                problems.push(ConfigValidationError::MissingField("apiKey"));
            }
        }

        for (field, value) in [
            ("apiUrl", &self.api_url),
            ("openaiBaseUrl", &self.openai_base_url),
            ("proxy", &self.proxy),
        ] {
            if let Some(url) = value {
                if !is_http_url(url.trim()) {
                    problems.push(ConfigValidationError::InvalidUrl {
                        field,
                        value: url.clone(),
                    });
                }
            }
        }

        for (field, value) in [
            ("apiKey", &self.api_key),
            ("openaiApiKey", &self.openai_api_key),
            ("expectedAnthropicApiKey", &self.expected_anthropic_api_key),
        ] {
            if let Some(key) = value {
                if key.trim() != key {
                    problems.push(ConfigValidationError::UntrimmedKey(field));
                }
            }
        }

        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                problems.push(ConfigValidationError::OutOfRange {
                    field: "temperature",
                    value: temperature.to_string(),
                });
            }
        }
        if self.request_timeout_ms == 0 {
            problems.push(ConfigValidationError::OutOfRange {
                field: "requestTimeoutMs",
                value: "0".to_string(),
            });
        }
        if self.max_in_flight == 0 {
            problems.push(ConfigValidationError::OutOfRange {
                field: "maxInFlight",
                value: "0".to_string(),
            });
        }
        if self.max_retries == 0 {
            problems.push(ConfigValidationError::OutOfRange {
                field: "maxRetries",
                value: "0".to_string(),
            });
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Repair the problems that have an unambiguous fix.
    ///
    /// Returns a description of every change made; missing required fields
    /// and malformed URLs are left for the caller.
    pub fn auto_fix(&mut self) -> Vec<String> {
        let mut fixes = Vec::new();

        for (field, value) in [
            ("apiUrl", &mut self.api_url),
            ("openaiBaseUrl", &mut self.openai_base_url),
        ] {
            if let Some(url) = value {
                let fixed = url.trim().trim_end_matches('/').to_string();
                if fixed != *url {
                    fixes.push(format!("normalized {field} to {fixed}"));
                    *url = fixed;
                }
            }
        }

        for (field, value) in [
            ("apiKey", &mut self.api_key),
            ("openaiApiKey", &mut self.openai_api_key),
            ("expectedAnthropicApiKey", &mut self.expected_anthropic_api_key),
        ] {
            if let Some(key) = value {
                let trimmed = key.trim().to_string();
                if trimmed != *key {
                    fixes.push(format!("trimmed whitespace from {field}"));
                    *key = trimmed;
                }
            }
        }

        if let Some(temperature) = self.temperature {
            let clamped = temperature.clamp(0.0, 2.0);
            if (clamped - temperature).abs() > f32::EPSILON {
                fixes.push(format!("clamped temperature {temperature} to {clamped}"));
                self.temperature = Some(clamped);
            }
        }
        if self.request_timeout_ms == 0 {
            self.request_timeout_ms = DEFAULT_REQUEST_TIMEOUT_MS;
            fixes.push("reset requestTimeoutMs to default".to_string());
        }
        if self.max_in_flight == 0 {
            self.max_in_flight = DEFAULT_MAX_IN_FLIGHT;
            fixes.push("reset maxInFlight to default".to_string());
        }
        if self.max_retries == 0 {
            self.max_retries = 1;
            fixes.push("raised maxRetries to 1".to_string());
        }

        fixes
    }
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IntelligenceSettings {
    /// Capacity of the in-memory error history ring buffer
    pub history_capacity: usize,
    /// Per-subscriber queue depth between the error handler and the pipeline tasks
    pub pipeline_queue_capacity: usize,
    /// Records the coordinator analyzes and recovers at the same time
    pub pipeline_concurrency: usize,
    /// Optional JSON-lines file receiving every canonical error record
    pub error_log_path: Option<PathBuf>,
    /// Window in which identical errors are not notified twice
    pub notification_dedup_secs: u64,
    pub predictor: PredictorSettings,
    pub analyzer: AnalyzerSettings,
    pub recovery: RecoverySettings,
    pub health: HealthSettings,
}

impl Default for IntelligenceSettings {
    fn default() -> Self {
        Self {
            history_capacity: 500,
            pipeline_queue_capacity: 256,
            pipeline_concurrency: 8,
            error_log_path: None,
            notification_dedup_secs: 30,
            predictor: PredictorSettings::default(),
            analyzer: AnalyzerSettings::default(),
            recovery: RecoverySettings::default(),
            health: HealthSettings::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PredictorSettings {
    pub min_confidence: f64,
    pub dedup_secs: u64,
    pub trend_window_minutes: usize,
    pub trend_min_errors: usize,
}

impl Default for PredictorSettings {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            dedup_secs: 300,
            trend_window_minutes: 10,
            trend_min_errors: 6,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AnalyzerSettings {
    pub cache_ttl_secs: u64,
    pub max_concurrent: usize,
    pub off_hours_start: u32,
    pub off_hours_end: u32,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 30,
            max_concurrent: 4,
            off_hours_start: 22,
            off_hours_end: 6,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RecoverySettings {
    pub enabled: bool,
    pub max_attempts_per_error: u32,
    pub confirmation_timeout_secs: u64,
    /// Attempts older than this no longer count against the per-error cap
    pub attempt_reset_secs: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts_per_error: 3,
            confirmation_timeout_secs: 30,
            attempt_reset_secs: 600,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HealthSettings {
    pub enabled: bool,
    pub system_interval_secs: u64,
    pub network_interval_secs: u64,
    pub application_interval_secs: u64,
    pub process_interval_secs: u64,
    pub error_rate_interval_secs: u64,
    pub error_rate_window_secs: u64,
    pub network_endpoints: Vec<String>,
    pub network_timeout_ms: u64,
    pub alert_threshold: HealthStatus,
    pub history_capacity: usize,
    pub thresholds: HealthThresholds,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            system_interval_secs: 5,
            network_interval_secs: 30,
            application_interval_secs: 10,
            process_interval_secs: 15,
            error_rate_interval_secs: 60,
            error_rate_window_secs: 300,
            network_endpoints: vec![
                "https://api.anthropic.com".to_string(),
                "https://api.openai.com".to_string(),
                "https://www.google.com".to_string(),
            ],
            network_timeout_ms: 5_000,
            alert_threshold: HealthStatus::Critical,
            history_capacity: 120,
            thresholds: HealthThresholds::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HealthThresholds {
    pub cpu_warning_percent: f32,
    pub cpu_critical_percent: f32,
    pub memory_warning_percent: f32,
    pub memory_critical_percent: f32,
    pub process_memory_warning_mb: u64,
    pub process_memory_critical_mb: u64,
    pub network_latency_warning_ms: u64,
    pub error_rate_warning_per_min: f64,
    pub error_rate_critical_per_min: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            cpu_warning_percent: 75.0,
            cpu_critical_percent: 90.0,
            memory_warning_percent: 85.0,
            memory_critical_percent: 95.0,
            process_memory_warning_mb: 512,
            process_memory_critical_mb: 1024,
            network_latency_warning_ms: 2_000,
            error_rate_warning_per_min: 5.0,
            error_rate_critical_per_min: 20.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with default values
            .set_default("application.environment", environment.clone())?
            .set_default("proxy.mode", "dynamic")?
            .set_default("proxy.server_host", DEFAULT_SERVER_HOST)?
            .set_default("proxy.server_port", i64::from(DEFAULT_SERVER_PORT))?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Add configuration file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Add environment variables with prefix
            .add_source(Environment::with_prefix("LLM_BRIDGE").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}
