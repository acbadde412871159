//! Configuration management for the recorder service.
//!
//! Configuration is read from an optional file and overridden by environment
//! variables, then validated before any component is built.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the recorder service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Remote API configuration
    pub api: ApiConfig,
    /// Access-token lifecycle
    #[serde(default)]
    pub token: TokenConfig,
    /// Live-status polling
    pub polling: PollingConfig,
    /// Outbound request rate limit
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Storage candidates for capture output
    pub storage: StorageConfig,
    /// External capture process
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Metrics port (0 disables the exporter)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for daily-rotated log files
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Remote status/identity/token endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Client identifier sent with every request
    pub client_id: String,
    /// Client secret used for the client-credentials grant
    pub client_secret: String,
    /// Base URL of the status and identity endpoints
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Token endpoint URL
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Timeout for status and identity calls in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Timeout for token calls in seconds
    #[serde(default = "default_token_timeout_secs")]
    pub token_timeout_secs: u64,
    /// Maximum number of account IDs per status call
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

/// Access-token lifecycle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Forced refresh interval in seconds
    #[serde(default = "default_token_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Delay between failed token requests in seconds
    #[serde(default = "default_token_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

/// Live-status polling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    /// Delay between poll cycles in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,
    /// Additional delay after an abandoned cycle in seconds
    #[serde(default = "default_error_delay_secs")]
    pub error_delay_secs: u64,
    /// Watched accounts: numeric IDs or login names
    pub accounts: Vec<String>,
}

/// Sliding-window rate limit for outbound API calls
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests admitted per period
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    /// Window length in seconds
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
}

/// A storage location with its required free space
#[derive(Debug, Clone, Deserialize)]
pub struct StorageCandidateConfig {
    /// Root directory for recordings
    pub path: PathBuf,
    /// Free space that must remain available, in GiB
    pub required_free_space_gb: u64,
}

/// Storage selection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Candidates in order of preference
    pub candidates: Vec<StorageCandidateConfig>,
    /// Delay before rescanning when no candidate qualifies, in seconds
    #[serde(default = "default_storage_retry_interval_secs")]
    pub retry_interval_secs: u64,
    /// Extension of capture files
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
}

/// External capture process configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Program to execute
    #[serde(default = "default_capture_program")]
    pub program: String,
    /// Argument template; `{channel}` and `{output}` are substituted
    #[serde(default = "default_capture_args")]
    pub args: Vec<String>,
    /// Delay before a finished account becomes eligible again, in seconds
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Maximum number of captures running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a writer waits on a locked database, in seconds
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

// Default value functions
fn default_service_name() -> String {
    "live-recorder".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_api_base_url() -> String {
    "https://api.twitch.tv/helix".to_string()
}

fn default_token_url() -> String {
    "https://id.twitch.tv/oauth2/token".to_string()
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_token_timeout_secs() -> u64 {
    30
}

/// Most account IDs the status endpoint accepts in one request.
pub const MAX_STATUS_BATCH: usize = 100;

fn default_max_batch_size() -> usize {
    MAX_STATUS_BATCH
}

fn default_token_refresh_interval_secs() -> u64 {
    3600
}

fn default_token_retry_delay_secs() -> u64 {
    60
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_error_delay_secs() -> u64 {
    15
}

fn default_max_requests() -> usize {
    1
}

fn default_period_secs() -> u64 {
    5
}

fn default_storage_retry_interval_secs() -> u64 {
    600 // 10 minutes
}

fn default_file_extension() -> String {
    "mp4".to_string()
}

fn default_capture_program() -> String {
    "streamlink".to_string()
}

fn default_capture_args() -> Vec<String> {
    [
        "--twitch-disable-ads",
        "twitch.tv/{channel}",
        "best",
        "--ringbuffer-size",
        "128M",
        "-o",
        "{output}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_cooldown_secs() -> u64 {
    5
}

fn default_max_concurrent() -> usize {
    16
}

fn default_database_url() -> String {
    "sqlite://streams.db".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout_secs() -> u64 {
    10
}

fn default_run_migrations() -> bool {
    true
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            directory: None,
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_token_refresh_interval_secs(),
            retry_delay_secs: default_token_retry_delay_secs(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            period_secs: default_period_secs(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            program: default_capture_program(),
            args: default_capture_args(),
            cooldown_secs: default_cooldown_secs(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            busy_timeout_secs: default_busy_timeout_secs(),
            run_migrations: default_run_migrations(),
        }
    }
}

impl Config {
    /// Load configuration from config files and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/recorder.{toml,yaml,json}`
    /// 2. `/etc/live-recorder/recorder.{toml,yaml,json}`
    /// 3. Environment variables, e.g. `RECORDER__API__CLIENT_ID`
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/recorder").required(false))
            .add_source(config::File::with_name("/etc/live-recorder/recorder").required(false))
            .add_source(
                config::Environment::with_prefix("RECORDER")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("polling.accounts")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.api.client_id.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("api.client_id".to_string()));
        }
        if self.api.client_secret.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "api.client_secret".to_string(),
            ));
        }
        if self.api.max_batch_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.max_batch_size".to_string(),
                message: "Batch size must be greater than 0".to_string(),
            });
        }
        if self.api.max_batch_size > MAX_STATUS_BATCH {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.max_batch_size".to_string(),
                message: format!("Batch size must be at most {}", MAX_STATUS_BATCH),
            });
        }

        if self.polling.accounts.iter().all(|a| a.trim().is_empty()) {
            return Err(ConfigValidationError::MissingField(
                "polling.accounts".to_string(),
            ));
        }

        if self.rate_limit.max_requests == 0 || self.rate_limit.period_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "rate_limit".to_string(),
                message: "max_requests and period_secs must be greater than 0".to_string(),
            });
        }

        if self.storage.candidates.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.candidates".to_string(),
            ));
        }

        if self.capture.program.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("capture.program".to_string()));
        }
        if !self.capture.args.iter().any(|a| a.contains("{output}")) {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.args".to_string(),
                message: "Arguments must contain the {output} placeholder".to_string(),
            });
        }
        if self.capture.max_concurrent == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.max_concurrent".to_string(),
                message: "Concurrency limit must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl ApiConfig {
    /// Get the status/identity request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Get the token request timeout as Duration.
    pub fn token_timeout(&self) -> Duration {
        Duration::from_secs(self.token_timeout_secs)
    }
}

impl TokenConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn error_delay(&self) -> Duration {
        Duration::from_secs(self.error_delay_secs)
    }
}

impl RateLimitConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

impl StorageConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

impl CaptureConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
