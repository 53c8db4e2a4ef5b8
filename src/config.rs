//! Configuration management for the CARF pipeline.
//!
//! Supports loading from environment variables, config files, and CLI arguments.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    Missing(&'static str),

    #[error("Invalid configuration for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Data provider selection and credentials
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Retry, backoff and rate limiting
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// Threshold, exchange rate and timezone
    pub reporting: ReportingConfig,

    /// Pseudonymization salt and key location
    pub privacy: PrivacyConfig,

    /// Output directory paths
    #[serde(default)]
    pub paths: PathConfig,
}

/// Closed set of supported data providers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Blockchain.com explorer API (Bitcoin, satoshi base units)
    #[default]
    BlockchainCom,
    /// Blockbook explorer API (Ethereum, wei base units)
    Blockbook,
}

impl std::str::FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "blockchain_com" | "blockchain.com" | "blockchain" => Ok(Self::BlockchainCom),
            "blockbook" => Ok(Self::Blockbook),
            other => Err(ConfigError::Invalid {
                field: "provider",
                reason: format!("unknown provider '{}'", other),
            }),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::BlockchainCom => write!(f, "blockchain.com"),
            ProviderKind::Blockbook => write!(f, "blockbook"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,

    /// API credential, appended as a query parameter where the provider takes one
    #[serde(default)]
    pub api_key: Option<String>,

    /// Custom endpoint overriding the provider default
    #[serde(default)]
    pub base_url: Option<String>,

    /// Fail at startup when no credential is configured
    #[serde(default)]
    pub require_api_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum attempts per request (first try included)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Minimum delay between consecutive outbound requests (ms)
    #[serde(default = "default_min_request_delay_ms")]
    pub min_request_delay_ms: u64,

    /// Base delay for exponential backoff (ms)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for a single backoff delay (ms)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Per-request network timeout (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum concurrent per-address fetches in a batch search
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            min_request_delay_ms: default_min_request_delay_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportingConfig {
    /// Reporting threshold in reporting-currency units (inclusive)
    pub threshold: f64,

    /// Reporting-currency units per native unit
    #[serde(default = "default_exchange_rate")]
    pub exchange_rate: f64,

    /// IANA timezone identifier used for `timestamp_local`
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Reporting currency code, informational only
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            exchange_rate: default_exchange_rate(),
            timezone: default_timezone(),
            currency: default_currency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyConfig {
    /// Pseudonymization salt; one salt defines one pseudonym epoch
    pub salt: String,

    /// Location of the symmetric key file
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_audit_dir")]
    pub audit_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            audit_dir: default_audit_dir(),
        }
    }
}

// Default value functions
fn default_max_retries() -> u32 {
    3
}

fn default_min_request_delay_ms() -> u64 {
    500
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    4
}

fn default_threshold() -> f64 {
    10_000.0 // HMRC CARF threshold, GBP
}

fn default_exchange_rate() -> f64 {
    1800.0
}

fn default_timezone() -> String {
    "Europe/London".to_string()
}

fn default_currency() -> String {
    "GBP".to_string()
}

fn default_key_path() -> PathBuf {
    PathBuf::from("vault/encryption_key.key")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_audit_dir() -> PathBuf {
    PathBuf::from("data/audit")
}

impl ReportingConfig {
    /// Resolve the configured timezone identifier.
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::Invalid {
                field: "reporting.timezone",
                reason: format!("unknown timezone '{}'", self.timezone),
            })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "reporting.threshold",
                reason: format!("must be a positive amount, got {}", self.threshold),
            });
        }
        if !self.exchange_rate.is_finite() || self.exchange_rate <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "reporting.exchange_rate",
                reason: format!("must be a positive rate, got {}", self.exchange_rate),
            });
        }
        self.tz()?;
        Ok(())
    }
}

impl PipelineConfig {
    /// Build a config from explicit values with defaults everywhere else.
    pub fn new(salt: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            provider: ProviderConfig::default(),
            rate_limits: RateLimitConfig::default(),
            reporting: ReportingConfig::default(),
            privacy: PrivacyConfig {
                salt: salt.into(),
                key_path: key_path.into(),
            },
            paths: PathConfig::default(),
        }
    }

    /// Load configuration from environment
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let salt = std::env::var("PSEUDONYMIZATION_SALT")
            .map_err(|_| ConfigError::Missing("PSEUDONYMIZATION_SALT"))?;

        let mut config = Self::new(
            salt,
            std::env::var("ENCRYPTION_KEY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_key_path()),
        );
        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load from a TOML config file with environment overrides
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = ::toml::from_str(&contents)?;

        // Environment variables override file settings
        if let Ok(salt) = std::env::var("PSEUDONYMIZATION_SALT") {
            config.privacy.salt = salt;
        }
        if let Ok(key_path) = std::env::var("ENCRYPTION_KEY_PATH") {
            config.privacy.key_path = PathBuf::from(key_path);
        }
        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(kind) = std::env::var("CARF_PROVIDER") {
            self.provider.kind = kind.parse()?;
        }
        if let Ok(key) = std::env::var("CARF_API_KEY") {
            self.provider.api_key = Some(key).filter(|k| !k.trim().is_empty());
        }
        if let Ok(url) = std::env::var("CARF_BASE_URL") {
            self.provider.base_url = Some(url);
        }
        if let Some(threshold) = env_parse("CARF_THRESHOLD")? {
            self.reporting.threshold = threshold;
        }
        if let Some(rate) = env_parse("CARF_EXCHANGE_RATE")? {
            self.reporting.exchange_rate = rate;
        }
        if let Ok(tz) = std::env::var("CARF_TIMEZONE") {
            self.reporting.timezone = tz;
        }
        if let Some(retries) = env_parse("CARF_MAX_RETRIES")? {
            self.rate_limits.max_retries = retries;
        }
        if let Some(delay) = env_parse("CARF_MIN_REQUEST_DELAY_MS")? {
            self.rate_limits.min_request_delay_ms = delay;
        }
        Ok(())
    }

    /// Reject configurations the pipeline cannot start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.privacy.salt.trim().is_empty() {
            return Err(ConfigError::Missing("privacy.salt"));
        }
        if self.provider.require_api_key
            && self.provider.api_key.as_deref().map_or(true, |k| k.trim().is_empty())
        {
            return Err(ConfigError::Missing("provider.api_key"));
        }
        if self.rate_limits.max_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "rate_limits.max_retries",
                reason: "must allow at least one attempt".to_string(),
            });
        }
        if self.rate_limits.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "rate_limits.request_timeout_secs",
                reason: "network operations need a bounded, non-zero timeout".to_string(),
            });
        }
        self.reporting.validate()
    }

    /// Ensure all output directories exist
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.paths.data_dir)?;
        std::fs::create_dir_all(&self.paths.audit_dir)?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                field: name,
                reason: format!("cannot parse '{}'", raw),
            }),
        Err(_) => Ok(None),
    }
}
