use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::sync::rate_limit::{
    BucketBudget, INBOUND_EVENTS_BUCKET, PAYMENT_PROCESSING_BUCKET, PROVIDER_API_BUCKET,
};
use crate::sync::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub web: WebConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required on /admin routes.
    pub admin_token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Base URL of the external bookings/payments provider API. Empty means
    /// "not configured": outbound mirroring and reconciliation are disabled.
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_token: String,
    /// Provider-side location the bookings belong to.
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_token: String::new(),
            location_id: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl ProviderConfig {
    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.api_token.is_empty()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.max(1),
            ..RetryPolicy::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

impl DatabaseConfig {
    pub fn sqlite_path(&self) -> Option<String> {
        if let Some(ref url) = self.url {
            return url.strip_prefix("sqlite://").map(ToOwned::to_owned);
        }
        self.filename.clone()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Width of the default reconciliation window when no range is requested.
    #[serde(default = "default_reconcile_window_days")]
    pub reconcile_window_days: i64,
    #[serde(default = "default_audit_retention_days")]
    pub audit_retention_days: i64,
    #[serde(default = "default_booking_cache_ttl_secs")]
    pub booking_cache_ttl_secs: u64,
    #[serde(default = "default_payment_cache_ttl_secs")]
    pub payment_cache_ttl_secs: u64,
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval_secs(),
            reconcile_window_days: default_reconcile_window_days(),
            audit_retention_days: default_audit_retention_days(),
            booking_cache_ttl_secs: default_booking_cache_ttl_secs(),
            payment_cache_ttl_secs: default_payment_cache_ttl_secs(),
            event_queue_depth: default_event_queue_depth(),
            rate_limits: RateLimitsConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn booking_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.booking_cache_ttl_secs)
    }

    pub fn payment_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.payment_cache_ttl_secs)
    }

    /// Budgets keyed by operation-class bucket for the rate limiter.
    pub fn bucket_budgets(&self) -> HashMap<String, BucketBudget> {
        let mut budgets = HashMap::new();
        budgets.insert(PROVIDER_API_BUCKET.to_string(), self.rate_limits.provider_api.budget());
        budgets.insert(
            PAYMENT_PROCESSING_BUCKET.to_string(),
            self.rate_limits.payment_processing.budget(),
        );
        budgets.insert(
            INBOUND_EVENTS_BUCKET.to_string(),
            self.rate_limits.inbound_events.budget(),
        );
        budgets
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitsConfig {
    #[serde(default = "default_provider_api_bucket")]
    pub provider_api: BucketConfig,
    #[serde(default = "default_payment_processing_bucket")]
    pub payment_processing: BucketConfig,
    #[serde(default = "default_inbound_events_bucket")]
    pub inbound_events: BucketConfig,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            provider_api: default_provider_api_bucket(),
            payment_processing: default_payment_processing_bucket(),
            inbound_events: default_inbound_events_bucket(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BucketConfig {
    pub limit: u32,
    pub window_secs: u64,
}

impl BucketConfig {
    pub fn budget(&self) -> BucketBudget {
        BucketBudget {
            limit: self.limit,
            window: Duration::from_secs(self.window_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    pub fn load(path_override: Option<&str>) -> Result<Self, ConfigError> {
        let config_path = path_override
            .map(ToOwned::to_owned)
            .or_else(|| std::env::var("CONFIG_PATH").ok())
            .unwrap_or_else(|| "config.yaml".to_string());

        Self::load_from_file(&config_path)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.web.admin_token.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "web.admin_token cannot be empty".to_string(),
            ));
        }

        if self.web.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "web.port must be between 1 and 65535".to_string(),
            ));
        }

        if self.database.sqlite_path().is_none() {
            return Err(ConfigError::InvalidConfig(
                "database.filename or a sqlite:// database.url is required".to_string(),
            ));
        }

        if !self.provider.base_url.is_empty() {
            url::Url::parse(&self.provider.base_url).map_err(|e| {
                ConfigError::InvalidConfig(format!("provider.base_url is not a valid URL: {e}"))
            })?;
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("STUDIO_SYNC_PROVIDER_BASE_URL") {
            self.provider.base_url = value;
        }
        if let Ok(value) = std::env::var("STUDIO_SYNC_PROVIDER_API_TOKEN") {
            self.provider.api_token = value;
        }
        if let Ok(value) = std::env::var("STUDIO_SYNC_ADMIN_TOKEN") {
            self.web.admin_token = value;
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8470
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_reconcile_interval_secs() -> u64 {
    900
}

fn default_reconcile_window_days() -> i64 {
    7
}

fn default_audit_retention_days() -> i64 {
    30
}

fn default_booking_cache_ttl_secs() -> u64 {
    300
}

fn default_payment_cache_ttl_secs() -> u64 {
    120
}

fn default_event_queue_depth() -> usize {
    256
}

fn default_provider_api_bucket() -> BucketConfig {
    BucketConfig {
        limit: 60,
        window_secs: 60,
    }
}

fn default_payment_processing_bucket() -> BucketConfig {
    BucketConfig {
        limit: 30,
        window_secs: 60,
    }
}

fn default_inbound_events_bucket() -> BucketConfig {
    BucketConfig {
        limit: 120,
        window_secs: 60,
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
