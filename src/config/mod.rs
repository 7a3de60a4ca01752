//! Runtime configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) yields a working
//! configuration:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:7400"
//!
//! [cache]
//! max_size = 1000
//! default_ttl_secs = 300
//! strategy = "both"
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 1000
//! backoff_factor = 2.0
//!
//! [rate_limit]
//! requests_per_window = 60
//! window_secs = 60
//!
//! [auth]
//! ttl_secs = 300
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{CacheConfig, EvictionStrategy};
use crate::retry::RetryPolicy;
use crate::security::{DEFAULT_BYPASS, RateLimitConfig};

/// Errors produced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub cache: CacheSettings,
    pub retry: RetrySettings,
    pub rate_limit: RateLimitSettings,
    pub auth: AuthSettings,
}

impl Settings {
    /// Parses and validates settings from a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(s)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.backoff_factor must be >= 1.0, got {}",
                self.retry.backoff_factor
            )));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.window_secs must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7400".to_owned()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// `0` disables expiry.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default)]
    pub strategy: EvictionStrategy,
    #[serde(default = "default_sweep_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_size() -> usize {
    1000
}
fn default_ttl_secs() -> u64 {
    300
}
fn default_sweep_secs() -> u64 {
    60
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            default_ttl_secs: default_ttl_secs(),
            strategy: EvictionStrategy::default(),
            sweep_interval_secs: default_sweep_secs(),
        }
    }
}

impl CacheSettings {
    pub fn to_config(&self) -> CacheConfig {
        CacheConfig {
            max_size: self.max_size,
            default_ttl: (self.default_ttl_secs > 0)
                .then(|| Duration::from_secs(self.default_ttl_secs)),
            strategy: self.strategy,
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Overall budget per call, retries included.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            timeout_ms: None,
        }
    }
}

impl RetrySettings {
    /// Builds the per-attempt policy. The overall timeout is applied per call,
    /// see [`timeout`](Self::timeout).
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            self.backoff_factor,
        )
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_requests_per_window() -> u32 {
    60
}
fn default_window_secs() -> u64 {
    60
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            window_secs: default_window_secs(),
        }
    }
}

impl RateLimitSettings {
    pub fn to_config(&self) -> RateLimitConfig {
        RateLimitConfig::new(self.requests_per_window, Duration::from_secs(self.window_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default = "default_auth_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_bypass")]
    pub bypass: Vec<String>,
}

fn default_auth_ttl_secs() -> u64 {
    300
}
fn default_bypass() -> Vec<String> {
    DEFAULT_BYPASS.iter().map(|m| (*m).to_owned()).collect()
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_auth_ttl_secs(),
            bypass: default_bypass(),
        }
    }
}

impl AuthSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.server.bind, "127.0.0.1:7400");
        assert_eq!(settings.rate_limit.to_config(), RateLimitConfig::per_minute(60));
        assert_eq!(settings.auth.bypass, vec!["initialize", "ping", "tools/list"]);

        let cache = settings.cache.to_config();
        assert_eq!(cache.max_size, 1000);
        assert_eq!(cache.default_ttl, Some(Duration::from_secs(300)));
        assert_eq!(cache.strategy, EvictionStrategy::Both);
    }

    #[test]
    fn partial_sections_fill_in_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [cache]
            max_size = 50
            default_ttl_secs = 0
            strategy = "lru"

            [retry]
            max_retries = 5

            [rate_limit]
            requests_per_window = 2
            "#,
        )
        .unwrap();

        let cache = settings.cache.to_config();
        assert_eq!(cache.max_size, 50);
        assert_eq!(cache.default_ttl, None);
        assert_eq!(cache.strategy, EvictionStrategy::Lru);

        let policy = settings.retry.to_policy();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert!(policy.deadline.is_none());
        assert_eq!(settings.retry.timeout(), None);

        assert_eq!(settings.rate_limit.requests_per_window, 2);
        assert_eq!(settings.rate_limit.window_secs, 60);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = Settings::from_toml_str("[retry]\nbackoff_factor = 0.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Settings::from_toml_str("[rate_limit]\nwindow_secs = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Settings::from_toml_str("[cache]\nmax_size = \"lots\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Settings::load("/definitely/not/here.toml").unwrap_err();
        match err {
            ConfigError::Read { path, .. } => assert!(path.ends_with("here.toml")),
            other => panic!("expected Read error, got {other:?}"),
        }
    }
}
