use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Supported upstream backend kinds. Adding a backend means adding a
/// variant here and one adapter under `provider/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Airtable,
    Memory,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Airtable => "airtable",
            ProviderKind::Memory => "memory",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "airtable" => Ok(ProviderKind::Airtable),
            "memory" => Ok(ProviderKind::Memory),
            other => Err(ConfigError::Config(format!(
                "Unknown provider kind: {}",
                other
            ))),
        }
    }
}

/// Immutable configuration for one gateway instance. Validated once at
/// construction; invalid values fail fast instead of at first request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub dataset_id: Option<String>,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_stale_window_secs")]
    pub stale_while_revalidate_secs: u64,

    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_circuit_breaker_enabled")]
    pub circuit_breaker_enabled: bool,

    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,

    #[serde(default = "default_breaker_cool_down_secs")]
    pub breaker_cool_down_secs: u64,
}

impl ProviderConfig {
    /// Minimal config for a given kind with all tunables at their defaults.
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            base_url: None,
            token: None,
            dataset_id: None,
            cache_ttl_secs: default_cache_ttl_secs(),
            stale_while_revalidate_secs: default_stale_window_secs(),
            cache_max_entries: default_cache_max_entries(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            circuit_breaker_enabled: default_circuit_breaker_enabled(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cool_down_secs: default_breaker_cool_down_secs(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .map_err(|_| ConfigError::Config(format!("{} not found", path.as_ref().display())))?;

        let config: ProviderConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Build entirely from `CONTENT_GATEWAY_*` environment variables.
    /// `CONTENT_GATEWAY_PROVIDER` selects the backend kind.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let kind = std::env::var("CONTENT_GATEWAY_PROVIDER")
            .map_err(|_| ConfigError::Config("CONTENT_GATEWAY_PROVIDER is not set".to_string()))?;

        let mut config = Self::new(ProviderKind::parse(&kind)?);
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("CONTENT_GATEWAY_BASE_URL") {
            self.base_url = Some(url);
        }
        if let Ok(token) = std::env::var("CONTENT_GATEWAY_TOKEN") {
            self.token = Some(token);
        }
        if let Ok(dataset) = std::env::var("CONTENT_GATEWAY_DATASET_ID") {
            self.dataset_id = Some(dataset);
        }
        if let Ok(ttl) = std::env::var("CONTENT_GATEWAY_CACHE_TTL_SECS") {
            if let Ok(val) = ttl.parse() {
                self.cache_ttl_secs = val;
            }
        }
        if let Ok(window) = std::env::var("CONTENT_GATEWAY_STALE_WINDOW_SECS") {
            if let Ok(val) = window.parse() {
                self.stale_while_revalidate_secs = val;
            }
        }
        if let Ok(attempts) = std::env::var("CONTENT_GATEWAY_RETRY_ATTEMPTS") {
            if let Ok(val) = attempts.parse() {
                self.retry_attempts = val;
            }
        }
        if let Ok(enabled) = std::env::var("CONTENT_GATEWAY_CIRCUIT_BREAKER") {
            if let Ok(val) = enabled.parse() {
                self.circuit_breaker_enabled = val;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.kind == ProviderKind::Airtable {
            let base_url = self
                .base_url
                .as_deref()
                .ok_or_else(|| ConfigError::Config("base_url is required for airtable".into()))?;

            url::Url::parse(base_url).map_err(|_| ConfigError::InvalidUrl(base_url.to_string()))?;

            if self.token.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::Config("token is required for airtable".into()));
            }
            if self.dataset_id.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::Config(
                    "dataset_id is required for airtable".into(),
                ));
            }
        }

        if self.cache_ttl_secs == 0 {
            return Err(ConfigError::Config(
                "cache_ttl_secs must be greater than 0".into(),
            ));
        }

        if self.stale_while_revalidate_secs > self.cache_ttl_secs {
            return Err(ConfigError::Config(
                "stale_while_revalidate_secs cannot exceed cache_ttl_secs".into(),
            ));
        }

        if self.cache_max_entries == 0 {
            return Err(ConfigError::Config(
                "cache_max_entries must be greater than 0".into(),
            ));
        }

        if self.retry_attempts == 0 {
            return Err(ConfigError::Config(
                "retry_attempts must be greater than 0".into(),
            ));
        }

        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::Config(
                "retry_base_delay_ms cannot exceed retry_max_delay_ms".into(),
            ));
        }

        if self.breaker_failure_threshold == 0 {
            return Err(ConfigError::Config(
                "breaker_failure_threshold must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn stale_window(&self) -> Duration {
        Duration::from_secs(self.stale_while_revalidate_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn breaker_cool_down(&self) -> Duration {
        Duration::from_secs(self.breaker_cool_down_secs)
    }
}

fn default_cache_ttl_secs() -> u64 {
    3600
}
fn default_stale_window_secs() -> u64 {
    300
}
fn default_cache_max_entries() -> usize {
    1000
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    100
}
fn default_retry_max_delay_ms() -> u64 {
    1000
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_circuit_breaker_enabled() -> bool {
    true
}
fn default_breaker_failure_threshold() -> u32 {
    5
}
fn default_breaker_cool_down_secs() -> u64 {
    30
}
