//! Configuration module for the fee sponsor service
//!
//! This module handles configuration loading from TOML files and
//! environment variables, and provides structured configuration types.

use crate::pipeline::broadcast::BroadcastConfig;
use crate::pipeline::composer::ComposerConfig;
use crate::pipeline::draft::MAX_TX_BYTES;
use crate::pipeline::exposure::DEFAULT_MAX_SPONSORED_INITS;
use crate::pipeline::flows::ProviderEndpoint;
use crate::pipeline::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const ENV_RPC_URL: &str = "FEE_SPONSOR_RPC_URL";
pub const ENV_SPONSOR_PUBKEY: &str = "FEE_SPONSOR_SPONSOR_PUBKEY";
pub const ENV_KEYPAIR_PATH: &str = "FEE_SPONSOR_KEYPAIR_PATH";
pub const ENV_SIGNER_URL: &str = "FEE_SPONSOR_SIGNER_URL";
pub const ENV_SIGNER_API_KEY: &str = "FEE_SPONSOR_SIGNER_API_KEY";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub sponsor: SponsorConfig,

    #[serde(default)]
    pub composer: ComposerSection,

    #[serde(default)]
    pub broadcast: BroadcastSection,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Monitoring and metrics
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_url")]
    pub url: String,

    /// processed, confirmed or finalized
    #[serde(default = "default_commitment")]
    pub commitment: String,

    /// Request timeout in seconds
    #[serde(default = "default_rpc_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SponsorConfig {
    /// Sponsor account; derived from the keypair file when absent
    #[serde(default)]
    pub pubkey: Option<String>,

    /// Key identifier passed to the custodial signer
    #[serde(default = "default_key_id")]
    pub key_id: String,

    /// Local keypair, used when no signing service is configured
    #[serde(default)]
    pub keypair_path: Option<String>,

    #[serde(default)]
    pub signer_url: Option<String>,

    #[serde(default)]
    pub signer_api_key: Option<String>,

    #[serde(default = "default_signer_timeout")]
    pub signer_timeout_secs: u64,

    /// Co-sign only messages drafted by this process. Leave off when `build`
    /// and `cosign` run as separate invocations.
    #[serde(default)]
    pub require_issued_draft: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposerSection {
    #[serde(default = "default_max_tx_bytes")]
    pub max_tx_bytes: usize,

    #[serde(default = "default_max_lookup_tables")]
    pub max_lookup_tables: usize,

    /// Sponsor-paid account creates allowed in one transaction
    #[serde(default = "default_max_sponsored_inits")]
    pub max_sponsored_inits: usize,

    #[serde(default = "default_lookup_table_ttl")]
    pub lookup_table_ttl_secs: u64,

    #[serde(default = "default_recency_ttl")]
    pub recency_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastSection {
    #[serde(default = "default_send_attempts")]
    pub send_attempts: u32,

    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_secs: u64,

    #[serde(default = "default_confirm_poll_interval")]
    pub confirm_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    /// Attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Minimum interval between requests to one upstream host
    #[serde(default = "default_provider_interval")]
    pub min_interval_ms: u64,

    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    /// Named provider endpoints referenced by operation requests
    #[serde(default)]
    pub endpoints: HashMap<String, ProviderEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

// Default value functions
fn default_rpc_url() -> String { "https://api.mainnet-beta.solana.com".to_string() }
fn default_commitment() -> String { "confirmed".to_string() }
fn default_rpc_timeout() -> u64 { 30 }
fn default_key_id() -> String { "sponsor".to_string() }
fn default_signer_timeout() -> u64 { 10 }
fn default_max_tx_bytes() -> usize { MAX_TX_BYTES }
fn default_max_lookup_tables() -> usize { 4 }
fn default_max_sponsored_inits() -> usize { DEFAULT_MAX_SPONSORED_INITS }
fn default_lookup_table_ttl() -> u64 { 300 }
fn default_recency_ttl() -> u64 { 180 }
fn default_send_attempts() -> u32 { 3 }
fn default_confirm_timeout() -> u64 { 30 }
fn default_confirm_poll_interval() -> u64 { 500 }
fn default_max_attempts() -> u32 { 4 }
fn default_base_backoff() -> u64 { 250 }
fn default_max_backoff() -> u64 { 5000 }
fn default_provider_interval() -> u64 { 250 }
fn default_provider_timeout() -> u64 { 10 }
fn default_metrics_port() -> u16 { 9090 }
fn default_true() -> bool { true }

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: default_rpc_url(),
            commitment: default_commitment(),
            timeout_secs: default_rpc_timeout(),
        }
    }
}

impl Default for SponsorConfig {
    fn default() -> Self {
        Self {
            pubkey: None,
            key_id: default_key_id(),
            keypair_path: None,
            signer_url: None,
            signer_api_key: None,
            signer_timeout_secs: default_signer_timeout(),
            require_issued_draft: false,
        }
    }
}

impl Default for ComposerSection {
    fn default() -> Self {
        Self {
            max_tx_bytes: default_max_tx_bytes(),
            max_lookup_tables: default_max_lookup_tables(),
            max_sponsored_inits: default_max_sponsored_inits(),
            lookup_table_ttl_secs: default_lookup_table_ttl(),
            recency_ttl_secs: default_recency_ttl(),
        }
    }
}

impl Default for BroadcastSection {
    fn default() -> Self {
        Self {
            send_attempts: default_send_attempts(),
            confirm_timeout_secs: default_confirm_timeout(),
            confirm_poll_interval_ms: default_confirm_poll_interval(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_provider_interval(),
            timeout_secs: default_provider_timeout(),
            endpoints: HashMap::new(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: default_true(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load configuration with `.env` and environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_RPC_URL) {
            self.rpc.url = url;
        }
        if let Some(pubkey) = lookup(ENV_SPONSOR_PUBKEY) {
            self.sponsor.pubkey = Some(pubkey);
        }
        if let Some(path) = lookup(ENV_KEYPAIR_PATH) {
            self.sponsor.keypair_path = Some(path);
        }
        if let Some(url) = lookup(ENV_SIGNER_URL) {
            self.sponsor.signer_url = Some(url);
        }
        if let Some(key) = lookup(ENV_SIGNER_API_KEY) {
            self.sponsor.signer_api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rpc.url.starts_with("http://") && !self.rpc.url.starts_with("https://") {
            return Err(ConfigError::invalid("rpc.url", "must be an http(s) URL"));
        }
        self.commitment()?;
        if self.rpc.timeout_secs == 0 {
            return Err(ConfigError::invalid("rpc.timeout_secs", "must be positive"));
        }

        self.sponsor_pubkey()?;
        if self.sponsor.key_id.trim().is_empty() {
            return Err(ConfigError::invalid("sponsor.key_id", "must not be empty"));
        }
        if self.sponsor.signer_url.is_none() && self.sponsor.keypair_path.is_none() {
            return Err(ConfigError::invalid(
                "sponsor",
                "either signer_url or keypair_path is required",
            ));
        }
        if self.sponsor.signer_url.is_some() && self.sponsor.pubkey.is_none() {
            return Err(ConfigError::invalid(
                "sponsor.pubkey",
                "required when a signing service is used",
            ));
        }

        if self.composer.max_tx_bytes == 0 || self.composer.max_tx_bytes > MAX_TX_BYTES {
            return Err(ConfigError::invalid(
                "composer.max_tx_bytes",
                format!("must be between 1 and {MAX_TX_BYTES}"),
            ));
        }
        if self.composer.max_sponsored_inits == 0 {
            return Err(ConfigError::invalid(
                "composer.max_sponsored_inits",
                "must be at least 1",
            ));
        }
        if self.broadcast.send_attempts == 0 {
            return Err(ConfigError::invalid("broadcast.send_attempts", "must be at least 1"));
        }
        if self.broadcast.confirm_poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "broadcast.confirm_poll_interval_ms",
                "must be positive",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::invalid(
                "retry.base_backoff_ms",
                "must not exceed max_backoff_ms",
            ));
        }
        Ok(())
    }

    pub fn commitment(&self) -> Result<CommitmentConfig, ConfigError> {
        match self.rpc.commitment.as_str() {
            "processed" => Ok(CommitmentConfig::processed()),
            "confirmed" => Ok(CommitmentConfig::confirmed()),
            "finalized" => Ok(CommitmentConfig::finalized()),
            other => Err(ConfigError::invalid(
                "rpc.commitment",
                format!("unknown commitment {other:?}"),
            )),
        }
    }

    /// Configured sponsor account, if any
    pub fn sponsor_pubkey(&self) -> Result<Option<Pubkey>, ConfigError> {
        self.sponsor
            .pubkey
            .as_deref()
            .map(|key| {
                Pubkey::from_str(key).map_err(|e| ConfigError::invalid("sponsor.pubkey", e.to_string()))
            })
            .transpose()
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc.timeout_secs)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts,
            base_backoff_ms: self.retry.base_backoff_ms,
            max_backoff_ms: self.retry.max_backoff_ms,
        }
    }

    pub fn composer_config(&self) -> ComposerConfig {
        ComposerConfig {
            max_tx_bytes: self.composer.max_tx_bytes,
            max_lookup_tables: self.composer.max_lookup_tables,
            max_sponsored_inits: self.composer.max_sponsored_inits,
        }
    }

    pub fn broadcast_config(&self) -> BroadcastConfig {
        BroadcastConfig {
            send_attempts: self.broadcast.send_attempts,
            confirm_timeout: Duration::from_secs(self.broadcast.confirm_timeout_secs),
            confirm_poll_interval: Duration::from_millis(self.broadcast.confirm_poll_interval_ms),
            retry: self.retry_config(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.composer.max_tx_bytes, 1232);
        assert_eq!(config.broadcast.send_attempts, 3);
        assert_eq!(config.retry_config(), RetryConfig::default());
        assert_eq!(config.broadcast_config(), BroadcastConfig::default());
        assert_eq!(config.composer_config(), ComposerConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let sponsor = Pubkey::new_unique();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[rpc]
url = "http://localhost:8899"
commitment = "finalized"

[sponsor]
pubkey = "{sponsor}"
signer_url = "http://signer.local/sign"

[retry]
max_attempts = 2

[providers.endpoints.router]
url = "http://router.local/swap-instructions"
api_key = "k"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.sponsor_pubkey().unwrap(), Some(sponsor));
        assert_eq!(config.commitment().unwrap(), CommitmentConfig::finalized());
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_backoff_ms, 250);
        assert_eq!(config.composer.max_sponsored_inits, DEFAULT_MAX_SPONSORED_INITS);
        assert!(!config.sponsor.require_issued_draft);
        assert_eq!(config.providers.endpoints["router"].api_key.as_deref(), Some("k"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            ENV_RPC_URL => Some("http://override:8899".to_string()),
            ENV_KEYPAIR_PATH => Some("/tmp/sponsor.json".to_string()),
            _ => None,
        });
        assert_eq!(config.rpc.url, "http://override:8899");
        assert_eq!(config.sponsor.keypair_path.as_deref(), Some("/tmp/sponsor.json"));
        assert!(config.sponsor.signer_url.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.sponsor.keypair_path = Some("/tmp/sponsor.json".into());
        config.validate().unwrap();

        let mut bad = config.clone();
        bad.rpc.commitment = "eventually".into();
        assert!(matches!(bad.validate(), Err(ConfigError::Invalid { field: "rpc.commitment", .. })));

        let mut bad = config.clone();
        bad.composer.max_tx_bytes = 5000;
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.composer.max_sponsored_inits = 0;
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.sponsor.keypair_path = None;
        assert!(bad.validate().is_err());

        let mut bad = config;
        bad.sponsor.signer_url = Some("http://signer".into());
        assert!(matches!(bad.validate(), Err(ConfigError::Invalid { field: "sponsor.pubkey", .. })));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(Config::from_toml("[rpc"), Err(ConfigError::Parse(_))));
    }
}
