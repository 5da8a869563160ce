//! TOML-backed configuration with per-field serde defaults.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::transport::backoff::RetryPolicy;
use crate::transport::breaker::BreakerConfig;

/// Root configuration for one agent process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub breaker: BreakerSettings,
    pub cache: CacheConfig,
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// Identity of this agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Opaque URN-like identifier other agents address envelopes to.
    pub id: String,
    pub name: String,
    pub version: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: "urn:asap:agent:local".to_string(),
            name: "asap-agent".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Outbound call tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub jitter: bool,
    /// Per-attempt request timeout.
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 0.5,
            max_delay_secs: 30.0,
            jitter: true,
            request_timeout_secs: 30,
        }
    }
}

impl ClientConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_secs: self.base_delay_secs,
            max_delay_secs: self.max_delay_secs,
            jitter: self.jitter,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Circuit breaker tuning shared across all targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_secs: 60,
        }
    }
}

impl BreakerSettings {
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            open_timeout: Duration::from_secs(self.open_timeout_secs),
        }
    }
}

/// Inbound server tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Sync handler pool ceiling; `None` means `min(32, cpus + 4)`.
    pub max_sync_threads: Option<usize>,
    pub max_body_bytes: usize,
    pub request_timeout_secs: u64,
    /// `max-age` advertised with the served manifest.
    pub manifest_max_age_secs: u64,
    /// Streaming: messages per second per connection.
    pub stream_rate: f64,
    /// Streaming: burst capacity per connection.
    pub stream_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8040".to_string(),
            max_sync_threads: None,
            max_body_bytes: 65_536,
            request_timeout_secs: 30,
            manifest_max_age_secs: 300,
            stream_rate: 10.0,
            stream_burst: 20.0,
        }
    }
}

/// Manifest cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 128,
            default_ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}
