//! # Bus Configuration
//!
//! Construction-time settings for an [`crate::EventBus`].
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `BUS_REDIS_URL` | - | Single-node broker URL |
//! | `BUS_CLUSTER_NODES` | - | Comma-separated cluster node URLs |
//! | `BUS_SIGNING_KEY` | - | Shared HMAC secret (required) |
//! | `BUS_SERVICE_NAME` | - | Producer name stamped on envelopes |
//! | `BUS_MAX_PAYLOAD_BYTES` | `1048576` | Publish size limit |
//! | `BUS_MAX_RETRIES` | `3` | Handler attempts before dead-lettering |
//! | `BUS_AUTO_CONNECT` | `true` | Connect during construction |
//! | `BUS_EXIT_ON_STARTUP_FAILURE` | `true` | Fail construction if the connect fails |
//! | `BUS_SHUTDOWN_TIMEOUT_MS` | `10000` | Consumer drain deadline |
//!
//! Exactly one of `BUS_REDIS_URL` and `BUS_CLUSTER_NODES` must be set.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::streams::StreamRegistry;
use crate::transport::ReconnectPolicy;

/// Default publish size limit (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Default number of handler attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default consumer drain deadline.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Signing key is required (set BUS_SIGNING_KEY)")]
    MissingSigningKey,

    #[error("BUS_REDIS_URL and BUS_CLUSTER_NODES are mutually exclusive")]
    ConflictingTargets,

    #[error("Either BUS_REDIS_URL or BUS_CLUSTER_NODES is required")]
    MissingTarget,

    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

/// Where the broker lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerTarget {
    Single(String),
    Cluster(Vec<String>),
}

/// Complete bus configuration.
#[derive(Clone)]
pub struct BusConfig {
    /// Single-node broker URL.
    pub redis_url: Option<String>,
    /// Cluster node URLs.
    pub cluster_nodes: Vec<String>,
    /// Shared HMAC secret.
    pub signing_key: String,
    /// Producer name stamped on envelopes.
    pub service_name: Option<String>,
    pub max_payload_bytes: usize,
    /// Handler attempts before an entry is dead-lettered.
    pub max_retries: u32,
    pub auto_connect: bool,
    pub exit_on_startup_failure: bool,
    pub shutdown_timeout: Duration,
    pub publish_breaker: CircuitBreakerConfig,
    pub consumer_breaker: CircuitBreakerConfig,
    pub reconnect: ReconnectPolicy,
    pub streams: StreamRegistry,
}

impl fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConfig")
            .field("redis_url", &self.redis_url)
            .field("cluster_nodes", &self.cluster_nodes)
            .field("signing_key", &"<redacted>")
            .field("service_name", &self.service_name)
            .field("max_payload_bytes", &self.max_payload_bytes)
            .field("max_retries", &self.max_retries)
            .field("auto_connect", &self.auto_connect)
            .field("exit_on_startup_failure", &self.exit_on_startup_failure)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            cluster_nodes: Vec::new(),
            signing_key: String::new(),
            service_name: None,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_retries: DEFAULT_MAX_RETRIES,
            auto_connect: true,
            exit_on_startup_failure: true,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            publish_breaker: CircuitBreakerConfig::default(),
            consumer_breaker: CircuitBreakerConfig::default(),
            reconnect: ReconnectPolicy::default(),
            streams: StreamRegistry::with_defaults(),
        }
    }
}

impl BusConfig {
    /// Defaults with the given signing key and no broker target.
    pub fn new(signing_key: impl Into<String>) -> Self {
        Self {
            signing_key: signing_key.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults; malformed ones are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        config.redis_url = var("BUS_REDIS_URL");
        if let Some(nodes) = var("BUS_CLUSTER_NODES") {
            config.cluster_nodes = nodes
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(key) = var("BUS_SIGNING_KEY") {
            config.signing_key = key;
        }
        config.service_name = var("BUS_SERVICE_NAME");

        if let Some(v) = var("BUS_MAX_PAYLOAD_BYTES") {
            config.max_payload_bytes = parse("BUS_MAX_PAYLOAD_BYTES", &v)?;
        }
        if let Some(v) = var("BUS_MAX_RETRIES") {
            config.max_retries = parse("BUS_MAX_RETRIES", &v)?;
        }
        if let Some(v) = var("BUS_AUTO_CONNECT") {
            config.auto_connect = parse_bool("BUS_AUTO_CONNECT", &v)?;
        }
        if let Some(v) = var("BUS_EXIT_ON_STARTUP_FAILURE") {
            config.exit_on_startup_failure = parse_bool("BUS_EXIT_ON_STARTUP_FAILURE", &v)?;
        }
        if let Some(v) = var("BUS_SHUTDOWN_TIMEOUT_MS") {
            config.shutdown_timeout =
                Duration::from_millis(parse("BUS_SHUTDOWN_TIMEOUT_MS", &v)?);
        }

        Ok(config)
    }

    /// Check the settings every bus needs regardless of transport.
    ///
    /// # Errors
    ///
    /// - `MissingSigningKey` - the key is empty
    /// - `ConflictingTargets` - both a URL and cluster nodes are set
    /// - `InvalidValue` - a zero retry count or payload limit
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signing_key.is_empty() {
            return Err(ConfigError::MissingSigningKey);
        }
        if self.redis_url.is_some() && !self.cluster_nodes.is_empty() {
            return Err(ConfigError::ConflictingTargets);
        }
        if self.max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                name: "max_retries",
                value: "0".into(),
            });
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                name: "max_payload_bytes",
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// The broker to connect to.
    pub fn broker_target(&self) -> Result<BrokerTarget, ConfigError> {
        match (&self.redis_url, self.cluster_nodes.is_empty()) {
            (Some(_), false) => Err(ConfigError::ConflictingTargets),
            (Some(url), true) => Ok(BrokerTarget::Single(url.clone())),
            (None, false) => Ok(BrokerTarget::Cluster(self.cluster_nodes.clone())),
            (None, true) => Err(ConfigError::MissingTarget),
        }
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn with_cluster_nodes(mut self, nodes: Vec<String>) -> Self {
        self.cluster_nodes = nodes;
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn with_streams(mut self, streams: StreamRegistry) -> Self {
        self.streams = streams;
        self
    }
}

fn parse<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
    })
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        }),
    }
}
