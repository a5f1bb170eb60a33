//! # Engine Configuration
//!
//! The settings consumed by [`IngestionEngine`](crate::core::engine::IngestionEngine):
//! the destination topic stamped on every record, where to listen, how long a
//! single accept attempt may block, and how many lines one connection may yield
//! per poll cycle.
//!
//! Two entry points exist. Typed callers deserialize [`EngineConfig`] with serde
//! (camelCase keys, defaults for everything except `topic`). Hosts that hand over
//! connector-style flat properties use [`EngineConfig::from_props`], which
//! understands `topic`, `port`, `timeout`, `address` and `batch.size`.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default TCP port the acceptor listens on.
pub const DEFAULT_PORT: u16 = 6181;
/// Default upper bound, in milliseconds, for one blocking accept attempt.
pub const DEFAULT_ACCEPT_TIMEOUT_MS: u64 = 100;
/// Default number of lines read from one connection per poll cycle.
pub const DEFAULT_BATCH_CAP: usize = 10;
/// Default listen address (all interfaces).
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";

// Property keys understood by `EngineConfig::from_props`.
pub const TOPIC_KEY: &str = "topic";
pub const PORT_KEY: &str = "port";
pub const TIMEOUT_KEY: &str = "timeout";
pub const ADDRESS_KEY: &str = "address";
pub const BATCH_SIZE_KEY: &str = "batch.size";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration '{0}'")]
    Missing(&'static str),

    #[error("Configuration '{0}' must be a non-empty string")]
    Empty(&'static str),

    #[error("Invalid value '{value}' for configuration '{key}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Malformed listen address '{0}'")]
    InvalidAddress(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Destination topic stamped on every produced record.
    pub topic: String,
    /// IP address to bind the listening socket to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Listening port. `0` asks the OS for an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound for one accept attempt before the acceptor re-checks for termination.
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,
    /// Maximum lines consumed from a single connection in one poll cycle.
    #[serde(default = "default_batch_cap")]
    pub batch_cap: usize,
}

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_accept_timeout_ms() -> u64 {
    DEFAULT_ACCEPT_TIMEOUT_MS
}

fn default_batch_cap() -> usize {
    DEFAULT_BATCH_CAP
}

impl EngineConfig {
    /// Builds a configuration for `topic` with every other setting at its default.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            listen_address: default_listen_address(),
            port: DEFAULT_PORT,
            accept_timeout_ms: DEFAULT_ACCEPT_TIMEOUT_MS,
            batch_cap: DEFAULT_BATCH_CAP,
        }
    }

    pub fn with_listen_address(mut self, address: impl Into<String>) -> Self {
        self.listen_address = address.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_accept_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.accept_timeout_ms = timeout_ms;
        self
    }

    pub fn with_batch_cap(mut self, cap: usize) -> Self {
        self.batch_cap = cap;
        self
    }

    /// Parses connector-style properties.
    ///
    /// `topic` is required and must be non-empty. `port`, `timeout` (milliseconds),
    /// `address` and `batch.size` are optional and fall back to their defaults.
    /// Keys this engine does not know are ignored, since hosts usually pass their
    /// whole property map.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the topic is absent or empty, or if a numeric
    /// property does not parse.
    pub fn from_props(props: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let topic = props
            .get(TOPIC_KEY)
            .cloned()
            .ok_or(ConfigError::Missing(TOPIC_KEY))?;

        let mut config = Self::new(topic);

        if let Some(address) = props.get(ADDRESS_KEY) {
            config.listen_address = address.trim().to_string();
        }
        if let Some(port) = props.get(PORT_KEY) {
            config.port = parse_number(PORT_KEY, port)?;
        }
        if let Some(timeout) = props.get(TIMEOUT_KEY) {
            config.accept_timeout_ms = parse_number(TIMEOUT_KEY, timeout)?;
        }
        if let Some(batch) = props.get(BATCH_SIZE_KEY) {
            config.batch_cap = parse_number(BATCH_SIZE_KEY, batch)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the engine relies on.
    ///
    /// The listen address is not resolved here; a malformed address
    /// surfaces when the engine starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.is_empty() {
            return Err(ConfigError::Empty(TOPIC_KEY));
        }
        if self.accept_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: TIMEOUT_KEY,
                value: "0".to_string(),
                reason: "accept timeout must be at least 1 ms".to_string(),
            });
        }
        if self.batch_cap == 0 {
            return Err(ConfigError::InvalidValue {
                key: BATCH_SIZE_KEY,
                value: "0".to_string(),
                reason: "batch cap must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// The socket address the acceptor binds to.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .listen_address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.listen_address.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }
}

fn parse_number<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_from_props() {
        let config = EngineConfig::from_props(&props(&[("topic", "metrics")])).unwrap();
        assert_eq!(config.topic, "metrics");
        assert_eq!(config.port, 6181);
        assert_eq!(config.accept_timeout_ms, 100);
        assert_eq!(config.batch_cap, 10);
        assert_eq!(config.listen_address, "0.0.0.0");
    }

    #[test]
    fn test_props_override_defaults() {
        let config = EngineConfig::from_props(&props(&[
            ("topic", "metrics"),
            ("port", "7000"),
            ("timeout", "250"),
            ("address", "127.0.0.1"),
            ("batch.size", "25"),
            ("connector.class", "ignored"),
        ]))
        .unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.accept_timeout_ms, 250);
        assert_eq!(config.listen_address, "127.0.0.1");
        assert_eq!(config.batch_cap, 25);
    }

    #[test]
    fn test_topic_is_required_and_non_empty() {
        assert_eq!(
            EngineConfig::from_props(&props(&[("port", "7000")])),
            Err(ConfigError::Missing("topic"))
        );
        assert_eq!(
            EngineConfig::from_props(&props(&[("topic", "")])),
            Err(ConfigError::Empty("topic"))
        );
    }

    #[test]
    fn test_nonsensical_port_is_rejected() {
        let err = EngineConfig::from_props(&props(&[("topic", "t"), ("port", "70000")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "port", .. }));

        let err = EngineConfig::from_props(&props(&[("topic", "t"), ("port", "abc")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "port", .. }));
    }

    #[test]
    fn test_zero_cap_and_timeout_are_rejected() {
        assert!(EngineConfig::new("t").with_batch_cap(0).validate().is_err());
        assert!(EngineConfig::new("t").with_accept_timeout_ms(0).validate().is_err());
    }

    #[test]
    fn test_serde_camel_case_with_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"topic":"ticks","acceptTimeoutMs":50}"#).unwrap();
        assert_eq!(config.topic, "ticks");
        assert_eq!(config.accept_timeout_ms, 50);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.batch_cap, DEFAULT_BATCH_CAP);
    }

    #[test]
    fn test_socket_addr() {
        let config = EngineConfig::new("t").with_listen_address("127.0.0.1").with_port(9000);
        assert_eq!(config.socket_addr().unwrap(), "127.0.0.1:9000".parse().unwrap());

        let bad = EngineConfig::new("t").with_listen_address("not-an-ip");
        assert_eq!(
            bad.socket_addr(),
            Err(ConfigError::InvalidAddress("not-an-ip".to_string()))
        );
    }
}
