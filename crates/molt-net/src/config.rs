//! Server configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::NetError;
use crate::gossip::DEFAULT_PEER_REQUEST;

/// Configuration for a [`Server`](crate::Server).
///
/// Deserializes from JSON; every field is optional and falls back to its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to listen on.
    pub bind_host: String,
    /// Port to listen on. 0 picks a free port.
    pub port: u16,
    /// Timeout for outbound dials and liveness probes, in milliseconds.
    pub dial_timeout_ms: u64,
    /// Deadline for each read and write on accepted connections, in milliseconds.
    /// `None` lets a silent peer hold its handler task open indefinitely.
    pub io_timeout_ms: Option<u64>,
    /// Upper bound on concurrently running handler tasks. `None` is unbounded.
    /// Zero is rejected by [`validate`](Self::validate).
    pub max_concurrent_handlers: Option<usize>,
    /// Number of peers asked for during bootstrap discovery.
    pub peer_request_count: u8,
    /// Ping announced addresses before adding them to the book.
    pub verify_announcements: bool,
    /// Seed for the address book's random choices.
    pub rng_seed: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 0,
            dial_timeout_ms: 5_000,
            io_timeout_ms: Some(30_000),
            max_concurrent_handlers: None,
            peer_request_count: DEFAULT_PEER_REQUEST,
            verify_announcements: false,
            rng_seed: None,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration listening on `port` with defaults elsewhere.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Parses and validates a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, NetError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| NetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would leave a server unable to work.
    pub fn validate(&self) -> Result<(), NetError> {
        if self.max_concurrent_handlers == Some(0) {
            return Err(NetError::Config(
                "max_concurrent_handlers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Sets the interface to listen on.
    #[must_use]
    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Sets the dial timeout.
    #[must_use]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout_ms = duration_ms(timeout);
        self
    }

    /// Sets or clears the per-operation deadline on accepted connections.
    #[must_use]
    pub fn with_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout_ms = timeout.map(duration_ms);
        self
    }

    /// Bounds the number of concurrently running handler tasks.
    #[must_use]
    pub const fn with_max_concurrent_handlers(mut self, max: usize) -> Self {
        self.max_concurrent_handlers = Some(max);
        self
    }

    /// Sets the number of peers requested during discovery.
    #[must_use]
    pub const fn with_peer_request_count(mut self, count: u8) -> Self {
        self.peer_request_count = count;
        self
    }

    /// Enables or disables pinging announced addresses.
    #[must_use]
    pub const fn with_verify_announcements(mut self, verify: bool) -> Self {
        self.verify_announcements = verify;
        self
    }

    /// Makes the address book's random choices reproducible.
    #[must_use]
    pub const fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Returns the dial timeout.
    #[must_use]
    pub const fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Returns the per-operation deadline on accepted connections.
    #[must_use]
    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_ms.map(Duration::from_millis)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.dial_timeout(), Duration::from_secs(5));
        assert_eq!(config.io_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.peer_request_count, 10);
        assert!(config.max_concurrent_handlers.is_none());
        assert!(!config.verify_announcements);
    }

    #[test]
    fn builder() {
        let config = ServerConfig::new(4001)
            .with_bind_host("127.0.0.1")
            .with_dial_timeout(Duration::from_millis(250))
            .with_io_timeout(None)
            .with_max_concurrent_handlers(8)
            .with_peer_request_count(3)
            .with_verify_announcements(true)
            .with_rng_seed(9);

        assert_eq!(config.port, 4001);
        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.dial_timeout(), Duration::from_millis(250));
        assert_eq!(config.io_timeout(), None);
        assert_eq!(config.max_concurrent_handlers, Some(8));
        assert_eq!(config.peer_request_count, 3);
        assert!(config.verify_announcements);
        assert_eq!(config.rng_seed, Some(9));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = ServerConfig::from_json(r#"{"port": 4001, "max_concurrent_handlers": 64}"#)
            .unwrap();
        assert_eq!(config.port, 4001);
        assert_eq!(config.max_concurrent_handlers, Some(64));
        assert_eq!(config.bind_host, "0.0.0.0");
        assert_eq!(config.dial_timeout_ms, 5_000);
    }

    #[test]
    fn invalid_json() {
        let err = ServerConfig::from_json(r#"{"port": "high"}"#).unwrap_err();
        assert!(matches!(err, NetError::Config(_)));
    }

    #[test]
    fn zero_handler_limit_is_invalid() {
        let err = ServerConfig::default()
            .with_max_concurrent_handlers(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, NetError::Config(_)));
        assert!(ServerConfig::default().with_max_concurrent_handlers(1).validate().is_ok());

        let err = ServerConfig::from_json(r#"{"max_concurrent_handlers": 0}"#).unwrap_err();
        assert!(matches!(err, NetError::Config(_)));
    }
}
