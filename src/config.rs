//! Client configuration.

use std::time::Duration;

/// Configuration for a [`ConduitClient`](crate::client::ConduitClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Transport endpoint URL, e.g. `wss://realtime.example.com/conduit`.
    pub address: String,
    /// Bearer token sent with the `connect` handshake. May be set later
    /// via [`set_access_token`](crate::client::ConduitClient::set_access_token).
    pub access_token: String,
    /// Per-command reply timeout.
    pub command_timeout: Duration,
    /// Grace added to the server-advertised ping interval before the
    /// connection is considered stalled.
    pub max_server_ping_delay: Duration,
    /// Poll interval while waiting for network reachability. Floored at
    /// one second when used.
    pub network_check_interval: Duration,
    pub backoff: BackoffConfig,
}

impl ClientConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            access_token: String::new(),
            command_timeout: Duration::from_secs(10),
            max_server_ping_delay: Duration::from_secs(10),
            network_check_interval: Duration::from_secs(2),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Reconnection backoff parameters.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    /// Relative jitter applied to each delay, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::new("ws://t");
        assert_eq!(config.address, "ws://t");
        assert!(config.access_token.is_empty());
        assert_eq!(config.command_timeout, Duration::from_secs(10));
        assert_eq!(config.max_server_ping_delay, Duration::from_secs(10));
        assert_eq!(config.backoff.base, Duration::from_secs(1));
        assert_eq!(config.backoff.cap, Duration::from_secs(30));
    }
}
