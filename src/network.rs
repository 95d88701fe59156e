//! Network reachability probing.
//!
//! When a connection drops while the link itself is down, reconnect
//! attempts are pointless; the client polls a probe instead and resumes
//! once reachability returns. Hosts with a platform-native signal can
//! inject their own probe.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use url::Url;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Reachability gate consulted before scheduling reconnect attempts.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Probe that always reports the network as up. Used when no endpoint
/// host can be derived and by tests.
#[derive(Debug, Clone, Default)]
pub struct AlwaysReachable;

#[async_trait]
impl NetworkProbe for AlwaysReachable {
    async fn is_reachable(&self) -> bool {
        true
    }
}

/// Built-in probe: attempts a TCP dial of the endpoint host.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
}

impl TcpProbe {
    /// Derive a probe target from the client address. Returns `None` when
    /// the URL has no usable host.
    pub fn from_address(address: &str) -> Option<Self> {
        let url = Url::parse(address).ok()?;
        let host = url.host_str()?.to_string();
        let port = url
            .port()
            .unwrap_or(match url.scheme() {
                "ws" | "http" => 80,
                _ => 443,
            });
        Some(Self { host, port })
    }
}

#[async_trait]
impl NetworkProbe for TcpProbe {
    async fn is_reachable(&self) -> bool {
        let target = (self.host.as_str(), self.port);
        matches!(
            tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(target)).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_target_from_wss_url() {
        let probe = TcpProbe::from_address("wss://realtime.example.com/conduit").unwrap();
        assert_eq!(probe.host, "realtime.example.com");
        assert_eq!(probe.port, 443);
    }

    #[test]
    fn test_probe_target_default_ws_port() {
        let probe = TcpProbe::from_address("ws://localhost/x").unwrap();
        assert_eq!(probe.port, 80);
    }

    #[test]
    fn test_probe_target_explicit_port() {
        let probe = TcpProbe::from_address("ws://localhost:9000/x").unwrap();
        assert_eq!(probe.port, 9000);
    }

    #[test]
    fn test_invalid_address_has_no_probe() {
        assert!(TcpProbe::from_address("not a url").is_none());
    }

    #[tokio::test]
    async fn test_always_reachable() {
        assert!(AlwaysReachable.is_reachable().await);
    }
}
