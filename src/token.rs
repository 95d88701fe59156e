//! Channel token retrieval — host-provided credentials per channel.

use async_trait::async_trait;

/// Result of a token fetch: the channel the token is scoped to plus the
/// token itself. The channel name reported here is authoritative and must
/// not change across calls for the same subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelToken {
    pub channel: String,
    pub token: String,
}

pub type TokenResult = Result<ChannelToken, Box<dyn std::error::Error + Send + Sync>>;

/// Host-provided token source, called on every (re)subscribe.
#[async_trait]
pub trait ChannelTokenProvider: Send + Sync {
    async fn get_token(&self) -> TokenResult;
}

/// Fixed channel/token pair, useful for public channels and tests.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    channel: String,
    token: String,
}

impl StaticTokenProvider {
    pub fn new(channel: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl ChannelTokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> TokenResult {
        Ok(ChannelToken {
            channel: self.channel.clone(),
            token: self.token.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_returns_fixed_pair() {
        let provider = StaticTokenProvider::new("room.1", "tok");
        let first = provider.get_token().await.unwrap();
        let second = provider.get_token().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.channel, "room.1");
        assert_eq!(first.token, "tok");
    }
}
