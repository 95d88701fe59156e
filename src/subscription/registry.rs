//! Subscription registry — the authoritative channel → entity mapping.
//!
//! Mutations arrive both from the dispatch task (pushes, recovery) and
//! from application tasks (subscribe/unsubscribe), so everything runs
//! under one lock with short critical sections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::SubscriptionInner;
use crate::error::ClientError;
use crate::metrics::METRICS;
use crate::protocol::{ConnectResult, SubscribeRequest};
use crate::subscription::SubscriptionState;

#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<SubscriptionInner>>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a channel for an entity. Re-adding the same entity is a
    /// no-op; a foreign entity on the same channel is rejected.
    pub(crate) fn add(
        &self,
        channel: &str,
        entity: &Arc<SubscriptionInner>,
    ) -> Result<(), ClientError> {
        {
            let mut map = self.inner.lock().expect("registry lock");
            match map.get(channel) {
                Some(existing) if Arc::ptr_eq(existing, entity) => return Ok(()),
                Some(_) => {
                    return Err(ClientError::AlreadySubscribed {
                        channel: channel.to_string(),
                    })
                }
                None => {
                    map.insert(channel.to_string(), entity.clone());
                }
            }
        }
        self.count_changed();
        Ok(())
    }

    pub(crate) fn remove(&self, channel: &str) -> Option<Arc<SubscriptionInner>> {
        let removed = self.inner.lock().expect("registry lock").remove(channel);
        if removed.is_some() {
            self.count_changed();
        }
        removed
    }

    /// Remove the channel only while this entity still owns it.
    pub(crate) fn remove_entity(&self, channel: &str, entity: &Arc<SubscriptionInner>) -> bool {
        let removed = {
            let mut map = self.inner.lock().expect("registry lock");
            match map.get(channel) {
                Some(existing) if Arc::ptr_eq(existing, entity) => {
                    map.remove(channel);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.count_changed();
        }
        removed
    }

    pub(crate) fn get(&self, channel: &str) -> Option<Arc<SubscriptionInner>> {
        self.inner.lock().expect("registry lock").get(channel).cloned()
    }

    pub(crate) fn contains(&self, entity: &Arc<SubscriptionInner>) -> bool {
        self.inner
            .lock()
            .expect("registry lock")
            .values()
            .any(|existing| Arc::ptr_eq(existing, entity))
    }

    pub(crate) fn all(&self) -> Vec<(String, Arc<SubscriptionInner>)> {
        self.inner
            .lock()
            .expect("registry lock")
            .iter()
            .map(|(channel, entity)| (channel.clone(), entity.clone()))
            .collect()
    }

    /// Drop every entity, parking each one in `Unsynced`. Used on client
    /// reset and disable.
    pub(crate) fn clear(&self) {
        let drained: Vec<_> = {
            let mut map = self.inner.lock().expect("registry lock");
            map.drain().collect()
        };
        for (_, entity) in &drained {
            entity.on_connectivity_change(false);
        }
        if !drained.is_empty() {
            self.count_changed();
        }
    }

    pub fn count(&self) -> usize {
        self.inner.lock().expect("registry lock").len()
    }

    fn count_changed(&self) {
        let count = self.count();
        debug!(count, "subscription count changed");
        METRICS.subscription_count(count);
    }

    /// Build the recovery list for the reconnect handshake by refreshing
    /// each entity's token. Entities whose fetch fails are omitted and
    /// retried individually once the connection is up.
    pub(crate) async fn recovery_requests(&self) -> Vec<SubscribeRequest> {
        let mut requests = Vec::new();
        for (channel, entity) in self.all() {
            if entity.is_disposed() || entity.state() == SubscriptionState::Unsubscribed {
                continue;
            }
            match entity.provider().get_token().await {
                Ok(fetched) => match entity.build_recovery_request(&fetched) {
                    Ok(request) => requests.push(request),
                    Err(e) => {
                        warn!(%channel, error = %e, "excluding channel from handshake")
                    }
                },
                Err(e) => {
                    warn!(%channel, error = %e, "token fetch failed, channel retries after connect")
                }
            }
        }
        requests
    }

    /// Apply the handshake's per-channel results: mentioned entities go
    /// `Synced` and receive their catch-up publications; the rest stay
    /// `Unsynced` and re-subscribe individually.
    pub(crate) fn recover(&self, result: &ConnectResult) {
        for (channel, sub_result) in &result.subs {
            match self.get(channel) {
                Some(entity) => entity.apply_subscribe_result(sub_result),
                None => debug!(%channel, "recovery result for unknown channel"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::SubscribeResult;
    use crate::token::{ChannelToken, ChannelTokenProvider, StaticTokenProvider, TokenResult};
    use async_trait::async_trait;

    fn entity(channel: &str) -> Arc<SubscriptionInner> {
        Arc::new(SubscriptionInner::new(Arc::new(StaticTokenProvider::new(
            channel, "tok",
        ))))
    }

    struct FailingProvider;

    #[async_trait]
    impl ChannelTokenProvider for FailingProvider {
        async fn get_token(&self) -> TokenResult {
            Err("backend unavailable".into())
        }
    }

    #[test]
    fn test_one_entity_per_channel() {
        let registry = SubscriptionRegistry::new();
        let first = entity("c");
        let second = entity("c");

        registry.add("c", &first).unwrap();
        // same entity again is idempotent
        registry.add("c", &first).unwrap();
        assert_eq!(registry.count(), 1);

        let err = registry.add("c", &second).unwrap_err();
        assert!(matches!(err, ClientError::AlreadySubscribed { .. }));
    }

    #[test]
    fn test_remove_entity_requires_ownership() {
        let registry = SubscriptionRegistry::new();
        let owner = entity("c");
        let stranger = entity("c");
        registry.add("c", &owner).unwrap();

        assert!(!registry.remove_entity("c", &stranger));
        assert_eq!(registry.count(), 1);
        assert!(registry.remove_entity("c", &owner));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_contains_and_get() {
        let registry = SubscriptionRegistry::new();
        let sub = entity("c");
        assert!(!registry.contains(&sub));
        registry.add("c", &sub).unwrap();
        assert!(registry.contains(&sub));
        assert!(Arc::ptr_eq(&registry.get("c").unwrap(), &sub));
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn test_clear_parks_entities_unsynced() {
        let registry = SubscriptionRegistry::new();
        let sub = entity("c");
        sub.on_connectivity_change(true);
        assert_eq!(sub.state(), SubscriptionState::Synced);

        registry.add("c", &sub).unwrap();
        registry.clear();

        assert_eq!(registry.count(), 0);
        assert_eq!(sub.state(), SubscriptionState::Unsynced);
    }

    #[tokio::test]
    async fn test_recovery_requests_include_stream_position() {
        let registry = SubscriptionRegistry::new();
        let sub = entity("room.42");
        sub.apply_subscribe_result(&SubscribeResult {
            epoch: "e1".into(),
            offset: 1,
            ..Default::default()
        });
        sub.on_connectivity_change(false);
        registry.add("room.42", &sub).unwrap();

        let requests = registry.recovery_requests().await;
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.channel, "room.42");
        assert!(request.recover);
        assert_eq!(request.offset, 1);
        assert_eq!(request.epoch, "e1");
    }

    #[tokio::test]
    async fn test_failed_token_fetch_omits_channel() {
        let registry = SubscriptionRegistry::new();
        let healthy = entity("a");
        let broken = Arc::new(SubscriptionInner::new(Arc::new(FailingProvider)));
        registry.add("a", &healthy).unwrap();
        registry.add("b", &broken).unwrap();

        let requests = registry.recovery_requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].channel, "a");
    }

    #[tokio::test]
    async fn test_recover_moves_mentioned_entities_to_synced() {
        let registry = SubscriptionRegistry::new();
        let mentioned = entity("a");
        let unmentioned = entity("b");
        registry.add("a", &mentioned).unwrap();
        registry.add("b", &unmentioned).unwrap();

        let result: ConnectResult = serde_json::from_str(
            r#"{"ping":25,"pong":false,"subs":{
                "a":{"epoch":"e1","offset":3,"recoverable":true,
                     "publications":[{"offset":3,"data":{"payload":"caught-up"}}]}}}"#,
        )
        .unwrap();
        registry.recover(&result);

        assert_eq!(mentioned.state(), SubscriptionState::Synced);
        assert_eq!(mentioned.offset(), 3);
        assert_eq!(unmentioned.state(), SubscriptionState::Unsynced);
    }

    #[tokio::test]
    async fn test_channel_change_excluded_from_recovery() {
        struct Shifty;

        #[async_trait]
        impl ChannelTokenProvider for Shifty {
            async fn get_token(&self) -> TokenResult {
                Ok(ChannelToken {
                    channel: "elsewhere".into(),
                    token: "t".into(),
                })
            }
        }

        let registry = SubscriptionRegistry::new();
        let sub = Arc::new(SubscriptionInner::new(Arc::new(Shifty)));
        // pin the channel to something the provider will contradict
        sub.build_recovery_request(&ChannelToken {
            channel: "original".into(),
            token: "t".into(),
        })
        .unwrap();
        registry.add("original", &sub).unwrap();

        let requests = registry.recovery_requests().await;
        assert!(requests.is_empty());
    }
}
