//! Subscriptions — per-channel state machines and publication delivery.
//!
//! Entities are owned by the [`registry`]; the application holds an
//! opaque [`Subscription`] handle. A handle's `close()` drains the
//! unsubscribe through the server, while plain `Drop` only releases local
//! bookkeeping. Destructors never touch the network.

pub mod registry;

use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::client::{ConnectionState, Core};
use crate::command::next_command_id;
use crate::error::{ClientError, CommandError};
use crate::protocol::wire::{NestedPayload, SubscribeResult};
use crate::protocol::{
    encode_command, Command, CommandBody, Payload, Publication, SubscribeRequest,
    UnsubscribeRequest,
};
use crate::token::{ChannelToken, ChannelTokenProvider};

// ─── States and events ───────────────────────────────────────────────────────

/// Per-channel subscription state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Not established on the server; will (re)subscribe when asked.
    Unsynced,
    /// Subscribe command in flight.
    Subscribing,
    /// Established; publications flow.
    Synced,
    /// Server kicked the channel, or the entity was disposed. Terminal.
    Unsubscribed,
    /// A subscribe/unsubscribe failed; `subscribe()` retries from here.
    Error,
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Events emitted to the subscription's observer stream.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// A publication payload, readable as text or raw bytes.
    Message(Payload),
    StateChanged(SubscriptionState),
    /// The server forcibly removed this channel. Terminal.
    Kicked,
    Error(String),
}

// ─── Entity ──────────────────────────────────────────────────────────────────

struct EntityState {
    /// Channel name, fixed by the first token fetch.
    channel: Option<String>,
    token: String,
    /// Last seen publication offset, non-decreasing within an epoch.
    offset: u64,
    /// Server stream epoch; a change restarts the offset sequence.
    epoch: String,
    state: SubscriptionState,
    disposed: bool,
}

pub(crate) struct SubscriptionInner {
    provider: Arc<dyn ChannelTokenProvider>,
    entity: Mutex<EntityState>,
    event_tx: Mutex<Option<mpsc::UnboundedSender<SubscriptionEvent>>>,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SubscriptionEvent>>,
}

impl SubscriptionInner {
    pub(crate) fn new(provider: Arc<dyn ChannelTokenProvider>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            provider,
            entity: Mutex::new(EntityState {
                channel: None,
                token: String::new(),
                offset: 0,
                epoch: String::new(),
                state: SubscriptionState::Unsynced,
                disposed: false,
            }),
            event_tx: Mutex::new(Some(event_tx)),
            event_rx: tokio::sync::Mutex::new(event_rx),
        }
    }

    pub(crate) fn provider(&self) -> &Arc<dyn ChannelTokenProvider> {
        &self.provider
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        self.entity.lock().expect("entity lock").state
    }

    pub(crate) fn channel(&self) -> Option<String> {
        self.entity.lock().expect("entity lock").channel.clone()
    }

    pub(crate) fn offset(&self) -> u64 {
        self.entity.lock().expect("entity lock").offset
    }

    pub(crate) fn epoch(&self) -> String {
        self.entity.lock().expect("entity lock").epoch.clone()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.entity.lock().expect("entity lock").disposed
    }

    fn emit(&self, event: SubscriptionEvent) {
        if let Some(tx) = &*self.event_tx.lock().expect("event lock") {
            let _ = tx.send(event);
        }
    }

    /// Update the state field, then notify observers. Observers always
    /// see the field already updated.
    pub(crate) fn set_state(&self, new: SubscriptionState) {
        {
            let mut entity = self.entity.lock().expect("entity lock");
            if entity.state == new {
                return;
            }
            entity.state = new;
        }
        self.emit(SubscriptionEvent::StateChanged(new));
    }

    /// Validate a token fetch against the entity and store the token.
    /// The channel is fixed by the first fetch; any later change is a
    /// hard error.
    fn accept_token(&self, fetched: &ChannelToken) -> Result<(), ClientError> {
        let mut entity = self.entity.lock().expect("entity lock");
        match &entity.channel {
            Some(channel) if channel != &fetched.channel => {
                return Err(ClientError::ChannelChanged {
                    expected: channel.clone(),
                    got: fetched.channel.clone(),
                })
            }
            Some(_) => {}
            None => entity.channel = Some(fetched.channel.clone()),
        }
        entity.token = fetched.token.clone();
        Ok(())
    }

    fn prepare_subscribe(&self, fetched: &ChannelToken) -> Result<(), ClientError> {
        {
            let entity = self.entity.lock().expect("entity lock");
            if entity.disposed {
                return Err(ClientError::Disposed);
            }
            match entity.state {
                SubscriptionState::Subscribing | SubscriptionState::Synced => {
                    return Err(ClientError::AlreadySubscribed {
                        channel: fetched.channel.clone(),
                    })
                }
                SubscriptionState::Unsubscribed => {
                    return Err(ClientError::AlreadyUnsubscribed {
                        channel: fetched.channel.clone(),
                    })
                }
                SubscriptionState::Unsynced | SubscriptionState::Error => {}
            }
        }
        self.accept_token(fetched)
    }

    /// Enter `Subscribing` and produce the wire request.
    fn start_subscribing(&self) -> SubscribeRequest {
        let request = {
            let entity = self.entity.lock().expect("entity lock");
            SubscribeRequest {
                channel: entity.channel.clone().unwrap_or_default(),
                token: entity.token.clone(),
                recover: !entity.epoch.is_empty(),
                offset: entity.offset,
                epoch: entity.epoch.clone(),
            }
        };
        self.set_state(SubscriptionState::Subscribing);
        request
    }

    /// Recovery request for the reconnect handshake. Leaves the state
    /// untouched; `recover()` will confirm it.
    pub(crate) fn build_recovery_request(
        &self,
        fetched: &ChannelToken,
    ) -> Result<SubscribeRequest, ClientError> {
        self.accept_token(fetched)?;
        let entity = self.entity.lock().expect("entity lock");
        Ok(SubscribeRequest {
            channel: fetched.channel.clone(),
            token: entity.token.clone(),
            recover: !entity.epoch.is_empty(),
            offset: entity.offset,
            epoch: entity.epoch.clone(),
        })
    }

    /// Apply a subscribe ack or recovery result: sync the epoch, enter
    /// `Synced`, then deliver catch-up publications in array order.
    pub(crate) fn apply_subscribe_result(&self, result: &SubscribeResult) {
        {
            let mut entity = self.entity.lock().expect("entity lock");
            if !result.epoch.is_empty() && entity.epoch != result.epoch {
                // stream restart: prior offsets are void
                entity.epoch = result.epoch.clone();
                entity.offset = result.offset;
            }
        }
        self.set_state(SubscriptionState::Synced);

        if let Some(publications) = &result.publications {
            for publication in publications {
                self.deliver_publication(publication);
            }
        } else if let Some(nested) = &result.data {
            self.deliver_embedded(nested);
        }
    }

    /// Deliver one publication, observers first. The offset is only
    /// advanced after delivery so a replayed message is never lost to an
    /// observer that saw nothing.
    pub(crate) fn deliver_publication(&self, publication: &Publication) {
        self.emit(SubscriptionEvent::Message(publication.data.payload.clone()));
        self.entity.lock().expect("entity lock").offset = publication.offset;
    }

    /// The embedded single-publication reply form carries no offset; it
    /// advances the counter by one.
    fn deliver_embedded(&self, nested: &NestedPayload) {
        self.emit(SubscriptionEvent::Message(nested.data.payload.clone()));
        self.entity.lock().expect("entity lock").offset += 1;
    }

    pub(crate) fn on_kick(&self) {
        self.set_state(SubscriptionState::Unsubscribed);
        self.emit(SubscriptionEvent::Kicked);
    }

    pub(crate) fn enter_error(&self, reason: &str) {
        self.set_state(SubscriptionState::Error);
        self.emit(SubscriptionEvent::Error(reason.to_string()));
    }

    /// Track transport connectivity: `Synced` while up, `Unsynced` while
    /// down. Terminal and errored entities are left alone.
    pub(crate) fn on_connectivity_change(&self, connected: bool) {
        match self.state() {
            SubscriptionState::Unsubscribed | SubscriptionState::Error => {}
            _ => self.set_state(if connected {
                SubscriptionState::Synced
            } else {
                SubscriptionState::Unsynced
            }),
        }
    }

    /// Release local bookkeeping and detach observers. Idempotent, never
    /// touches the network.
    pub(crate) fn dispose(&self) {
        {
            let mut entity = self.entity.lock().expect("entity lock");
            if entity.disposed {
                return;
            }
            entity.disposed = true;
        }
        self.set_state(SubscriptionState::Unsubscribed);
        *self.event_tx.lock().expect("event lock") = None;
        trace!("subscription disposed");
    }
}

// ─── Public handle ───────────────────────────────────────────────────────────

/// Handle to a channel subscription.
///
/// Cloning shares the underlying entity. Dropping all handles releases
/// memory only; call [`close`](Self::close) to unsubscribe server-side.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) inner: Arc<SubscriptionInner>,
    pub(crate) core: Arc<Core>,
}

impl Subscription {
    pub fn state(&self) -> SubscriptionState {
        self.inner.state()
    }

    /// Channel name, known after the first successful token fetch.
    pub fn channel(&self) -> Option<String> {
        self.inner.channel()
    }

    pub fn offset(&self) -> u64 {
        self.inner.offset()
    }

    pub fn epoch(&self) -> String {
        self.inner.epoch()
    }

    /// Establish the subscription on the server. Resolves when the
    /// server acks, or fails with the reason.
    pub async fn subscribe(&self) -> Result<(), ClientError> {
        subscribe_entity(&self.core, &self.inner).await
    }

    /// Remove the subscription server-side. Resolves immediately when the
    /// client has no connection intent.
    pub async fn unsubscribe(&self) -> Result<(), ClientError> {
        unsubscribe_entity(&self.core, &self.inner).await
    }

    /// Deterministic disposal: drains the unsubscribe when one is owed,
    /// then releases the entity. Calling it twice is a no-op.
    pub async fn close(&self) {
        if self.inner.is_disposed() {
            return;
        }
        if matches!(
            self.inner.state(),
            SubscriptionState::Subscribing | SubscriptionState::Synced
        ) {
            if let Err(e) = unsubscribe_entity(&self.core, &self.inner).await {
                debug!(error = %e, "unsubscribe during close failed");
            }
        }
        if let Some(channel) = self.inner.channel() {
            self.core.registry.remove_entity(&channel, &self.inner);
        }
        self.inner.dispose();
    }

    /// Stream of events for this subscription: publications, state
    /// changes, kick, errors. Single consumer.
    pub fn events(&self) -> Pin<Box<dyn Stream<Item = SubscriptionEvent> + Send + '_>> {
        Box::pin(futures_util::stream::unfold(
            &self.inner.event_rx,
            |rx| async move {
                let mut guard = rx.lock().await;
                guard.recv().await.map(|event| (event, rx))
            },
        ))
    }
}

// ─── Subscribe / unsubscribe flows ───────────────────────────────────────────

pub(crate) async fn subscribe_entity(
    core: &Arc<Core>,
    inner: &Arc<SubscriptionInner>,
) -> Result<(), ClientError> {
    if inner.is_disposed() {
        return Err(ClientError::Disposed);
    }
    if core.is_disabled() {
        return Err(ClientError::Disabled);
    }

    let fetched = inner
        .provider()
        .get_token()
        .await
        .map_err(|e| ClientError::TokenRetrieverFailed {
            reason: e.to_string(),
        })?;
    if fetched.channel.is_empty() {
        return Err(ClientError::EmptyChannel);
    }

    inner.prepare_subscribe(&fetched)?;
    core.registry.add(&fetched.channel, inner)?;
    let request = inner.start_subscribing();

    let id = next_command_id();
    let waiter = core.commands.register(id, "subscribe")?;
    let frame = encode_command(&Command::new(id, CommandBody::Subscribe(request)))?;
    core.send_frame(frame);

    match waiter.wait(core.config.command_timeout).await {
        Ok(reply) => {
            if let Some(err) = reply.error {
                inner.enter_error(&err.message);
                return Err(ClientError::Server {
                    code: err.code,
                    message: err.message,
                });
            }
            inner.apply_subscribe_result(&reply.subscribe.unwrap_or_default());
            Ok(())
        }
        // the close path already parked the entity in Unsynced; it will
        // re-establish through reconnect recovery
        Err(err @ CommandError::Interrupted { .. }) => Err(err.into()),
        Err(err) => {
            inner.enter_error("no subscribe reply within the command window");
            Err(err.into())
        }
    }
}

pub(crate) async fn unsubscribe_entity(
    core: &Arc<Core>,
    inner: &Arc<SubscriptionInner>,
) -> Result<(), ClientError> {
    if inner.is_disposed() {
        return Err(ClientError::Disposed);
    }
    let channel = match inner.channel() {
        Some(channel) => channel,
        None => {
            return Err(ClientError::AlreadyUnsubscribed {
                channel: String::new(),
            })
        }
    };
    if inner.state() == SubscriptionState::Unsubscribed || !core.registry.contains(inner) {
        return Err(ClientError::AlreadyUnsubscribed { channel });
    }

    // no connection intent: resolve locally, nothing to drain
    if core.is_disabled()
        || !core.want_connected()
        || core.state() != ConnectionState::Connected
    {
        core.registry.remove_entity(&channel, inner);
        inner.set_state(SubscriptionState::Unsynced);
        return Ok(());
    }

    let id = next_command_id();
    let waiter = core.commands.register(id, "unsubscribe")?;
    let frame = encode_command(&Command::new(
        id,
        CommandBody::Unsubscribe(UnsubscribeRequest {
            channel: channel.clone(),
        }),
    ))?;
    core.send_frame(frame);

    match waiter.wait(core.config.command_timeout).await {
        Ok(reply) => {
            if let Some(err) = reply.error {
                inner.enter_error(&err.message);
                return Err(ClientError::Server {
                    code: err.code,
                    message: err.message,
                });
            }
            core.registry.remove_entity(&channel, inner);
            inner.set_state(SubscriptionState::Unsynced);
            Ok(())
        }
        Err(CommandError::Interrupted { .. }) => {
            // the connection died with the command; nothing remains
            // subscribed server-side
            core.registry.remove_entity(&channel, inner);
            inner.set_state(SubscriptionState::Unsynced);
            Ok(())
        }
        Err(err) => {
            inner.enter_error("no unsubscribe reply within the command window");
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::PublicationData;
    use crate::token::StaticTokenProvider;

    fn entity(channel: &str) -> SubscriptionInner {
        SubscriptionInner::new(Arc::new(StaticTokenProvider::new(channel, "tok")))
    }

    fn token(channel: &str) -> ChannelToken {
        ChannelToken {
            channel: channel.into(),
            token: "tok".into(),
        }
    }

    fn publication(offset: u64, payload: &str) -> Publication {
        Publication {
            offset,
            data: PublicationData {
                payload: payload.into(),
            },
        }
    }

    fn drain(inner: &SubscriptionInner) -> Vec<SubscriptionEvent> {
        let mut events = Vec::new();
        let mut rx = inner.event_rx.try_lock().unwrap();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_initial_state() {
        let inner = entity("c");
        assert_eq!(inner.state(), SubscriptionState::Unsynced);
        assert_eq!(inner.offset(), 0);
        assert!(inner.channel().is_none());
    }

    #[test]
    fn test_channel_fixed_by_first_token() {
        let inner = entity("a");
        inner.accept_token(&token("a")).unwrap();
        assert_eq!(inner.channel().as_deref(), Some("a"));

        // same channel again is fine
        inner.accept_token(&token("a")).unwrap();

        let err = inner.accept_token(&token("b")).unwrap_err();
        assert!(matches!(err, ClientError::ChannelChanged { .. }));
    }

    #[test]
    fn test_subscribe_while_subscribing_rejected() {
        let inner = entity("c");
        inner.prepare_subscribe(&token("c")).unwrap();
        inner.start_subscribing();
        assert_eq!(inner.state(), SubscriptionState::Subscribing);

        let err = inner.prepare_subscribe(&token("c")).unwrap_err();
        assert!(matches!(err, ClientError::AlreadySubscribed { .. }));
    }

    #[test]
    fn test_delivery_before_offset_update() {
        let inner = entity("c");
        inner.deliver_publication(&publication(7, "hi"));

        assert_eq!(inner.offset(), 7);
        let events = drain(&inner);
        assert_eq!(events.len(), 1);
        match &events[0] {
            SubscriptionEvent::Message(payload) => {
                assert_eq!(payload.as_str(), "hi");
                assert_eq!(payload.as_bytes(), b"hi");
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn test_apply_result_delivers_in_order() {
        let inner = entity("c");
        let result = SubscribeResult {
            epoch: "e1".into(),
            offset: 0,
            recoverable: true,
            publications: Some(vec![publication(1, "a"), publication(2, "b")]),
            data: None,
        };
        inner.apply_subscribe_result(&result);

        assert_eq!(inner.state(), SubscriptionState::Synced);
        assert_eq!(inner.epoch(), "e1");
        assert_eq!(inner.offset(), 2);

        let payloads: Vec<String> = drain(&inner)
            .into_iter()
            .filter_map(|e| match e {
                SubscriptionEvent::Message(p) => Some(p.into_string()),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec!["a", "b"]);
    }

    #[test]
    fn test_embedded_form_increments_offset() {
        let inner = entity("c");
        inner.deliver_publication(&publication(4, "x"));
        let _ = drain(&inner);

        let result: SubscribeResult = serde_json::from_str(
            r#"{"epoch":"","offset":0,"data":{"data":{"payload":"inline"}}}"#,
        )
        .unwrap();
        inner.apply_subscribe_result(&result);

        assert_eq!(inner.offset(), 5);
        assert!(drain(&inner)
            .iter()
            .any(|e| matches!(e, SubscriptionEvent::Message(p) if p.as_str() == "inline")));
    }

    #[test]
    fn test_epoch_change_restarts_offsets() {
        let inner = entity("c");
        inner.apply_subscribe_result(&SubscribeResult {
            epoch: "e1".into(),
            offset: 10,
            ..Default::default()
        });
        assert_eq!(inner.offset(), 10);

        inner.on_connectivity_change(false);
        inner.apply_subscribe_result(&SubscribeResult {
            epoch: "e2".into(),
            offset: 0,
            ..Default::default()
        });
        assert_eq!(inner.offset(), 0);
        assert_eq!(inner.epoch(), "e2");
    }

    #[test]
    fn test_kick_is_terminal() {
        let inner = entity("c");
        inner.on_kick();
        assert_eq!(inner.state(), SubscriptionState::Unsubscribed);

        // connectivity changes no longer apply
        inner.on_connectivity_change(true);
        assert_eq!(inner.state(), SubscriptionState::Unsubscribed);

        assert!(drain(&inner)
            .iter()
            .any(|e| matches!(e, SubscriptionEvent::Kicked)));
    }

    #[test]
    fn test_connectivity_change_tracks_transport() {
        let inner = entity("c");
        inner.on_connectivity_change(true);
        assert_eq!(inner.state(), SubscriptionState::Synced);
        inner.on_connectivity_change(false);
        assert_eq!(inner.state(), SubscriptionState::Unsynced);
    }

    #[test]
    fn test_error_state_untouched_by_connectivity() {
        let inner = entity("c");
        inner.enter_error("boom");
        inner.on_connectivity_change(true);
        assert_eq!(inner.state(), SubscriptionState::Error);
    }

    #[test]
    fn test_error_then_retry_allowed() {
        let inner = entity("c");
        inner.enter_error("boom");
        assert!(inner.prepare_subscribe(&token("c")).is_ok());
    }

    #[test]
    fn test_dispose_twice_is_noop() {
        let inner = entity("c");
        inner.dispose();
        assert!(inner.is_disposed());
        assert_eq!(inner.state(), SubscriptionState::Unsubscribed);

        inner.dispose();
        assert!(inner.is_disposed());
    }

    #[test]
    fn test_dispose_clears_observers() {
        let inner = entity("c");
        inner.dispose();
        // events after disposal go nowhere
        inner.deliver_publication(&publication(1, "late"));
        let events = drain(&inner);
        // only the terminal state change from dispose itself is buffered
        assert!(events
            .iter()
            .all(|e| !matches!(e, SubscriptionEvent::Message(_))));
    }
}
