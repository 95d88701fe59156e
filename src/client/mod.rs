//! `ConduitClient` — the primary entry point.
//!
//! The client is a thin facade: every operation is marshalled onto a
//! background driver task through an op channel, so core state is only
//! ever touched from one logical context. Transport callbacks arrive the
//! same way, which is what makes the single-threaded cooperative model
//! hold even though I/O happens on arbitrary tokio workers.

mod driver;

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ClientConfig;
use crate::command::{next_command_id, CommandManager};
use crate::error::ClientError;
use crate::network::{AlwaysReachable, NetworkProbe, TcpProbe};
use crate::protocol::wire::PublishRequest;
use crate::protocol::{encode_command, CloseCode, Command, CommandBody};
use crate::subscription::registry::SubscriptionRegistry;
use crate::subscription::{Subscription, SubscriptionInner};
use crate::token::ChannelTokenProvider;
use crate::transport::{Connector, WsConnector};

use driver::Driver;

// ─── Connection state ────────────────────────────────────────────────────────

/// Global connection lifecycle state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
        }
    }
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection-level events emitted to the consumer.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Handshake completed; subscriptions are recovering.
    Connected,
    /// Connection lost; reconnection follows the close-code policy.
    Disconnected { code: CloseCode },
}

// ─── Ops ─────────────────────────────────────────────────────────────────────

/// Operations marshalled onto the driver task.
pub(crate) enum Op {
    Connect {
        done: oneshot::Sender<Result<(), ClientError>>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
    Disable {
        done: oneshot::Sender<()>,
    },
    Reset {
        reconnect: bool,
        done: oneshot::Sender<()>,
    },
    SendFrame {
        frame: String,
    },
}

// ─── Shared core ─────────────────────────────────────────────────────────────

/// State shared between the facade, subscription handles and the driver.
pub(crate) struct Core {
    pub(crate) config: ClientConfig,
    pub(crate) commands: CommandManager,
    pub(crate) registry: SubscriptionRegistry,
    ops: mpsc::UnboundedSender<Op>,
    state: AtomicU8,
    disabled: AtomicBool,
    want_connected: AtomicBool,
    access_token: Mutex<String>,
}

impl Core {
    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::SeqCst))
    }

    /// Store the new state, returning the previous one.
    pub(crate) fn store_state(&self, new: ConnectionState) -> ConnectionState {
        ConnectionState::from(self.state.swap(new as u8, Ordering::SeqCst))
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    pub(crate) fn want_connected(&self) -> bool {
        self.want_connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_want_connected(&self, want: bool) {
        self.want_connected.store(want, Ordering::SeqCst);
    }

    pub(crate) fn access_token(&self) -> String {
        self.access_token.lock().expect("token lock").clone()
    }

    pub(crate) fn set_access_token(&self, token: String) {
        *self.access_token.lock().expect("token lock") = token;
    }

    pub(crate) fn send_op(&self, op: Op) -> bool {
        self.ops.send(op).is_ok()
    }

    /// Hand an encoded command frame to the driver for transmission.
    pub(crate) fn send_frame(&self, frame: String) {
        let _ = self.ops.send(Op::SendFrame { frame });
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

/// Realtime messaging client over a single multiplexed WebSocket.
///
/// Must be created inside a tokio runtime; the driver task is spawned at
/// construction and aborted when the client drops.
pub struct ConduitClient {
    core: Arc<Core>,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ClientEvent>>,
    driver_handle: JoinHandle<()>,
}

impl ConduitClient {
    /// Create a client with the production WebSocket transport and the
    /// built-in TCP reachability probe.
    pub fn new(config: ClientConfig) -> Self {
        let probe: Arc<dyn NetworkProbe> = match TcpProbe::from_address(&config.address) {
            Some(probe) => Arc::new(probe),
            None => Arc::new(AlwaysReachable),
        };
        Self::with_connector(config, Arc::new(WsConnector), probe)
    }

    /// Create a client with injected transport and reachability
    /// collaborators.
    pub fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        probe: Arc<dyn NetworkProbe>,
    ) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let core = Arc::new(Core {
            access_token: Mutex::new(config.access_token.clone()),
            config,
            commands: CommandManager::new(),
            registry: SubscriptionRegistry::new(),
            ops: ops_tx,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            disabled: AtomicBool::new(false),
            want_connected: AtomicBool::new(false),
        });

        let driver = Driver::new(core.clone(), connector, probe, ops_rx, event_tx);
        let driver_handle = tokio::spawn(driver.run());

        Self {
            core,
            event_rx: tokio::sync::Mutex::new(event_rx),
            driver_handle,
        }
    }

    /// Open the connection and complete the handshake. Returns once the
    /// client is `Connected`; calling while already connected is a no-op.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.core.is_disabled() {
            return Err(ClientError::Disabled);
        }
        let (done, result) = oneshot::channel();
        if !self.core.send_op(Op::Connect { done }) {
            return Err(ClientError::ConnectionFailed {
                reason: "client is shut down".into(),
            });
        }
        result.await.unwrap_or(Err(ClientError::ConnectionFailed {
            reason: "client is shut down".into(),
        }))
    }

    /// Close the connection and stay disconnected until the next
    /// `connect()`. Concurrent callers share one completion.
    pub async fn disconnect(&self) {
        let (done, closed) = oneshot::channel();
        if self.core.send_op(Op::Disconnect { done }) {
            let _ = closed.await;
        }
    }

    /// Disconnect and permanently suppress reconnection. Later API calls
    /// perform no network I/O.
    pub async fn disable(&self) {
        let (done, closed) = oneshot::channel();
        if self.core.send_op(Op::Disable { done }) {
            let _ = closed.await;
        }
    }

    /// Create a subscription entity for the channel named by the token
    /// provider. Nothing is sent until `subscribe()`.
    pub fn create_channel(&self, provider: Arc<dyn ChannelTokenProvider>) -> Subscription {
        Subscription {
            inner: Arc::new(SubscriptionInner::new(provider)),
            core: self.core.clone(),
        }
    }

    /// Publish a payload to a channel and await the server ack.
    pub async fn publish(
        &self,
        channel: &str,
        data: serde_json::Value,
    ) -> Result<(), ClientError> {
        if self.core.is_disabled() {
            return Err(ClientError::Disabled);
        }
        let id = next_command_id();
        let waiter = self.core.commands.register(id, "publish")?;
        let frame = encode_command(&Command::new(
            id,
            CommandBody::Publish(PublishRequest {
                channel: channel.to_string(),
                data,
            }),
        ))?;
        self.core.send_frame(frame);

        let reply = waiter.wait(self.core.config.command_timeout).await?;
        if let Some(err) = reply.error {
            return Err(ClientError::Server {
                code: err.code,
                message: err.message,
            });
        }
        Ok(())
    }

    /// Replace the access token used for subsequent handshakes.
    pub fn set_access_token(&self, token: impl Into<String>) {
        self.core.set_access_token(token.into());
    }

    /// The signed-in identity changed: tear the session down, drop all
    /// pending commands and subscriptions, and reconnect when a token is
    /// available.
    pub async fn identity_changed(&self, player_id: Option<&str>) {
        info!(
            player_id = player_id.unwrap_or("<signed out>"),
            "identity changed, resetting session"
        );
        let reconnect = !self.core.access_token().is_empty();
        let (done, closed) = oneshot::channel();
        if self.core.send_op(Op::Reset { reconnect, done }) {
            let _ = closed.await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    /// Stream of connection-level events. Single consumer.
    pub fn events(&self) -> Pin<Box<dyn Stream<Item = ClientEvent> + Send + '_>> {
        Box::pin(futures_util::stream::unfold(
            &self.event_rx,
            |rx| async move {
                let mut guard = rx.lock().await;
                guard.recv().await.map(|event| (event, rx))
            },
        ))
    }
}

impl Drop for ConduitClient {
    fn drop(&mut self) {
        self.driver_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_round_trip() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
        ] {
            assert_eq!(ConnectionState::from(state as u8), state);
        }
    }

    #[test]
    fn test_connection_state_labels() {
        assert_eq!(ConnectionState::Connected.as_str(), "Connected");
        assert_eq!(ConnectionState::Disconnecting.to_string(), "Disconnecting");
    }
}
