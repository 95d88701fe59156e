//! Connection driver — the background task owning the transport.
//!
//! One logical thread: ops from the public API and events from the
//! transport are interleaved in a single select loop. Close handling
//! always completes (pending commands failed, disconnect waiters
//! resolved) before the next reconnect attempt is scheduled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::backoff::ExponentialBackoff;
use crate::client::{ClientEvent, ConnectionState, Core, Op};
use crate::command::next_command_id;
use crate::error::{ClientError, CodecError, CommandError};
use crate::metrics::METRICS;
use crate::network::NetworkProbe;
use crate::protocol::{
    decode_frame, encode_command, CloseCode, Command, CommandBody, ConnectRequest, Push, Reply,
    PONG_FRAME,
};
use crate::subscription::{subscribe_entity, SubscriptionState};
use crate::transport::{Connector, TransportEvent, TransportSink};

/// How long to wait for the close ack after we initiate a close.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// An established, handshaken connection.
struct ActiveConnection {
    sink: Box<dyn TransportSink>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    /// Server-advertised ping interval; zero disables the deadline.
    ping_interval: Duration,
    /// Whether the server expects the heartbeat echoed.
    pong_required: bool,
}

/// Why the connected loop ended.
struct ConnectionEnd {
    code: CloseCode,
    local: Option<LocalClose>,
}

enum LocalClose {
    Disconnect,
    Disable,
    Reset { reconnect: bool },
    Shutdown,
}

/// A failed connection attempt: the error for the caller, plus the close
/// code driving the retry policy (`None` for local configuration errors
/// that retrying cannot fix).
struct EstablishFailure {
    error: ClientError,
    close_code: Option<CloseCode>,
}

enum Wake {
    Op(Option<Op>),
    Retry,
    NetworkPoll,
}

pub(crate) struct Driver {
    core: Arc<Core>,
    connector: Arc<dyn Connector>,
    probe: Arc<dyn NetworkProbe>,
    ops: mpsc::UnboundedReceiver<Op>,
    events: mpsc::UnboundedSender<ClientEvent>,
    backoff: ExponentialBackoff,
    reconnect_at: Option<Instant>,
    network_waiting: bool,
    connect_waiters: Vec<oneshot::Sender<Result<(), ClientError>>>,
    disconnect_waiters: Vec<oneshot::Sender<()>>,
    /// Command frames issued before the handshake completed.
    pending_frames: Vec<String>,
}

impl Driver {
    pub(crate) fn new(
        core: Arc<Core>,
        connector: Arc<dyn Connector>,
        probe: Arc<dyn NetworkProbe>,
        ops: mpsc::UnboundedReceiver<Op>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        let backoff = ExponentialBackoff::new(&core.config.backoff);
        Self {
            core,
            connector,
            probe,
            ops,
            events,
            backoff,
            reconnect_at: None,
            network_waiting: false,
            connect_waiters: Vec::new(),
            disconnect_waiters: Vec::new(),
            pending_frames: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let wake = if let Some(at) = self.reconnect_at {
                tokio::select! {
                    op = self.ops.recv() => Wake::Op(op),
                    () = sleep_until(at) => Wake::Retry,
                }
            } else if self.network_waiting {
                let poll = self
                    .core
                    .config
                    .network_check_interval
                    .max(Duration::from_secs(1));
                tokio::select! {
                    op = self.ops.recv() => Wake::Op(op),
                    () = sleep(poll) => Wake::NetworkPoll,
                }
            } else {
                Wake::Op(self.ops.recv().await)
            };

            match wake {
                Wake::Op(None) => return,
                Wake::Op(Some(op)) => {
                    if self.handle_idle_op(op) && self.run_connection_cycle().await {
                        return;
                    }
                }
                Wake::Retry => {
                    self.reconnect_at = None;
                    if self.run_connection_cycle().await {
                        return;
                    }
                }
                Wake::NetworkPoll => {
                    if self.probe.is_reachable().await {
                        info!("network reachable again, reconnecting");
                        self.network_waiting = false;
                        self.core.set_want_connected(true);
                        if self.run_connection_cycle().await {
                            return;
                        }
                    }
                }
            }
        }
    }

    // ─── Idle phase ──────────────────────────────────────────────────────────

    /// Handle an op while no connection is active. Returns whether a
    /// connect attempt should start right away.
    fn handle_idle_op(&mut self, op: Op) -> bool {
        match op {
            Op::Connect { done } => {
                if self.core.is_disabled() {
                    let _ = done.send(Err(ClientError::Disabled));
                    return false;
                }
                // a user connect overrides any scheduled retry or
                // network wait
                self.reconnect_at = None;
                self.network_waiting = false;
                self.core.set_want_connected(true);
                self.connect_waiters.push(done);
                true
            }
            Op::Disconnect { done } => {
                self.core.set_want_connected(false);
                self.reconnect_at = None;
                self.network_waiting = false;
                let _ = done.send(());
                false
            }
            Op::Disable { done } => {
                self.core.set_disabled(true);
                self.core.set_want_connected(false);
                self.reconnect_at = None;
                self.network_waiting = false;
                self.core.commands.clear();
                self.core.registry.clear();
                let _ = done.send(());
                false
            }
            Op::Reset { reconnect, done } => {
                self.core.commands.clear();
                self.core.registry.clear();
                let _ = done.send(());
                if reconnect && !self.core.is_disabled() {
                    self.core.set_want_connected(true);
                    self.reconnect_at = None;
                    return true;
                }
                false
            }
            Op::SendFrame { frame } => {
                if self.core.want_connected() {
                    // a connect is in flight or scheduled; flush after
                    // the handshake
                    self.pending_frames.push(frame);
                } else {
                    debug!("dropping command frame while disconnected");
                }
                false
            }
        }
    }

    // ─── Connection cycle ────────────────────────────────────────────────────

    /// One full connect → connected → close cycle. Returns `true` when
    /// the driver should shut down.
    async fn run_connection_cycle(&mut self) -> bool {
        match self.establish().await {
            Ok(conn) => {
                let end = self.run_connected(conn).await;
                let shutdown = matches!(end.local, Some(LocalClose::Shutdown));
                self.handle_close(end.code, end.local).await;
                shutdown
            }
            Err(failure) => {
                warn!(error = %failure.error, "connection attempt failed");
                self.set_state(ConnectionState::Disconnected);
                self.fail_connect_waiters(&failure.error);
                if let Some(code) = failure.close_code {
                    self.schedule_reconnect(code).await;
                }
                false
            }
        }
    }

    /// Open a fresh transport and drive the `connect` handshake.
    async fn establish(&mut self) -> Result<ActiveConnection, EstablishFailure> {
        self.set_state(ConnectionState::Connecting);
        let address = self.core.config.address.clone();
        debug!(%address, "opening transport");

        let handle = match self.connector.connect(&address).await {
            Ok(handle) => handle,
            Err(e) => {
                return Err(EstablishFailure {
                    error: e.into(),
                    close_code: Some(CloseCode::Abnormal),
                })
            }
        };
        let mut sink = handle.sink;
        let mut events = handle.events;

        // transport is open: gather recovery requests, then the token
        let subs = self.core.registry.recovery_requests().await;
        let token = self.core.access_token();
        if token.is_empty() {
            sink.close().await;
            return Err(EstablishFailure {
                error: ClientError::EmptyToken,
                close_code: None,
            });
        }

        let id = next_command_id();
        let waiter = match self.core.commands.register(id, "connect") {
            Ok(waiter) => waiter,
            Err(e) => {
                sink.close().await;
                return Err(EstablishFailure {
                    error: e.into(),
                    close_code: None,
                });
            }
        };
        let frame = match encode_command(&Command::new(
            id,
            CommandBody::Connect(ConnectRequest { token, subs }),
        )) {
            Ok(frame) => frame,
            Err(e) => {
                sink.close().await;
                return Err(EstablishFailure {
                    error: e.into(),
                    close_code: None,
                });
            }
        };
        if let Err(e) = sink.send(&frame).await {
            sink.close().await;
            return Err(EstablishFailure {
                error: e.into(),
                close_code: Some(CloseCode::Abnormal),
            });
        }

        // pump transport events until the handshake reply resolves
        let reply = {
            let wait = waiter.wait(self.core.config.command_timeout);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    result = &mut wait => {
                        match result {
                            Ok(reply) => break reply,
                            Err(err) => {
                                let close_code = match &err {
                                    CommandError::Interrupted { code } => Some(*code),
                                    _ => Some(CloseCode::Abnormal),
                                };
                                sink.close().await;
                                return Err(EstablishFailure {
                                    error: ClientError::ConnectionFailed {
                                        reason: err.to_string(),
                                    },
                                    close_code,
                                });
                            }
                        }
                    }
                    event = events.recv() => match event {
                        Some(TransportEvent::Message(frame)) => {
                            METRICS.message_received();
                            if let Err(e) = self.dispatch_frame(&frame) {
                                sink.close().await;
                                return Err(EstablishFailure {
                                    error: e.into(),
                                    close_code: Some(CloseCode::Abnormal),
                                });
                            }
                        }
                        Some(TransportEvent::Error(msg)) => {
                            warn!(%msg, "transport error during handshake");
                        }
                        Some(TransportEvent::Closed { code }) => {
                            self.core.commands.on_disconnect(CloseCode::from_u16(code));
                        }
                        None => self.core.commands.on_disconnect(CloseCode::Abnormal),
                    }
                }
            }
        };

        if let Some(err) = reply.error {
            sink.close().await;
            return Err(EstablishFailure {
                error: ClientError::Server {
                    code: err.code,
                    message: err.message,
                },
                close_code: Some(CloseCode::Abnormal),
            });
        }
        let result = reply.connect.unwrap_or_default();

        // handshake accepted
        self.backoff.reset();
        self.core.registry.recover(&result);
        self.set_state(ConnectionState::Connected);
        let _ = self.events.send(ClientEvent::Connected);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        // flush commands issued while the handshake was in flight
        for frame in std::mem::take(&mut self.pending_frames) {
            if let Err(e) = sink.send(&frame).await {
                warn!(error = %e, "failed to flush queued command");
            }
        }
        self.resubscribe_unsynced();

        info!(ping = result.ping, pong = result.pong, "connected");
        Ok(ActiveConnection {
            sink,
            events,
            ping_interval: Duration::from_secs(u64::from(result.ping)),
            pong_required: result.pong,
        })
    }

    /// The connected select loop: transport events, API ops, and the
    /// server-liveness deadline.
    async fn run_connected(&mut self, conn: ActiveConnection) -> ConnectionEnd {
        let ActiveConnection {
            mut sink,
            mut events,
            ping_interval,
            pong_required,
        } = conn;

        let grace = self.core.config.max_server_ping_delay;
        let far_future = Instant::now() + Duration::from_secs(86_400);
        let first_deadline = if ping_interval > Duration::ZERO {
            Instant::now() + ping_interval + grace
        } else {
            far_future
        };
        let ping_sleep = sleep_until(first_deadline);
        tokio::pin!(ping_sleep);

        let mut local_close: Option<LocalClose> = None;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(TransportEvent::Message(frame)) => {
                        METRICS.message_received();
                        // any inbound traffic proves the server is alive
                        if ping_interval > Duration::ZERO && local_close.is_none() {
                            ping_sleep.as_mut().reset(Instant::now() + ping_interval + grace);
                        }
                        if pong_required {
                            if let Err(e) = sink.send(PONG_FRAME).await {
                                warn!(error = %e, "pong send failed");
                            }
                        }
                        if let Err(e) = self.dispatch_frame(&frame) {
                            error!(error = %e, "malformed frame, closing connection");
                            sink.close().await;
                            return ConnectionEnd {
                                code: CloseCode::Abnormal,
                                local: local_close,
                            };
                        }
                    }
                    Some(TransportEvent::Error(msg)) => warn!(%msg, "transport error"),
                    Some(TransportEvent::Closed { code }) => {
                        return ConnectionEnd {
                            code: CloseCode::from_u16(code),
                            local: local_close,
                        };
                    }
                    None => {
                        return ConnectionEnd {
                            code: CloseCode::Abnormal,
                            local: local_close,
                        };
                    }
                },
                op = self.ops.recv() => match op {
                    Some(op) => {
                        let closing = local_close.is_some();
                        if let Some(local) = self.handle_connected_op(&mut sink, op, closing).await {
                            local_close = Some(local);
                            // bounded wait for the close ack
                            ping_sleep.as_mut().reset(Instant::now() + CLOSE_GRACE);
                        }
                    }
                    None => {
                        sink.close().await;
                        return ConnectionEnd {
                            code: CloseCode::Normal,
                            local: Some(LocalClose::Shutdown),
                        };
                    }
                },
                () = &mut ping_sleep => {
                    if local_close.is_some() {
                        // close ack never arrived; the link is gone
                        return ConnectionEnd {
                            code: CloseCode::Normal,
                            local: local_close,
                        };
                    }
                    warn!("server ping deadline elapsed, closing stalled connection");
                    sink.close().await;
                    return ConnectionEnd {
                        code: CloseCode::Abnormal,
                        local: None,
                    };
                }
            }
        }
    }

    /// Handle an op while connected. Returns the local close kind when
    /// the op initiated a teardown.
    async fn handle_connected_op(
        &mut self,
        sink: &mut Box<dyn TransportSink>,
        op: Op,
        closing: bool,
    ) -> Option<LocalClose> {
        match op {
            Op::Connect { done } => {
                if closing {
                    // a teardown is in flight; reconnect once it finishes
                    self.core.set_want_connected(true);
                    self.connect_waiters.push(done);
                } else {
                    // already connected
                    let _ = done.send(Ok(()));
                }
                None
            }
            Op::Disconnect { done } => {
                self.core.set_want_connected(false);
                self.disconnect_waiters.push(done);
                self.set_state(ConnectionState::Disconnecting);
                sink.close().await;
                Some(LocalClose::Disconnect)
            }
            Op::Disable { done } => {
                self.core.set_disabled(true);
                self.core.set_want_connected(false);
                self.disconnect_waiters.push(done);
                self.set_state(ConnectionState::Disconnecting);
                sink.close().await;
                Some(LocalClose::Disable)
            }
            Op::Reset { reconnect, done } => {
                self.core.set_want_connected(reconnect);
                self.disconnect_waiters.push(done);
                self.set_state(ConnectionState::Disconnecting);
                sink.close().await;
                Some(LocalClose::Reset { reconnect })
            }
            Op::SendFrame { frame } => {
                if let Err(e) = sink.send(&frame).await {
                    warn!(error = %e, "command send failed");
                }
                None
            }
        }
    }

    // ─── Close handling ──────────────────────────────────────────────────────

    /// Finish a closed connection: fail pending commands, park entities,
    /// resolve waiters, and only then decide on a reconnect.
    async fn handle_close(&mut self, code: CloseCode, local: Option<LocalClose>) {
        info!(%code, "connection closed");
        self.core.commands.on_disconnect(code);
        for (_, entity) in self.core.registry.all() {
            entity.on_connectivity_change(false);
        }
        self.pending_frames.clear();
        self.set_state(ConnectionState::Disconnected);
        let _ = self.events.send(ClientEvent::Disconnected { code });
        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(());
        }

        match local {
            Some(LocalClose::Disconnect) | Some(LocalClose::Shutdown) => {}
            Some(LocalClose::Disable) => {
                self.core.commands.clear();
                self.core.registry.clear();
            }
            Some(LocalClose::Reset { reconnect }) => {
                self.core.commands.clear();
                self.core.registry.clear();
                if reconnect && !self.core.is_disabled() {
                    self.core.set_want_connected(true);
                    self.reconnect_at = Some(Instant::now());
                }
            }
            None => self.schedule_reconnect(code).await,
        }

        // a connect() arrived mid-teardown: honor it now
        if !self.connect_waiters.is_empty()
            && self.core.want_connected()
            && !self.core.is_disabled()
            && self.reconnect_at.is_none()
            && !self.network_waiting
        {
            self.reconnect_at = Some(Instant::now());
        }
    }

    /// Apply the reconnection policy for a non-local close.
    async fn schedule_reconnect(&mut self, code: CloseCode) {
        if !code.is_reconnectable() {
            info!(%code, "close is irrecoverable, staying disconnected");
            return;
        }
        if self.core.is_disabled() || !self.core.want_connected() {
            return;
        }
        if !self.probe.is_reachable().await {
            // suspend the intent until reachability returns; commands
            // issued in this window are dropped, not queued
            info!("network unreachable, suspending reconnection");
            self.core.set_want_connected(false);
            self.network_waiting = true;
            return;
        }
        let delay = match code.retry_delay_override() {
            // fixed wait; backoff state is deliberately untouched
            Some(delay) => delay,
            None => self.backoff.next_delay(),
        };
        debug!(?delay, "reconnect scheduled");
        self.reconnect_at = Some(Instant::now() + delay);
    }

    // ─── Dispatch ────────────────────────────────────────────────────────────

    /// Route every document of a batched frame. A malformed document
    /// fails the whole frame.
    fn dispatch_frame(&self, frame: &str) -> Result<(), CodecError> {
        for reply in decode_frame(frame)? {
            self.dispatch_reply(reply);
        }
        Ok(())
    }

    fn dispatch_reply(&self, reply: Reply) {
        if reply.is_server_ping() {
            trace!("server heartbeat");
            return;
        }
        if reply.id > 0 {
            self.core.commands.on_reply(reply);
            return;
        }
        if let Some(push) = reply.push {
            self.dispatch_push(push);
        }
    }

    fn dispatch_push(&self, push: Push) {
        METRICS.push_received(push.push_type());
        let Some(entity) = self.core.registry.get(&push.channel) else {
            debug!(channel = %push.channel, "push for unknown channel dropped");
            return;
        };
        if let Some(publication) = &push.publication {
            entity.deliver_publication(publication);
        } else if push.unsub.is_some() {
            info!(channel = %push.channel, "kicked from channel");
            entity.on_kick();
            self.core.registry.remove(&push.channel);
        } else {
            debug!(channel = %push.channel, "unrecognized push dropped");
        }
    }

    /// Re-establish entities the handshake did not recover.
    fn resubscribe_unsynced(&self) {
        for (channel, entity) in self.core.registry.all() {
            if entity.state() != SubscriptionState::Unsynced {
                continue;
            }
            let core = self.core.clone();
            tokio::spawn(async move {
                if let Err(e) = subscribe_entity(&core, &entity).await {
                    warn!(%channel, error = %e, "resubscribe after reconnect failed");
                }
            });
        }
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    fn set_state(&self, new: ConnectionState) {
        if self.core.store_state(new) != new {
            debug!(state = %new, "connection state changed");
            METRICS.connection_state_change(new.as_str());
        }
    }

    fn fail_connect_waiters(&mut self, error: &ClientError) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(clone_for_waiter(error)));
        }
    }
}

/// Reproduce an error for each pending connect waiter, preserving the
/// variants callers match on.
fn clone_for_waiter(error: &ClientError) -> ClientError {
    match error {
        ClientError::EmptyToken => ClientError::EmptyToken,
        ClientError::Disabled => ClientError::Disabled,
        ClientError::Server { code, message } => ClientError::Server {
            code: *code,
            message: message.clone(),
        },
        ClientError::Command(err) => ClientError::Command(err.clone()),
        other => ClientError::ConnectionFailed {
            reason: other.to_string(),
        },
    }
}
