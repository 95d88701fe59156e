//! # Conduit SDK
//!
//! Realtime messaging client for the Conduit service: server-pushed
//! events over a single multiplexed WebSocket, speaking a JSON
//! command/reply protocol with channel subscriptions, stream recovery,
//! and transparent reconnection.
//!
//! ## Architecture
//!
//! The SDK is organized in layers:
//!
//! 1. **Protocol** — wire types, batched-frame codec, close codes
//! 2. **Core services** — backoff, command correlation, metrics
//! 3. **Collaborator seams** — transport, channel tokens, reachability
//! 4. **Subscriptions** — per-channel state machines and the registry
//! 5. **Client** — `ConduitClient`, the connection lifecycle driver
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use conduit_sdk::prelude::*;
//!
//! let mut config = ClientConfig::new("wss://realtime.example.com/conduit");
//! config.access_token = session_token;
//!
//! let client = ConduitClient::new(config);
//! client.connect().await?;
//!
//! let room = client.create_channel(Arc::new(StaticTokenProvider::new("room.42", token)));
//! room.subscribe().await?;
//! ```

// ── Layer 1: Protocol ────────────────────────────────────────────────────────

/// Wire types, batched-frame codec, close-code mapping.
pub mod protocol;

/// Unified SDK error types.
pub mod error;

// ── Layer 2: Core services ───────────────────────────────────────────────────

/// Reconnection backoff.
pub mod backoff;

/// Command id allocation and request/reply correlation.
pub mod command;

/// Client configuration.
pub mod config;

/// Metrics emitted through the `metrics` facade.
pub mod metrics;

// ── Layer 3: Collaborator seams ──────────────────────────────────────────────

/// Transport abstraction and the `tokio-tungstenite` implementation.
pub mod transport;

/// Per-channel token providers.
pub mod token;

/// Network reachability probing.
pub mod network;

// ── Layer 4: Subscriptions ───────────────────────────────────────────────────

/// Subscription entities and the channel registry.
pub mod subscription;

// ── Layer 5: Client ──────────────────────────────────────────────────────────

/// `ConduitClient` — the primary entry point.
pub mod client;

// ── Prelude ──────────────────────────────────────────────────────────────────

pub mod prelude {
    pub use crate::client::{ClientEvent, ConduitClient, ConnectionState};
    pub use crate::config::{BackoffConfig, ClientConfig};
    pub use crate::error::{ClientError, CommandError};
    pub use crate::protocol::{CloseCode, Payload};
    pub use crate::subscription::{Subscription, SubscriptionEvent, SubscriptionState};
    pub use crate::token::{ChannelToken, ChannelTokenProvider, StaticTokenProvider};
}
