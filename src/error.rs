//! Unified SDK error types.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::close::CloseCode;

/// Top-level client error, observable at the public API boundary.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("access token is empty")]
    EmptyToken,

    #[error("token provider returned an empty channel name")]
    EmptyChannel,

    #[error("token provider changed channel from {expected:?} to {got:?}")]
    ChannelChanged { expected: String, got: String },

    #[error("channel {channel:?} is already subscribed")]
    AlreadySubscribed { channel: String },

    #[error("channel {channel:?} is not subscribed")]
    AlreadyUnsubscribed { channel: String },

    #[error("connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("command failed: {0}")]
    Command(#[from] CommandError),

    #[error("token provider failed: {reason}")]
    TokenRetrieverFailed { reason: String },

    #[error("server error {code}: {message}")]
    Server { code: u32, message: String },

    #[error("subscription is disposed")]
    Disposed,

    #[error("client is disabled")]
    Disabled,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Failure of a single in-flight command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The transport dropped before the reply arrived.
    #[error("command interrupted by connection close ({code})")]
    Interrupted { code: CloseCode },

    /// No reply within the configured window.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// A command with this id is already pending.
    #[error("command id {0} is already pending")]
    DuplicateId(u32),
}

/// Protocol codec errors.
#[derive(Error, Debug)]
pub enum CodecError {
    /// A document inside a batched frame failed to parse. The whole frame
    /// is rejected, never partially applied.
    #[error("malformed frame: {source}")]
    Malformed {
        #[source]
        source: serde_json::Error,
    },

    #[error("command encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Transport-level failure, reported by the active `Connector`.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct TransportError(pub String);
