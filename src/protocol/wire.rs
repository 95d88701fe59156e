//! Wire types for the Conduit command/reply protocol.
//!
//! Outbound commands: `{"id": N, "method": "subscribe", "params": {...}}`.
//! Inbound replies carry a set of optional sub-objects; the receiver
//! discriminates by which field is present. A reply with `id == 0` and no
//! `push` field is a server heartbeat (the literal frame `{}`).

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ─── Outbound commands ───────────────────────────────────────────────────────

/// A single client→server command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub id: u32,
    #[serde(flatten)]
    pub body: CommandBody,
}

impl Command {
    pub fn new(id: u32, body: CommandBody) -> Self {
        Self { id, body }
    }

    /// Method label, used for logging and command metrics.
    pub fn method(&self) -> &'static str {
        self.body.method()
    }
}

/// Method-specific command payloads.
///
/// Wire format: `{"method": "connect", "params": {...}}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", content = "params", rename_all = "lowercase")]
pub enum CommandBody {
    Connect(ConnectRequest),
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    Publish(PublishRequest),
}

impl CommandBody {
    pub fn method(&self) -> &'static str {
        match self {
            CommandBody::Connect(_) => "connect",
            CommandBody::Subscribe(_) => "subscribe",
            CommandBody::Unsubscribe(_) => "unsubscribe",
            CommandBody::Publish(_) => "publish",
        }
    }
}

/// Handshake parameters: the session bearer token plus recovery requests
/// for every channel the client wants re-established.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConnectRequest {
    pub token: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subs: Vec<SubscribeRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SubscribeRequest {
    pub channel: String,
    pub token: String,
    pub recover: bool,
    pub offset: u64,
    #[serde(default)]
    pub epoch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnsubscribeRequest {
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishRequest {
    pub channel: String,
    pub data: serde_json::Value,
}

// ─── Inbound replies ─────────────────────────────────────────────────────────

/// A single server→client document. All fields are optional; presence
/// decides the meaning.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Reply {
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub error: Option<ReplyError>,
    #[serde(default)]
    pub connect: Option<ConnectResult>,
    #[serde(default)]
    pub subscribe: Option<SubscribeResult>,
    #[serde(default)]
    pub unsubscribe: Option<UnsubscribeResult>,
    #[serde(default)]
    pub push: Option<Push>,
}

impl Reply {
    /// A server heartbeat is the literal frame `{}`: no command id, no push.
    pub fn is_server_ping(&self) -> bool {
        self.id == 0 && self.push.is_none()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReplyError {
    pub code: u32,
    pub message: String,
}

/// Result of the `connect` handshake.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConnectResult {
    #[serde(default)]
    pub client: Option<String>,
    /// Server-advertised ping interval, seconds.
    #[serde(default)]
    pub ping: u32,
    /// Whether the client must echo the heartbeat frame.
    #[serde(default)]
    pub pong: bool,
    /// Per-channel recovery results, keyed by channel name.
    #[serde(default)]
    pub subs: BTreeMap<String, SubscribeResult>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SubscribeResult {
    #[serde(default)]
    pub epoch: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub recoverable: bool,
    /// Catch-up publications, delivered in array order.
    #[serde(default)]
    pub publications: Option<Vec<Publication>>,
    /// Embedded single-publication form (`result.data.data.payload`).
    #[serde(default)]
    pub data: Option<NestedPayload>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct UnsubscribeResult {}

#[derive(Debug, Clone, Deserialize)]
pub struct NestedPayload {
    pub data: PublicationData,
}

// ─── Pushes ──────────────────────────────────────────────────────────────────

/// Server-initiated message for a channel, typed by which sub-object is
/// present.
#[derive(Debug, Clone, Deserialize)]
pub struct Push {
    pub channel: String,
    #[serde(default, rename = "pub")]
    pub publication: Option<Publication>,
    #[serde(default)]
    pub unsub: Option<Unsub>,
}

impl Push {
    /// Label for the `push_received` metric.
    pub fn push_type(&self) -> &'static str {
        if self.publication.is_some() {
            "pub"
        } else if self.unsub.is_some() {
            "unsub"
        } else {
            "unknown"
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Unsub {}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Publication {
    #[serde(default)]
    pub offset: u64,
    pub data: PublicationData,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PublicationData {
    pub payload: Payload,
}

// ─── Payload ─────────────────────────────────────────────────────────────────

/// Opaque UTF-8 publication payload. Subscribers may read it either as
/// text or as its raw byte representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Payload(String);

impl Payload {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Serialize for Payload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Payload(s))
    }
}
