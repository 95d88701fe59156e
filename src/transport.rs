//! Transport seam — the connection manager owns exactly one transport at
//! a time, created per connect attempt and discarded on close.
//!
//! The production implementation rides on `tokio-tungstenite`; tests and
//! embedders can supply their own [`Connector`]. Inbound traffic is
//! delivered as [`TransportEvent`]s on a channel so the core never blocks
//! on transport I/O threads.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::metrics::METRICS;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Inbound transport traffic. A successful `connect` implies the open
/// event; `Closed` is always the final event of a connection.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// One text frame. Payloads are opaque to the transport.
    Message(String),
    /// Non-fatal transport error; a `Closed` event follows separately.
    Error(String),
    /// The connection is gone, with the observed close code.
    Closed { code: u16 },
}

/// Write half of an active connection.
#[async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, frame: &str) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// An established connection: the write half plus the inbound event
/// stream.
pub struct TransportHandle {
    pub sink: Box<dyn TransportSink>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Factory for transports. Called once per connect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<TransportHandle, TransportError>;
}

// ─── tokio-tungstenite implementation ────────────────────────────────────────

/// Production connector over `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<TransportHandle, TransportError> {
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| TransportError("connection timeout".into()))?
            .map_err(|e| TransportError(e.to_string()))?;

        let (sink, stream) = ws_stream.split();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(stream, event_tx));

        Ok(TransportHandle {
            sink: Box::new(WsSink { inner: sink }),
            events: event_rx,
        })
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self
            .inner
            .send(Message::Close(Some(CloseFrame {
                code: WsCloseCode::Normal,
                reason: "client disconnect".into(),
            })))
            .await;
        let _ = self.inner.close().await;
    }
}

/// Reads the socket until it dies, translating frames into events.
async fn pump(mut stream: SplitStream<WsStream>, tx: mpsc::UnboundedSender<TransportEvent>) {
    let mut close_code: Option<u16> = None;

    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Text(text)) => {
                let text_str: &str = text.as_ref();
                if tx
                    .send(TransportEvent::Message(text_str.to_owned()))
                    .is_err()
                {
                    return;
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
                trace!("ignoring websocket control frame");
            }
            Ok(Message::Binary(_)) => {
                warn!("ignoring unexpected binary frame");
            }
            Ok(Message::Close(frame)) => {
                let (code, reason) = extract_close(frame.as_ref());
                debug!(code, %reason, "websocket closed by peer");
                close_code = Some(code);
                break;
            }
            Err(e) => {
                METRICS.websocket_error();
                let _ = tx.send(TransportEvent::Error(e.to_string()));
                break;
            }
        }
    }

    // 1006: the stream ended without a close frame
    let _ = tx.send(TransportEvent::Closed {
        code: close_code.unwrap_or(1006),
    });
}

/// Extract close code and reason from an optional CloseFrame.
fn extract_close(frame: Option<&CloseFrame>) -> (u16, String) {
    match frame {
        Some(f) => (f.code.into(), f.reason.to_string()),
        None => (1006, "no close frame".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_close_with_frame() {
        let frame = CloseFrame {
            code: WsCloseCode::Normal,
            reason: "goodbye".into(),
        };
        let (code, reason) = extract_close(Some(&frame));
        assert_eq!(code, 1000);
        assert_eq!(reason, "goodbye");
    }

    #[test]
    fn test_extract_close_no_frame() {
        let (code, _) = extract_close(None);
        assert_eq!(code, 1006);
    }
}
