//! Protocol codec — command encoding, batched-frame decoding, close codes.
//!
//! The server batches documents by joining them with `\n` inside a single
//! text frame. Every document in a batch must parse; a single bad line
//! rejects the whole frame so the caller can tear the connection down
//! instead of silently dropping messages.

pub mod close;
pub mod wire;

pub use close::CloseCode;
pub use wire::{
    Command, CommandBody, ConnectRequest, ConnectResult, Payload, Publication, PublicationData,
    Push, Reply, ReplyError, SubscribeRequest, SubscribeResult, UnsubscribeRequest,
};

use crate::error::CodecError;

/// Heartbeat frame, sent by the server and echoed by the client when the
/// handshake requested it.
pub const PONG_FRAME: &str = "{}";

/// Encode one command as a single JSON document. One command per frame.
pub fn encode_command(command: &Command) -> Result<String, CodecError> {
    serde_json::to_string(command).map_err(CodecError::Encode)
}

/// Decode an inbound frame into its batched replies.
///
/// Splits on `\n`, skipping blank lines. Returns the replies in frame
/// order, or an error if any document is malformed.
pub fn decode_frame(frame: &str) -> Result<Vec<Reply>, CodecError> {
    frame
        .split('\n')
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(|source| CodecError::Malformed { source }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_single_object_frame() {
        let cmd = Command::new(
            1,
            CommandBody::Unsubscribe(UnsubscribeRequest {
                channel: "c".into(),
            }),
        );
        let frame = encode_command(&cmd).unwrap();
        assert!(!frame.contains('\n'));
        serde_json::from_str::<serde_json::Value>(&frame).unwrap();
    }

    #[test]
    fn test_decode_single_document() {
        let replies = decode_frame(r#"{"id":1,"connect":{"ping":25,"pong":true}}"#).unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, 1);
    }

    #[test]
    fn test_decode_batched_frame_in_order() {
        let frame = "{\"id\":1,\"subscribe\":{\"epoch\":\"e\",\"offset\":0}}\n\
                     {\"push\":{\"channel\":\"c\",\"pub\":{\"offset\":1,\"data\":{\"payload\":\"a\"}}}}\n\
                     {\"push\":{\"channel\":\"c\",\"pub\":{\"offset\":2,\"data\":{\"payload\":\"b\"}}}}";
        let replies = decode_frame(frame).unwrap();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0].id, 1);
        let first = replies[1].push.as_ref().unwrap();
        let second = replies[2].push.as_ref().unwrap();
        assert_eq!(first.publication.as_ref().unwrap().offset, 1);
        assert_eq!(second.publication.as_ref().unwrap().offset, 2);
    }

    #[test]
    fn test_decode_skips_blank_lines() {
        let replies = decode_frame("{}\n\n{}\n").unwrap();
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(Reply::is_server_ping));
    }

    #[test]
    fn test_bad_line_fails_whole_frame() {
        let frame = "{\"id\":1}\nnot json\n{\"id\":2}";
        assert!(decode_frame(frame).is_err());
    }

    #[test]
    fn test_heartbeat_frame() {
        let replies = decode_frame(PONG_FRAME).unwrap();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_server_ping());
    }
}
