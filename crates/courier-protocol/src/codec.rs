//! Codec for encoding and decoding Courier messages.
//!
//! Messages travel as JSON text, one message per WebSocket frame.

use thiserror::Error;

use crate::message::Message;

/// Default maximum frame size accepted by the decoder (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// JSON decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encode a message to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(message: &Message) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(ProtocolError::Encode)
}

/// Decode a message from a frame payload using [`MAX_FRAME_SIZE`].
///
/// # Errors
///
/// Returns an error if the frame is too large or is not a valid message.
pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    decode_with_limit(data, MAX_FRAME_SIZE)
}

/// Decode a message from a frame payload of at most `max` bytes.
///
/// Text and binary frames are both accepted; the payload must be a JSON
/// object.
///
/// # Errors
///
/// Returns an error if the frame is too large or is not a valid message.
pub fn decode_with_limit(data: &[u8], max: usize) -> Result<Message, ProtocolError> {
    if data.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max,
        });
    }

    serde_json::from_slice(data).map_err(ProtocolError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    #[test]
    fn test_decode_client_frame() {
        let raw = br#"{"fromID":"a","toID":"server","messageType":"registration","body":"alice"}"#;
        let msg = decode(raw).unwrap();
        assert_eq!(msg.from_id, "a");
        assert!(msg.is_for_server());
        assert_eq!(msg.message_type, MessageType::Registration);
        assert_eq!(msg.body, "alice");
    }

    #[test]
    fn test_decode_garbage() {
        match decode(b"not json") {
            Err(ProtocolError::Decode(_)) => {}
            other => panic!("Expected Decode error, got {:?}", other),
        }

        // A JSON value that is not an object is still malformed
        assert!(matches!(decode(b"[1, 2]"), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_frame_too_large() {
        let body = "x".repeat(MAX_FRAME_SIZE);
        let frame = format!(r#"{{"fromID":"a","toID":"mainRoom","messageType":"message","body":"{body}"}}"#);

        match decode(frame.as_bytes()) {
            Err(ProtocolError::FrameTooLarge { max, .. }) => assert_eq!(max, MAX_FRAME_SIZE),
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_with_raised_limit() {
        let body = "x".repeat(100 * 1024);
        let frame = format!(r#"{{"fromID":"a","toID":"mainRoom","messageType":"message","body":"{body}"}}"#);

        let msg = decode_with_limit(frame.as_bytes(), 1024 * 1024).unwrap();
        assert_eq!(msg.body.len(), 100 * 1024);

        assert!(matches!(
            decode_with_limit(frame.as_bytes(), 1024),
            Err(ProtocolError::FrameTooLarge { max: 1024, .. })
        ));
    }

    #[test]
    fn test_encode_preserves_unknown_type() {
        let msg = Message::new("a", "b", MessageType::Other("typing".into()), "...");
        let encoded = encode(&msg).unwrap();
        assert!(encoded.contains(r#""messageType":"typing""#));
        assert_eq!(decode(encoded.as_bytes()).unwrap(), msg);
    }
}
