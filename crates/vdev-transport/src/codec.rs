//! Wire frame encoding and decoding for the device channels.
//!
//! Two frame shapes exist on the wire: UTF-8 JSON control frames carrying an
//! integer `id`, and binary frames whose 8-byte header is a little-endian
//! u32 request id followed by 4 reserved bytes. An empty binary payload is
//! the end-of-stream marker for its id.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{AgentError, AgentResult};

/// Length of the binary frame header: 4-byte little-endian request id plus
/// 4 reserved bytes.
pub const BINARY_HEADER_LEN: usize = 8;

/// A decoded wire frame.
#[derive(Clone, Debug)]
pub enum Frame {
    /// JSON control frame. Inbound frames carry the correlation `id` of the
    /// request they answer.
    Control(Value),
    /// Binary payload chunk tagged with a request id.
    Binary {
        /// Correlation id from the frame header.
        id: u32,
        /// Payload after the header; empty marks end-of-stream.
        payload: Bytes,
    },
}

impl Frame {
    /// Correlation id of the frame, if present.
    pub fn id(&self) -> Option<u32> {
        match self {
            Self::Control(value) => control_id(value),
            Self::Binary { id, .. } => Some(*id),
        }
    }

    /// True for the empty binary frame that terminates a stream.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Self::Binary { payload, .. } if payload.is_empty())
    }
}

/// Extract the integer correlation id from a control frame body.
pub(crate) fn control_id(value: &Value) -> Option<u32> {
    value
        .get("id")
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
}

/// Encode a control frame, merging `id` into the message object.
pub(crate) fn encode_control(mut message: Value, id: u32) -> AgentResult<Message> {
    let Some(object) = message.as_object_mut() else {
        return Err(AgentError::protocol(
            "control frame payload must be a JSON object",
        ));
    };
    object.insert("id".to_string(), Value::from(id));
    Ok(Message::text(serde_json::to_string(&message)?))
}

/// Encode a binary frame under `id`. The reserved header bytes are written
/// as zero; receivers ignore them.
pub(crate) fn encode_binary(id: u32, payload: &[u8]) -> Message {
    let mut buf = BytesMut::with_capacity(BINARY_HEADER_LEN + payload.len());
    buf.put_u32_le(id);
    buf.put_u32_le(0);
    buf.put_slice(payload);
    Message::binary(buf.freeze())
}

/// Decode an inbound message into a [`Frame`].
///
/// Text payloads must parse as JSON; binary payloads must be at least
/// [`BINARY_HEADER_LEN`] bytes. Anything else is a protocol error the caller
/// logs and drops without failing the connection.
pub(crate) fn decode(message: Message) -> AgentResult<Frame> {
    match message {
        Message::Text(text) => {
            let value: Value = serde_json::from_str(&text)
                .map_err(|e| AgentError::protocol(format!("invalid control frame: {e}")))?;
            Ok(Frame::Control(value))
        }
        Message::Binary(data) => {
            if data.len() < BINARY_HEADER_LEN {
                return Err(AgentError::protocol(format!(
                    "binary frame shorter than {BINARY_HEADER_LEN}-byte header: {} bytes",
                    data.len()
                )));
            }
            let id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            let payload = data.slice(BINARY_HEADER_LEN..);
            Ok(Frame::Binary { id, payload })
        }
        other => Err(AgentError::protocol(format!(
            "unexpected message type: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_control_round_trip() {
        let message = encode_control(json!({"type": "app", "op": "list"}), 7).expect("encode");
        let frame = decode(message).expect("decode");

        match frame {
            Frame::Control(value) => {
                assert_eq!(value["id"], 7);
                assert_eq!(value["type"], "app");
                assert_eq!(value["op"], "list");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_encode_control_overwrites_caller_id() {
        let message = encode_control(json!({"id": 99, "type": "app"}), 3).expect("encode");
        let frame = decode(message).expect("decode");
        assert_eq!(frame.id(), Some(3));
    }

    #[test]
    fn test_encode_control_rejects_non_object() {
        let result = encode_control(json!([1, 2, 3]), 1);
        assert!(matches!(result, Err(AgentError::Protocol { .. })));
    }

    #[test]
    fn test_binary_round_trip() {
        let message = encode_binary(42, b"payload");
        let frame = decode(message).expect("decode");

        match frame {
            Frame::Binary { id, payload } => {
                assert_eq!(id, 42);
                assert_eq!(&payload[..], b"payload");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_reserved_header_bytes_are_ignored() {
        let mut data = Vec::new();
        data.extend_from_slice(&5u32.to_le_bytes());
        data.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        data.extend_from_slice(b"x");

        let frame = decode(Message::binary(data)).expect("decode");
        assert_eq!(frame.id(), Some(5));
    }

    #[test]
    fn test_empty_payload_is_terminator() {
        let frame = decode(encode_binary(9, &[])).expect("decode");
        assert!(frame.is_terminator());

        let frame = decode(encode_binary(9, b"more")).expect("decode");
        assert!(!frame.is_terminator());
    }

    #[test]
    fn test_short_binary_frame_is_protocol_error() {
        let result = decode(Message::binary(vec![1, 2, 3]));
        assert!(matches!(result, Err(AgentError::Protocol { .. })));
    }

    #[test]
    fn test_invalid_json_is_protocol_error() {
        let result = decode(Message::text("not json"));
        assert!(matches!(result, Err(AgentError::Protocol { .. })));
    }

    #[test]
    fn test_control_id_requires_integer() {
        assert_eq!(control_id(&json!({"id": 4})), Some(4));
        assert_eq!(control_id(&json!({"id": "4"})), None);
        assert_eq!(control_id(&json!({})), None);
    }
}
