//! JSON message protocol for host-guest communication over vsock.
//!
//! ## Wire Format
//!
//! ```text
//! [4-byte big-endian length][JSON body]
//! ```
//!
//! The body is a JSON object `{"type": ..., "id": ..., "payload": ...}`.
//! `id` is a request correlation token chosen by the sender of a request
//! and echoed by the responder; responses are matched by `id`, never by
//! arrival order.
//!
//! ## Message Types
//!
//! | Type          | Direction | Payload |
//! |---------------|-----------|---------|
//! | `ready`       | G→H       | (none) |
//! | `ping`        | H→G       | (none) |
//! | `pong`        | G→H       | (none) |
//! | `exec`        | H→G       | `{command, timeoutMs}` |
//! | `exec_result` | G→H       | `{exitCode, stdout, stderr}` |
//! | `error`       | G→H       | `{message}` |

use serde::{Deserialize, Serialize};

/// Header size (4-byte length prefix).
pub const HEADER_SIZE: usize = 4;

/// Maximum message body size (1 MiB). A body of exactly this size is valid.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Vsock port the guest agent dials; Firecracker bridges it to the UDS
/// `{vsock_path}_{port}` on the host side.
pub const VSOCK_PORT: u32 = 1000;

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message too large: {0} bytes (max {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),
}

/// One framed message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Ready { id: String },
    Ping { id: String },
    Pong { id: String },
    Exec { id: String, payload: ExecPayload },
    ExecResult { id: String, payload: ExecResultPayload },
    Error { id: String, payload: ErrorPayload },
}

impl Message {
    /// The correlation id of this message.
    pub fn id(&self) -> &str {
        match self {
            Self::Ready { id }
            | Self::Ping { id }
            | Self::Pong { id }
            | Self::Exec { id, .. }
            | Self::ExecResult { id, .. }
            | Self::Error { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecPayload {
    pub command: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecResultPayload {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub message: String,
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode a message as `[4-byte length][JSON body]`.
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Incremental frame decoder.
///
/// Feed raw bytes from the stream; complete messages are returned as they
/// become available. Partial frames are buffered across calls.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed `data` into the decoder and return all complete messages.
    ///
    /// A declared body length above [`MAX_MESSAGE_SIZE`] fails the whole
    /// stream — the peer is misbehaving and framing can no longer be
    /// trusted.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Message>, ProtocolError> {
        self.buf.extend_from_slice(data);

        let mut messages = Vec::new();
        loop {
            let Some(header) = self.buf.get(..HEADER_SIZE) else {
                break;
            };
            // get() guarantees exactly HEADER_SIZE bytes
            let len_bytes: [u8; HEADER_SIZE] = header.try_into().unwrap_or_default();
            let body_len = u32::from_be_bytes(len_bytes) as usize;
            if body_len > MAX_MESSAGE_SIZE {
                return Err(ProtocolError::MessageTooLarge(body_len));
            }

            let frame_len = HEADER_SIZE + body_len;
            let Some(body) = self.buf.get(HEADER_SIZE..frame_len) else {
                break;
            };

            let msg: Message = serde_json::from_slice(body)?;
            messages.push(msg);
            self.buf.drain(..frame_len);
        }

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_msg(id: &str) -> Message {
        Message::Exec {
            id: id.into(),
            payload: ExecPayload {
                command: "echo hello".into(),
                timeout_ms: 5000,
            },
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let msg = exec_msg("req-1");
        let bytes = encode(&msg).unwrap();

        let mut decoder = Decoder::new();
        let decoded = decoder.decode(&bytes).unwrap();
        assert_eq!(decoded, vec![msg]);
    }

    #[test]
    fn decode_handles_partial_frames() {
        let msg = exec_msg("req-2");
        let bytes = encode(&msg).unwrap();

        let mut decoder = Decoder::new();
        let (first, rest) = bytes.split_at(7);
        assert!(decoder.decode(first).unwrap().is_empty());
        assert_eq!(decoder.decode(rest).unwrap(), vec![msg]);
    }

    #[test]
    fn decode_handles_multiple_frames_in_one_read() {
        let a = Message::Ping { id: "a".into() };
        let b = Message::Pong { id: "b".into() };
        let mut bytes = encode(&a).unwrap();
        bytes.extend_from_slice(&encode(&b).unwrap());

        let mut decoder = Decoder::new();
        let decoded = decoder.decode(&bytes).unwrap();
        assert_eq!(decoded, vec![a, b]);
    }

    #[test]
    fn decode_byte_at_a_time() {
        let msg = Message::Error {
            id: "e".into(),
            payload: ErrorPayload {
                message: "boom".into(),
            },
        };
        let bytes = encode(&msg).unwrap();

        let mut decoder = Decoder::new();
        let mut decoded = Vec::new();
        for b in &bytes {
            decoded.extend(decoder.decode(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(decoded, vec![msg]);
    }

    #[test]
    fn message_of_exactly_max_size_decodes() {
        // Build an exec_result whose JSON body is exactly MAX_MESSAGE_SIZE.
        let skeleton = Message::ExecResult {
            id: "x".into(),
            payload: ExecResultPayload {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            },
        };
        let overhead = serde_json::to_vec(&skeleton).unwrap().len();
        let msg = Message::ExecResult {
            id: "x".into(),
            payload: ExecResultPayload {
                exit_code: 0,
                stdout: "a".repeat(MAX_MESSAGE_SIZE - overhead),
                stderr: String::new(),
            },
        };
        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + MAX_MESSAGE_SIZE);

        let mut decoder = Decoder::new();
        let decoded = decoder.decode(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn message_one_byte_over_max_is_rejected() {
        // encode() refuses to produce an oversize frame...
        let msg = Message::ExecResult {
            id: "x".into(),
            payload: ExecResultPayload {
                exit_code: 0,
                stdout: "a".repeat(MAX_MESSAGE_SIZE),
                stderr: String::new(),
            },
        };
        assert!(matches!(
            encode(&msg),
            Err(ProtocolError::MessageTooLarge(_))
        ));

        // ...and decode() rejects a declared length one over the cap.
        let mut frame = Vec::new();
        frame.extend_from_slice(&((MAX_MESSAGE_SIZE as u32) + 1).to_be_bytes());
        frame.extend_from_slice(&[b'{']);
        let mut decoder = Decoder::new();
        assert!(matches!(
            decoder.decode(&frame),
            Err(ProtocolError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn invalid_json_body_is_rejected() {
        let body = b"not json";
        let mut frame = Vec::new();
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(body);

        let mut decoder = Decoder::new();
        assert!(matches!(
            decoder.decode(&frame),
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    #[test]
    fn wire_format_uses_declared_type_tags() {
        let bytes = encode(&exec_msg("42")).unwrap();
        let body: serde_json::Value =
            serde_json::from_slice(bytes.get(HEADER_SIZE..).unwrap()).unwrap();
        assert_eq!(body["type"], "exec");
        assert_eq!(body["id"], "42");
        assert_eq!(body["payload"]["command"], "echo hello");
        assert_eq!(body["payload"]["timeoutMs"], 5000);
    }

    #[test]
    fn id_accessor_returns_correlation_token() {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::Pong { id: id.clone() };
        assert_eq!(msg.id(), id);
    }
}
