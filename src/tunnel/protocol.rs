//! Wire protocol for the edge tunnel.
//!
//! The data plane uses binary WebSocket messages, one frame each
//! (10-byte header + variable payload):
//! ```text
//! | request_id (4B) | msg_type (1B) | flags (1B) | payload_len (4B) | payload (NB) |
//! ```
//!
//! The control plane uses text WebSocket messages and never enters the
//! frame codec: `REGISTER <code> <subdomain> <token>`, `HEARTBEAT`,
//! `STATUS <json>` from the edge; `OK Registered` / `ERROR <reason>`
//! from the relay.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_SIZE: usize = 10;

/// Frame flags.
pub mod flags {
    pub const END_STREAM: u8 = 0x01;
}

/// Message types for the tunnel data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    RequestHeaders = 0x01,
    RequestBody = 0x02,
    ResponseHeaders = 0x03,
    ResponseBody = 0x04,
    StreamEnd = 0x05,
    StreamError = 0x06,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::RequestHeaders),
            0x02 => Some(Self::RequestBody),
            0x03 => Some(Self::ResponseHeaders),
            0x04 => Some(Self::ResponseBody),
            0x05 => Some(Self::StreamEnd),
            0x06 => Some(Self::StreamError),
            _ => None,
        }
    }
}

/// A single multiplexed frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub request_id: u32,
    pub msg_type: MsgType,
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(request_id: u32, msg_type: MsgType, flags: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            msg_type,
            flags,
            payload: payload.into(),
        }
    }

    /// Empty END_STREAM frame terminating one direction of a request.
    pub fn end_of(request_id: u32, msg_type: MsgType) -> Self {
        Self::new(request_id, msg_type, flags::END_STREAM, Bytes::new())
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags & flags::END_STREAM != 0
    }

    /// Encode into a binary buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.request_id);
        buf.put_u8(self.msg_type as u8);
        buf.put_u8(self.flags);
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode from a binary buffer.
    pub fn decode(mut data: Bytes) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::TooShort {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        let request_id = data.get_u32();
        let msg_type_raw = data.get_u8();
        let frame_flags = data.get_u8();
        let payload_len = data.get_u32() as usize;

        if data.remaining() < payload_len {
            return Err(ProtocolError::Incomplete {
                expected: HEADER_SIZE + payload_len,
                actual: HEADER_SIZE + data.remaining(),
            });
        }

        let msg_type =
            MsgType::from_u8(msg_type_raw).ok_or(ProtocolError::UnknownMsgType(msg_type_raw))?;
        let payload = data.split_to(payload_len);

        Ok(Self {
            request_id,
            msg_type,
            flags: frame_flags,
            payload,
        })
    }
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("frame incomplete: expected {expected} bytes, got {actual}")]
    Incomplete { expected: usize, actual: usize },
    #[error("unknown message type: 0x{0:02x}")]
    UnknownMsgType(u8),
    #[error("malformed control message")]
    MalformedControl,
}

/// Control-plane messages carried as WebSocket text frames (edge to relay).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMsg {
    Register {
        code: String,
        subdomain: String,
        token: String,
    },
    Heartbeat,
    Status(String),
}

/// Parse a text control line from the edge.
pub fn parse_control(line: &str) -> Result<ControlMsg, ProtocolError> {
    let line = line.trim();
    if line == "HEARTBEAT" {
        return Ok(ControlMsg::Heartbeat);
    }
    if line == "STATUS" {
        return Ok(ControlMsg::Status(String::new()));
    }
    if let Some(rest) = line.strip_prefix("STATUS ") {
        return Ok(ControlMsg::Status(rest.trim().to_string()));
    }
    if let Some(rest) = line.strip_prefix("REGISTER ") {
        let mut parts = rest.split_whitespace();
        return match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(code), Some(subdomain), Some(token), None) => Ok(ControlMsg::Register {
                code: code.to_string(),
                subdomain: subdomain.to_string(),
                token: token.to_string(),
            }),
            _ => Err(ProtocolError::MalformedControl),
        };
    }
    Err(ProtocolError::MalformedControl)
}

/// Registration acknowledgment sent to the edge.
pub const REPLY_OK: &str = "OK Registered";

/// Registration rejection line sent to the edge.
pub fn reply_error(reason: impl std::fmt::Display) -> String {
    format!("ERROR {reason}")
}

/// JSON payload for REQUEST_HEADERS frames (relay to edge).
///
/// Headers are a list, not a map, so duplicate keys keep their order.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct RequestMeta {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

/// JSON payload for RESPONSE_HEADERS frames (edge to relay).
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ResponseMeta {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::new(7, MsgType::ResponseBody, flags::END_STREAM, &b"hello"[..]);
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded.request_id, 7);
        assert_eq!(decoded.msg_type, MsgType::ResponseBody);
        assert!(decoded.is_end_stream());
        assert_eq!(&decoded.payload[..], b"hello");
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let err = Frame::decode(Bytes::from_static(&[0, 0, 0, 1, 3])).unwrap_err();
        assert!(matches!(err, ProtocolError::TooShort { .. }));
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let mut data = Frame::new(1, MsgType::ResponseBody, 0, &b"abcdef"[..])
            .encode()
            .to_vec();
        data.truncate(HEADER_SIZE + 2);
        let err = Frame::decode(Bytes::from(data)).unwrap_err();
        assert!(matches!(err, ProtocolError::Incomplete { .. }));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut data = Frame::new(1, MsgType::StreamEnd, 0, Bytes::new())
            .encode()
            .to_vec();
        data[4] = 0x7f;
        let err = Frame::decode(Bytes::from(data)).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMsgType(0x7f)));
    }

    #[test]
    fn parse_register_line() {
        let msg = parse_control("REGISTER a a.example.test t1").unwrap();
        assert_eq!(
            msg,
            ControlMsg::Register {
                code: "a".into(),
                subdomain: "a.example.test".into(),
                token: "t1".into(),
            }
        );
    }

    #[test]
    fn parse_register_wrong_arity() {
        assert!(parse_control("REGISTER a a.example.test").is_err());
        assert!(parse_control("REGISTER a a.example.test t1 extra").is_err());
        assert!(parse_control("REGISTER").is_err());
    }

    #[test]
    fn parse_heartbeat_and_status() {
        assert_eq!(parse_control("HEARTBEAT").unwrap(), ControlMsg::Heartbeat);
        assert_eq!(
            parse_control("STATUS {\"healthy\":true}").unwrap(),
            ControlMsg::Status("{\"healthy\":true}".into())
        );
        assert!(parse_control("HEARTBEATS").is_err());
    }

    #[test]
    fn response_meta_keeps_duplicate_headers() {
        let meta = ResponseMeta {
            status: 200,
            headers: vec![
                ("set-cookie".into(), "a=1".into()),
                ("set-cookie".into(), "b=2".into()),
            ],
        };
        let parsed: ResponseMeta =
            serde_json::from_slice(&serde_json::to_vec(&meta).unwrap()).unwrap();
        assert_eq!(parsed.headers.len(), 2);
        assert_eq!(parsed.headers[1].1, "b=2");
    }
}
