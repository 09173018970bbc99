//! Wire protocol for HTTP tunneling over a data channel
//!
//! Every data channel message is one frame, either JSON text or raw bytes:
//! - Request:   text `{url, method, headers?}`
//! - Ping:      a request whose `url` starts with `ping`
//! - Pong:      text `{"status":200}` then text `pong`
//! - Heartbeat: text `{"status":202}`, repeated while a fetch is in flight
//! - Response:  text `{status, content-type, content-length}` then a binary
//!   body frame, unless status is 204 (no body frame at all)
//! - Too large: text `{"status":413}` alone when the body exceeds the
//!   channel's message size limit

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Payload of the second pong frame
pub const PONG_PAYLOAD: &str = "pong";

/// Request url prefix that marks a keepalive ping
pub const PING_PREFIX: &str = "ping";

pub const STATUS_OK: u16 = 200;
pub const STATUS_ACCEPTED: u16 = 202;
pub const STATUS_NO_CONTENT: u16 = 204;
pub const STATUS_PAYLOAD_TOO_LARGE: u16 = 413;
pub const STATUS_INTERNAL_ERROR: u16 = 500;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("request is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("request is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// A single data channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(s) => s.as_bytes(),
            Frame::Binary(b) => b,
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

/// HTTP request asked for by the remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

impl TunnelRequest {
    pub fn new(url: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            headers: None,
        }
    }

    /// Decode a request from either a text or a binary frame
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let text = match frame {
            Frame::Text(s) => s.as_str(),
            Frame::Binary(b) => std::str::from_utf8(b)?,
        };
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Ok(Frame::Text(serde_json::to_string(self)?))
    }

    /// Keepalive ping from the client, answered without touching the network
    pub fn is_ping(&self) -> bool {
        self.url.starts_with(PING_PREFIX)
    }
}

/// Header frame sent ahead of a response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelResponseHeader {
    pub status: u16,
    #[serde(rename = "content-type", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(rename = "content-length", default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
}

impl TunnelResponseHeader {
    /// Header carrying only a status code
    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            content_length: None,
        }
    }

    pub fn pong() -> Self {
        Self::status(STATUS_OK)
    }

    /// "Still working" heartbeat
    pub fn heartbeat() -> Self {
        Self::status(STATUS_ACCEPTED)
    }

    pub fn internal_error() -> Self {
        Self::status(STATUS_INTERNAL_ERROR)
    }

    /// Upstream body does not fit in one data channel message
    pub fn too_large() -> Self {
        Self::status(STATUS_PAYLOAD_TOO_LARGE)
    }

    pub fn has_body(&self) -> bool {
        self.status != STATUS_NO_CONTENT
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Ok(Frame::Text(serde_json::to_string(self)?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(frame.as_bytes())?)
    }
}

/// Second frame of a pong
pub fn pong_payload() -> Frame {
    Frame::Text(PONG_PAYLOAD.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_to_get() {
        let frame = Frame::Text(r#"{"url":"http://localhost:8778/api/status"}"#.to_string());
        let req = TunnelRequest::from_frame(&frame).unwrap();
        assert_eq!(req.method, "GET");
        assert!(req.headers.is_none());
        assert!(!req.is_ping());
    }

    #[test]
    fn test_request_from_binary_frame() {
        let frame = Frame::Binary(Bytes::from_static(
            br#"{"url":"/upload","method":"PUT","headers":{"x-a":"1"}}"#,
        ));
        let req = TunnelRequest::from_frame(&frame).unwrap();
        assert_eq!(req.method, "PUT");
        assert_eq!(req.headers.unwrap().get("x-a").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_ping_detection() {
        assert!(TunnelRequest::new("ping", "GET").is_ping());
        assert!(TunnelRequest::new("ping?", "GET").is_ping());
        assert!(!TunnelRequest::new("http://host/ping", "GET").is_ping());
    }

    #[test]
    fn test_invalid_request() {
        assert!(matches!(
            TunnelRequest::from_frame(&Frame::Text("not json".to_string())),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert!(matches!(
            TunnelRequest::from_frame(&Frame::Binary(Bytes::from_static(&[0xff, 0xfe]))),
            Err(ProtocolError::InvalidUtf8(_))
        ));
        // url is mandatory
        assert!(TunnelRequest::from_frame(&Frame::Text(r#"{"method":"GET"}"#.to_string())).is_err());
    }

    #[test]
    fn test_header_wire_names() {
        let header = TunnelResponseHeader {
            status: 200,
            content_type: Some("application/json".to_string()),
            content_length: Some(27),
        };
        let Frame::Text(json) = header.to_frame().unwrap() else {
            panic!("header must be a text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"status": 200, "content-type": "application/json", "content-length": 27})
        );
    }

    #[test]
    fn test_status_only_headers() {
        let Frame::Text(json) = TunnelResponseHeader::heartbeat().to_frame().unwrap() else {
            panic!("heartbeat must be a text frame");
        };
        assert_eq!(json, r#"{"status":202}"#);
        assert_eq!(TunnelResponseHeader::pong().status, 200);
        assert_eq!(
            TunnelResponseHeader::too_large().to_frame().unwrap(),
            Frame::Text(r#"{"status":413}"#.to_string())
        );
        assert!(!TunnelResponseHeader::status(204).has_body());
        assert!(TunnelResponseHeader::status(404).has_body());
    }
}
