//! Peer lifecycle and signaling types
//!
//! Defines the lifecycle state tracked by the controller, the events a
//! signaling session reports, and the PeerJS signaling wire messages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::transport::{DataChannel, SignalingError};

/// Interval of the lifecycle controller's supervision poll
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Interval of 202 heartbeats while a fetch is outstanding
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Interval of client heartbeats on the signaling socket
pub const SIGNALING_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound for ICE gathering before an answer is sent anyway
pub const ICE_GATHERING_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest message the SCTP association behind a WebRTC data channel
/// accepts
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// Data channel label used by PeerFetch clients
pub const DATA_CHANNEL_LABEL: &str = "http-proxy";

/// Connection state of the local peer towards the rendezvous service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerConnectionState {
    /// No session has been created yet
    Uninitialized,
    /// Session created, waiting for the rendezvous handshake
    Connecting,
    /// Registered and reachable
    Open,
    /// Lost the rendezvous socket, session reusable via reconnect
    Disconnected,
    /// Session gone, a new one has to be created
    Destroyed,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerConnectionState::Uninitialized => write!(f, "uninitialized"),
            PeerConnectionState::Connecting => write!(f, "connecting"),
            PeerConnectionState::Open => write!(f, "open"),
            PeerConnectionState::Disconnected => write!(f, "disconnected"),
            PeerConnectionState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Read-only view of the controller state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub state: PeerConnectionState,
    pub peer_id: Option<String>,
    pub active_tunnels: usize,
}

impl Default for PeerSnapshot {
    fn default() -> Self {
        Self {
            state: PeerConnectionState::Uninitialized,
            peer_id: None,
            active_tunnels: 0,
        }
    }
}

/// Lifecycle events reported by a signaling session
pub enum SignalingEvent {
    /// Rendezvous handshake completed. `None` when the transport lost the id.
    Opened(Option<String>),
    /// Rendezvous socket dropped; carries the id the session last used
    Disconnected(Option<String>),
    /// Session is finished, nothing follows
    Closed,
    /// Non-fatal error
    Errored(SignalingError),
    /// A remote peer opened a data channel to us
    InboundConnection(Arc<dyn DataChannel>),
}

impl SignalingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SignalingEvent::Opened(_) => "opened",
            SignalingEvent::Disconnected(_) => "disconnected",
            SignalingEvent::Closed => "closed",
            SignalingEvent::Errored(_) => "errored",
            SignalingEvent::InboundConnection(_) => "inbound-connection",
        }
    }
}

impl fmt::Debug for SignalingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingEvent::Opened(id) => f.debug_tuple("Opened").field(id).finish(),
            SignalingEvent::Disconnected(id) => f.debug_tuple("Disconnected").field(id).finish(),
            SignalingEvent::Closed => write!(f, "Closed"),
            SignalingEvent::Errored(e) => f.debug_tuple("Errored").field(e).finish(),
            SignalingEvent::InboundConnection(channel) => f
                .debug_tuple("InboundConnection")
                .field(&channel.peer_id())
                .finish(),
        }
    }
}

/// Event tagged with the session generation that produced it
#[derive(Debug)]
pub struct SessionEvent {
    pub generation: u64,
    pub event: SignalingEvent,
}

/// Sending half of the queue from a signaling session to the controller.
///
/// Unbounded so a session never blocks on a controller that is busy
/// destroying it.
#[derive(Debug, Clone)]
pub struct EventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSender {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the controller is gone
    pub fn send(&self, event: SignalingEvent) -> bool {
        self.tx
            .send(SessionEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

// ============================================================================
// PeerJS signaling wire format
// ============================================================================

/// ICE candidate as exchanged by browsers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Session description (`{type, sdp}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

/// OFFER payload sent by a connecting PeerJS client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub sdp: SessionDescription,
    /// Connection type, `data` for data connections
    #[serde(rename = "type", default)]
    pub connection_type: String,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliable: Option<bool>,
}

/// ANSWER payload returned to the connecting client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub sdp: SessionDescription,
    #[serde(rename = "type")]
    pub connection_type: String,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(default)]
    pub browser: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
    #[serde(rename = "type", default)]
    pub connection_type: String,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub msg: String,
}

/// Messages on the PeerJS signaling socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum PeerJsMessage {
    /// Server accepted our id
    Open,
    Error {
        #[serde(default)]
        payload: Option<ErrorPayload>,
    },
    /// Another socket holds our id
    IdTaken {
        #[serde(default)]
        payload: Option<ErrorPayload>,
    },
    InvalidKey {
        #[serde(default)]
        payload: Option<ErrorPayload>,
    },
    Heartbeat,
    /// Remote peer went away
    Leave { src: String },
    /// A message we sent could not be delivered
    Expire { src: String },
    Offer {
        src: String,
        payload: OfferPayload,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: AnswerPayload,
    },
    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: CandidatePayload,
    },
}

impl PeerJsMessage {
    pub fn msg_type(&self) -> &'static str {
        match self {
            PeerJsMessage::Open => "OPEN",
            PeerJsMessage::Error { .. } => "ERROR",
            PeerJsMessage::IdTaken { .. } => "ID-TAKEN",
            PeerJsMessage::InvalidKey { .. } => "INVALID-KEY",
            PeerJsMessage::Heartbeat => "HEARTBEAT",
            PeerJsMessage::Leave { .. } => "LEAVE",
            PeerJsMessage::Expire { .. } => "EXPIRE",
            PeerJsMessage::Offer { .. } => "OFFER",
            PeerJsMessage::Answer { .. } => "ANSWER",
            PeerJsMessage::Candidate { .. } => "CANDIDATE",
        }
    }

    pub fn answer(dst: &str, connection_id: &str, sdp: SessionDescription) -> Self {
        PeerJsMessage::Answer {
            src: None,
            dst: Some(dst.to_string()),
            payload: AnswerPayload {
                sdp,
                connection_type: "data".to_string(),
                connection_id: connection_id.to_string(),
                browser: concat!("peerfetch/", env!("CARGO_PKG_VERSION")).to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_open_and_heartbeat() {
        let msg: PeerJsMessage = serde_json::from_str(r#"{"type":"OPEN"}"#).unwrap();
        assert_eq!(msg, PeerJsMessage::Open);
        let json = serde_json::to_string(&PeerJsMessage::Heartbeat).unwrap();
        assert_eq!(json, r#"{"type":"HEARTBEAT"}"#);
    }

    #[test]
    fn test_parse_id_taken() {
        let msg: PeerJsMessage = serde_json::from_str(
            r#"{"type":"ID-TAKEN","payload":{"msg":"ID is taken"}}"#,
        )
        .unwrap();
        assert_eq!(msg.msg_type(), "ID-TAKEN");
    }

    #[test]
    fn test_parse_offer() {
        let json = r#"{
            "type": "OFFER",
            "src": "client-1",
            "dst": "device-1",
            "payload": {
                "sdp": {"type": "offer", "sdp": "v=0\r\n"},
                "type": "data",
                "connectionId": "dc_abc",
                "label": "http-proxy",
                "reliable": true,
                "serialization": "raw",
                "browser": "firefox"
            }
        }"#;
        let PeerJsMessage::Offer { src, payload } = serde_json::from_str(json).unwrap() else {
            panic!("expected offer");
        };
        assert_eq!(src, "client-1");
        assert_eq!(payload.connection_id, "dc_abc");
        assert_eq!(payload.sdp.sdp_type, "offer");
        assert_eq!(payload.label.as_deref(), Some(DATA_CHANNEL_LABEL));
    }

    #[test]
    fn test_serialize_answer() {
        let msg = PeerJsMessage::answer(
            "client-1",
            "dc_abc",
            SessionDescription {
                sdp_type: "answer".to_string(),
                sdp: "v=0".to_string(),
            },
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "ANSWER");
        assert_eq!(value["dst"], "client-1");
        assert_eq!(value["payload"]["connectionId"], "dc_abc");
        assert_eq!(value["payload"]["sdp"]["type"], "answer");
        assert!(value.get("src").is_none());
    }

    #[test]
    fn test_candidate_roundtrip_fields() {
        let json = r#"{"type":"CANDIDATE","src":"client-1","payload":{"candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0},"type":"data","connectionId":"dc_abc"}}"#;
        let PeerJsMessage::Candidate { src, payload, .. } = serde_json::from_str(json).unwrap() else {
            panic!("expected candidate");
        };
        assert_eq!(src.as_deref(), Some("client-1"));
        assert_eq!(payload.candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(payload.candidate.sdp_m_line_index, Some(0));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PeerConnectionState::Open.to_string(), "open");
        assert_eq!(PeerConnectionState::Destroyed.to_string(), "destroyed");
    }

    #[test]
    fn test_event_sender_tags_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = EventSender::new(7, tx);
        assert!(sender.send(SignalingEvent::Closed));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.generation, 7);
        assert!(matches!(event.event, SignalingEvent::Closed));

        drop(rx);
        assert!(!sender.send(SignalingEvent::Closed));
    }
}
