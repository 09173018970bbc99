//! Transport abstraction
//!
//! Defines traits for data channels, signaling sessions and room discovery
//! so the lifecycle controller and tunnel handler can run against either
//! the real PeerJS + WebRTC stack or in-memory mocks.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::protocol::Frame;
use crate::types::EventSender;

/// Errors from data channel operations
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Disconnected")]
    Disconnected,
}

/// Errors from the rendezvous service
#[derive(Debug, Error, Clone)]
pub enum SignalingError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Peer id rejected: {0}")]
    IdRejected(String),
    #[error("Invalid API key: {0}")]
    InvalidKey(String),
    #[error("Server error: {0}")]
    Server(String),
    #[error("WebRTC error: {0}")]
    WebRtc(String),
    #[error("Session destroyed")]
    Destroyed,
}

/// Errors from room discovery
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Ordered, message-framed channel to a remote peer
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Remote peer id
    fn peer_id(&self) -> &str;

    /// Send one frame
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Receive the next frame; `None` once the channel is closed
    async fn recv(&self) -> Option<Frame>;

    fn is_open(&self) -> bool;

    /// Largest frame `send` accepts, if the transport bounds it
    fn max_message_size(&self) -> Option<usize> {
        None
    }

    async fn close(&self);
}

/// A live registration with the rendezvous service.
///
/// Sessions report lifecycle changes through the [`EventSender`] they were
/// created with; they never touch controller state directly.
#[async_trait]
pub trait SignalingSession: Send + Sync {
    /// Id the session registered with
    fn peer_id(&self) -> Option<String>;

    /// Session token shared with the rendezvous service
    fn token(&self) -> &str;

    /// Re-open the rendezvous connection, reusing `peer_id` when given
    async fn reconnect(&self, peer_id: Option<&str>) -> Result<(), SignalingError>;

    /// Tear down the session and every connection it owns
    async fn destroy(&self);
}

/// Creates signaling sessions
#[async_trait]
pub trait SessionFactory: Send + Sync {
    type Session: SignalingSession + 'static;

    /// Start a new session, reusing `peer_id` if one was persisted
    async fn create(
        &self,
        peer_id: Option<String>,
        events: EventSender,
    ) -> Result<Self::Session, SignalingError>;
}

/// Presence lookup of peers sharing our room on the rendezvous service
#[async_trait]
pub trait RoomDiscovery: Send + Sync {
    async fn room_members(&self, peer_id: &str, token: &str) -> Result<Vec<String>, DiscoveryError>;
}

// Blanket implementations for Arc<T> to allow calling trait methods on Arc-wrapped values

#[async_trait]
impl<T: DataChannel + ?Sized> DataChannel for Arc<T> {
    fn peer_id(&self) -> &str {
        (**self).peer_id()
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        (**self).send(frame).await
    }

    async fn recv(&self) -> Option<Frame> {
        (**self).recv().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    async fn close(&self) {
        (**self).close().await
    }
}

#[async_trait]
impl<T: RoomDiscovery + ?Sized> RoomDiscovery for Arc<T> {
    async fn room_members(&self, peer_id: &str, token: &str) -> Result<Vec<String>, DiscoveryError> {
        (**self).room_members(peer_id, token).await
    }
}
