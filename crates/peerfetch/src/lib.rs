//! HTTP over WebRTC data channels for devices behind NAT
//!
//! An edge device registers with a PeerJS rendezvous server and waits for
//! remote peers. Each data channel a remote peer opens carries a small
//! request/response protocol that proxies HTTP calls to a web server local
//! to the device.
//!
//! # Overview
//!
//! - **Lifecycle**: [`LifecycleController`] keeps the peer registered,
//!   reconnecting or recreating the session as needed
//! - **Signaling**: [`PeerJsSessionFactory`] speaks the PeerJS server protocol
//!   and answers WebRTC offers
//! - **Tunnel**: [`TunnelHandler`] serves requests on one data channel,
//!   with heartbeats while a fetch is slow
//!
//! # Example
//!
//! ```rust,no_run
//! use peerfetch::{
//!     HttpFetcher, HttpRoomDiscovery, LifecycleController, PeerJsSessionFactory, TunnelConfig,
//! };
//! use peerfetch_config::{Config, IdentityStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let identity = IdentityStore::open_default();
//!     let peer_id = identity.load()?;
//!
//!     let mut controller = LifecycleController::new(
//!         PeerJsSessionFactory::new(config.clone())?,
//!         HttpRoomDiscovery::new(&config)?,
//!         identity,
//!         Arc::new(HttpFetcher::new()?),
//!         TunnelConfig::from_config(&config),
//!     )
//!     .with_peer_id(peer_id);
//!
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     controller.run(shutdown_rx).await;
//!     Ok(())
//! }
//! ```

pub mod fetch;
pub mod lifecycle;
pub mod mock;
pub mod peer;
pub mod protocol;
pub mod room;
pub mod signaling;
pub mod transport;
pub mod tunnel;
pub mod types;

pub use fetch::{FetchError, FetchExecutor, FetchRequest, FetchResponse, HttpFetcher, HttpMethod};
pub use lifecycle::{LifecycleController, LifecycleError};
pub use peer::RtcDataChannel;
pub use protocol::{
    Frame, ProtocolError, TunnelRequest, TunnelResponseHeader, STATUS_PAYLOAD_TOO_LARGE,
};
pub use room::HttpRoomDiscovery;
pub use signaling::{PeerJsSession, PeerJsSessionFactory};
pub use transport::{
    DataChannel, DiscoveryError, RoomDiscovery, SessionFactory, SignalingError, SignalingSession,
    TransportError,
};
pub use tunnel::{KeepaliveTimer, TunnelConfig, TunnelError, TunnelHandler};
pub use types::{
    EventSender, PeerConnectionState, PeerSnapshot, SessionEvent, SignalingEvent,
    DATA_CHANNEL_LABEL, HEARTBEAT_INTERVAL, MAX_MESSAGE_SIZE, POLL_INTERVAL,
};
