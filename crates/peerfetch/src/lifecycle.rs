//! Peer lifecycle controller
//!
//! Keeps the local peer registered and discoverable. A fixed-interval poll
//! re-derives the next action from the current state, so lost or reordered
//! signaling events only delay recovery:
//!
//! | state                   | action                                  |
//! |-------------------------|-----------------------------------------|
//! | Uninitialized/Destroyed | create a session, reusing the known id  |
//! | Open                    | query room members                      |
//! | Disconnected            | reconnect the session                   |
//! | Connecting              | wait                                    |
//! | any, on error           | destroy the session                     |
//!
//! The controller is the only writer of the session handle and peer id.
//! Sessions report into it over an event queue and every event carries the
//! generation of the session that sent it.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use peerfetch_config::IdentityStore;

use crate::fetch::FetchExecutor;
use crate::transport::{
    DataChannel, DiscoveryError, RoomDiscovery, SessionFactory, SignalingError, SignalingSession,
};
use crate::tunnel::{TunnelConfig, TunnelHandler};
use crate::types::{
    EventSender, PeerConnectionState, PeerSnapshot, SessionEvent, SignalingEvent, POLL_INTERVAL,
};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),
    #[error("room discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("no active session in state {0}")]
    NoSession(PeerConnectionState),
    #[error("session is open but has no peer id")]
    NoPeerId,
}

pub struct LifecycleController<F: SessionFactory, D: RoomDiscovery> {
    factory: F,
    discovery: D,
    identity: IdentityStore,
    fetcher: Arc<dyn FetchExecutor>,
    tunnel_config: TunnelConfig,
    poll_interval: Duration,

    state: PeerConnectionState,
    session: Option<F::Session>,
    /// Last id the rendezvous service confirmed
    peer_id: Option<String>,
    generation: u64,

    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    tunnels: Vec<JoinHandle<()>>,
    snapshot_tx: watch::Sender<PeerSnapshot>,
}

impl<F: SessionFactory, D: RoomDiscovery> LifecycleController<F, D> {
    pub fn new(
        factory: F,
        discovery: D,
        identity: IdentityStore,
        fetcher: Arc<dyn FetchExecutor>,
        tunnel_config: TunnelConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(PeerSnapshot::default());
        Self {
            factory,
            discovery,
            identity,
            fetcher,
            tunnel_config,
            poll_interval: POLL_INTERVAL,
            state: PeerConnectionState::Uninitialized,
            session: None,
            peer_id: None,
            generation: 0,
            events_tx,
            events_rx,
            tunnels: Vec::new(),
            snapshot_tx,
        }
    }

    /// Start from a previously persisted id
    pub fn with_peer_id(mut self, peer_id: Option<String>) -> Self {
        self.peer_id = peer_id;
        self.publish();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn state(&self) -> PeerConnectionState {
        self.state
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Watch state changes from outside the controller
    pub fn subscribe(&self) -> watch::Receiver<PeerSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Run poll cycles and handle session events until `shutdown` turns true
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Making peer discoverable");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => self.poll_once().await,
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
            }
        }

        info!("Exited discovery loop");
        self.shutdown().await;
    }

    /// One supervision cycle. Any failure destroys the session so the
    /// next cycle starts over with a fresh one.
    pub async fn poll_once(&mut self) {
        debug!("Discovery loop, peer state {}", self.state);
        self.prune_tunnels();

        if let Err(e) = self.step().await {
            warn!(
                "Error while keeping peer discoverable, will retry in a few moments: {}",
                e
            );
            self.recover().await;
        }
        self.publish();
    }

    async fn step(&mut self) -> Result<(), LifecycleError> {
        match self.state {
            PeerConnectionState::Uninitialized | PeerConnectionState::Destroyed => {
                self.create_session().await
            }
            PeerConnectionState::Open => self.join_room().await,
            PeerConnectionState::Disconnected => self.reconnect().await,
            PeerConnectionState::Connecting => {
                info!("Peer still establishing connection");
                Ok(())
            }
        }
    }

    async fn create_session(&mut self) -> Result<(), LifecycleError> {
        info!(
            "Creating peer session, last saved peer id {:?}",
            self.peer_id
        );
        self.generation += 1;
        let events = EventSender::new(self.generation, self.events_tx.clone());
        let session = self.factory.create(self.peer_id.clone(), events).await?;
        info!("Peer session token {}", session.token());

        self.session = Some(session);
        self.state = PeerConnectionState::Connecting;
        Ok(())
    }

    async fn join_room(&mut self) -> Result<(), LifecycleError> {
        let session = self
            .session
            .as_ref()
            .ok_or(LifecycleError::NoSession(self.state))?;
        let peer_id = self.peer_id.as_deref().ok_or(LifecycleError::NoPeerId)?;

        debug!("Fetching room members");
        let members = self.discovery.room_members(peer_id, session.token()).await?;
        info!("myRoom members {:?}", members);
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), LifecycleError> {
        info!("Peer disconnected, trying to reconnect");
        let session = self
            .session
            .as_ref()
            .ok_or(LifecycleError::NoSession(self.state))?;
        session.reconnect(self.peer_id.as_deref()).await?;
        self.state = PeerConnectionState::Connecting;
        Ok(())
    }

    /// Destroy the current session, if any, and fall back to `Destroyed`
    async fn recover(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Peer connection was corrupted, destroying peer");
            session.destroy().await;
        }
        self.state = PeerConnectionState::Destroyed;
    }

    /// Handle every event already queued, without waiting
    pub async fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event).await;
        }
    }

    pub async fn handle_event(&mut self, event: SessionEvent) {
        let SessionEvent { generation, event } = event;

        if generation != self.generation || self.session.is_none() {
            debug!(
                "Ignoring {} event from stale session generation {}",
                event.name(),
                generation
            );
            if let SignalingEvent::InboundConnection(channel) = event {
                channel.close().await;
            }
            return;
        }

        match event {
            SignalingEvent::Opened(None) => {
                // The transport sometimes forgets its id across a reconnect
                info!("Received null id from peer open, keeping {:?}", self.peer_id);
                self.state = PeerConnectionState::Open;
            }
            SignalingEvent::Opened(Some(id)) => {
                info!("Peer signaling connection open");
                if self.peer_id.as_deref() != Some(id.as_str()) {
                    info!(
                        "Rendezvous service returned new peer id. Old {:?}, new {}",
                        self.peer_id, id
                    );
                }
                if let Err(e) = self.identity.save(&id) {
                    warn!("Failed to persist peer id {}: {:#}", id, e);
                }
                self.peer_id = Some(id);
                self.state = PeerConnectionState::Open;
            }
            SignalingEvent::Disconnected(id) => {
                info!("Peer {:?} disconnected from server", id);
                if self.peer_id.is_none() {
                    self.peer_id = id;
                }
                self.state = PeerConnectionState::Disconnected;
            }
            SignalingEvent::Closed => {
                info!("Peer connection closed");
                self.session = None;
                self.state = PeerConnectionState::Destroyed;
            }
            SignalingEvent::Errored(e) => {
                warn!("Peer error: {} (state {})", e, self.state);
            }
            SignalingEvent::InboundConnection(channel) => {
                info!("Remote peer {} trying to establish connection", channel.peer_id());
                self.attach_tunnel(channel);
            }
        }
        self.publish();
    }

    fn attach_tunnel(&mut self, channel: Arc<dyn DataChannel>) {
        let handler = TunnelHandler::new(channel, self.fetcher.clone(), self.tunnel_config.clone());
        self.prune_tunnels();
        self.tunnels.push(tokio::spawn(handler.run()));
    }

    fn prune_tunnels(&mut self) {
        self.tunnels.retain(|task| !task.is_finished());
    }

    /// Destroy the active session and stop serving tunnels
    pub async fn shutdown(&mut self) {
        match self.session.take() {
            Some(session) => {
                info!("Destroying peer {:?}", self.peer_id);
                session.destroy().await;
            }
            None => info!("No active peer session"),
        }
        for task in self.tunnels.drain(..) {
            task.abort();
        }
        self.state = PeerConnectionState::Destroyed;
        self.publish();
    }

    fn publish(&self) {
        let active_tunnels = self.tunnels.iter().filter(|t| !t.is_finished()).count();
        self.snapshot_tx.send_replace(PeerSnapshot {
            state: self.state,
            peer_id: self.peer_id.clone(),
            active_tunnels,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchResponse;
    use crate::mock::{MockDataChannel, MockFetcher, MockRoomDiscovery, MockSessionFactory};
    use crate::protocol::{Frame, TunnelRequest};
    use tempfile::TempDir;

    type TestController = LifecycleController<MockSessionFactory, Arc<MockRoomDiscovery>>;

    struct Harness {
        _dir: TempDir,
        identity: IdentityStore,
        factory: MockSessionFactory,
        discovery: Arc<MockRoomDiscovery>,
        controller: TestController,
    }

    fn harness(persisted: Option<&str>) -> Harness {
        let dir = TempDir::new().unwrap();
        let identity = IdentityStore::new(dir.path().join("peerid.json"));
        if let Some(id) = persisted {
            identity.save(id).unwrap();
        }
        let factory = MockSessionFactory::new();
        let discovery = Arc::new(MockRoomDiscovery::with_members(vec!["peer-a".into()]));
        let fetcher = Arc::new(MockFetcher::responding(FetchResponse::new(200, "ok")));
        let controller = LifecycleController::new(
            factory.clone(),
            discovery.clone(),
            identity.clone(),
            fetcher,
            TunnelConfig::default(),
        )
        .with_peer_id(identity.load().unwrap());
        Harness {
            _dir: dir,
            identity,
            factory,
            discovery,
            controller,
        }
    }

    /// Create a session and open it with `id`
    async fn open(h: &mut Harness, id: &str) {
        h.controller.poll_once().await;
        let session = h.factory.last_session().unwrap();
        session.emit(SignalingEvent::Opened(Some(id.to_string())));
        h.controller.drain_events().await;
        assert_eq!(h.controller.state(), PeerConnectionState::Open);
    }

    #[tokio::test]
    async fn test_first_poll_creates_session_with_persisted_id() {
        let mut h = harness(Some("device-1"));
        assert_eq!(h.controller.state(), PeerConnectionState::Uninitialized);

        h.controller.poll_once().await;
        assert_eq!(h.controller.state(), PeerConnectionState::Connecting);
        assert_eq!(h.factory.created_ids(), vec![Some("device-1".to_string())]);

        // Still connecting: no second session
        h.controller.poll_once().await;
        assert_eq!(h.factory.create_attempts(), 1);
    }

    #[tokio::test]
    async fn test_open_persists_assigned_id() {
        let mut h = harness(None);
        open(&mut h, "fresh-id").await;

        assert_eq!(h.controller.peer_id(), Some("fresh-id"));
        assert_eq!(h.identity.load().unwrap().as_deref(), Some("fresh-id"));
        assert_eq!(h.controller.snapshot().state, PeerConnectionState::Open);
    }

    #[tokio::test]
    async fn test_rejected_id_is_superseded() {
        let mut h = harness(Some("old-id"));
        open(&mut h, "new-id").await;
        assert_eq!(h.identity.load().unwrap().as_deref(), Some("new-id"));
    }

    #[tokio::test]
    async fn test_open_with_null_id_keeps_last_known() {
        let mut h = harness(Some("device-1"));
        h.controller.poll_once().await;
        let session = h.factory.last_session().unwrap();

        session.emit(SignalingEvent::Opened(None));
        h.controller.drain_events().await;

        assert_eq!(h.controller.state(), PeerConnectionState::Open);
        assert_eq!(h.controller.peer_id(), Some("device-1"));
        assert_eq!(h.identity.load().unwrap().as_deref(), Some("device-1"));
    }

    #[tokio::test]
    async fn test_open_polls_room_members() {
        let mut h = harness(None);
        open(&mut h, "device-1").await;

        h.controller.poll_once().await;
        let calls = h.discovery.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "device-1");
        assert_eq!(calls[0].1, "mock-token-1");
        assert_eq!(h.controller.state(), PeerConnectionState::Open);
    }

    #[tokio::test]
    async fn test_disconnect_triggers_reconnect_with_cached_id() {
        let mut h = harness(None);
        open(&mut h, "device-1").await;
        let session = h.factory.last_session().unwrap();

        // The transport lost its id along with the socket
        session.emit(SignalingEvent::Disconnected(None));
        h.controller.drain_events().await;
        assert_eq!(h.controller.state(), PeerConnectionState::Disconnected);

        h.controller.poll_once().await;
        assert_eq!(session.reconnects(), vec![Some("device-1".to_string())]);
        assert_eq!(h.controller.state(), PeerConnectionState::Connecting);
        assert_eq!(h.factory.create_attempts(), 1);
    }

    #[tokio::test]
    async fn test_cycle_error_destroys_once_then_recreates() {
        let mut h = harness(None);
        open(&mut h, "device-1").await;
        let first = h.factory.last_session().unwrap();

        h.discovery.set_result(Err("room service down".into()));
        h.controller.poll_once().await;
        assert_eq!(first.destroy_count(), 1);
        assert_eq!(h.controller.state(), PeerConnectionState::Destroyed);

        h.controller.poll_once().await;
        assert_eq!(first.destroy_count(), 1);
        assert_eq!(
            h.factory.created_ids(),
            vec![None, Some("device-1".to_string())]
        );
        assert_eq!(h.controller.state(), PeerConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_failed_reconnect_destroys_session() {
        let mut h = harness(None);
        open(&mut h, "device-1").await;
        let session = h.factory.last_session().unwrap();
        session.set_fail_reconnect(true);

        session.emit(SignalingEvent::Disconnected(Some("device-1".into())));
        h.controller.drain_events().await;
        h.controller.poll_once().await;

        assert_eq!(session.destroy_count(), 1);
        assert_eq!(h.controller.state(), PeerConnectionState::Destroyed);
    }

    #[tokio::test]
    async fn test_failed_create_is_retried() {
        let mut h = harness(Some("device-1"));
        h.factory.set_fail_create(true);

        h.controller.poll_once().await;
        assert_eq!(h.controller.state(), PeerConnectionState::Destroyed);

        h.factory.set_fail_create(false);
        h.controller.poll_once().await;
        assert_eq!(h.factory.create_attempts(), 2);
        assert_eq!(h.factory.created_ids(), vec![Some("device-1".to_string())]);
    }

    #[tokio::test]
    async fn test_closed_leads_to_new_session() {
        let mut h = harness(None);
        open(&mut h, "device-1").await;
        let first = h.factory.last_session().unwrap();

        first.emit(SignalingEvent::Closed);
        h.controller.drain_events().await;
        assert_eq!(h.controller.state(), PeerConnectionState::Destroyed);

        h.controller.poll_once().await;
        assert_eq!(h.factory.sessions().len(), 2);
        assert_eq!(first.destroy_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_session_events_are_ignored() {
        let mut h = harness(None);
        open(&mut h, "device-1").await;
        let first = h.factory.last_session().unwrap();
        first.emit(SignalingEvent::Closed);
        h.controller.drain_events().await;
        h.controller.poll_once().await;

        // Late events from the superseded session
        first.emit(SignalingEvent::Opened(Some("ghost".into())));
        let (device, client) = MockDataChannel::pair("device", "client");
        first.emit(SignalingEvent::InboundConnection(Arc::new(device)));
        h.controller.drain_events().await;

        assert_eq!(h.controller.state(), PeerConnectionState::Connecting);
        assert_eq!(h.controller.peer_id(), Some("device-1"));
        assert_eq!(client.recv().await, None);
    }

    #[tokio::test]
    async fn test_inbound_connection_is_served() {
        let mut h = harness(None);
        open(&mut h, "device-1").await;
        let session = h.factory.last_session().unwrap();

        let (device, client) = MockDataChannel::pair("device-1", "browser");
        session.emit(SignalingEvent::InboundConnection(Arc::new(device)));
        h.controller.drain_events().await;
        assert_eq!(h.controller.snapshot().active_tunnels, 1);

        client
            .send(TunnelRequest::new("ping", "GET").to_frame().unwrap())
            .await
            .unwrap();
        assert_eq!(
            client.recv().await,
            Some(Frame::Text(r#"{"status":200}"#.to_string()))
        );
    }

    #[tokio::test]
    async fn test_shutdown_destroys_session() {
        let mut h = harness(None);
        open(&mut h, "device-1").await;
        let session = h.factory.last_session().unwrap();

        h.controller.shutdown().await;
        assert_eq!(session.destroy_count(), 1);
        assert_eq!(h.controller.state(), PeerConnectionState::Destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown_signal() {
        let h = harness(None);
        let factory = h.factory.clone();
        let mut controller = h.controller;
        let mut snapshots = controller.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            controller.run(shutdown_rx).await;
            controller
        });

        // First tick fires immediately and creates a session
        snapshots
            .wait_for(|s| s.state == PeerConnectionState::Connecting)
            .await
            .unwrap();
        factory
            .last_session()
            .unwrap()
            .emit(SignalingEvent::Opened(Some("device-1".into())));
        snapshots
            .wait_for(|s| s.state == PeerConnectionState::Open)
            .await
            .unwrap();

        shutdown_tx.send(true).unwrap();
        let controller = task.await.unwrap();
        assert_eq!(controller.state(), PeerConnectionState::Destroyed);
        assert_eq!(factory.last_session().unwrap().destroy_count(), 1);
        drop(h._dir);
    }
}
