//! Mock implementations for testing
//!
//! In-memory data channels, signaling sessions, fetchers and room discovery
//! so the tunnel handler and lifecycle controller can be driven
//! deterministically without a rendezvous server or a network.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::fetch::{FetchError, FetchExecutor, FetchRequest, FetchResponse};
use crate::protocol::Frame;
use crate::transport::{
    DataChannel, DiscoveryError, RoomDiscovery, SessionFactory, SignalingError, SignalingSession,
    TransportError,
};
use crate::types::{EventSender, SignalingEvent};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Mock Data Channel
// ============================================================================

/// Mock data channel using unbounded mpsc channels
pub struct MockDataChannel {
    peer_id: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    open: AtomicBool,
    max_message_size: Option<usize>,
}

impl MockDataChannel {
    /// Create a connected pair of mock channels.
    ///
    /// Each side reports the other side's id as its `peer_id`. Closing one
    /// side ends the stream seen by the other.
    pub fn pair(id_a: &str, id_b: &str) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let chan_a = Self {
            peer_id: id_b.to_string(),
            tx: Mutex::new(Some(tx_b)), // A sends to B's receiver
            rx: tokio::sync::Mutex::new(rx_a),
            open: AtomicBool::new(true),
            max_message_size: None,
        };

        let chan_b = Self {
            peer_id: id_a.to_string(),
            tx: Mutex::new(Some(tx_a)), // B sends to A's receiver
            rx: tokio::sync::Mutex::new(rx_b),
            open: AtomicBool::new(true),
            max_message_size: None,
        };

        (chan_a, chan_b)
    }

    /// Reject outgoing frames larger than `limit` the way an SCTP data
    /// channel does, without closing the channel
    pub fn with_max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = Some(limit);
        self
    }

    /// Frames already delivered to this side, without waiting
    pub async fn drain(&self) -> Vec<Frame> {
        let mut rx = self.rx.lock().await;
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Relaxed) {
            return Err(TransportError::Disconnected);
        }
        if let Some(limit) = self.max_message_size {
            let size = frame.as_bytes().len();
            if size > limit {
                return Err(TransportError::SendFailed(format!(
                    "message of {} bytes exceeds limit of {}",
                    size, limit
                )));
            }
        }
        match lock(&self.tx).as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Disconnected),
            None => Err(TransportError::Disconnected),
        }
    }

    async fn recv(&self) -> Option<Frame> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    fn max_message_size(&self) -> Option<usize> {
        self.max_message_size
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
        lock(&self.tx).take();
    }
}

// ============================================================================
// Mock Signaling
// ============================================================================

/// Shared state of one mock session, inspected and driven by tests
pub struct MockSessionState {
    requested_id: Option<String>,
    token: String,
    events: EventSender,
    destroy_count: AtomicUsize,
    reconnects: Mutex<Vec<Option<String>>>,
    fail_reconnect: AtomicBool,
}

impl MockSessionState {
    /// Report a lifecycle event as the real session would
    pub fn emit(&self, event: SignalingEvent) -> bool {
        self.events.send(event)
    }

    pub fn destroy_count(&self) -> usize {
        self.destroy_count.load(Ordering::SeqCst)
    }

    /// Ids passed to each `reconnect` call
    pub fn reconnects(&self) -> Vec<Option<String>> {
        lock(&self.reconnects).clone()
    }

    pub fn set_fail_reconnect(&self, fail: bool) {
        self.fail_reconnect.store(fail, Ordering::SeqCst);
    }
}

/// Session handed to the controller by [`MockSessionFactory`]
pub struct MockSession {
    state: Arc<MockSessionState>,
}

#[async_trait]
impl SignalingSession for MockSession {
    fn peer_id(&self) -> Option<String> {
        self.state.requested_id.clone()
    }

    fn token(&self) -> &str {
        &self.state.token
    }

    async fn reconnect(&self, peer_id: Option<&str>) -> Result<(), SignalingError> {
        lock(&self.state.reconnects).push(peer_id.map(str::to_string));
        if self.state.fail_reconnect.load(Ordering::SeqCst) {
            return Err(SignalingError::ConnectionFailed("mock reconnect failure".into()));
        }
        Ok(())
    }

    async fn destroy(&self) {
        self.state.destroy_count.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockFactoryState {
    sessions: Mutex<Vec<Arc<MockSessionState>>>,
    create_attempts: AtomicUsize,
    fail_create: AtomicBool,
}

/// Factory recording every session it creates. Clones share state, so a
/// test keeps one clone and hands another to the controller.
#[derive(Clone, Default)]
pub struct MockSessionFactory {
    inner: Arc<MockFactoryState>,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.inner.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Calls to `create`, successful or not
    pub fn create_attempts(&self) -> usize {
        self.inner.create_attempts.load(Ordering::SeqCst)
    }

    /// Ids requested by each successful `create`, in order
    pub fn created_ids(&self) -> Vec<Option<String>> {
        lock(&self.inner.sessions)
            .iter()
            .map(|s| s.requested_id.clone())
            .collect()
    }

    pub fn sessions(&self) -> Vec<Arc<MockSessionState>> {
        lock(&self.inner.sessions).clone()
    }

    pub fn last_session(&self) -> Option<Arc<MockSessionState>> {
        lock(&self.inner.sessions).last().cloned()
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    type Session = MockSession;

    async fn create(
        &self,
        peer_id: Option<String>,
        events: EventSender,
    ) -> Result<MockSession, SignalingError> {
        self.inner.create_attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_create.load(Ordering::SeqCst) {
            return Err(SignalingError::ConnectionFailed("mock create failure".into()));
        }

        let generation = events.generation();
        let state = Arc::new(MockSessionState {
            requested_id: peer_id,
            token: format!("mock-token-{}", generation),
            events,
            destroy_count: AtomicUsize::new(0),
            reconnects: Mutex::new(Vec::new()),
            fail_reconnect: AtomicBool::new(false),
        });
        lock(&self.inner.sessions).push(state.clone());
        Ok(MockSession { state })
    }
}

// ============================================================================
// Mock Fetcher
// ============================================================================

/// Fetch executor returning scripted results
pub struct MockFetcher {
    default: Result<FetchResponse, String>,
    scripted: Mutex<VecDeque<Result<FetchResponse, String>>>,
    delay: Duration,
    requests: Mutex<Vec<FetchRequest>>,
}

impl MockFetcher {
    /// Always answer with `response`
    pub fn responding(response: FetchResponse) -> Self {
        Self {
            default: Ok(response),
            scripted: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always fail with `message`
    pub fn failing(message: &str) -> Self {
        Self {
            default: Err(message.to_string()),
            scripted: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleep this long before answering each request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue a one-off result served before the default
    pub fn push_result(&self, result: Result<FetchResponse, String>) {
        lock(&self.scripted).push_back(result);
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl FetchExecutor for MockFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        lock(&self.requests).push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = lock(&self.scripted)
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        result.map_err(FetchError::Failed)
    }
}

// ============================================================================
// Mock Room Discovery
// ============================================================================

/// Room discovery returning a fixed member list or a scripted failure
pub struct MockRoomDiscovery {
    result: Mutex<Result<Vec<String>, String>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockRoomDiscovery {
    pub fn with_members(members: Vec<String>) -> Self {
        Self {
            result: Mutex::new(Ok(members)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Mutex::new(Err(message.to_string())),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_result(&self, result: Result<Vec<String>, String>) {
        *lock(&self.result) = result;
    }

    /// `(peer_id, token)` of every lookup
    pub fn calls(&self) -> Vec<(String, String)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl RoomDiscovery for MockRoomDiscovery {
    async fn room_members(&self, peer_id: &str, token: &str) -> Result<Vec<String>, DiscoveryError> {
        lock(&self.calls).push((peer_id.to_string(), token.to_string()));
        lock(&self.result)
            .clone()
            .map_err(DiscoveryError::UnexpectedResponse)
    }
}
