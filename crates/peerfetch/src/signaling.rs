//! PeerJS-compatible signaling client
//!
//! A session holds one WebSocket to the rendezvous server. Inbound offers
//! are answered with a fresh WebRTC peer connection each; trickled remote
//! candidates that arrive before their connection exists are buffered.
//! Everything the controller needs to know is reported through the
//! session's [`EventSender`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use webrtc::peer_connection::RTCPeerConnection;

use peerfetch_config::Config;

use crate::peer::{
    add_remote_candidate, answer_offer, forward_data_channels, new_peer_connection,
    watch_connection_state,
};
use crate::transport::{SessionFactory, SignalingError, SignalingSession};
use crate::types::{
    EventSender, IceCandidate, OfferPayload, PeerJsMessage, SignalingEvent,
    SIGNALING_HEARTBEAT_INTERVAL,
};

const TOKEN_LEN: usize = 11;
const TOKEN_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Upper bound for opening the signaling WebSocket
const SOCKET_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Random session token, same shape as the ones browsers use
pub fn random_token() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| TOKEN_CHARS[rng.gen_range(0..TOKEN_CHARS.len())] as char)
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Connection table
// ============================================================================

struct RemoteConnection<C> {
    peer_id: String,
    conn: C,
}

/// Peer connections of one session by PeerJS connection id, plus remote
/// candidates waiting for their connection.
struct ConnectionTable<C> {
    active: HashMap<String, RemoteConnection<C>>,
    pending: HashMap<String, Vec<IceCandidate>>,
    closed: bool,
}

impl<C: Clone> ConnectionTable<C> {
    fn new() -> Self {
        Self {
            active: HashMap::new(),
            pending: HashMap::new(),
            closed: false,
        }
    }

    /// Register a connection whose remote description is applied.
    /// Returns the candidates buffered for it, or `None` once the table
    /// is closed.
    fn activate(&mut self, connection_id: &str, peer_id: &str, conn: C) -> Option<Vec<IceCandidate>> {
        if self.closed {
            return None;
        }
        self.active.insert(
            connection_id.to_string(),
            RemoteConnection {
                peer_id: peer_id.to_string(),
                conn,
            },
        );
        Some(self.pending.remove(connection_id).unwrap_or_default())
    }

    /// The connection to add `candidate` to, or `None` if it was buffered
    fn route_candidate(&mut self, connection_id: &str, candidate: IceCandidate) -> Option<(C, IceCandidate)> {
        if let Some(remote) = self.active.get(connection_id) {
            return Some((remote.conn.clone(), candidate));
        }
        if !self.closed {
            self.pending
                .entry(connection_id.to_string())
                .or_default()
                .push(candidate);
        }
        None
    }

    /// Forget one connection along with any candidates buffered for it
    fn remove_connection(&mut self, connection_id: &str) -> Option<C> {
        self.pending.remove(connection_id);
        self.active.remove(connection_id).map(|remote| remote.conn)
    }

    fn remove_peer(&mut self, peer_id: &str) -> Vec<C> {
        let ids: Vec<String> = self
            .active
            .iter()
            .filter(|(_, remote)| remote.peer_id == peer_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.pending.remove(id);
        }
        ids.iter()
            .filter_map(|id| self.active.remove(id))
            .map(|remote| remote.conn)
            .collect()
    }

    fn close(&mut self) -> Vec<C> {
        self.closed = true;
        self.pending.clear();
        self.active.drain().map(|(_, remote)| remote.conn).collect()
    }
}

type Connections = Arc<tokio::sync::Mutex<ConnectionTable<Arc<RTCPeerConnection>>>>;

// ============================================================================
// Session
// ============================================================================

struct SocketHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct SessionInner {
    config: Arc<Config>,
    token: String,
    events: EventSender,
    peer_id: Mutex<Option<String>>,
    connections: Connections,
    socket: tokio::sync::Mutex<Option<SocketHandle>>,
    destroyed: AtomicBool,
}

/// One registration with a PeerJS server
pub struct PeerJsSession {
    inner: Arc<SessionInner>,
}

impl PeerJsSession {
    fn socket_url(&self, peer_id: &str) -> String {
        format!(
            "{}peerjs?key={}&id={}&token={}",
            self.inner.config.ws_base_url(),
            self.inner.config.key,
            peer_id,
            self.inner.token
        )
    }

    async fn open_socket(&self, peer_id: &str) -> Result<(), SignalingError> {
        let url = self.socket_url(peer_id);
        info!("Connecting to signaling server as {}", peer_id);
        let (ws_stream, _) = tokio::time::timeout(SOCKET_CONNECT_TIMEOUT, connect_async(&url))
            .await
            .map_err(|_| SignalingError::ConnectionFailed("timed out opening signaling socket".into()))?
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        *lock(&self.inner.peer_id) = Some(peer_id.to_string());

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_socket(self.inner.clone(), ws_stream, stop_rx));
        *self.inner.socket.lock().await = Some(SocketHandle {
            stop: stop_tx,
            task,
        });
        Ok(())
    }

    /// Stop the socket task without reporting a disconnect
    async fn close_socket(&self) {
        let handle = self.inner.socket.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.stop.send(());
            let _ = handle.task.await;
        }
    }
}

#[async_trait]
impl SignalingSession for PeerJsSession {
    fn peer_id(&self) -> Option<String> {
        lock(&self.inner.peer_id).clone()
    }

    fn token(&self) -> &str {
        &self.inner.token
    }

    async fn reconnect(&self, peer_id: Option<&str>) -> Result<(), SignalingError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(SignalingError::Destroyed);
        }
        let id = match peer_id {
            Some(id) => id.to_string(),
            None => self
                .peer_id()
                .ok_or_else(|| SignalingError::IdRejected("no peer id to reconnect with".into()))?,
        };
        self.close_socket().await;
        self.open_socket(&id).await
    }

    async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_socket().await;
        let connections = self.inner.connections.lock().await.close();
        for pc in connections {
            let _ = pc.close().await;
        }
        info!("Peer session destroyed");
    }
}

// ============================================================================
// Socket task
// ============================================================================

enum Flow {
    Continue,
    /// Server rejected the session, nothing follows
    Terminal,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn run_socket(inner: Arc<SessionInner>, ws_stream: WsStream, mut stop_rx: oneshot::Receiver<()>) {
    let (mut write, mut read) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<PeerJsMessage>();

    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + SIGNALING_HEARTBEAT_INTERVAL,
        SIGNALING_HEARTBEAT_INTERVAL,
    );

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                let _ = write.close().await;
                return;
            }
            _ = heartbeat.tick() => {
                if let Err(e) = send_message(&mut write, &PeerJsMessage::Heartbeat).await {
                    warn!("Signaling heartbeat failed: {}", e);
                    break;
                }
            }
            Some(outbound) = out_rx.recv() => {
                debug!("Sending {} to signaling server", outbound.msg_type());
                if let Err(e) = send_message(&mut write, &outbound).await {
                    warn!("Failed to send {}: {}", outbound.msg_type(), e);
                    break;
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Flow::Terminal = handle_server_message(&inner, &out_tx, &text).await {
                            inner.destroyed.store(true, Ordering::SeqCst);
                            let connections = inner.connections.lock().await.close();
                            for pc in connections {
                                let _ = pc.close().await;
                            }
                            inner.events.send(SignalingEvent::Closed);
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Signaling socket closed by server");
                        break;
                    }
                    Some(Err(e)) => {
                        error!("Signaling socket error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    if !inner.destroyed.load(Ordering::SeqCst) {
        let id = lock(&inner.peer_id).clone();
        inner.events.send(SignalingEvent::Disconnected(id));
    }
}

async fn send_message<W>(write: &mut W, msg: &PeerJsMessage) -> Result<(), SignalingError>
where
    W: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(msg).map_err(|e| SignalingError::Server(e.to_string()))?;
    write
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))
}

async fn handle_server_message(
    inner: &Arc<SessionInner>,
    out_tx: &mpsc::UnboundedSender<PeerJsMessage>,
    text: &str,
) -> Flow {
    let msg: PeerJsMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("Ignoring signaling message ({}): {}", e, text);
            return Flow::Continue;
        }
    };
    debug!("Received {} from signaling server", msg.msg_type());

    match msg {
        PeerJsMessage::Open => {
            let id = lock(&inner.peer_id).clone();
            inner.events.send(SignalingEvent::Opened(id));
        }
        PeerJsMessage::Error { payload } => {
            let msg = payload.map(|p| p.msg).unwrap_or_default();
            inner.events.send(SignalingEvent::Errored(SignalingError::Server(msg)));
            return Flow::Terminal;
        }
        PeerJsMessage::IdTaken { payload } => {
            let msg = payload.map(|p| p.msg).unwrap_or_default();
            inner.events.send(SignalingEvent::Errored(SignalingError::IdRejected(msg)));
            return Flow::Terminal;
        }
        PeerJsMessage::InvalidKey { payload } => {
            let msg = payload.map(|p| p.msg).unwrap_or_default();
            inner.events.send(SignalingEvent::Errored(SignalingError::InvalidKey(msg)));
            return Flow::Terminal;
        }
        PeerJsMessage::Heartbeat => {}
        PeerJsMessage::Leave { src } | PeerJsMessage::Expire { src } => {
            let connections = inner.connections.lock().await.remove_peer(&src);
            if !connections.is_empty() {
                info!("Remote peer {} left, closing {} connection(s)", src, connections.len());
            }
            for pc in connections {
                let _ = pc.close().await;
            }
        }
        PeerJsMessage::Offer { src, payload } => {
            tokio::spawn(accept_connection(inner.clone(), out_tx.clone(), src, payload));
        }
        PeerJsMessage::Candidate { src, payload, .. } => {
            let routed = inner
                .connections
                .lock()
                .await
                .route_candidate(&payload.connection_id, payload.candidate);
            if let Some((pc, candidate)) = routed {
                if let Err(e) = add_remote_candidate(&pc, candidate).await {
                    warn!("Failed to add candidate from {:?}: {}", src, e);
                }
            }
        }
        PeerJsMessage::Answer { src, .. } => {
            debug!("Unexpected answer from {:?}, we never send offers", src);
        }
    }
    Flow::Continue
}

/// Answer an offer and register the resulting connection
async fn accept_connection(
    inner: Arc<SessionInner>,
    out_tx: mpsc::UnboundedSender<PeerJsMessage>,
    src: String,
    offer: OfferPayload,
) {
    info!("Offer from {} (connection {})", src, offer.connection_id);

    let pc = match new_peer_connection(&inner.config.ice_servers).await {
        Ok(pc) => pc,
        Err(e) => {
            warn!("Failed to create peer connection for {}: {}", src, e);
            inner.connections.lock().await.remove_connection(&offer.connection_id);
            inner
                .events
                .send(SignalingEvent::Errored(SignalingError::WebRtc(e.to_string())));
            return;
        }
    };
    forward_data_channels(&pc, &src, inner.events.clone());
    forget_when_gone(&inner.connections, &pc, &src, &offer.connection_id);

    let answer = match answer_offer(&pc, &offer.sdp).await {
        Ok(answer) => answer,
        Err(e) => {
            warn!("Failed to answer offer from {}: {}", src, e);
            inner.connections.lock().await.remove_connection(&offer.connection_id);
            let _ = pc.close().await;
            inner
                .events
                .send(SignalingEvent::Errored(SignalingError::WebRtc(e.to_string())));
            return;
        }
    };

    let buffered = inner
        .connections
        .lock()
        .await
        .activate(&offer.connection_id, &src, pc.clone());
    let Some(buffered) = buffered else {
        debug!("Session gone before offer from {} was answered", src);
        let _ = pc.close().await;
        return;
    };
    for candidate in buffered {
        if let Err(e) = add_remote_candidate(&pc, candidate).await {
            warn!("Failed to add buffered candidate from {}: {}", src, e);
        }
    }

    if out_tx
        .send(PeerJsMessage::answer(&src, &offer.connection_id, answer))
        .is_err()
    {
        warn!("Signaling socket gone, answer to {} not sent", src);
    }
}

/// Drop the table entry of `pc` once the connection fails or closes
fn forget_when_gone(
    connections: &Connections,
    pc: &Arc<RTCPeerConnection>,
    src: &str,
    connection_id: &str,
) {
    let table = Arc::downgrade(connections);
    let connection_id = connection_id.to_string();
    watch_connection_state(pc, src, move || {
        let Some(table) = table.upgrade() else {
            return;
        };
        let connection_id = connection_id.clone();
        tokio::spawn(async move {
            let removed = table.lock().await.remove_connection(&connection_id);
            if let Some(pc) = removed {
                debug!("Dropped connection {}", connection_id);
                let _ = pc.close().await;
            }
        });
    });
}

// ============================================================================
// Factory
// ============================================================================

/// Creates sessions against the configured PeerJS server
pub struct PeerJsSessionFactory {
    config: Arc<Config>,
    http: reqwest::Client,
}

impl PeerJsSessionFactory {
    pub fn new(config: Config) -> Result<Self, SignalingError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            config: Arc::new(config),
            http,
        })
    }

    fn id_url(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        format!(
            "{}{}/id?ts={}{}",
            self.config.http_base_url(),
            self.config.key,
            millis,
            rand::thread_rng().gen::<u32>()
        )
    }

    /// Ask the server for a fresh peer id
    async fn request_id(&self) -> Result<String, SignalingError> {
        let url = self.id_url();
        debug!("Requesting new peer id from {}", url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SignalingError::Server(format!(
                "id request returned {}",
                response.status()
            )));
        }
        let id = response
            .text()
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
        let id = id.trim().to_string();
        if id.is_empty() {
            return Err(SignalingError::Server("server returned an empty id".into()));
        }
        Ok(id)
    }
}

#[async_trait]
impl SessionFactory for PeerJsSessionFactory {
    type Session = PeerJsSession;

    async fn create(
        &self,
        peer_id: Option<String>,
        events: EventSender,
    ) -> Result<PeerJsSession, SignalingError> {
        let id = match peer_id {
            Some(id) => id,
            None => self.request_id().await?,
        };

        let session = PeerJsSession {
            inner: Arc::new(SessionInner {
                config: self.config.clone(),
                token: random_token(),
                events,
                peer_id: Mutex::new(None),
                connections: Arc::new(tokio::sync::Mutex::new(ConnectionTable::new())),
                socket: tokio::sync::Mutex::new(None),
                destroyed: AtomicBool::new(false),
            }),
        };
        session.open_socket(&id).await?;
        Ok(session)
    }
}
