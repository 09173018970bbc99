//! WebRTC answerer
//!
//! Builds peer connections for inbound PeerJS offers and adapts the data
//! channels remote peers open into [`DataChannel`]s.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use peerfetch_config::IceServerConfig;

use crate::protocol::Frame;
use crate::transport::{DataChannel, TransportError};
use crate::types::{
    EventSender, IceCandidate, SessionDescription, SignalingEvent, DATA_CHANNEL_LABEL,
    ICE_GATHERING_TIMEOUT, MAX_MESSAGE_SIZE,
};

type FrameSlot = Arc<Mutex<Option<mpsc::UnboundedSender<Frame>>>>;

/// Data channel opened by a remote peer.
///
/// Messages are queued from the moment the channel is attached, so frames
/// sent before a tunnel handler starts reading are not lost.
pub struct RtcDataChannel {
    peer_id: String,
    dc: Arc<RTCDataChannel>,
    pc: Option<Arc<RTCPeerConnection>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    open: Arc<AtomicBool>,
}

impl RtcDataChannel {
    /// Wrap `dc` and start queueing its messages
    pub fn attach(
        peer_id: String,
        dc: Arc<RTCDataChannel>,
        pc: Option<Arc<RTCPeerConnection>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let slot: FrameSlot = Arc::new(Mutex::new(Some(tx)));
        let open = Arc::new(AtomicBool::new(
            dc.ready_state() == RTCDataChannelState::Open,
        ));

        let open_flag = open.clone();
        let label = dc.label().to_string();
        let peer_open = peer_id.clone();
        dc.on_open(Box::new(move || {
            open_flag.store(true, Ordering::SeqCst);
            let label = label.clone();
            let peer = peer_open.clone();
            Box::pin(async move {
                info!("Data channel '{}' to {} open", label, peer);
            })
        }));

        let msg_slot = slot.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let frame = if msg.is_string {
                Frame::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                Frame::Binary(msg.data)
            };
            if let Ok(guard) = msg_slot.lock() {
                if let Some(tx) = guard.as_ref() {
                    let _ = tx.send(frame);
                }
            }
            Box::pin(async {})
        }));

        let close_flag = open.clone();
        let close_slot = slot;
        let peer_close = peer_id.clone();
        dc.on_close(Box::new(move || {
            close_flag.store(false, Ordering::SeqCst);
            if let Ok(mut guard) = close_slot.lock() {
                guard.take();
            }
            let peer = peer_close.clone();
            Box::pin(async move {
                debug!("Data channel to {} closed", peer);
            })
        }));

        Self {
            peer_id,
            dc,
            pc,
            rx: tokio::sync::Mutex::new(rx),
            open,
        }
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let result = match frame {
            Frame::Text(text) => self.dc.send_text(text).await,
            Frame::Binary(data) => self.dc.send(&data).await,
        };
        result
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Option<Frame> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn max_message_size(&self) -> Option<usize> {
        Some(MAX_MESSAGE_SIZE)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.dc.close().await;
        if let Some(pc) = &self.pc {
            let _ = pc.close().await;
        }
    }
}

pub fn to_rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

/// Create a peer connection using the given ICE servers
pub async fn new_peer_connection(
    ice_servers: &[IceServerConfig],
) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: to_rtc_ice_servers(ice_servers),
        ..Default::default()
    };

    Ok(Arc::new(api.new_peer_connection(config).await?))
}

/// Surface every data channel `remote_peer` opens on `pc` as an
/// inbound connection event.
///
/// Must be registered before the remote description is applied.
pub fn forward_data_channels(pc: &Arc<RTCPeerConnection>, remote_peer: &str, events: EventSender) {
    let remote = remote_peer.to_string();
    let pc_weak = Arc::downgrade(pc);

    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let remote = remote.clone();
        let events = events.clone();
        let pc = pc_weak.upgrade();

        // Attach synchronously so the first messages are already queued
        if dc.label() != DATA_CHANNEL_LABEL {
            debug!("Data channel from {} has label '{}'", remote, dc.label());
        }
        let channel = RtcDataChannel::attach(remote.clone(), dc, pc);

        Box::pin(async move {
            info!("Remote peer {} opened a data channel", remote);
            events.send(SignalingEvent::InboundConnection(Arc::new(channel)));
        })
    }));
}

/// Log state changes of `pc` and call `on_gone` whenever it reaches
/// `Failed` or `Closed`
pub fn watch_connection_state<F>(pc: &Arc<RTCPeerConnection>, remote_peer: &str, on_gone: F)
where
    F: Fn() + Send + Sync + 'static,
{
    let remote = remote_peer.to_string();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        match state {
            RTCPeerConnectionState::Failed => {
                warn!("Connection to {} failed", remote);
                on_gone();
            }
            RTCPeerConnectionState::Closed => {
                debug!("Connection to {} closed", remote);
                on_gone();
            }
            _ => debug!("Connection to {} state: {}", remote, state),
        }
        Box::pin(async {})
    }));
}

/// Apply `offer`, create the answer and wait for ICE gathering so the
/// answer carries our candidates.
pub async fn answer_offer(
    pc: &Arc<RTCPeerConnection>,
    offer: &SessionDescription,
) -> Result<SessionDescription, webrtc::Error> {
    let offer_desc = RTCSessionDescription::offer(offer.sdp.clone())?;
    pc.set_remote_description(offer_desc).await?;

    let answer = pc.create_answer(None).await?;
    let mut gathering_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await?;

    if tokio::time::timeout(ICE_GATHERING_TIMEOUT, gathering_complete.recv())
        .await
        .is_err()
    {
        warn!("ICE gathering did not finish in time, answering with what we have");
    }

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| webrtc::Error::new("no local description after gathering".to_string()))?;

    debug!("Answer created, SDP len: {}", local.sdp.len());
    Ok(SessionDescription {
        sdp_type: local.sdp_type.to_string().to_lowercase(),
        sdp: local.sdp,
    })
}

/// Add a candidate trickled by the remote peer
pub async fn add_remote_candidate(
    pc: &RTCPeerConnection,
    candidate: IceCandidate,
) -> Result<(), webrtc::Error> {
    if candidate.candidate.is_empty() {
        // End-of-candidates marker
        return Ok(());
    }
    pc.add_ice_candidate(RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: candidate.username_fragment,
    })
    .await
}
