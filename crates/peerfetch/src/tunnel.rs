//! HTTP tunnel over one inbound data channel
//!
//! Requests on a channel are served one at a time. While a fetch is in
//! flight a [`KeepaliveTimer`] sends `{"status":202}` heartbeats so the
//! remote side does not reclaim the idle channel. The timer is stopped and
//! joined before the final header is composed, so a heartbeat can never
//! follow the real response.
//!
//! A body that does not fit in one message of the channel is answered with
//! a status-only 413 header. A header that promises a body always has it
//! follow.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use peerfetch_config::Config;

use crate::fetch::{FetchError, FetchExecutor, FetchRequest, FetchResponse, HttpMethod};
use crate::protocol::{
    pong_payload, Frame, ProtocolError, TunnelRequest, TunnelResponseHeader, STATUS_NO_CONTENT,
};
use crate::transport::{DataChannel, TransportError};
use crate::types::HEARTBEAT_INTERVAL;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("malformed request: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("HTTP method {0} not implemented")]
    UnsupportedMethod(String),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Per-channel tunnel settings
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub heartbeat_interval: Duration,
    /// Upper bound for a single outbound fetch
    pub fetch_timeout: Duration,
    /// Answer failed fetches with `{"status":500}` instead of staying silent
    pub report_fetch_failures: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            fetch_timeout: Duration::from_secs(peerfetch_config::DEFAULT_FETCH_TIMEOUT_SECS),
            report_fetch_failures: false,
        }
    }
}

impl TunnelConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
            report_fetch_failures: config.report_fetch_failures,
        }
    }
}

/// Background sender of 202 heartbeats for one in-flight fetch
pub struct KeepaliveTimer {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl KeepaliveTimer {
    /// Start heartbeating on `channel`; the first heartbeat goes out immediately
    pub fn start(channel: Arc<dyn DataChannel>, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let frame = match TunnelResponseHeader::heartbeat().to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Failed to encode heartbeat: {}", e);
                    return;
                }
            };
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        debug!("Keeping data channel to {} alive", channel.peer_id());
                        if channel.send(frame.clone()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    /// Stop heartbeating. Returns once the background task has exited, so
    /// no heartbeat is sent after this resolves.
    pub async fn cancel(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for KeepaliveTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Serves tunnel requests arriving on one data channel
pub struct TunnelHandler {
    channel: Arc<dyn DataChannel>,
    fetcher: Arc<dyn FetchExecutor>,
    config: TunnelConfig,
}

impl TunnelHandler {
    pub fn new(
        channel: Arc<dyn DataChannel>,
        fetcher: Arc<dyn FetchExecutor>,
        config: TunnelConfig,
    ) -> Self {
        Self {
            channel,
            fetcher,
            config,
        }
    }

    /// Serve requests until the channel closes
    pub async fn run(self) {
        let peer_id = self.channel.peer_id().to_string();
        info!("Connected to: {}", peer_id);

        while let Some(frame) = self.channel.recv().await {
            match self.handle_frame(frame).await {
                Ok(()) => {}
                Err(TunnelError::Transport(e)) if !self.channel.is_open() => {
                    warn!("Data channel to {} failed: {}", peer_id, e);
                    break;
                }
                Err(e) => warn!("Request from {} dropped: {}", peer_id, e),
            }
        }

        info!("Connection to remote peer {} closed", peer_id);
    }

    /// Handle one inbound frame to completion
    pub async fn handle_frame(&self, frame: Frame) -> Result<(), TunnelError> {
        let request = TunnelRequest::from_frame(&frame)?;

        if request.is_ping() {
            debug!("Received keepalive ping from {}", self.channel.peer_id());
            self.channel.send(TunnelResponseHeader::pong().to_frame()?).await?;
            self.channel.send(pong_payload()).await?;
            return Ok(());
        }

        let fetch_request = to_fetch_request(request)?;
        info!(
            "http proxy request from {}: {} {}",
            self.channel.peer_id(),
            fetch_request.method,
            fetch_request.url
        );

        let url = fetch_request.url.clone();
        let keepalive = KeepaliveTimer::start(self.channel.clone(), self.config.heartbeat_interval);
        let result = match tokio::time::timeout(
            self.config.fetch_timeout,
            self.fetcher.fetch(fetch_request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(self.config.fetch_timeout)),
        };
        keepalive.cancel().await;

        match result {
            Ok(response) => self.send_response(response).await,
            Err(e) => self.report_failure(&url, e).await,
        }
    }

    async fn send_response(&self, response: FetchResponse) -> Result<(), TunnelError> {
        if let Some(limit) = self.channel.max_message_size() {
            if response.status != STATUS_NO_CONTENT && response.body.len() > limit {
                warn!(
                    "Response for {} has {} bytes, more than the {} a message can carry",
                    self.channel.peer_id(),
                    response.body.len(),
                    limit
                );
                self.channel
                    .send(TunnelResponseHeader::too_large().to_frame()?)
                    .await?;
                return Ok(());
            }
        }

        let header = TunnelResponseHeader {
            status: response.status,
            content_type: response.content_type().map(str::to_string),
            content_length: Some(response.body.len() as u64),
        };
        info!(
            "Answering {} with status {} ({} bytes)",
            self.channel.peer_id(),
            header.status,
            response.body.len()
        );

        self.channel.send(header.to_frame()?).await?;
        if header.has_body() {
            self.channel.send(Frame::Binary(response.body)).await?;
        }
        Ok(())
    }

    async fn report_failure(&self, url: &str, error: FetchError) -> Result<(), TunnelError> {
        warn!("Error while fetching {}: {}", url, error);
        if self.config.report_fetch_failures {
            self.channel
                .send(TunnelResponseHeader::internal_error().to_frame()?)
                .await?;
        } else {
            warn!(
                "No response sent to {} for failed request {}",
                self.channel.peer_id(),
                url
            );
        }
        Ok(())
    }
}

fn to_fetch_request(request: TunnelRequest) -> Result<FetchRequest, TunnelError> {
    let method: HttpMethod = request
        .method
        .parse()
        .map_err(|_| TunnelError::UnsupportedMethod(request.method.clone()))?;
    Ok(FetchRequest {
        url: request.url,
        method,
        headers: request.headers.unwrap_or_default(),
    })
}
