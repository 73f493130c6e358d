//! WebRTC transport.
//!
//! The peer media stack (ICE, DTLS, SRTP, codecs) lives behind
//! [`PeerConnector`]. This module drives the offer/answer flow: create the
//! peer with its data channel and local track, post the offer SDP to the
//! realtime endpoint, and apply the answer.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{OpenRequest, RealtimeTransport, TransportEvent, TransportKind, TransportLink};
use crate::core::realtime::base::{LocalAudioTrack, RealtimeError, RealtimeResult};

const SDP_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(15);

/// The outbound data channel of a peer connection.
///
/// The peer sends [`TransportEvent::Open`] on `inbound` once the channel is
/// open, then every received message as a frame.
pub struct DataChannel {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait PeerHandle: Send {
    async fn create_offer(&mut self) -> RealtimeResult<String>;

    async fn apply_answer(&mut self, sdp: String) -> RealtimeResult<()>;

    fn take_channel(&mut self) -> Option<DataChannel>;

    /// Decoded PCM of the remote audio track
    fn take_remote_audio(&mut self) -> Option<mpsc::Receiver<Bytes>>;

    async fn close(&mut self);
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create a peer connection with a data channel and, if given, the local
    /// audio track attached.
    async fn create_peer(
        &self,
        local_audio: Option<LocalAudioTrack>,
    ) -> RealtimeResult<Box<dyn PeerHandle>>;
}

/// Offer/answer exchange over HTTPS.
#[derive(Debug, Clone)]
pub struct SdpExchange {
    client: reqwest::Client,
}

impl Default for SdpExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl SdpExchange {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// `POST {url}?model=<model>` with the offer; returns the answer SDP.
    pub async fn exchange(
        &self,
        url: &Url,
        model: &str,
        token: &str,
        offer: String,
    ) -> RealtimeResult<String> {
        let mut endpoint = url.clone();
        endpoint.query_pairs_mut().append_pair("model", model);

        let response = self
            .client
            .post(endpoint)
            .bearer_auth(token)
            .header("Content-Type", "application/sdp")
            .timeout(SDP_EXCHANGE_TIMEOUT)
            .body(offer)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RealtimeError::Timeout("SDP exchange".to_string())
                } else {
                    RealtimeError::ConnectionFailed(format!("SDP exchange failed: {}", e))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;

        match status.as_u16() {
            200..=299 if !body.trim().is_empty() => Ok(body),
            200..=299 => Err(RealtimeError::ConnectionFailed(
                "SDP exchange returned an empty answer".to_string(),
            )),
            401 | 403 => Err(RealtimeError::AuthenticationFailed(format!(
                "SDP exchange refused: {}",
                status
            ))),
            _ => Err(RealtimeError::ConnectionFailed(format!(
                "SDP exchange returned {}: {}",
                status, body
            ))),
        }
    }
}

pub struct WebRtcTransport {
    connector: Arc<dyn PeerConnector>,
    sdp: SdpExchange,
}

impl WebRtcTransport {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            connector,
            sdp: SdpExchange::new(),
        }
    }

    pub fn with_sdp_exchange(mut self, sdp: SdpExchange) -> Self {
        self.sdp = sdp;
        self
    }

    async fn negotiate(
        &self,
        peer: &mut Box<dyn PeerHandle>,
        request: &OpenRequest,
    ) -> RealtimeResult<DataChannel> {
        let channel = peer.take_channel().ok_or_else(|| {
            RealtimeError::ConnectionFailed("peer has no data channel".to_string())
        })?;
        let offer = peer.create_offer().await?;
        debug!(offer_len = offer.len(), "Created SDP offer");

        let answer = self
            .sdp
            .exchange(&request.url, &request.model, request.token.value(), offer)
            .await?;
        peer.apply_answer(answer).await?;
        Ok(channel)
    }
}

#[async_trait]
impl RealtimeTransport for WebRtcTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebRtc
    }

    async fn open(&self, mut request: OpenRequest) -> RealtimeResult<TransportLink> {
        let local_audio = request.local_audio.take();
        let local_stop = local_audio.as_ref().map(LocalAudioTrack::stop_handle);
        let mut peer = self.connector.create_peer(local_audio).await?;

        let channel = match self.negotiate(&mut peer, &request).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "WebRTC negotiation failed");
                peer.close().await;
                if let Some(stop) = local_stop {
                    stop.cancel();
                }
                return Err(e);
            }
        };
        let remote_audio = peer.take_remote_audio();
        info!("WebRTC peer connected");

        let shutdown = CancellationToken::new();
        let close_on = shutdown.clone();
        let closer = tokio::spawn(async move {
            close_on.cancelled().await;
            peer.close().await;
            if let Some(stop) = local_stop {
                stop.cancel();
            }
            debug!("WebRTC peer closed");
        });

        Ok(TransportLink {
            outbound: channel.outbound,
            inbound: channel.inbound,
            remote_audio,
            shutdown,
            tasks: vec![closer],
        })
    }
}
