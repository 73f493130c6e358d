//! Transports carrying realtime JSON frames and media.
//!
//! A transport turns an [`OpenRequest`] into a [`TransportLink`]: an outbound
//! frame sender, an inbound event stream, and optionally a stream of remote
//! PCM audio. The session owns the link and closes it on teardown.

mod webrtc;
mod websocket;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::base::{EphemeralToken, LocalAudioTrack, RealtimeResult};

pub use webrtc::{DataChannel, PeerConnector, PeerHandle, SdpExchange, WebRtcTransport};
pub use websocket::WebSocketTransport;

/// Capacity of frame channels in both directions
pub const FRAME_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    WebRtc,
    #[default]
    WebSocket,
}

impl TransportKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "webrtc" | "rtc" => Some(TransportKind::WebRtc),
            "websocket" | "ws" => Some(TransportKind::WebSocket),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::WebRtc => write!(f, "webrtc"),
            TransportKind::WebSocket => write!(f, "websocket"),
        }
    }
}

/// Everything a transport needs to open a session.
#[derive(Debug)]
pub struct OpenRequest {
    pub token: EphemeralToken,
    pub model: String,
    pub url: Url,
    pub local_audio: Option<LocalAudioTrack>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The frame channel is ready for traffic
    Open,
    Frame(String),
    /// Closed by the remote side, with its reason if any
    Closed(Option<String>),
    Failed(String),
}

/// An opened transport.
pub struct TransportLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<TransportEvent>,
    pub remote_audio: Option<mpsc::Receiver<Bytes>>,
    /// Cancelled to close the underlying connection
    pub shutdown: CancellationToken,
    pub tasks: Vec<JoinHandle<()>>,
}

impl TransportLink {
    /// Pair of channels for in-memory transports.
    ///
    /// Returns the link plus the far ends: a receiver of outbound frames and
    /// a sender for inbound events.
    pub fn in_memory() -> (Self, mpsc::Receiver<String>, mpsc::Sender<TransportEvent>) {
        let (out_tx, out_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let link = Self {
            outbound: out_tx,
            inbound: in_rx,
            remote_audio: None,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        };
        (link, out_rx, in_tx)
    }

    pub fn with_remote_audio(mut self, audio: mpsc::Receiver<Bytes>) -> Self {
        self.remote_audio = Some(audio);
        self
    }
}

/// Parts of a link kept alive by the session after it takes the channels.
pub(crate) struct LinkGuard {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl LinkGuard {
    pub(crate) fn new(shutdown: CancellationToken, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { shutdown, tasks }
    }

    pub(crate) fn close(&mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn open(&self, request: OpenRequest) -> RealtimeResult<TransportLink>;
}
