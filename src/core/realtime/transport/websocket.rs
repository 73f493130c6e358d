//! WebSocket transport.
//!
//! Frames travel as text messages. Captured audio is forwarded as
//! `input_audio_buffer.append` events and remote audio arrives in-band as
//! `response.audio.delta`, so the link carries no separate media stream.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::{
    FRAME_CHANNEL_CAPACITY, OpenRequest, RealtimeTransport, TransportEvent, TransportKind,
    TransportLink,
};
use crate::core::realtime::base::{LocalAudioTrack, RealtimeError, RealtimeResult};
use crate::core::realtime::messages::ClientEvent;

#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }

    fn build_url(url: &Url, model: &str) -> Url {
        let mut url = url.clone();
        if !url.query_pairs().any(|(k, _)| k == "model") {
            url.query_pairs_mut().append_pair("model", model);
        }
        url
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn open(&self, request: OpenRequest) -> RealtimeResult<TransportLink> {
        let url = Self::build_url(&request.url, &request.model);

        let mut ws_request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::InvalidConfiguration(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", request.token.value()))
            .map_err(|e| RealtimeError::InvalidConfiguration(e.to_string()))?;
        let headers = ws_request.headers_mut();
        headers.insert("Authorization", bearer);
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws_stream, _response) = tokio_tungstenite::connect_async(ws_request)
            .await
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;

        info!(host = url.host_str().unwrap_or_default(), "WebSocket connected");

        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(FRAME_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(FRAME_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();

        // The socket is usable as soon as the handshake completes
        in_tx
            .send(TransportEvent::Open)
            .await
            .map_err(|e| RealtimeError::TransportError(e.to_string()))?;

        let io_shutdown = shutdown.clone();
        let io_task = tokio::spawn(async move {
            let end = loop {
                tokio::select! {
                    _ = io_shutdown.cancelled() => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break None;
                    }

                    Some(frame) = out_rx.recv() => {
                        if let Err(e) = ws_sink.send(Message::Text(frame.into())).await {
                            error!("Failed to send WebSocket message: {}", e);
                            break Some(TransportEvent::Failed(e.to_string()));
                        }
                    }

                    msg = ws_stream.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if in_tx.send(TransportEvent::Frame(text.as_str().to_owned())).await.is_err() {
                                    break None;
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                    warn!("Failed to send pong: {}", e);
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                info!("WebSocket closed by server");
                                let reason = frame
                                    .map(|f| f.reason.as_str().to_owned())
                                    .filter(|r| !r.is_empty());
                                break Some(TransportEvent::Closed(reason));
                            }
                            Some(Ok(_)) => trace!("Ignoring non-text WebSocket message"),
                            Some(Err(e)) => {
                                error!("WebSocket error: {}", e);
                                break Some(TransportEvent::Failed(e.to_string()));
                            }
                            None => break Some(TransportEvent::Closed(None)),
                        }
                    }
                }
            };
            if let Some(event) = end {
                let _ = in_tx.send(event).await;
            }
            debug!("WebSocket task finished");
        });

        let mut tasks = vec![io_task];
        if let Some(track) = request.local_audio {
            tasks.push(spawn_audio_pump(track, out_tx.clone(), shutdown.clone()));
        }

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
            remote_audio: None,
            shutdown,
            tasks,
        })
    }
}

/// Forward captured PCM as append events until shutdown or end of capture.
fn spawn_audio_pump(
    mut track: LocalAudioTrack,
    outbound: mpsc::Sender<String>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let stop = track.stop_handle();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = track.frames.recv() => {
                    let Some(frame) = frame else { break };
                    let json = match ClientEvent::audio_append(&frame).to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            error!("Failed to serialize audio frame: {}", e);
                            continue;
                        }
                    };
                    if outbound.send(json).await.is_err() {
                        break;
                    }
                }
            }
        }
        stop.cancel();
        debug!("Audio pump stopped");
    })
}
