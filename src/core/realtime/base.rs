//! Base traits and types for the realtime session client.
//!
//! Every external collaborator of a session is consumed through a narrow
//! trait defined here:
//! - [`TokenProvider`] issues short-lived session credentials
//! - [`AudioCapture`] yields the local microphone track
//! - [`AudioSink`] renders remote audio
//! - [`UsageSink`] receives heartbeats and per-response usage
//!
//! # Audio Format
//!
//! Audio frames are PCM 16-bit signed little-endian, mono.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::conversation::ConversationItem;
use super::messages::Usage;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during realtime operations.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Opening the transport failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Token issuance or SDP exchange was refused
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The open transport reported an error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Error event sent by the server
    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Not connected")]
    NotConnected,

    /// Local media could not be acquired
    #[error("Media error: {0}")]
    MediaError(String),
}

impl From<serde_json::Error> for RealtimeError {
    fn from(e: serde_json::Error) -> Self {
        RealtimeError::SerializationError(e.to_string())
    }
}

/// Result type for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

// =============================================================================
// Session Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Disconnected => write!(f, "disconnected"),
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Connected => write!(f, "connected"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Short-lived session credential. The value is wiped from memory on drop.
#[derive(Clone)]
pub struct EphemeralToken {
    value: String,
    /// Unix timestamp (seconds)
    expires_at: Option<i64>,
}

impl EphemeralToken {
    pub fn new(value: impl Into<String>, expires_at: Option<i64>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|at| at <= time::OffsetDateTime::now_utc().unix_timestamp())
            .unwrap_or(false)
    }
}

impl Drop for EphemeralToken {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.value.zeroize();
    }
}

impl fmt::Debug for EphemeralToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> RealtimeResult<EphemeralToken>;
}

// =============================================================================
// Media
// =============================================================================

/// A running local capture: PCM frames plus a handle to stop the device.
pub struct LocalAudioTrack {
    pub frames: mpsc::Receiver<Bytes>,
    stop: CancellationToken,
}

impl LocalAudioTrack {
    pub fn new(frames: mpsc::Receiver<Bytes>, stop: CancellationToken) -> Self {
        Self { frames, stop }
    }

    /// Token that stops the capture when cancelled.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }
}

impl fmt::Debug for LocalAudioTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAudioTrack")
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}

#[async_trait]
pub trait AudioCapture: Send + Sync {
    async fn start(&self) -> RealtimeResult<LocalAudioTrack>;
}

pub trait AudioSink: Send + Sync {
    fn play(&self, pcm: Bytes);

    /// Called once during teardown.
    fn detach(&self) {}
}

// =============================================================================
// Usage
// =============================================================================

#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Periodic liveness signal while connected
    async fn heartbeat(&self, session_id: &str);

    /// Token usage of one completed response
    async fn report_usage(&self, session_id: &str, usage: &Usage);
}

// =============================================================================
// Callback Types
// =============================================================================

/// Invoked with a snapshot of the conversation after every change.
pub type ConversationCallback =
    Arc<dyn Fn(Vec<ConversationItem>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Invoked for server `error` frames and transport failures.
pub type RealtimeErrorCallback =
    Arc<dyn Fn(RealtimeError) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
