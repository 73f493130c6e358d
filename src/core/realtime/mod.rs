//! Realtime session client.
//!
//! Negotiates a peer (WebRTC) or WebSocket connection to a conversational
//! model, reconciles streaming transcripts into a stable conversation log and
//! dispatches model function calls into a [`ToolRegistry`](crate::core::registry::ToolRegistry).
//!
//! # Architecture
//!
//! - [`RealtimeSession`] owns the lifecycle and the background tasks
//! - [`RealtimeTransport`] opens the frame channel ([`WebRtcTransport`],
//!   [`WebSocketTransport`])
//! - [`TokenProvider`], [`AudioCapture`], [`AudioSink`] and [`UsageSink`] are
//!   the injected collaborators
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use waav_realtime::core::realtime::{
//!     HttpTokenProvider, RealtimeSession, SessionOptions, WebSocketTransport,
//! };
//!
//! let options = SessionOptions::new(url, "gpt-realtime");
//! let session = RealtimeSession::builder(options)
//!     .transport(Arc::new(WebSocketTransport::new()))
//!     .token_provider(Arc::new(HttpTokenProvider::new(token_url)))
//!     .build()?;
//!
//! session.connect().await?;
//! session.send_text("What's the weather in Oslo?").await?;
//! session.create_response().await?;
//! ```

mod base;
mod conversation;
mod messages;
mod session;
mod token;
pub mod transport;
mod volume;

pub use base::{
    AudioCapture, AudioSink, ConversationCallback, EphemeralToken, LocalAudioTrack, RealtimeError,
    RealtimeErrorCallback, RealtimeResult, SessionStatus, TokenProvider, UsageSink,
};
pub use conversation::{Conversation, ConversationItem, ItemStatus, Role};
pub use messages::{
    ApiError, ClientEvent, ContentPart, ItemPayload, OutputItem, ResponseInfo, ResponseOptions,
    ServerEvent, SessionConfig, ToolDefinition, Usage,
};
pub use session::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_TOOL_CALL_TIMEOUT,
    DEFAULT_VOLUME_INTERVAL, RealtimeSession, RealtimeSessionBuilder, SessionOptions,
};
pub use token::{HttpTokenProvider, StaticTokenProvider, parse_token_response};
pub use transport::{
    DataChannel, OpenRequest, PeerConnector, PeerHandle, RealtimeTransport, SdpExchange,
    TransportEvent, TransportKind, TransportLink, WebRtcTransport, WebSocketTransport,
};
pub use volume::LevelMeter;
