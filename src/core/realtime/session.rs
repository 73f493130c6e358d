//! Realtime session client.
//!
//! A [`RealtimeSession`] owns one transport link, the conversation state, the
//! output level meter and the background tasks of a single session:
//!
//! - event loop: decodes inbound frames and reconciles the conversation
//! - function calls: one task per call, dispatched through the [`ToolRegistry`]
//! - media pump: renders remote audio and feeds the meter (WebRTC)
//! - sampler: publishes the RMS level every `volume_interval`
//! - heartbeat: signals the [`UsageSink`] while connected
//!
//! `disconnect()` is the single teardown path. It is synchronous, idempotent
//! and cancels every task owned by the session.

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, interval, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;
use uuid::Uuid;

use super::base::{
    AudioCapture, AudioSink, ConversationCallback, LocalAudioTrack, RealtimeError,
    RealtimeErrorCallback, RealtimeResult, SessionStatus, TokenProvider, UsageSink,
};
use super::conversation::{Conversation, ConversationItem, Role};
use super::messages::{ClientEvent, ItemPayload, ResponseOptions, ServerEvent, SessionConfig};
use super::transport::{LinkGuard, OpenRequest, RealtimeTransport, TransportEvent, TransportLink};
use super::volume::LevelMeter;
use crate::core::registry::{ToolRegistry, call_with_cancel};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_VOLUME_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(130);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

// =============================================================================
// Options
// =============================================================================

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub url: Url,
    pub model: String,
    /// Agent snapshot pushed when the channel opens
    pub agent: SessionConfig,
    /// Start local capture on connect (needs an [`AudioCapture`])
    pub capture_audio: bool,
    /// Request a response as soon as the channel opens
    pub agent_speaks_first: bool,
    pub heartbeat_interval: Duration,
    pub volume_interval: Duration,
    /// Guard around each function call on top of the tool's own timeout
    pub tool_call_timeout: Duration,
    pub connect_timeout: Duration,
}

impl SessionOptions {
    pub fn new(url: Url, model: impl Into<String>) -> Self {
        Self {
            url,
            model: model.into(),
            agent: SessionConfig::default(),
            capture_audio: true,
            agent_speaks_first: true,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            volume_interval: DEFAULT_VOLUME_INTERVAL,
            tool_call_timeout: DEFAULT_TOOL_CALL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

pub struct RealtimeSessionBuilder {
    options: SessionOptions,
    transport: Option<Arc<dyn RealtimeTransport>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    registry: ToolRegistry,
    capture: Option<Arc<dyn AudioCapture>>,
    sink: Option<Arc<dyn AudioSink>>,
    usage: Option<Arc<dyn UsageSink>>,
}

impl RealtimeSessionBuilder {
    pub fn transport(mut self, transport: Arc<dyn RealtimeTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn audio_capture(mut self, capture: Arc<dyn AudioCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn audio_sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn usage_sink(mut self, usage: Arc<dyn UsageSink>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn build(self) -> RealtimeResult<RealtimeSession> {
        let transport = self.transport.ok_or_else(|| {
            RealtimeError::InvalidConfiguration("a transport is required".to_string())
        })?;
        let tokens = self.tokens.ok_or_else(|| {
            RealtimeError::InvalidConfiguration("a token provider is required".to_string())
        })?;
        if self.options.model.trim().is_empty() {
            return Err(RealtimeError::InvalidConfiguration(
                "model must not be empty".to_string(),
            ));
        }

        let mut agent = self.options.agent.clone();
        agent.normalize();
        let (status, _) = watch::channel(SessionStatus::Disconnected);

        Ok(RealtimeSession {
            inner: Arc::new(Inner {
                id: Uuid::new_v4().to_string(),
                options: self.options,
                transport,
                tokens,
                registry: self.registry,
                capture: self.capture,
                sink: self.sink,
                usage: self.usage,
                status,
                agent: Mutex::new(agent),
                conversation: Mutex::new(Conversation::new()),
                outbound: Mutex::new(None),
                call_names: Mutex::new(HashMap::new()),
                meter: LevelMeter::new(),
                runtime: Mutex::new(None),
                conversation_cb: Mutex::new(None),
                error_cb: Mutex::new(None),
            }),
        })
    }
}

// =============================================================================
// Session
// =============================================================================

/// Tasks and handles alive while a link is open.
struct Runtime {
    root: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    link: LinkGuard,
    local_stop: Option<CancellationToken>,
}

struct Inner {
    id: String,
    options: SessionOptions,
    transport: Arc<dyn RealtimeTransport>,
    tokens: Arc<dyn TokenProvider>,
    registry: ToolRegistry,
    capture: Option<Arc<dyn AudioCapture>>,
    sink: Option<Arc<dyn AudioSink>>,
    usage: Option<Arc<dyn UsageSink>>,

    status: watch::Sender<SessionStatus>,
    agent: Mutex<SessionConfig>,
    conversation: Mutex<Conversation>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    /// Function names announced by `response.output_item.added`, keyed by
    /// call id and item id
    call_names: Mutex<HashMap<String, String>>,
    meter: LevelMeter,
    runtime: Mutex<Option<Runtime>>,

    conversation_cb: Mutex<Option<ConversationCallback>>,
    error_cb: Mutex<Option<RealtimeErrorCallback>>,
}

pub struct RealtimeSession {
    inner: Arc<Inner>,
}

impl RealtimeSession {
    pub fn builder(options: SessionOptions) -> RealtimeSessionBuilder {
        RealtimeSessionBuilder {
            options,
            transport: None,
            tokens: None,
            registry: ToolRegistry::new(),
            capture: None,
            sink: None,
            usage: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// Latest output level in `0.0..=1.0`
    pub fn volume(&self) -> f32 {
        self.inner.meter.level()
    }

    pub fn conversation(&self) -> Vec<ConversationItem> {
        self.inner.conversation.lock().snapshot()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.inner.registry
    }

    /// Current agent snapshot
    pub fn agent(&self) -> SessionConfig {
        self.inner.agent.lock().clone()
    }

    pub fn on_conversation(&self, callback: ConversationCallback) {
        *self.inner.conversation_cb.lock() = Some(callback);
    }

    pub fn on_error(&self, callback: RealtimeErrorCallback) {
        *self.inner.error_cb.lock() = Some(callback);
    }

    /// Open the session.
    ///
    /// Returns once the frame channel is open and the agent snapshot has been
    /// pushed. Calling it while connecting or connected is a no-op. Any
    /// failure leaves the session in `Error` with everything torn down.
    pub async fn connect(&self) -> RealtimeResult<()> {
        let started = self.inner.status.send_if_modified(|status| {
            if matches!(status, SessionStatus::Disconnected | SessionStatus::Error) {
                *status = SessionStatus::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            debug!(session_id = %self.inner.id, "connect() ignored, session already active");
            return Ok(());
        }

        info!(
            session_id = %self.inner.id,
            transport = %self.inner.transport.kind(),
            model = %self.inner.options.model,
            "Connecting realtime session"
        );

        let deadline = Instant::now() + self.inner.options.connect_timeout;
        let established =
            match tokio::time::timeout_at(deadline, self.inner.clone().establish()).await {
                Ok(result) => result,
                Err(_) => Err(RealtimeError::Timeout("transport open".to_string())),
            };
        if let Err(e) = established {
            self.inner.fail(RealtimeError::ConnectionFailed(e.to_string())).await;
            return Err(e);
        }

        let mut status_rx = self.inner.status.subscribe();
        let opened = tokio::time::timeout_at(deadline, async {
            status_rx
                .wait_for(|s| *s != SessionStatus::Connecting)
                .await
                .map(|s| *s)
        })
        .await;

        match opened {
            Ok(Ok(SessionStatus::Connected)) => Ok(()),
            Ok(Ok(status)) => Err(RealtimeError::ConnectionFailed(format!(
                "session ended before the channel opened ({})",
                status
            ))),
            Ok(Err(_)) => Err(RealtimeError::ConnectionFailed(
                "session dropped while connecting".to_string(),
            )),
            Err(_) => {
                let err = RealtimeError::Timeout("channel open".to_string());
                self.inner.fail(RealtimeError::Timeout("channel open".to_string())).await;
                Err(err)
            }
        }
    }

    /// Tear the session down. Safe to call any number of times.
    pub fn disconnect(&self) {
        self.inner.teardown(false);
    }

    /// Merge `partial` into the agent snapshot and push it when connected.
    pub async fn update_session(&self, partial: SessionConfig) -> RealtimeResult<()> {
        let session = {
            let mut agent = self.inner.agent.lock();
            agent.merge(partial);
            agent.clone()
        };
        if self.status() != SessionStatus::Connected {
            debug!(session_id = %self.inner.id, "Agent snapshot updated, pushed on next open");
            return Ok(());
        }
        self.inner.send(ClientEvent::SessionUpdate { session }).await
    }

    /// Send a typed user message and record it as a final user item.
    pub async fn send_text(&self, text: &str) -> RealtimeResult<()> {
        self.ensure_connected()?;
        self.inner
            .send(ClientEvent::ConversationItemCreate {
                item: ItemPayload::user_text(text),
            })
            .await?;
        self.inner
            .conversation
            .lock()
            .add_final(Role::User, text, None);
        self.inner.notify_conversation().await;
        Ok(())
    }

    pub async fn create_response(&self) -> RealtimeResult<()> {
        self.ensure_connected()?;
        self.inner
            .send(ClientEvent::ResponseCreate { response: None })
            .await
    }

    pub async fn cancel_response(&self) -> RealtimeResult<()> {
        self.ensure_connected()?;
        self.inner.send(ClientEvent::ResponseCancel).await
    }

    /// Cut the server's copy of an assistant item at `audio_end_ms`.
    pub async fn truncate(&self, item_id: &str, audio_end_ms: u32) -> RealtimeResult<()> {
        self.ensure_connected()?;
        self.inner
            .send(ClientEvent::ConversationItemTruncate {
                item_id: item_id.to_string(),
                content_index: 0,
                audio_end_ms,
            })
            .await
    }

    /// Push-to-talk pressed: interrupt the agent and drop buffered input.
    pub async fn ptt_down(&self) -> RealtimeResult<()> {
        self.ensure_connected()?;
        self.inner.send(ClientEvent::ResponseCancel).await?;
        self.inner.send(ClientEvent::InputAudioBufferClear).await
    }

    /// Push-to-talk released: commit the buffered input and ask for a reply.
    pub async fn ptt_up(&self) -> RealtimeResult<()> {
        self.ensure_connected()?;
        self.inner.send(ClientEvent::InputAudioBufferCommit).await?;
        self.inner
            .send(ClientEvent::ResponseCreate { response: None })
            .await
    }

    /// Make the model call `name` with exactly `args`. Used for self-tests.
    pub async fn force_function_call(&self, name: &str, args: Value) -> RealtimeResult<()> {
        self.ensure_connected()?;
        let instruction = format!(
            "Call the function `{}` now with exactly these JSON arguments and nothing else: {}",
            name, args
        );
        self.inner
            .send(ClientEvent::ConversationItemCreate {
                item: ItemPayload::user_text(instruction),
            })
            .await?;
        self.inner
            .send(ClientEvent::ResponseCreate {
                response: Some(ResponseOptions {
                    tool_choice: Some(json!({"type": "function", "name": name})),
                    ..Default::default()
                }),
            })
            .await
    }

    fn ensure_connected(&self) -> RealtimeResult<()> {
        if self.status() == SessionStatus::Connected {
            Ok(())
        } else {
            Err(RealtimeError::NotConnected)
        }
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.inner.teardown(true);
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

impl Inner {
    async fn establish(self: Arc<Self>) -> RealtimeResult<()> {
        let token = self.tokens.fetch_token().await?;
        if token.is_expired() {
            return Err(RealtimeError::AuthenticationFailed(
                "ephemeral token already expired".to_string(),
            ));
        }

        let local_audio = match (&self.capture, self.options.capture_audio) {
            (Some(capture), true) => Some(capture.start().await?),
            _ => None,
        };
        let local_stop = local_audio.as_ref().map(LocalAudioTrack::stop_handle);

        let request = OpenRequest {
            token,
            model: self.options.model.clone(),
            url: self.options.url.clone(),
            local_audio,
        };
        let link = match self.transport.open(request).await {
            Ok(link) => link,
            Err(e) => {
                if let Some(stop) = &local_stop {
                    stop.cancel();
                }
                return Err(e);
            }
        };
        let TransportLink {
            outbound,
            inbound,
            remote_audio,
            shutdown,
            tasks,
        } = link;
        let mut guard = LinkGuard::new(shutdown, tasks);

        let mut slot = self.runtime.lock();
        if *self.status.borrow() != SessionStatus::Connecting {
            drop(slot);
            guard.close();
            if let Some(stop) = &local_stop {
                stop.cancel();
            }
            return Err(RealtimeError::ConnectionFailed(
                "disconnected while connecting".to_string(),
            ));
        }

        *self.outbound.lock() = Some(outbound);
        let root = CancellationToken::new();
        let mut handles = vec![
            tokio::spawn(self.clone().event_loop(inbound, root.clone())),
            tokio::spawn(self.clone().sampler(root.clone())),
        ];
        if let Some(audio) = remote_audio {
            handles.push(tokio::spawn(self.clone().media_pump(audio, root.clone())));
        }
        if let Some(usage) = self.usage.clone() {
            handles.push(tokio::spawn(self.clone().heartbeat(usage, root.clone())));
        }

        *slot = Some(Runtime {
            root,
            tasks: handles,
            link: guard,
            local_stop,
        });
        Ok(())
    }

    /// Cancel everything and reset state. `keep_error` preserves an `Error`
    /// status set by the failure that triggered the teardown.
    fn teardown(&self, keep_error: bool) {
        let runtime = self.runtime.lock().take();
        if let Some(mut runtime) = runtime {
            runtime.root.cancel();
            for task in runtime.tasks.drain(..) {
                task.abort();
            }
            runtime.link.close();
            if let Some(stop) = runtime.local_stop {
                stop.cancel();
            }
            if let Some(sink) = &self.sink {
                sink.detach();
            }
            info!(session_id = %self.id, "Realtime session torn down");
        }

        *self.outbound.lock() = None;
        self.meter.reset();
        self.conversation.lock().clear();
        self.call_names.lock().clear();
        self.status.send_if_modified(|status| {
            let next = if keep_error && *status == SessionStatus::Error {
                SessionStatus::Error
            } else {
                SessionStatus::Disconnected
            };
            let changed = *status != next;
            *status = next;
            changed
        });
    }

    /// Enter `Error`, surface the error, then tear down.
    async fn fail(&self, err: RealtimeError) {
        error!(session_id = %self.id, error = %err, "Realtime session failed");
        self.status.send_replace(SessionStatus::Error);
        self.emit_error(err).await;
        self.teardown(true);
    }

    async fn emit_error(&self, err: RealtimeError) {
        let callback = self.error_cb.lock().clone();
        if let Some(cb) = callback {
            cb(err).await;
        }
    }

    async fn notify_conversation(&self) {
        let callback = self.conversation_cb.lock().clone();
        if let Some(cb) = callback {
            let snapshot = self.conversation.lock().snapshot();
            cb(snapshot).await;
        }
    }

    async fn send(&self, event: ClientEvent) -> RealtimeResult<()> {
        let sender = self
            .outbound
            .lock()
            .clone()
            .ok_or(RealtimeError::NotConnected)?;
        let json = event.to_json()?;
        sender
            .send(json)
            .await
            .map_err(|_| RealtimeError::TransportError("outbound channel closed".to_string()))
    }

    async fn on_open(&self) {
        let opened = self.status.send_if_modified(|status| {
            if *status == SessionStatus::Connecting {
                *status = SessionStatus::Connected;
                true
            } else {
                false
            }
        });
        if !opened {
            return;
        }
        info!(session_id = %self.id, "Realtime channel open");

        let session = self.agent.lock().clone();
        if let Err(e) = self.send(ClientEvent::SessionUpdate { session }).await {
            warn!(session_id = %self.id, error = %e, "Failed to push session config");
        }
        if self.options.agent_speaks_first
            && let Err(e) = self.send(ClientEvent::ResponseCreate { response: None }).await
        {
            warn!(session_id = %self.id, error = %e, "Failed to request initial response");
        }
    }
}

// =============================================================================
// Background Tasks
// =============================================================================

impl Inner {
    async fn event_loop(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<TransportEvent>,
        root: CancellationToken,
    ) {
        let mut calls: JoinSet<()> = JoinSet::new();
        loop {
            let event = tokio::select! {
                _ = root.cancelled() => break,
                Some(_) = calls.join_next(), if !calls.is_empty() => continue,
                event = inbound.recv() => event,
            };

            match event {
                Some(TransportEvent::Open) => self.on_open().await,
                Some(TransportEvent::Frame(text)) => {
                    self.handle_frame(&text, &mut calls, &root).await;
                }
                Some(TransportEvent::Closed(reason)) => {
                    let connecting = *self.status.borrow() == SessionStatus::Connecting;
                    if connecting {
                        self.fail(RealtimeError::ConnectionFailed(format!(
                            "channel closed before open ({})",
                            reason.as_deref().unwrap_or("no reason")
                        )))
                        .await;
                    } else {
                        info!(session_id = %self.id, reason = ?reason, "Transport closed by remote");
                        self.teardown(false);
                    }
                    break;
                }
                Some(TransportEvent::Failed(reason)) => {
                    self.fail(RealtimeError::TransportError(reason)).await;
                    break;
                }
                None => {
                    self.fail(RealtimeError::TransportError(
                        "transport ended without closing".to_string(),
                    ))
                    .await;
                    break;
                }
            }
        }
        debug!(session_id = %self.id, "Event loop finished");
    }

    async fn sampler(self: Arc<Self>, root: CancellationToken) {
        let mut ticker = interval(self.options.volume_interval);
        loop {
            tokio::select! {
                _ = root.cancelled() => break,
                _ = ticker.tick() => {
                    self.meter.tick();
                }
            }
        }
    }

    async fn media_pump(self: Arc<Self>, mut audio: mpsc::Receiver<Bytes>, root: CancellationToken) {
        loop {
            tokio::select! {
                _ = root.cancelled() => break,
                frame = audio.recv() => {
                    let Some(frame) = frame else { break };
                    self.render(frame);
                }
            }
        }
        debug!(session_id = %self.id, "Media pump stopped");
    }

    async fn heartbeat(self: Arc<Self>, usage: Arc<dyn UsageSink>, root: CancellationToken) {
        let period = self.options.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = root.cancelled() => break,
                _ = ticker.tick() => {
                    if *self.status.borrow() == SessionStatus::Connected {
                        trace!(session_id = %self.id, "Heartbeat");
                        usage.heartbeat(&self.id).await;
                    }
                }
            }
        }
    }

    fn render(&self, pcm: Bytes) {
        self.meter.feed(&pcm);
        if let Some(sink) = &self.sink {
            sink.play(pcm);
        }
    }
}

// =============================================================================
// Inbound Events
// =============================================================================

/// Decode model-supplied arguments. Anything that is not a JSON object
/// becomes `{}`.
fn parse_arguments(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => value,
        _ => {
            if !raw.trim().is_empty() {
                warn!(arguments = raw, "Malformed function arguments, using {{}}");
            }
            json!({})
        }
    }
}

impl Inner {
    async fn handle_frame(
        self: &Arc<Self>,
        text: &str,
        calls: &mut JoinSet<()>,
        root: &CancellationToken,
    ) {
        let event = match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                trace!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        let changed = match event {
            ServerEvent::Error { error } => {
                warn!(
                    session_id = %self.id,
                    error_type = %error.error_type,
                    code = ?error.code,
                    "Server error: {}",
                    error.message
                );
                self.emit_error(RealtimeError::ServerError(error.message))
                    .await;
                false
            }
            ServerEvent::SessionCreated { .. } => {
                debug!(session_id = %self.id, "Server session created");
                false
            }
            ServerEvent::SessionUpdated { .. } => {
                debug!(session_id = %self.id, "Server session updated");
                false
            }
            ServerEvent::SpeechStarted { item_id, .. } => {
                self.conversation.lock().speech_started(item_id);
                true
            }
            ServerEvent::SpeechStopped { .. } => false,
            ServerEvent::InputAudioBufferCommitted { item_id } => {
                self.conversation.lock().committed(item_id);
                true
            }
            ServerEvent::TranscriptionPartial {
                item_id,
                transcript,
                delta,
            }
            | ServerEvent::TranscriptionDelta {
                item_id,
                transcript,
                delta,
            } => match transcript.or(delta) {
                Some(text) => {
                    self.conversation.lock().user_partial(item_id, &text);
                    true
                }
                None => false,
            },
            ServerEvent::TranscriptionCompleted {
                item_id,
                transcript,
            } => {
                self.conversation.lock().user_completed(item_id, &transcript);
                true
            }
            ServerEvent::TranscriptionFailed { error, .. } => {
                warn!(session_id = %self.id, "Transcription failed: {}", error.message);
                self.conversation.lock().user_failed();
                true
            }
            ServerEvent::AudioTranscriptDelta { item_id, delta }
            | ServerEvent::TextDelta { item_id, delta } => {
                self.conversation.lock().assistant_delta(item_id, &delta);
                true
            }
            ServerEvent::AudioTranscriptDone {
                item_id,
                transcript: text,
            }
            | ServerEvent::TextDone { item_id, text } => {
                self.conversation
                    .lock()
                    .assistant_done(item_id, text.as_deref());
                true
            }
            ServerEvent::AudioDelta { delta } => {
                match ServerEvent::decode_audio_delta(&delta) {
                    Ok(pcm) => self.render(Bytes::from(pcm)),
                    Err(e) => trace!(error = %e, "Dropping undecodable audio delta"),
                }
                false
            }
            ServerEvent::OutputItemAdded { item } => {
                if item.item_type == "function_call"
                    && let Some(name) = item.name
                {
                    let mut names = self.call_names.lock();
                    if let Some(call_id) = item.call_id {
                        names.insert(call_id, name.clone());
                    }
                    if let Some(id) = item.id {
                        names.insert(id, name);
                    }
                }
                false
            }
            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                item_id,
                arguments,
            } => {
                self.dispatch_function_call(calls, root, call_id, name, item_id, &arguments);
                false
            }
            ServerEvent::ResponseDone { response } => {
                debug!(
                    session_id = %self.id,
                    response_id = ?response.id,
                    status = ?response.status,
                    "Response done"
                );
                if let (Some(sink), Some(usage)) = (self.usage.clone(), response.usage) {
                    let session_id = self.id.clone();
                    calls.spawn(async move {
                        sink.report_usage(&session_id, &usage).await;
                    });
                }
                false
            }
            ServerEvent::Unknown => {
                trace!("Ignoring unhandled frame type");
                false
            }
        };

        if changed {
            self.notify_conversation().await;
        }
    }

    fn dispatch_function_call(
        self: &Arc<Self>,
        calls: &mut JoinSet<()>,
        root: &CancellationToken,
        call_id: String,
        name: Option<String>,
        item_id: Option<String>,
        arguments: &str,
    ) {
        let name = {
            let mut names = self.call_names.lock();
            let tracked = names.remove(&call_id);
            let by_item = item_id.and_then(|id| names.remove(&id));
            name.filter(|n| !n.is_empty()).or(tracked).or(by_item)
        };
        let args = parse_arguments(arguments);
        let function = name.as_deref().and_then(|n| self.registry.get(n));

        info!(
            session_id = %self.id,
            call_id = %call_id,
            function = name.as_deref().unwrap_or("<unknown>"),
            "Dispatching function call"
        );

        let inner = self.clone();
        let cancel = root.child_token();
        let limit = self.options.tool_call_timeout;
        calls.spawn(async move {
            let output = match function {
                None => {
                    warn!(call_id = %call_id, function = ?name, "Unknown function requested");
                    json!({"ok": false, "error": "unknown_function"})
                }
                Some(function) => tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = tokio::time::timeout(limit, call_with_cancel(&function, args, cancel.clone())) => {
                        result.unwrap_or_else(|_| {
                            warn!(call_id = %call_id, "Function call timed out");
                            json!({"ok": false, "error": "timeout"})
                        })
                    }
                },
            };
            inner.complete_function_call(call_id, output).await;
        });
    }

    async fn complete_function_call(&self, call_id: String, output: Value) {
        let output = output.to_string();
        let sent = self
            .send(ClientEvent::ConversationItemCreate {
                item: ItemPayload::FunctionCallOutput {
                    call_id: call_id.clone(),
                    output: output.clone(),
                },
            })
            .await;
        if let Err(e) = sent {
            warn!(call_id = %call_id, error = %e, "Failed to send function output");
            return;
        }
        if let Err(e) = self.send(ClientEvent::ResponseCreate { response: None }).await {
            warn!(call_id = %call_id, error = %e, "Failed to request follow-up response");
        }

        self.conversation
            .lock()
            .add_final(Role::Tool, &output, None);
        self.notify_conversation().await;
    }
}
