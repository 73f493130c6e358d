//! Integration tests for the realtime session client
//!
//! These tests drive a session over an in-memory transport and verify:
//! - Connection lifecycle and status transitions
//! - Conversation reconciliation from streaming events
//! - Function-call round trips through the registry
//! - Push-to-talk and control frames
//! - Teardown idempotency and failure handling

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;
use waav_realtime::core::realtime::{
    AudioSink, ConversationCallback, EphemeralToken, ItemStatus, OpenRequest, RealtimeError,
    RealtimeErrorCallback, RealtimeResult, RealtimeSession, RealtimeTransport, Role, SessionConfig,
    SessionOptions, SessionStatus, StaticTokenProvider, TokenProvider, ToolDefinition,
    TransportEvent, TransportKind, TransportLink, Usage, UsageSink,
};
use waav_realtime::core::registry::{ToolFn, ToolRegistry};

// =============================================================================
// Test doubles
// =============================================================================

type FarEnds = (mpsc::Receiver<String>, mpsc::Sender<TransportEvent>);

#[derive(Default)]
struct MockTransport {
    far: Mutex<Option<FarEnds>>,
    shutdown: Mutex<Option<CancellationToken>>,
    opens: AtomicUsize,
    /// Close the channel instead of opening it
    reject: bool,
}

impl MockTransport {
    fn take_far(&self) -> FarEnds {
        self.far.lock().unwrap().take().expect("transport was not opened")
    }

    fn is_closed(&self) -> bool {
        self.shutdown
            .lock()
            .unwrap()
            .as_ref()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }
}

#[async_trait]
impl RealtimeTransport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn open(&self, request: OpenRequest) -> RealtimeResult<TransportLink> {
        assert_eq!(request.token.value(), "ek_test");
        assert_eq!(request.model, "rt-model");
        self.opens.fetch_add(1, Ordering::SeqCst);

        let (link, out_rx, in_tx) = TransportLink::in_memory();
        let first = if self.reject {
            TransportEvent::Closed(Some("rejected".to_string()))
        } else {
            TransportEvent::Open
        };
        in_tx.send(first).await.unwrap();
        *self.shutdown.lock().unwrap() = Some(link.shutdown.clone());
        *self.far.lock().unwrap() = Some((out_rx, in_tx));
        Ok(link)
    }
}

struct FailingTokens;

#[async_trait]
impl TokenProvider for FailingTokens {
    async fn fetch_token(&self) -> RealtimeResult<EphemeralToken> {
        Err(RealtimeError::AuthenticationFailed("issuer down".to_string()))
    }
}

#[derive(Default)]
struct RecordingUsage {
    heartbeats: AtomicUsize,
    reports: Mutex<Vec<Usage>>,
}

#[async_trait]
impl UsageSink for RecordingUsage {
    async fn heartbeat(&self, _session_id: &str) {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
    }

    async fn report_usage(&self, _session_id: &str, usage: &Usage) {
        self.reports.lock().unwrap().push(usage.clone());
    }
}

#[derive(Default)]
struct RecordingSink {
    frames: Mutex<Vec<Bytes>>,
    detached: AtomicBool,
}

impl AudioSink for RecordingSink {
    fn play(&self, pcm: Bytes) {
        self.frames.lock().unwrap().push(pcm);
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    session: RealtimeSession,
    transport: Arc<MockTransport>,
    outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<TransportEvent>,
}

impl Harness {
    async fn next_frame(&mut self) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("outbound channel closed");
        serde_json::from_str(&frame).unwrap()
    }

    async fn push(&self, frame: Value) {
        self.inbound
            .send(TransportEvent::Frame(frame.to_string()))
            .await
            .unwrap();
    }
}

fn options() -> SessionOptions {
    let mut options = SessionOptions::new(Url::parse("wss://rt.test/v1/realtime").unwrap(), "rt-model");
    options.capture_audio = false;
    options
}

async fn connect_with(
    options: SessionOptions,
    registry: ToolRegistry,
    usage: Option<Arc<RecordingUsage>>,
    sink: Option<Arc<RecordingSink>>,
) -> Harness {
    let transport = Arc::new(MockTransport::default());
    let mut builder = RealtimeSession::builder(options)
        .transport(transport.clone())
        .token_provider(Arc::new(StaticTokenProvider::new("ek_test")))
        .registry(registry);
    if let Some(usage) = usage {
        builder = builder.usage_sink(usage);
    }
    if let Some(sink) = sink {
        builder = builder.audio_sink(sink);
    }
    let session = builder.build().unwrap();

    session.connect().await.unwrap();
    let (outbound, inbound) = transport.take_far();
    let mut harness = Harness {
        session,
        transport,
        outbound,
        inbound,
    };

    // session snapshot and the agent's opening response
    assert_eq!(harness.next_frame().await["type"], "session.update");
    assert_eq!(harness.next_frame().await["type"], "response.create");
    harness
}

async fn connect() -> Harness {
    connect_with(options(), ToolRegistry::new(), None, None).await
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_connect_pushes_normalized_snapshot() {
    let mut options = options();
    options.agent.instructions = Some("Be brief".to_string());
    options.agent.tools = Some(vec![ToolDefinition {
        tool_type: String::new(),
        name: "http_quote".to_string(),
        description: None,
        parameters: None,
    }]);

    let transport = Arc::new(MockTransport::default());
    let session = RealtimeSession::builder(options)
        .transport(transport.clone())
        .token_provider(Arc::new(StaticTokenProvider::new("ek_test")))
        .build()
        .unwrap();
    let status = session.watch_status();
    assert_eq!(session.status(), SessionStatus::Disconnected);

    session.connect().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Connected);
    assert_eq!(*status.borrow(), SessionStatus::Connected);

    let (mut outbound, _inbound) = transport.take_far();
    let update: Value = serde_json::from_str(&outbound.recv().await.unwrap()).unwrap();
    assert_eq!(update["type"], "session.update");
    assert_eq!(update["session"]["instructions"], "Be brief");
    let tool = &update["session"]["tools"][0];
    assert_eq!(tool["type"], "function");
    assert_eq!(tool["parameters"], json!({"type": "object", "properties": {}}));

    // connecting again is a no-op
    session.connect().await.unwrap();
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_quiet_start_skips_initial_response() {
    let mut options = options();
    options.agent_speaks_first = false;
    let transport = Arc::new(MockTransport::default());
    let session = RealtimeSession::builder(options)
        .transport(transport.clone())
        .token_provider(Arc::new(StaticTokenProvider::new("ek_test")))
        .build()
        .unwrap();
    session.connect().await.unwrap();

    let (mut outbound, _inbound) = transport.take_far();
    let first: Value = serde_json::from_str(&outbound.recv().await.unwrap()).unwrap();
    assert_eq!(first["type"], "session.update");
    let nothing = tokio::time::timeout(Duration::from_millis(100), outbound.recv()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn test_disconnect_twice() {
    let sink = Arc::new(RecordingSink::default());
    let h = connect_with(options(), ToolRegistry::new(), None, Some(sink.clone())).await;
    h.push(json!({"type": "response.text.delta", "delta": "Hi"})).await;
    eventually(|| h.session.conversation().len() == 1).await;

    h.session.disconnect();
    h.session.disconnect();

    assert_eq!(h.session.status(), SessionStatus::Disconnected);
    assert!(h.session.conversation().is_empty());
    assert_eq!(h.session.volume(), 0.0);
    assert!(h.transport.is_closed());
    assert!(sink.detached.load(Ordering::SeqCst));
    assert!(matches!(
        h.session.send_text("hello").await,
        Err(RealtimeError::NotConnected)
    ));
}

#[tokio::test]
async fn test_token_failure_sets_error() {
    let transport = Arc::new(MockTransport::default());
    let session = RealtimeSession::builder(options())
        .transport(transport.clone())
        .token_provider(Arc::new(FailingTokens))
        .build()
        .unwrap();

    let errors = Arc::new(AtomicUsize::new(0));
    let counter = errors.clone();
    let on_error: RealtimeErrorCallback = Arc::new(move |_err| {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    });
    session.on_error(on_error);

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, RealtimeError::AuthenticationFailed(_)));
    assert_eq!(session.status(), SessionStatus::Error);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(transport.opens.load(Ordering::SeqCst), 0);

    session.disconnect();
    assert_eq!(session.status(), SessionStatus::Disconnected);
}

#[tokio::test]
async fn test_close_before_open_is_connect_failure() {
    let transport = Arc::new(MockTransport {
        reject: true,
        ..Default::default()
    });
    let session = RealtimeSession::builder(options())
        .transport(transport.clone())
        .token_provider(Arc::new(StaticTokenProvider::new("ek_test")))
        .build()
        .unwrap();

    let errors = Arc::new(AtomicUsize::new(0));
    let counter = errors.clone();
    let on_error: RealtimeErrorCallback = Arc::new(move |_err| {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    });
    session.on_error(on_error);

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, RealtimeError::ConnectionFailed(_)));
    assert_eq!(session.status(), SessionStatus::Error);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert!(transport.is_closed());

    // no frames were pushed on a channel that never opened
    let (mut outbound, _inbound) = transport.take_far();
    assert!(outbound.try_recv().is_err());
}

#[tokio::test]
async fn test_transport_failure_keeps_error_status() {
    let h = connect().await;
    h.inbound
        .send(TransportEvent::Failed("ice failed".to_string()))
        .await
        .unwrap();

    eventually(|| h.session.status() == SessionStatus::Error).await;
    assert!(h.transport.is_closed());
}

#[tokio::test]
async fn test_remote_close_disconnects() {
    let h = connect().await;
    h.inbound
        .send(TransportEvent::Closed(Some("bye".to_string())))
        .await
        .unwrap();
    eventually(|| h.session.status() == SessionStatus::Disconnected).await;
}

#[tokio::test]
async fn test_server_error_is_not_fatal() {
    let h = connect().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let on_error: RealtimeErrorCallback = Arc::new(move |err| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(err.to_string());
        })
    });
    h.session.on_error(on_error);

    h.push(json!({"type": "error", "error": {"type": "invalid_request_error", "message": "bad item"}}))
        .await;
    let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(message.contains("bad item"));
    assert_eq!(h.session.status(), SessionStatus::Connected);
}

// =============================================================================
// Conversation
// =============================================================================

#[tokio::test]
async fn test_user_transcript_reconciliation() {
    let h = connect().await;
    h.push(json!({"type": "input_audio_buffer.speech_started", "item_id": "u1"}))
        .await;
    h.push(json!({"type": "conversation.item.input_audio_transcription.delta", "item_id": "u1", "delta": "He"}))
        .await;
    h.push(json!({"type": "conversation.item.input_audio_transcription.delta", "item_id": "u1", "delta": "Hello"}))
        .await;
    h.push(json!({
        "type": "conversation.item.input_audio_transcription.completed",
        "item_id": "u1",
        "transcript": "Hello world"
    }))
    .await;

    eventually(|| h.session.conversation().iter().any(|i| i.is_final)).await;
    let items = h.session.conversation();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].role, Role::User);
    assert_eq!(items[0].text, "Hello world");
    assert_eq!(items[0].status, ItemStatus::Final);
}

#[tokio::test]
async fn test_assistant_deltas_finalize_in_place() {
    let h = connect().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let on_conversation: ConversationCallback = Arc::new(move |items| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(items);
        })
    });
    h.session.on_conversation(on_conversation);

    h.push(json!({"type": "response.audio_transcript.delta", "delta": "Hi"}))
        .await;
    h.push(json!({"type": "response.audio_transcript.delta", "delta": " there"}))
        .await;
    rx.recv().await.unwrap();
    let snapshot = rx.recv().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].text, "Hi there");
    assert!(!snapshot[0].is_final);

    h.push(json!({"type": "response.audio_transcript.done", "transcript": "Hi there"}))
        .await;
    let snapshot = rx.recv().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot[0].is_final);
    assert_eq!(snapshot[0].role, Role::Assistant);
}

#[tokio::test]
async fn test_malformed_and_unknown_frames_are_dropped() {
    let h = connect().await;
    h.inbound
        .send(TransportEvent::Frame("{not json".to_string()))
        .await
        .unwrap();
    h.push(json!({"type": "rate_limits.updated", "rate_limits": []}))
        .await;
    h.push(json!({"type": "response.text.delta", "delta": "still here"}))
        .await;

    eventually(|| h.session.conversation().len() == 1).await;
    assert_eq!(h.session.status(), SessionStatus::Connected);
}

#[tokio::test]
async fn test_send_text_records_final_user_item() {
    let mut h = connect().await;
    h.session.send_text("What time is it?").await.unwrap();

    let frame = h.next_frame().await;
    assert_eq!(frame["type"], "conversation.item.create");
    assert_eq!(frame["item"]["type"], "message");
    assert_eq!(frame["item"]["role"], "user");
    assert_eq!(frame["item"]["content"][0]["type"], "input_text");
    assert_eq!(frame["item"]["content"][0]["text"], "What time is it?");

    let items = h.session.conversation();
    assert_eq!(items.len(), 1);
    assert!(items[0].is_final);
}

// =============================================================================
// Function calls
// =============================================================================

fn echo_registry() -> ToolRegistry {
    let registry = ToolRegistry::new();
    let echo: ToolFn =
        Arc::new(|args: Value| Box::pin(async move { json!({"ok": true, "data": {"args": args}}) }));
    registry.register("http_quote", echo);
    registry
}

#[tokio::test]
async fn test_function_call_round_trip() {
    let mut h = connect_with(options(), echo_registry(), None, None).await;

    h.push(json!({
        "type": "response.output_item.added",
        "item": {"id": "item_1", "type": "function_call", "name": "http_quote", "call_id": "call_1"}
    }))
    .await;
    h.push(json!({
        "type": "response.function_call_arguments.done",
        "call_id": "call_1",
        "item_id": "item_1",
        "arguments": "{\"symbol\":\"ACME\"}"
    }))
    .await;

    let output = h.next_frame().await;
    assert_eq!(output["type"], "conversation.item.create");
    assert_eq!(output["item"]["type"], "function_call_output");
    assert_eq!(output["item"]["call_id"], "call_1");
    let result: Value = serde_json::from_str(output["item"]["output"].as_str().unwrap()).unwrap();
    assert_eq!(result["data"]["args"], json!({"symbol": "ACME"}));

    assert_eq!(h.next_frame().await["type"], "response.create");

    eventually(|| h.session.conversation().iter().any(|i| i.role == Role::Tool)).await;
}

#[tokio::test]
async fn test_malformed_arguments_become_empty_object() {
    let mut h = connect_with(options(), echo_registry(), None, None).await;
    h.push(json!({
        "type": "response.function_call_arguments.done",
        "call_id": "call_2",
        "name": "http_quote",
        "arguments": "{oops"
    }))
    .await;

    let output = h.next_frame().await;
    let result: Value = serde_json::from_str(output["item"]["output"].as_str().unwrap()).unwrap();
    assert_eq!(result["data"]["args"], json!({}));
}

#[tokio::test]
async fn test_unknown_function() {
    let mut h = connect().await;
    h.push(json!({
        "type": "response.function_call_arguments.done",
        "call_id": "call_3",
        "name": "http_missing",
        "arguments": "{}"
    }))
    .await;

    let output = h.next_frame().await;
    assert_eq!(output["item"]["call_id"], "call_3");
    let result: Value = serde_json::from_str(output["item"]["output"].as_str().unwrap()).unwrap();
    assert_eq!(result, json!({"ok": false, "error": "unknown_function"}));
    assert_eq!(h.next_frame().await["type"], "response.create");
}

#[tokio::test]
async fn test_unregistered_tool_is_unknown_afterwards() {
    let registry = echo_registry();
    let mut h = connect_with(options(), registry.clone(), None, None).await;
    registry.unregister_by_prefix("http_", &[]);
    assert!(!h.session.registry().has_function("http_quote"));

    h.push(json!({
        "type": "response.function_call_arguments.done",
        "call_id": "call_4",
        "name": "http_quote",
        "arguments": "{}"
    }))
    .await;
    let output = h.next_frame().await;
    let result: Value = serde_json::from_str(output["item"]["output"].as_str().unwrap()).unwrap();
    assert_eq!(result["error"], "unknown_function");
}

#[tokio::test]
async fn test_force_function_call() {
    let mut h = connect().await;
    h.session
        .force_function_call("http_quote", json!({"symbol": "ACME"}))
        .await
        .unwrap();

    let message = h.next_frame().await;
    assert_eq!(message["type"], "conversation.item.create");
    let text = message["item"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("http_quote"));
    assert!(text.contains(r#"{"symbol":"ACME"}"#));

    let response = h.next_frame().await;
    assert_eq!(response["type"], "response.create");
    assert_eq!(
        response["response"]["tool_choice"],
        json!({"type": "function", "name": "http_quote"})
    );
}

// =============================================================================
// Controls
// =============================================================================

#[tokio::test]
async fn test_push_to_talk_order() {
    let mut h = connect().await;

    h.session.ptt_down().await.unwrap();
    assert_eq!(h.next_frame().await["type"], "response.cancel");
    assert_eq!(h.next_frame().await["type"], "input_audio_buffer.clear");

    h.session.ptt_up().await.unwrap();
    assert_eq!(h.next_frame().await["type"], "input_audio_buffer.commit");
    assert_eq!(h.next_frame().await["type"], "response.create");
}

#[tokio::test]
async fn test_truncate_and_cancel() {
    let mut h = connect().await;
    h.session.truncate("item_9", 1500).await.unwrap();
    let frame = h.next_frame().await;
    assert_eq!(
        frame,
        json!({
            "type": "conversation.item.truncate",
            "item_id": "item_9",
            "content_index": 0,
            "audio_end_ms": 1500
        })
    );

    h.session.cancel_response().await.unwrap();
    assert_eq!(h.next_frame().await["type"], "response.cancel");
}

#[tokio::test]
async fn test_update_session_merges_snapshot() {
    let mut h = connect().await;
    h.session
        .update_session(SessionConfig {
            voice: Some("verse".to_string()),
            tools: Some(vec![ToolDefinition::function("http_quote", None, None)]),
            ..Default::default()
        })
        .await
        .unwrap();

    let frame = h.next_frame().await;
    assert_eq!(frame["type"], "session.update");
    assert_eq!(frame["session"]["voice"], "verse");
    assert_eq!(frame["session"]["tools"][0]["parameters"]["type"], "object");
    assert_eq!(h.session.agent().voice.as_deref(), Some("verse"));
}

// =============================================================================
// Usage and media
// =============================================================================

#[tokio::test]
async fn test_usage_reported_on_response_done() {
    let usage = Arc::new(RecordingUsage::default());
    let h = connect_with(options(), ToolRegistry::new(), Some(usage.clone()), None).await;

    h.push(json!({
        "type": "response.done",
        "response": {"id": "resp_1", "status": "completed", "usage": {"total_tokens": 42, "input_tokens": 30, "output_tokens": 12}}
    }))
    .await;

    eventually(|| !usage.reports.lock().unwrap().is_empty()).await;
    assert_eq!(usage.reports.lock().unwrap()[0].total_tokens, 42);
}

#[tokio::test]
async fn test_heartbeat_while_connected() {
    let usage = Arc::new(RecordingUsage::default());
    let mut options = options();
    options.heartbeat_interval = Duration::from_millis(20);
    let h = connect_with(options, ToolRegistry::new(), Some(usage.clone()), None).await;

    eventually(|| usage.heartbeats.load(Ordering::SeqCst) >= 2).await;

    h.session.disconnect();
    let after = usage.heartbeats.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(usage.heartbeats.load(Ordering::SeqCst), after);
}

#[tokio::test]
async fn test_audio_delta_reaches_sink() {
    let sink = Arc::new(RecordingSink::default());
    let h = connect_with(options(), ToolRegistry::new(), None, Some(sink.clone())).await;

    // two samples of 0x4000 little-endian, base64 encoded
    h.push(json!({"type": "response.audio.delta", "delta": "AEAAQA=="}))
        .await;

    eventually(|| !sink.frames.lock().unwrap().is_empty()).await;
    assert_eq!(sink.frames.lock().unwrap()[0].as_ref(), &[0x00, 0x40, 0x00, 0x40]);
}
