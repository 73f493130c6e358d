//! Templated HTTP tool execution.
//!
//! [`HttpToolExecutor`] turns a validated [`HttpToolDescriptor`] plus model
//! arguments into exactly one network call, and always answers with a
//! uniform outcome value:
//!
//! ```json
//! {"ok": true, "status": 200, "data": {...}}
//! {"ok": false, "status": 0, "error": "timeout", "message": "..."}
//! ```
//!
//! Pipeline for one call:
//! 1. resolve URL, headers and body against `{args, secrets}`; any token
//!    left unresolved fails the call before any network activity
//! 2. validate the final URL (scheme, private hosts, internal names)
//! 3. send through the configured [`ToolEgress`] under a timeout, racing a
//!    cancellation token
//! 4. decide success from `okField` (when set) or the HTTP status
//! 5. resolve the matching UI block against `{args, response, status}` and
//!    hand it to the [`UiHook`]

pub mod adapter;
pub mod egress;
pub mod ui;

pub use adapter::{install_tenant_tools, tool_definition, tool_function};
pub use egress::{DirectEgress, EgressResponse, PreparedRequest, ProxyEgress, ToolEgress};
pub use ui::{ChannelUiHook, UiEvent, UiHook};

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::descriptor::{HttpToolDescriptor, UiBlock};
use crate::core::template::{
    NoSecrets, SecretResolver, TemplateContext, apply_template, apply_template_strict,
    find_unresolved, is_truthy, resolve_strict, split_path,
};
use crate::utils::url_validation::{UrlPolicy, UrlValidationError, validate_tool_url};

/// Value substituted for secrets when the egress resolves them remotely.
const REDACTED_SECRET: &str = "redacted";

// =============================================================================
// Errors and outcomes
// =============================================================================

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unresolved template tokens: {}", .0.join(", "))]
    UnresolvedTemplate(Vec<String>),

    #[error("Blocked URL: {0}")]
    Blocked(#[from] UrlValidationError),

    #[error("Tool call timed out after {0}ms")]
    Timeout(u64),

    #[error("Tool call cancelled")]
    Cancelled,

    #[error("Network error: {0}")]
    Network(String),
}

impl ToolError {
    /// Stable code reported in the outcome's `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::UnresolvedTemplate(_) => "unresolved_template",
            ToolError::Blocked(_) => "blocked_url",
            ToolError::Timeout(_) => "timeout",
            ToolError::Cancelled => "cancelled",
            ToolError::Network(_) => "network_error",
        }
    }
}

/// Uniform result of a tool call, returned to the model as function output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ToolOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            status: None,
            data: None,
            error: Some(error.into()),
            message: None,
        }
    }

    fn from_error(err: &ToolError) -> Self {
        Self {
            ok: false,
            status: Some(0),
            data: None,
            error: Some(err.code().to_string()),
            message: Some(err.to_string()),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({"ok": false}))
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Executes HTTP tools for one tenant.
#[derive(Clone)]
pub struct HttpToolExecutor {
    egress: Arc<dyn ToolEgress>,
    secrets: Arc<dyn SecretResolver>,
    tenant_id: String,
    ui: Option<Arc<dyn UiHook>>,
    policy: UrlPolicy,
    default_timeout: Option<Duration>,
}

impl HttpToolExecutor {
    pub fn new(egress: Arc<dyn ToolEgress>) -> Self {
        Self {
            egress,
            secrets: Arc::new(NoSecrets),
            tenant_id: String::new(),
            ui: None,
            policy: UrlPolicy::default(),
            default_timeout: None,
        }
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretResolver>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_ui_hook(mut self, hook: Arc<dyn UiHook>) -> Self {
        self.ui = Some(hook);
        self
    }

    pub fn with_url_policy(mut self, policy: UrlPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Timeout for descriptors that do not set `timeoutMs`.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Run one tool call.
    pub async fn execute(&self, descriptor: &HttpToolDescriptor, args: Value) -> Value {
        self.execute_with_cancel(descriptor, args, CancellationToken::new())
            .await
    }

    /// Run one tool call, aborting when `cancel` fires.
    pub async fn execute_with_cancel(
        &self,
        descriptor: &HttpToolDescriptor,
        args: Value,
        cancel: CancellationToken,
    ) -> Value {
        let started = Instant::now();
        self.emit_loading(descriptor, &args);

        let result = match self.prepare(descriptor, &args) {
            Ok(request) => self.send(&request, &cancel).await,
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(response) => {
                let ok = self.is_ok(descriptor, &response);
                self.emit_result(descriptor, &args, &response.body, response.status, ok);
                ToolOutcome {
                    ok,
                    status: Some(response.status),
                    error: if ok {
                        None
                    } else if response.is_success() {
                        Some("not_ok".to_string())
                    } else {
                        Some(format!("http_{}", response.status))
                    },
                    data: Some(response.body),
                    message: None,
                }
            }
            Err(e) => {
                warn!(tool = %descriptor.name, error = %e, "Tool call failed");
                self.emit_result(descriptor, &args, &Value::Null, 0, false);
                ToolOutcome::from_error(&e)
            }
        };

        info!(
            tool = %descriptor.name,
            ok = outcome.ok,
            status = outcome.status.unwrap_or(0),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Tool call finished"
        );
        outcome.to_value()
    }

    /// Build and validate the outbound request without sending it.
    pub fn prepare(
        &self,
        descriptor: &HttpToolDescriptor,
        args: &Value,
    ) -> Result<PreparedRequest, ToolError> {
        let redacted = RedactedSecrets;
        let resolver: &dyn SecretResolver = if self.egress.resolves_secrets() {
            &redacted
        } else {
            self.secrets.as_ref()
        };
        let ctx = TemplateContext::request(args, resolver, &self.tenant_id);

        let mut unresolved = Vec::new();

        let url = resolve_strict(&descriptor.http.url_template, &ctx);
        unresolved.extend(url.unresolved);
        let url = match url.value {
            Value::String(s) => s,
            other => other.to_string(),
        };

        let mut headers = Vec::with_capacity(descriptor.http.headers.len());
        for (key, template) in &descriptor.http.headers {
            let resolved = resolve_strict(template, &ctx);
            unresolved.extend(resolved.unresolved);
            let value = match resolved.value {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            headers.push((key.clone(), value));
        }

        let body = descriptor.http.json_body_template.as_ref().map(|template| {
            let resolved = apply_template_strict(template, &ctx);
            unresolved.extend(resolved.unresolved);
            resolved.value
        });

        unresolved.extend(find_unresolved(&Value::String(url.clone())));
        for (_, value) in &headers {
            unresolved.extend(find_unresolved(&Value::String(value.clone())));
        }
        if let Some(body) = &body {
            unresolved.extend(find_unresolved(body));
        }
        if !unresolved.is_empty() {
            unresolved.sort();
            unresolved.dedup();
            return Err(ToolError::UnresolvedTemplate(unresolved));
        }

        let url = validate_tool_url(&url, &self.policy)?;

        let timeout = match (descriptor.http.timeout_ms, self.default_timeout) {
            (None, Some(default)) => default,
            _ => descriptor.timeout(),
        };

        Ok(PreparedRequest {
            tool: descriptor.name.clone(),
            method: descriptor.http.method,
            url,
            headers,
            body,
            timeout,
            descriptor: descriptor.clone(),
            args: args.clone(),
        })
    }

    async fn send(
        &self,
        request: &PreparedRequest,
        cancel: &CancellationToken,
    ) -> Result<EgressResponse, ToolError> {
        debug!(
            tool = %request.tool,
            egress = self.egress.name(),
            timeout_ms = request.timeout.as_millis() as u64,
            "Dispatching tool call"
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
            result = tokio::time::timeout(request.timeout, self.egress.send(request)) => {
                match result {
                    Ok(response) => response,
                    Err(_) => Err(ToolError::Timeout(request.timeout.as_millis() as u64)),
                }
            }
        }
    }

    fn is_ok(&self, descriptor: &HttpToolDescriptor, response: &EgressResponse) -> bool {
        match &descriptor.http.ok_field {
            Some(field) => split_path(field)
                .and_then(|segments| {
                    segments
                        .iter()
                        .try_fold(&response.body, |current, segment| match current {
                            Value::Object(map) => map.get(segment),
                            Value::Array(items) => items.get(segment.parse::<usize>().ok()?),
                            _ => None,
                        })
                })
                .map(is_truthy)
                .unwrap_or(false),
            None => response.is_success(),
        }
    }

    fn emit_loading(&self, descriptor: &HttpToolDescriptor, args: &Value) {
        let Some(hook) = &self.ui else {
            return;
        };
        let Some(message) = descriptor
            .ui
            .as_ref()
            .and_then(|ui| ui.loading_message.as_ref())
        else {
            return;
        };

        let ctx = TemplateContext::ui(args, &Value::Null, 0);
        let message = match apply_template(&Value::String(message.clone()), &ctx) {
            Value::String(s) => s,
            other => other.to_string(),
        };
        hook.on_ui_event(UiEvent::Loading {
            tool: descriptor.name.clone(),
            message,
        });
    }

    fn emit_result(
        &self,
        descriptor: &HttpToolDescriptor,
        args: &Value,
        response: &Value,
        status: u16,
        ok: bool,
    ) {
        let Some(hook) = &self.ui else {
            return;
        };
        let Some(template) = select_ui_block(descriptor, response, ok) else {
            return;
        };

        let ctx = TemplateContext::ui(args, response, status);
        let resolved = apply_template(&template, &ctx);
        match serde_json::from_value::<UiBlock>(resolved) {
            Ok(block) if !block.is_empty() => hook.on_ui_event(UiEvent::Result {
                tool: descriptor.name.clone(),
                ok,
                block,
            }),
            Ok(_) => {}
            Err(e) => debug!(tool = %descriptor.name, error = %e, "Ignoring malformed UI block"),
        }
    }
}

/// Pick the UI block for an outcome. A `ui` object embedded in the response
/// wins over the descriptor's blocks.
fn select_ui_block(descriptor: &HttpToolDescriptor, response: &Value, ok: bool) -> Option<Value> {
    let key = if ok { "onSuccess" } else { "onError" };

    if let Some(embedded) = response.get("ui").filter(|v| v.is_object()) {
        if embedded.get("onSuccess").is_some() || embedded.get("onError").is_some() {
            if let Some(block) = embedded.get(key) {
                return Some(block.clone());
            }
        } else {
            return Some(embedded.clone());
        }
    }

    let ui = descriptor.ui.as_ref()?;
    if ok {
        ui.on_success.clone()
    } else {
        ui.on_error.clone()
    }
}

struct RedactedSecrets;

impl SecretResolver for RedactedSecrets {
    fn resolve_secret(&self, _path: &str, _tenant_id: &str) -> Option<String> {
        Some(REDACTED_SECRET.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor::ToolDescriptor;
    use crate::core::template::StaticSecrets;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Records prepared requests and replies with a canned response.
    struct FakeEgress {
        reply: EgressResponse,
        delay: Duration,
        seen: Mutex<Vec<PreparedRequest>>,
        remote_secrets: bool,
    }

    impl FakeEgress {
        fn replying(status: u16, body: Value) -> Arc<Self> {
            Arc::new(Self {
                reply: EgressResponse { status, body },
                delay: Duration::ZERO,
                seen: Mutex::new(Vec::new()),
                remote_secrets: false,
            })
        }
    }

    #[async_trait]
    impl ToolEgress for FakeEgress {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn resolves_secrets(&self) -> bool {
            self.remote_secrets
        }

        async fn send(&self, request: &PreparedRequest) -> Result<EgressResponse, ToolError> {
            self.seen.lock().push(request.clone());
            tokio::time::sleep(self.delay).await;
            Ok(self.reply.clone())
        }
    }

    fn descriptor(value: Value) -> HttpToolDescriptor {
        let ToolDescriptor::Http(d) = serde_json::from_value(value).unwrap();
        d
    }

    fn quote_tool() -> HttpToolDescriptor {
        descriptor(json!({
            "kind": "http_tool",
            "name": "quote",
            "http": {
                "method": "POST",
                "urlTemplate": "https://api.example.com/quotes/{{args.sku | upper}}",
                "headers": {"Authorization": "Bearer {{secrets.api_key}}"},
                "jsonBodyTemplate": {"qty": "{{args.qty | int}}", "note": "for {args.who}"}
            },
            "ui": {
                "loadingMessage": "Pricing {{args.sku}}",
                "onSuccess": {"showComponent": {"name": "Quote", "props": {"price": "{{response.price}}"}}},
                "onError": {"speak": "Quote failed with status {{status}}"}
            }
        }))
    }

    #[tokio::test]
    async fn test_prepare_builds_request() {
        let egress = FakeEgress::replying(200, json!({}));
        let executor = HttpToolExecutor::new(egress)
            .with_secrets(Arc::new(StaticSecrets::new(json!({"api_key": "k-123"}))))
            .with_tenant("acme");

        let request = executor
            .prepare(&quote_tool(), &json!({"sku": "ab1", "qty": "3", "who": "Ann"}))
            .unwrap();

        assert_eq!(request.url.as_str(), "https://api.example.com/quotes/AB1");
        assert_eq!(
            request.headers,
            vec![("Authorization".to_string(), "Bearer k-123".to_string())]
        );
        assert_eq!(request.body, Some(json!({"qty": 3, "note": "for Ann"})));
        assert_eq!(request.timeout, Duration::from_millis(15_000));
    }

    #[tokio::test]
    async fn test_success_outcome_and_ui() {
        let egress = FakeEgress::replying(200, json!({"price": 9.5}));
        let (hook, mut rx) = ChannelUiHook::new();
        let executor = HttpToolExecutor::new(egress.clone())
            .with_secrets(Arc::new(StaticSecrets::new(json!({"api_key": "k"}))))
            .with_ui_hook(Arc::new(hook));

        let out = executor
            .execute(&quote_tool(), json!({"sku": "x", "qty": 1, "who": "B"}))
            .await;
        assert_eq!(out, json!({"ok": true, "status": 200, "data": {"price": 9.5}}));
        assert_eq!(egress.seen.lock().len(), 1);

        assert_eq!(
            rx.recv().await.unwrap(),
            UiEvent::Loading {
                tool: "quote".into(),
                message: "Pricing x".into()
            }
        );
        match rx.recv().await.unwrap() {
            UiEvent::Result { ok, block, .. } => {
                assert!(ok);
                let show = block.show_component.unwrap();
                assert_eq!(show.name, "Quote");
                assert_eq!(show.props, json!({"price": 9.5}));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unresolved_tokens_fail_before_network() {
        let egress = FakeEgress::replying(200, json!({}));
        let executor = HttpToolExecutor::new(egress.clone());

        let out = executor.execute(&quote_tool(), json!({"qty": 1})).await;
        assert_eq!(out["ok"], json!(false));
        assert_eq!(out["error"], json!("unresolved_template"));
        assert!(egress.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_private_url_rejected_before_network() {
        let egress = FakeEgress::replying(200, json!({}));
        let executor = HttpToolExecutor::new(egress.clone());
        let tool = descriptor(json!({
            "kind": "http_tool",
            "name": "internal",
            "http": {"method": "GET", "urlTemplate": "http://{{args.host}}/admin"}
        }));

        let out = executor.execute(&tool, json!({"host": "127.0.0.1"})).await;
        assert_eq!(out["error"], json!("blocked_url"));
        assert!(egress.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_ok_field_overrides_status() {
        let tool = descriptor(json!({
            "kind": "http_tool",
            "name": "check",
            "http": {"urlTemplate": "https://api.example.com/c", "okField": "result.ok"}
        }));

        let executor = HttpToolExecutor::new(FakeEgress::replying(200, json!({"result": {"ok": false}})));
        let out = executor.execute(&tool, json!({})).await;
        assert_eq!(out["ok"], json!(false));
        assert_eq!(out["error"], json!("not_ok"));

        let executor = HttpToolExecutor::new(FakeEgress::replying(500, json!({"result": {"ok": "yes"}})));
        let out = executor.execute(&tool, json!({})).await;
        assert_eq!(out["ok"], json!(true));
    }

    #[tokio::test]
    async fn test_non_2xx_is_failure_with_error_block() {
        let egress = FakeEgress::replying(503, json!("upstream down"));
        let (hook, mut rx) = ChannelUiHook::new();
        let executor = HttpToolExecutor::new(egress)
            .with_secrets(Arc::new(StaticSecrets::new(json!({"api_key": "k"}))))
            .with_ui_hook(Arc::new(hook));

        let out = executor
            .execute(&quote_tool(), json!({"sku": "x", "qty": 1, "who": "B"}))
            .await;
        assert_eq!(out["ok"], json!(false));
        assert_eq!(out["status"], json!(503));
        assert_eq!(out["error"], json!("http_503"));

        let _loading = rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            UiEvent::Result { ok, block, .. } => {
                assert!(!ok);
                assert_eq!(block.speak.as_deref(), Some("Quote failed with status 503"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_response_ui_block_wins() {
        let egress = FakeEgress::replying(
            200,
            json!({"ui": {"speak": "Done for {{args.who}}"}, "price": 1}),
        );
        let (hook, mut rx) = ChannelUiHook::new();
        let executor = HttpToolExecutor::new(egress)
            .with_secrets(Arc::new(StaticSecrets::new(json!({"api_key": "k"}))))
            .with_ui_hook(Arc::new(hook));

        executor
            .execute(&quote_tool(), json!({"sku": "x", "qty": 1, "who": "Bo"}))
            .await;
        let _loading = rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            UiEvent::Result { block, .. } => {
                assert_eq!(block.speak.as_deref(), Some("Done for Bo"));
                assert!(block.show_component.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let egress = Arc::new(FakeEgress {
            reply: EgressResponse {
                status: 200,
                body: json!({}),
            },
            delay: Duration::from_secs(60),
            seen: Mutex::new(Vec::new()),
            remote_secrets: false,
        });
        let tool = descriptor(json!({
            "kind": "http_tool",
            "name": "slow",
            "http": {"urlTemplate": "https://api.example.com/slow", "timeoutMs": 50}
        }));

        let out = HttpToolExecutor::new(egress).execute(&tool, json!({})).await;
        assert_eq!(out["error"], json!("timeout"));
        assert_eq!(out["status"], json!(0));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let egress = Arc::new(FakeEgress {
            reply: EgressResponse {
                status: 200,
                body: json!({}),
            },
            delay: Duration::from_secs(60),
            seen: Mutex::new(Vec::new()),
            remote_secrets: false,
        });
        let tool = descriptor(json!({
            "kind": "http_tool",
            "name": "slow",
            "http": {"urlTemplate": "https://api.example.com/slow"}
        }));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let out = HttpToolExecutor::new(egress)
            .execute_with_cancel(&tool, json!({}), cancel)
            .await;
        assert_eq!(out["error"], json!("cancelled"));
    }

    #[tokio::test]
    async fn test_remote_secrets_are_redacted_locally() {
        let egress = Arc::new(FakeEgress {
            reply: EgressResponse {
                status: 200,
                body: json!({}),
            },
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
            remote_secrets: true,
        });
        let executor = HttpToolExecutor::new(egress.clone());

        let out = executor
            .execute(&quote_tool(), json!({"sku": "x", "qty": 1, "who": "B"}))
            .await;
        assert_eq!(out["ok"], json!(true));
        let seen = egress.seen.lock();
        assert_eq!(seen[0].headers[0].1, "Bearer redacted");
        assert_eq!(seen[0].args, json!({"sku": "x", "qty": 1, "who": "B"}));
    }

    #[test]
    fn test_default_timeout_override() {
        let executor = HttpToolExecutor::new(FakeEgress::replying(200, json!({})))
            .with_default_timeout(Duration::from_secs(3));
        let tool = descriptor(json!({
            "kind": "http_tool",
            "name": "t",
            "http": {"urlTemplate": "https://api.example.com/"}
        }));
        let request = executor.prepare(&tool, &json!({})).unwrap();
        assert_eq!(request.timeout, Duration::from_secs(3));
    }
}
