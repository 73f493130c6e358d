//! Network egress for tool calls.
//!
//! The executor never talks to the network directly. It hands a fully
//! validated [`PreparedRequest`] to a [`ToolEgress`]:
//! - [`ProxyEgress`] posts `{descriptor, args}` to the single trusted tool
//!   proxy, which holds tenant secrets and performs the upstream call
//! - [`DirectEgress`] sends the prepared request itself (server-side use)

use async_trait::async_trait;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::ToolError;
use crate::core::descriptor::{HttpMethod, HttpToolDescriptor};
use crate::utils::url_validation::{HostResolver, SystemResolver, UrlPolicy, check_resolved_host};

/// A tool request after templating and URL validation.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub tool: String,
    pub method: HttpMethod,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
    /// Descriptor and raw arguments, for egresses that re-resolve remotely
    pub descriptor: HttpToolDescriptor,
    pub args: Value,
}

/// Upstream reply: status plus JSON body (or the raw text as a JSON string).
#[derive(Debug, Clone, PartialEq)]
pub struct EgressResponse {
    pub status: u16,
    pub body: Value,
}

impl EgressResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait ToolEgress: Send + Sync {
    /// Identifier used in logs
    fn name(&self) -> &'static str;

    /// Whether this egress resolves `secrets.*` itself.
    ///
    /// When true the executor never asks its own resolver for secret values.
    fn resolves_secrets(&self) -> bool {
        false
    }

    async fn send(&self, request: &PreparedRequest) -> Result<EgressResponse, ToolError>;
}

fn client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder().redirect(reqwest::redirect::Policy::none())
}

fn build_client() -> Result<reqwest::Client, ToolError> {
    finish(client_builder())
}

fn finish(builder: reqwest::ClientBuilder) -> Result<reqwest::Client, ToolError> {
    builder
        .build()
        .map_err(|e| ToolError::Network(format!("failed to build HTTP client: {}", e)))
}

async fn read_body(response: reqwest::Response) -> Result<EgressResponse, ToolError> {
    let status = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|e| ToolError::Network(format!("failed to read response: {}", e)))?;
    let body = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    };
    Ok(EgressResponse { status, body })
}

// =============================================================================
// Proxy
// =============================================================================

/// Sends every call through the trusted tool proxy.
pub struct ProxyEgress {
    endpoint: Url,
    bearer: Option<String>,
    tenant_id: Option<String>,
    client: reqwest::Client,
}

impl ProxyEgress {
    pub fn new(endpoint: Url) -> Result<Self, ToolError> {
        Ok(Self {
            endpoint,
            bearer: None,
            tenant_id: None,
            client: build_client()?,
        })
    }

    /// Authenticate against the proxy
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    /// Sent as `X-Tenant-Id`
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl ToolEgress for ProxyEgress {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn resolves_secrets(&self) -> bool {
        true
    }

    async fn send(&self, request: &PreparedRequest) -> Result<EgressResponse, ToolError> {
        debug!(
            tool = %request.tool,
            proxy = %self.endpoint,
            "Sending tool call through proxy"
        );

        let payload = json!({
            "descriptor": request.descriptor.to_value(),
            "args": request.args,
        });

        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .timeout(request.timeout)
            .json(&payload);
        if let Some(token) = &self.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(tenant) = &self.tenant_id {
            builder = builder.header("X-Tenant-Id", tenant);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ToolError::Network(e.to_string()))?;
        read_body(response).await
    }
}

// =============================================================================
// Direct
// =============================================================================

/// Sends the prepared request straight to the tool's URL.
///
/// Hostnames are resolved and re-checked against the URL policy before the
/// connection is made, and the connection is pinned to the checked
/// addresses. Redirects are never followed.
pub struct DirectEgress {
    policy: UrlPolicy,
    resolver: Arc<dyn HostResolver>,
    client: reqwest::Client,
}

impl DirectEgress {
    pub fn new(policy: UrlPolicy) -> Result<Self, ToolError> {
        Ok(Self {
            policy,
            resolver: Arc::new(SystemResolver),
            client: build_client()?,
        })
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Client whose lookups for the request host return only `pinned`.
    fn client_for(&self, url: &Url, pinned: &[SocketAddr]) -> Result<reqwest::Client, ToolError> {
        match url.host_str() {
            Some(host) if !pinned.is_empty() => {
                finish(client_builder().resolve_to_addrs(host, pinned))
            }
            _ => Ok(self.client.clone()),
        }
    }
}

#[async_trait]
impl ToolEgress for DirectEgress {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn send(&self, request: &PreparedRequest) -> Result<EgressResponse, ToolError> {
        let pinned = check_resolved_host(&request.url, &self.policy, self.resolver.as_ref()).await?;
        let client = self.client_for(&request.url, &pinned)?;

        debug!(
            tool = %request.tool,
            method = request.method.as_str(),
            host = request.url.host_str().unwrap_or_default(),
            "Sending tool call"
        );

        let mut builder = client
            .request(request.method.into(), request.url.clone())
            .timeout(request.timeout);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if request.method.has_body()
            && let Some(body) = &request.body
        {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ToolError::Network(e.to_string()))?;
        read_body(response).await
    }
}
