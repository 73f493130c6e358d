//! Tenant-authored HTTP tool descriptors.
//!
//! Descriptors arrive from storage as loosely-typed JSON. They are linted and
//! converted into the tagged [`ToolDescriptor`] model exactly once, at
//! ingest; everything downstream (executor, registry adapter, session tool
//! definitions) works with the typed form only.
//!
//! # Persisted shape
//!
//! ```json
//! {
//!   "kind": "http_tool",
//!   "name": "quote",
//!   "description": "Get a price quote",
//!   "parameters": {"type": "object", "properties": {"sku": {"type": "string"}}},
//!   "http": {
//!     "method": "POST",
//!     "urlTemplate": "https://api.example.com/quotes/{{args.sku}}",
//!     "headers": {"Authorization": "Bearer {{secrets.quote_api_key}}"},
//!     "jsonBodyTemplate": {"qty": "{{args.qty | int}}"},
//!     "okField": "ok",
//!     "timeoutMs": 8000
//!   },
//!   "ui": {
//!     "loadingMessage": "Fetching quote...",
//!     "onSuccess": {"showComponent": {"name": "QuoteCard", "props": {"price": "{{response.price}}"}}},
//!     "onError": {"speak": "The quote service returned {{status}}."}
//!   },
//!   "enabled": true,
//!   "priority": 10
//! }
//! ```

mod lint;

pub use lint::{LintIssue, LintResult, Severity, lint, lint_one};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default per-call timeout when a descriptor does not set `timeoutMs`.
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 15_000;

/// Largest accepted `timeoutMs`.
pub const MAX_TOOL_TIMEOUT_MS: u64 = 120_000;

/// Errors loading descriptor files.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("Failed to read descriptor file '{path}': {error}")]
    ReadError { path: String, error: String },

    #[error("Failed to parse descriptor file '{path}': {error}")]
    ParseError { path: String, error: String },

    #[error("Descriptor file '{0}' must contain a list of tools or an object with a `tools` list")]
    InvalidLayout(String),
}

// =============================================================================
// Typed model
// =============================================================================

/// A validated tool descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ToolDescriptor {
    #[serde(rename = "http_tool")]
    Http(HttpToolDescriptor),
}

impl ToolDescriptor {
    pub fn name(&self) -> &str {
        match self {
            ToolDescriptor::Http(d) => &d.name,
        }
    }
}

/// HTTP-backed tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_parameters")]
    pub parameters: Value,
    pub http: HttpSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<UiSpec>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: f64,
}

impl HttpToolDescriptor {
    /// Effective timeout for one call.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(
            self.http
                .timeout_ms
                .unwrap_or(DEFAULT_TOOL_TIMEOUT_MS)
                .min(MAX_TOOL_TIMEOUT_MS),
        )
    }

    /// Serialize back to the persisted (tagged) shape.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(ToolDescriptor::Http(self.clone())).unwrap_or(Value::Null)
    }
}

/// Request templates for an HTTP tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpSpec {
    #[serde(default)]
    pub method: HttpMethod,
    pub url_template: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_body_template: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// HTTP methods a tool may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[serde(alias = "get")]
    Get,
    #[default]
    #[serde(alias = "post")]
    Post,
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "patch")]
    Patch,
    #[serde(alias = "delete")]
    Delete,
}

impl HttpMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "PATCH" => Some(HttpMethod::Patch),
            "DELETE" => Some(HttpMethod::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Whether a JSON body is sent with this method.
    pub fn has_body(&self) -> bool {
        !matches!(self, HttpMethod::Get | HttpMethod::Delete)
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// UI side effects declared by a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loading_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<Value>,
}

/// A resolved UI block: show a component, speak a line, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_component: Option<ShowComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speak: Option<String>,
}

impl UiBlock {
    pub fn is_empty(&self) -> bool {
        self.show_component.is_none() && self.speak.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowComponent {
    pub name: String,
    #[serde(default)]
    pub props: Value,
}

fn default_parameters() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

fn default_enabled() -> bool {
    true
}

// =============================================================================
// Ingest
// =============================================================================

/// Result of validating a batch of stored descriptors.
#[derive(Debug, Clone, Default)]
pub struct Ingested {
    /// Enabled tools without error-severity issues, highest priority first
    pub tools: Vec<HttpToolDescriptor>,
    /// One lint result per input descriptor, in input order
    pub results: Vec<LintResult>,
}

impl Ingested {
    /// Lint results that carry at least one error.
    pub fn rejected(&self) -> impl Iterator<Item = &LintResult> {
        self.results.iter().filter(|r| r.has_errors())
    }
}

/// Lint and convert stored descriptors.
///
/// Descriptors with errors are excluded; warnings never block a tool.
pub fn ingest(values: &[Value]) -> Ingested {
    let mut results = lint(values);
    let mut tools = Vec::new();

    for (value, result) in values.iter().zip(results.iter_mut()) {
        if result.has_errors() {
            warn!(
                tool = result.name.as_deref().unwrap_or("<unnamed>"),
                errors = result.errors().count(),
                "Rejecting tool descriptor"
            );
            continue;
        }

        match serde_json::from_value::<ToolDescriptor>(value.clone()) {
            Ok(ToolDescriptor::Http(descriptor)) => {
                if descriptor.enabled {
                    debug!(tool = %descriptor.name, "Accepted tool descriptor");
                    tools.push(descriptor);
                }
            }
            Err(e) => {
                result.issues.push(LintIssue::error(
                    "schema",
                    "",
                    format!("descriptor does not match the tool schema: {}", e),
                ));
            }
        }
    }

    tools.sort_by(|a, b| {
        b.priority
            .total_cmp(&a.priority)
            .then_with(|| a.name.cmp(&b.name))
    });

    info!(
        accepted = tools.len(),
        total = values.len(),
        "Ingested tool descriptors"
    );

    Ingested { tools, results }
}

/// Load raw descriptors from a `.json`, `.yaml` or `.yml` file.
///
/// The file may hold a list of descriptors or an object with a `tools` list.
pub fn load_descriptors(path: &Path) -> Result<Vec<Value>, DescriptorError> {
    let content = std::fs::read_to_string(path).map_err(|e| DescriptorError::ReadError {
        path: path.display().to_string(),
        error: e.to_string(),
    })?;

    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
    let parsed: Value = match extension {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(|e| DescriptorError::ParseError {
            path: path.display().to_string(),
            error: e.to_string(),
        })?,
        _ => serde_json::from_str(&content).map_err(|e| DescriptorError::ParseError {
            path: path.display().to_string(),
            error: e.to_string(),
        })?,
    };

    match parsed {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("tools") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(DescriptorError::InvalidLayout(path.display().to_string())),
        },
        _ => Err(DescriptorError::InvalidLayout(path.display().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn descriptor(name: &str, priority: f64) -> Value {
        json!({
            "kind": "http_tool",
            "name": name,
            "description": "test tool",
            "parameters": {"type": "object", "properties": {}},
            "http": {"method": "get", "urlTemplate": "https://api.example.com/{{args.id}}"},
            "enabled": true,
            "priority": priority
        })
    }

    #[test]
    fn test_typed_descriptor_defaults() {
        let value = json!({
            "kind": "http_tool",
            "name": "ping",
            "http": {"urlTemplate": "https://api.example.com/ping"}
        });
        let ToolDescriptor::Http(d) = serde_json::from_value::<ToolDescriptor>(value).unwrap();
        assert_eq!(d.http.method, HttpMethod::Post);
        assert!(d.enabled);
        assert_eq!(d.timeout(), Duration::from_millis(DEFAULT_TOOL_TIMEOUT_MS));
        assert_eq!(d.parameters["type"], "object");
    }

    #[test]
    fn test_timeout_is_capped() {
        let mut value = descriptor("slow", 0.0);
        value["http"]["timeoutMs"] = json!(10_000_000);
        let ToolDescriptor::Http(d) = serde_json::from_value::<ToolDescriptor>(value).unwrap();
        assert_eq!(d.timeout(), Duration::from_millis(MAX_TOOL_TIMEOUT_MS));
    }

    #[test]
    fn test_ingest_orders_and_filters() {
        let mut disabled = descriptor("off", 99.0);
        disabled["enabled"] = json!(false);
        let mut broken = descriptor("bad name!", 5.0);
        broken["http"]["urlTemplate"] = json!("https://x/{{response.id}}");

        let values = vec![
            descriptor("b_low", 1.0),
            descriptor("a_high", 10.0),
            disabled,
            broken,
            descriptor("a_low", 1.0),
        ];
        let ingested = ingest(&values);

        let names: Vec<_> = ingested.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a_high", "a_low", "b_low"]);
        assert_eq!(ingested.results.len(), 5);
        assert_eq!(ingested.rejected().count(), 1);
    }

    #[test]
    fn test_round_trip_to_value() {
        let ToolDescriptor::Http(d) =
            serde_json::from_value::<ToolDescriptor>(descriptor("q", 0.0)).unwrap();
        let value = d.to_value();
        assert_eq!(value["kind"], "http_tool");
        assert_eq!(value["http"]["method"], "GET");
    }

    #[test]
    fn test_load_descriptors_yaml_and_json() {
        let mut yaml = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            yaml,
            "tools:\n  - kind: http_tool\n    name: q\n    http:\n      urlTemplate: https://x/"
        )
        .unwrap();
        let loaded = load_descriptors(yaml.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0]["name"], "q");

        let mut json_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(json_file, "[{{\"name\": \"a\"}}, {{\"name\": \"b\"}}]").unwrap();
        assert_eq!(load_descriptors(json_file.path()).unwrap().len(), 2);

        let mut bad = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(bad, "42").unwrap();
        assert!(matches!(
            load_descriptors(bad.path()),
            Err(DescriptorError::InvalidLayout(_))
        ));
    }
}
