//! Structural and template linting for stored tool descriptors.
//!
//! The linter works on raw JSON so that it can report problems the typed
//! model would refuse to deserialize at all. Every issue carries a severity,
//! a stable code and the location inside the descriptor it refers to.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;

use super::{HttpMethod, MAX_TOOL_TIMEOUT_MS};
use crate::core::template::{
    REQUEST_ROOTS, StaticSecrets, TemplateContext, TemplateScope, TemplateToken,
    apply_template_strict, extract_tokens, find_unresolved, split_path,
};

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._\-]+$").expect("valid tool name regex"));

static FIELD_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*$")
        .expect("valid field path regex")
});

/// Value substituted for every referenced request path during simulation.
/// It survives every built-in filter (`number`, `int`, `bool`, ...).
const SENTINEL: &str = "1";

// =============================================================================
// Issues
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LintIssue {
    pub severity: Severity,
    /// Stable machine-readable code, e.g. `forbidden_root`
    pub code: String,
    /// Location inside the descriptor, e.g. `http.urlTemplate`
    pub path: String,
    pub message: String,
}

impl LintIssue {
    pub fn error(code: &str, path: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code: code.to_string(),
            path: path.to_string(),
            message: message.into(),
        }
    }

    pub fn warning(code: &str, path: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            code: code.to_string(),
            path: path.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for LintIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{} [{}]: {}", self.severity, self.code, self.message)
        } else {
            write!(
                f,
                "{} [{}] at {}: {}",
                self.severity, self.code, self.path, self.message
            )
        }
    }
}

/// Lint outcome for one descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LintResult {
    /// Position in the linted batch
    pub index: usize,
    pub name: Option<String>,
    pub issues: Vec<LintIssue>,
}

impl LintResult {
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &LintIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &LintIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
    }
}

// =============================================================================
// Entry points
// =============================================================================

/// Lint a batch of descriptors. Duplicate names are detected across the batch.
pub fn lint(descriptors: &[Value]) -> Vec<LintResult> {
    let mut seen = HashSet::new();
    descriptors
        .iter()
        .enumerate()
        .map(|(index, value)| {
            let mut result = lint_one(index, value);
            if let Some(name) = &result.name
                && !seen.insert(name.clone())
            {
                result.issues.push(LintIssue::error(
                    "duplicate_name",
                    "name",
                    format!("tool name '{}' is already used in this batch", name),
                ));
            }
            result
        })
        .collect()
}

/// Lint a single descriptor in isolation.
pub fn lint_one(index: usize, value: &Value) -> LintResult {
    let mut issues = Vec::new();

    let Some(obj) = value.as_object() else {
        issues.push(LintIssue::error(
            "invalid_type",
            "",
            "descriptor must be a JSON object",
        ));
        return LintResult {
            index,
            name: None,
            issues,
        };
    };

    let name = check_header(obj, &mut issues);
    check_parameters(obj, &mut issues);

    let mut flagged = HashSet::new();
    if let Some(http) = check_http(obj, &mut issues) {
        check_request_tokens(http, &mut issues, &mut flagged);
        simulate_request(http, &mut issues, &flagged);
    }
    check_ui(obj, &mut issues);
    check_flags(obj, &mut issues);

    LintResult {
        index,
        name,
        issues,
    }
}

// =============================================================================
// Structure
// =============================================================================

fn check_header(obj: &Map<String, Value>, issues: &mut Vec<LintIssue>) -> Option<String> {
    match obj.get("kind") {
        None => issues.push(LintIssue::error("missing_field", "kind", "`kind` is required")),
        Some(Value::String(kind)) if kind == "http_tool" => {}
        Some(other) => issues.push(LintIssue::error(
            "unsupported_kind",
            "kind",
            format!("unsupported descriptor kind {}", other),
        )),
    }

    let name = match obj.get("name") {
        None => {
            issues.push(LintIssue::error("missing_field", "name", "`name` is required"));
            None
        }
        Some(Value::String(name)) => {
            if !NAME_RE.is_match(name) {
                issues.push(LintIssue::error(
                    "invalid_name",
                    "name",
                    format!(
                        "tool name '{}' may only contain letters, digits, '.', '_' or '-'",
                        name
                    ),
                ));
            }
            Some(name.clone())
        }
        Some(_) => {
            issues.push(LintIssue::error("invalid_type", "name", "`name` must be a string"));
            None
        }
    };

    match obj.get("description") {
        None => issues.push(LintIssue::warning(
            "missing_description",
            "description",
            "tools without a description are rarely chosen by the model",
        )),
        Some(Value::String(_)) => {}
        Some(_) => issues.push(LintIssue::error(
            "invalid_type",
            "description",
            "`description` must be a string",
        )),
    }

    name
}

fn check_parameters(obj: &Map<String, Value>, issues: &mut Vec<LintIssue>) {
    let Some(parameters) = obj.get("parameters") else {
        return;
    };
    let Some(schema) = parameters.as_object() else {
        issues.push(LintIssue::error(
            "invalid_parameters",
            "parameters",
            "`parameters` must be a JSON schema object",
        ));
        return;
    };
    if let Some(ty) = schema.get("type")
        && *ty != "object"
    {
        issues.push(LintIssue::error(
            "invalid_parameters",
            "parameters.type",
            format!("parameter schema must have type \"object\", found {}", ty),
        ));
    }
    if let Some(props) = schema.get("properties")
        && !props.is_object()
    {
        issues.push(LintIssue::error(
            "invalid_parameters",
            "parameters.properties",
            "`properties` must be an object",
        ));
    }
}

fn check_http<'a>(
    obj: &'a Map<String, Value>,
    issues: &mut Vec<LintIssue>,
) -> Option<&'a Map<String, Value>> {
    let http = match obj.get("http") {
        None => {
            issues.push(LintIssue::error("missing_field", "http", "`http` is required"));
            return None;
        }
        Some(Value::Object(http)) => http,
        Some(_) => {
            issues.push(LintIssue::error("invalid_type", "http", "`http` must be an object"));
            return None;
        }
    };

    if let Some(method) = http.get("method") {
        match method.as_str().and_then(HttpMethod::parse) {
            Some(_) => {}
            None => issues.push(LintIssue::error(
                "invalid_method",
                "http.method",
                format!("unsupported HTTP method {}", method),
            )),
        }
    }

    match http.get("urlTemplate") {
        None => issues.push(LintIssue::error(
            "missing_field",
            "http.urlTemplate",
            "`urlTemplate` is required",
        )),
        Some(Value::String(url)) if url.trim().is_empty() => issues.push(LintIssue::error(
            "invalid_url",
            "http.urlTemplate",
            "`urlTemplate` must not be empty",
        )),
        Some(Value::String(_)) => {}
        Some(_) => issues.push(LintIssue::error(
            "invalid_type",
            "http.urlTemplate",
            "`urlTemplate` must be a string",
        )),
    }

    match http.get("headers") {
        None => {}
        Some(Value::Object(headers)) => {
            for (key, value) in headers {
                if !value.is_string() {
                    issues.push(LintIssue::error(
                        "invalid_type",
                        &format!("http.headers.{}", key),
                        "header values must be strings",
                    ));
                }
            }
        }
        Some(_) => issues.push(LintIssue::error(
            "invalid_type",
            "http.headers",
            "`headers` must be an object of strings",
        )),
    }

    match http.get("okField") {
        None => {}
        Some(Value::String(field)) => {
            if !FIELD_PATH_RE.is_match(field) {
                issues.push(LintIssue::warning(
                    "ok_field_path",
                    "http.okField",
                    format!(
                        "okField '{}' is not a plain dotted identifier path and may never match",
                        field
                    ),
                ));
            }
        }
        Some(_) => issues.push(LintIssue::error(
            "invalid_type",
            "http.okField",
            "`okField` must be a string",
        )),
    }

    if let Some(timeout) = http.get("timeoutMs") {
        match timeout.as_u64() {
            Some(ms) if ms > 0 && ms <= MAX_TOOL_TIMEOUT_MS => {}
            _ => issues.push(LintIssue::error(
                "invalid_timeout",
                "http.timeoutMs",
                format!(
                    "`timeoutMs` must be an integer between 1 and {}",
                    MAX_TOOL_TIMEOUT_MS
                ),
            )),
        }
    }

    Some(http)
}

fn check_ui(obj: &Map<String, Value>, issues: &mut Vec<LintIssue>) {
    let ui = match obj.get("ui") {
        None => return,
        Some(Value::Object(ui)) => ui,
        Some(_) => {
            issues.push(LintIssue::error("invalid_type", "ui", "`ui` must be an object"));
            return;
        }
    };

    if let Some(msg) = ui.get("loadingMessage")
        && !msg.is_string()
    {
        issues.push(LintIssue::error(
            "invalid_type",
            "ui.loadingMessage",
            "`loadingMessage` must be a string",
        ));
    }

    for key in ["onSuccess", "onError"] {
        let Some(block) = ui.get(key) else {
            continue;
        };
        let location = format!("ui.{}", key);
        let Some(block) = block.as_object() else {
            issues.push(LintIssue::error(
                "invalid_type",
                &location,
                "UI blocks must be objects",
            ));
            continue;
        };
        if let Some(show) = block.get("showComponent") {
            let named = show
                .get("name")
                .map(|n| n.is_string())
                .unwrap_or(false);
            if !named {
                issues.push(LintIssue::error(
                    "invalid_ui_block",
                    &format!("{}.showComponent", location),
                    "`showComponent` needs a string `name`",
                ));
            }
        }
        if let Some(speak) = block.get("speak")
            && !speak.is_string()
        {
            issues.push(LintIssue::error(
                "invalid_type",
                &format!("{}.speak", location),
                "`speak` must be a string",
            ));
        }
    }

    let ui_value = Value::Object(ui.clone());
    for token in extract_tokens(&ui_value, "ui") {
        check_token_root(&token, TemplateScope::Ui, issues, None);
    }
}

fn check_flags(obj: &Map<String, Value>, issues: &mut Vec<LintIssue>) {
    match obj.get("enabled") {
        None | Some(Value::Bool(true)) => {}
        Some(Value::Bool(false)) => issues.push(LintIssue::warning(
            "disabled",
            "enabled",
            "tool is disabled and will not be registered",
        )),
        Some(_) => issues.push(LintIssue::error(
            "invalid_type",
            "enabled",
            "`enabled` must be a boolean",
        )),
    }

    if let Some(priority) = obj.get("priority")
        && !priority.is_number()
    {
        issues.push(LintIssue::error(
            "invalid_type",
            "priority",
            "`priority` must be a number",
        ));
    }
}

// =============================================================================
// Templates
// =============================================================================

/// Request templates as `(location, tree)` pairs.
fn request_templates(http: &Map<String, Value>) -> Vec<(&'static str, &Value)> {
    let mut pieces = Vec::new();
    if let Some(url) = http.get("urlTemplate").filter(|v| v.is_string()) {
        pieces.push(("http.urlTemplate", url));
    }
    if let Some(headers) = http.get("headers").filter(|v| v.is_object()) {
        pieces.push(("http.headers", headers));
    }
    if let Some(body) = http.get("jsonBodyTemplate") {
        pieces.push(("http.jsonBodyTemplate", body));
    }
    pieces
}

fn check_request_tokens(
    http: &Map<String, Value>,
    issues: &mut Vec<LintIssue>,
    flagged: &mut HashSet<String>,
) {
    for (location, tree) in request_templates(http) {
        for token in extract_tokens(tree, location) {
            check_token_root(&token, TemplateScope::Request, issues, Some(flagged));
        }
    }
}

fn check_token_root(
    token: &TemplateToken,
    scope: TemplateScope,
    issues: &mut Vec<LintIssue>,
    flagged: Option<&mut HashSet<String>>,
) {
    let problem = match (&token.path, token.root()) {
        (None, _) => Some(LintIssue::error(
            "malformed_token",
            &token.location,
            format!("cannot parse template expression {}", token.raw),
        )),
        (Some(path), Some(root)) if !scope.allows(root) => Some(LintIssue::error(
            "forbidden_root",
            &token.location,
            format!(
                "'{}' is not available in {} templates (allowed roots: {})",
                path,
                scope,
                scope.allowed_roots().join(", ")
            ),
        )),
        _ => None,
    };

    if let Some(issue) = problem {
        issues.push(issue);
        if let Some(flagged) = flagged {
            flagged.insert(token.raw.clone());
        }
    }
}

/// Resolve the request templates against sentinel data for every referenced
/// `args`/`secrets` path. Anything still unresolved afterwards would fail at
/// call time no matter what the model sends.
fn simulate_request(
    http: &Map<String, Value>,
    issues: &mut Vec<LintIssue>,
    flagged: &HashSet<String>,
) {
    let pieces = request_templates(http);

    let mut args = Value::Object(Map::new());
    let mut secrets = Value::Object(Map::new());
    for (location, tree) in &pieces {
        for token in extract_tokens(tree, location) {
            let Some(segments) = token.path.as_deref().and_then(split_path) else {
                continue;
            };
            let Some((root, rest)) = segments.split_first() else {
                continue;
            };
            if !REQUEST_ROOTS.contains(&root.as_str()) {
                continue;
            }
            match root.as_str() {
                "args" => set_deep(&mut args, rest),
                _ => set_deep(&mut secrets, rest),
            }
        }
    }

    let resolver = StaticSecrets::new(secrets);
    let ctx = TemplateContext::request(&args, &resolver, "lint");

    for (location, tree) in pieces {
        let resolution = apply_template_strict(tree, &ctx);
        let mut leftovers = resolution.unresolved;
        leftovers.extend(find_unresolved(&resolution.value));

        let mut reported = HashSet::new();
        for raw in leftovers {
            if flagged.contains(&raw) || !reported.insert(raw.clone()) {
                continue;
            }
            issues.push(LintIssue::error(
                "unresolved_token",
                location,
                format!("{} would stay unresolved at call time", raw),
            ));
        }
    }
}

/// Place the sentinel at `segments` inside `tree`, creating objects on the way.
fn set_deep(tree: &mut Value, segments: &[String]) {
    let Some((head, tail)) = segments.split_first() else {
        return;
    };
    if !tree.is_object() {
        *tree = Value::Object(Map::new());
    }
    let Value::Object(map) = tree else {
        return;
    };
    if tail.is_empty() {
        map.entry(head.clone())
            .or_insert_with(|| Value::String(SENTINEL.to_string()));
    } else {
        let child = map
            .entry(head.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        set_deep(child, tail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> Value {
        json!({
            "kind": "http_tool",
            "name": "quote",
            "description": "Get a quote",
            "parameters": {"type": "object", "properties": {"sku": {"type": "string"}}},
            "http": {
                "method": "POST",
                "urlTemplate": "https://api.example.com/quotes/{{args.sku}}",
                "headers": {"Authorization": "Bearer {{secrets.api_key}}"},
                "jsonBodyTemplate": {"qty": "{{args.qty | int}}", "items": ["{args.items[0].id}"]},
                "okField": "ok",
                "timeoutMs": 5000
            },
            "ui": {
                "loadingMessage": "Looking up {{args.sku}}",
                "onSuccess": {"showComponent": {"name": "Quote", "props": {"price": "{{response.price}}"}}},
                "onError": {"speak": "Failed with {{status}}"}
            },
            "enabled": true,
            "priority": 1
        })
    }

    fn codes(result: &LintResult) -> Vec<&str> {
        result.issues.iter().map(|i| i.code.as_str()).collect()
    }

    #[test]
    fn test_valid_descriptor_is_clean() {
        let result = lint_one(0, &valid());
        assert!(result.issues.is_empty(), "{:?}", result.issues);
        assert_eq!(result.name.as_deref(), Some("quote"));
    }

    #[test]
    fn test_response_root_in_url_is_one_error() {
        let mut d = valid();
        d["http"]["urlTemplate"] = json!("https://x/{{response.id}}");
        let result = lint_one(0, &d);

        let errors: Vec<_> = result.errors().collect();
        assert_eq!(errors.len(), 1, "{:?}", result.issues);
        assert_eq!(errors[0].code, "forbidden_root");
        assert!(errors[0].message.contains("response.id"));
        assert_eq!(errors[0].path, "http.urlTemplate");
    }

    #[test]
    fn test_secrets_forbidden_in_ui() {
        let mut d = valid();
        d["ui"]["onError"]["speak"] = json!("key {{secrets.api_key}}");
        let result = lint_one(0, &d);
        let errors: Vec<_> = result.errors().collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "ui.onError.speak");
        assert!(errors[0].message.contains("secrets.api_key"));
    }

    #[test]
    fn test_unclosed_token_found_by_simulation() {
        let mut d = valid();
        d["http"]["headers"]["X-Trace"] = json!("{{args.trace");
        let result = lint_one(0, &d);
        assert_eq!(codes(&result), vec!["unresolved_token"]);
        assert_eq!(result.issues[0].path, "http.headers");
    }

    #[test]
    fn test_malformed_expression() {
        let mut d = valid();
        d["http"]["urlTemplate"] = json!("https://x/{{ 1bad }}");
        let result = lint_one(0, &d);
        assert_eq!(codes(&result), vec!["malformed_token"]);
    }

    #[test]
    fn test_structural_errors() {
        let d = json!({
            "kind": "grpc_tool",
            "name": "has space",
            "parameters": {"type": "array"},
            "http": {"method": "TRACE", "timeoutMs": 0}
        });
        let result = lint_one(3, &d);
        let codes = codes(&result);
        assert_eq!(result.index, 3);
        assert!(codes.contains(&"unsupported_kind"));
        assert!(codes.contains(&"invalid_name"));
        assert!(codes.contains(&"invalid_parameters"));
        assert!(codes.contains(&"invalid_method"));
        assert!(codes.contains(&"missing_field"));
        assert!(codes.contains(&"invalid_timeout"));
        assert!(codes.contains(&"missing_description"));
    }

    #[test]
    fn test_not_an_object() {
        let result = lint_one(0, &json!("tool"));
        assert!(result.has_errors());
        assert!(result.name.is_none());
    }

    #[test]
    fn test_warnings_do_not_block() {
        let mut d = valid();
        d["enabled"] = json!(false);
        d["http"]["okField"] = json!("result[0].ok");
        let result = lint_one(0, &d);
        assert!(!result.has_errors());
        let warnings: Vec<_> = result.warnings().map(|w| w.code.as_str()).collect();
        assert_eq!(warnings, vec!["ok_field_path", "disabled"]);
    }

    #[test]
    fn test_duplicate_names_in_batch() {
        let results = lint(&[valid(), valid()]);
        assert!(!results[0].has_errors());
        assert_eq!(codes(&results[1]), vec!["duplicate_name"]);
    }

    #[test]
    fn test_filters_survive_simulation() {
        let mut d = valid();
        d["http"]["jsonBodyTemplate"] = json!({
            "n": "{{args.n | number}}",
            "flag": "{{args.flag | bool}}",
            "tag": "{{args.tag | upper | default(\"x\")}}"
        });
        let result = lint_one(0, &d);
        assert!(result.issues.is_empty(), "{:?}", result.issues);
    }

    #[test]
    fn test_issue_display() {
        let issue = LintIssue::error("forbidden_root", "http.urlTemplate", "bad");
        assert_eq!(
            issue.to_string(),
            "error [forbidden_root] at http.urlTemplate: bad"
        );
    }
}
