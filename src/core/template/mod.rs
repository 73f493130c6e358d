//! Template engine for tool descriptors.
//!
//! Two syntaxes are supported:
//!
//! - `{path}`: low fidelity, always renders a string; missing paths render
//!   as the empty string.
//! - `{{ path | filter | filter(arg) }}`: high fidelity with a filter
//!   pipeline (`number`, `int`, `bool`, `upper`, `lower`, `trim`,
//!   `default(x)`, `json`).
//!
//! When an input consists of exactly one high-fidelity expression the
//! resolved value keeps its native JSON type, so `"{{args.n | number}}"`
//! becomes the number `42` rather than the string `"42"`. Mixed content always
//! renders to a string.
//!
//! Every lookup goes through a [`TemplateContext`] whose scope restricts the
//! roots a template may reference: request building sees `args` and
//! `secrets`, UI rendering sees `args`, `response` and `status`.
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//! use waav_realtime::core::template::{resolve, NoSecrets, TemplateContext};
//!
//! let args = json!({"n": "42", "city": "Oslo"});
//! let ctx = TemplateContext::request(&args, &NoSecrets, "tenant-a");
//!
//! assert_eq!(resolve("{{args.n | number}}", &ctx), json!(42));
//! assert_eq!(resolve("Weather in {args.city}", &ctx), json!("Weather in Oslo"));
//! ```

mod filters;

pub use filters::{Filter, is_truthy};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::fmt;

/// Matches `{{ expression }}` (group 1) or `{path}` (group 2).
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?s)\{\{(.*?)\}\}|\{([A-Za-z_][A-Za-z0-9_\-]*(?:\.[A-Za-z0-9_\-]+|\[\d+\])*)\}",
    )
    .expect("token regex is valid")
});

static PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_\-]*(?:\.[A-Za-z0-9_\-]+|\[\d+\])*$")
        .expect("path regex is valid")
});

/// Roots visible while building an outbound request.
pub const REQUEST_ROOTS: &[&str] = &["args", "secrets"];

/// Roots visible while rendering UI side effects.
pub const UI_ROOTS: &[&str] = &["args", "response", "status"];

// =============================================================================
// Secrets
// =============================================================================

/// Resolves `secrets.*` tokens for a tenant.
///
/// The engine calls this directly for every secrets-rooted token; nothing
/// else in the crate reads secret material.
pub trait SecretResolver: Send + Sync {
    /// Resolve a dotted secret path (without the `secrets.` root).
    fn resolve_secret(&self, path: &str, tenant_id: &str) -> Option<String>;
}

/// Resolver that knows no secrets.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecrets;

impl SecretResolver for NoSecrets {
    fn resolve_secret(&self, _path: &str, _tenant_id: &str) -> Option<String> {
        None
    }
}

/// Resolver backed by a fixed JSON tree, shared by all tenants.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    values: Value,
}

impl StaticSecrets {
    pub fn new(values: Value) -> Self {
        Self { values }
    }
}

impl SecretResolver for StaticSecrets {
    fn resolve_secret(&self, path: &str, _tenant_id: &str) -> Option<String> {
        let segments = split_path(path)?;
        walk(&self.values, &segments).map(|v| render_inline(&v))
    }
}

/// Resolver reading `{PREFIX}{TENANT}_{PATH}` environment variables.
///
/// `secrets.api_key` for tenant `acme-co` with prefix `WAAV_SECRET_` reads
/// `WAAV_SECRET_ACME_CO_API_KEY`.
#[derive(Debug, Clone)]
pub struct EnvSecrets {
    prefix: String,
}

impl EnvSecrets {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Environment variable name for a secret path and tenant.
    pub fn var_name(&self, path: &str, tenant_id: &str) -> String {
        let normalize = |s: &str| {
            s.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect::<String>()
        };
        format!("{}{}_{}", self.prefix, normalize(tenant_id), normalize(path))
    }
}

impl SecretResolver for EnvSecrets {
    fn resolve_secret(&self, path: &str, tenant_id: &str) -> Option<String> {
        std::env::var(self.var_name(path, tenant_id)).ok()
    }
}

// =============================================================================
// Context
// =============================================================================

/// Which roots a context exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateScope {
    /// `{args, secrets}`
    Request,
    /// `{args, response, status}`
    Ui,
}

impl TemplateScope {
    pub fn allowed_roots(&self) -> &'static [&'static str] {
        match self {
            TemplateScope::Request => REQUEST_ROOTS,
            TemplateScope::Ui => UI_ROOTS,
        }
    }

    pub fn allows(&self, root: &str) -> bool {
        self.allowed_roots().contains(&root)
    }
}

impl fmt::Display for TemplateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateScope::Request => write!(f, "request"),
            TemplateScope::Ui => write!(f, "ui"),
        }
    }
}

/// Data a template may reference, restricted by scope.
#[derive(Clone, Copy)]
pub struct TemplateContext<'a> {
    scope: TemplateScope,
    args: &'a Value,
    secrets: Option<(&'a dyn SecretResolver, &'a str)>,
    response: Option<&'a Value>,
    status: Option<u16>,
}

impl<'a> TemplateContext<'a> {
    /// Request-time context: `{args, secrets}`.
    pub fn request(args: &'a Value, secrets: &'a dyn SecretResolver, tenant_id: &'a str) -> Self {
        Self {
            scope: TemplateScope::Request,
            args,
            secrets: Some((secrets, tenant_id)),
            response: None,
            status: None,
        }
    }

    /// UI-time context: `{args, response, status}`.
    pub fn ui(args: &'a Value, response: &'a Value, status: u16) -> Self {
        Self {
            scope: TemplateScope::Ui,
            args,
            secrets: None,
            response: Some(response),
            status: Some(status),
        }
    }

    pub fn scope(&self) -> TemplateScope {
        self.scope
    }

    /// Look up a full token path such as `args.items[0].name`.
    ///
    /// Returns `None` for invalid paths, roots outside the scope and
    /// missing data.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let segments = split_path(path)?;
        let (root, rest) = segments.split_first()?;
        if !self.scope.allows(root) {
            return None;
        }

        match root.as_str() {
            "args" => walk(self.args, rest),
            "secrets" => {
                if rest.is_empty() {
                    return None;
                }
                let (resolver, tenant_id) = self.secrets?;
                resolver
                    .resolve_secret(&rest.join("."), tenant_id)
                    .map(Value::String)
            }
            "response" => walk(self.response?, rest),
            "status" if rest.is_empty() => self.status.map(Value::from),
            _ => None,
        }
    }
}

impl fmt::Debug for TemplateContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Secrets are never printed.
        f.debug_struct("TemplateContext")
            .field("scope", &self.scope)
            .field("args", &self.args)
            .field("response", &self.response)
            .field("status", &self.status)
            .finish()
    }
}

// =============================================================================
// Expressions and tokens
// =============================================================================

/// A parsed `{{ path | filters }}` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    pub path: String,
    pub filters: Vec<Filter>,
}

impl Expression {
    /// Parse the body between the double delimiters.
    pub fn parse(body: &str) -> Option<Self> {
        let mut parts = split_pipeline(body).into_iter();
        let path = parts.next()?.trim().to_string();
        if !is_valid_path(&path) {
            return None;
        }
        let filters = parts
            .map(|p| Filter::parse(&p))
            .collect::<Option<Vec<_>>>()?;
        Some(Self { path, filters })
    }

    /// First dot-segment of the path.
    pub fn root(&self) -> &str {
        path_root(&self.path)
    }

    pub fn evaluate(&self, ctx: &TemplateContext<'_>) -> Value {
        let base = ctx.lookup(&self.path).unwrap_or(Value::Null);
        self.filters.iter().fold(base, |value, f| f.apply(value))
    }
}

/// Template syntax a token was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fidelity {
    /// `{{ ... }}`
    High,
    /// `{ ... }`
    Low,
}

/// A token found in a template tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateToken {
    /// Where the token was found, e.g. `http.headers.Authorization`
    pub location: String,
    /// The token text including delimiters
    pub raw: String,
    pub fidelity: Fidelity,
    /// Referenced path; `None` when the expression does not parse
    pub path: Option<String>,
}

impl TemplateToken {
    pub fn root(&self) -> Option<&str> {
        self.path.as_deref().map(path_root)
    }
}

/// Outcome of a strict resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub value: Value,
    /// Raw text of every high-fidelity token that could not be resolved
    pub unresolved: Vec<String>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Lenient,
    Strict,
}

// =============================================================================
// Resolution
// =============================================================================

/// Resolve a single template string.
///
/// Missing values resolve to `null` for a whole-input expression and to the
/// empty string inside mixed content.
pub fn resolve(input: &str, ctx: &TemplateContext<'_>) -> Value {
    render(input, ctx, Mode::Lenient).value
}

/// Resolve a template string, reporting every unresolved expression.
///
/// Unresolved expressions are left in place so that [`find_unresolved`]
/// still sees them.
pub fn resolve_strict(input: &str, ctx: &TemplateContext<'_>) -> Resolution {
    render(input, ctx, Mode::Strict)
}

/// Substitute every string leaf of a JSON tree. Keys, array lengths and
/// non-string leaves are untouched.
pub fn apply_template(value: &Value, ctx: &TemplateContext<'_>) -> Value {
    match value {
        Value::String(s) => resolve(s, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|v| apply_template(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), apply_template(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Strict form of [`apply_template`].
pub fn apply_template_strict(value: &Value, ctx: &TemplateContext<'_>) -> Resolution {
    let mut unresolved = Vec::new();
    let value = apply_strict_inner(value, ctx, &mut unresolved);
    Resolution { value, unresolved }
}

fn apply_strict_inner(value: &Value, ctx: &TemplateContext<'_>, unresolved: &mut Vec<String>) -> Value {
    match value {
        Value::String(s) => {
            let resolution = resolve_strict(s, ctx);
            unresolved.extend(resolution.unresolved);
            resolution.value
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| apply_strict_inner(v, ctx, unresolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), apply_strict_inner(v, ctx, unresolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render(input: &str, ctx: &TemplateContext<'_>, mode: Mode) -> Resolution {
    let mut unresolved = Vec::new();

    if let Some(body) = whole_expression(input) {
        let value = match Expression::parse(body) {
            Some(expr) => expr.evaluate(ctx),
            None => Value::Null,
        };
        if value.is_null() && mode == Mode::Strict {
            unresolved.push(input.trim().to_string());
            return Resolution {
                value: Value::String(input.to_string()),
                unresolved,
            };
        }
        return Resolution { value, unresolved };
    }

    let rendered = TOKEN_RE.replace_all(input, |caps: &Captures<'_>| {
        let raw = &caps[0];
        if let Some(body) = caps.get(1) {
            let value = Expression::parse(body.as_str())
                .map(|expr| expr.evaluate(ctx))
                .unwrap_or(Value::Null);
            if value.is_null() && mode == Mode::Strict {
                unresolved.push(raw.to_string());
                return raw.to_string();
            }
            render_inline(&value)
        } else {
            ctx.lookup(&caps[2])
                .map(|v| render_inline(&v))
                .unwrap_or_default()
        }
    });

    Resolution {
        value: Value::String(rendered.into_owned()),
        unresolved,
    }
}

/// Return the expression body when the (trimmed) input is exactly one
/// high-fidelity token.
fn whole_expression(input: &str) -> Option<&str> {
    let trimmed = input.trim();
    let caps = TOKEN_RE.captures(trimmed)?;
    let whole = caps.get(0)?;
    if whole.start() != 0 || whole.end() != trimmed.len() {
        return None;
    }
    caps.get(1).map(|m| m.as_str())
}

fn render_inline(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// =============================================================================
// Inspection
// =============================================================================

/// Every `{{...}}` fragment still present in any string leaf.
///
/// An opening delimiter without a closing one is reported up to the end of
/// the string.
pub fn find_unresolved(value: &Value) -> Vec<String> {
    let mut found = Vec::new();
    collect_unresolved(value, &mut found);
    found
}

/// Whether any string leaf still contains a `{{` token.
pub fn has_unresolved(value: &Value) -> bool {
    !find_unresolved(value).is_empty()
}

fn collect_unresolved(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            let mut rest = s.as_str();
            while let Some(start) = rest.find("{{") {
                let tail = &rest[start..];
                let end = tail.find("}}").map(|i| i + 2).unwrap_or(tail.len());
                found.push(tail[..end].to_string());
                rest = &tail[end..];
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_unresolved(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_unresolved(v, found)),
        _ => {}
    }
}

/// List every template token in a tree, tagged with its location.
pub fn extract_tokens(value: &Value, location: &str) -> Vec<TemplateToken> {
    let mut tokens = Vec::new();
    collect_tokens(value, location, &mut tokens);
    tokens
}

fn collect_tokens(value: &Value, location: &str, out: &mut Vec<TemplateToken>) {
    match value {
        Value::String(s) => {
            for caps in TOKEN_RE.captures_iter(s) {
                let raw = caps[0].to_string();
                let token = match caps.get(1) {
                    Some(body) => TemplateToken {
                        location: location.to_string(),
                        raw,
                        fidelity: Fidelity::High,
                        path: Expression::parse(body.as_str()).map(|e| e.path),
                    },
                    None => TemplateToken {
                        location: location.to_string(),
                        raw,
                        fidelity: Fidelity::Low,
                        path: Some(caps[2].to_string()),
                    },
                };
                out.push(token);
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                collect_tokens(item, &format!("{}[{}]", location, i), out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                let child = if location.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", location, key)
                };
                collect_tokens(item, &child, out);
            }
        }
        _ => {}
    }
}

// =============================================================================
// Paths
// =============================================================================

pub fn is_valid_path(path: &str) -> bool {
    PATH_RE.is_match(path)
}

fn path_root(path: &str) -> &str {
    path.split(['.', '[']).next().unwrap_or(path)
}

/// Split `a.b[0].c` into `["a", "b", "0", "c"]`.
pub(crate) fn split_path(path: &str) -> Option<Vec<String>> {
    if !is_valid_path(path) {
        return None;
    }
    Some(
        path.replace('[', ".")
            .replace(']', "")
            .split('.')
            .map(str::to_string)
            .collect(),
    )
}

fn walk(value: &Value, segments: &[String]) -> Option<Value> {
    let mut current = value;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Split an expression on `|`, ignoring pipes inside quotes or parentheses.
fn split_pipeline(body: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;

    for c in body.chars() {
        match (quote, c) {
            (Some(q), _) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), _) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                current.push(c);
            }
            (None, '(') => {
                depth += 1;
                current.push(c);
            }
            (None, ')') => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            (None, '|') if depth == 0 => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}
