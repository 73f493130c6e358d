//! Filter pipeline for double-delimiter template expressions.
//!
//! Filters are applied left to right: `{{ args.n | trim | number }}`.
//! Unknown filters are no-ops so that descriptors written against a newer
//! filter set still resolve on older clients.

use serde_json::{Number, Value};

/// A single parsed filter invocation, e.g. `default("n/a")`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    /// Filter name (`number`, `default`, ...)
    pub name: String,
    /// Raw argument text between the parentheses, if any
    pub arg: Option<String>,
}

impl Filter {
    /// Parse `name` or `name(arg)`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        match text.find('(') {
            Some(open) if text.ends_with(')') => {
                let name = text[..open].trim();
                if name.is_empty() {
                    return None;
                }
                let arg = text[open + 1..text.len() - 1].trim();
                Some(Self {
                    name: name.to_string(),
                    arg: Some(arg.to_string()),
                })
            }
            Some(_) => None,
            None => Some(Self {
                name: text.to_string(),
                arg: None,
            }),
        }
    }

    /// Apply this filter to a value.
    pub fn apply(&self, value: Value) -> Value {
        match self.name.as_str() {
            "number" => to_number(&value),
            "int" => to_int(&value),
            "bool" => Value::Bool(is_truthy(&value)),
            "upper" => map_str(value, |s| s.to_uppercase()),
            "lower" => map_str(value, |s| s.to_lowercase()),
            "trim" => map_str(value, |s| s.trim().to_string()),
            "default" => {
                if is_blank(&value) {
                    self.arg.as_deref().map(parse_literal).unwrap_or(Value::Null)
                } else {
                    value
                }
            }
            "json" => Value::String(value.to_string()),
            other => {
                tracing::trace!(filter = %other, "Unknown template filter ignored");
                value
            }
        }
    }
}

/// Truthiness shared by the `bool` filter and success-field evaluation.
///
/// Strings are parsed for the usual spellings of yes/no; any other
/// non-empty string counts as true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => {
            let lowered = s.trim().to_ascii_lowercase();
            !matches!(lowered.as_str(), "" | "false" | "0" | "no" | "n" | "off" | "null")
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn map_str(value: Value, f: impl FnOnce(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(&s)),
        other => other,
    }
}

fn to_number(value: &Value) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        Value::Bool(b) => Value::from(u8::from(*b)),
        Value::String(s) => parse_number(s.trim()).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn to_int(value: &Value) -> Value {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Value::from(i),
            None => n
                .as_f64()
                .map(|f| Value::from(f.trunc() as i64))
                .unwrap_or(Value::Null),
        },
        Value::Bool(b) => Value::from(i64::from(*b)),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Value::from(i)
            } else {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| Value::from(f.trunc() as i64))
                    .unwrap_or(Value::Null)
            }
        }
        _ => Value::Null,
    }
}

fn parse_number(s: &str) -> Option<Value> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::from(i));
    }
    s.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

/// Parse a filter argument: quoted text is a string, anything else is tried
/// as a JSON literal and falls back to the raw text.
fn parse_literal(raw: &str) -> Value {
    let raw = raw.trim();
    let quoted = raw.len() >= 2
        && ((raw.starts_with('"') && raw.ends_with('"'))
            || (raw.starts_with('\'') && raw.ends_with('\'')));
    if quoted {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
