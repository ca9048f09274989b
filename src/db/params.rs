// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Named statement parameters and value conversions.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use rusqlite::types::Value;
use rusqlite::Statement;
use serde_json::Value as JsonValue;

use crate::telemetry::MASK;

/// One named parameter, e.g. `@id = 42`.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlParam {
    /// Name including its `@`, `:` or `$` prefix.
    pub name: String,
    pub value: Value,
}

impl SqlParam {
    /// Create a parameter; a bare name gets an `@` prefix.
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        let name = if name.starts_with(['@', ':', '$']) {
            name
        } else {
            format!("@{}", name)
        };
        Self {
            name,
            value: value.into(),
        }
    }

    /// Parse `@name=value`. Integers, reals and `null` are typed; anything
    /// else is text.
    pub fn parse(text: &str) -> Option<Self> {
        let (name, raw) = text.split_once('=')?;
        let name = name.trim();
        if name.trim_start_matches(['@', ':', '$']).is_empty() {
            return None;
        }
        let value = if raw.eq_ignore_ascii_case("null") {
            Value::Null
        } else if let Ok(i) = raw.parse::<i64>() {
            Value::Integer(i)
        } else if let Ok(f) = raw.parse::<f64>() {
            Value::Real(f)
        } else {
            Value::Text(raw.to_string())
        };
        Some(Self::new(name, value))
    }
}

/// Find a parameter by name, ignoring case.
pub fn find_param<'a>(params: &'a [SqlParam], name: &str) -> Option<&'a SqlParam> {
    params.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

/// Parameter names with every value masked.
pub fn masked_param_map(params: &[SqlParam]) -> JsonValue {
    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    for param in params {
        seen.insert(param.name.to_ascii_lowercase(), param.name.clone());
    }
    let map = seen
        .into_values()
        .map(|name| (name, JsonValue::String(MASK.to_string())))
        .collect();
    JsonValue::Object(map)
}

/// Bind `params` to `stmt` by name. Parameters the statement does not use
/// are ignored.
pub fn bind_params(stmt: &mut Statement<'_>, params: &[SqlParam]) -> rusqlite::Result<()> {
    for param in params {
        if let Some(index) = stmt.parameter_index(&param.name)? {
            stmt.raw_bind_parameter(index, &param.value)?;
        }
    }
    Ok(())
}

/// JSON rendering of a column value. Blobs become lower-case hex.
pub fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Integer(i) => JsonValue::from(*i),
        Value::Real(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(f.to_string())),
        Value::Text(s) => JsonValue::String(s.clone()),
        Value::Blob(bytes) => JsonValue::String(to_hex(bytes)),
    }
}

/// String representation used for row comparison; `None` for NULL.
pub fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(f) => Some(f.to_string()),
        Value::Text(s) => Some(s.clone()),
        Value::Blob(bytes) => Some(to_hex(bytes)),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}
