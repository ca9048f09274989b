// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Diagnostic event records and severity levels.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured payload attached to an event.
pub type DataMap = BTreeMap<String, Value>;

/// Event severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl DiagLevel {
    /// Lower-case name as written to sinks.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }

    /// Parse a configured level, falling back to `Info` for anything unknown.
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(Self::Info)
    }

    /// Map to the closest `tracing` level.
    pub fn to_tracing(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error | Self::Fatal => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for DiagLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiagLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" | "information" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" | "critical" => Ok(Self::Fatal),
            other => Err(format!("unknown level: {}", other)),
        }
    }
}

/// Failure details attached to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub message: String,
    /// Full text: the error and every `source()` below it.
    pub trace: String,
}

impl ExceptionInfo {
    /// Create exception info from explicit parts.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            type_name: type_name.into(),
            trace: message.clone(),
            message,
        }
    }

    /// Capture a typed error together with its source chain.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error,
    {
        Self {
            type_name: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
            trace: error_chain(err),
        }
    }

    /// Capture an `anyhow::Error`, including its backtrace when one was recorded.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self {
            type_name: "anyhow::Error".to_string(),
            message: err.to_string(),
            trace: format!("{:?}", err),
        }
    }

    /// Replace the trace text.
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = trace.into();
        self
    }
}

/// Render an error and its `source()` chain, one cause per line.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        text.push_str("\nCaused by: ");
        text.push_str(&cause.to_string());
        current = cause.source();
    }
    text
}

/// Electronic-signature metadata for events that record a signed action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureMeta {
    pub reason: Option<String>,
    pub doc_ref: Option<String>,
    pub hash: Option<String>,
}

/// One logged occurrence. Built once by the trace manager and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub ts_utc: DateTime<Utc>,
    pub lvl: DiagLevel,
    pub cat: String,
    pub evt: String,
    pub msg: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corr_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_ids: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_ver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_ver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_schema_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ex_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ex_msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DataMap>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig_doc_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig_hash: Option<String>,
}

impl DiagnosticEvent {
    /// Create a bare event stamped with the current time.
    ///
    /// Context fields are filled in by the trace manager.
    pub fn new(
        lvl: DiagLevel,
        cat: impl Into<String>,
        evt: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts_utc: Utc::now(),
            lvl,
            cat: cat.into(),
            evt: evt.into(),
            msg: msg.into(),
            corr_id: None,
            span_id: None,
            parent_span_id: None,
            user_id: None,
            username: None,
            role_ids: None,
            ip: None,
            session_id: None,
            device: None,
            os_ver: None,
            app_ver: None,
            git_commit: None,
            db_schema_hash: None,
            ex_type: None,
            ex_msg: None,
            stack: None,
            data: None,
            sig_reason: None,
            sig_doc_ref: None,
            sig_hash: None,
        }
    }

    /// Attach failure details.
    pub fn with_exception(mut self, exception: Option<ExceptionInfo>) -> Self {
        if let Some(ex) = exception {
            self.ex_type = Some(ex.type_name);
            self.ex_msg = Some(ex.message);
            self.stack = Some(ex.trace);
        }
        self
    }

    /// Attach a structured payload; empty maps are dropped.
    pub fn with_data(mut self, data: Option<DataMap>) -> Self {
        self.data = data.filter(|d| !d.is_empty());
        self
    }

    /// Attach e-signature metadata.
    pub fn with_signature(mut self, signature: SignatureMeta) -> Self {
        self.sig_reason = signature.reason;
        self.sig_doc_ref = signature.doc_ref;
        self.sig_hash = signature.hash;
        self
    }

    /// Look up one payload value.
    pub fn data_value(&self, key: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|d| d.get(key))
    }

    /// Serialize as a single JSON line (no trailing newline).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Build a [`DataMap`] from `key => value` pairs.
///
/// ```rust,ignore
/// let data = data_map! { "table" => "parts", "rows" => 3 };
/// ```
#[macro_export]
macro_rules! data_map {
    () => { $crate::telemetry::DataMap::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::telemetry::DataMap::new();
        $(
            map.insert(($key).to_string(), ::serde_json::json!($value));
        )+
        map
    }};
}
