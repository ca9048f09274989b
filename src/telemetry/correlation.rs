// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Correlation and span identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque token grouping every event of one logical operation.
///
/// Generated ids are 32 lowercase hex characters; callers may also supply
/// their own token (for example an upstream request id).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Use a caller-supplied token; blank input generates a fresh id.
    pub fn from_token(token: Option<&str>) -> Self {
        match token.map(str::trim) {
            Some(t) if !t.is_empty() => Self(t.to_string()),
            _ => Self::new(),
        }
    }

    /// Borrow the token.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get a short representation (first 8 characters).
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self.short())
    }
}

impl From<CorrelationId> for String {
    fn from(id: CorrelationId) -> Self {
        id.0
    }
}

/// Identifier of one span boundary: 16 lowercase hex characters.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpanId(String);

impl SpanId {
    /// Allocate a fresh span id.
    pub fn new() -> Self {
        let mut simple = Uuid::new_v4().simple().to_string();
        simple.truncate(16);
        Self(simple)
    }

    /// Borrow the id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SpanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({})", self.0)
    }
}

/// Extension trait for adding correlation IDs to tracing spans.
pub trait CorrelationIdExt {
    /// Record the correlation ID as a span field.
    fn record_correlation_id(&self, id: &CorrelationId);
}

impl CorrelationIdExt for tracing::Span {
    fn record_correlation_id(&self, id: &CorrelationId) {
        self.record("correlation_id", id.as_str());
    }
}
