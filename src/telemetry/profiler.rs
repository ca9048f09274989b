// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Timing helpers over [`TraceManager`] spans.

use std::future::Future;
use std::time::Instant;

use serde_json::json;

use super::event::{DataMap, DiagLevel};
use super::trace::{SpanHandle, TraceManager};

/// Event name of the timing record.
pub const TIMING_EVENT: &str = "timing";

/// Thin convenience wrapper for timing operations.
#[derive(Debug, Clone)]
pub struct Profiler {
    trace: TraceManager,
}

impl Profiler {
    pub fn new(trace: TraceManager) -> Self {
        Self { trace }
    }

    pub fn trace(&self) -> &TraceManager {
        &self.trace
    }

    /// Open a span; same as [`TraceManager::start_span`].
    pub fn span(&self, category: &str, name: &str, data: Option<DataMap>) -> SpanHandle {
        self.trace.start_span(category, name, data)
    }

    /// Time a synchronous closure.
    pub fn time<T>(
        &self,
        category: &str,
        name: &str,
        data: Option<DataMap>,
        op: impl FnOnce() -> T,
    ) -> T {
        let mut guard = TimingGuard::start(self, category, name, data);
        let value = op();
        guard.outcome = Outcome::Ok;
        value
    }

    /// Time a future that cannot fail.
    ///
    /// The `timing` event is logged even if the future panics or is dropped
    /// before completion.
    pub async fn time_async<T, F>(
        &self,
        category: &str,
        name: &str,
        data: Option<DataMap>,
        op: F,
    ) -> T
    where
        F: Future<Output = T>,
    {
        let mut guard = TimingGuard::start(self, category, name, data);
        let value = op.await;
        guard.outcome = Outcome::Ok;
        value
    }

    /// Time a fallible future; the result is returned unchanged.
    pub async fn time_async_fallible<T, E, F>(
        &self,
        category: &str,
        name: &str,
        data: Option<DataMap>,
        op: F,
    ) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let mut guard = TimingGuard::start(self, category, name, data);
        let result = op.await;
        guard.outcome = if result.is_ok() {
            Outcome::Ok
        } else {
            Outcome::Error
        };
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ok,
    Error,
    /// Panicked or dropped before finishing.
    Aborted,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Aborted => "aborted",
        }
    }
}

/// Logs `timing` and closes the span when dropped.
struct TimingGuard {
    trace: TraceManager,
    category: String,
    name: String,
    started: Instant,
    outcome: Outcome,
    span: SpanHandle,
}

impl TimingGuard {
    fn start(profiler: &Profiler, category: &str, name: &str, data: Option<DataMap>) -> Self {
        let span = profiler.span(category, name, data);
        Self {
            trace: profiler.trace.clone(),
            category: category.to_string(),
            name: name.to_string(),
            started: Instant::now(),
            outcome: Outcome::Aborted,
            span,
        }
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        let mut data = DataMap::new();
        data.insert("name".to_string(), json!(self.name));
        data.insert(
            "elapsed_ms".to_string(),
            json!(self.started.elapsed().as_millis() as u64),
        );
        data.insert("outcome".to_string(), json!(self.outcome.as_str()));
        self.trace.log(
            DiagLevel::Debug,
            &self.category,
            TIMING_EVENT,
            &self.name,
            None,
            Some(data),
        );
        self.span.end();
    }
}
