// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The tracing facade.
//!
//! Filters by level, stamps events with the ambient context, redacts
//! payloads, and hands the result to an [`EventWriter`].

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use super::context::DiagnosticContext;
use super::correlation::{CorrelationId, SpanId};
use super::event::{DataMap, DiagLevel, DiagnosticEvent, ExceptionInfo, SignatureMeta};
use super::redact::redact;
use super::writer::EventWriter;

/// Event name logged when a span opens.
pub const SPAN_START: &str = "span_start";
/// Event name logged when a span closes.
pub const SPAN_END: &str = "span_end";

struct Inner {
    ctx: Arc<DiagnosticContext>,
    writer: Arc<dyn EventWriter>,
    enabled: AtomicBool,
    min_level: AtomicU8,
    redaction: AtomicBool,
}

/// Cheap-to-clone handle to the tracing pipeline.
///
/// The enable flag, minimum level and redaction toggle are read from the
/// context once at construction; call [`reload_settings`](Self::reload_settings)
/// to pick up changes.
#[derive(Clone)]
pub struct TraceManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TraceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceManager")
            .field("enabled", &self.enabled())
            .field("min_level", &self.min_level())
            .finish_non_exhaustive()
    }
}

impl TraceManager {
    pub fn new(ctx: Arc<DiagnosticContext>, writer: Arc<dyn EventWriter>) -> Self {
        let manager = Self {
            inner: Arc::new(Inner {
                ctx,
                writer,
                enabled: AtomicBool::new(true),
                min_level: AtomicU8::new(level_to_u8(DiagLevel::Info)),
                redaction: AtomicBool::new(true),
            }),
        };
        manager.reload_settings();
        manager
    }

    /// Re-read the enable flag, minimum level and redaction toggle.
    pub fn reload_settings(&self) {
        let ctx = &self.inner.ctx;
        self.inner.enabled.store(ctx.enabled(), Ordering::Release);
        self.inner
            .min_level
            .store(level_to_u8(ctx.min_level()), Ordering::Release);
        self.inner
            .redaction
            .store(ctx.redaction_enabled(), Ordering::Release);
    }

    pub fn context(&self) -> &Arc<DiagnosticContext> {
        &self.inner.ctx
    }

    pub fn writer(&self) -> &Arc<dyn EventWriter> {
        &self.inner.writer
    }

    pub fn enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn min_level(&self) -> DiagLevel {
        level_from_u8(self.inner.min_level.load(Ordering::Acquire))
    }

    /// Whether an event at `level` would be recorded.
    pub fn is_enabled(&self, level: DiagLevel) -> bool {
        self.enabled() && level >= self.min_level()
    }

    pub fn current_correlation_id(&self) -> CorrelationId {
        self.inner.ctx.correlation_id()
    }

    pub fn current_span_id(&self) -> SpanId {
        self.inner.ctx.span_id()
    }

    /// Record one event.
    pub fn log(
        &self,
        level: DiagLevel,
        category: &str,
        event: &str,
        message: &str,
        exception: Option<ExceptionInfo>,
        data: Option<DataMap>,
    ) {
        self.emit(level, category, event, message, exception, data, None);
    }

    /// Record an event carrying e-signature metadata.
    pub fn log_signed(
        &self,
        level: DiagLevel,
        category: &str,
        event: &str,
        message: &str,
        data: Option<DataMap>,
        signature: SignatureMeta,
    ) {
        self.emit(level, category, event, message, None, data, Some(signature));
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        level: DiagLevel,
        category: &str,
        event: &str,
        message: &str,
        exception: Option<ExceptionInfo>,
        data: Option<DataMap>,
        signature: Option<SignatureMeta>,
    ) {
        if !self.is_enabled(level) {
            return;
        }
        let redaction = self.inner.redaction.load(Ordering::Acquire);
        let data = data.map(|d| redact(d, redaction));

        let mut record = self
            .stamp(DiagnosticEvent::new(level, category, event, message))
            .with_exception(exception)
            .with_data(data);
        if let Some(signature) = signature {
            record = record.with_signature(signature);
        }
        self.inner.writer.enqueue(record);
    }

    fn stamp(&self, mut event: DiagnosticEvent) -> DiagnosticEvent {
        let ctx = &self.inner.ctx;
        let span = ctx.span_snapshot();
        event.corr_id = Some(span.correlation_id.into());
        event.span_id = Some(span.span_id.to_string());
        event.parent_span_id = span.parent_span_id.map(|p| p.to_string());

        let identity = ctx.identity();
        event.role_ids = identity.roles_csv();
        event.user_id = identity.user_id;
        event.username = identity.username;
        event.ip = identity.ip;
        event.session_id = identity.session_id;

        event.device = ctx.device().map(str::to_string);
        event.os_ver = ctx.os_version().map(str::to_string);
        event.app_ver = ctx.app_version().map(str::to_string);
        event.git_commit = ctx.source_revision().map(str::to_string);
        event.db_schema_hash = ctx.schema_fingerprint();
        event
    }

    /// Open a span. Returns a no-op handle when tracing is disabled.
    ///
    /// Spans nest correctly only when handles are ended in reverse order of
    /// creation on one call chain.
    pub fn start_span(&self, category: &str, name: &str, data: Option<DataMap>) -> SpanHandle {
        if !self.enabled() {
            return SpanHandle::noop();
        }
        let parent = self.inner.ctx.push_span();

        let mut start_data = data.unwrap_or_default();
        start_data.insert("name".to_string(), json!(name));
        self.log(DiagLevel::Debug, category, SPAN_START, name, None, Some(start_data));

        SpanHandle {
            active: Some(ActiveSpan {
                manager: self.clone(),
                category: category.to_string(),
                name: name.to_string(),
                parent,
                started: Instant::now(),
            }),
        }
    }

    /// Block until queued events are delivered or `timeout` elapses.
    pub fn flush(&self, timeout: Option<Duration>) {
        self.inner.writer.flush(timeout);
    }
}

struct ActiveSpan {
    manager: TraceManager,
    category: String,
    name: String,
    parent: SpanId,
    started: Instant,
}

/// Disposable span. Ending is idempotent and also happens on drop.
#[must_use = "a span ends as soon as its handle is dropped"]
pub struct SpanHandle {
    active: Option<ActiveSpan>,
}

impl SpanHandle {
    /// A handle that does nothing.
    pub fn noop() -> Self {
        Self { active: None }
    }

    /// Whether the span is still open.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Time since the span opened, if still open.
    pub fn elapsed(&self) -> Option<Duration> {
        self.active.as_ref().map(|a| a.started.elapsed())
    }

    /// Close the span: log `span_end` and restore the parent.
    ///
    /// Returns the span's duration on the first call, `None` afterwards.
    pub fn end(&mut self) -> Option<Duration> {
        let active = self.active.take()?;
        let elapsed = active.started.elapsed();
        let mut data = DataMap::new();
        data.insert("name".to_string(), json!(active.name));
        data.insert("elapsed_ms".to_string(), json!(elapsed.as_millis() as u64));
        active.manager.log(
            DiagLevel::Debug,
            &active.category,
            SPAN_END,
            &active.name,
            None,
            Some(data),
        );
        active.manager.inner.ctx.pop_span(Some(active.parent));
        Some(elapsed)
    }
}

impl Drop for SpanHandle {
    fn drop(&mut self) {
        self.end();
    }
}

impl std::fmt::Debug for SpanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanHandle")
            .field("name", &self.active.as_ref().map(|a| a.name.as_str()))
            .finish()
    }
}

fn level_to_u8(level: DiagLevel) -> u8 {
    match level {
        DiagLevel::Trace => 0,
        DiagLevel::Debug => 1,
        DiagLevel::Info => 2,
        DiagLevel::Warn => 3,
        DiagLevel::Error => 4,
        DiagLevel::Fatal => 5,
    }
}

fn level_from_u8(value: u8) -> DiagLevel {
    match value {
        0 => DiagLevel::Trace,
        1 => DiagLevel::Debug,
        2 => DiagLevel::Info,
        3 => DiagLevel::Warn,
        4 => DiagLevel::Error,
        _ => DiagLevel::Fatal,
    }
}
