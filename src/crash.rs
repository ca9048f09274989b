// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Crash bundles.
//!
//! On a fatal fault the handler logs a `crash` event and writes a
//! `crash-<timestamp>.tar.gz` into the crash directory containing:
//!
//! - `crash.json`: reason, exception and the ambient context
//! - `breadcrumbs.json`: tail of today's diagnostic log, when present
//! - `recent_sql.json`: slow-query registry snapshot
//! - `health.json`: writer counters, process and host facts
//! - the primary configuration file, when one was loaded
//!
//! Each artifact is produced independently; one failing does not stop the
//! others. Panics in any thread (including Tokio tasks) reach the handler
//! through the process panic hook, except panics inside a sink call, which
//! the log writer contains.

use std::fs::{self, File};
use std::io::Write;
use std::panic::PanicHookInfo;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::db::DbTelemetry;
use crate::error::CrashError;
use crate::telemetry::sinks::today_log_path;
use crate::telemetry::{
    in_guarded_sink, on_drain_thread, DiagLevel, ExceptionInfo, LogWriter, TraceManager,
};

/// Lines of today's log kept as breadcrumbs.
pub const BREADCRUMB_LINES: usize = 500;
/// Event name logged when a crash is handled.
pub const CRASH_EVENT: &str = "crash";
const FLUSH_BEFORE_BUNDLE: Duration = Duration::from_secs(1);

/// Writes crash bundles and owns the process panic hook.
pub struct CrashHandler {
    trace: TraceManager,
    telemetry: Arc<DbTelemetry>,
    writer: Option<Arc<LogWriter>>,
    crash_dir: PathBuf,
    log_dir: PathBuf,
    started: Instant,
    in_progress: AtomicBool,
}

/// Clears the reentrancy flag when the bundle is done.
struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Serialize)]
struct CrashSummary<'a> {
    ts_utc: String,
    reason: &'a str,
    ex_type: &'a str,
    ex_msg: &'a str,
    stack: &'a str,
    corr_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    user_id: Option<i64>,
    username: Option<String>,
    role_ids: Option<String>,
    session_id: Option<String>,
    ip: Option<String>,
    app_ver: Option<&'a str>,
    os_ver: Option<&'a str>,
    device: Option<&'a str>,
    git_commit: Option<&'a str>,
    db_schema_hash: Option<String>,
}

impl CrashHandler {
    /// Handler writing into the crash and log directories of the trace context.
    pub fn new(trace: TraceManager, telemetry: Arc<DbTelemetry>) -> Self {
        let ctx = trace.context();
        let crash_dir = ctx.crash_directory();
        let log_dir = ctx.log_directory();
        Self {
            trace,
            telemetry,
            writer: None,
            crash_dir,
            log_dir,
            started: Instant::now(),
            in_progress: AtomicBool::new(false),
        }
    }

    /// Report queue counters from `writer` in `health.json`.
    pub fn with_writer(mut self, writer: Arc<LogWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_crash_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.crash_dir = dir.into();
        self
    }

    pub fn crash_dir(&self) -> &Path {
        &self.crash_dir
    }

    /// Install a panic hook that writes a bundle, then runs the previous hook.
    ///
    /// Panics raised inside a sink call are left to the writer, which
    /// contains them.
    pub fn register_global(self: &Arc<Self>) {
        let handler = Arc::clone(self);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if !in_guarded_sink() {
                let exception = panic_exception(info);
                handler.handle("unhandled panic", &exception);
            }
            previous(info);
        }));
    }

    /// Log the fault and write a bundle. Never fails; returns the bundle path
    /// when one was written.
    pub fn handle(&self, reason: &str, exception: &ExceptionInfo) -> Option<PathBuf> {
        self.trace.log(
            DiagLevel::Fatal,
            "crash",
            CRASH_EVENT,
            reason,
            Some(exception.clone()),
            None,
        );
        if !on_drain_thread() {
            self.trace.flush(Some(FLUSH_BEFORE_BUNDLE));
        }

        match self.report(reason, exception) {
            Ok(path) => Some(path),
            Err(CrashError::Reentrant) => None,
            Err(e) => {
                warn!(error = %e, "crash bundle could not be written");
                None
            }
        }
    }

    /// Write the bundle without logging anything.
    pub fn report(&self, reason: &str, exception: &ExceptionInfo) -> Result<PathBuf, CrashError> {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            return Err(CrashError::Reentrant);
        }
        let _guard = InProgress(&self.in_progress);

        let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
        push_artifact(&mut entries, "crash.json", || self.crash_json(reason, exception));
        push_artifact(&mut entries, "breadcrumbs.json", || self.breadcrumbs_json());
        push_artifact(&mut entries, "recent_sql.json", || self.recent_sql_json());
        push_artifact(&mut entries, "health.json", || self.health_json());
        if let Some((name, bytes)) = self.config_copy() {
            entries.push((name, bytes));
        }

        fs::create_dir_all(&self.crash_dir)?;
        let path = self.crash_dir.join(format!(
            "crash-{}-{}.tar.gz",
            Utc::now().format("%Y%m%d-%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        ));
        write_archive(&path, &entries)?;
        debug!(path = %path.display(), entries = entries.len(), "crash bundle written");
        Ok(path)
    }

    fn crash_json(
        &self,
        reason: &str,
        exception: &ExceptionInfo,
    ) -> Result<Option<Vec<u8>>, CrashError> {
        let ctx = self.trace.context();
        let span = ctx.span_snapshot();
        let identity = ctx.identity();
        let summary = CrashSummary {
            ts_utc: Utc::now().to_rfc3339(),
            reason,
            ex_type: &exception.type_name,
            ex_msg: &exception.message,
            stack: &exception.trace,
            corr_id: span.correlation_id.to_string(),
            span_id: span.span_id.to_string(),
            parent_span_id: span.parent_span_id.map(|p| p.to_string()),
            role_ids: identity.roles_csv(),
            user_id: identity.user_id,
            username: identity.username,
            session_id: identity.session_id,
            ip: identity.ip,
            app_ver: ctx.app_version(),
            os_ver: ctx.os_version(),
            device: ctx.device(),
            git_commit: ctx.source_revision(),
            db_schema_hash: ctx.schema_fingerprint(),
        };
        Ok(Some(serde_json::to_vec_pretty(&summary)?))
    }

    fn breadcrumbs_json(&self) -> Result<Option<Vec<u8>>, CrashError> {
        let path = today_log_path(&self.log_dir);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(BREADCRUMB_LINES);
        let crumbs: Vec<Value> = lines[start..]
            .iter()
            .map(|line| {
                serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string()))
            })
            .collect();
        let body = json!({
            "source": path.display().to_string(),
            "events": crumbs,
        });
        Ok(Some(serde_json::to_vec_pretty(&body)?))
    }

    fn recent_sql_json(&self) -> Result<Option<Vec<u8>>, CrashError> {
        let snapshot = self.telemetry.registry().snapshot();
        Ok(Some(serde_json::to_vec_pretty(&snapshot)?))
    }

    fn health_json(&self) -> Result<Option<Vec<u8>>, CrashError> {
        let ctx = self.trace.context();
        let writer = self.writer.as_ref().map(|w| {
            json!({
                "stats": w.stats(),
                "sinks": w.sink_names(),
                "running": w.is_running(),
            })
        });
        let body = json!({
            "ts_utc": Utc::now().to_rfc3339(),
            "pid": std::process::id(),
            "uptime_secs": self.started.elapsed().as_secs(),
            "host": ctx.facts(),
            "build_profile": self.telemetry.profile(),
            "tracing_enabled": self.trace.enabled(),
            "min_level": self.trace.min_level(),
            "writer": writer,
        });
        Ok(Some(serde_json::to_vec_pretty(&body)?))
    }

    fn config_copy(&self) -> Option<(String, Vec<u8>)> {
        let source = self.trace.context().config().primary_source()?;
        let name = source.file_name()?.to_string_lossy().to_string();
        match fs::read(source) {
            Ok(bytes) => Some((name, bytes)),
            Err(e) => {
                warn!(
                    error = %e,
                    path = %source.display(),
                    "config file not copied into crash bundle"
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for CrashHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashHandler")
            .field("crash_dir", &self.crash_dir)
            .field("log_dir", &self.log_dir)
            .finish()
    }
}

fn push_artifact(
    entries: &mut Vec<(String, Vec<u8>)>,
    name: &str,
    produce: impl FnOnce() -> Result<Option<Vec<u8>>, CrashError>,
) {
    match produce() {
        Ok(Some(bytes)) => entries.push((name.to_string(), bytes)),
        Ok(None) => {}
        Err(e) => warn!(artifact = name, error = %e, "crash artifact skipped"),
    }
}

fn write_archive(path: &Path, entries: &[(String, Vec<u8>)]) -> Result<(), CrashError> {
    let file = File::create(path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut tar = tar::Builder::new(encoder);
    for (name, bytes) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(Utc::now().timestamp().max(0) as u64);
        header.set_cksum();
        tar.append_data(&mut header, name, bytes.as_slice())?;
    }
    let mut encoder = tar.into_inner()?;
    encoder.flush()?;
    encoder.finish()?;
    Ok(())
}

/// Describe a panic as exception info.
pub fn panic_exception(info: &PanicHookInfo<'_>) -> ExceptionInfo {
    let payload = info.payload();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with non-string payload".to_string());
    let location = info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_default();
    let backtrace = std::backtrace::Backtrace::capture();
    let thread = std::thread::current();
    ExceptionInfo::new("panic", message.clone()).with_trace(format!(
        "thread '{}' panicked at {}:\n{}\n{}",
        thread.name().unwrap_or("<unnamed>"),
        location,
        message,
        backtrace
    ))
}
