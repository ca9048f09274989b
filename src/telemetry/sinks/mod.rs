// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Batch destinations for diagnostic events.
//!
//! Every sink implements [`LogSink`]. The writer calls sinks one after the
//! other from a blocking worker thread; an error or panic from one sink is
//! swallowed there and never reaches the others.

mod file;
mod remote;
mod sqlite;
mod stdout;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::SinkError;

use super::context::DiagnosticContext;
use super::event::{DiagLevel, DiagnosticEvent};

pub use file::{daily_log_path, today_log_path, FileSink, FILE_PREFIX};
pub use remote::{RemoteOptions, RemoteSink, BUFFER_FILE, MAX_BUFFER_BYTES};
pub use sqlite::{SqliteSink, SQLITE_FILE};
pub use stdout::StdoutSink;

/// One destination for drained batches.
pub trait LogSink: Send + Sync {
    /// Stable name used in configuration and internal logs.
    fn name(&self) -> &str;

    /// Persist or forward one batch.
    fn write_batch(&self, batch: &[DiagnosticEvent]) -> Result<(), SinkError>;
}

/// Build the sinks named by `Diagnostics:Sinks`, skipping unknown or failing ones.
pub fn create_sinks(ctx: &DiagnosticContext) -> Vec<Arc<dyn LogSink>> {
    let mut sinks: Vec<Arc<dyn LogSink>> = Vec::new();
    for name in ctx.sinks() {
        match create_sink(&name, ctx) {
            Ok(Some(sink)) => {
                debug!(sink = sink.name(), "sink configured");
                sinks.push(sink);
            }
            Ok(None) => warn!(sink = %name, "unknown sink name; skipped"),
            Err(e) => warn!(sink = %name, error = %e, "sink unavailable; skipped"),
        }
    }
    sinks
}

fn create_sink(name: &str, ctx: &DiagnosticContext) -> Result<Option<Arc<dyn LogSink>>, SinkError> {
    let log_dir = ctx.log_directory();
    let sink: Arc<dyn LogSink> = match name.to_ascii_lowercase().as_str() {
        "file" => Arc::new(FileSink::new(
            log_dir,
            ctx.rolling_max_mb(),
            ctx.rolling_max_days(),
        )?),
        "stdout" | "console" => Arc::new(StdoutSink::new()),
        "sqlite" => Arc::new(SqliteSink::open(log_dir.join(SQLITE_FILE))?),
        "remote" | "elastic" => Arc::new(RemoteSink::new(ctx.remote_settings(), log_dir)?),
        "tracing" => Arc::new(TracingSink),
        _ => return Ok(None),
    };
    Ok(Some(sink))
}

macro_rules! emit_event {
    ($level:ident, $event:expr, $corr:expr, $data:expr) => {
        tracing::$level!(
            target: "gmp_diag::events",
            cat = %$event.cat,
            evt = %$event.evt,
            corr_id = $corr,
            data = %$data,
            "{}",
            $event.msg
        )
    };
}

/// Re-emits events through `tracing` so the host's subscriber sees them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn write_batch(&self, batch: &[DiagnosticEvent]) -> Result<(), SinkError> {
        for event in batch {
            let data = event
                .data
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?
                .unwrap_or_default();
            let corr = event.corr_id.as_deref().unwrap_or("");
            match event.lvl {
                DiagLevel::Trace => emit_event!(trace, event, corr, data),
                DiagLevel::Debug => emit_event!(debug, event, corr, data),
                DiagLevel::Info => emit_event!(info, event, corr, data),
                DiagLevel::Warn => emit_event!(warn, event, corr, data),
                DiagLevel::Error | DiagLevel::Fatal => emit_event!(error, event, corr, data),
            }
        }
        Ok(())
    }
}

/// Keeps every event in memory. Useful for embedding hosts and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything received so far, in arrival order.
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().clone()
    }

    /// Events whose name matches `evt`.
    pub fn events_named(&self, evt: &str) -> Vec<DiagnosticEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.evt == evt)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl LogSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn write_batch(&self, batch: &[DiagnosticEvent]) -> Result<(), SinkError> {
        self.events.lock().extend_from_slice(batch);
        Ok(())
    }
}

/// Render a batch as newline-terminated JSON lines.
pub(crate) fn to_ndjson(batch: &[DiagnosticEvent]) -> Result<String, SinkError> {
    let mut out = String::new();
    for event in batch {
        out.push_str(&event.to_json()?);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{keys, ConfigSnapshot};
    use crate::telemetry::probe::StaticProbe;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn context(sinks: &str, dir: &TempDir) -> DiagnosticContext {
        let config = ConfigSnapshot::new()
            .with(keys::KEY_SINKS, sinks)
            .with(keys::KEY_LOG_DIRECTORY, dir.path().to_string_lossy().to_string());
        DiagnosticContext::new(config, &StaticProbe::default()).with_env_map(BTreeMap::new())
    }

    #[test]
    fn test_create_sinks_by_name() {
        let dir = TempDir::new().unwrap();
        let ctx = context("file, console, sqlite, tracing, bogus", &dir);
        let names: Vec<String> = create_sinks(&ctx)
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["file", "stdout", "sqlite", "tracing"]);
    }

    #[test]
    fn test_memory_sink_records() {
        let sink = MemorySink::new();
        let batch = vec![
            DiagnosticEvent::new(DiagLevel::Info, "a", "one", "1"),
            DiagnosticEvent::new(DiagLevel::Warn, "a", "two", "2"),
        ];
        sink.write_batch(&batch).unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.events_named("two").len(), 1);
    }

    #[test]
    fn test_to_ndjson_lines() {
        let batch = vec![
            DiagnosticEvent::new(DiagLevel::Info, "a", "one", "1"),
            DiagnosticEvent::new(DiagLevel::Info, "a", "two", "2"),
        ];
        let text = to_ndjson(&batch).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_tracing_sink_accepts_all_levels() {
        let batch: Vec<_> = [
            DiagLevel::Trace,
            DiagLevel::Debug,
            DiagLevel::Info,
            DiagLevel::Warn,
            DiagLevel::Error,
            DiagLevel::Fatal,
        ]
        .into_iter()
        .map(|lvl| DiagnosticEvent::new(lvl, "a", "b", "c"))
        .collect();
        assert!(TracingSink.write_batch(&batch).is_ok());
    }
}
