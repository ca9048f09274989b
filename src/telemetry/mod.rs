// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Diagnostic event pipeline.
//!
//! - **Context**: ambient configuration, identity and correlation/span state
//! - **Tracing**: level filtering, redaction and span lifecycle
//! - **Writer**: non-blocking bounded queue drained to pluggable sinks
//! - **Profiler**: timing helpers over spans
//!
//! # Usage
//!
//! ```rust,ignore
//! use gmp_diag::telemetry::{DiagLevel, TraceManager};
//!
//! let span = trace.start_span("workorders", "close", None);
//! trace.log(DiagLevel::Info, "workorders", "closed", "Work order closed", None, None);
//! drop(span);
//! ```
//!
//! Events carry the correlation id, span ids and identity of the context at
//! the moment they are logged. Structured payloads are redacted before they
//! are queued.

mod context;
mod correlation;
mod event;
mod init;
mod probe;
mod profiler;
pub mod redact;
pub mod sinks;
pub(crate) mod trace;
mod writer;

pub use context::{DiagnosticContext, EnvLookup, Identity, RemoteSettings, SpanSnapshot};
pub use correlation::{CorrelationId, CorrelationIdExt, SpanId};
pub use event::{error_chain, DataMap, DiagLevel, DiagnosticEvent, ExceptionInfo, SignatureMeta};
pub use init::{init_logging, LogStyle, LoggingConfig, LoggingGuard};
pub use probe::{read_git_revision, HostFacts, HostProbe, StaticProbe, SystemProbe};
pub use profiler::{Profiler, TIMING_EVENT};
pub use redact::{redact, redact_connection_string, MASK};
pub use sinks::{create_sinks, LogSink, MemorySink};
pub use trace::{SpanHandle, TraceManager, SPAN_END, SPAN_START};
pub use writer::{
    in_guarded_sink, on_drain_thread, EventWriter, LogWriter, WriterOptions, WriterStats,
};
