// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! gmp-diag - telemetry and write verification for GMP compliance applications.
//!
//! Business and data-access code logs structured events and opens spans
//! through a small tracing façade. Events are stamped with the ambient
//! correlation, span and identity state, redacted, and queued without
//! blocking; one background task drains the queue to the configured sinks.
//! Database calls are timed and sampled, repeated query shapes are flagged,
//! and in development builds writes can be replayed against a shadow store
//! and verified row by row.
//!
//! # Architecture
//!
//! - [`config`] - Configuration files, keys and environment overrides
//! - [`error`] - Error types and result aliases
//! - [`telemetry`] - Context, events, redaction, writer, sinks, spans and timing
//! - [`db`] - Instrumented execution, slow-query registry and shadow replay
//! - [`crash`] - Crash bundles and the process panic hook
//! - [`selftest`] - Database self-tests run after boot
//!
//! # Example
//!
//! ```rust,ignore
//! use gmp_diag::{config, Diagnostics};
//! use gmp_diag::telemetry::DiagLevel;
//!
//! let diagnostics = Diagnostics::start(config::load_config()?);
//! diagnostics.register_crash_handler();
//!
//! let span = diagnostics.trace().start_span("workorders", "close", None);
//! diagnostics.trace().log(DiagLevel::Info, "workorders", "closed", "Closed", None, None);
//! drop(span);
//!
//! diagnostics.shutdown().await;
//! ```

pub mod config;
pub mod crash;
pub mod db;
mod diagnostics;
pub mod error;
pub mod selftest;
pub mod telemetry;

pub use crash::CrashHandler;
pub use diagnostics::{Diagnostics, BOOT_EVENT};
pub use error::{ConfigError, CrashError, DbError, Result, SinkError};
pub use selftest::{SelfTestReport, SelfTestRunner};
pub use telemetry::{DataMap, DiagLevel, DiagnosticContext, DiagnosticEvent, TraceManager};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
