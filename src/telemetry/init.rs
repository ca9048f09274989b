// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process logging setup for the pipeline's own internal messages.
//!
//! Diagnostic events go through the [`LogWriter`](super::LogWriter); this
//! subscriber only receives the `tracing` output of the pipeline itself
//! (sink failures, shadow replay errors) and the optional `tracing` sink.
//! Output always goes to stderr so stdout stays free for JSON lines.

use std::io::{self, IsTerminal, Write};

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use super::context::DiagnosticContext;
use super::event::DiagLevel;

/// Line layout of the process log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStyle {
    /// One short line per message.
    Compact,
    /// Multi-field lines with span context.
    Full,
}

/// Options for [`init_logging`].
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level for this crate when `RUST_LOG` is unset. Dependencies stay at warn.
    pub level: Level,

    pub style: LogStyle,

    /// Emit span enter/close lines.
    pub span_events: bool,

    pub source_location: bool,

    pub ansi: bool,

    /// Explicit filter directive; wins over `RUST_LOG`.
    pub directive: Option<String>,
}

impl Default for LoggingConfig {
    /// Warnings only, colored when stderr is a terminal.
    fn default() -> Self {
        Self {
            level: Level::WARN,
            style: LogStyle::Compact,
            span_events: false,
            source_location: false,
            ansi: io::stderr().is_terminal(),
            directive: None,
        }
    }
}

impl LoggingConfig {
    /// Debug output with span lifecycle and source locations.
    pub fn verbose() -> Self {
        Self {
            level: Level::DEBUG,
            style: LogStyle::Full,
            span_events: true,
            source_location: true,
            ..Self::default()
        }
    }

    /// Follow `Diagnostics:Level` so process logs match the event threshold.
    pub fn from_context(ctx: &DiagnosticContext) -> Self {
        Self::default().with_diag_level(ctx.min_level())
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Use the closest `tracing` level to a diagnostic level.
    pub fn with_diag_level(self, level: DiagLevel) -> Self {
        self.with_level(level.to_tracing())
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = Some(directive.into());
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Directive used when neither an explicit one nor `RUST_LOG` is given.
    pub fn default_directive(&self) -> String {
        format!("warn,gmp_diag={}", self.level.to_string().to_ascii_lowercase())
    }

    fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.default_directive());
        match &self.directive {
            Some(directive) => EnvFilter::try_new(directive).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let span_events = if self.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = fmt::layer()
            .with_writer(io::stderr)
            .with_ansi(self.ansi)
            .with_file(self.source_location)
            .with_line_number(self.source_location)
            .with_span_events(span_events);
        match self.style {
            LogStyle::Compact => layer.compact().boxed(),
            LogStyle::Full => layer.with_thread_names(true).boxed(),
        }
    }
}

/// Flushes stderr when dropped.
///
/// Keep it alive for the lifetime of the program.
pub struct LoggingGuard {
    _private: (),
}

impl Drop for LoggingGuard {
    fn drop(&mut self) {
        let _ = io::stderr().flush();
    }
}

/// Install the global `tracing` subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> io::Result<LoggingGuard> {
    tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(config.env_filter())
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))?;
    Ok(LoggingGuard { _private: () })
}
