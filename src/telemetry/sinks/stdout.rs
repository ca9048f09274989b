// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! JSON-lines sink on standard output.

use std::io::{self, Write};

use crate::error::SinkError;
use crate::telemetry::event::DiagnosticEvent;

use super::{to_ndjson, LogSink};

/// Writes each event as one JSON line to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self {
        Self
    }
}

impl LogSink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    fn write_batch(&self, batch: &[DiagnosticEvent]) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let text = to_ndjson(batch)?;
        let mut out = io::stdout().lock();
        out.write_all(text.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}
