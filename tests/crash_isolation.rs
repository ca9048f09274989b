// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process panic hook behavior. Kept in its own test binary because the hook
//! is process-global.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use gmp_diag::config::{keys, ConfigSnapshot};
use gmp_diag::crash::CRASH_EVENT;
use gmp_diag::db::BuildProfile;
use gmp_diag::telemetry::{LogSink, MemorySink, StaticProbe};
use gmp_diag::{DiagLevel, DiagnosticContext, DiagnosticEvent, Diagnostics, SinkError};

struct PanickingSink;

impl LogSink for PanickingSink {
    fn name(&self) -> &str {
        "panicking"
    }

    fn write_batch(&self, _batch: &[DiagnosticEvent]) -> Result<(), SinkError> {
        panic!("sink bug");
    }
}

fn bundles(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.file_name().to_string_lossy().ends_with(".tar.gz"))
                .count()
        })
        .unwrap_or(0)
}

#[test]
fn test_panic_hook_ignores_contained_sink_panics() {
    let temp = TempDir::new().unwrap();
    let crash_dir = temp.path().join("crash");
    let config = ConfigSnapshot::new()
        .with(keys::KEY_CRASH_DIRECTORY, crash_dir.to_string_lossy().to_string())
        .with(keys::KEY_LOG_DIRECTORY, temp.path().join("logs").to_string_lossy().to_string());
    let context =
        DiagnosticContext::new(config, &StaticProbe::default()).with_env_map(BTreeMap::new());
    let memory = Arc::new(MemorySink::new());
    let diagnostics = Diagnostics::with_sinks(
        context,
        vec![Arc::new(PanickingSink), memory.clone()],
        BuildProfile::Development,
    );
    diagnostics.register_crash_handler();

    diagnostics
        .trace()
        .log(DiagLevel::Warn, "app", "disk_low", "Disk low", None, None);
    let start = Instant::now();
    assert!(diagnostics.writer().drain_once(true) >= 1);
    assert!(start.elapsed() < Duration::from_millis(500));

    assert_eq!(memory.events_named("disk_low").len(), 1);
    assert!(memory.events_named(CRASH_EVENT).is_empty());
    assert_eq!(bundles(&crash_dir), 0);

    // A panic outside any sink call is still a crash.
    let caught = std::panic::catch_unwind(|| panic!("real fault"));
    assert!(caught.is_err());
    assert_eq!(bundles(&crash_dir), 1);

    diagnostics.writer().drain_once(true);
    assert_eq!(memory.events_named(CRASH_EVENT).len(), 1);
}
