// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Daily rolling JSON-lines file sink.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::SinkError;
use crate::telemetry::event::DiagnosticEvent;

use super::{to_ndjson, LogSink};

/// File name prefix for daily logs.
pub const FILE_PREFIX: &str = "diag-";
const FILE_EXT: &str = "log";
const DATE_FORMAT: &str = "%Y%m%d";

/// Writes one `diag-YYYYMMDD.log` per UTC day, rotating by size and pruning by age.
#[derive(Debug)]
pub struct FileSink {
    dir: PathBuf,
    /// Rotation threshold in bytes; 0 disables rotation.
    max_bytes: u64,
    /// Retention in days; 0 keeps files forever.
    max_days: u64,
    current_day: Mutex<NaiveDate>,
}

impl FileSink {
    /// Create the sink, creating `dir` and pruning expired files.
    pub fn new(dir: impl Into<PathBuf>, max_mb: u64, max_days: u64) -> Result<Self, SinkError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let today = Utc::now().date_naive();
        let sink = Self {
            dir,
            max_bytes: max_mb.saturating_mul(1024 * 1024),
            max_days,
            current_day: Mutex::new(today),
        };
        sink.prune(today);
        Ok(sink)
    }

    /// Directory the sink writes to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file currently being written.
    pub fn current_path(&self) -> PathBuf {
        daily_log_path(&self.dir, *self.current_day.lock())
    }

    fn rotate(&self, path: &Path, day: NaiveDate) -> Result<(), SinkError> {
        let stem = format!("{}{}", FILE_PREFIX, day.format(DATE_FORMAT));
        let mut n = 1;
        let target = loop {
            let candidate = self.dir.join(format!("{}.{}.{}", stem, n, FILE_EXT));
            if !candidate.exists() {
                break candidate;
            }
            n += 1;
        };
        fs::rename(path, &target)?;
        debug!(file = %target.display(), "rotated diagnostic log");
        Ok(())
    }

    fn prune(&self, today: NaiveDate) {
        if self.max_days == 0 {
            return;
        }
        let cutoff = today - ChronoDuration::days(self.max_days as i64);
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(date) = name.to_str().and_then(parse_log_date) else {
                continue;
            };
            if date < cutoff {
                if let Err(e) = fs::remove_file(entry.path()) {
                    debug!(file = ?name, error = %e, "failed to prune diagnostic log");
                }
            }
        }
    }
}

impl LogSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn write_batch(&self, batch: &[DiagnosticEvent]) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let today = Utc::now().date_naive();
        let mut day = self.current_day.lock();
        if *day != today {
            *day = today;
            self.prune(today);
        }

        let path = daily_log_path(&self.dir, today);
        if self.max_bytes > 0 {
            if let Ok(meta) = fs::metadata(&path) {
                if meta.len() >= self.max_bytes {
                    self.rotate(&path, today)?;
                }
            }
        }

        let text = to_ndjson(batch)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(text.as_bytes())?;
        Ok(())
    }
}

/// `dir/diag-YYYYMMDD.log` for `date`.
pub fn daily_log_path(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!(
        "{}{}.{}",
        FILE_PREFIX,
        date.format(DATE_FORMAT),
        FILE_EXT
    ))
}

/// Today's (UTC) log file under `dir`.
pub fn today_log_path(dir: &Path) -> PathBuf {
    daily_log_path(dir, Utc::now().date_naive())
}

/// Date embedded in `diag-YYYYMMDD[.N].log`.
fn parse_log_date(name: &str) -> Option<NaiveDate> {
    let rest = name.strip_prefix(FILE_PREFIX)?;
    if !rest.ends_with(FILE_EXT) {
        return None;
    }
    let date = rest.get(..8)?;
    NaiveDate::parse_from_str(date, DATE_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::event::DiagLevel;
    use tempfile::TempDir;

    fn batch(n: usize) -> Vec<DiagnosticEvent> {
        (0..n)
            .map(|i| DiagnosticEvent::new(DiagLevel::Info, "test", format!("evt{}", i), "m"))
            .collect()
    }

    #[test]
    fn test_writes_json_lines() {
        let temp = TempDir::new().unwrap();
        let sink = FileSink::new(temp.path(), 10, 7).unwrap();
        sink.write_batch(&batch(3)).unwrap();

        let text = fs::read_to_string(today_log_path(temp.path())).unwrap();
        assert_eq!(text.lines().count(), 3);
        let first: DiagnosticEvent = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first.evt, "evt0");
    }

    #[test]
    fn test_rotates_when_over_size() {
        let temp = TempDir::new().unwrap();
        let sink = FileSink::new(temp.path(), 1, 7).unwrap();
        let path = sink.current_path();
        fs::write(&path, vec![b'x'; 1024 * 1024]).unwrap();

        sink.write_batch(&batch(1)).unwrap();

        let day = Utc::now().date_naive().format(DATE_FORMAT).to_string();
        let rotated = temp.path().join(format!("diag-{}.1.log", day));
        assert!(rotated.exists());
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_prunes_expired_files() {
        let temp = TempDir::new().unwrap();
        let old = temp.path().join("diag-20000101.log");
        let old_rotated = temp.path().join("diag-20000101.2.log");
        let unrelated = temp.path().join("notes.txt");
        fs::write(&old, "x").unwrap();
        fs::write(&old_rotated, "x").unwrap();
        fs::write(&unrelated, "x").unwrap();

        let _sink = FileSink::new(temp.path(), 10, 7).unwrap();
        assert!(!old.exists());
        assert!(!old_rotated.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn test_parse_log_date() {
        assert_eq!(
            parse_log_date("diag-20240315.log"),
            NaiveDate::from_ymd_opt(2024, 3, 15)
        );
        assert!(parse_log_date("diag-20240315.3.log").is_some());
        assert!(parse_log_date("diag-bad.log").is_none());
        assert!(parse_log_date("other-20240315.log").is_none());
    }
}
