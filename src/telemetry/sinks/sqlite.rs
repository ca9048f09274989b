// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Embedded SQLite event store.
//!
//! Handles schema creation and one transaction per batch.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::error::SinkError;
use crate::telemetry::event::DiagnosticEvent;

use super::LogSink;

/// File name of the embedded store inside the log directory.
pub const SQLITE_FILE: &str = "diagnostics.db";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS diag_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_utc TEXT NOT NULL,
    lvl TEXT NOT NULL,
    cat TEXT NOT NULL,
    evt TEXT NOT NULL,
    msg TEXT NOT NULL,
    corr_id TEXT,
    span_id TEXT,
    parent_span_id TEXT,
    user_id INTEGER,
    username TEXT,
    ex_type TEXT,
    ex_msg TEXT,
    data_json TEXT,
    event_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_diag_events_ts ON diag_events(ts_utc);
CREATE INDEX IF NOT EXISTS idx_diag_events_corr ON diag_events(corr_id);
"#;

/// Appends every event to the `diag_events` table.
pub struct SqliteSink {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteSink {
    /// Open or create the store at `db_path`.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// Get the database file path.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Number of stored events.
    pub fn count(&self) -> Result<i64, SinkError> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM diag_events", [], |row| row.get(0))?)
    }
}

impl LogSink for SqliteSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn write_batch(&self, batch: &[DiagnosticEvent]) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO diag_events
                 (ts_utc, lvl, cat, evt, msg, corr_id, span_id, parent_span_id,
                  user_id, username, ex_type, ex_msg, data_json, event_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )?;
            for event in batch {
                let data_json = event
                    .data
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                stmt.execute(params![
                    event.ts_utc.to_rfc3339(),
                    event.lvl.as_str(),
                    event.cat,
                    event.evt,
                    event.msg,
                    event.corr_id,
                    event.span_id,
                    event.parent_span_id,
                    event.user_id,
                    event.username,
                    event.ex_type,
                    event.ex_msg,
                    data_json,
                    event.to_json()?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_map;
    use crate::telemetry::event::DiagLevel;
    use tempfile::TempDir;

    #[test]
    fn test_batch_persisted() {
        let temp = TempDir::new().unwrap();
        let sink = SqliteSink::open(temp.path().join("logs").join(SQLITE_FILE)).unwrap();

        let batch = vec![
            DiagnosticEvent::new(DiagLevel::Info, "sql", "exec_select", "OK")
                .with_data(Some(data_map! { "rows" => 2 })),
            DiagnosticEvent::new(DiagLevel::Warn, "sql", "exec_nonquery", "OK"),
        ];
        sink.write_batch(&batch).unwrap();
        sink.write_batch(&batch[..1]).unwrap();
        assert_eq!(sink.count().unwrap(), 3);

        let conn = sink.conn.lock();
        let data: Option<String> = conn
            .query_row(
                "SELECT data_json FROM diag_events WHERE evt = 'exec_select' LIMIT 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(data.as_deref(), Some(r#"{"rows":2}"#));
    }
}
