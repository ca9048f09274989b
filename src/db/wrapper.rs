// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Instrumented statement execution.
//!
//! Every call is timed and fed into the slow-query registry and the
//! repeated-query detector. A structured `sql` event is logged when the call
//! is sampled or crosses the slow threshold. Execution errors are logged as
//! the `_error` variant and returned to the caller unchanged.

use std::sync::Arc;
use std::time::Instant;

use rusqlite::types::Value;
use rusqlite::Connection;
use serde_json::Value as JsonValue;

use super::connection::TrackedConnection;
use super::params::{bind_params, masked_param_map, value_to_json, SqlParam};
use super::telemetry::{signature_of, DbTelemetry};
use crate::error::DbError;
use crate::telemetry::{DataMap, DiagLevel, ExceptionInfo, TraceManager};

/// Event category of every statement event.
pub const SQL_CATEGORY: &str = "sql";

/// The three intercepted call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    NonQuery,
    Scalar,
    Select,
}

impl CallKind {
    /// Event name logged on success.
    pub fn event_name(self) -> &'static str {
        match self {
            Self::NonQuery => "exec_nonquery",
            Self::Scalar => "exec_scalar",
            Self::Select => "exec_select",
        }
    }

    /// Event name logged on failure.
    pub fn error_event_name(self) -> &'static str {
        match self {
            Self::NonQuery => "exec_nonquery_error",
            Self::Scalar => "exec_scalar_error",
            Self::Select => "exec_select_error",
        }
    }
}

/// Rows returned by a tabular read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl DataTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` (case-insensitive) in row `row`.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        self.rows.get(row)?.get(index)
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_json(&self) -> JsonValue {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let object = self
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(c, v)| (c.clone(), value_to_json(v)))
                    .collect();
                JsonValue::Object(object)
            })
            .collect();
        JsonValue::Array(rows)
    }
}

/// Outcome summary passed to the logging step.
#[derive(Debug, Clone, Copy)]
struct CallOutcome {
    duration_ms: u64,
    rows: i64,
}

/// Wraps statement execution with timing, sampling and event logging.
#[derive(Clone)]
pub struct DbCommandWrapper {
    trace: TraceManager,
    telemetry: Arc<DbTelemetry>,
}

impl DbCommandWrapper {
    pub fn new(trace: TraceManager, telemetry: Arc<DbTelemetry>) -> Self {
        Self { trace, telemetry }
    }

    pub fn trace(&self) -> &TraceManager {
        &self.trace
    }

    pub fn telemetry(&self) -> &Arc<DbTelemetry> {
        &self.telemetry
    }

    /// Run a statement that returns no rows. Returns the affected row count.
    pub fn execute_non_query(
        &self,
        conn: &TrackedConnection,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<usize, DbError> {
        self.observe(
            CallKind::NonQuery,
            conn,
            sql,
            params,
            |c| {
                let mut stmt = c.prepare(sql)?;
                bind_params(&mut stmt, params)?;
                stmt.raw_execute()
            },
            |affected| *affected as i64,
        )
    }

    /// Run a query and return the first column of the first row.
    pub fn execute_scalar(
        &self,
        conn: &TrackedConnection,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Option<Value>, DbError> {
        self.observe(
            CallKind::Scalar,
            conn,
            sql,
            params,
            |c| {
                let mut stmt = c.prepare(sql)?;
                bind_params(&mut stmt, params)?;
                let mut rows = stmt.raw_query();
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, Value>(0)?)),
                    None => Ok(None),
                }
            },
            |_| 1,
        )
    }

    /// Run a query and collect every row.
    pub fn execute_select(
        &self,
        conn: &TrackedConnection,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<DataTable, DbError> {
        self.observe(
            CallKind::Select,
            conn,
            sql,
            params,
            |c| {
                let mut stmt = c.prepare(sql)?;
                bind_params(&mut stmt, params)?;
                let columns: Vec<String> =
                    stmt.column_names().into_iter().map(String::from).collect();
                let width = columns.len();
                let mut table = DataTable {
                    columns,
                    rows: Vec::new(),
                };
                let mut rows = stmt.raw_query();
                while let Some(row) = rows.next()? {
                    let mut values = Vec::with_capacity(width);
                    for i in 0..width {
                        values.push(row.get::<_, Value>(i)?);
                    }
                    table.rows.push(values);
                }
                Ok(table)
            },
            |table| table.rows.len() as i64,
        )
    }

    fn observe<T>(
        &self,
        kind: CallKind,
        conn: &TrackedConnection,
        sql: &str,
        params: &[SqlParam],
        run: impl FnOnce(&Connection) -> rusqlite::Result<T>,
        rows_of: impl Fn(&T) -> i64,
    ) -> Result<T, DbError> {
        if sql.trim().is_empty() {
            return Err(DbError::EmptyStatement);
        }

        let started = Instant::now();
        let result = run(conn.conn());
        let duration_ms = started.elapsed().as_millis() as u64;

        let signature = signature_of(sql);
        self.telemetry.registry().record(duration_ms, &signature);
        let correlation = self.trace.current_correlation_id();
        self.telemetry
            .record_n_plus_one(correlation.as_str(), &signature, &self.trace);

        match result {
            Ok(value) => {
                let outcome = CallOutcome {
                    duration_ms,
                    rows: rows_of(&value),
                };
                self.log_call(kind, conn, &signature, params, outcome, None);
                Ok(value)
            }
            Err(err) => {
                let outcome = CallOutcome {
                    duration_ms,
                    rows: -1,
                };
                self.log_call(kind, conn, &signature, params, outcome, Some(&err));
                Err(DbError::Sqlite(err))
            }
        }
    }

    fn log_call(
        &self,
        kind: CallKind,
        conn: &TrackedConnection,
        signature: &str,
        params: &[SqlParam],
        outcome: CallOutcome,
        error: Option<&rusqlite::Error>,
    ) {
        let ctx = self.trace.context();
        let slow = outcome.duration_ms >= ctx.slow_query_ms();
        if !slow && !self.telemetry.should_sample(ctx, outcome.duration_ms) {
            return;
        }
        let level = if slow { DiagLevel::Warn } else { DiagLevel::Debug };

        let mut data = DataMap::new();
        data.insert("sql_signature".to_string(), JsonValue::from(signature));
        data.insert("params".to_string(), masked_param_map(params));
        data.insert("duration_ms".to_string(), JsonValue::from(outcome.duration_ms));
        data.insert("rows".to_string(), JsonValue::from(outcome.rows));
        data.insert("server_roundtrips".to_string(), JsonValue::from(1));
        data.insert(
            "timeout".to_string(),
            JsonValue::from(conn.command_timeout().as_secs()),
        );
        data.insert("connection_id".to_string(), JsonValue::from(conn.id()));

        match error {
            None => self.trace.log(
                level,
                SQL_CATEGORY,
                kind.event_name(),
                "OK",
                None,
                Some(data),
            ),
            Some(err) => self.trace.log(
                level,
                SQL_CATEGORY,
                kind.error_event_name(),
                &err.to_string(),
                Some(ExceptionInfo::from_error(err)),
                Some(data),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{keys, ConfigSnapshot};
    use crate::db::telemetry::{BuildProfile, N_PLUS_ONE_EVENT};
    use crate::telemetry::trace::tests::{manager_with, RecordingWriter};

    fn wrapper(
        config: ConfigSnapshot,
        profile: BuildProfile,
    ) -> (DbCommandWrapper, Arc<RecordingWriter>) {
        let (trace, writer) = manager_with(config.with(keys::KEY_LEVEL, "trace"));
        let telemetry = Arc::new(DbTelemetry::new(profile));
        (DbCommandWrapper::new(trace, telemetry), writer)
    }

    fn parts_db() -> TrackedConnection {
        let conn = TrackedConnection::open_in_memory().unwrap();
        conn.conn()
            .execute_batch(
                "CREATE TABLE parts (id INTEGER PRIMARY KEY, name TEXT, password TEXT);
                 INSERT INTO parts (id, name, password)
                 VALUES (1, 'Valve', 'x'), (2, 'Pump', 'y');",
            )
            .unwrap();
        conn
    }

    #[test]
    fn test_non_query_logs_masked_params() {
        let (wrapper, writer) = wrapper(ConfigSnapshot::new(), BuildProfile::Development);
        let conn = parts_db();
        let params = vec![
            SqlParam::new("@id", 1i64),
            SqlParam::new("@password", "hunter2".to_string()),
        ];
        let rows = wrapper
            .execute_non_query(
                &conn,
                "UPDATE parts SET password = @password WHERE id = @id",
                &params,
            )
            .unwrap();
        assert_eq!(rows, 1);

        let events = writer.named("exec_nonquery");
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.lvl, DiagLevel::Debug);
        assert_eq!(event.cat, SQL_CATEGORY);
        assert_eq!(event.msg, "OK");
        assert_eq!(event.data_value("rows"), Some(&serde_json::json!(1)));
        assert_eq!(event.data_value("connection_id"), Some(&serde_json::json!(conn.id())));
        assert_eq!(event.data_value("timeout"), Some(&serde_json::json!(30)));
        assert!(!serde_json::to_string(event).unwrap().contains("hunter2"));
    }

    #[test]
    fn test_scalar_and_select() {
        let (wrapper, writer) = wrapper(ConfigSnapshot::new(), BuildProfile::Development);
        let conn = parts_db();

        let count = wrapper
            .execute_scalar(&conn, "SELECT COUNT(*) FROM parts", &[])
            .unwrap();
        assert_eq!(count, Some(Value::Integer(2)));

        let none = wrapper
            .execute_scalar(
                &conn,
                "SELECT name FROM parts WHERE id = @id",
                &[SqlParam::new("@id", 9i64)],
            )
            .unwrap();
        assert_eq!(none, None);

        let table = wrapper
            .execute_select(&conn, "SELECT id, name FROM parts ORDER BY id", &[])
            .unwrap();
        assert_eq!(table.columns, vec!["id", "name"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(1, "NAME"), Some(&Value::Text("Pump".to_string())));
        assert_eq!(table.to_json()[0]["name"], serde_json::json!("Valve"));

        assert_eq!(writer.named("exec_scalar").len(), 2);
        let select = writer.named("exec_select");
        assert_eq!(select[0].data_value("rows"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn test_error_is_logged_and_returned_unchanged() {
        let (wrapper, writer) = wrapper(ConfigSnapshot::new(), BuildProfile::Development);
        let conn = parts_db();
        let err = wrapper
            .execute_non_query(&conn, "UPDATE missing_table SET x = 1", &[])
            .unwrap_err();
        match &err {
            DbError::Sqlite(inner) => assert!(inner.to_string().contains("missing_table")),
            other => panic!("unexpected error: {:?}", other),
        }

        let events = writer.named("exec_nonquery_error");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data_value("rows"), Some(&serde_json::json!(-1)));
        assert!(events[0].ex_msg.as_deref().unwrap_or("").contains("missing_table"));
        assert!(writer.named("exec_nonquery").is_empty());
    }

    #[test]
    fn test_empty_statement_rejected() {
        let (wrapper, writer) = wrapper(ConfigSnapshot::new(), BuildProfile::Development);
        let conn = parts_db();
        assert!(matches!(
            wrapper.execute_scalar(&conn, "   ", &[]),
            Err(DbError::EmptyStatement)
        ));
        assert!(writer.events.lock().is_empty());
    }

    #[test]
    fn test_slow_threshold_forces_warn_in_release() {
        let config = ConfigSnapshot::new()
            .with(keys::KEY_SLOW_QUERY_MS, "0")
            .with(keys::KEY_TOP_N_RELEASE, "0")
            .with(keys::KEY_RANDOM_PERCENT_RELEASE, "0");
        let (wrapper, writer) = wrapper(config, BuildProfile::Release);
        let conn = parts_db();
        wrapper.execute_select(&conn, "SELECT * FROM parts", &[]).unwrap();
        let events = writer.named("exec_select");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].lvl, DiagLevel::Warn);
    }

    #[test]
    fn test_release_unsampled_calls_are_quiet() {
        let config = ConfigSnapshot::new()
            .with(keys::KEY_SLOW_QUERY_MS, "600000")
            .with(keys::KEY_TOP_N_RELEASE, "0")
            .with(keys::KEY_RANDOM_PERCENT_RELEASE, "0");
        let (wrapper, writer) = wrapper(config, BuildProfile::Release);
        let conn = parts_db();
        wrapper.execute_select(&conn, "SELECT * FROM parts", &[]).unwrap();
        assert!(writer.named("exec_select").is_empty());
        assert_eq!(wrapper.telemetry().registry().len(), 1);
    }

    #[test]
    fn test_repeated_shape_warns_once() {
        let (wrapper, writer) = wrapper(ConfigSnapshot::new(), BuildProfile::Development);
        let conn = parts_db();
        let statements = [
            "SELECT name FROM parts WHERE id = @id",
            "select name\nFROM parts  WHERE id = @id",
            "  SELECT NAME FROM PARTS WHERE ID = @ID ",
            "SELECT name FROM parts WHERE id = @id",
        ];
        for sql in statements {
            wrapper
                .execute_scalar(&conn, sql, &[SqlParam::new("@id", 1i64)])
                .unwrap();
        }
        let warnings = writer.named(N_PLUS_ONE_EVENT);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].lvl, DiagLevel::Warn);
    }
}
