// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Write replay against a shadow store.
//!
//! Every successful write on the primary can be replayed on a second
//! database. The affected row counts are compared, then, for whitelisted
//! tables, the written row is read back from both stores and diffed column by
//! column. Nothing in here ever fails the primary write: every fault becomes
//! a `shadow` event.
//!
//! Replay only runs in development builds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::Value;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::connection::TrackedConnection;
use super::params::{bind_params, find_param, value_to_json, value_to_text, SqlParam};
use super::telemetry::BuildProfile;
use crate::data_map;
use crate::error::DbError;
use crate::telemetry::{DataMap, DiagLevel, ExceptionInfo, TraceManager};

/// Event category of every replay and verification event.
pub const SHADOW_CATEGORY: &str = "shadow";
/// Default wait before reading rows back.
pub const DEFAULT_PROPAGATION_DELAY: Duration = Duration::from_millis(150);

static TARGET_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)^\s*(?:insert(?:\s+or\s+\w+)?\s+into|replace\s+into|update(?:\s+or\s+\w+)?|delete\s+from)\s+([`"\[]?[\w.]+[`"\]]?)"#,
    )
    .unwrap()
});

/// One row read back by primary key. Column names are lower-cased; values
/// are compared as text, `None` for NULL.
pub type RowSnapshot = BTreeMap<String, Option<String>>;

/// Both sides of a differing column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDiff {
    pub primary: Option<String>,
    pub shadow: Option<String>,
}

/// Differing columns keyed by lower-cased name.
pub type RowDiff = BTreeMap<String, ColumnDiff>;

/// Result of the read-after-write check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Shadow disabled or the table is not whitelisted.
    NotAttempted,
    /// No primary key value, or the rows could not be read.
    Skipped(String),
    Cancelled,
    /// Rows equal, or a delete visible on both sides.
    Match,
    /// At least one column differs.
    Diff(RowDiff),
    /// The row exists on one side only.
    Missing {
        primary_exists: bool,
        shadow_exists: bool,
    },
}

impl Verification {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }
}

/// Outcome of replaying one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowReport {
    /// False when the replicator is disabled.
    pub attempted: bool,
    pub primary_rows: usize,
    /// `None` when the shadow execution failed or was cancelled.
    pub shadow_rows: Option<usize>,
    pub verification: Verification,
}

impl ShadowReport {
    fn not_attempted(primary_rows: usize) -> Self {
        Self {
            attempted: false,
            primary_rows,
            shadow_rows: None,
            verification: Verification::NotAttempted,
        }
    }

    /// Whether both stores reported the same row count.
    pub fn rows_match(&self) -> Option<bool> {
        self.shadow_rows.map(|rows| rows == self.primary_rows)
    }
}

/// Replays writes against the shadow store and verifies them.
pub struct ShadowReplicator {
    primary_path: PathBuf,
    shadow_path: Option<PathBuf>,
    verify_tables: BTreeMap<String, String>,
    trace: TraceManager,
    profile: BuildProfile,
    propagation_delay: Duration,
}

impl ShadowReplicator {
    pub fn new(
        primary_path: impl Into<PathBuf>,
        shadow_path: Option<PathBuf>,
        verify_tables: BTreeMap<String, String>,
        trace: TraceManager,
        profile: BuildProfile,
    ) -> Self {
        Self {
            primary_path: primary_path.into(),
            shadow_path,
            verify_tables,
            trace,
            profile,
            propagation_delay: DEFAULT_PROPAGATION_DELAY,
        }
    }

    /// Read the shadow target and table whitelist from the trace context.
    pub fn from_context(
        primary_path: impl Into<PathBuf>,
        trace: TraceManager,
        profile: BuildProfile,
    ) -> Self {
        let ctx = trace.context().clone();
        Self::new(
            primary_path,
            ctx.shadow_path(),
            ctx.shadow_verify_tables(),
            trace,
            profile,
        )
    }

    pub fn with_propagation_delay(mut self, delay: Duration) -> Self {
        self.propagation_delay = delay;
        self
    }

    /// Replay runs only with a shadow target in a development build.
    pub fn enabled(&self) -> bool {
        self.shadow_path.is_some() && self.profile.is_development()
    }

    pub fn shadow_path(&self) -> Option<&Path> {
        self.shadow_path.as_deref()
    }

    pub fn primary_path(&self) -> &Path {
        &self.primary_path
    }

    fn active_shadow(&self) -> Option<&Path> {
        if self.enabled() {
            self.shadow_path.as_deref()
        } else {
            None
        }
    }

    /// Execute `sql` on the shadow store and compare affected rows, then run
    /// the read-after-write check.
    pub async fn replay(
        &self,
        sql: &str,
        params: &[SqlParam],
        primary_rows: usize,
        cancel: &CancellationToken,
    ) -> ShadowReport {
        let Some(shadow_path) = self.active_shadow() else {
            return ShadowReport::not_attempted(primary_rows);
        };
        let mut report = ShadowReport {
            attempted: true,
            primary_rows,
            shadow_rows: None,
            verification: Verification::NotAttempted,
        };
        if cancel.is_cancelled() {
            report.verification = Verification::Cancelled;
            return report;
        }

        let started = Instant::now();
        let task = {
            let path = shadow_path.to_path_buf();
            let sql = sql.to_string();
            let params = params.to_vec();
            tokio::task::spawn_blocking(move || execute_write(&path, &sql, &params))
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                report.verification = Verification::Cancelled;
                return report;
            }
            joined = task => joined.map_err(DbError::from).and_then(|r| r),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let shadow_rows = match result {
            Ok(rows) => rows,
            Err(err) => {
                tracing::debug!("Shadow replay failed: {}", err);
                self.trace.log(
                    DiagLevel::Warn,
                    SHADOW_CATEGORY,
                    "shadow_error",
                    &err.to_string(),
                    Some(ExceptionInfo::from_error(&err)),
                    None,
                );
                return report;
            }
        };
        report.shadow_rows = Some(shadow_rows);

        let ok = shadow_rows == primary_rows;
        let message = if ok {
            "Rows match".to_string()
        } else {
            format!("Rows mismatch primary={}, shadow={}", primary_rows, shadow_rows)
        };
        self.trace.log(
            if ok { DiagLevel::Debug } else { DiagLevel::Warn },
            SHADOW_CATEGORY,
            "shadow_write",
            &message,
            None,
            Some(data_map! {
                "duration_ms" => duration_ms,
                "primary_rows" => primary_rows,
                "shadow_rows" => shadow_rows,
            }),
        );

        report.verification = self.verify_read_after_write(sql, params, cancel).await;
        report
    }

    /// Read the written row back from both stores and compare it.
    ///
    /// Runs only for statements whose target table is whitelisted, and only
    /// when a primary key value can be found among `params`.
    pub async fn verify_read_after_write(
        &self,
        sql: &str,
        params: &[SqlParam],
        cancel: &CancellationToken,
    ) -> Verification {
        let Some(shadow_path) = self.active_shadow() else {
            return Verification::NotAttempted;
        };
        let Some((table, pk)) = resolve_target(sql, &self.verify_tables) else {
            return Verification::NotAttempted;
        };
        let verb = sql_verb(sql);

        let Some(id) = find_pk_value(sql, &pk, params) else {
            self.trace.log(
                DiagLevel::Debug,
                SHADOW_CATEGORY,
                "raw_verify_skip",
                "No primary key value in parameters",
                None,
                Some(data_map! { "table" => table, "pk" => pk, "verb" => verb }),
            );
            return Verification::Skipped("no primary key value".to_string());
        };

        tokio::select! {
            _ = cancel.cancelled() => return Verification::Cancelled,
            _ = tokio::time::sleep(self.propagation_delay) => {}
        }

        let task = {
            let primary = self.primary_path.clone();
            let shadow = shadow_path.to_path_buf();
            let (table, pk, id) = (table.clone(), pk.clone(), id.clone());
            tokio::task::spawn_blocking(move || -> Result<_, DbError> {
                let primary_row = read_row(&primary, &table, &pk, &id)?;
                let shadow_row = read_row(&shadow, &table, &pk, &id)?;
                Ok((primary_row, shadow_row))
            })
        };
        let rows = tokio::select! {
            _ = cancel.cancelled() => return Verification::Cancelled,
            joined = task => joined.map_err(DbError::from).and_then(|r| r),
        };
        let (primary_row, shadow_row) = match rows {
            Ok(rows) => rows,
            Err(err) => {
                self.trace.log(
                    DiagLevel::Debug,
                    SHADOW_CATEGORY,
                    "raw_verify_skip",
                    &err.to_string(),
                    Some(ExceptionInfo::from_error(&err)),
                    Some(data_map! { "table" => table, "pk" => pk }),
                );
                return Verification::Skipped(err.to_string());
            }
        };

        let id_json = value_to_json(&id);
        let primary_exists = primary_row.is_some();
        let shadow_exists = shadow_row.is_some();

        if verb == "delete" {
            let ok = !primary_exists && !shadow_exists;
            self.log_verify(
                ok,
                if ok { "Delete visible in both" } else { "Delete mismatch" },
                data_map! {
                    "table" => table,
                    "pk" => pk,
                    "id" => id_json,
                    "primary_exists" => primary_exists,
                    "shadow_exists" => shadow_exists,
                },
            );
            return if ok {
                Verification::Match
            } else {
                Verification::Missing {
                    primary_exists,
                    shadow_exists,
                }
            };
        }

        let (Some(primary_row), Some(shadow_row)) = (primary_row, shadow_row) else {
            self.log_verify(
                false,
                "One side missing row",
                data_map! {
                    "table" => table,
                    "pk" => pk,
                    "id" => id_json,
                    "primary_exists" => primary_exists,
                    "shadow_exists" => shadow_exists,
                },
            );
            return Verification::Missing {
                primary_exists,
                shadow_exists,
            };
        };

        let diffs = compute_diff(&primary_row, &shadow_row);
        let ok = diffs.is_empty();
        self.log_verify(
            ok,
            if ok { "Rows match" } else { "Rows differ" },
            data_map! {
                "table" => table,
                "pk" => pk,
                "id" => id_json,
                "diffs" => diffs,
            },
        );
        if ok {
            Verification::Match
        } else {
            Verification::Diff(diffs)
        }
    }

    fn log_verify(&self, ok: bool, message: &str, data: DataMap) {
        let (level, event) = if ok {
            (DiagLevel::Debug, "raw_verify_ok")
        } else {
            (DiagLevel::Warn, "raw_verify_diff")
        };
        self.trace
            .log(level, SHADOW_CATEGORY, event, message, None, Some(data));
    }
}

impl std::fmt::Debug for ShadowReplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowReplicator")
            .field("primary_path", &self.primary_path)
            .field("shadow_path", &self.shadow_path)
            .field("verify_tables", &self.verify_tables)
            .field("profile", &self.profile)
            .finish()
    }
}

/// First keyword of the statement, lower-cased.
pub fn sql_verb(sql: &str) -> String {
    sql.split_whitespace()
        .next()
        .map(|w| w.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Table written by `sql`, if it appears in `whitelist`.
///
/// Returns the whitelisted table name and its primary key column.
pub fn resolve_target(sql: &str, whitelist: &BTreeMap<String, String>) -> Option<(String, String)> {
    let captured = TARGET_TABLE.captures(sql)?.get(1)?.as_str();
    let unquoted = captured.trim_matches(|c| matches!(c, '`' | '"' | '[' | ']'));
    let table = unquoted.rsplit('.').next().unwrap_or(unquoted);
    whitelist
        .iter()
        .find(|(name, pk)| name.eq_ignore_ascii_case(table) && !pk.trim().is_empty())
        .map(|(name, pk)| (name.clone(), pk.trim().to_string()))
}

/// Value of the primary key parameter.
///
/// Looks for `<pk> = @name` in the statement first, then for parameters
/// named `@id` or `@<pk>`.
pub fn find_pk_value(sql: &str, pk: &str, params: &[SqlParam]) -> Option<Value> {
    let pattern = format!(r"(?i)\b{}\s*=\s*([@:$]\w+)", regex::escape(pk));
    let from_sql = Regex::new(&pattern)
        .ok()
        .and_then(|re| re.captures(sql))
        .and_then(|caps| caps.get(1))
        .and_then(|m| find_param(params, m.as_str()));

    from_sql
        .or_else(|| find_param(params, "@id"))
        .or_else(|| find_param(params, &format!("@{}", pk)))
        .map(|p| p.value.clone())
        .filter(|v| *v != Value::Null)
}

/// Columns that differ between two snapshots, including columns present on
/// one side only.
pub fn compute_diff(primary: &RowSnapshot, shadow: &RowSnapshot) -> RowDiff {
    let mut diffs = RowDiff::new();
    for (column, value) in primary {
        match shadow.get(column) {
            Some(other) if other == value => {}
            other => {
                diffs.insert(
                    column.clone(),
                    ColumnDiff {
                        primary: value.clone(),
                        shadow: other.cloned().flatten(),
                    },
                );
            }
        }
    }
    for (column, value) in shadow {
        if !primary.contains_key(column) {
            diffs.insert(
                column.clone(),
                ColumnDiff {
                    primary: None,
                    shadow: value.clone(),
                },
            );
        }
    }
    diffs
}

fn execute_write(path: &Path, sql: &str, params: &[SqlParam]) -> Result<usize, DbError> {
    let conn = TrackedConnection::open_existing(path)?;
    let mut stmt = conn.conn().prepare(sql)?;
    bind_params(&mut stmt, params)?;
    Ok(stmt.raw_execute()?)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn read_row(
    path: &Path,
    table: &str,
    pk: &str,
    id: &Value,
) -> Result<Option<RowSnapshot>, DbError> {
    let conn = TrackedConnection::open_existing(path)?;
    let sql = format!(
        "SELECT * FROM {} WHERE {} = ?1 LIMIT 1",
        quote_ident(table),
        quote_ident(pk)
    );
    let mut stmt = conn.conn().prepare(&sql)?;
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let mut rows = stmt.query(rusqlite::params![id])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    let mut snapshot = RowSnapshot::new();
    for (i, column) in columns.into_iter().enumerate() {
        let value: Value = row.get(i)?;
        snapshot.insert(column, value_to_text(&value));
    }
    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{keys, ConfigSnapshot};
    use crate::telemetry::trace::tests::{manager_with, RecordingWriter};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn snapshot(pairs: &[(&str, Option<&str>)]) -> RowSnapshot {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect()
    }

    fn whitelist() -> BTreeMap<String, String> {
        BTreeMap::from([("parts".to_string(), "id".to_string())])
    }

    struct Stores {
        _temp: TempDir,
        primary: PathBuf,
        shadow: PathBuf,
    }

    fn stores() -> Stores {
        let temp = TempDir::new().unwrap();
        let primary = temp.path().join("primary.db");
        let shadow = temp.path().join("shadow.db");
        for path in [&primary, &shadow] {
            let conn = TrackedConnection::open(path).unwrap();
            conn.conn()
                .execute_batch(
                    "CREATE TABLE parts (id INTEGER PRIMARY KEY, name TEXT, qty INTEGER);
                     INSERT INTO parts (id, name, qty) VALUES (1, 'Valve', 5);",
                )
                .unwrap();
        }
        Stores {
            _temp: temp,
            primary,
            shadow,
        }
    }

    fn replicator(
        stores: &Stores,
        profile: BuildProfile,
    ) -> (ShadowReplicator, Arc<RecordingWriter>) {
        let config = ConfigSnapshot::new()
            .with(keys::KEY_LEVEL, "trace")
            .with(keys::KEY_SHADOW_ENABLED, "true")
            .with(keys::KEY_SHADOW_PATH, stores.shadow.to_string_lossy().to_string())
            .with(format!("{}parts", keys::KEY_SHADOW_VERIFY_TABLES), "id");
        let (trace, writer) = manager_with(config);
        let replicator = ShadowReplicator::from_context(&stores.primary, trace, profile)
            .with_propagation_delay(Duration::from_millis(1));
        (replicator, writer)
    }

    fn apply(path: &Path, sql: &str, params: &[SqlParam]) -> usize {
        execute_write(path, sql, params).unwrap()
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let row = snapshot(&[("id", Some("1")), ("name", Some("Valve")), ("note", None)]);
        assert!(compute_diff(&row, &row.clone()).is_empty());
    }

    #[test]
    fn test_diff_single_column() {
        let a = snapshot(&[("id", Some("1")), ("name", Some("Valve"))]);
        let b = snapshot(&[("id", Some("1")), ("name", Some("Pump"))]);
        let diff = compute_diff(&a, &b);
        assert_eq!(diff.len(), 1);
        assert_eq!(
            diff["name"],
            ColumnDiff {
                primary: Some("Valve".to_string()),
                shadow: Some("Pump".to_string()),
            }
        );
    }

    #[test]
    fn test_diff_one_sided_columns() {
        let a = snapshot(&[("id", Some("1")), ("note", None)]);
        let b = snapshot(&[("id", Some("1")), ("extra", Some("x"))]);
        let diff = compute_diff(&a, &b);
        assert_eq!(diff.len(), 2);
        assert_eq!(diff["note"].shadow, None);
        assert_eq!(diff["extra"].primary, None);
    }

    #[test]
    fn test_resolve_target() {
        let list = whitelist();
        assert_eq!(
            resolve_target("UPDATE Parts SET name = @n WHERE id = @id", &list),
            Some(("parts".to_string(), "id".to_string()))
        );
        let quoted = "insert or replace into \"parts\" (id) values (@id)";
        assert!(resolve_target(quoted, &list).is_some());
        assert!(resolve_target("DELETE FROM main.parts WHERE id = @id", &list).is_some());
        assert!(resolve_target("UPDATE orders SET x = 1", &list).is_none());
        assert!(resolve_target("SELECT * FROM parts", &list).is_none());
    }

    #[test]
    fn test_find_pk_value() {
        let params = vec![SqlParam::new("@partId", 7i64), SqlParam::new("@id", 9i64)];
        assert_eq!(
            find_pk_value("UPDATE parts SET x = 1 WHERE id=@partId", "id", &params),
            Some(Value::Integer(7))
        );
        assert_eq!(
            find_pk_value("INSERT INTO parts (id) VALUES (@id)", "id", &params),
            Some(Value::Integer(9))
        );
        let by_pk = vec![SqlParam::new("@part_no", "P-1".to_string())];
        assert_eq!(
            find_pk_value("INSERT INTO parts VALUES (@part_no)", "part_no", &by_pk),
            Some(Value::Text("P-1".to_string()))
        );
        assert_eq!(find_pk_value("DELETE FROM parts", "id", &[]), None);
    }

    #[test]
    fn test_sql_verb() {
        assert_eq!(sql_verb("  Insert INTO x"), "insert");
        assert_eq!(sql_verb(""), "");
    }

    #[tokio::test]
    async fn test_disabled_in_release() {
        let stores = stores();
        let (replicator, writer) = replicator(&stores, BuildProfile::Release);
        assert!(!replicator.enabled());
        let report = replicator
            .replay("UPDATE parts SET qty = 1", &[], 1, &CancellationToken::new())
            .await;
        assert!(!report.attempted);
        assert!(writer.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_replay_matching_update() {
        let stores = stores();
        let (replicator, writer) = replicator(&stores, BuildProfile::Development);
        let sql = "UPDATE parts SET name = @name WHERE id = @id";
        let params = vec![
            SqlParam::new("@name", "Valve-2".to_string()),
            SqlParam::new("@id", 1i64),
        ];
        let primary_rows = apply(&stores.primary, sql, &params);

        let report = replicator
            .replay(sql, &params, primary_rows, &CancellationToken::new())
            .await;
        assert_eq!(report.rows_match(), Some(true));
        assert_eq!(report.verification, Verification::Match);

        let writes = writer.named("shadow_write");
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].lvl, DiagLevel::Debug);
        assert_eq!(writer.named("raw_verify_ok").len(), 1);
    }

    #[tokio::test]
    async fn test_row_count_mismatch_warns() {
        let stores = stores();
        let (replicator, writer) = replicator(&stores, BuildProfile::Development);
        let report = replicator
            .replay("UPDATE parts SET qty = 0", &[], 4, &CancellationToken::new())
            .await;
        assert_eq!(report.shadow_rows, Some(1));
        assert_eq!(report.rows_match(), Some(false));
        let writes = writer.named("shadow_write");
        assert_eq!(writes[0].lvl, DiagLevel::Warn);
        assert_eq!(writes[0].msg, "Rows mismatch primary=4, shadow=1");
        // No id parameter: verification skipped.
        assert!(matches!(report.verification, Verification::Skipped(_)));
        assert_eq!(writer.named("raw_verify_skip").len(), 1);
    }

    #[tokio::test]
    async fn test_drift_reported_as_diff() {
        let stores = stores();
        let (replicator, writer) = replicator(&stores, BuildProfile::Development);
        let sql = "UPDATE parts SET name = @name WHERE id = @id";
        let params = vec![
            SqlParam::new("@name", "Valve-X".to_string()),
            SqlParam::new("@id", 1i64),
        ];
        apply(&stores.primary, sql, &params);

        let verification = replicator
            .verify_read_after_write(sql, &params, &CancellationToken::new())
            .await;
        let Verification::Diff(diff) = &verification else {
            panic!("expected a diff, got {:?}", verification);
        };
        assert_eq!(diff.len(), 1);
        assert_eq!(diff["name"].primary.as_deref(), Some("Valve-X"));
        assert_eq!(diff["name"].shadow.as_deref(), Some("Valve"));

        let events = writer.named("raw_verify_diff");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].lvl, DiagLevel::Warn);
        assert_eq!(
            events[0].data_value("diffs"),
            Some(&json!({ "name": { "primary": "Valve-X", "shadow": "Valve" } }))
        );
    }

    #[tokio::test]
    async fn test_delete_on_one_side() {
        let stores = stores();
        let (replicator, writer) = replicator(&stores, BuildProfile::Development);
        let sql = "DELETE FROM parts WHERE id = @id";
        let params = vec![SqlParam::new("@id", 1i64)];
        apply(&stores.primary, sql, &params);

        let verification = replicator
            .verify_read_after_write(sql, &params, &CancellationToken::new())
            .await;
        assert_eq!(
            verification,
            Verification::Missing {
                primary_exists: false,
                shadow_exists: true,
            }
        );
        let events = writer.named("raw_verify_diff");
        assert_eq!(events[0].msg, "Delete mismatch");
    }

    #[tokio::test]
    async fn test_missing_shadow_store_logs_error() {
        let stores = stores();
        std::fs::remove_file(&stores.shadow).unwrap();
        let (replicator, writer) = replicator(&stores, BuildProfile::Development);
        let report = replicator
            .replay("UPDATE parts SET qty = 1", &[], 1, &CancellationToken::new())
            .await;
        assert!(report.attempted);
        assert_eq!(report.shadow_rows, None);
        assert_eq!(writer.named("shadow_error").len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let stores = stores();
        let (replicator, writer) = replicator(&stores, BuildProfile::Development);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = replicator.replay("UPDATE parts SET qty = 1", &[], 1, &cancel).await;
        assert_eq!(report.verification, Verification::Cancelled);
        assert!(writer.events.lock().is_empty());
    }
}
