// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Database self-tests.
//!
//! A short suite run against an open [`Database`] after boot: connectivity,
//! clock drift between the store and this process, an inventory of triggers
//! and audit tables, and the schema hash. Every check logs one `selftest`
//! event and a failing check never stops the ones after it. The run ends
//! with `selftest/completed`, or `selftest/failed` when cancelled.

use std::time::Instant;

use chrono::{Local, Utc};
use rusqlite::types::Value;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::data_map;
use crate::db::{value_to_json, Database};
use crate::error::DbError;
use crate::telemetry::{DataMap, DiagLevel, ExceptionInfo, TraceManager};

/// Category of every self-test event.
pub const SELFTEST_CATEGORY: &str = "selftest";
/// Event logged after the last check.
pub const COMPLETED_EVENT: &str = "completed";
/// Event logged when the run is cancelled part way.
pub const FAILED_EVENT: &str = "failed";

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

/// Outcome of a full run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelfTestReport {
    pub checks: Vec<CheckResult>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl SelfTestReport {
    pub fn passed(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    pub fn failed(&self) -> usize {
        self.checks.len() - self.passed()
    }

    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// True when nothing failed and the run was not cut short.
    pub fn is_ok(&self) -> bool {
        !self.cancelled && self.failed() == 0
    }
}

/// The checks, in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Check {
    DbConnect,
    UtcDrift,
    AuditInventory,
    SchemaHash,
}

impl Check {
    const ALL: [Check; 4] = [
        Check::DbConnect,
        Check::UtcDrift,
        Check::AuditInventory,
        Check::SchemaHash,
    ];

    fn name(self) -> &'static str {
        match self {
            Check::DbConnect => "db_connect",
            Check::UtcDrift => "utc_drift",
            Check::AuditInventory => "audit_inventory",
            Check::SchemaHash => "schema_hash",
        }
    }
}

/// What a check reports before it is logged.
struct CheckOutcome {
    evt: &'static str,
    level: DiagLevel,
    msg: String,
    data: Option<DataMap>,
    error: Option<DbError>,
}

impl CheckOutcome {
    fn ok(evt: &'static str, msg: impl Into<String>, data: Option<DataMap>) -> Self {
        Self {
            evt,
            level: DiagLevel::Info,
            msg: msg.into(),
            data,
            error: None,
        }
    }

    fn warn(evt: &'static str, msg: impl Into<String>, data: Option<DataMap>) -> Self {
        Self {
            level: DiagLevel::Warn,
            ..Self::ok(evt, msg, data)
        }
    }

    fn failed(evt: &'static str, level: DiagLevel, error: DbError) -> Self {
        Self {
            evt,
            level,
            msg: error.to_string(),
            data: None,
            error: Some(error),
        }
    }

    fn passed(&self) -> bool {
        self.level == DiagLevel::Info
    }
}

/// Runs the self-test suite against one database.
pub struct SelfTestRunner<'a> {
    db: &'a Database,
}

impl<'a> SelfTestRunner<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    fn trace(&self) -> &TraceManager {
        self.db.wrapper().trace()
    }

    /// Run every check in order and log the summary.
    pub async fn run_all(&self, cancel: &CancellationToken) -> SelfTestReport {
        let started = Instant::now();
        let mut report = SelfTestReport::default();
        for check in Check::ALL {
            let outcome = match check {
                Check::DbConnect => self.db_connect(cancel).await,
                Check::UtcDrift => self.utc_drift(cancel).await,
                Check::AuditInventory => self.audit_inventory(cancel).await,
                Check::SchemaHash => self.schema_hash(cancel).await,
            };
            if matches!(&outcome.error, Some(e) if e.is_cancelled()) {
                report.cancelled = true;
                break;
            }
            report.checks.push(CheckResult {
                name: check.name(),
                passed: outcome.passed(),
                detail: outcome.msg.clone(),
            });
            self.log(outcome);
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        let summary = data_map! {
            "passed" => report.passed(),
            "failed" => report.failed(),
            "duration_ms" => report.duration_ms,
        };
        if report.cancelled {
            self.trace().log(
                DiagLevel::Error,
                SELFTEST_CATEGORY,
                FAILED_EVENT,
                "Diagnostics self-tests cancelled",
                Some(ExceptionInfo::from_error(&DbError::Cancelled)),
                Some(summary),
            );
        } else {
            self.trace().log(
                DiagLevel::Info,
                SELFTEST_CATEGORY,
                COMPLETED_EVENT,
                "Diagnostics self-tests finished",
                None,
                Some(summary),
            );
        }
        report
    }

    fn log(&self, outcome: CheckOutcome) {
        let exception = outcome.error.as_ref().map(ExceptionInfo::from_error);
        self.trace().log(
            outcome.level,
            SELFTEST_CATEGORY,
            outcome.evt,
            &outcome.msg,
            exception,
            outcome.data,
        );
    }

    async fn db_connect(&self, cancel: &CancellationToken) -> CheckOutcome {
        match self.db.execute_scalar("SELECT 1", vec![], cancel).await {
            Ok(Some(Value::Integer(1))) => CheckOutcome::ok(
                "db_connect",
                "OK",
                Some(data_map! { "result" => 1 }),
            ),
            Ok(other) => CheckOutcome::warn(
                "db_connect_unexpected",
                "SELECT 1 returned an unexpected value",
                Some(data_map! {
                    "result" => other.as_ref().map(value_to_json),
                }),
            ),
            Err(e) => CheckOutcome::failed("db_connect_error", DiagLevel::Error, e),
        }
    }

    /// Store clock against this process, and the store's local offset
    /// against the process time zone.
    async fn utc_drift(&self, cancel: &CancellationToken) -> CheckOutcome {
        let sql = "SELECT CAST(strftime('%s', 'now') AS INTEGER), \
                   CAST(strftime('%s', 'now', 'localtime') AS INTEGER) \
                   - CAST(strftime('%s', 'now') AS INTEGER)";
        let table = match self.db.execute_select(sql, vec![], cancel).await {
            Ok(table) => table,
            Err(e) => return CheckOutcome::failed("utc_drift_failed", DiagLevel::Warn, e),
        };
        let now = Utc::now().timestamp();
        let (db_now, db_offset) = match table.rows.first().map(Vec::as_slice) {
            Some([Value::Integer(db_now), Value::Integer(db_offset), ..]) => (*db_now, *db_offset),
            _ => {
                return CheckOutcome::warn(
                    "utc_drift_failed",
                    "store returned no clock reading",
                    None,
                )
            }
        };
        let drift = db_now - now;
        let offset_err = (db_offset - i64::from(Local::now().offset().local_minus_utc())).abs();
        CheckOutcome::ok(
            "utc_drift",
            format!("db_vs_utc={drift}s; local_vs_utc_offset_err={offset_err}s"),
            Some(data_map! {
                "db_minus_utc_seconds" => drift,
                "local_offset_err_seconds" => offset_err,
            }),
        )
    }

    async fn audit_inventory(&self, cancel: &CancellationToken) -> CheckOutcome {
        let triggers = self
            .db
            .execute_select(
                "SELECT name, tbl_name FROM sqlite_master WHERE type = 'trigger' ORDER BY name",
                vec![],
                cancel,
            )
            .await;
        let audit_tables = self
            .db
            .execute_select(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name LIKE '%audit%' ORDER BY name",
                vec![],
                cancel,
            )
            .await;
        let (triggers, audit_tables) = match (triggers, audit_tables) {
            (Ok(triggers), Ok(audit_tables)) => (triggers, audit_tables),
            (Err(e), _) | (_, Err(e)) => {
                return CheckOutcome::failed("audit_inventory_failed", DiagLevel::Warn, e)
            }
        };

        let first_column = |table: &crate::db::DataTable| -> Vec<serde_json::Value> {
            table
                .rows
                .iter()
                .filter_map(|row| row.first().map(value_to_json))
                .collect()
        };
        CheckOutcome::ok(
            "audit_inventory",
            format!(
                "triggers={}; audit_tables={}",
                triggers.len(),
                audit_tables.len()
            ),
            Some(data_map! {
                "triggers" => first_column(&triggers),
                "audit_tables" => first_column(&audit_tables),
            }),
        )
    }

    /// Recompute the schema hash and store it on the context for crash bundles.
    async fn schema_hash(&self, cancel: &CancellationToken) -> CheckOutcome {
        match self.db.schema_fingerprint(cancel).await {
            Ok(hash) => {
                self.trace().context().set_schema_fingerprint(hash.clone());
                CheckOutcome::ok("schema_hash", hash, None)
            }
            Err(e) => CheckOutcome::failed("schema_hash_failed", DiagLevel::Warn, e),
        }
    }
}
