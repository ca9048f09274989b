// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Async database gateway.
//!
//! Runs instrumented calls on the blocking pool, honours a cancellation
//! token by interrupting the running statement, and hands successful writes
//! to the shadow replicator as a detached task.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::InterruptHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connection::TrackedConnection;
use super::params::SqlParam;
use super::schema::schema_fingerprint;
use super::shadow::{ShadowReplicator, ShadowReport};
use super::wrapper::{DataTable, DbCommandWrapper};
use crate::data_map;
use crate::error::DbError;
use crate::telemetry::{redact_connection_string, DiagLevel};

/// Result of a write: affected rows plus the replay task, if one was started.
#[derive(Debug)]
pub struct WriteOutcome {
    pub rows: usize,
    pub shadow: Option<JoinHandle<ShadowReport>>,
}

/// One instrumented connection.
pub struct Database {
    conn: Arc<Mutex<TrackedConnection>>,
    interrupt: Arc<InterruptHandle>,
    connection_id: u64,
    path: Option<PathBuf>,
    wrapper: DbCommandWrapper,
    shadow: Option<Arc<ShadowReplicator>>,
}

impl Database {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>, wrapper: DbCommandWrapper) -> Result<Self, DbError> {
        let conn = TrackedConnection::open(path)?;
        Ok(Self::from_connection(conn, wrapper))
    }

    pub fn open_in_memory(wrapper: DbCommandWrapper) -> Result<Self, DbError> {
        let conn = TrackedConnection::open_in_memory()?;
        Ok(Self::from_connection(conn, wrapper))
    }

    /// Wrap an open connection. Records the schema fingerprint on the
    /// diagnostic context and logs a `db_open` event.
    pub fn from_connection(conn: TrackedConnection, wrapper: DbCommandWrapper) -> Self {
        let ctx = wrapper.trace().context();
        let fingerprint = match schema_fingerprint(conn.conn()) {
            Ok(fingerprint) => {
                ctx.set_schema_fingerprint(fingerprint.clone());
                Some(fingerprint)
            }
            Err(e) => {
                debug!(error = %e, "schema fingerprint unavailable");
                None
            }
        };
        let target = conn
            .path()
            .map(|p| redact_connection_string(&p.to_string_lossy()))
            .unwrap_or_else(|| ":memory:".to_string());
        wrapper.trace().log(
            DiagLevel::Info,
            "db",
            "db_open",
            "Database opened",
            None,
            Some(data_map! {
                "target" => target,
                "connection_id" => conn.id(),
                "schema_hash" => fingerprint,
            }),
        );

        Self {
            interrupt: Arc::new(conn.interrupt_handle()),
            connection_id: conn.id(),
            path: conn.path().map(Path::to_path_buf),
            conn: Arc::new(Mutex::new(conn)),
            wrapper,
            shadow: None,
        }
    }

    /// Replay writes through `replicator`.
    pub fn with_shadow(mut self, replicator: ShadowReplicator) -> Self {
        self.shadow = Some(Arc::new(replicator));
        self
    }

    /// Attach a replicator configured from the diagnostic context.
    ///
    /// No-op for in-memory databases.
    pub fn with_configured_shadow(self) -> Self {
        let Some(path) = self.path.clone() else {
            return self;
        };
        let profile = self.wrapper.telemetry().profile();
        let replicator =
            ShadowReplicator::from_context(path, self.wrapper.trace().clone(), profile);
        self.with_shadow(replicator)
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn wrapper(&self) -> &DbCommandWrapper {
        &self.wrapper
    }

    pub fn shadow(&self) -> Option<&Arc<ShadowReplicator>> {
        self.shadow.as_ref()
    }

    /// Run a write. The shadow replay, if any, is left running detached.
    pub async fn execute_non_query(
        &self,
        sql: &str,
        params: Vec<SqlParam>,
        cancel: &CancellationToken,
    ) -> Result<usize, DbError> {
        Ok(self.execute_write(sql, params, cancel).await?.rows)
    }

    /// Run a write and return the shadow replay handle so the caller can
    /// await the verification result.
    pub async fn execute_write(
        &self,
        sql: &str,
        params: Vec<SqlParam>,
        cancel: &CancellationToken,
    ) -> Result<WriteOutcome, DbError> {
        let statement = sql.to_string();
        let bound = params.clone();
        let rows = self
            .run(cancel, move |wrapper, conn| {
                wrapper.execute_non_query(conn, &statement, &bound)
            })
            .await?;

        let shadow = self
            .shadow
            .as_ref()
            .filter(|replicator| replicator.enabled())
            .map(|replicator| {
                let replicator = replicator.clone();
                let sql = sql.to_string();
                let token = cancel.child_token();
                tokio::spawn(async move { replicator.replay(&sql, &params, rows, &token).await })
            });
        Ok(WriteOutcome { rows, shadow })
    }

    pub async fn execute_scalar(
        &self,
        sql: &str,
        params: Vec<SqlParam>,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>, DbError> {
        let statement = sql.to_string();
        self.run(cancel, move |wrapper, conn| {
            wrapper.execute_scalar(conn, &statement, &params)
        })
        .await
    }

    pub async fn execute_select(
        &self,
        sql: &str,
        params: Vec<SqlParam>,
        cancel: &CancellationToken,
    ) -> Result<DataTable, DbError> {
        let statement = sql.to_string();
        self.run(cancel, move |wrapper, conn| {
            wrapper.execute_select(conn, &statement, &params)
        })
        .await
    }

    /// Hash the current schema through the same queue as other calls.
    pub async fn schema_fingerprint(&self, cancel: &CancellationToken) -> Result<String, DbError> {
        self.run(cancel, |_, conn| Ok(schema_fingerprint(conn.conn())?)).await
    }

    async fn run<T, F>(&self, cancel: &CancellationToken, call: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&DbCommandWrapper, &TrackedConnection) -> Result<T, DbError> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        let conn = self.conn.clone();
        let wrapper = self.wrapper.clone();
        let token = cancel.clone();
        // Set while this call's statement owns the connection.
        let running = Arc::new(Mutex::new(false));
        let active = running.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            {
                let mut active = active.lock();
                if token.is_cancelled() {
                    return Err(DbError::Cancelled);
                }
                *active = true;
            }
            let result = call(&wrapper, &guard);
            *active.lock() = false;
            result
        });

        tokio::select! {
            joined = &mut task => joined?,
            _ = cancel.cancelled() => {
                if !self.interrupt_if_running(&running) {
                    // Still queued for the connection; the task sees the
                    // cancelled token once it gets the lock and never runs.
                    return Err(DbError::Cancelled);
                }
                match task.await? {
                    Err(e) if e.is_cancelled() => Err(DbError::Cancelled),
                    other => other,
                }
            }
        }
    }

    /// Interrupt the connection only while `running` marks this call's
    /// statement as the one executing on it.
    fn interrupt_if_running(&self, running: &Mutex<bool>) -> bool {
        let running = running.lock();
        if *running {
            self.interrupt.interrupt();
        }
        *running
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("connection_id", &self.connection_id)
            .field("path", &self.path)
            .field("shadow", &self.shadow)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{keys, ConfigSnapshot};
    use crate::db::telemetry::{BuildProfile, DbTelemetry};
    use crate::telemetry::trace::tests::{manager_with, RecordingWriter};
    use std::time::Duration;
    use tempfile::TempDir;

    fn wrapper(config: ConfigSnapshot) -> (DbCommandWrapper, Arc<RecordingWriter>) {
        let (trace, writer) = manager_with(config.with(keys::KEY_LEVEL, "trace"));
        let telemetry = Arc::new(DbTelemetry::new(BuildProfile::Development));
        (DbCommandWrapper::new(trace, telemetry), writer)
    }

    #[tokio::test]
    async fn test_open_records_fingerprint() {
        let (wrapper, writer) = wrapper(ConfigSnapshot::new());
        let db = Database::open_in_memory(wrapper).unwrap();
        let cancel = CancellationToken::new();
        db.execute_non_query("CREATE TABLE t (id INTEGER PRIMARY KEY)", vec![], &cancel)
            .await
            .unwrap();

        let opened = writer.named("db_open");
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].data_value("target"), Some(&serde_json::json!(":memory:")));
        assert!(db.wrapper().trace().context().schema_fingerprint().is_some());
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (wrapper, _writer) = wrapper(ConfigSnapshot::new());
        let db = Database::open_in_memory(wrapper).unwrap();
        let cancel = CancellationToken::new();
        db.execute_non_query(
            "CREATE TABLE parts (id INTEGER PRIMARY KEY, name TEXT)",
            vec![],
            &cancel,
        )
        .await
        .unwrap();
        let rows = db
            .execute_non_query(
                "INSERT INTO parts (id, name) VALUES (@id, @name)",
                vec![SqlParam::new("@id", 1i64), SqlParam::new("@name", "Valve".to_string())],
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(rows, 1);

        let name = db
            .execute_scalar(
                "SELECT name FROM parts WHERE id = @id",
                vec![SqlParam::new("@id", 1i64)],
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(name, Some(Value::Text("Valve".to_string())));

        let table = db.execute_select("SELECT * FROM parts", vec![], &cancel).await.unwrap();
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (wrapper, writer) = wrapper(ConfigSnapshot::new());
        let db = Database::open_in_memory(wrapper).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = db.execute_scalar("SELECT 1", vec![], &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(writer.named("exec_scalar").is_empty());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_long_query() {
        let (wrapper, _writer) = wrapper(ConfigSnapshot::new());
        let db = Database::open_in_memory(wrapper).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let endless = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                       SELECT COUNT(*) FROM c";
        let err = db.execute_scalar(endless, vec![], &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_while_queued_leaves_running_call_alone() {
        let (wrapper, writer) = wrapper(ConfigSnapshot::new());
        let db = Arc::new(Database::open_in_memory(wrapper).unwrap());
        let endless = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                       SELECT COUNT(*) FROM c";

        let running_token = CancellationToken::new();
        let running = {
            let db = db.clone();
            let token = running_token.clone();
            tokio::spawn(async move { db.execute_scalar(endless, vec![], &token).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let queued_token = CancellationToken::new();
        let trigger = queued_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let queued = tokio::time::timeout(
            Duration::from_secs(5),
            db.execute_scalar("SELECT 1", vec![], &queued_token),
        )
        .await
        .expect("queued call returns once cancelled");
        assert!(matches!(queued, Err(DbError::Cancelled)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!running.is_finished());

        running_token.cancel();
        let err = running.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());

        // The queued statement never reached the connection.
        assert!(writer.named("exec_scalar").is_empty());
    }

    #[tokio::test]
    async fn test_error_passes_through() {
        let (wrapper, _writer) = wrapper(ConfigSnapshot::new());
        let db = Database::open_in_memory(wrapper).unwrap();
        let err = db
            .execute_non_query("INSERT INTO nowhere VALUES (1)", vec![], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Sqlite(_)));
    }

    #[tokio::test]
    async fn test_write_replays_to_shadow() {
        let temp = TempDir::new().unwrap();
        let primary = temp.path().join("primary.db");
        let shadow = temp.path().join("shadow.db");
        for path in [&primary, &shadow] {
            TrackedConnection::open(path)
                .unwrap()
                .conn()
                .execute_batch("CREATE TABLE parts (id INTEGER PRIMARY KEY, name TEXT);")
                .unwrap();
        }
        let (wrapper, writer) = wrapper(
            ConfigSnapshot::new()
                .with(keys::KEY_SHADOW_ENABLED, "true")
                .with(keys::KEY_SHADOW_PATH, shadow.to_string_lossy().to_string())
                .with(format!("{}parts", keys::KEY_SHADOW_VERIFY_TABLES), "id"),
        );
        let replicator = ShadowReplicator::from_context(
            &primary,
            wrapper.trace().clone(),
            BuildProfile::Development,
        )
        .with_propagation_delay(Duration::from_millis(1));
        let db = Database::open(&primary, wrapper.clone())
            .unwrap()
            .with_shadow(replicator);

        let outcome = db
            .execute_write(
                "INSERT INTO parts (id, name) VALUES (@id, @name)",
                vec![SqlParam::new("@id", 5i64), SqlParam::new("@name", "Gasket".to_string())],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let report = outcome.shadow.unwrap().await.unwrap();
        assert_eq!(report.rows_match(), Some(true));
        assert!(report.verification.is_match());
        assert_eq!(writer.named("raw_verify_ok").len(), 1);
    }
}
