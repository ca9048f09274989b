// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SQLite connections carrying a process-unique identifier.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rusqlite::{Connection, InterruptHandle, OpenFlags};

/// Default per-statement busy wait, reported as the command timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A connection plus the identifier reported on every instrumented call.
#[derive(Debug)]
pub struct TrackedConnection {
    conn: Connection,
    id: u64,
    path: Option<PathBuf>,
    command_timeout: Duration,
}

impl TrackedConnection {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        Self::wrap(conn, Some(path.to_path_buf()))
    }

    /// Open an existing database without creating it.
    pub fn open_existing(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::wrap(conn, Some(path.to_path_buf()))
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::wrap(Connection::open_in_memory()?, None)
    }

    fn wrap(conn: Connection, path: Option<PathBuf>) -> rusqlite::Result<Self> {
        conn.busy_timeout(DEFAULT_COMMAND_TIMEOUT)?;
        Ok(Self {
            conn,
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            path,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        })
    }

    /// Change how long a statement waits on a locked database.
    pub fn set_command_timeout(&mut self, timeout: Duration) -> rusqlite::Result<()> {
        self.conn.busy_timeout(timeout)?;
        self.command_timeout = timeout;
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Handle that aborts the running statement from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.conn.get_interrupt_handle()
    }
}

/// Extract the file from `Data Source=...` style connection text.
///
/// Text without any `=` is taken as a plain path.
pub fn parse_data_source(conn_str: &str) -> Option<PathBuf> {
    let trimmed = conn_str.trim();
    if trimmed.is_empty() {
        return None;
    }
    if !trimmed.contains('=') {
        return Some(PathBuf::from(trimmed));
    }
    trimmed.split(';').find_map(|part| {
        let (key, value) = part.split_once('=')?;
        let key: String = key
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        let value = value.trim();
        matches!(key.as_str(), "datasource" | "filename" | "database" | "path")
            .then(|| PathBuf::from(value))
            .filter(|_| !value.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ids_unique() {
        let a = TrackedConnection::open_in_memory().unwrap();
        let b = TrackedConnection::open_in_memory().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.command_timeout(), DEFAULT_COMMAND_TIMEOUT);
    }

    #[test]
    fn test_open_existing_requires_file() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing.db");
        assert!(TrackedConnection::open_existing(&missing).is_err());

        let created = TrackedConnection::open(&missing).unwrap();
        assert_eq!(created.path(), Some(missing.as_path()));
        drop(created);
        assert!(TrackedConnection::open_existing(&missing).is_ok());
    }

    #[test]
    fn test_parse_data_source() {
        assert_eq!(parse_data_source("/var/gmp/app.db"), Some(PathBuf::from("/var/gmp/app.db")));
        assert_eq!(
            parse_data_source("Data Source=/tmp/x.db;Password=secret"),
            Some(PathBuf::from("/tmp/x.db"))
        );
        assert_eq!(parse_data_source("Password=secret"), None);
        assert_eq!(parse_data_source("  "), None);
    }
}
