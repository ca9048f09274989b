// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the diagnostics pipeline.
//!
//! This module provides strongly-typed errors for different parts of the pipeline,
//! using `thiserror` for ergonomic error definitions and `anyhow` for error propagation.
//!
//! Only [`ConfigError`] and [`DbError`] ever reach callers. Sink and crash-bundle
//! errors are produced internally and swallowed at the telemetry boundary.

use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid config format: {0}")]
    InvalidFormat(String),

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Errors surfaced by the instrumented database gateway.
///
/// The wrapped [`rusqlite::Error`] is the caller's original fault, untouched.
#[derive(Error, Debug)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("SQL text is empty")]
    EmptyStatement,

    #[error("Database call cancelled")]
    Cancelled,

    #[error("Database task failed: {0}")]
    TaskFailed(String),
}

impl DbError {
    /// Check if the call was stopped by its cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::OperationInterrupted
            }
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for DbError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskFailed(err.to_string())
    }
}

/// Errors raised while a sink writes a batch.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Sink closed")]
    Closed,
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Errors raised while assembling a crash bundle artifact.
#[derive(Error, Debug)]
pub enum CrashError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Crash handling already in progress")]
    Reentrant,
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_from_json() {
        let result: std::result::Result<serde_json::Value, _> =
            serde_json::from_str("invalid json");
        let json_err = result.unwrap_err();
        let config_err: ConfigError = json_err.into();
        assert!(matches!(config_err, ConfigError::JsonError(_)));
    }

    #[test]
    fn test_config_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let config_err: ConfigError = io_err.into();
        assert!(matches!(config_err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_db_error_transparent_message() {
        let err: DbError = rusqlite::Error::InvalidParameterName("@nope".to_string()).into();
        assert_eq!(
            err.to_string(),
            rusqlite::Error::InvalidParameterName("@nope".to_string()).to_string()
        );
        assert!(!err.is_cancelled());
        assert!(DbError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_sink_error_display() {
        let err = SinkError::Http("503 Service Unavailable".to_string());
        assert!(err.to_string().contains("503"));
    }
}
