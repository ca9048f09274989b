// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files.
//!
//! Handles loading `appsettings` files in JSON or YAML from an ordered list of
//! search directories.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::ConfigError;

use super::keys::APP_DIR;
use super::types::ConfigSnapshot;

/// Config file names to search for in each directory (in order).
pub const CONFIG_FILES: &[&str] = &["appsettings.json", "appsettings.yaml", "appsettings.yml"];

/// Get the per-user application data directory.
pub fn get_data_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join(APP_DIR))
}

/// Default search directories: the data directory, then the executable's directory.
///
/// Later directories take precedence.
pub fn default_search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(data) = get_data_dir() {
        dirs.push(data);
    }
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        dirs.push(exe_dir);
    }
    dirs
}

/// Load a configuration file (JSON or YAML) into a flattened snapshot.
pub fn load_config_file(path: &Path) -> Result<ConfigSnapshot, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    let value: Value = match extension.to_lowercase().as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content)?,
        _ => serde_json::from_str(&content)?,
    };

    if !value.is_object() {
        return Err(ConfigError::InvalidFormat(format!(
            "{}: top level must be a mapping",
            path.display()
        )));
    }

    let mut snapshot = ConfigSnapshot::from_value(&value);
    snapshot.add_source(path);
    Ok(snapshot)
}

/// Find the first config file present in `dir`.
pub fn find_config_file(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Load and merge the config files found in `search_dirs`.
///
/// Directories without a config file are skipped; later files override
/// earlier ones key by key.
pub fn load_merged(search_dirs: &[PathBuf]) -> Result<ConfigSnapshot, ConfigError> {
    let mut merged = ConfigSnapshot::new();
    for dir in search_dirs {
        if let Some(path) = find_config_file(dir) {
            merged.merge(load_config_file(&path)?);
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_files_order() {
        assert_eq!(CONFIG_FILES.len(), 3);
        assert_eq!(CONFIG_FILES[0], "appsettings.json");
    }

    #[test]
    fn test_load_config_file_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("appsettings.json");
        std::fs::write(
            &path,
            r#"{"Diagnostics": {"Level": "debug", "SlowQueryMs": 100}}"#,
        )
        .unwrap();

        let snapshot = load_config_file(&path).unwrap();
        assert_eq!(snapshot.get("Diagnostics:Level"), Some("debug"));
        assert_eq!(snapshot.get("Diagnostics:SlowQueryMs"), Some("100"));
        assert_eq!(snapshot.primary_source(), Some(path.as_path()));
    }

    #[test]
    fn test_load_config_file_yaml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("appsettings.yaml");
        std::fs::write(
            &path,
            "Diagnostics:\n  Sinks: file,sqlite\n  DbShadow:\n    Enabled: true\n",
        )
        .unwrap();

        let snapshot = load_config_file(&path).unwrap();
        assert_eq!(snapshot.get("Diagnostics:Sinks"), Some("file,sqlite"));
        assert_eq!(snapshot.get("Diagnostics:DbShadow:Enabled"), Some("true"));
    }

    #[test]
    fn test_load_config_file_rejects_scalar() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("appsettings.json");
        std::fs::write(&path, "42").unwrap();

        let result = load_config_file(&path);
        assert!(matches!(result, Err(ConfigError::InvalidFormat(_))));
    }

    #[test]
    fn test_load_merged_later_dir_wins() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        std::fs::write(
            first.path().join("appsettings.json"),
            r#"{"Diagnostics": {"Level": "info", "Sinks": "file"}}"#,
        )
        .unwrap();
        std::fs::write(
            second.path().join("appsettings.yml"),
            "Diagnostics:\n  Level: warn\n",
        )
        .unwrap();

        let merged =
            load_merged(&[first.path().to_path_buf(), second.path().to_path_buf()]).unwrap();
        assert_eq!(merged.get("Diagnostics:Level"), Some("warn"));
        assert_eq!(merged.get("Diagnostics:Sinks"), Some("file"));
        assert_eq!(merged.sources().len(), 2);
    }

    #[test]
    fn test_load_merged_no_files() {
        let temp = TempDir::new().unwrap();
        let merged = load_merged(&[temp.path().to_path_buf()]).unwrap();
        assert!(merged.is_empty());
        assert!(merged.primary_source().is_none());
    }
}
