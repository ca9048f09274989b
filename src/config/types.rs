// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! Configuration files are flattened into a case-insensitive `Section:Key`
//! map so that every setting can be addressed (and overridden from the
//! environment) by a single string key.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

/// Separator between nested configuration sections.
pub const KEY_SEPARATOR: char = ':';

/// A flattened, case-insensitive view over one or more configuration files.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigSnapshot {
    /// Lower-cased key -> (key as written, value).
    entries: BTreeMap<String, (String, String)>,

    /// Files that contributed to this snapshot, in load order.
    #[serde(skip)]
    sources: Vec<PathBuf>,
}

impl ConfigSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot by flattening a JSON document.
    pub fn from_value(value: &Value) -> Self {
        let mut snapshot = Self::new();
        flatten_into(&mut snapshot, None, value);
        snapshot
    }

    /// Look up a value by key (case-insensitive).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(|(_, value)| value.as_str())
    }

    /// Set a value, replacing any existing one with the same key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.entries
            .insert(key.to_ascii_lowercase(), (key, value.into()));
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// All entries whose key starts with `prefix` (case-insensitive).
    ///
    /// Returns `(suffix, value)` pairs with the suffix as originally written.
    pub fn entries_with_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        let lowered = prefix.to_ascii_lowercase();
        self.entries
            .range(lowered.clone()..)
            .take_while(|(key, _)| key.starts_with(&lowered))
            .map(|(_, (key, value))| (key[prefix.len()..].to_string(), value.clone()))
            .collect()
    }

    /// Merge another snapshot over this one; its values win.
    pub fn merge(&mut self, other: ConfigSnapshot) {
        self.entries.extend(other.entries);
        self.sources.extend(other.sources);
    }

    /// Record the file this snapshot was loaded from.
    pub(crate) fn add_source(&mut self, path: &Path) {
        self.sources.push(path.to_path_buf());
    }

    /// Files that contributed to this snapshot, in load order.
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// The last loaded file, i.e. the one with the highest precedence.
    pub fn primary_source(&self) -> Option<&Path> {
        self.sources.last().map(PathBuf::as_path)
    }

    /// Number of flattened entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn flatten_into(snapshot: &mut ConfigSnapshot, prefix: Option<String>, value: &Value) {
    let join = |key: &str| match &prefix {
        Some(p) => format!("{}{}{}", p, KEY_SEPARATOR, key),
        None => key.to_string(),
    };

    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(snapshot, Some(join(key)), child);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_into(snapshot, Some(join(&index.to_string())), child);
            }
        }
        Value::Null => {}
        Value::String(s) => {
            if let Some(key) = prefix {
                snapshot.set(key, s.clone());
            }
        }
        other => {
            if let Some(key) = prefix {
                snapshot.set(key, other.to_string());
            }
        }
    }
}
