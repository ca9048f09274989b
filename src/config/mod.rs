// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for the diagnostics pipeline.
//!
//! Handles loading and flattening of configuration from multiple sources:
//! - Data directory: `<data dir>/gmp-diag/appsettings.{json,yaml,yml}`
//! - Executable directory: `appsettings.{json,yaml,yml}` next to the binary
//! - Environment: `GMP_DIAG_*` overrides, resolved per key at read time
//!
//! File precedence is executable dir > data dir; the environment beats both.
//! Typed resolution (env -> file -> default) lives on
//! [`DiagnosticContext`](crate::telemetry::DiagnosticContext).

pub mod keys;
mod loader;
mod types;

pub use loader::{
    default_search_dirs, find_config_file, get_data_dir, load_config_file, load_merged,
    CONFIG_FILES,
};

pub use types::{ConfigSnapshot, KEY_SEPARATOR};

pub use keys::env_var_name;

use crate::error::ConfigError;

/// Load and merge configuration from the default locations.
///
/// This is the main entry point for configuration loading.
pub fn load_config() -> Result<ConfigSnapshot, ConfigError> {
    load_merged(&default_search_dirs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_search_dirs_not_empty() {
        // The executable directory is always resolvable under `cargo test`.
        assert!(!default_search_dirs().is_empty());
    }
}
