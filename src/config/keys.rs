// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration keys, defaults, and the environment-variable name transform.

/// Prefix for every environment override.
pub const ENV_PREFIX: &str = "GMP_DIAG_";

/// Section that owns all pipeline settings.
pub const SECTION: &str = "Diagnostics:";

pub const KEY_ENABLED: &str = "Diagnostics:Enabled";
pub const KEY_LEVEL: &str = "Diagnostics:Level";
pub const KEY_SINKS: &str = "Diagnostics:Sinks";
pub const KEY_SLOW_QUERY_MS: &str = "Diagnostics:SlowQueryMs";
pub const KEY_ROLLING_MAX_MB: &str = "Diagnostics:RollingMaxMb";
pub const KEY_ROLLING_MAX_DAYS: &str = "Diagnostics:RollingMaxDays";
pub const KEY_TOP_N_RELEASE: &str = "Diagnostics:TopNRelease";
pub const KEY_RANDOM_PERCENT_RELEASE: &str = "Diagnostics:RandomPercentRelease";
pub const KEY_REDACTION_ENABLED: &str = "Diagnostics:RedactionEnabled";
pub const KEY_LOG_DIRECTORY: &str = "Diagnostics:LogDirectory";
pub const KEY_CRASH_DIRECTORY: &str = "Diagnostics:CrashDirectory";

pub const KEY_QUEUE_CAPACITY: &str = "Diagnostics:Queue:Capacity";
pub const KEY_QUEUE_DRAIN_BATCH: &str = "Diagnostics:Queue:DrainBatch";
pub const KEY_QUEUE_DRAIN_INTERVAL_MS: &str = "Diagnostics:Queue:DrainIntervalMs";

pub const KEY_SHADOW_ENABLED: &str = "Diagnostics:DbShadow:Enabled";
pub const KEY_SHADOW_PATH: &str = "Diagnostics:DbShadow:Path";
pub const KEY_SHADOW_VERIFY_TABLES: &str = "Diagnostics:DbShadow:VerifyTables:";

pub const KEY_SELFTEST_ON_OPEN: &str = "Diagnostics:SelfTest:OnOpen";

pub const KEY_REMOTE_URL: &str = "Diagnostics:Remote:Url";
pub const KEY_REMOTE_INDEX: &str = "Diagnostics:Remote:Index";
pub const KEY_REMOTE_API_KEY: &str = "Diagnostics:Remote:ApiKey";
pub const KEY_REMOTE_BEARER_TOKEN: &str = "Diagnostics:Remote:BearerToken";
pub const KEY_REMOTE_HEADERS: &str = "Diagnostics:Remote:Headers:";

pub const DEFAULT_SINKS: &str = "file,stdout";
pub const DEFAULT_LEVEL: &str = "info";
pub const DEFAULT_SLOW_QUERY_MS: i64 = 500;
pub const DEFAULT_ROLLING_MAX_MB: i64 = 10;
pub const DEFAULT_ROLLING_MAX_DAYS: i64 = 7;
pub const DEFAULT_TOP_N_RELEASE: i64 = 20;
pub const DEFAULT_RANDOM_PERCENT_RELEASE: f64 = 1.0;

pub const DEFAULT_QUEUE_CAPACITY: i64 = 10_000;
pub const DEFAULT_QUEUE_DRAIN_BATCH: i64 = 256;
pub const DEFAULT_QUEUE_DRAIN_INTERVAL_MS: i64 = 200;

/// Application directory name under the platform data directory.
pub const APP_DIR: &str = "gmp-diag";

/// Derive the environment variable that overrides `key`.
///
/// `Diagnostics:SlowQueryMs` becomes `GMP_DIAG_SLOWQUERYMS` and
/// `Diagnostics:DbShadow:Path` becomes `GMP_DIAG_DBSHADOWPATH`.
pub fn env_var_name(key: &str) -> String {
    let core = key.strip_prefix(SECTION).unwrap_or(key);
    let mut name = String::with_capacity(ENV_PREFIX.len() + core.len());
    name.push_str(ENV_PREFIX);
    name.extend(
        core.chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase()),
    );
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_name_strips_section() {
        assert_eq!(env_var_name(KEY_SLOW_QUERY_MS), "GMP_DIAG_SLOWQUERYMS");
        assert_eq!(env_var_name(KEY_SHADOW_PATH), "GMP_DIAG_DBSHADOWPATH");
        assert_eq!(env_var_name(KEY_QUEUE_DRAIN_INTERVAL_MS), "GMP_DIAG_QUEUEDRAININTERVALMS");
    }

    #[test]
    fn test_env_var_name_drops_separators() {
        assert_eq!(env_var_name("Custom:some-key_2"), "GMP_DIAG_CUSTOMSOMEKEY2");
    }
}
