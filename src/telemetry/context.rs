// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process-wide diagnostic context.
//!
//! Holds the ambient correlation/span state, the caller identity, immutable
//! host facts, and typed access to configuration.
//!
//! # Concurrency
//!
//! One context is shared by the whole process. The span fields are mutated
//! in place, so nested span accounting is only exact within a single
//! sequential call chain; concurrent chains that start spans on the same
//! context can overwrite each other's parent linkage. Every read returns a
//! consistent snapshot of the three identifiers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::{env_var_name, get_data_dir, keys, ConfigSnapshot};

use super::correlation::{CorrelationId, SpanId};
use super::event::DiagLevel;
use super::probe::{HostFacts, HostProbe, SystemProbe};

/// Environment lookup used for overrides; injectable for tests.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Who is acting. Set by the host after login; copied onto every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub roles: Vec<String>,
    pub session_id: Option<String>,
    pub ip: Option<String>,
}

impl Identity {
    /// Roles as a comma-separated list, `None` when there are none.
    pub fn roles_csv(&self) -> Option<String> {
        if self.roles.is_empty() {
            None
        } else {
            Some(self.roles.join(","))
        }
    }
}

/// Consistent read of the correlation/span triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanSnapshot {
    pub correlation_id: CorrelationId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
}

#[derive(Debug)]
struct SpanState {
    correlation_id: CorrelationId,
    span_id: SpanId,
    parent_span_id: Option<SpanId>,
}

/// Remote collector settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSettings {
    pub url: Option<String>,
    pub index: Option<String>,
    pub api_key: Option<String>,
    pub bearer_token: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// Ambient configuration and identity for the diagnostics pipeline.
pub struct DiagnosticContext {
    config: ConfigSnapshot,
    env: EnvLookup,
    facts: HostFacts,
    span: RwLock<SpanState>,
    identity: RwLock<Identity>,
    schema_fingerprint: RwLock<Option<String>>,
}

impl std::fmt::Debug for DiagnosticContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticContext")
            .field("facts", &self.facts)
            .field("span", &*self.span.read())
            .field("identity", &*self.identity.read())
            .finish_non_exhaustive()
    }
}

impl DiagnosticContext {
    /// Build a context over `config`, capturing host facts from `probe`.
    ///
    /// Environment overrides are read from the process environment.
    pub fn new(config: ConfigSnapshot, probe: &dyn HostProbe) -> Self {
        Self {
            config,
            env: Arc::new(|name| std::env::var(name).ok()),
            facts: HostFacts::capture(probe),
            span: RwLock::new(SpanState {
                correlation_id: CorrelationId::new(),
                span_id: SpanId::new(),
                parent_span_id: None,
            }),
            identity: RwLock::new(Identity::default()),
            schema_fingerprint: RwLock::new(None),
        }
    }

    /// Build a context with the system probe.
    pub fn from_process(config: ConfigSnapshot) -> Self {
        Self::new(config, &SystemProbe::new())
    }

    /// Replace the environment lookup.
    pub fn with_env(mut self, env: EnvLookup) -> Self {
        self.env = env;
        self
    }

    /// Use a fixed set of environment variables (and nothing from the process).
    pub fn with_env_map(self, vars: BTreeMap<String, String>) -> Self {
        self.with_env(Arc::new(move |name| vars.get(name).cloned()))
    }

    /// The configuration snapshot this context resolves against.
    pub fn config(&self) -> &ConfigSnapshot {
        &self.config
    }

    // ------------------------------------------------------------------
    // Correlation and spans
    // ------------------------------------------------------------------

    /// Current correlation id.
    pub fn correlation_id(&self) -> CorrelationId {
        self.span.read().correlation_id.clone()
    }

    /// Current span id.
    pub fn span_id(&self) -> SpanId {
        self.span.read().span_id.clone()
    }

    /// Current parent span id.
    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.span.read().parent_span_id.clone()
    }

    /// Read all three identifiers at once.
    pub fn span_snapshot(&self) -> SpanSnapshot {
        let state = self.span.read();
        SpanSnapshot {
            correlation_id: state.correlation_id.clone(),
            span_id: state.span_id.clone(),
            parent_span_id: state.parent_span_id.clone(),
        }
    }

    /// Start a new logical operation.
    ///
    /// Uses `id` when given (and non-blank), otherwise generates one. Clears
    /// the parent span and allocates a fresh span id.
    pub fn new_correlation(&self, id: Option<&str>) -> CorrelationId {
        let correlation_id = CorrelationId::from_token(id);
        let mut state = self.span.write();
        state.correlation_id = correlation_id.clone();
        state.parent_span_id = None;
        state.span_id = SpanId::new();
        correlation_id
    }

    /// Enter a child span. Returns the span that was current, now the parent.
    pub fn push_span(&self) -> SpanId {
        let mut state = self.span.write();
        let parent = std::mem::replace(&mut state.span_id, SpanId::new());
        state.parent_span_id = Some(parent.clone());
        parent
    }

    /// Leave a span, restoring `parent` as the parent link.
    ///
    /// A fresh span id is allocated rather than restoring the previous one,
    /// so every span boundary carries its own identifier.
    pub fn pop_span(&self, parent: Option<SpanId>) {
        let mut state = self.span.write();
        state.span_id = SpanId::new();
        state.parent_span_id = parent;
    }

    // ------------------------------------------------------------------
    // Identity and facts
    // ------------------------------------------------------------------

    /// Current identity.
    pub fn identity(&self) -> Identity {
        self.identity.read().clone()
    }

    /// Replace the identity wholesale.
    pub fn set_identity(&self, identity: Identity) {
        *self.identity.write() = identity;
    }

    /// Mutate the identity in place.
    pub fn update_identity(&self, f: impl FnOnce(&mut Identity)) {
        f(&mut self.identity.write());
    }

    /// Forget the identity (logout).
    pub fn clear_identity(&self) {
        *self.identity.write() = Identity::default();
    }

    pub fn facts(&self) -> &HostFacts {
        &self.facts
    }

    pub fn app_version(&self) -> Option<&str> {
        self.facts.app_version.as_deref()
    }

    pub fn os_version(&self) -> Option<&str> {
        self.facts.os_version.as_deref()
    }

    pub fn device(&self) -> Option<&str> {
        self.facts.device.as_deref()
    }

    pub fn source_revision(&self) -> Option<&str> {
        self.facts.source_revision.as_deref()
    }

    /// Schema fingerprint, once known.
    pub fn schema_fingerprint(&self) -> Option<String> {
        self.schema_fingerprint.read().clone()
    }

    /// Record the schema fingerprint (typically after connecting to the store).
    pub fn set_schema_fingerprint(&self, fingerprint: impl Into<String>) {
        *self.schema_fingerprint.write() = Some(fingerprint.into());
    }

    // ------------------------------------------------------------------
    // Typed settings: environment, then config file, then default
    // ------------------------------------------------------------------

    fn env_value(&self, key: &str) -> Option<String> {
        (self.env)(&env_var_name(key)).filter(|v| !v.trim().is_empty())
    }

    fn config_value(&self, key: &str) -> Option<&str> {
        self.config.get(key).filter(|v| !v.trim().is_empty())
    }

    fn resolve<T>(&self, key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        self.env_value(key)
            .and_then(|v| parse(v.trim()))
            .or_else(|| self.config_value(key).and_then(|v| parse(v.trim())))
    }

    /// Resolve a boolean setting.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.resolve(key, parse_bool).unwrap_or(default)
    }

    /// Resolve an integer setting.
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.resolve(key, |v| v.parse::<i64>().ok()).unwrap_or(default)
    }

    /// Resolve a floating-point setting.
    pub fn get_double(&self, key: &str, default: f64) -> f64 {
        self.resolve(key, |v| v.parse::<f64>().ok().filter(|d| d.is_finite()))
            .unwrap_or(default)
    }

    /// Resolve a string setting.
    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get_opt_string(key).unwrap_or_else(|| default.to_string())
    }

    /// Resolve a string setting with no default.
    pub fn get_opt_string(&self, key: &str) -> Option<String> {
        self.env_value(key)
            .or_else(|| self.config_value(key).map(str::to_string))
    }

    pub fn enabled(&self) -> bool {
        self.get_bool(keys::KEY_ENABLED, true)
    }

    pub fn redaction_enabled(&self) -> bool {
        self.get_bool(keys::KEY_REDACTION_ENABLED, true)
    }

    pub fn min_level(&self) -> DiagLevel {
        DiagLevel::parse_lenient(&self.get_string(keys::KEY_LEVEL, keys::DEFAULT_LEVEL))
    }

    /// Configured sink names, trimmed, blanks removed.
    pub fn sinks(&self) -> Vec<String> {
        self.get_string(keys::KEY_SINKS, keys::DEFAULT_SINKS)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn slow_query_ms(&self) -> u64 {
        non_negative(self.get_int(keys::KEY_SLOW_QUERY_MS, keys::DEFAULT_SLOW_QUERY_MS))
    }

    pub fn rolling_max_mb(&self) -> u64 {
        non_negative(self.get_int(keys::KEY_ROLLING_MAX_MB, keys::DEFAULT_ROLLING_MAX_MB))
    }

    pub fn rolling_max_days(&self) -> u64 {
        non_negative(self.get_int(keys::KEY_ROLLING_MAX_DAYS, keys::DEFAULT_ROLLING_MAX_DAYS))
    }

    pub fn top_n_release(&self) -> usize {
        non_negative(self.get_int(keys::KEY_TOP_N_RELEASE, keys::DEFAULT_TOP_N_RELEASE)) as usize
    }

    /// Random sampling percentage, clamped to `0.0..=100.0`.
    pub fn random_percent_release(&self) -> f64 {
        self.get_double(
            keys::KEY_RANDOM_PERCENT_RELEASE,
            keys::DEFAULT_RANDOM_PERCENT_RELEASE,
        )
        .clamp(0.0, 100.0)
    }

    pub fn queue_capacity(&self) -> usize {
        non_negative(self.get_int(keys::KEY_QUEUE_CAPACITY, keys::DEFAULT_QUEUE_CAPACITY)) as usize
    }

    pub fn queue_drain_batch(&self) -> usize {
        non_negative(self.get_int(keys::KEY_QUEUE_DRAIN_BATCH, keys::DEFAULT_QUEUE_DRAIN_BATCH))
            as usize
    }

    pub fn queue_drain_interval_ms(&self) -> u64 {
        non_negative(self.get_int(
            keys::KEY_QUEUE_DRAIN_INTERVAL_MS,
            keys::DEFAULT_QUEUE_DRAIN_INTERVAL_MS,
        ))
    }

    /// Directory for file-backed sinks.
    pub fn log_directory(&self) -> PathBuf {
        self.get_opt_string(keys::KEY_LOG_DIRECTORY)
            .map(PathBuf::from)
            .unwrap_or_else(|| default_subdir("logs"))
    }

    /// Directory crash bundles are written to.
    pub fn crash_directory(&self) -> PathBuf {
        self.get_opt_string(keys::KEY_CRASH_DIRECTORY)
            .map(PathBuf::from)
            .unwrap_or_else(|| default_subdir("crash"))
    }

    /// Shadow store target, only when shadowing is switched on.
    /// Run the self-test suite whenever a database is opened.
    pub fn self_test_on_open(&self) -> bool {
        self.get_bool(keys::KEY_SELFTEST_ON_OPEN, false)
    }

    pub fn shadow_path(&self) -> Option<PathBuf> {
        if !self.get_bool(keys::KEY_SHADOW_ENABLED, false) {
            return None;
        }
        self.get_opt_string(keys::KEY_SHADOW_PATH).map(PathBuf::from)
    }

    /// Tables eligible for read-after-write verification: table -> primary key.
    pub fn shadow_verify_tables(&self) -> BTreeMap<String, String> {
        self.config
            .entries_with_prefix(keys::KEY_SHADOW_VERIFY_TABLES)
            .into_iter()
            .filter_map(|(table, _)| {
                let key = format!("{}{}", keys::KEY_SHADOW_VERIFY_TABLES, table);
                let pk = self.get_opt_string(&key)?;
                let pk = pk.trim().to_string();
                (!table.is_empty() && !pk.is_empty()).then_some((table, pk))
            })
            .collect()
    }

    /// Remote collector settings.
    pub fn remote_settings(&self) -> RemoteSettings {
        RemoteSettings {
            url: self.get_opt_string(keys::KEY_REMOTE_URL),
            index: self.get_opt_string(keys::KEY_REMOTE_INDEX),
            api_key: self.get_opt_string(keys::KEY_REMOTE_API_KEY),
            bearer_token: self.get_opt_string(keys::KEY_REMOTE_BEARER_TOKEN),
            headers: self
                .config
                .entries_with_prefix(keys::KEY_REMOTE_HEADERS)
                .into_iter()
                .filter(|(name, value)| !name.is_empty() && !value.trim().is_empty())
                .collect(),
        }
    }
}

/// Parse `true`/`false` case-insensitively; anything else is unparseable.
fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

fn non_negative(value: i64) -> u64 {
    value.max(0) as u64
}

fn default_subdir(name: &str) -> PathBuf {
    get_data_dir()
        .unwrap_or_else(|| PathBuf::from(".").join(keys::APP_DIR))
        .join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::probe::StaticProbe;

    fn context(config: ConfigSnapshot, env: &[(&str, &str)]) -> DiagnosticContext {
        let vars = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DiagnosticContext::new(config, &StaticProbe::default()).with_env_map(vars)
    }

    #[test]
    fn test_defaults() {
        let ctx = context(ConfigSnapshot::new(), &[]);
        assert!(ctx.enabled());
        assert!(ctx.redaction_enabled());
        assert_eq!(ctx.min_level(), DiagLevel::Info);
        assert_eq!(ctx.sinks(), vec!["file".to_string(), "stdout".to_string()]);
        assert_eq!(ctx.slow_query_ms(), 500);
        assert_eq!(ctx.top_n_release(), 20);
        assert_eq!(ctx.random_percent_release(), 1.0);
        assert!(ctx.shadow_path().is_none());
    }

    #[test]
    fn test_env_beats_config() {
        let config = ConfigSnapshot::new().with(keys::KEY_SLOW_QUERY_MS, "250");
        let ctx = context(config, &[("GMP_DIAG_SLOWQUERYMS", "75")]);
        assert_eq!(ctx.slow_query_ms(), 75);
    }

    #[test]
    fn test_unparseable_env_falls_through() {
        let config = ConfigSnapshot::new()
            .with(keys::KEY_SLOW_QUERY_MS, "250")
            .with(keys::KEY_ENABLED, "false");
        let ctx = context(
            config,
            &[("GMP_DIAG_SLOWQUERYMS", "fast"), ("GMP_DIAG_ENABLED", "yes")],
        );
        assert_eq!(ctx.slow_query_ms(), 250);
        assert!(!ctx.enabled());
    }

    #[test]
    fn test_unparseable_config_falls_to_default() {
        let config = ConfigSnapshot::new()
            .with(keys::KEY_RANDOM_PERCENT_RELEASE, "lots")
            .with(keys::KEY_LEVEL, "chatty");
        let ctx = context(config, &[]);
        assert_eq!(ctx.random_percent_release(), 1.0);
        assert_eq!(ctx.min_level(), DiagLevel::Info);
    }

    #[test]
    fn test_sinks_trimmed() {
        let config = ConfigSnapshot::new().with(keys::KEY_SINKS, " file , ,sqlite ");
        let ctx = context(config, &[]);
        assert_eq!(ctx.sinks(), vec!["file".to_string(), "sqlite".to_string()]);
    }

    #[test]
    fn test_new_correlation() {
        let ctx = context(ConfigSnapshot::new(), &[]);
        ctx.push_span();
        assert!(ctx.parent_span_id().is_some());

        let id = ctx.new_correlation(Some("req-7"));
        assert_eq!(id.as_str(), "req-7");
        assert_eq!(ctx.correlation_id().as_str(), "req-7");
        assert!(ctx.parent_span_id().is_none());

        let generated = ctx.new_correlation(None);
        assert_eq!(generated.as_str().len(), 32);
    }

    #[test]
    fn test_push_pop_span() {
        let ctx = context(ConfigSnapshot::new(), &[]);
        let root = ctx.span_id();

        let parent = ctx.push_span();
        assert_eq!(parent, root);
        assert_eq!(ctx.parent_span_id(), Some(root.clone()));
        let child = ctx.span_id();
        assert_ne!(child, root);

        ctx.pop_span(None);
        assert!(ctx.parent_span_id().is_none());
        // Pop allocates a fresh id instead of restoring the old one.
        assert_ne!(ctx.span_id(), root);
        assert_ne!(ctx.span_id(), child);
    }

    #[test]
    fn test_shadow_settings() {
        let config = ConfigSnapshot::new()
            .with(keys::KEY_SHADOW_ENABLED, "true")
            .with(keys::KEY_SHADOW_PATH, "/tmp/shadow.db")
            .with("Diagnostics:DbShadow:VerifyTables:parts", "id")
            .with("Diagnostics:DbShadow:VerifyTables:work_orders", " ");
        let ctx = context(config, &[]);

        assert_eq!(ctx.shadow_path(), Some(PathBuf::from("/tmp/shadow.db")));
        let tables = ctx.shadow_verify_tables();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables.get("parts").map(String::as_str), Some("id"));
    }

    #[test]
    fn test_shadow_path_requires_enabled() {
        let config = ConfigSnapshot::new().with(keys::KEY_SHADOW_PATH, "/tmp/shadow.db");
        let ctx = context(config, &[]);
        assert!(ctx.shadow_path().is_none());
    }

    #[test]
    fn test_identity_roles_csv() {
        let ctx = context(ConfigSnapshot::new(), &[]);
        ctx.update_identity(|id| {
            id.user_id = Some(7);
            id.roles = vec!["qa".to_string(), "admin".to_string()];
        });
        assert_eq!(ctx.identity().roles_csv().as_deref(), Some("qa,admin"));
        ctx.clear_identity();
        assert!(ctx.identity().user_id.is_none());
    }

    #[test]
    fn test_remote_headers() {
        let config = ConfigSnapshot::new()
            .with(keys::KEY_REMOTE_URL, "http://collector:9200")
            .with("Diagnostics:Remote:Headers:X-Tenant", "plant-3");
        let ctx = context(config, &[]);
        let remote = ctx.remote_settings();
        assert_eq!(remote.url.as_deref(), Some("http://collector:9200"));
        assert_eq!(remote.headers.get("X-Tenant").map(String::as_str), Some("plant-3"));
    }
}
