// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-call database instrumentation policy.
//!
//! SQL signatures, the slow-query registry, the sampling decision and
//! repeated-query (N+1) detection.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;

use crate::data_map;
use crate::telemetry::{DiagLevel, DiagnosticContext, TraceManager};

/// Event name of the repeated-query warning.
pub const N_PLUS_ONE_EVENT: &str = "n_plus_one_suspect";
/// Repeat count at which the warning fires, once per key.
pub const N_PLUS_ONE_THRESHOLD: u64 = 3;

/// Slowest calls kept by the registry.
const MAX_SLOWEST: usize = 100;
/// Most recent calls kept by the registry.
const MAX_RECENT: usize = 50;
/// Distinct signatures tracked before the per-signature stats are reset.
const MAX_SIGNATURES: usize = 2_000;
/// Distinct `(correlation, signature)` keys before the repeat counters are reset.
const MAX_REPEAT_KEYS: usize = 50_000;

/// Which build the sampling policy should assume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildProfile {
    /// Every call is sampled; shadow replay is allowed.
    Development,
    /// Top-N and random sampling; shadow replay is off.
    Release,
}

impl BuildProfile {
    /// The profile this binary was compiled with.
    pub fn current() -> Self {
        if cfg!(debug_assertions) {
            Self::Development
        } else {
            Self::Release
        }
    }

    pub fn is_development(self) -> bool {
        self == Self::Development
    }
}

/// Normalize statement text into a comparable shape key.
///
/// Line breaks become spaces, runs of spaces collapse, the result is
/// trimmed and lower-cased. Literal values are not touched.
pub fn signature_of(sql: &str) -> String {
    if sql.is_empty() {
        return String::new();
    }
    let mut out = String::with_capacity(sql.len());
    let mut pending_space = false;
    for c in sql.chars() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.extend(c.to_lowercase());
    }
    out
}

/// One observed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuerySample {
    pub signature: String,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

/// Aggregates for one signature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SignatureStats {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl SignatureStats {
    /// Average duration in milliseconds.
    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.count as f64
        }
    }
}

/// Serializable copy of the registry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SlowQuerySnapshot {
    /// Slowest calls, slowest first.
    pub slowest: Vec<QuerySample>,
    /// Most recent calls, newest last.
    pub recent: Vec<QuerySample>,
    pub by_signature: BTreeMap<String, SignatureStats>,
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Sorted slowest first.
    slowest: Vec<QuerySample>,
    recent: VecDeque<QuerySample>,
    by_signature: BTreeMap<String, SignatureStats>,
}

/// Tracks the slowest and most recent calls.
#[derive(Debug, Default)]
pub struct SlowQueryRegistry {
    state: Mutex<RegistryState>,
}

impl SlowQueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call.
    pub fn record(&self, duration_ms: u64, signature: &str) {
        let sample = QuerySample {
            signature: signature.to_string(),
            duration_ms,
            at: Utc::now(),
        };
        let mut state = self.state.lock();

        let pos = state
            .slowest
            .partition_point(|s| s.duration_ms >= duration_ms);
        if pos < MAX_SLOWEST {
            state.slowest.insert(pos, sample.clone());
            state.slowest.truncate(MAX_SLOWEST);
        }

        if state.recent.len() == MAX_RECENT {
            state.recent.pop_front();
        }
        state.recent.push_back(sample);

        if state.by_signature.len() >= MAX_SIGNATURES
            && !state.by_signature.contains_key(signature)
        {
            state.by_signature.clear();
        }
        let stats = state.by_signature.entry(signature.to_string()).or_default();
        stats.count += 1;
        stats.total_ms += duration_ms;
        stats.max_ms = stats.max_ms.max(duration_ms);
    }

    /// Whether `duration_ms` ranks among the `n` slowest recorded calls.
    ///
    /// Always true while fewer than `n` calls have been recorded.
    pub fn is_top_n(&self, duration_ms: u64, n: usize) -> bool {
        if n == 0 {
            return false;
        }
        let state = self.state.lock();
        match state.slowest.get(n - 1) {
            Some(nth) => duration_ms >= nth.duration_ms,
            None => true,
        }
    }

    /// Number of calls currently ranked.
    pub fn len(&self) -> usize {
        self.state.lock().slowest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> SlowQuerySnapshot {
        let state = self.state.lock();
        SlowQuerySnapshot {
            slowest: state.slowest.clone(),
            recent: state.recent.iter().cloned().collect(),
            by_signature: state.by_signature.clone(),
        }
    }

    pub fn reset(&self) {
        *self.state.lock() = RegistryState::default();
    }
}

/// Sampling, slow-query and repeat tracking for database calls.
#[derive(Debug)]
pub struct DbTelemetry {
    profile: BuildProfile,
    registry: SlowQueryRegistry,
    repeats: DashMap<String, u64>,
}

impl DbTelemetry {
    pub fn new(profile: BuildProfile) -> Self {
        Self {
            profile,
            registry: SlowQueryRegistry::new(),
            repeats: DashMap::new(),
        }
    }

    pub fn profile(&self) -> BuildProfile {
        self.profile
    }

    pub fn registry(&self) -> &SlowQueryRegistry {
        &self.registry
    }

    /// Decide whether a call of `duration_ms` is logged.
    ///
    /// Development: always. Release: when the call ranks in the configured
    /// Top-N, or by a per-call random draw against the configured percentage.
    pub fn should_sample(&self, ctx: &DiagnosticContext, duration_ms: u64) -> bool {
        self.should_sample_with(ctx, duration_ms, &mut rand::thread_rng())
    }

    /// [`should_sample`](Self::should_sample) with an explicit random source.
    pub fn should_sample_with<R: Rng + ?Sized>(
        &self,
        ctx: &DiagnosticContext,
        duration_ms: u64,
        rng: &mut R,
    ) -> bool {
        if self.profile.is_development() {
            return true;
        }
        if self.registry.is_top_n(duration_ms, ctx.top_n_release()) {
            return true;
        }
        let percent = ctx.random_percent_release();
        percent > 0.0 && rng.gen::<f64>() * 100.0 < percent
    }

    /// Count a call of `signature` within `correlation_id`.
    ///
    /// Logs one Warn event when the count reaches exactly three. Returns the
    /// new count.
    pub fn record_n_plus_one(
        &self,
        correlation_id: &str,
        signature: &str,
        trace: &TraceManager,
    ) -> u64 {
        let key = format!("{}|{}", correlation_id, signature);
        if self.repeats.len() >= MAX_REPEAT_KEYS && !self.repeats.contains_key(&key) {
            self.repeats.clear();
        }
        let count = {
            let mut entry = self.repeats.entry(key).or_insert(0);
            *entry += 1;
            *entry
        };
        if count == N_PLUS_ONE_THRESHOLD {
            trace.log(
                DiagLevel::Warn,
                "sql",
                N_PLUS_ONE_EVENT,
                "same query shape repeated 3+ times within one correlation",
                None,
                Some(data_map! {
                    "sql_signature" => signature,
                    "count" => count,
                }),
            );
        }
        count
    }

    /// Repeat count for a key, mainly for diagnostics.
    pub fn repeat_count(&self, correlation_id: &str, signature: &str) -> u64 {
        self.repeats
            .get(&format!("{}|{}", correlation_id, signature))
            .map(|v| *v)
            .unwrap_or(0)
    }
}

impl Default for DbTelemetry {
    fn default() -> Self {
        Self::new(BuildProfile::current())
    }
}
