// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Database instrumentation.
//!
//! - **Wrapper**: timing, sampling and masked-parameter events per call
//! - **Telemetry**: SQL signatures, slow-query registry, N+1 detection
//! - **Gateway**: async execution with cancellation and shadow kick-off
//! - **Shadow**: write replay and read-after-write verification

mod connection;
mod gateway;
mod params;
mod schema;
pub mod shadow;
pub mod telemetry;
mod wrapper;

pub use connection::{parse_data_source, TrackedConnection, DEFAULT_COMMAND_TIMEOUT};
pub use gateway::{Database, WriteOutcome};
pub use params::{find_param, masked_param_map, value_to_json, value_to_text, SqlParam};
pub use schema::schema_fingerprint;
pub use shadow::{
    compute_diff, ColumnDiff, RowDiff, RowSnapshot, ShadowReplicator, ShadowReport, Verification,
};
pub use telemetry::{
    signature_of, BuildProfile, DbTelemetry, SlowQueryRegistry, SlowQuerySnapshot,
    N_PLUS_ONE_EVENT,
};
pub use wrapper::{CallKind, DataTable, DbCommandWrapper, SQL_CATEGORY};
