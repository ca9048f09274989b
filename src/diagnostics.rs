// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pipeline assembly.
//!
//! [`Diagnostics`] wires the context, sinks, writer, trace manager, profiler,
//! database telemetry and crash handler together and owns them for the
//! lifetime of the process. Databases opened through it can run the
//! self-test suite on open.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::ConfigSnapshot;
use crate::crash::CrashHandler;
use crate::data_map;
use crate::db::{BuildProfile, Database, DbCommandWrapper, DbTelemetry};
use crate::error::DbError;
use crate::selftest::{SelfTestReport, SelfTestRunner};
use crate::telemetry::{
    create_sinks, DiagLevel, DiagnosticContext, LogSink, LogWriter, Profiler, TraceManager,
    WriterOptions,
};

/// Event logged once the pipeline is assembled.
pub const BOOT_EVENT: &str = "diagnostics_boot";

/// The assembled diagnostics pipeline.
pub struct Diagnostics {
    context: Arc<DiagnosticContext>,
    writer: Arc<LogWriter>,
    trace: TraceManager,
    profiler: Profiler,
    db_telemetry: Arc<DbTelemetry>,
    crash: Arc<CrashHandler>,
}

impl Diagnostics {
    /// Build the pipeline from `config` with the sinks it names.
    ///
    /// Call from inside a Tokio runtime so the drain loop can start.
    pub fn start(config: ConfigSnapshot) -> Self {
        Self::start_with_profile(config, BuildProfile::current())
    }

    /// [`start`](Self::start) with an explicit build profile.
    pub fn start_with_profile(config: ConfigSnapshot, profile: BuildProfile) -> Self {
        let context = DiagnosticContext::from_process(config);
        let sinks = create_sinks(&context);
        Self::assemble(context, sinks, profile)
    }

    /// Build the pipeline over explicit sinks and build profile.
    pub fn with_sinks(
        context: DiagnosticContext,
        sinks: Vec<Arc<dyn LogSink>>,
        profile: BuildProfile,
    ) -> Self {
        Self::assemble(context, sinks, profile)
    }

    fn assemble(
        context: DiagnosticContext,
        sinks: Vec<Arc<dyn LogSink>>,
        profile: BuildProfile,
    ) -> Self {
        let context = Arc::new(context);
        let writer = Arc::new(LogWriter::spawn(WriterOptions::from_context(&context), sinks));
        let trace = TraceManager::new(context.clone(), writer.clone());
        let profiler = Profiler::new(trace.clone());
        let db_telemetry = Arc::new(DbTelemetry::new(profile));
        let crash = Arc::new(
            CrashHandler::new(trace.clone(), db_telemetry.clone()).with_writer(writer.clone()),
        );

        trace.log(
            DiagLevel::Info,
            "diag",
            BOOT_EVENT,
            "Diagnostics pipeline started",
            None,
            Some(data_map! {
                "sinks" => writer.sink_names(),
                "level" => trace.min_level(),
                "build_profile" => profile,
                "queue_capacity" => writer.options().capacity(),
                "shadow_enabled" => context.shadow_path().is_some(),
                "selftest_on_open" => context.self_test_on_open(),
            }),
        );

        Self {
            context,
            writer,
            trace,
            profiler,
            db_telemetry,
            crash,
        }
    }

    pub fn context(&self) -> &Arc<DiagnosticContext> {
        &self.context
    }

    pub fn trace(&self) -> &TraceManager {
        &self.trace
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn writer(&self) -> &Arc<LogWriter> {
        &self.writer
    }

    pub fn db_telemetry(&self) -> &Arc<DbTelemetry> {
        &self.db_telemetry
    }

    pub fn crash_handler(&self) -> &Arc<CrashHandler> {
        &self.crash
    }

    /// Install the crash handler as the process panic hook.
    pub fn register_crash_handler(&self) {
        self.crash.register_global();
    }

    /// Statement wrapper sharing this pipeline's trace and telemetry.
    pub fn command_wrapper(&self) -> DbCommandWrapper {
        DbCommandWrapper::new(self.trace.clone(), self.db_telemetry.clone())
    }

    /// Open an instrumented database, with shadow replay when configured.
    pub fn open_database(&self, path: impl AsRef<Path>) -> Result<Database, DbError> {
        Ok(Database::open(path, self.command_wrapper())?.with_configured_shadow())
    }

    /// [`open_database`](Self::open_database), then the self-tests when
    /// `Diagnostics:SelfTest:OnOpen` is set.
    pub async fn connect(
        &self,
        path: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<Database, DbError> {
        let db = self.open_database(path)?;
        if self.context.self_test_on_open() {
            self.self_test(&db, cancel).await;
        }
        Ok(db)
    }

    /// Run the self-test suite against `db`.
    pub async fn self_test(&self, db: &Database, cancel: &CancellationToken) -> SelfTestReport {
        SelfTestRunner::new(db).run_all(cancel).await
    }

    /// Stop the drain loop after delivering everything still queued.
    pub async fn shutdown(&self) {
        self.writer.shutdown().await;
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("sinks", &self.writer.sink_names())
            .field("stats", &self.writer.stats())
            .finish()
    }
}
