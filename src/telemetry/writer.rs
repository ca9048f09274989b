// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bounded asynchronous event queue with multi-sink fan-out.
//!
//! Producers call [`EventWriter::enqueue`], which never blocks: the event is
//! pushed onto a lock-free queue, or dropped by the backpressure policy. A
//! single background task drains the queue in batches on a fixed interval
//! and hands every batch to each sink in turn.
//!
//! Backpressure, checked against the current pending count:
//! - Trace/Debug are dropped once pending reaches `capacity`.
//! - Info is dropped once pending reaches `2 * capacity`.
//! - Warn/Error/Fatal are never dropped.
//!
//! Sink calls run with a thread-local marker set, so a process panic hook
//! can tell a contained sink panic from a real crash; see
//! [`in_guarded_sink`] and [`on_drain_thread`].

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::context::DiagnosticContext;
use super::event::{DiagLevel, DiagnosticEvent};
use super::sinks::LogSink;

/// Smallest accepted queue capacity.
pub const MIN_CAPACITY: usize = 1024;
/// Smallest accepted drain batch.
pub const MIN_DRAIN_BATCH: usize = 32;
/// Drain interval bounds, in milliseconds.
pub const MIN_DRAIN_INTERVAL_MS: u64 = 25;
pub const MAX_DRAIN_INTERVAL_MS: u64 = 1000;

/// Default wait for [`EventWriter::flush`].
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);
/// How long shutdown waits for the drain task before draining inline.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_millis(500);
const FLUSH_POLL: Duration = Duration::from_millis(20);

thread_local! {
    static DRAINING: Cell<bool> = const { Cell::new(false) };
    static IN_SINK: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is inside a sink call whose panic the writer
/// contains.
pub fn in_guarded_sink() -> bool {
    IN_SINK.with(Cell::get)
}

/// Whether the current thread is draining a writer. Flushing from here
/// would wait on itself.
pub fn on_drain_thread() -> bool {
    DRAINING.with(Cell::get)
}

/// Sets a thread-local flag for its lifetime.
struct FlagGuard {
    flag: &'static std::thread::LocalKey<Cell<bool>>,
    previous: bool,
}

impl FlagGuard {
    fn set(flag: &'static std::thread::LocalKey<Cell<bool>>) -> Self {
        let previous = flag.with(|f| f.replace(true));
        Self { flag, previous }
    }
}

impl Drop for FlagGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        self.flag.with(|f| f.set(previous));
    }
}

/// Destination for finished events.
///
/// Implemented by [`LogWriter`]; tests substitute a recording writer.
pub trait EventWriter: Send + Sync {
    /// Accept an event without blocking. May drop it under backpressure.
    fn enqueue(&self, event: DiagnosticEvent);

    /// Block until everything queued so far is delivered, or `timeout` elapses.
    fn flush(&self, timeout: Option<Duration>);
}

/// Queue sizing and drain cadence. Values are clamped on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    capacity: usize,
    drain_batch: usize,
    drain_interval: Duration,
}

impl WriterOptions {
    pub fn new(capacity: usize, drain_batch: usize, drain_interval_ms: u64) -> Self {
        Self {
            capacity: capacity.max(MIN_CAPACITY),
            drain_batch: drain_batch.max(MIN_DRAIN_BATCH),
            drain_interval: Duration::from_millis(
                drain_interval_ms.clamp(MIN_DRAIN_INTERVAL_MS, MAX_DRAIN_INTERVAL_MS),
            ),
        }
    }

    /// Read the `Diagnostics:Queue:*` settings.
    pub fn from_context(ctx: &DiagnosticContext) -> Self {
        Self::new(
            ctx.queue_capacity(),
            ctx.queue_drain_batch(),
            ctx.queue_drain_interval_ms(),
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn drain_batch(&self) -> usize {
        self.drain_batch
    }

    pub fn drain_interval(&self) -> Duration {
        self.drain_interval
    }
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self::new(10_000, 256, 200)
    }
}

/// Counters describing queue health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub pending: usize,
}

struct Shared {
    queue: SegQueue<DiagnosticEvent>,
    pending: AtomicUsize,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    sinks: Vec<Arc<dyn LogSink>>,
    options: WriterOptions,
    /// Serializes sink writes between the loop and an inline final drain.
    drain_lock: Mutex<()>,
}

impl Shared {
    fn admits(&self, level: DiagLevel) -> bool {
        let pending = self.pending.load(Ordering::Acquire);
        match level {
            DiagLevel::Trace | DiagLevel::Debug => pending < self.options.capacity,
            DiagLevel::Info => pending < self.options.capacity.saturating_mul(2),
            DiagLevel::Warn | DiagLevel::Error | DiagLevel::Fatal => true,
        }
    }

    fn drain_once(&self, force_all: bool) -> usize {
        let _guard = self.drain_lock.lock();
        let _draining = FlagGuard::set(&DRAINING);
        let limit = if force_all {
            usize::MAX
        } else {
            self.options.drain_batch
        };

        let pending = self.pending.load(Ordering::Acquire);
        let mut batch = Vec::with_capacity(pending.min(self.options.drain_batch));
        while batch.len() < limit {
            match self.queue.pop() {
                Some(event) => {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    batch.push(event);
                }
                None => break,
            }
        }
        if batch.is_empty() {
            return 0;
        }

        for sink in &self.sinks {
            let outcome = {
                let _guarded = FlagGuard::set(&IN_SINK);
                catch_unwind(AssertUnwindSafe(|| sink.write_batch(&batch)))
            };
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(sink = sink.name(), error = %e, "sink write failed"),
                Err(_) => warn!(sink = sink.name(), "sink panicked while writing batch"),
            }
        }
        self.delivered.fetch_add(batch.len() as u64, Ordering::Relaxed);
        batch.len()
    }
}

/// The production [`EventWriter`].
///
/// Construct with [`LogWriter::new`] and call [`LogWriter::start`] from
/// inside a Tokio runtime to launch the drain loop. Without a running loop
/// the queue only empties through [`LogWriter::drain_once`].
pub struct LogWriter {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LogWriter {
    /// Create a writer over `sinks`. Does not start the drain loop.
    pub fn new(options: WriterOptions, sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: SegQueue::new(),
                pending: AtomicUsize::new(0),
                enqueued: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                sinks,
                options,
                drain_lock: Mutex::new(()),
            }),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Create a writer and start its drain loop on the current runtime.
    pub fn spawn(options: WriterOptions, sinks: Vec<Arc<dyn LogSink>>) -> Self {
        let writer = Self::new(options, sinks);
        writer.start();
        writer
    }

    /// Start the drain loop. No-op if already running, cancelled, or called
    /// outside a Tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no Tokio runtime; log writer drain loop not started");
                return;
            }
        };
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        *task = Some(handle.spawn(drain_loop(shared, cancel)));
        debug!(
            interval_ms = self.shared.options.drain_interval.as_millis() as u64,
            sinks = self.shared.sinks.len(),
            "log writer started"
        );
    }

    /// Whether the background loop is running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Deliver one batch synchronously. `force_all` ignores the batch cap.
    ///
    /// Returns the number of events handed to the sinks.
    pub fn drain_once(&self, force_all: bool) -> usize {
        self.shared.drain_once(force_all)
    }

    /// Events accepted but not yet drained.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn options(&self) -> WriterOptions {
        self.shared.options
    }

    /// Names of the configured sinks.
    pub fn sink_names(&self) -> Vec<String> {
        self.shared.sinks.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }

    /// Async counterpart of [`EventWriter::flush`] for use on the runtime.
    pub async fn flush_async(&self, timeout: Option<Duration>) {
        let deadline = Instant::now() + timeout.unwrap_or(DEFAULT_FLUSH_TIMEOUT);
        while self.pending() > 0 && Instant::now() < deadline {
            tokio::time::sleep(FLUSH_POLL).await;
        }
    }

    /// Stop the drain loop and deliver everything still queued.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, task).await.is_err() {
                debug!("log writer loop did not stop in time; draining inline");
            }
        }
        let shared = Arc::clone(&self.shared);
        if let Err(e) = tokio::task::spawn_blocking(move || shared.drain_once(true)).await {
            warn!(error = %e, "final log drain failed");
        }
    }

    /// Blocking variant of [`shutdown`](Self::shutdown) for non-async callers.
    pub fn shutdown_blocking(&self) {
        self.cancel.cancel();
        self.shared.drain_once(true);
    }
}

impl EventWriter for LogWriter {
    fn enqueue(&self, event: DiagnosticEvent) {
        if !self.shared.admits(event.lvl) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // Count before publishing so a concurrent drain never decrements first.
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        self.shared.queue.push(event);
        self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Spins with short sleeps; meant for shutdown and test paths only.
    fn flush(&self, timeout: Option<Duration>) {
        let deadline = Instant::now() + timeout.unwrap_or(DEFAULT_FLUSH_TIMEOUT);
        while self.pending() > 0 && Instant::now() < deadline {
            std::thread::sleep(FLUSH_POLL);
        }
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        // The loop performs its own final drain once it sees the cancellation.
        self.cancel.cancel();
    }
}

async fn drain_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.options.drain_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => run_drain(&shared, false).await,
        }
    }

    run_drain(&shared, true).await;
    debug!("log writer stopped");
}

async fn run_drain(shared: &Arc<Shared>, force_all: bool) {
    if shared.pending.load(Ordering::Acquire) == 0 {
        return;
    }
    let shared = Arc::clone(shared);
    if let Err(e) = tokio::task::spawn_blocking(move || shared.drain_once(force_all)).await {
        warn!(error = %e, "log drain task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::telemetry::sinks::MemorySink;

    fn event(level: DiagLevel) -> DiagnosticEvent {
        DiagnosticEvent::new(level, "test", "evt", "message")
    }

    struct FailingSink;

    impl LogSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn write_batch(&self, _batch: &[DiagnosticEvent]) -> Result<(), SinkError> {
            Err(SinkError::Http("unreachable".to_string()))
        }
    }

    struct PanickingSink;

    impl LogSink for PanickingSink {
        fn name(&self) -> &str {
            "panicking"
        }

        fn write_batch(&self, _batch: &[DiagnosticEvent]) -> Result<(), SinkError> {
            panic!("sink bug");
        }
    }

    #[test]
    fn test_options_clamped() {
        let options = WriterOptions::new(10, 1, 5);
        assert_eq!(options.capacity(), MIN_CAPACITY);
        assert_eq!(options.drain_batch(), MIN_DRAIN_BATCH);
        assert_eq!(options.drain_interval(), Duration::from_millis(25));

        let options = WriterOptions::new(5000, 500, 60_000);
        assert_eq!(options.capacity(), 5000);
        assert_eq!(options.drain_interval(), Duration::from_millis(1000));
    }

    #[test]
    fn test_no_drops_below_capacity() {
        let sink = Arc::new(MemorySink::new());
        let writer = LogWriter::new(WriterOptions::new(1024, 32, 25), vec![sink.clone()]);
        for i in 0..1000 {
            let level = [DiagLevel::Trace, DiagLevel::Debug, DiagLevel::Info][i % 3];
            writer.enqueue(event(level));
        }
        assert_eq!(writer.stats().dropped, 0);
        assert_eq!(writer.drain_once(true), 1000);
        assert_eq!(sink.len(), 1000);
    }

    #[test]
    fn test_drop_policy_thresholds() {
        let writer = LogWriter::new(WriterOptions::new(1024, 32, 25), Vec::new());
        for _ in 0..1024 {
            writer.enqueue(event(DiagLevel::Info));
        }
        writer.enqueue(event(DiagLevel::Debug));
        writer.enqueue(event(DiagLevel::Trace));
        assert_eq!(writer.stats().dropped, 2);

        // Info still accepted until 2x capacity.
        writer.enqueue(event(DiagLevel::Info));
        assert_eq!(writer.pending(), 1025);

        for _ in 0..1023 {
            writer.enqueue(event(DiagLevel::Warn));
        }
        assert_eq!(writer.pending(), 2048);
        writer.enqueue(event(DiagLevel::Info));
        assert_eq!(writer.stats().dropped, 3);
    }

    #[test]
    fn test_warn_retained_at_three_times_capacity() {
        let sink = Arc::new(MemorySink::new());
        let writer = LogWriter::new(WriterOptions::new(1024, 32, 25), vec![sink.clone()]);
        for _ in 0..3 * 1024 {
            writer.enqueue(event(DiagLevel::Error));
        }
        writer.enqueue(DiagnosticEvent::new(DiagLevel::Warn, "test", "kept", "late warn"));
        writer.enqueue(event(DiagLevel::Info));

        assert_eq!(writer.pending(), 3 * 1024 + 1);
        writer.drain_once(true);
        let events = sink.events();
        assert_eq!(events.last().map(|e| e.evt.as_str()), Some("kept"));
    }

    #[test]
    fn test_drain_respects_batch_size() {
        let sink = Arc::new(MemorySink::new());
        let writer = LogWriter::new(WriterOptions::new(1024, 32, 25), vec![sink.clone()]);
        for _ in 0..100 {
            writer.enqueue(event(DiagLevel::Info));
        }
        assert_eq!(writer.drain_once(false), 32);
        assert_eq!(writer.pending(), 68);
        assert_eq!(writer.drain_once(true), 68);
        assert_eq!(writer.drain_once(true), 0);
    }

    #[test]
    fn test_failing_sinks_do_not_block_others() {
        let sink = Arc::new(MemorySink::new());
        let writer = LogWriter::new(
            WriterOptions::default(),
            vec![Arc::new(FailingSink), Arc::new(PanickingSink), sink.clone()],
        );
        writer.enqueue(event(DiagLevel::Warn));
        writer.enqueue(event(DiagLevel::Error));
        assert_eq!(writer.drain_once(false), 2);
        assert_eq!(sink.len(), 2);
        assert_eq!(writer.stats().delivered, 2);
    }

    struct FlagSink(Mutex<Vec<(bool, bool)>>);

    impl LogSink for FlagSink {
        fn name(&self) -> &str {
            "flags"
        }

        fn write_batch(&self, _batch: &[DiagnosticEvent]) -> Result<(), SinkError> {
            self.0.lock().push((in_guarded_sink(), on_drain_thread()));
            Ok(())
        }
    }

    #[test]
    fn test_sink_calls_are_marked_guarded() {
        let sink = Arc::new(FlagSink(Mutex::new(Vec::new())));
        let writer = LogWriter::new(WriterOptions::default(), vec![sink.clone()]);
        writer.enqueue(event(DiagLevel::Warn));
        writer.drain_once(true);

        assert_eq!(*sink.0.lock(), vec![(true, true)]);
        assert!(!in_guarded_sink());
        assert!(!on_drain_thread());
    }

    #[test]
    fn test_guard_cleared_after_sink_panic() {
        let writer = LogWriter::new(WriterOptions::default(), vec![Arc::new(PanickingSink)]);
        writer.enqueue(event(DiagLevel::Error));
        assert_eq!(writer.drain_once(true), 1);
        assert!(!in_guarded_sink());
        assert!(!on_drain_thread());
    }

    #[test]
    fn test_concurrent_producers_below_capacity_never_drop() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 120;

        let sink = Arc::new(MemorySink::new());
        let writer = LogWriter::new(WriterOptions::new(1024, 32, 25), vec![sink.clone()]);
        let done = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    writer.drain_once(false);
                }
            });
            let producers: Vec<_> = (0..PRODUCERS)
                .map(|_| {
                    scope.spawn(|| {
                        for _ in 0..PER_PRODUCER {
                            writer.enqueue(event(DiagLevel::Info));
                            assert!(writer.pending() <= PRODUCERS * PER_PRODUCER);
                        }
                    })
                })
                .collect();
            for producer in producers {
                producer.join().unwrap();
            }
            done.store(true, Ordering::Release);
        });
        writer.drain_once(true);

        let stats = writer.stats();
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.pending, 0);
        assert_eq!(sink.len(), PRODUCERS * PER_PRODUCER);
    }

    #[test]
    fn test_flush_without_loop_times_out() {
        let writer = LogWriter::new(WriterOptions::default(), Vec::new());
        writer.enqueue(event(DiagLevel::Warn));
        let start = Instant::now();
        writer.flush(Some(Duration::from_millis(60)));
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert_eq!(writer.pending(), 1);
    }

    #[tokio::test]
    async fn test_loop_drains_and_shutdown_delivers_rest() {
        let sink = Arc::new(MemorySink::new());
        let writer = LogWriter::spawn(WriterOptions::new(1024, 32, 25), vec![sink.clone()]);
        assert!(writer.is_running());

        for _ in 0..10 {
            writer.enqueue(event(DiagLevel::Info));
        }
        writer.flush_async(Some(Duration::from_secs(2))).await;
        assert_eq!(sink.len(), 10);

        for _ in 0..500 {
            writer.enqueue(event(DiagLevel::Warn));
        }
        writer.shutdown().await;
        assert_eq!(writer.pending(), 0);
        assert_eq!(sink.len(), 510);
        assert!(!writer.is_running());
    }
}
