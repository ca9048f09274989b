// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Remote collector sink (Elastic-compatible bulk ndjson over HTTP).
//!
//! `write_batch` only serializes the batch and hands it to a poster thread
//! through a bounded channel, so a slow or dead collector never holds up the
//! drain loop or the other sinks. The poster POSTs with bounded retries.
//! Anything it cannot deliver, every batch when no URL is configured, and
//! batches that find the channel full are appended to a size-capped buffer
//! file. Buffered lines are resent ahead of the next batch.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SinkError;
use crate::telemetry::context::RemoteSettings;
use crate::telemetry::event::DiagnosticEvent;

use super::{to_ndjson, LogSink};

/// Local buffer for undelivered lines, inside the log directory.
pub const BUFFER_FILE: &str = "remote_buffer.ndjson";
/// Largest buffer file kept; the oldest lines go first.
pub const MAX_BUFFER_BYTES: u64 = 8 * 1024 * 1024;

const MAX_ATTEMPTS: u32 = 4;
const QUEUED_BATCHES: usize = 64;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// How long drop waits for the poster, once to deliver and once to park.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Retry and buffering knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteOptions {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub buffer_limit: u64,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            buffer_limit: MAX_BUFFER_BYTES,
        }
    }
}

enum Command {
    Batch(String),
    Flush(oneshot::Sender<Result<usize, SinkError>>),
}

/// Posts batches to a remote collector.
pub struct RemoteSink {
    endpoint: Option<String>,
    buffer: Arc<BufferFile>,
    commands: Option<mpsc::Sender<Command>>,
    cancel: CancellationToken,
    poster: Option<JoinHandle<()>>,
}

impl RemoteSink {
    /// Create the sink; the buffer file lives in `buffer_dir`.
    pub fn new(settings: RemoteSettings, buffer_dir: impl AsRef<Path>) -> Result<Self, SinkError> {
        Self::with_options(settings, buffer_dir, RemoteOptions::default())
    }

    /// Create the sink with explicit retry and buffer settings.
    ///
    /// With a URL configured this starts the poster thread.
    pub fn with_options(
        settings: RemoteSettings,
        buffer_dir: impl AsRef<Path>,
        options: RemoteOptions,
    ) -> Result<Self, SinkError> {
        let buffer_dir = buffer_dir.as_ref();
        fs::create_dir_all(buffer_dir)?;
        let buffer = Arc::new(BufferFile::new(
            buffer_dir.join(BUFFER_FILE),
            options.buffer_limit,
        ));
        let endpoint = endpoint_of(&settings);
        let cancel = CancellationToken::new();

        let (commands, poster) = match &endpoint {
            Some(endpoint) => {
                let poster = Poster {
                    endpoint: endpoint.clone(),
                    headers: build_headers(&settings),
                    client: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?,
                    buffer: buffer.clone(),
                    options,
                };
                let (tx, rx) = mpsc::channel(QUEUED_BATCHES);
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                let token = cancel.clone();
                let thread = std::thread::Builder::new()
                    .name("gmp-diag-remote".to_string())
                    .spawn(move || runtime.block_on(poster.run(rx, token)))?;
                (Some(tx), Some(thread))
            }
            None => (None, None),
        };

        Ok(Self {
            endpoint,
            buffer,
            commands,
            cancel,
            poster,
        })
    }

    /// Full POST target, when configured.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn buffer_path(&self) -> &Path {
        &self.buffer.path
    }

    /// Resend buffered lines now, after every batch already handed over.
    /// Returns the number of lines delivered.
    pub async fn flush_buffer(&self) -> Result<usize, SinkError> {
        let Some(commands) = &self.commands else {
            return Ok(0);
        };
        let (reply, delivered) = oneshot::channel();
        commands
            .send(Command::Flush(reply))
            .await
            .map_err(|_| SinkError::Closed)?;
        delivered.await.map_err(|_| SinkError::Closed)?
    }
}

impl LogSink for RemoteSink {
    fn name(&self) -> &str {
        "remote"
    }

    fn write_batch(&self, batch: &[DiagnosticEvent]) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let lines = to_ndjson(batch)?;
        let Some(commands) = &self.commands else {
            return self.buffer.append(&lines);
        };
        match commands.try_send(Command::Batch(lines)) {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(error = %e, "remote poster busy; batch buffered");
                match e.into_inner() {
                    Command::Batch(lines) => self.buffer.append(&lines),
                    Command::Flush(_) => Ok(()),
                }
            }
        }
    }
}

impl Drop for RemoteSink {
    fn drop(&mut self) {
        // Closing the channel lets the poster deliver what is queued and stop.
        self.commands.take();
        let Some(poster) = self.poster.take() else {
            return;
        };
        if !wait_for(&poster, SHUTDOWN_GRACE) {
            self.cancel.cancel();
            wait_for(&poster, SHUTDOWN_GRACE);
        }
        if poster.is_finished() {
            let _ = poster.join();
        }
    }
}

impl std::fmt::Debug for RemoteSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSink")
            .field("endpoint", &self.endpoint)
            .field("buffer", &self.buffer.path)
            .finish()
    }
}

fn wait_for(thread: &JoinHandle<()>, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while !thread.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    true
}

/// Delivery side, owned by the poster thread.
struct Poster {
    endpoint: String,
    headers: HeaderMap,
    client: reqwest::Client,
    buffer: Arc<BufferFile>,
    options: RemoteOptions,
}

impl Poster {
    async fn run(self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            match command {
                Command::Batch(lines) => {
                    if let Err(e) = self.deliver(Some(lines), &cancel).await {
                        debug!(error = %e, "remote delivery failed; lines buffered");
                    }
                }
                Command::Flush(reply) => {
                    let _ = reply.send(self.deliver(None, &cancel).await);
                }
            }
        }

        // Park whatever is still queued so a later run resends it.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Batch(lines) => {
                    if let Err(e) = self.buffer.append(&lines) {
                        debug!(error = %e, "remote batch lost at shutdown");
                    }
                }
                Command::Flush(reply) => {
                    let _ = reply.send(Err(SinkError::Closed));
                }
            }
        }
        debug!("remote poster stopped");
    }

    /// Send the buffer followed by `lines`. On failure everything goes back
    /// into the buffer, ahead of lines added meanwhile.
    async fn deliver(
        &self,
        lines: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<usize, SinkError> {
        let mut payload = match self.buffer.take() {
            Ok(buffered) => buffered,
            Err(e) => {
                debug!(error = %e, "remote buffer unreadable");
                String::new()
            }
        };
        if let Some(lines) = lines {
            payload.push_str(&lines);
        }
        if payload.trim().is_empty() {
            return Ok(0);
        }
        match self.post(&payload, cancel).await {
            Ok(()) => Ok(payload.lines().count()),
            Err(e) => {
                self.buffer.restore(&payload)?;
                Err(e)
            }
        }
    }

    async fn post(&self, body: &str, cancel: &CancellationToken) -> Result<(), SinkError> {
        let mut backoff = self.options.initial_backoff;
        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            let request = self
                .client
                .post(&self.endpoint)
                .headers(self.headers.clone())
                .body(body.to_string())
                .send();
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(SinkError::Closed),
                result = request => result,
            };
            match result {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => last_error = format!("status {}", resp.status()),
                Err(e) => last_error = e.to_string(),
            }
            debug!(attempt, error = %last_error, "remote sink post failed");
            if attempt < MAX_ATTEMPTS {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SinkError::Closed),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(self.options.max_backoff);
            }
        }
        Err(SinkError::Http(last_error))
    }
}

/// Undelivered ndjson lines on disk, capped at `limit` bytes.
struct BufferFile {
    path: PathBuf,
    limit: u64,
    lock: Mutex<()>,
}

impl BufferFile {
    fn new(path: PathBuf, limit: u64) -> Self {
        Self {
            path,
            limit,
            lock: Mutex::new(()),
        }
    }

    fn append(&self, text: &str) -> Result<(), SinkError> {
        let _guard = self.lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(text.as_bytes())?;
        let len = file.metadata()?.len();
        drop(file);
        if len > self.limit {
            let current = fs::read_to_string(&self.path)?;
            self.rewrite(&current)?;
        }
        Ok(())
    }

    /// Read and empty the buffer.
    fn take(&self) -> Result<String, SinkError> {
        let _guard = self.lock.lock();
        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() > 0 => {}
            _ => return Ok(String::new()),
        }
        let text = fs::read_to_string(&self.path)?;
        File::create(&self.path)?;
        Ok(text)
    }

    /// Put `text` back in front of whatever was appended since it was taken.
    fn restore(&self, text: &str) -> Result<(), SinkError> {
        let _guard = self.lock.lock();
        let newer = fs::read_to_string(&self.path).unwrap_or_default();
        let mut combined = String::with_capacity(text.len() + newer.len());
        combined.push_str(text);
        combined.push_str(&newer);
        self.rewrite(&combined)
    }

    fn rewrite(&self, text: &str) -> Result<(), SinkError> {
        let kept = newest_lines(text, self.limit as usize);
        if kept.len() < text.len() {
            debug!(
                dropped_bytes = text.len() - kept.len(),
                "remote buffer over limit; oldest lines dropped"
            );
        }
        fs::write(&self.path, kept)?;
        Ok(())
    }
}

/// The longest run of whole trailing lines of `text` within `limit` bytes.
fn newest_lines(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let start = text.len() - limit;
    match text.as_bytes()[start..].iter().position(|b| *b == b'\n') {
        Some(offset) => &text[start + offset + 1..],
        None => "",
    }
}

fn endpoint_of(settings: &RemoteSettings) -> Option<String> {
    settings
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(|url| match settings.index.as_deref().map(|i| i.trim_matches('/')) {
            Some(index) if !index.is_empty() => {
                format!("{}/{}", url.trim_end_matches('/'), index)
            }
            _ => url.to_string(),
        })
}

fn build_headers(settings: &RemoteSettings) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson"));

    let auth = match (&settings.bearer_token, &settings.api_key) {
        (Some(token), _) if !token.trim().is_empty() => Some(format!("Bearer {}", token.trim())),
        (_, Some(key)) if !key.trim().is_empty() => Some(format!("ApiKey {}", key.trim())),
        _ => None,
    };
    if let Some(value) = auth.and_then(|a| HeaderValue::from_str(&a).ok()) {
        headers.insert(AUTHORIZATION, value);
    }

    for (name, value) in &settings.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => debug!(header = %name, "invalid remote header skipped"),
        }
    }
    headers
}
