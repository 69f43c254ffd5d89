//! Buffered, batched, asynchronous submission of orchestrator log records
//! to the shared log store.
//!
//! Enqueue is non-blocking and never raises to the caller. A background
//! task flushes every `flush_interval` or when the pending batch reaches
//! `batch_size`. Overflow drops the oldest unsubmitted records; submission
//! failures discard the batch after bounded retries. Every loss is
//! counted -- the accounting law is: a record is either delivered or shows
//! up in `dropped`/`errors`, never silently gone.
//!
//! Startup failure is loud by contract: written to a local file, logged
//! CRITICAL on stderr, and fatal when the operator requires store logging.
//! The stderr channel (tracing) stays available even when the store is not.

pub mod writer;

use std::collections::VecDeque;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use corral_db::models::{LogLevel, LogSourceType};
use corral_db::queries::logs::NewLogRecord;

use crate::context::CycleContext;
use crate::error::OrchestratorError;
use crate::settings::LogSinkSettings;

pub use writer::{LogWriter, StoreLogWriter};

/// Hard bound on unsubmitted records held in memory.
const DEFAULT_MAX_QUEUE: usize = 5_000;

/// Attempts per batch before it is discarded.
const MAX_SUBMIT_ATTEMPTS: u32 = 3;

/// Backoff between submit attempts, doubled per attempt.
const SUBMIT_BACKOFF: StdDuration = StdDuration::from_millis(200);

/// Upper bound on draining at shutdown.
const DRAIN_DEADLINE: StdDuration = StdDuration::from_secs(5);

/// Sink configuration.
#[derive(Debug, Clone)]
pub struct LogSinkConfig {
    pub source_type: LogSourceType,
    pub source_id: String,
    pub min_level: LogLevel,
    pub batch_size: usize,
    pub flush_interval: StdDuration,
    pub max_queue: usize,
    /// Diagnostics are appended here when the sink cannot start; this file
    /// survives even when neither the store nor stderr is being watched.
    pub failure_log_path: PathBuf,
}

impl LogSinkConfig {
    pub fn from_settings(settings: &LogSinkSettings, instance_id: &str) -> Self {
        Self {
            source_type: LogSourceType::OrchestratorGpu,
            source_id: instance_id.to_owned(),
            min_level: settings.min_level,
            batch_size: settings.batch_size,
            flush_interval: settings.flush_interval,
            max_queue: DEFAULT_MAX_QUEUE,
            failure_log_path: default_failure_log_path(),
        }
    }
}

/// A record on its way into the sink.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    pub task_id: Option<Uuid>,
    pub worker_id: Option<String>,
    pub cycle_number: Option<i64>,
    pub metadata: serde_json::Value,
}

impl LogEvent {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            task_id: None,
            worker_id: None,
            cycle_number: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    /// A record stamped with the current cycle.
    pub fn for_cycle(level: LogLevel, message: impl Into<String>, ctx: &CycleContext) -> Self {
        let mut event = Self::new(level, message);
        event.cycle_number = Some(ctx.cycle_i64());
        event
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Point-in-time sink statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkStats {
    pub queued: u64,
    pub sent: u64,
    pub dropped: u64,
    pub errors: u64,
    pub batches: u64,
    pub alive: bool,
}

struct Shared {
    config: LogSinkConfig,
    queue: Mutex<VecDeque<NewLogRecord>>,
    notify: Notify,
    sent: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    batches: AtomicU64,
}

/// The sink. One per orchestrator instance, explicitly constructed and
/// owned by `main`; the driver borrows it.
pub struct LogSink {
    shared: Arc<Shared>,
    writer: Arc<dyn LogWriter>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
}

impl LogSink {
    pub fn new(writer: Arc<dyn LogWriter>, config: LogSinkConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                sent: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                batches: AtomicU64::new(0),
            }),
            writer,
            worker: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Start (or restart) the background flush task.
    ///
    /// Verifies the transport first. On failure the diagnostic goes to the
    /// local failure file and to stderr at CRITICAL, and the error is
    /// returned; the caller decides whether that is fatal
    /// (`DB_LOGGING_REQUIRED`).
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        if self.alive() {
            return Ok(());
        }

        if let Err(e) = self.writer.verify().await {
            let detail = format!("log sink startup failed: {e:#}");
            record_failure(&self.shared.config.failure_log_path, "CRITICAL", &detail);
            return Err(OrchestratorError::Logging(detail));
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_flush_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.writer),
            token.clone(),
        ));

        *self.cancel.lock().expect("sink mutex poisoned") = token;
        *self.worker.lock().expect("sink mutex poisoned") = Some(handle);
        tracing::info!(
            source_id = %self.shared.config.source_id,
            "log sink started"
        );
        Ok(())
    }

    /// Non-blocking enqueue. Never raises; records below the configured
    /// level are discarded, overflow evicts the oldest pending record and
    /// increments the drop counter.
    pub fn enqueue(&self, event: LogEvent) {
        if event.level < self.shared.config.min_level {
            return;
        }

        let record = NewLogRecord {
            timestamp: Utc::now(),
            source_type: self.shared.config.source_type,
            source_id: self.shared.config.source_id.clone(),
            log_level: event.level,
            message: event.message,
            task_id: event.task_id,
            worker_id: event.worker_id,
            cycle_number: event.cycle_number,
            metadata: event.metadata,
        };

        let pending = {
            let mut queue = self.shared.queue.lock().expect("sink mutex poisoned");
            queue.push_back(record);
            if queue.len() > self.shared.config.max_queue {
                queue.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.len()
        };

        if pending >= self.shared.config.batch_size {
            self.shared.notify.notify_one();
        }
    }

    /// Stop the flush task, draining the queue up to a bounded deadline.
    /// Records still pending after the deadline are dropped and counted.
    pub async fn stop(&self) {
        let handle = {
            self.cancel.lock().expect("sink mutex poisoned").cancel();
            self.worker.lock().expect("sink mutex poisoned").take()
        };

        if let Some(handle) = handle {
            // The flush loop performs its own bounded drain after
            // cancellation; give it a little headroom beyond that.
            let grace = DRAIN_DEADLINE + StdDuration::from_secs(1);
            if tokio::time::timeout(grace, handle).await.is_err() {
                tracing::warn!("log sink worker did not stop within drain deadline");
            }
        }

        // Anything still queued is lost; account for it.
        let remaining = {
            let mut queue = self.shared.queue.lock().expect("sink mutex poisoned");
            let n = queue.len();
            queue.clear();
            n
        };
        if remaining > 0 {
            self.shared
                .dropped
                .fetch_add(remaining as u64, Ordering::Relaxed);
            tracing::warn!(remaining, "dropped unsubmitted log records at shutdown");
        }
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            queued: self.shared.queue.lock().expect("sink mutex poisoned").len() as u64,
            sent: self.shared.sent.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            errors: self.shared.errors.load(Ordering::Relaxed),
            batches: self.shared.batches.load(Ordering::Relaxed),
            alive: self.alive(),
        }
    }

    fn alive(&self) -> bool {
        self.worker
            .lock()
            .expect("sink mutex poisoned")
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

async fn run_flush_loop(
    shared: Arc<Shared>,
    writer: Arc<dyn LogWriter>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(shared.config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; skip it so the
    // first flush waits a full interval or a batch-size notify.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shared.notify.notified() => {}
            _ = cancel.cancelled() => break,
        }
        flush_pending(&shared, writer.as_ref()).await;
    }

    // Bounded final drain.
    let deadline = tokio::time::Instant::now() + DRAIN_DEADLINE;
    while !queue_is_empty(&shared) {
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        flush_pending(&shared, writer.as_ref()).await;
    }
}

fn queue_is_empty(shared: &Shared) -> bool {
    shared.queue.lock().expect("sink mutex poisoned").is_empty()
}

/// Flush everything currently pending, in `batch_size` chunks.
async fn flush_pending(shared: &Shared, writer: &dyn LogWriter) {
    loop {
        let batch: Vec<NewLogRecord> = {
            let mut queue = shared.queue.lock().expect("sink mutex poisoned");
            let take = queue.len().min(shared.config.batch_size);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }
        submit_batch(shared, writer, batch).await;
    }
}

async fn submit_batch(shared: &Shared, writer: &dyn LogWriter, batch: Vec<NewLogRecord>) {
    let mut backoff = SUBMIT_BACKOFF;
    for attempt in 1..=MAX_SUBMIT_ATTEMPTS {
        match writer.write_batch(&batch).await {
            Ok(()) => {
                shared.sent.fetch_add(batch.len() as u64, Ordering::Relaxed);
                shared.batches.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) if attempt < MAX_SUBMIT_ATTEMPTS => {
                tracing::warn!(
                    attempt = attempt,
                    error = %e,
                    "log batch submission failed, retrying in {:?}",
                    backoff
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                shared.errors.fetch_add(1, Ordering::Relaxed);
                shared
                    .dropped
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                tracing::error!(
                    records = batch.len(),
                    error = %e,
                    "log batch discarded after retry exhaustion"
                );
            }
        }
    }
}

/// The default location for sink-failure diagnostics.
pub fn default_failure_log_path() -> PathBuf {
    std::env::temp_dir().join("corral-logsink-failure.log")
}

/// Write a sink-failure diagnostic to the local file and to stderr. Both
/// channels are available even when the store is not.
pub fn record_failure(path: &std::path::Path, level: &str, detail: &str) {
    eprintln!("{level}: {detail}");
    let line = format!("{} {level} {detail}\n", Utc::now().to_rfc3339());
    let write_result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| f.write_all(line.as_bytes()));
    if let Err(e) = write_result {
        eprintln!("CRITICAL: additionally failed to write {}: {e}", path.display());
    }
}
