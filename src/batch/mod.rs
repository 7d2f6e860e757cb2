//! Batch sender — the hardest subsystem: bounded per-kind queues, a
//! drain/batcher loop, a bounded send-worker pool, retry with backoff, and
//! graceful shutdown (spec.md §4.11).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error_event::ErrorEvent;
use crate::span::Span;
use crate::transport::error_exporter::ErrorExporter;
use crate::transport::otlp::{OtlpExporter, ResourceAttributes};

const MAX_RETRY_ATTEMPTS: u32 = 3;
const BASE_RETRY_DELAY_MS: u64 = 1_000;
const DRAIN_TICK: Duration = Duration::from_millis(100);
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
const DISPATCH_CHANNEL_CAPACITY: usize = 16;

/// Sender configuration, derived from [`crate::Config`] at `start()`.
pub struct BatchSenderConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub resource: ResourceAttributes,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_queue_size: usize,
    pub max_concurrent_sends: usize,
}

/// Per-payload-kind counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct KindCounts {
    pub span: u64,
    pub error: u64,
}

/// A point-in-time copy of the sender's statistics.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub enqueued: KindCounts,
    pub sent: KindCounts,
    pub dropped: KindCounts,
    pub failed: KindCounts,
    pub retries: u64,
}

#[derive(Default)]
struct Stats {
    enqueued: KindCounts,
    sent: KindCounts,
    dropped: KindCounts,
    failed: KindCounts,
    retries: u64,
}

impl Stats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued,
            sent: self.sent,
            dropped: self.dropped,
            failed: self.failed,
            retries: self.retries,
        }
    }
}

struct PendingBuffers {
    span: Vec<Span>,
    error: Vec<ErrorEvent>,
    last_flush_span: Instant,
    last_flush_error: Instant,
}

enum Batch {
    Span(Vec<Span>),
    Error(Vec<ErrorEvent>),
    Shutdown,
}

struct Inner {
    config: BatchSenderConfig,
    span_queue: ArrayQueue<Span>,
    error_queue: ArrayQueue<ErrorEvent>,
    pending: Mutex<PendingBuffers>,
    stats: Mutex<Stats>,
    otlp: OtlpExporter,
    errors: ErrorExporter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SenderState {
    Stopped,
    Started,
    Stopping,
}

/// Owns the background runtime, queues, and worker pool for a single
/// `Apm` instance. State machine: `Stopped -> Started -> Stopping -> Stopped`.
pub struct BatchSender {
    inner: Arc<Inner>,
    runtime: Mutex<Option<Runtime>>,
    dispatch_txs: Mutex<Vec<mpsc::Sender<Batch>>>,
    next_worker: Arc<AtomicU32>,
    drain_shutdown: Arc<AtomicBool>,
    drain_handle: Mutex<Option<JoinHandle<()>>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    state: Mutex<SenderState>,
}

impl BatchSender {
    pub fn new(config: BatchSenderConfig) -> Self {
        let otlp = OtlpExporter::new(config.endpoint.clone(), config.api_key.clone(), config.resource.clone());
        let errors = ErrorExporter::new(config.endpoint.clone(), config.api_key.clone());
        let max_queue_size = config.max_queue_size.max(1);
        let inner = Arc::new(Inner {
            span_queue: ArrayQueue::new(max_queue_size),
            error_queue: ArrayQueue::new(max_queue_size),
            pending: Mutex::new(PendingBuffers {
                span: Vec::new(),
                error: Vec::new(),
                last_flush_span: Instant::now(),
                last_flush_error: Instant::now(),
            }),
            stats: Mutex::new(Stats::default()),
            otlp,
            errors,
            config,
        });
        Self {
            inner,
            runtime: Mutex::new(None),
            dispatch_txs: Mutex::new(Vec::new()),
            next_worker: Arc::new(AtomicU32::new(0)),
            drain_shutdown: Arc::new(AtomicBool::new(false)),
            drain_handle: Mutex::new(None),
            worker_handles: Mutex::new(Vec::new()),
            state: Mutex::new(SenderState::Stopped),
        }
    }

    /// Idempotent under a start-mutex. Spawns the background runtime, the
    /// drain loop, and the send-worker pool.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if *state != SenderState::Stopped {
            return;
        }

        let worker_count = self.inner.config.max_concurrent_sends.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_count)
            .thread_name("miniapm-batch-sender")
            .enable_all()
            .build()
            .expect("failed to start miniapm background runtime");

        self.drain_shutdown.store(false, Ordering::SeqCst);

        let mut dispatch_txs = Vec::with_capacity(worker_count);
        let mut worker_handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (tx, mut rx) = mpsc::channel::<Batch>(DISPATCH_CHANNEL_CAPACITY);
            let worker_inner = Arc::clone(&self.inner);
            let handle = runtime.spawn(async move {
                while let Some(batch) = rx.recv().await {
                    match batch {
                        Batch::Span(items) => send_spans_with_retry(&worker_inner, items).await,
                        Batch::Error(items) => send_errors_with_retry(&worker_inner, items).await,
                        Batch::Shutdown => break,
                    }
                }
            });
            dispatch_txs.push(tx);
            worker_handles.push(handle);
        }

        let drain_inner = Arc::clone(&self.inner);
        let drain_txs = dispatch_txs.clone();
        let drain_counter = Arc::clone(&self.next_worker);
        let shutdown = Arc::clone(&self.drain_shutdown);
        let drain_handle = runtime.spawn(async move {
            drain_loop(drain_inner, drain_txs, drain_counter, shutdown).await;
        });

        *self.dispatch_txs.lock() = dispatch_txs;
        *self.drain_handle.lock() = Some(drain_handle);
        *self.worker_handles.lock() = worker_handles;
        *self.runtime.lock() = Some(runtime);
        *state = SenderState::Started;
    }

    /// No-op if not started. Drops on a full queue, incrementing `dropped.span`.
    pub fn enqueue_span(&self, span: Span) {
        if *self.state.lock() != SenderState::Started {
            return;
        }
        let mut stats = self.inner.stats.lock();
        match self.inner.span_queue.push(span) {
            Ok(()) => stats.enqueued.span += 1,
            Err(_) => stats.dropped.span += 1,
        }
    }

    /// No-op if not started. Drops on a full queue, incrementing `dropped.error`.
    pub fn enqueue_error(&self, error: ErrorEvent) {
        if *self.state.lock() != SenderState::Started {
            return;
        }
        let mut stats = self.inner.stats.lock();
        match self.inner.error_queue.push(error) {
            Ok(()) => stats.enqueued.error += 1,
            Err(_) => stats.dropped.error += 1,
        }
    }

    /// Move pending queue contents to batches immediately, dispatch them,
    /// then block up to 5 s waiting for the dispatch channels to drain.
    pub fn flush(&self) {
        if *self.state.lock() != SenderState::Started {
            return;
        }
        let runtime = self.runtime.lock();
        let Some(runtime) = runtime.as_ref() else { return };

        let dispatch_txs = self.dispatch_txs.lock().clone();
        let next_worker = Arc::clone(&self.next_worker);
        let inner = Arc::clone(&self.inner);
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        runtime.spawn(async move {
            force_flush(&inner, &dispatch_txs, &next_worker).await;
            let deadline = Instant::now() + FLUSH_TIMEOUT;
            while Instant::now() < deadline {
                let idle = dispatch_txs.iter().all(|tx| tx.capacity() == DISPATCH_CHANNEL_CAPACITY);
                if idle {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            let _ = done_tx.send(());
        });

        let _ = done_rx.recv_timeout(FLUSH_TIMEOUT + Duration::from_secs(1));
    }

    /// Idempotent. Drains queues, dispatches final batches, joins the drain
    /// loop and workers (each bounded at 5 s), then returns to `Stopped`.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == SenderState::Stopped {
                return;
            }
            *state = SenderState::Stopping;
        }

        self.drain_shutdown.store(true, Ordering::SeqCst);

        if let Some(runtime) = self.runtime.lock().take() {
            let dispatch_txs = self.dispatch_txs.lock().clone();
            let next_worker = Arc::clone(&self.next_worker);
            let drain_handle = self.drain_handle.lock().take();
            let worker_handles: Vec<_> = self.worker_handles.lock().drain(..).collect();
            let inner = Arc::clone(&self.inner);
            let (done_tx, done_rx) = std::sync::mpsc::channel();

            runtime.spawn(async move {
                force_flush(&inner, &dispatch_txs, &next_worker).await;
                if let Some(handle) = drain_handle {
                    let _ = tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await;
                }
                for tx in &dispatch_txs {
                    let _ = tx.send(Batch::Shutdown).await;
                }
                for handle in worker_handles {
                    let _ = tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await;
                }
                let _ = done_tx.send(());
            });

            let _ = done_rx.recv_timeout(SHUTDOWN_JOIN_TIMEOUT * 2);
            // Dropping `runtime` here shuts down any remaining background threads.
        }

        self.dispatch_txs.lock().clear();
        *self.state.lock() = SenderState::Stopped;
    }

    pub fn is_started(&self) -> bool {
        *self.state.lock() == SenderState::Started
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.lock().snapshot()
    }
}

async fn drain_loop(
    inner: Arc<Inner>,
    dispatch_txs: Vec<mpsc::Sender<Batch>>,
    next_worker: Arc<AtomicU32>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        drain_tick(&inner, &dispatch_txs, &next_worker).await;
        tokio::time::sleep(DRAIN_TICK).await;
    }
}

async fn drain_tick(inner: &Inner, dispatch_txs: &[mpsc::Sender<Batch>], next_worker: &AtomicU32) {
    let span_batch = {
        let mut pending = inner.pending.lock();
        while pending.span.len() < inner.config.batch_size {
            match inner.span_queue.pop() {
                Some(span) => pending.span.push(span),
                None => break,
            }
        }
        let should_flush = !pending.span.is_empty()
            && (pending.span.len() >= inner.config.batch_size
                || pending.last_flush_span.elapsed() >= inner.config.flush_interval);
        if should_flush {
            pending.last_flush_span = Instant::now();
            Some(std::mem::take(&mut pending.span))
        } else {
            None
        }
    };
    if let Some(batch) = span_batch {
        round_robin_send(dispatch_txs, next_worker, Batch::Span(batch)).await;
    }

    let error_batch = {
        let mut pending = inner.pending.lock();
        while pending.error.len() < inner.config.batch_size {
            match inner.error_queue.pop() {
                Some(err) => pending.error.push(err),
                None => break,
            }
        }
        let should_flush = !pending.error.is_empty()
            && (pending.error.len() >= inner.config.batch_size
                || pending.last_flush_error.elapsed() >= inner.config.flush_interval);
        if should_flush {
            pending.last_flush_error = Instant::now();
            Some(std::mem::take(&mut pending.error))
        } else {
            None
        }
    };
    if let Some(batch) = error_batch {
        round_robin_send(dispatch_txs, next_worker, Batch::Error(batch)).await;
    }
}

/// Drain whatever is pending right now, regardless of `batch_size`, and
/// dispatch it. Used by `Flush` and `Stop`.
async fn force_flush(inner: &Inner, dispatch_txs: &[mpsc::Sender<Batch>], next_worker: &AtomicU32) {
    let (span_batch, error_batch) = {
        let mut pending = inner.pending.lock();
        while let Some(span) = inner.span_queue.pop() {
            pending.span.push(span);
        }
        while let Some(err) = inner.error_queue.pop() {
            pending.error.push(err);
        }
        pending.last_flush_span = Instant::now();
        pending.last_flush_error = Instant::now();
        (std::mem::take(&mut pending.span), std::mem::take(&mut pending.error))
    };
    if !span_batch.is_empty() {
        round_robin_send(dispatch_txs, next_worker, Batch::Span(span_batch)).await;
    }
    if !error_batch.is_empty() {
        round_robin_send(dispatch_txs, next_worker, Batch::Error(error_batch)).await;
    }
}

async fn round_robin_send(txs: &[mpsc::Sender<Batch>], counter: &AtomicU32, batch: Batch) {
    if txs.is_empty() {
        return;
    }
    let idx = counter.fetch_add(1, Ordering::Relaxed) as usize % txs.len();
    let _ = txs[idx].send(batch).await;
}

fn retry_delay(attempt: u32) -> Duration {
    let base_ms = BASE_RETRY_DELAY_MS as f64 * 2f64.powi((attempt - 1) as i32);
    let jitter_ms = rand::random::<f64>() * 0.1 * base_ms;
    Duration::from_millis((base_ms + jitter_ms) as u64)
}

async fn send_spans_with_retry(inner: &Inner, items: Vec<Span>) {
    let count = items.len() as u64;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match inner.otlp.export(&items).await {
            None => return,
            Some(result) if result.success => {
                inner.stats.lock().sent.span += count;
                return;
            }
            Some(result) if (400..500).contains(&(result.status as u32)) => {
                tracing::warn!(status = result.status, "span batch export failed permanently");
                inner.stats.lock().failed.span += 1;
                return;
            }
            Some(result) => {
                if attempt >= MAX_RETRY_ATTEMPTS {
                    tracing::error!(status = result.status, "span batch export failed after max retries");
                    inner.stats.lock().failed.span += 1;
                    return;
                }
                inner.stats.lock().retries += 1;
                tokio::time::sleep(retry_delay(attempt)).await;
            }
        }
    }
}

async fn send_errors_with_retry(inner: &Inner, items: Vec<ErrorEvent>) {
    if inner.config.api_key.is_none() {
        return;
    }
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = inner.errors.export_batch(&items).await;
        if result.failed == 0 {
            inner.stats.lock().sent.error += result.sent as u64;
            return;
        }
        if (400..500).contains(&(result.status as u32)) {
            tracing::warn!(status = result.status, "error batch export failed permanently");
            inner.stats.lock().failed.error += 1;
            return;
        }
        if attempt >= MAX_RETRY_ATTEMPTS {
            tracing::error!(status = result.status, "error batch export failed after max retries");
            inner.stats.lock().failed.error += 1;
            return;
        }
        inner.stats.lock().retries += 1;
        tokio::time::sleep(retry_delay(attempt)).await;
    }
}
