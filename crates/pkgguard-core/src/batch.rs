//! Bounded-concurrency batch scheduler.
//!
//! The input list is partitioned into chunks. A driver task keeps at most
//! `concurrency` chunk workers alive; each worker fetches its chunk and
//! forwards decoded records as [`WorkerStep`]s over one shared channel.
//! Results reach the caller in completion order across chunks and in arrival
//! order within a chunk.
//!
//! ```text
//! items ─► partition ─► [driver] ─spawn─► worker(slot 0) ─┐
//!                          ▲              worker(slot 1) ─┤ WorkerStep
//!                          └──────────────────────────────┘
//!                          │
//!                          ▼
//!                     BatchStream (Result<BatchResult, ApiError>)
//! ```
//!
//! A chunk that fails (fetch error or broken body) contributes exactly one
//! [`BatchResult::Failure`] and never stops its siblings. The driver also
//! watches every worker task, so a worker that dies before finishing (a
//! panicking fetcher, say) is reported the same way and its slot refilled.
//! Server errors that exhausted their retries are fatal: they are yielded as
//! `Err` and the run ends.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::channel::mpsc as out_mpsc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinError};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::error::ApiError;
use crate::transport::RecordStream;

/// A contiguous slice of the input list, handled by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position of this chunk in creation order.
    pub index: usize,
    pub components: Vec<String>,
}

/// Split `items` into ordered chunks of `chunk_size` (the last may be short).
///
/// A `chunk_size` of 0 is treated as 1.
pub fn partition(items: Vec<String>, chunk_size: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(chunk_size));
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        chunks.push(Chunk {
            index: chunks.len(),
            components: items.by_ref().take(chunk_size).collect(),
        });
    }
    chunks
}

/// One unit of batch output.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchResult {
    Success {
        data: Value,
        status: u16,
    },
    Failure {
        /// Index of the chunk that failed.
        chunk: usize,
        error: String,
        cause: Option<String>,
        status: Option<u16>,
    },
}

impl BatchResult {
    pub fn failure(chunk: usize, err: &ApiError) -> Self {
        let root = err.root();
        Self::Failure {
            chunk,
            error: err.to_string(),
            cause: match err {
                ApiError::RetriesExhausted { .. } => Some(root.to_string()),
                _ => std::error::Error::source(err).map(ToString::to_string),
            },
            status: err.status(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Success { data, .. } => Some(data),
            Self::Failure { .. } => None,
        }
    }

    /// `{"success":true,"data":…,"status":…}` or
    /// `{"success":false,"error":…,"cause":…,"status":…}`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Success { data, status } => json!({
                "success": true,
                "data": data,
                "status": status,
            }),
            Self::Failure {
                error,
                cause,
                status,
                ..
            } => json!({
                "success": false,
                "error": error,
                "cause": cause,
                "status": status,
            }),
        }
    }
}

/// A fetched chunk: the response status plus its decoded records.
pub struct ChunkResponse {
    pub status: u16,
    pub records: RecordStream,
}

/// Fetches the records of one chunk.
///
/// Implemented for any `Fn(Chunk) -> Future<Output = Result<ChunkResponse, ApiError>>`.
#[async_trait]
pub trait ChunkFetcher: Send + Sync + 'static {
    async fn fetch(&self, chunk: &Chunk) -> Result<ChunkResponse, ApiError>;
}

#[async_trait]
impl<F, Fut> ChunkFetcher for F
where
    F: Fn(Chunk) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ChunkResponse, ApiError>> + Send + 'static,
{
    async fn fetch(&self, chunk: &Chunk) -> Result<ChunkResponse, ApiError> {
        (self)(chunk.clone()).await
    }
}

/// Configuration for a batch run.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Components per chunk.
    pub chunk_size: usize,
    /// Maximum number of chunks in flight.
    pub concurrency: usize,
    /// Capacity of the worker step channel and of the output channel.
    pub channel_capacity: usize,
    /// Parent token; cancelling it stops the run.
    pub cancel: Option<CancellationToken>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            concurrency: 10,
            channel_capacity: 64,
            cancel: None,
        }
    }
}

/// Counters for a batch run, updated by the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub chunks_total: usize,
    pub chunks_dispatched: usize,
    pub chunks_completed: usize,
    pub chunks_failed: usize,
    pub records: usize,
    pub active_workers: usize,
    pub peak_workers: usize,
}

/// Identity of a worker in the running set.
type SlotId = u64;

/// What a worker reports to the driver on each turn. A finishing step may
/// still carry one last item.
struct WorkerStep {
    slot: SlotId,
    item: Option<Result<BatchResult, ApiError>>,
    done: bool,
}

/// Runs batches with a fixed configuration.
#[derive(Debug, Clone, Default)]
pub struct BatchScheduler {
    config: BatchConfig,
}

impl BatchScheduler {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Start a batch run over `items`. Must be called inside a Tokio runtime.
    pub fn stream(&self, items: Vec<String>, fetcher: Arc<dyn ChunkFetcher>) -> BatchStream {
        let chunks: VecDeque<Chunk> = partition(items, self.config.chunk_size).into();
        let capacity = self.config.channel_capacity.max(1);

        // A child token per run: cancelling the parent reaches us, finishing
        // the run never touches the parent.
        let token = match &self.config.cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };

        let (out_tx, out_rx) = out_mpsc::channel(capacity);
        let (stats_tx, stats_rx) = watch::channel(BatchStats {
            chunks_total: chunks.len(),
            ..BatchStats::default()
        });

        let driver = Driver {
            chunks,
            fetcher,
            concurrency: self.config.concurrency.max(1),
            step_capacity: capacity,
            out: out_tx,
            stats: stats_tx,
            cancel: token.clone(),
        };
        tokio::spawn(driver.run());

        BatchStream {
            rx: out_rx,
            stats: stats_rx,
            token: token.clone(),
            _guard: token.drop_guard(),
        }
    }
}

/// Start a batch run with the given chunk size and concurrency limit.
pub fn stream_batches(
    items: Vec<String>,
    chunk_size: usize,
    concurrency: usize,
    fetcher: Arc<dyn ChunkFetcher>,
) -> BatchStream {
    BatchScheduler::new(BatchConfig {
        chunk_size,
        concurrency,
        ..BatchConfig::default()
    })
    .stream(items, fetcher)
}

/// Output of a batch run. Finite and not restartable; dropping it cancels the
/// run.
pub struct BatchStream {
    rx: out_mpsc::Receiver<Result<BatchResult, ApiError>>,
    stats: watch::Receiver<BatchStats>,
    token: CancellationToken,
    _guard: DropGuard,
}

impl BatchStream {
    /// Snapshot of the run's counters.
    pub fn stats(&self) -> BatchStats {
        self.stats.borrow().clone()
    }

    /// Stop in-flight workers and further dispatch.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Stream for BatchStream {
    type Item = Result<BatchResult, ApiError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for BatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchStream")
            .field("stats", &*self.stats.borrow())
            .finish_non_exhaustive()
    }
}

struct Driver {
    chunks: VecDeque<Chunk>,
    fetcher: Arc<dyn ChunkFetcher>,
    concurrency: usize,
    step_capacity: usize,
    out: out_mpsc::Sender<Result<BatchResult, ApiError>>,
    stats: watch::Sender<BatchStats>,
    cancel: CancellationToken,
}

/// Exit notification of a worker task: slot, chunk index, join result.
type WorkerExit = BoxFuture<'static, (SlotId, usize, Result<(), JoinError>)>;

/// What woke the driver up.
enum Event {
    Step(WorkerStep),
    Exit(SlotId, usize, Result<(), JoinError>),
}

/// Workers in flight, keyed by slot, plus their pending exits.
#[derive(Default)]
struct Running {
    slots: HashMap<SlotId, AbortHandle>,
    exits: FuturesUnordered<WorkerExit>,
    next_slot: SlotId,
}

impl Running {
    fn len(&self) -> usize {
        self.slots.len()
    }

    fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Driver {
    async fn run(mut self) {
        let (step_tx, mut step_rx) = mpsc::channel::<WorkerStep>(self.step_capacity);
        let mut running = Running::default();

        info!(
            chunks = self.chunks.len(),
            concurrency = self.concurrency,
            "batch started"
        );

        self.fill(&mut running, &step_tx);

        while !running.is_empty() {
            // Steps are polled before exits: a worker's final step is queued
            // before its task completes, so it is always seen first.
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(in_flight = running.len(), "batch cancelled");
                    let _ = self.out.send(Err(ApiError::Cancelled)).await;
                    break;
                }
                step = step_rx.recv() => match step {
                    Some(step) => Event::Step(step),
                    None => break,
                },
                Some((slot, chunk, joined)) = running.exits.next() => Event::Exit(slot, chunk, joined),
            };

            let (item, finished) = match event {
                Event::Step(step) => (step.item, step.done.then_some(step.slot)),
                Event::Exit(slot, chunk, joined) => {
                    if !running.slots.contains_key(&slot) {
                        // already retired by its done step
                        continue;
                    }
                    let reason = match joined {
                        Err(e) if e.is_panic() => "chunk worker panicked".to_string(),
                        Err(e) => format!("chunk worker stopped: {e}"),
                        Ok(()) => "chunk worker exited without finishing".to_string(),
                    };
                    error!(slot, chunk, reason = %reason, "worker ended abnormally");
                    let failure = BatchResult::Failure {
                        chunk,
                        error: reason,
                        cause: None,
                        status: None,
                    };
                    (Some(Ok(failure)), Some(slot))
                }
            };

            if let Some(item) = item {
                let fatal = item.is_err();
                self.record(&item);
                if self.out.send(item).await.is_err() {
                    debug!("batch consumer dropped, stopping");
                    self.cancel.cancel();
                    break;
                }
                if fatal {
                    error!(slot = ?finished, "fatal chunk failure, aborting batch");
                    self.cancel.cancel();
                    break;
                }
            }

            if let Some(slot) = finished {
                // Resolve the finished worker by identity, never by position.
                if running.slots.remove(&slot).is_some() {
                    self.stats.send_modify(|s| {
                        s.chunks_completed += 1;
                        s.active_workers = running.len();
                    });
                }
                self.fill(&mut running, &step_tx);
            }
        }

        for (_, handle) in running.slots.drain() {
            handle.abort();
        }
        self.stats.send_modify(|s| s.active_workers = 0);

        let stats = self.stats.borrow().clone();
        info!(
            completed = stats.chunks_completed,
            failed = stats.chunks_failed,
            records = stats.records,
            peak_workers = stats.peak_workers,
            "batch finished"
        );
    }

    /// Backfill free slots with the next unassigned chunks.
    fn fill(&mut self, running: &mut Running, steps: &mpsc::Sender<WorkerStep>) {
        while running.len() < self.concurrency && !self.cancel.is_cancelled() {
            let Some(chunk) = self.chunks.pop_front() else {
                break;
            };
            let slot = running.next_slot;
            running.next_slot += 1;
            let index = chunk.index;

            debug!(slot, chunk = index, size = chunk.components.len(), "dispatching chunk");
            let handle = tokio::spawn(run_worker(
                slot,
                chunk,
                Arc::clone(&self.fetcher),
                steps.clone(),
                self.cancel.clone(),
            ));
            running.slots.insert(slot, handle.abort_handle());
            running.exits.push(handle.map(move |joined| (slot, index, joined)).boxed());

            self.stats.send_modify(|s| {
                s.chunks_dispatched += 1;
                s.active_workers = running.len();
                s.peak_workers = s.peak_workers.max(running.len());
            });
        }
    }

    fn record(&self, item: &Result<BatchResult, ApiError>) {
        self.stats.send_modify(|s| match item {
            Ok(BatchResult::Success { .. }) => s.records += 1,
            Ok(BatchResult::Failure { .. }) | Err(_) => s.chunks_failed += 1,
        });
    }
}

/// Terminal item for a chunk that failed with `err`.
fn terminal_item(chunk: usize, err: ApiError) -> Result<BatchResult, ApiError> {
    if err.is_fatal() {
        Err(err)
    } else {
        warn!(chunk, error = %err, "chunk failed");
        Ok(BatchResult::failure(chunk, &err))
    }
}

async fn run_worker(
    slot: SlotId,
    chunk: Chunk,
    fetcher: Arc<dyn ChunkFetcher>,
    steps: mpsc::Sender<WorkerStep>,
    cancel: CancellationToken,
) {
    let send = |item: Option<Result<BatchResult, ApiError>>, done: bool| {
        let steps = steps.clone();
        async move { steps.send(WorkerStep { slot, item, done }).await.is_ok() }
    };

    let fetched = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        fetched = fetcher.fetch(&chunk) => fetched,
    };
    let ChunkResponse { status, mut records } = match fetched {
        Ok(response) => response,
        Err(e) => {
            send(Some(terminal_item(chunk.index, e)), true).await;
            return;
        }
    };

    // Hold one record back so the last one travels with the done flag.
    let mut held: Option<Value> = None;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = records.next() => next,
        };
        match next {
            Some(Ok(data)) => {
                if let Some(prev) = held.replace(data) {
                    let item = Ok(BatchResult::Success { data: prev, status });
                    if !send(Some(item), false).await {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                if let Some(prev) = held.take() {
                    let item = Ok(BatchResult::Success { data: prev, status });
                    if !send(Some(item), false).await {
                        return;
                    }
                }
                send(Some(terminal_item(chunk.index, e)), true).await;
                return;
            }
            None => {
                let last = held.take().map(|data| Ok(BatchResult::Success { data, status }));
                send(last, true).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::ndjson::decode_stream;
    use crate::transport::ByteStream;

    fn items(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn records_for(chunk: &Chunk) -> ChunkResponse {
        let body: String = chunk
            .components
            .iter()
            .map(|c| format!("{{\"purl\":\"{c}\"}}\n"))
            .collect();
        let body: ByteStream = Box::pin(futures::stream::once(async move { Ok(Bytes::from(body)) }));
        ChunkResponse {
            status: 200,
            records: decode_stream(body),
        }
    }

    async fn drain(stream: BatchStream) -> Vec<Result<BatchResult, ApiError>> {
        stream.collect().await
    }

    #[test]
    fn partition_reproduces_items() {
        let input = items(&["a", "b", "c", "d", "e"]);
        for size in 1..=6 {
            let chunks = partition(input.clone(), size);
            let joined: Vec<String> = chunks.iter().flat_map(|c| c.components.clone()).collect();
            assert_eq!(joined, input, "chunk size {size}");
            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.index, i);
                if i + 1 < chunks.len() {
                    assert_eq!(chunk.components.len(), size);
                } else {
                    assert!(chunk.components.len() <= size && !chunk.components.is_empty());
                }
            }
        }
        assert!(partition(Vec::new(), 3).is_empty());
        assert_eq!(partition(input, 0).len(), 5);
    }

    #[test]
    fn failure_shape() {
        let err = ApiError::RetriesExhausted {
            attempts: 2,
            source: Box::new(ApiError::protocol(404, "Not Found")),
        };
        let result = BatchResult::failure(3, &err);
        assert_eq!(
            result.to_json(),
            json!({
                "success": false,
                "error": "request failed after 2 attempt(s): HTTP 404: Not Found",
                "cause": "HTTP 404: Not Found",
                "status": 404,
            })
        );
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn failed_chunk_does_not_stop_siblings() {
        let fetcher = |chunk: Chunk| async move {
            if chunk.index == 0 {
                Err(ApiError::protocol(400, "Bad Request"))
            } else {
                Ok::<_, ApiError>(records_for(&chunk))
            }
        };
        let out = drain(stream_batches(items(&["A", "B", "C", "D"]), 2, 1, Arc::new(fetcher))).await;

        assert_eq!(out.len(), 3);
        match &out[0] {
            Ok(BatchResult::Failure { chunk, status, .. }) => {
                assert_eq!(*chunk, 0);
                assert_eq!(*status, Some(400));
            }
            other => panic!("expected failure first, got {other:?}"),
        }
        assert_eq!(out[1].as_ref().unwrap().data(), Some(&json!({"purl": "C"})));
        assert_eq!(out[2].as_ref().unwrap().data(), Some(&json!({"purl": "D"})));
    }

    #[tokio::test]
    async fn panicking_worker_becomes_a_failure() {
        let fetcher = |chunk: Chunk| async move {
            if chunk.index == 0 {
                panic!("fetcher blew up");
            }
            Ok::<_, ApiError>(records_for(&chunk))
        };
        let stream = stream_batches(items(&["a", "b"]), 1, 2, Arc::new(fetcher));
        let out = tokio::time::timeout(Duration::from_secs(5), drain(stream))
            .await
            .expect("stream must end when a worker dies");

        assert_eq!(out.len(), 2);
        let failures: Vec<_> = out
            .iter()
            .filter_map(|r| match r {
                Ok(BatchResult::Failure { chunk, status, .. }) => Some((*chunk, *status)),
                _ => None,
            })
            .collect();
        assert_eq!(failures, vec![(0, None)]);
        assert!(out
            .iter()
            .any(|r| r.as_ref().ok().and_then(BatchResult::data) == Some(&json!({"purl": "b"}))));
    }

    #[tokio::test]
    async fn panicking_worker_slot_is_backfilled() {
        let fetcher = |chunk: Chunk| async move {
            if chunk.index == 1 {
                panic!("fetcher blew up");
            }
            Ok::<_, ApiError>(records_for(&chunk))
        };
        let stream = stream_batches(items(&["a", "b", "c", "d"]), 1, 1, Arc::new(fetcher));
        let out = tokio::time::timeout(Duration::from_secs(5), drain(stream))
            .await
            .expect("stream must end when a worker dies");

        assert_eq!(out.len(), 4);
        assert_eq!(out.iter().filter(|r| matches!(r, Ok(r) if r.is_success())).count(), 3);
    }

    #[tokio::test]
    async fn no_loss_no_duplication() {
        let input: Vec<String> = (0..97).map(|i| format!("pkg:npm/p{i}@1.0.0")).collect();
        let fetcher = |chunk: Chunk| async move {
            // stagger completions so chunks interleave
            tokio::time::sleep(Duration::from_millis((7 * chunk.index as u64) % 5)).await;
            Ok::<_, ApiError>(records_for(&chunk))
        };
        let stream = stream_batches(input.clone(), 10, 3, Arc::new(fetcher));
        let out = drain(stream).await;

        let mut seen: Vec<String> = out
            .into_iter()
            .map(|r| r.unwrap().data().unwrap()["purl"].as_str().unwrap().to_string())
            .collect();
        seen.sort();
        let mut expected = input;
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn within_chunk_order_is_preserved() {
        let input: Vec<String> = (0..40).map(|i| format!("{i:02}")).collect();
        let fetcher = |chunk: Chunk| async move {
            tokio::time::sleep(Duration::from_millis(((chunk.index * 3) % 4) as u64)).await;
            Ok::<_, ApiError>(records_for(&chunk))
        };
        let out = drain(stream_batches(input, 8, 4, Arc::new(fetcher))).await;

        let mut last_per_chunk: HashMap<usize, usize> = HashMap::new();
        for item in out {
            let purl = item.unwrap().data().unwrap()["purl"].as_str().unwrap().to_string();
            let n: usize = purl.parse().unwrap();
            let chunk = n / 8;
            if let Some(prev) = last_per_chunk.insert(chunk, n) {
                assert!(prev < n, "chunk {chunk} emitted {prev} before {n}");
            }
        }
        assert_eq!(last_per_chunk.len(), 5);
    }

    #[tokio::test]
    async fn concurrency_limit_is_respected() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let fetcher = move |chunk: Chunk| {
            let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ApiError>(records_for(&chunk))
            }
        };
        let input: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        let stream = stream_batches(input, 2, 4, Arc::new(fetcher));
        let out = drain(stream).await;

        assert_eq!(out.len(), 50);
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn stats_track_peak_workers() {
        let fetcher = |chunk: Chunk| async move { Ok::<_, ApiError>(records_for(&chunk)) };
        let input: Vec<String> = (0..9).map(|i| i.to_string()).collect();
        let mut stream = stream_batches(input, 2, 3, Arc::new(fetcher));
        let mut count = 0;
        while let Some(item) = stream.next().await {
            item.unwrap();
            count += 1;
        }
        let stats = stream.stats();
        assert_eq!(count, 9);
        assert_eq!(stats.chunks_total, 5);
        assert_eq!(stats.chunks_dispatched, 5);
        assert_eq!(stats.chunks_completed, 5);
        assert_eq!(stats.records, 9);
        assert!(stats.peak_workers <= 3);
        assert_eq!(stats.active_workers, 0);
    }

    #[tokio::test]
    async fn broken_body_yields_one_failure_after_records() {
        let fetcher = |chunk: Chunk| async move {
            let chunks: Vec<Result<Bytes, ApiError>> = vec![
                Ok(Bytes::from_static(b"{\"n\":1}\n{\"n\":2}\n{\"n\"")),
                Err(ApiError::StreamTransport("connection reset".into())),
            ];
            let body: ByteStream = Box::pin(futures::stream::iter(chunks));
            let _ = chunk;
            Ok::<_, ApiError>(ChunkResponse {
                status: 200,
                records: decode_stream(body),
            })
        };
        let out = drain(stream_batches(items(&["x"]), 1, 1, Arc::new(fetcher))).await;
        assert_eq!(out.len(), 3);
        assert!(out[0].as_ref().unwrap().is_success());
        assert!(out[1].as_ref().unwrap().is_success());
        assert!(matches!(out[2], Ok(BatchResult::Failure { chunk: 0, .. })));
    }

    #[tokio::test]
    async fn exhausted_server_error_is_fatal() {
        let fetcher = |chunk: Chunk| async move {
            if chunk.index == 0 {
                Err(ApiError::RetriesExhausted {
                    attempts: 4,
                    source: Box::new(ApiError::protocol(503, "Service Unavailable")),
                })
            } else {
                Ok::<_, ApiError>(records_for(&chunk))
            }
        };
        let out = drain(stream_batches(items(&["A", "B", "C", "D"]), 2, 1, Arc::new(fetcher))).await;
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Err(e) if e.is_fatal()));
    }

    #[tokio::test]
    async fn parent_cancellation_stops_dispatch() {
        let parent = CancellationToken::new();
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        let fetcher = move |chunk: Chunk| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok::<_, ApiError>(records_for(&chunk))
            }
        };
        let scheduler = BatchScheduler::new(BatchConfig {
            chunk_size: 1,
            concurrency: 2,
            cancel: Some(parent.clone()),
            ..BatchConfig::default()
        });
        let input: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        let mut stream = scheduler.stream(input, Arc::new(fetcher));

        tokio::time::sleep(Duration::from_millis(20)).await;
        parent.cancel();

        let rest: Vec<_> = tokio::time::timeout(Duration::from_secs(5), async {
            let mut rest = Vec::new();
            while let Some(item) = stream.next().await {
                rest.push(item);
            }
            rest
        })
        .await
        .expect("stream should end after cancellation");

        assert_eq!(rest.len(), 1);
        assert!(matches!(rest[0], Err(ApiError::Cancelled)));
        assert!(started.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn finished_run_leaves_parent_token_untouched() {
        let parent = CancellationToken::new();
        let scheduler = BatchScheduler::new(BatchConfig {
            chunk_size: 2,
            concurrency: 2,
            cancel: Some(parent.clone()),
            ..BatchConfig::default()
        });
        for _ in 0..3 {
            let fetcher = |chunk: Chunk| async move { Ok::<_, ApiError>(records_for(&chunk)) };
            let out = drain(scheduler.stream(items(&["a", "b", "c"]), Arc::new(fetcher))).await;
            assert_eq!(out.len(), 3);
        }
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn empty_input_ends_immediately() {
        let fetcher = |chunk: Chunk| async move { Ok::<_, ApiError>(records_for(&chunk)) };
        let out = drain(stream_batches(Vec::new(), 5, 2, Arc::new(fetcher))).await;
        assert!(out.is_empty());
    }
}
