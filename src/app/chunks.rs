//! Chunk scheduler for resumable parallel transfers
//!
//! Splits an artifact into fixed-size byte ranges and runs a bounded pool of
//! worker tasks performing range-limited fetches through the
//! [`TransferClient`] abstraction. Each worker writes its range at an
//! explicit offset in the partial file, so no byte is ever written by more
//! than one worker. A chunk becomes the durable resume checkpoint only when
//! its `Completed` status has been persisted - the raw file write alone is
//! not trusted across restarts.
//!
//! Per-chunk transient failures are retried with exponential backoff and
//! jitter, scoped to that chunk; other chunks continue unaffected. Sources
//! without range support (detected by a capability probe) fall back to a
//! single full-stream transfer with no mid-transfer resume.
//!
//! Pause and cancellation are cooperative and observed between chunk
//! fetches, never mid network read: an in-flight chunk completes or errors
//! out first, keeping every chunk either fully downloaded or not downloaded.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::app::client::{ByteRange, TransferClient};
use crate::app::events::{progress_event, EventBus};
use crate::app::models::{plan_chunks, ChunkStatus, SessionRecord, SessionStatus};
use crate::app::state::SessionStore;
use crate::constants::chunks as defaults;
use crate::errors::{ChunkError, ChunkResult, TransferError};

/// Configuration for chunked transfers, immutable once a session starts
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Byte-range size for each chunk
    pub chunk_size: u64,
    /// Concurrent range fetches per session
    pub workers_per_session: usize,
    /// Retry attempts per chunk before the session fails
    pub max_chunk_retries: u32,
    /// Base delay for exponential backoff
    pub retry_base_delay: Duration,
    /// Cap on the backoff delay
    pub retry_max_delay: Duration,
    /// Backoff multiplier per attempt
    pub backoff_multiplier: u32,
    /// Jitter factor applied to backoff delays (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: defaults::DEFAULT_CHUNK_SIZE,
            workers_per_session: defaults::DEFAULT_WORKERS_PER_SESSION,
            max_chunk_retries: defaults::MAX_CHUNK_RETRIES,
            retry_base_delay: defaults::RETRY_BASE_DELAY,
            retry_max_delay: defaults::RETRY_MAX_DELAY,
            backoff_multiplier: defaults::BACKOFF_MULTIPLIER,
            jitter_factor: defaults::BACKOFF_JITTER_FACTOR,
        }
    }
}

/// Control signal observed by chunk workers between fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    /// Keep claiming chunks
    Run,
    /// Stop admitting new chunk work; in-flight chunks finish
    Pause,
    /// Stop admitting new chunk work and discard the session
    Cancel,
}

/// Terminal result of one scheduler run
#[derive(Debug)]
pub enum RunOutcome {
    /// Every chunk completed and was durably recorded
    Completed,
    /// Paused at a chunk boundary; resumable
    Paused,
    /// Cancelled; caller removes partial artifacts
    Cancelled,
    /// A chunk exhausted its retry budget or a fatal transfer error occurred
    Failed(ChunkError),
}

/// Sliding window of byte deltas for throughput estimates
///
/// Aggregates deltas across all active chunks of the session so the estimate
/// is not hostage to a single chunk's instantaneous rate.
#[derive(Debug)]
pub struct SpeedWindow {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    max_samples: usize,
}

impl SpeedWindow {
    /// Create a window with the default span
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            window: defaults::SPEED_WINDOW,
            max_samples: defaults::SPEED_WINDOW_SAMPLES,
        }
    }

    /// Record a byte delta at the current instant
    pub fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
        while let Some((t, _)) = self.samples.front() {
            if now.duration_since(*t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current throughput estimate in bytes per second
    pub fn bytes_per_second(&self) -> f64 {
        let (Some((oldest, _)), Some((newest, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let span = newest.duration_since(*oldest).as_secs_f64();
        let total: u64 = self.samples.iter().map(|(_, b)| b).sum();
        if span < f64::EPSILON {
            return 0.0;
        }
        total as f64 / span
    }

    /// Estimated time remaining for the given byte count
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let bps = self.bytes_per_second();
        if bps < 1.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / bps))
    }
}

impl Default for SpeedWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared context for one scheduler run
struct RunCtx {
    config: ChunkConfig,
    client: Arc<dyn TransferClient>,
    store: Arc<SessionStore>,
    events: Arc<EventBus>,
    record: Arc<Mutex<SessionRecord>>,
    url: Url,
    partial_path: std::path::PathBuf,
    single_stream: bool,
    signal: watch::Receiver<RunSignal>,
    window: Mutex<SpeedWindow>,
    fatal: Mutex<Option<ChunkError>>,
}

/// Scheduler for one session's chunked transfer
#[derive(Clone)]
pub struct ChunkScheduler {
    config: ChunkConfig,
    client: Arc<dyn TransferClient>,
    store: Arc<SessionStore>,
    events: Arc<EventBus>,
}

impl std::fmt::Debug for RunCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCtx")
            .field("url", &self.url.as_str())
            .field("single_stream", &self.single_stream)
            .finish()
    }
}

impl ChunkScheduler {
    /// Create a scheduler sharing the engine's client, store, and event bus
    pub fn new(
        config: ChunkConfig,
        client: Arc<dyn TransferClient>,
        store: Arc<SessionStore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            client,
            store,
            events,
        }
    }

    /// Run the transfer for one session until completion, pause, cancel, or
    /// failure
    ///
    /// The shared record is mutated in place: chunk statuses, downloaded
    /// bytes, throughput, and range capability. Session status transitions
    /// remain the session manager's job.
    pub async fn run(
        &self,
        record: Arc<Mutex<SessionRecord>>,
        signal: watch::Receiver<RunSignal>,
    ) -> RunOutcome {
        let (url, total_bytes, partial_path, session_id) = {
            let r = record.lock().await;
            (
                r.session.artifact.source_url.clone(),
                r.session.total_bytes(),
                r.session.destination_path.clone(),
                r.session.id,
            )
        };

        // Capability probe before any scheduling
        let info = match self.client.probe(&url).await {
            Ok(info) => info,
            Err(e) => return RunOutcome::Failed(ChunkError::Transfer(e)),
        };
        if let Some(reported) = info.content_length {
            if reported != total_bytes {
                return RunOutcome::Failed(ChunkError::Transfer(TransferError::SizeMismatch {
                    expected: total_bytes,
                    reported,
                }));
            }
        }

        // Plan or reset the chunk table. Completed chunks are the durable
        // checkpoint and are never touched; anything else restarts from the
        // start of its range.
        {
            let mut r = record.lock().await;
            r.session.range_capable = Some(info.accepts_ranges);

            if !info.accepts_ranges {
                // Single-stream fallback: one chunk covering the artifact,
                // with no resumable progress to preserve
                if r.chunks.len() != 1 || r.chunks[0].is_completed() {
                    r.chunks = plan_chunks(total_bytes, total_bytes.max(1));
                }
                r.chunks[0].downloaded_bytes = 0;
                r.chunks[0].status = ChunkStatus::Pending;
                info!(session_id = %session_id, "source lacks range support, using single-stream mode");
            } else if r.chunks.is_empty() {
                r.chunks = plan_chunks(total_bytes, self.config.chunk_size);
                debug!(
                    session_id = %session_id,
                    chunk_count = r.chunks.len(),
                    "planned chunk partition"
                );
            } else {
                for chunk in &mut r.chunks {
                    if !chunk.is_completed() {
                        chunk.downloaded_bytes = 0;
                        chunk.status = ChunkStatus::Pending;
                    }
                }
            }

            if let Err(e) = self.store.save(&r).await {
                warn!(session_id = %session_id, error = %e, "failed to persist chunk plan");
                return RunOutcome::Failed(ChunkError::Persist { session_id });
            }
        }

        // Preallocate the partial file so positioned writes never race on
        // extension
        if let Err(e) = preallocate(&partial_path, total_bytes).await {
            return RunOutcome::Failed(ChunkError::Io(e));
        }

        let ctx = Arc::new(RunCtx {
            config: self.config.clone(),
            client: Arc::clone(&self.client),
            store: Arc::clone(&self.store),
            events: Arc::clone(&self.events),
            record: Arc::clone(&record),
            url,
            partial_path,
            single_stream: !info.accepts_ranges,
            signal,
            window: Mutex::new(SpeedWindow::new()),
            fatal: Mutex::new(None),
        });

        let worker_count = if ctx.single_stream {
            1
        } else {
            let remaining = {
                let r = record.lock().await;
                r.chunks.iter().filter(|c| !c.is_completed()).count()
            };
            self.config.workers_per_session.min(remaining.max(1))
        };

        let workers: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|worker_id| {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    worker_loop(worker_id, ctx).await;
                })
            })
            .collect();

        for handle in workers {
            // Worker panics must not wedge the session
            if let Err(e) = handle.await {
                warn!(session_id = %session_id, error = %e, "chunk worker panicked");
            }
        }

        // Persist final chunk state before reporting the outcome
        {
            let r = record.lock().await;
            if let Err(e) = self.store.save(&r).await {
                warn!(session_id = %session_id, error = %e, "failed to persist final chunk state");
            }
        }

        if let Some(err) = ctx.fatal.lock().await.take() {
            return RunOutcome::Failed(err);
        }
        let signal = *ctx.signal.borrow();
        match signal {
            RunSignal::Cancel => RunOutcome::Cancelled,
            RunSignal::Pause => RunOutcome::Paused,
            RunSignal::Run => {
                let r = record.lock().await;
                if r.all_chunks_completed() {
                    RunOutcome::Completed
                } else {
                    // Workers exited without a fatal error or a signal; treat
                    // as an inconsistent partial file
                    RunOutcome::Failed(ChunkError::PartialInconsistent {
                        path: r.session.destination_path.clone(),
                    })
                }
            }
        }
    }
}

/// Create the partial file if needed and size it to the artifact length
async fn preallocate(path: &std::path::Path, total_bytes: u64) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    if file.metadata().await?.len() != total_bytes {
        file.set_len(total_bytes).await?;
    }
    Ok(())
}

/// Main loop of one chunk worker: claim, fetch with retries, checkpoint
async fn worker_loop(worker_id: usize, ctx: Arc<RunCtx>) {
    loop {
        // Pause/cancel and sibling failure are observed here, between chunk
        // fetches only
        if *ctx.signal.borrow() != RunSignal::Run {
            debug!(worker_id, "worker observed stop signal");
            return;
        }
        if ctx.fatal.lock().await.is_some() {
            return;
        }

        let claimed = {
            let mut r = ctx.record.lock().await;
            match r.chunks.iter_mut().find(|c| c.status == ChunkStatus::Pending) {
                Some(chunk) => {
                    chunk.status = ChunkStatus::Downloading;
                    Some((chunk.index, chunk.start_byte, chunk.end_byte))
                }
                None => None,
            }
        };
        let Some((index, start_byte, end_byte)) = claimed else {
            return; // No pending work left
        };

        match fetch_chunk_with_retries(&ctx, index, start_byte, end_byte).await {
            Ok(()) => {
                let mut r = ctx.record.lock().await;
                r.chunks[index].status = ChunkStatus::Completed;
                // The persisted write is the resume checkpoint; only after it
                // lands is the chunk durably complete
                if let Err(e) = ctx.store.save(&r).await {
                    warn!(worker_id, chunk = index, error = %e, "chunk checkpoint persist failed");
                    r.chunks[index].status = ChunkStatus::Failed {
                        attempts: 0,
                        error: "checkpoint persist failed".into(),
                    };
                    *ctx.fatal.lock().await = Some(ChunkError::Persist {
                        session_id: r.session.id,
                    });
                    return;
                }
                debug!(worker_id, chunk = index, "chunk completed");
            }
            Err(e) => {
                let error_text = e.to_string();
                {
                    let mut r = ctx.record.lock().await;
                    r.chunks[index].status = ChunkStatus::Failed {
                        attempts: ctx.config.max_chunk_retries,
                        error: error_text.clone(),
                    };
                    r.chunks[index].downloaded_bytes = 0;
                }
                warn!(worker_id, chunk = index, error = %error_text, "chunk failed permanently");
                let mut fatal = ctx.fatal.lock().await;
                if fatal.is_none() {
                    *fatal = Some(e);
                }
                return;
            }
        }
    }
}

/// Fetch one chunk, retrying transient failures with backoff and jitter
async fn fetch_chunk_with_retries(
    ctx: &Arc<RunCtx>,
    index: usize,
    start_byte: u64,
    end_byte: u64,
) -> ChunkResult<()> {
    let max_attempts = ctx.config.max_chunk_retries;
    let mut last_error: Option<ChunkError> = None;

    for attempt in 1..=max_attempts {
        match fetch_chunk_attempt(ctx, index, start_byte, end_byte).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    chunk = index,
                    attempt,
                    max_attempts,
                    error = %e,
                    "chunk fetch attempt failed"
                );
                last_error = Some(e);
                if attempt < max_attempts {
                    tokio::time::sleep(backoff_delay(&ctx.config, attempt)).await;
                }
            }
        }
    }

    Err(ChunkError::RetriesExhausted {
        index,
        attempts: max_attempts,
        last_error: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".into()),
    })
}

/// One fetch attempt: stream the range into the partial file at its offset
async fn fetch_chunk_attempt(
    ctx: &Arc<RunCtx>,
    index: usize,
    start_byte: u64,
    end_byte: u64,
) -> ChunkResult<()> {
    let expected_len = end_byte - start_byte;

    // A failed attempt restarts this chunk from its start; byte accounting
    // must not carry stale progress
    {
        let mut r = ctx.record.lock().await;
        r.chunks[index].downloaded_bytes = 0;
    }

    let range = if ctx.single_stream {
        None
    } else {
        Some(ByteRange {
            start: start_byte,
            end: end_byte - 1,
        })
    };

    let mut stream = ctx.client.fetch(&ctx.url, range).await?;

    let mut file = OpenOptions::new()
        .write(true)
        .open(&ctx.partial_path)
        .await?;
    file.seek(SeekFrom::Start(start_byte)).await?;

    let mut written: u64 = 0;
    while let Some(frame) = stream.next().await {
        let bytes = frame?;
        written += bytes.len() as u64;
        if written > expected_len {
            // Server is sending more than the requested range
            return Err(ChunkError::Transfer(TransferError::RangeNotHonored));
        }
        file.write_all(&bytes).await?;

        // Update shared accounting and emit throttled progress
        let (session_id, downloaded, total, bps) = {
            let mut r = ctx.record.lock().await;
            r.chunks[index].downloaded_bytes = written;
            let mut window = ctx.window.lock().await;
            window.record(bytes.len() as u64);
            let bps = window.bytes_per_second();
            r.session.bytes_per_second = bps;
            (
                r.session.id,
                r.downloaded_bytes(),
                r.session.total_bytes(),
                bps,
            )
        };
        ctx.events.emit_throttled(progress_event(
            session_id,
            SessionStatus::Downloading,
            downloaded,
            total,
            bps,
            None,
        ));
    }
    file.flush().await?;

    if written != expected_len {
        return Err(ChunkError::Transfer(TransferError::SizeMismatch {
            expected: expected_len,
            reported: written,
        }));
    }
    Ok(())
}

/// Exponential backoff with jitter, capped
fn backoff_delay(config: &ChunkConfig, attempt: u32) -> Duration {
    let base = config.retry_base_delay.as_millis() as u64;
    let factor = u64::from(config.backoff_multiplier).saturating_pow(attempt.saturating_sub(1));
    let capped = base
        .saturating_mul(factor)
        .min(config.retry_max_delay.as_millis() as u64);

    // ± jitter_factor to avoid a thundering herd of synchronized retries
    let jitter_range = ((capped as f64) * config.jitter_factor) as u64;
    let jitter = if jitter_range > 0 {
        fastrand::u64(0..=jitter_range * 2).saturating_sub(jitter_range)
    } else {
        0
    };
    Duration::from_millis(capped.saturating_add(jitter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::client::{ByteStream, SourceInfo};
    use crate::app::hash::Sha256Hash;
    use crate::app::models::{ArtifactRef, DownloadRequest, DownloadSession};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    /// In-memory transfer source with scriptable failures
    struct FakeSource {
        content: Vec<u8>,
        accepts_ranges: bool,
        /// Ranges requested, for resume assertions
        requests: StdMutex<Vec<Option<(u64, u64)>>>,
        /// Fail this many fetches before succeeding
        failures_remaining: AtomicU32,
    }

    impl FakeSource {
        fn new(content: Vec<u8>) -> Self {
            Self {
                content,
                accepts_ranges: true,
                requests: StdMutex::new(Vec::new()),
                failures_remaining: AtomicU32::new(0),
            }
        }

        fn no_ranges(mut self) -> Self {
            self.accepts_ranges = false;
            self
        }

        fn failing(self, count: u32) -> Self {
            self.failures_remaining.store(count, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl TransferClient for FakeSource {
        async fn probe(&self, _url: &Url) -> crate::errors::TransferResult<SourceInfo> {
            Ok(SourceInfo {
                accepts_ranges: self.accepts_ranges,
                content_length: Some(self.content.len() as u64),
            })
        }

        async fn fetch(
            &self,
            _url: &Url,
            range: Option<ByteRange>,
        ) -> crate::errors::TransferResult<ByteStream> {
            self.requests
                .lock()
                .unwrap()
                .push(range.map(|r| (r.start, r.end)));

            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(TransferError::ServerError { status: 503 });
            }

            let slice = match range {
                Some(r) => self.content[r.start as usize..=(r.end as usize)].to_vec(),
                None => self.content.clone(),
            };
            let frames: Vec<crate::errors::TransferResult<Bytes>> = slice
                .chunks(7 * 1024)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Ok(Box::pin(futures::stream::iter(frames)))
        }
    }

    fn test_config() -> ChunkConfig {
        ChunkConfig {
            chunk_size: 16 * 1024,
            workers_per_session: 3,
            max_chunk_retries: 3,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(4),
            backoff_multiplier: 2,
            jitter_factor: 0.0,
        }
    }

    async fn setup(
        content: Vec<u8>,
        source: FakeSource,
        config: ChunkConfig,
    ) -> (
        tempfile::TempDir,
        ChunkScheduler,
        Arc<Mutex<SessionRecord>>,
        watch::Sender<RunSignal>,
        watch::Receiver<RunSignal>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open(dir.path()).await.unwrap());
        let events = Arc::new(EventBus::default());

        let artifact = ArtifactRef {
            model_id: "m".into(),
            variant_id: "q".into(),
            source_url: Url::parse("https://example.com/m.gguf").unwrap(),
            total_bytes: content.len() as u64,
            expected_hash: Sha256Hash::digest(&content),
        };
        let request = DownloadRequest::new(artifact, "u");
        let session = DownloadSession::new(&request, dir.path().join("m.part"));
        let record = Arc::new(Mutex::new(SessionRecord {
            session,
            chunks: Vec::new(),
        }));

        let scheduler = ChunkScheduler::new(config, Arc::new(source), store, events);
        let (tx, rx) = watch::channel(RunSignal::Run);
        (dir, scheduler, record, tx, rx)
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_full_transfer_writes_exact_content() {
        let content = patterned(100 * 1024 + 13);
        let source = FakeSource::new(content.clone());
        let (dir, scheduler, record, _tx, rx) = setup(content.clone(), source, test_config()).await;

        let outcome = scheduler.run(Arc::clone(&record), rx).await;
        assert!(matches!(outcome, RunOutcome::Completed), "{outcome:?}");

        let written = std::fs::read(dir.path().join("m.part")).unwrap();
        assert_eq!(written, content);

        let r = record.lock().await;
        assert!(r.all_chunks_completed());
        assert_eq!(r.downloaded_bytes(), content.len() as u64);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let content = patterned(40 * 1024);
        let source = FakeSource::new(content.clone()).failing(2);
        let (dir, scheduler, record, _tx, rx) = setup(content.clone(), source, test_config()).await;

        let outcome = scheduler.run(record, rx).await;
        assert!(matches!(outcome, RunOutcome::Completed), "{outcome:?}");
        assert_eq!(std::fs::read(dir.path().join("m.part")).unwrap(), content);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_fails_session() {
        let content = patterned(32 * 1024);
        // Enough failures to exhaust one chunk's budget no matter which
        // worker draws them
        let source = FakeSource::new(content.clone()).failing(100);
        let (_dir, scheduler, record, _tx, rx) = setup(content, source, test_config()).await;

        let outcome = scheduler.run(record, rx).await;
        match outcome {
            RunOutcome::Failed(ChunkError::RetriesExhausted { attempts, .. }) => {
                assert_eq!(attempts, 3);
            }
            other => panic!("expected retries exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resume_skips_completed_chunks() {
        let content = patterned(64 * 1024);
        let config = test_config();

        // First run: complete everything
        let source = FakeSource::new(content.clone());
        let (dir, scheduler, record, _tx, rx) = setup(content.clone(), source, config.clone()).await;
        let outcome = scheduler.run(Arc::clone(&record), rx).await;
        assert!(matches!(outcome, RunOutcome::Completed));

        // Mark the last chunk incomplete to simulate an interrupted session,
        // then rerun against a source that records requests
        {
            let mut r = record.lock().await;
            let last = r.chunks.len() - 1;
            r.chunks[last].status = ChunkStatus::Pending;
            r.chunks[last].downloaded_bytes = 0;
        }
        let source2 = Arc::new(FakeSource::new(content.clone()));
        let store = Arc::new(SessionStore::open(dir.path()).await.unwrap());
        let scheduler2 = ChunkScheduler::new(
            config,
            Arc::clone(&source2) as Arc<dyn TransferClient>,
            store,
            Arc::new(EventBus::default()),
        );
        let (_tx2, rx2) = watch::channel(RunSignal::Run);
        let outcome = scheduler2.run(Arc::clone(&record), rx2).await;
        assert!(matches!(outcome, RunOutcome::Completed));

        // Only the incomplete chunk's range was requested again
        let requests = source2.requests.lock().unwrap();
        let completed_boundary = 48 * 1024u64;
        for range in requests.iter().flatten() {
            assert!(
                range.0 >= completed_boundary,
                "re-fetched already-completed range starting at {}",
                range.0
            );
        }
    }

    #[tokio::test]
    async fn test_single_stream_fallback() {
        let content = patterned(48 * 1024);
        let source = FakeSource::new(content.clone()).no_ranges();
        let (dir, scheduler, record, _tx, rx) = setup(content.clone(), source, test_config()).await;

        let outcome = scheduler.run(Arc::clone(&record), rx).await;
        assert!(matches!(outcome, RunOutcome::Completed), "{outcome:?}");
        assert_eq!(std::fs::read(dir.path().join("m.part")).unwrap(), content);

        let r = record.lock().await;
        assert_eq!(r.session.range_capable, Some(false));
        assert_eq!(r.chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_before_remaining_chunks() {
        let content = patterned(64 * 1024);
        let source = FakeSource::new(content.clone());
        let (_dir, scheduler, record, tx, rx) = setup(content, source, test_config()).await;

        tx.send(RunSignal::Cancel).unwrap();
        let outcome = scheduler.run(Arc::clone(&record), rx).await;
        assert!(matches!(outcome, RunOutcome::Cancelled), "{outcome:?}");

        let r = record.lock().await;
        assert!(!r.all_chunks_completed());
    }

    #[tokio::test]
    async fn test_pause_preserves_completed_chunks() {
        let content = patterned(64 * 1024);
        let source = FakeSource::new(content.clone());
        let (_dir, scheduler, record, tx, rx) = setup(content, source, test_config()).await;

        tx.send(RunSignal::Pause).unwrap();
        let outcome = scheduler.run(Arc::clone(&record), rx).await;
        assert!(matches!(outcome, RunOutcome::Paused), "{outcome:?}");
    }

    #[tokio::test]
    async fn test_size_mismatch_rejected_at_probe() {
        let content = patterned(10 * 1024);
        let mut source = FakeSource::new(content);
        source.content.truncate(5 * 1024); // Source now reports a different length
        let (_dir, scheduler, record, _tx, rx) = setup(patterned(10 * 1024), source, test_config()).await;

        let outcome = scheduler.run(record, rx).await;
        assert!(matches!(
            outcome,
            RunOutcome::Failed(ChunkError::Transfer(TransferError::SizeMismatch { .. }))
        ));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = ChunkConfig {
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_millis(350),
            backoff_multiplier: 2,
            jitter_factor: 0.0,
            ..ChunkConfig::default()
        };
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(350)); // capped
    }

    #[test]
    fn test_speed_window_aggregates() {
        let mut window = SpeedWindow::new();
        window.record(1000);
        window.record(1000);
        // Two samples nearly simultaneous: rate is finite and non-negative
        assert!(window.bytes_per_second() >= 0.0);
        assert!(window.eta(0).is_none() || window.eta(0).unwrap() == Duration::ZERO);
    }
}
