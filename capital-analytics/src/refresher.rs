//! Periodic top-N ranking refresher.
//!
//! A pass walks the whole key population page by page, reads each page's
//! values through the cache with one batched lookup, and folds them into a
//! bounded [`TopN`]. The finished ranking is published in one swap.
//!
//! Passes never overlap. [`RankingRefresher::try_refresh`] coalesces: if a
//! pass is running, or the configured interval has not elapsed since the
//! last one ended, the request is dropped rather than queued.

use capital_core::{ConfigError, RefreshConfig, StoreError, StoreResult};
use capital_storage::{CacheEngine, CachePolicy, KeySource};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::snapshot::{RankingPublisher, RankingSnapshot};
use crate::topn::TopN;

/// Shortest tick of the background task, used when the configured interval
/// is zero.
const MIN_TICK: Duration = Duration::from_secs(1);

// ============================================================================
// PHASE
// ============================================================================

/// What the refresher is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    /// Reading a page of keys and their values.
    Scanning,
    /// Folding a page into the running ranking.
    Aggregating,
    /// Swapping the finished ranking in.
    Publishing,
}

impl RefreshPhase {
    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Scanning => 1,
            Self::Aggregating => 2,
            Self::Publishing => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Scanning,
            2 => Self::Aggregating,
            3 => Self::Publishing,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for RefreshPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Aggregating => "aggregating",
            Self::Publishing => "publishing",
        };
        f.write_str(s)
    }
}

/// Resets the phase to idle when a pass ends or is dropped mid-way.
struct PhaseReset<'a>(&'a AtomicU8);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        self.0.store(RefreshPhase::Idle.as_u8(), Ordering::Release);
    }
}

// ============================================================================
// CURSOR AND REPORT
// ============================================================================

/// Position of a pass in the key population. Reset at the start of each pass.
#[derive(Debug, Clone)]
pub struct RefreshCursor<C> {
    pub position: Option<C>,
    pub batch_size: usize,
    pub pass_started_at: Instant,
    pub chunks: usize,
}

impl<C> RefreshCursor<C> {
    fn start(batch_size: usize) -> Self {
        Self {
            position: None,
            batch_size,
            pass_started_at: Instant::now(),
            chunks: 0,
        }
    }
}

/// Outcome of one completed pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    /// Non-empty pages read.
    pub chunks: usize,
    /// Pages whose values could not be read and were skipped.
    pub failed_chunks: usize,
    pub keys_scanned: usize,
    /// Entries in the resulting ranking.
    pub entries: usize,
    /// Whether the ranking was swapped in. False when every chunk failed.
    pub published: bool,
    pub duration: Duration,
}

// ============================================================================
// METRICS
// ============================================================================

/// Cumulative refresher counters.
#[derive(Debug, Default)]
pub struct RefreshMetrics {
    pub passes_completed: AtomicU64,
    pub passes_published: AtomicU64,
    /// Passes cut short by a key listing failure.
    pub passes_aborted: AtomicU64,
    /// `try_refresh` calls that did not start a pass.
    pub passes_coalesced: AtomicU64,
    pub chunks_scanned: AtomicU64,
    pub chunk_failures: AtomicU64,
}

impl RefreshMetrics {
    pub fn snapshot(&self) -> RefreshMetricsSnapshot {
        RefreshMetricsSnapshot {
            passes_completed: self.passes_completed.load(Ordering::Relaxed),
            passes_published: self.passes_published.load(Ordering::Relaxed),
            passes_aborted: self.passes_aborted.load(Ordering::Relaxed),
            passes_coalesced: self.passes_coalesced.load(Ordering::Relaxed),
            chunks_scanned: self.chunks_scanned.load(Ordering::Relaxed),
            chunk_failures: self.chunk_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshMetricsSnapshot {
    pub passes_completed: u64,
    pub passes_published: u64,
    pub passes_aborted: u64,
    pub passes_coalesced: u64,
    pub chunks_scanned: u64,
    pub chunk_failures: u64,
}

// ============================================================================
// REFRESHER
// ============================================================================

#[derive(Debug, Default)]
struct PassState {
    last_finished: Option<Instant>,
}

/// Maintains one ranking over the values of a cache.
pub struct RankingRefresher<P, S>
where
    P: CachePolicy,
    S: KeySource<Key = P::Key>,
{
    name: String,
    cache: CacheEngine<P>,
    source: S,
    config: RefreshConfig,
    publisher: RankingPublisher<P::Key, P::Value>,
    phase: AtomicU8,
    pass: Mutex<PassState>,
    wake: Notify,
    metrics: RefreshMetrics,
}

impl<P, S> RankingRefresher<P, S>
where
    P: CachePolicy,
    P::Value: Ord,
    S: KeySource<Key = P::Key>,
{
    /// Create a refresher publishing into a fresh publisher.
    pub fn new(
        name: impl Into<String>,
        cache: CacheEngine<P>,
        source: S,
        config: RefreshConfig,
    ) -> Result<Self, ConfigError> {
        Self::with_publisher(name, cache, source, config, RankingPublisher::new())
    }

    /// Create a refresher publishing into `publisher`.
    pub fn with_publisher(
        name: impl Into<String>,
        cache: CacheEngine<P>,
        source: S,
        config: RefreshConfig,
        publisher: RankingPublisher<P::Key, P::Value>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            cache,
            source,
            config,
            publisher,
            phase: AtomicU8::new(RefreshPhase::Idle.as_u8()),
            pass: Mutex::new(PassState::default()),
            wake: Notify::new(),
            metrics: RefreshMetrics::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheEngine<P> {
        &self.cache
    }

    pub fn publisher(&self) -> &RankingPublisher<P::Key, P::Value> {
        &self.publisher
    }

    pub fn metrics(&self) -> &RefreshMetrics {
        &self.metrics
    }

    /// The latest published ranking.
    pub fn current(&self) -> Arc<RankingSnapshot<P::Key, P::Value>> {
        self.publisher.current()
    }

    pub fn phase(&self) -> RefreshPhase {
        RefreshPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: RefreshPhase) {
        self.phase.store(phase.as_u8(), Ordering::Release);
    }

    /// Ask the background task to attempt a pass now.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Run a pass unless one is running or the interval has not elapsed.
    ///
    /// Returns `None` when the request was coalesced.
    pub async fn try_refresh(&self) -> Option<StoreResult<PassReport>> {
        let Ok(mut state) = self.pass.try_lock() else {
            self.metrics.passes_coalesced.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(query = %self.name, "Ranking pass already running");
            return None;
        };

        if let Some(last) = state.last_finished {
            if last.elapsed() < self.config.interval {
                self.metrics.passes_coalesced.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        Some(self.pass_locked(&mut state).await)
    }

    /// Run a pass now, waiting for a running one to finish first.
    ///
    /// Ignores the interval.
    pub async fn run_pass(&self) -> StoreResult<PassReport> {
        let mut state = self.pass.lock().await;
        self.pass_locked(&mut state).await
    }

    /// When the next interval-driven pass is due, once a pass has finished.
    ///
    /// `None` while a pass is running.
    fn next_due(&self) -> Option<Instant> {
        let state = self.pass.try_lock().ok()?;
        state
            .last_finished?
            .checked_add(self.config.interval.max(MIN_TICK))
    }

    async fn pass_locked(&self, state: &mut PassState) -> StoreResult<PassReport> {
        let result = self.scan().await;
        state.last_finished = Some(Instant::now());
        result
    }

    /// Walk every page once and publish the result.
    ///
    /// Only value reads are skipped chunk by chunk. A failed key listing ends
    /// the pass with an error, discarding the chunks read so far, because the
    /// keyset cursor cannot move past a page it never received.
    async fn scan(&self) -> StoreResult<PassReport> {
        let _reset = PhaseReset(&self.phase);
        let mut cursor: RefreshCursor<S::Cursor> = RefreshCursor::start(self.config.batch_size);
        let mut top = TopN::new(self.config.list_length);
        let mut failed_chunks = 0usize;
        let mut keys_scanned = 0usize;

        loop {
            self.set_phase(RefreshPhase::Scanning);
            let page = match self
                .source
                .next_page(cursor.position.clone(), cursor.batch_size)
                .await
            {
                Ok(page) => page,
                Err(err) => return Err(self.abort(&cursor, err)),
            };

            if page.keys.is_empty() {
                break;
            }
            cursor.chunks += 1;
            keys_scanned += page.keys.len();
            self.metrics.chunks_scanned.fetch_add(1, Ordering::Relaxed);

            match self.cache.get_many(page.keys).await {
                Ok(values) => {
                    self.set_phase(RefreshPhase::Aggregating);
                    for (key, value) in values {
                        let id = self.cache.project_key(&key);
                        top.offer(key, id, value);
                    }
                }
                Err(err) => {
                    failed_chunks += 1;
                    self.metrics.chunk_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        query = %self.name,
                        chunk = cursor.chunks,
                        cursor = ?cursor.position,
                        error = %err,
                        "Skipping ranking chunk"
                    );
                }
            }

            match page.next {
                Some(next) => cursor.position = Some(next),
                None => break,
            }
        }

        let published = cursor.chunks == 0 || failed_chunks < cursor.chunks;
        let entries = top.len();
        if published {
            self.set_phase(RefreshPhase::Publishing);
            self.publisher.publish(top.into_snapshot());
            self.metrics.passes_published.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::warn!(
                query = %self.name,
                chunks = cursor.chunks,
                "Every ranking chunk failed, keeping previous ranking"
            );
        }
        self.metrics.passes_completed.fetch_add(1, Ordering::Relaxed);

        let report = PassReport {
            chunks: cursor.chunks,
            failed_chunks,
            keys_scanned,
            entries,
            published,
            duration: cursor.pass_started_at.elapsed(),
        };
        tracing::info!(
            query = %self.name,
            chunks = report.chunks,
            failed_chunks = report.failed_chunks,
            keys_scanned = report.keys_scanned,
            entries = report.entries,
            published = report.published,
            duration_ms = report.duration.as_millis() as u64,
            "Ranking pass completed"
        );
        Ok(report)
    }

    fn abort(&self, cursor: &RefreshCursor<S::Cursor>, err: StoreError) -> StoreError {
        self.metrics.passes_aborted.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            query = %self.name,
            chunks = cursor.chunks,
            cursor = ?cursor.position,
            error = %err,
            "Key listing failed, ranking pass aborted"
        );
        err
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Background task that keeps one ranking fresh until shutdown.
///
/// Attempts a pass immediately, then one interval after each pass ends, and
/// whenever [`RankingRefresher::trigger`] is called. Attempts go through
/// [`RankingRefresher::try_refresh`], so they coalesce.
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let refresher = Arc::new(RankingRefresher::new("richest", cache, source, config)?);
///
/// let handle = tokio::spawn(refresh_task(Arc::clone(&refresher), shutdown_rx));
///
/// // Later, trigger shutdown
/// let _ = shutdown_tx.send(true);
/// handle.await?;
/// ```
pub async fn refresh_task<P, S>(
    refresher: Arc<RankingRefresher<P, S>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> RefreshMetricsSnapshot
where
    P: CachePolicy,
    P::Value: Ord,
    S: KeySource<Key = P::Key>,
{
    let mut ticker = interval(refresher.config.interval.max(MIN_TICK));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        query = %refresher.name,
        interval_secs = refresher.config.interval.as_secs(),
        batch_size = refresher.config.batch_size,
        list_length = refresher.config.list_length,
        "Ranking refresh task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!(query = %refresher.name, "Ranking refresh task shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                refresher.try_refresh().await;
            }

            _ = refresher.wake.notified() => {
                refresher.try_refresh().await;
            }
        }

        // The throttle counts from the end of a pass, so align the ticker to it
        if let Some(due) = refresher.next_due() {
            ticker.reset_at(due);
        }
    }

    let snapshot = refresher.metrics.snapshot();
    tracing::info!(
        query = %refresher.name,
        passes_completed = snapshot.passes_completed,
        passes_published = snapshot.passes_published,
        passes_aborted = snapshot.passes_aborted,
        chunk_failures = snapshot.chunk_failures,
        "Ranking refresh task completed"
    );
    snapshot
}
