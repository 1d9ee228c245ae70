//! Coalescing, batching cache engine.
//!
//! The engine keeps two tables behind one mutex: cached entries and fetches
//! in flight, both keyed by the policy's canonical key string. A lookup
//! checks both tables and, on a miss, registers its pending fetch inside the
//! same critical section, so there is never more than one store round trip
//! per key in flight. Every later caller for that key subscribes to the
//! pending fetch's broadcast channel and receives the same result.
//!
//! Store round trips run on spawned tasks. A caller that stops awaiting does
//! not cancel the fetch; the result still lands in the cache.
//!
//! # Write ordering
//!
//! Each entry carries a generation that grows on every write. A pending fetch
//! remembers the generation it started from, and its completion never
//! overwrites an entry that a forced [`CacheEngine::refresh`] advanced in the
//! meantime. Waiters of such a fetch receive the refreshed value. An
//! [`CacheEngine::evict`] that lands while a fetch is in flight marks it
//! superseded: waiters still get the fetched value but no entry is written.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use capital_core::{CacheConfig, StoreError, StoreResult};
use futures_util::future::join_all;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::policy::CachePolicy;
use super::stats::{CacheCounters, CacheStats};

type FetchOutcome<V> = StoreResult<Option<V>>;

struct CacheEntry<K, V> {
    key: K,
    value: V,
    generation: u64,
    cached_at: Instant,
}

struct PendingFetch<V> {
    sender: broadcast::Sender<FetchOutcome<V>>,
    generation_at_start: u64,
    superseded: bool,
}

struct EngineState<K, V> {
    entries: HashMap<String, CacheEntry<K, V>>,
    pending: HashMap<String, PendingFetch<V>>,
}

impl<K, V: Clone> EngineState<K, V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    fn is_expired(entry: &CacheEntry<K, V>, ttl: Option<Duration>, now: Instant) -> bool {
        ttl.is_some_and(|ttl| now.saturating_duration_since(entry.cached_at) >= ttl)
    }

    fn take_expired(
        &mut self,
        id: &str,
        ttl: Option<Duration>,
        now: Instant,
    ) -> Option<CacheEntry<K, V>> {
        let expired = self
            .entries
            .get(id)
            .is_some_and(|entry| Self::is_expired(entry, ttl, now));
        if expired {
            self.entries.remove(id)
        } else {
            None
        }
    }

    fn register(&mut self, id: String) -> broadcast::Receiver<FetchOutcome<V>> {
        let (sender, receiver) = broadcast::channel(1);
        let generation_at_start = self.entries.get(&id).map_or(0, |entry| entry.generation);
        self.pending.insert(
            id,
            PendingFetch {
                sender,
                generation_at_start,
                superseded: false,
            },
        );
        receiver
    }

    /// Apply a finished fetch and decide what its waiters receive.
    fn resolve(
        &mut self,
        id: String,
        key: K,
        pending: &PendingFetch<V>,
        outcome: FetchOutcome<V>,
    ) -> FetchOutcome<V> {
        if let Some(entry) = self.entries.get(&id) {
            if entry.generation > pending.generation_at_start {
                return Ok(Some(entry.value.clone()));
            }
        }

        match outcome {
            Ok(Some(value)) if !pending.superseded => {
                let generation = self
                    .entries
                    .get(&id)
                    .map_or(1, |entry| entry.generation + 1);
                self.entries.insert(
                    id,
                    CacheEntry {
                        key,
                        value: value.clone(),
                        generation,
                        cached_at: Instant::now(),
                    },
                );
                Ok(Some(value))
            }
            other => other,
        }
    }
}

enum Slot<V> {
    Hit(V),
    Wait(broadcast::Receiver<FetchOutcome<V>>),
    Fetch(broadcast::Receiver<FetchOutcome<V>>),
}

struct Inner<P: CachePolicy> {
    policy: P,
    config: CacheConfig,
    state: Mutex<EngineState<P::Key, P::Value>>,
    counters: CacheCounters,
}

impl<P: CachePolicy> Inner<P> {
    fn lock(&self) -> MutexGuard<'_, EngineState<P::Key, P::Value>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look `id` up in both tables, registering a pending fetch on a miss.
    fn claim(
        &self,
        state: &mut EngineState<P::Key, P::Value>,
        id: &str,
        now: Instant,
        expired: &mut Vec<CacheEntry<P::Key, P::Value>>,
    ) -> Slot<P::Value> {
        if let Some(entry) = state.take_expired(id, self.config.entry_ttl, now) {
            CacheCounters::bump(&self.counters.expirations);
            expired.push(entry);
        }

        if let Some(entry) = state.entries.get(id) {
            CacheCounters::bump(&self.counters.hits);
            return Slot::Hit(entry.value.clone());
        }

        if let Some(pending) = state.pending.get(id) {
            CacheCounters::bump(&self.counters.coalesced);
            debug!(key = %id, "joining fetch in flight");
            return Slot::Wait(pending.sender.subscribe());
        }

        CacheCounters::bump(&self.counters.misses);
        Slot::Fetch(state.register(id.to_string()))
    }

    fn complete(&self, outcomes: Vec<(String, P::Key, FetchOutcome<P::Value>)>) {
        let mut deliveries = Vec::with_capacity(outcomes.len());
        {
            let mut state = self.lock();
            for (id, key, outcome) in outcomes {
                let Some(pending) = state.pending.remove(&id) else {
                    continue;
                };
                let resolved = state.resolve(id, key, &pending, outcome);
                deliveries.push((pending.sender, resolved));
            }
        }
        for (sender, outcome) in deliveries {
            // No receivers left is fine: every caller stopped waiting.
            let _ = sender.send(outcome);
        }
    }
}

/// Drops the pending fetches of a task that never completed, closing their
/// channels so waiters see [`StoreError::FetchAborted`] instead of hanging.
struct PendingGuard<P: CachePolicy> {
    inner: Arc<Inner<P>>,
    ids: Vec<String>,
    armed: bool,
}

impl<P: CachePolicy> PendingGuard<P> {
    fn new(inner: Arc<Inner<P>>, ids: Vec<String>) -> Self {
        Self {
            inner,
            ids,
            armed: true,
        }
    }

    fn complete(mut self, outcomes: Vec<(String, P::Key, FetchOutcome<P::Value>)>) {
        self.armed = false;
        self.inner.complete(outcomes);
    }
}

impl<P: CachePolicy> Drop for PendingGuard<P> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.lock();
        for id in &self.ids {
            state.pending.remove(id);
        }
        warn!(keys = self.ids.len(), "fetch task dropped before completion");
    }
}

async fn wait_for<V: Clone>(
    id: &str,
    mut receiver: broadcast::Receiver<FetchOutcome<V>>,
) -> FetchOutcome<V> {
    receiver.recv().await.unwrap_or_else(|_| {
        Err(StoreError::FetchAborted {
            key: id.to_string(),
        })
    })
}

/// Generic key/value cache in front of a backing store.
///
/// Cloning is cheap and every clone shares the same tables, so one instance
/// per cached quantity can be handed to every collaborator that needs it.
/// Lookups spawn their store round trips and must run inside a Tokio runtime.
pub struct CacheEngine<P: CachePolicy> {
    inner: Arc<Inner<P>>,
}

impl<P: CachePolicy> Clone for CacheEngine<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: CachePolicy> CacheEngine<P> {
    /// Create a new engine over `policy`.
    ///
    /// A zero TTL would expire every entry on its next access and is treated
    /// as no TTL, as [`CacheConfig::from_env`] does.
    pub fn new(policy: P, mut config: CacheConfig) -> Self {
        if config.entry_ttl.is_some_and(|ttl| ttl.is_zero()) {
            warn!("zero cache ttl disables expiry");
            config.entry_ttl = None;
        }
        Self {
            inner: Arc::new(Inner {
                policy,
                config,
                state: Mutex::new(EngineState::new()),
                counters: CacheCounters::default(),
            }),
        }
    }

    /// Create a new engine with default configuration (no TTL).
    pub fn with_defaults(policy: P) -> Self {
        Self::new(policy, CacheConfig::default())
    }

    pub fn policy(&self) -> &P {
        &self.inner.policy
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Canonical string identity of `key` under this engine's policy.
    pub fn project_key(&self, key: &P::Key) -> String {
        self.inner.policy.project_key(key)
    }

    /// Get the value for `key`, fetching it from the store on a miss.
    ///
    /// A fresh entry is returned without suspending. Otherwise the call joins
    /// the fetch already in flight for this key, or starts one. `Ok(None)`
    /// means the store does not know the key; absence is not cached.
    pub async fn get(&self, key: &P::Key) -> StoreResult<Option<P::Value>> {
        let id = self.inner.policy.project_key(key);
        let mut expired = Vec::new();
        let slot = {
            let mut state = self.inner.lock();
            self.inner.claim(&mut state, &id, Instant::now(), &mut expired)
        };

        let receiver = match slot {
            Slot::Hit(value) => return Ok(Some(value)),
            Slot::Wait(receiver) => receiver,
            Slot::Fetch(receiver) => {
                self.spawn_fetch_one(id.clone(), key.clone());
                receiver
            }
        };

        self.notify_expired(expired).await;
        wait_for(&id, receiver).await
    }

    /// Get the values for several keys with at most one batched store call.
    ///
    /// Keys are deduplicated by projection and split into cached, in flight
    /// and missing. Only the missing ones go to
    /// [`CachePolicy::fetch_many`]; keys the store does not know are omitted
    /// from the result. If any awaited key failed, the first error is
    /// returned.
    pub async fn get_many<I>(&self, keys: I) -> StoreResult<HashMap<P::Key, P::Value>>
    where
        I: IntoIterator<Item = P::Key>,
    {
        let mut results = HashMap::new();
        let mut waiting = Vec::new();
        let mut missing = Vec::new();
        let mut expired = Vec::new();
        let mut seen = HashSet::new();

        {
            let mut state = self.inner.lock();
            let now = Instant::now();
            for key in keys {
                let id = self.inner.policy.project_key(&key);
                if !seen.insert(id.clone()) {
                    continue;
                }
                match self.inner.claim(&mut state, &id, now, &mut expired) {
                    Slot::Hit(value) => {
                        results.insert(key, value);
                    }
                    Slot::Wait(receiver) => waiting.push((key, id, receiver)),
                    Slot::Fetch(receiver) => {
                        missing.push((id.clone(), key.clone()));
                        waiting.push((key, id, receiver));
                    }
                }
            }
        }

        if !missing.is_empty() {
            self.spawn_fetch_many(missing);
        }
        self.notify_expired(expired).await;

        let outcomes = join_all(waiting.into_iter().map(|(key, id, receiver)| async move {
            let outcome = wait_for(&id, receiver).await;
            (key, outcome)
        }))
        .await;

        let mut first_error = None;
        for (key, outcome) in outcomes {
            match outcome {
                Ok(Some(value)) => {
                    results.insert(key, value);
                }
                Ok(None) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    /// Force the entry for `key` to `new_value`, bumping its generation.
    ///
    /// The policy's refresh hook runs afterwards; its failure is logged and
    /// does not undo the write.
    pub async fn refresh(&self, key: &P::Key, new_value: P::Value) {
        let id = self.inner.policy.project_key(key);
        let old = {
            let mut state = self.inner.lock();
            let (generation, old) = match state.entries.remove(&id) {
                Some(entry) => (entry.generation + 1, Some(entry.value)),
                None => (1, None),
            };
            state.entries.insert(
                id.clone(),
                CacheEntry {
                    key: key.clone(),
                    value: new_value.clone(),
                    generation,
                    cached_at: Instant::now(),
                },
            );
            old
        };
        CacheCounters::bump(&self.inner.counters.refreshes);

        if let Err(err) = self
            .inner
            .policy
            .on_refresh(key, old.as_ref(), &new_value)
            .await
        {
            warn!(key = %id, error = %err, "refresh hook failed");
        }
    }

    /// Remove the entry for `key`, if any, and run the eviction hook once.
    ///
    /// Returns whether an entry was removed. Evicting an absent key is a
    /// no-op.
    pub async fn evict(&self, key: &P::Key) -> bool {
        let id = self.inner.policy.project_key(key);
        let removed = {
            let mut state = self.inner.lock();
            if let Some(pending) = state.pending.get_mut(&id) {
                pending.superseded = true;
            }
            state.entries.remove(&id)
        };

        match removed {
            Some(entry) => {
                CacheCounters::bump(&self.inner.counters.evictions);
                self.run_evict_hook(&entry.key, &entry.value).await;
                true
            }
            None => false,
        }
    }

    /// Evict every entry, running the eviction hook for each.
    ///
    /// Fetches in flight complete for their waiters but are not cached.
    pub async fn clear(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.inner.lock();
            for pending in state.pending.values_mut() {
                pending.superseded = true;
            }
            state.entries.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        CacheCounters::add(&self.inner.counters.evictions, count as u64);
        for entry in drained {
            self.run_evict_hook(&entry.key, &entry.value).await;
        }
        count
    }

    /// Read the cached value without touching the store.
    pub fn peek(&self, key: &P::Key) -> Option<P::Value> {
        let id = self.inner.policy.project_key(key);
        let state = self.inner.lock();
        state
            .entries
            .get(&id)
            .filter(|entry| {
                !EngineState::is_expired(entry, self.inner.config.entry_ttl, Instant::now())
            })
            .map(|entry| entry.value.clone())
    }

    /// Generation of the cached entry for `key`, if any.
    pub fn generation(&self, key: &P::Key) -> Option<u64> {
        let id = self.inner.policy.project_key(key);
        self.inner.lock().entries.get(&id).map(|entry| entry.generation)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fetches currently in flight.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, pending) = {
            let state = self.inner.lock();
            (state.entries.len() as u64, state.pending.len() as u64)
        };
        self.inner.counters.snapshot(entries, pending)
    }

    fn spawn_fetch_one(&self, id: String, key: P::Key) {
        let inner = Arc::clone(&self.inner);
        let guard = PendingGuard::new(Arc::clone(&inner), vec![id.clone()]);
        tokio::spawn(async move {
            CacheCounters::bump(&inner.counters.single_fetches);
            debug!(key = %id, "fetching single key");
            let outcome = inner.policy.fetch_one(&key).await;
            if let Err(err) = &outcome {
                CacheCounters::bump(&inner.counters.store_errors);
                warn!(key = %id, error = %err, "single fetch failed");
            }
            guard.complete(vec![(id, key, outcome)]);
        });
    }

    fn spawn_fetch_many(&self, missing: Vec<(String, P::Key)>) {
        let inner = Arc::clone(&self.inner);
        let ids = missing.iter().map(|(id, _)| id.clone()).collect();
        let guard = PendingGuard::new(Arc::clone(&inner), ids);
        tokio::spawn(async move {
            CacheCounters::bump(&inner.counters.batch_fetches);
            debug!(keys = missing.len(), "fetching batch");
            let keys: Vec<P::Key> = missing.iter().map(|(_, key)| key.clone()).collect();

            let outcomes = match inner.policy.fetch_many(&keys).await {
                Ok(found) => {
                    let mut by_id: HashMap<String, P::Value> = found
                        .into_iter()
                        .map(|(key, value)| (inner.policy.project_key(&key), value))
                        .collect();
                    missing
                        .into_iter()
                        .map(|(id, key)| {
                            let value = by_id.remove(&id);
                            (id, key, Ok(value))
                        })
                        .collect()
                }
                Err(err) => {
                    CacheCounters::bump(&inner.counters.store_errors);
                    warn!(keys = missing.len(), error = %err, "batch fetch failed");
                    missing
                        .into_iter()
                        .map(|(id, key)| (id, key, Err(err.clone())))
                        .collect()
                }
            };
            guard.complete(outcomes);
        });
    }

    async fn notify_expired(&self, expired: Vec<CacheEntry<P::Key, P::Value>>) {
        for entry in expired {
            self.run_evict_hook(&entry.key, &entry.value).await;
        }
    }

    async fn run_evict_hook(&self, key: &P::Key, value: &P::Value) {
        if let Err(err) = self.inner.policy.on_evict(key, value).await {
            warn!(
                key = %self.inner.policy.project_key(key),
                error = %err,
                "evict hook failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use capital_core::HookError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Test policy over string keys, projected case-insensitively.
    #[derive(Default)]
    struct TestPolicy {
        data: Mutex<HashMap<String, i64>>,
        gate: Option<Arc<Semaphore>>,
        fail: AtomicBool,
        fail_hooks: bool,
        one_calls: AtomicUsize,
        batches: Mutex<Vec<Vec<String>>>,
        refreshed: Mutex<Vec<(String, Option<i64>, i64)>>,
        evicted: Mutex<Vec<(String, i64)>>,
    }

    impl TestPolicy {
        fn with_data(pairs: &[(&str, i64)]) -> Self {
            Self {
                data: Mutex::new(pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()),
                ..Default::default()
            }
        }

        fn gated(mut self, gate: &Arc<Semaphore>) -> Self {
            self.gate = Some(Arc::clone(gate));
            self
        }

        async fn pass_gate(&self) {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
        }

        fn batches(&self) -> Vec<Vec<String>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CachePolicy for TestPolicy {
        type Key = String;
        type Value = i64;

        fn project_key(&self, key: &String) -> String {
            key.to_ascii_lowercase()
        }

        async fn fetch_one(&self, key: &String) -> StoreResult<Option<i64>> {
            self.one_calls.fetch_add(1, Ordering::SeqCst);
            self.pass_gate().await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::unavailable("connection refused"));
            }
            Ok(self.data.lock().unwrap().get(&self.project_key(key)).copied())
        }

        async fn fetch_many(&self, keys: &[String]) -> StoreResult<HashMap<String, i64>> {
            let mut batch: Vec<String> = keys.iter().map(|k| self.project_key(k)).collect();
            batch.sort();
            self.batches.lock().unwrap().push(batch);
            self.pass_gate().await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::query("timeout"));
            }
            let data = self.data.lock().unwrap();
            Ok(keys
                .iter()
                .filter_map(|k| data.get(&self.project_key(k)).map(|v| (k.clone(), *v)))
                .collect())
        }

        async fn on_refresh(
            &self,
            key: &String,
            old: Option<&i64>,
            new: &i64,
        ) -> Result<(), HookError> {
            self.refreshed
                .lock()
                .unwrap()
                .push((key.clone(), old.copied(), *new));
            if self.fail_hooks {
                return Err(HookError {
                    hook: "on_refresh".to_string(),
                    reason: "subscriber gone".to_string(),
                });
            }
            Ok(())
        }

        async fn on_evict(&self, key: &String, value: &i64) -> Result<(), HookError> {
            self.evicted.lock().unwrap().push((key.clone(), *value));
            Ok(())
        }
    }

    fn key(s: &str) -> String {
        s.to_string()
    }

    /// Yield until `condition` holds, so spawned tasks reach their await points.
    async fn settle(mut condition: impl FnMut() -> bool) {
        for _ in 0..1_000 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_second_get_is_served_from_cache() {
        let engine = CacheEngine::with_defaults(TestPolicy::with_data(&[("a", 10)]));

        assert_eq!(engine.get(&key("a")).await.unwrap(), Some(10));
        assert_eq!(engine.get(&key("a")).await.unwrap(), Some(10));

        assert_eq!(engine.policy().one_calls.load(Ordering::SeqCst), 1);
        let stats = engine.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(engine.generation(&key("a")), Some(1));
    }

    #[tokio::test]
    async fn test_equal_projections_share_a_slot() {
        let engine = CacheEngine::with_defaults(TestPolicy::with_data(&[("a", 10)]));

        assert_eq!(engine.get(&key("A")).await.unwrap(), Some(10));
        assert_eq!(engine.peek(&key("a")), Some(10));
        assert_eq!(engine.len(), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_not_cached() {
        let engine = CacheEngine::with_defaults(TestPolicy::default());

        assert_eq!(engine.get(&key("x")).await.unwrap(), None);
        assert!(engine.is_empty());
        assert_eq!(engine.get(&key("x")).await.unwrap(), None);

        assert_eq!(engine.policy().one_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_fetch() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = CacheEngine::with_defaults(TestPolicy::with_data(&[("a", 7)]).gated(&gate));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.get(&key("a")).await })
            })
            .collect();

        settle(|| engine.stats().coalesced == 4).await;
        assert_eq!(engine.pending_count(), 1);
        gate.add_permits(1);

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), Some(7));
        }
        assert_eq!(engine.policy().one_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_get_many_joins_pending_single_fetch() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = CacheEngine::with_defaults(TestPolicy::with_data(&[("a", 1)]).gated(&gate));

        let single = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.get(&key("a")).await })
        };
        settle(|| engine.pending_count() == 1).await;

        let batch = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.get_many(vec![key("a")]).await })
        };
        settle(|| engine.stats().coalesced == 1).await;
        gate.add_permits(1);

        assert_eq!(single.await.unwrap().unwrap(), Some(1));
        assert_eq!(batch.await.unwrap().unwrap()[&key("a")], 1);
        assert_eq!(engine.policy().one_calls.load(Ordering::SeqCst), 1);
        assert!(engine.policy().batches().is_empty());
    }

    #[tokio::test]
    async fn test_get_many_partitions_cached_pending_and_missing() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = CacheEngine::with_defaults(
            TestPolicy::with_data(&[("a", 1), ("b", 2), ("c", 3)]).gated(&gate),
        );

        engine.refresh(&key("a"), 1).await;
        let pending_b = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.get(&key("b")).await })
        };
        settle(|| engine.pending_count() == 1).await;

        let batch = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.get_many(vec![key("a"), key("b"), key("c")]).await })
        };
        settle(|| engine.policy().batches().len() == 1).await;
        gate.add_permits(2);

        let values = batch.await.unwrap().unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[&key("c")], 3);
        assert_eq!(pending_b.await.unwrap().unwrap(), Some(2));

        assert_eq!(engine.policy().batches(), vec![vec![key("c")]]);
        assert_eq!(engine.policy().one_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_many_omits_unknown_and_dedupes_projections() {
        let engine = CacheEngine::with_defaults(TestPolicy::with_data(&[("a", 1)]));

        let values = engine
            .get_many(vec![key("a"), key("A"), key("zzz")])
            .await
            .unwrap();

        assert_eq!(values.len(), 1);
        assert_eq!(engine.policy().batches(), vec![vec![key("a"), key("zzz")]]);
        assert_eq!(engine.len(), 1);
    }

    #[tokio::test]
    async fn test_get_many_all_cached_issues_no_call() {
        let engine = CacheEngine::with_defaults(TestPolicy::default());
        engine.refresh(&key("a"), 1).await;
        engine.refresh(&key("b"), 2).await;

        let values = engine.get_many(vec![key("a"), key("b")]).await.unwrap();
        assert_eq!(values.len(), 2);
        assert!(engine.policy().batches().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_then_get_needs_no_store_call() {
        let engine = CacheEngine::with_defaults(TestPolicy::with_data(&[("k", 1)]));

        engine.refresh(&key("k"), 42).await;
        assert_eq!(engine.get(&key("k")).await.unwrap(), Some(42));

        assert_eq!(engine.policy().one_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            engine.policy().refreshed.lock().unwrap().clone(),
            vec![(key("k"), None, 42)]
        );
    }

    #[tokio::test]
    async fn test_refresh_bumps_generation_and_reports_old_value() {
        let engine = CacheEngine::with_defaults(TestPolicy::with_data(&[("k", 1)]));
        engine.get(&key("k")).await.unwrap();

        engine.refresh(&key("k"), 5).await;
        assert_eq!(engine.generation(&key("k")), Some(2));
        assert_eq!(
            engine.policy().refreshed.lock().unwrap().clone(),
            vec![(key("k"), Some(1), 5)]
        );
    }

    #[tokio::test]
    async fn test_failing_refresh_hook_keeps_value() {
        let policy = TestPolicy {
            fail_hooks: true,
            ..Default::default()
        };
        let engine = CacheEngine::with_defaults(policy);

        engine.refresh(&key("k"), 9).await;
        assert_eq!(engine.peek(&key("k")), Some(9));
    }

    #[tokio::test]
    async fn test_evict_runs_hook_once() {
        let engine = CacheEngine::with_defaults(TestPolicy::with_data(&[("k", 3)]));
        engine.get(&key("k")).await.unwrap();

        assert!(engine.evict(&key("k")).await);
        assert!(!engine.evict(&key("k")).await);

        assert_eq!(
            engine.policy().evicted.lock().unwrap().clone(),
            vec![(key("k"), 3)]
        );
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_evict_absent_key_is_noop() {
        let engine = CacheEngine::with_defaults(TestPolicy::default());
        assert!(!engine.evict(&key("missing")).await);
        assert!(engine.policy().evicted.lock().unwrap().is_empty());
        assert_eq!(engine.stats().evictions, 0);
    }

    #[tokio::test]
    async fn test_store_error_reaches_every_waiter() {
        let gate = Arc::new(Semaphore::new(0));
        let policy = TestPolicy::with_data(&[("a", 1)]).gated(&gate);
        policy.fail.store(true, Ordering::SeqCst);
        let engine = CacheEngine::with_defaults(policy);

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.get(&key("a")).await })
            })
            .collect();
        settle(|| engine.stats().coalesced == 2).await;
        gate.add_permits(1);

        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Err(StoreError::Unavailable { .. })
            ));
        }
        assert!(engine.is_empty());
        assert_eq!(engine.stats().store_errors, 1);

        engine.policy().fail.store(false, Ordering::SeqCst);
        gate.add_permits(1);
        assert_eq!(engine.get(&key("a")).await.unwrap(), Some(1));
        assert_eq!(engine.policy().one_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_batch_error_fails_get_many() {
        let policy = TestPolicy::with_data(&[("a", 1)]);
        policy.fail.store(true, Ordering::SeqCst);
        let engine = CacheEngine::with_defaults(policy);

        let result = engine.get_many(vec![key("a"), key("b")]).await;
        assert!(matches!(result, Err(StoreError::QueryFailed { .. })));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_during_fetch_wins_over_stale_result() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = CacheEngine::with_defaults(TestPolicy::with_data(&[("a", 1)]).gated(&gate));

        let reader = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.get(&key("a")).await })
        };
        settle(|| engine.pending_count() == 1).await;

        engine.refresh(&key("a"), 50).await;
        gate.add_permits(1);

        assert_eq!(reader.await.unwrap().unwrap(), Some(50));
        assert_eq!(engine.peek(&key("a")), Some(50));
        assert_eq!(engine.generation(&key("a")), Some(1));
    }

    #[tokio::test]
    async fn test_evict_during_fetch_skips_caching() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = CacheEngine::with_defaults(TestPolicy::with_data(&[("a", 1)]).gated(&gate));

        let reader = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.get(&key("a")).await })
        };
        settle(|| engine.pending_count() == 1).await;

        assert!(!engine.evict(&key("a")).await);
        gate.add_permits(1);

        assert_eq!(reader.await.unwrap().unwrap(), Some(1));
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_get_still_populates_cache() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = CacheEngine::with_defaults(TestPolicy::with_data(&[("a", 8)]).gated(&gate));

        let reader = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.get(&key("a")).await })
        };
        settle(|| engine.pending_count() == 1).await;
        reader.abort();

        gate.add_permits(1);
        settle(|| engine.pending_count() == 0).await;

        assert_eq!(engine.peek(&key("a")), Some(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_refetched() {
        let config = CacheConfig::new().with_ttl(Duration::from_secs(30));
        let engine = CacheEngine::new(TestPolicy::with_data(&[("a", 1)]), config);

        engine.get(&key("a")).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        engine.get(&key("a")).await.unwrap();
        assert_eq!(engine.policy().one_calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(engine.peek(&key("a")), None);
        assert_eq!(engine.get(&key("a")).await.unwrap(), Some(1));

        assert_eq!(engine.policy().one_calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.stats().expirations, 1);
        assert_eq!(
            engine.policy().evicted.lock().unwrap().clone(),
            vec![(key("a"), 1)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_disables_expiry() {
        let config = CacheConfig::new().with_ttl(Duration::ZERO);
        let engine = CacheEngine::new(TestPolicy::with_data(&[("a", 1)]), config);
        assert_eq!(engine.config().entry_ttl, None);

        engine.get(&key("a")).await.unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(engine.peek(&key("a")), Some(1));
        engine.get(&key("a")).await.unwrap();

        assert_eq!(engine.policy().one_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.stats().expirations, 0);
    }

    #[tokio::test]
    async fn test_clear_evicts_everything() {
        let engine = CacheEngine::with_defaults(TestPolicy::default());
        engine.refresh(&key("a"), 1).await;
        engine.refresh(&key("b"), 2).await;

        assert_eq!(engine.clear().await, 2);
        assert!(engine.is_empty());
        assert_eq!(engine.policy().evicted.lock().unwrap().len(), 2);
        assert_eq!(engine.stats().evictions, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dedupe_holds_across_worker_threads() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = CacheEngine::with_defaults(TestPolicy::with_data(&[("hot", 99)]).gated(&gate));

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        engine.get(&key("hot")).await.map(|v| v.unwrap())
                    } else {
                        engine
                            .get_many(vec![key("HOT")])
                            .await
                            .map(|m| m[&key("HOT")])
                    }
                })
            })
            .collect();

        while {
            let stats = engine.stats();
            stats.misses + stats.coalesced < 64
        } {
            tokio::task::yield_now().await;
        }
        gate.add_permits(64);

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 99);
        }
        let stats = engine.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.store_calls(), 1);
    }
}
