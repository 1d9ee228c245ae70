//! CAPITAL Test Utilities
//!
//! Shared test infrastructure for the CAPITAL workspace:
//! - Instrumented balance stores (call counting, gating, fault injection)
//! - Proptest generators for identifiers, balances and metrics
//! - Fixtures for common store layouts
//! - Assertions for store errors
//! - Log capture for tests

pub use capital_core::{
    AccountId, Balance, BalanceMetric, LabelSelector, Labels, MetricValue, PlayerId, StoreError,
    StoreResult,
};
pub use capital_storage::{AccountRecord, BalanceStore, InMemoryBalanceStore};

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

// ============================================================================
// TRACING
// ============================================================================

/// Route `tracing` output to the test harness.
///
/// Filtered by `RUST_LOG`, warnings only by default. Safe to call from
/// every test; only the first call installs a subscriber.
pub fn init_test_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

// ============================================================================
// INSTRUMENTED STORES
// ============================================================================

/// Store wrapper that counts every round trip and records batch sizes.
#[derive(Debug)]
pub struct CountingStore<S> {
    inner: S,
    single_reads: AtomicUsize,
    batch_reads: AtomicUsize,
    player_reads: AtomicUsize,
    listings: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

impl<S: BalanceStore> CountingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            single_reads: AtomicUsize::new(0),
            batch_reads: AtomicUsize::new(0),
            player_reads: AtomicUsize::new(0),
            listings: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Point reads of one account.
    pub fn single_reads(&self) -> usize {
        self.single_reads.load(Ordering::SeqCst)
    }

    /// Batched account reads.
    pub fn batch_reads(&self) -> usize {
        self.batch_reads.load(Ordering::SeqCst)
    }

    /// Player reads, single or batched.
    pub fn player_reads(&self) -> usize {
        self.player_reads.load(Ordering::SeqCst)
    }

    /// Account and player listing pages.
    pub fn listings(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }

    /// Every balance read, single or batched, account or player.
    pub fn value_reads(&self) -> usize {
        self.single_reads() + self.batch_reads() + self.player_reads()
    }

    /// Key counts of every batched read, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_batch(&self, size: usize) {
        self.batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(size);
    }
}

#[async_trait]
impl<S: BalanceStore> BalanceStore for CountingStore<S> {
    async fn fetch_account_value(&self, account: AccountId) -> StoreResult<Option<Balance>> {
        self.single_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_account_value(account).await
    }

    async fn fetch_account_values(
        &self,
        accounts: &[AccountId],
    ) -> StoreResult<HashMap<AccountId, Balance>> {
        self.batch_reads.fetch_add(1, Ordering::SeqCst);
        self.record_batch(accounts.len());
        self.inner.fetch_account_values(accounts).await
    }

    async fn player_account_values(
        &self,
        player: PlayerId,
        selector: &LabelSelector,
    ) -> StoreResult<Option<Vec<Balance>>> {
        self.player_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.player_account_values(player, selector).await
    }

    async fn players_account_values(
        &self,
        players: &[PlayerId],
        selector: &LabelSelector,
    ) -> StoreResult<HashMap<PlayerId, Vec<Balance>>> {
        self.player_reads.fetch_add(1, Ordering::SeqCst);
        self.record_batch(players.len());
        self.inner.players_account_values(players, selector).await
    }

    async fn list_accounts(
        &self,
        after: Option<AccountId>,
        limit: usize,
    ) -> StoreResult<Vec<AccountId>> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        self.inner.list_accounts(after, limit).await
    }

    async fn list_players(
        &self,
        after: Option<PlayerId>,
        limit: usize,
    ) -> StoreResult<Vec<PlayerId>> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        self.inner.list_players(after, limit).await
    }
}

/// Store wrapper whose balance reads block until a permit is released.
///
/// Listings are not gated.
#[derive(Debug)]
pub struct GatedStore<S> {
    inner: S,
    gate: Arc<Semaphore>,
    waiting: AtomicUsize,
}

impl<S: BalanceStore> GatedStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            gate: Arc::new(Semaphore::new(0)),
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Let `n` more reads through.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Reads currently blocked on the gate.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    async fn pass(&self) -> StoreResult<()> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let permit = self.gate.acquire().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        match permit {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(StoreError::unavailable("gate closed")),
        }
    }
}

#[async_trait]
impl<S: BalanceStore> BalanceStore for GatedStore<S> {
    async fn fetch_account_value(&self, account: AccountId) -> StoreResult<Option<Balance>> {
        self.pass().await?;
        self.inner.fetch_account_value(account).await
    }

    async fn fetch_account_values(
        &self,
        accounts: &[AccountId],
    ) -> StoreResult<HashMap<AccountId, Balance>> {
        self.pass().await?;
        self.inner.fetch_account_values(accounts).await
    }

    async fn player_account_values(
        &self,
        player: PlayerId,
        selector: &LabelSelector,
    ) -> StoreResult<Option<Vec<Balance>>> {
        self.pass().await?;
        self.inner.player_account_values(player, selector).await
    }

    async fn players_account_values(
        &self,
        players: &[PlayerId],
        selector: &LabelSelector,
    ) -> StoreResult<HashMap<PlayerId, Vec<Balance>>> {
        self.pass().await?;
        self.inner.players_account_values(players, selector).await
    }

    async fn list_accounts(
        &self,
        after: Option<AccountId>,
        limit: usize,
    ) -> StoreResult<Vec<AccountId>> {
        self.inner.list_accounts(after, limit).await
    }

    async fn list_players(
        &self,
        after: Option<PlayerId>,
        limit: usize,
    ) -> StoreResult<Vec<PlayerId>> {
        self.inner.list_players(after, limit).await
    }
}

/// Store wrapper with switchable faults.
///
/// Reads touching a poisoned account or player fail with
/// [`StoreError::QueryFailed`]; `fail_all` fails every read and
/// `fail_listing` fails every listing page.
#[derive(Debug)]
pub struct FailingStore<S> {
    inner: S,
    fail_all: AtomicBool,
    fail_listing: AtomicBool,
    poisoned_accounts: Mutex<HashSet<AccountId>>,
    poisoned_players: Mutex<HashSet<PlayerId>>,
}

impl<S: BalanceStore> FailingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_all: AtomicBool::new(false),
            fail_listing: AtomicBool::new(false),
            poisoned_accounts: Mutex::new(HashSet::new()),
            poisoned_players: Mutex::new(HashSet::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub fn poison_account(&self, account: AccountId) {
        self.poisoned_accounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account);
    }

    pub fn poison_player(&self, player: PlayerId) {
        self.poisoned_players
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(player);
    }

    pub fn heal(&self) {
        self.set_fail_all(false);
        self.set_fail_listing(false);
        self.poisoned_accounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.poisoned_players
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn check_accounts(&self, accounts: &[AccountId]) -> StoreResult<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("injected outage"));
        }
        let poisoned = self
            .poisoned_accounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match accounts.iter().find(|a| poisoned.contains(*a)) {
            Some(account) => Err(StoreError::query(format!("injected fault on {account}"))),
            None => Ok(()),
        }
    }

    fn check_players(&self, players: &[PlayerId]) -> StoreResult<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("injected outage"));
        }
        let poisoned = self
            .poisoned_players
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match players.iter().find(|p| poisoned.contains(*p)) {
            Some(player) => Err(StoreError::query(format!("injected fault on {player}"))),
            None => Ok(()),
        }
    }

    fn check_listing(&self) -> StoreResult<()> {
        if self.fail_all.load(Ordering::SeqCst) || self.fail_listing.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("injected listing outage"));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: BalanceStore> BalanceStore for FailingStore<S> {
    async fn fetch_account_value(&self, account: AccountId) -> StoreResult<Option<Balance>> {
        self.check_accounts(&[account])?;
        self.inner.fetch_account_value(account).await
    }

    async fn fetch_account_values(
        &self,
        accounts: &[AccountId],
    ) -> StoreResult<HashMap<AccountId, Balance>> {
        self.check_accounts(accounts)?;
        self.inner.fetch_account_values(accounts).await
    }

    async fn player_account_values(
        &self,
        player: PlayerId,
        selector: &LabelSelector,
    ) -> StoreResult<Option<Vec<Balance>>> {
        self.check_players(&[player])?;
        self.inner.player_account_values(player, selector).await
    }

    async fn players_account_values(
        &self,
        players: &[PlayerId],
        selector: &LabelSelector,
    ) -> StoreResult<HashMap<PlayerId, Vec<Balance>>> {
        self.check_players(players)?;
        self.inner.players_account_values(players, selector).await
    }

    async fn list_accounts(
        &self,
        after: Option<AccountId>,
        limit: usize,
    ) -> StoreResult<Vec<AccountId>> {
        self.check_listing()?;
        self.inner.list_accounts(after, limit).await
    }

    async fn list_players(
        &self,
        after: Option<PlayerId>,
        limit: usize,
    ) -> StoreResult<Vec<PlayerId>> {
        self.check_listing()?;
        self.inner.list_players(after, limit).await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for CAPITAL types.

    use super::*;
    use proptest::collection::{btree_map, vec};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    /// Generate a random UUID.
    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    pub fn arb_account_id() -> impl Strategy<Value = AccountId> {
        arb_uuid().prop_map(AccountId::new)
    }

    pub fn arb_player_id() -> impl Strategy<Value = PlayerId> {
        arb_uuid().prop_map(PlayerId::new)
    }

    /// Balances in a range where sums and squares stay exact as `f64`.
    pub fn arb_balance() -> impl Strategy<Value = Balance> {
        -1_000_000i64..1_000_000i64
    }

    pub fn arb_balances(max_len: usize) -> impl Strategy<Value = Vec<Balance>> {
        vec(arb_balance(), 0..=max_len)
    }

    pub fn arb_metric() -> impl Strategy<Value = BalanceMetric> {
        proptest::sample::select(BalanceMetric::ALL.to_vec())
    }

    /// Balances drawn from a small range so ties are common.
    pub fn arb_tied_balance() -> impl Strategy<Value = Balance> {
        0i64..8
    }

    /// A population of accounts with their balances.
    pub fn arb_population(max_len: usize) -> impl Strategy<Value = BTreeMap<AccountId, Balance>> {
        btree_map(arb_account_id(), arb_tied_balance(), 0..=max_len)
    }

    pub fn arb_label_selector() -> impl Strategy<Value = LabelSelector> {
        btree_map("[a-z]{1,6}", "[a-z]{1,6}", 0..3)
            .prop_map(|pairs| pairs.into_iter().collect::<LabelSelector>())
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built identifiers and stores.

    use super::*;

    /// Deterministic account id; ids sort by `n`.
    pub fn account(n: u128) -> AccountId {
        AccountId::new(Uuid::from_u128(n))
    }

    /// Deterministic player id; ids sort by `n`.
    pub fn player(n: u128) -> PlayerId {
        PlayerId::new(Uuid::from_u128(n))
    }

    /// An in-memory store holding unowned accounts with the given balances.
    pub fn store_with_balances<I>(balances: I) -> InMemoryBalanceStore
    where
        I: IntoIterator<Item = (AccountId, Balance)>,
    {
        let store = InMemoryBalanceStore::new();
        for (account, value) in balances {
            store
                .insert_balance(account, value)
                .unwrap_or_else(|err| panic!("seeding {account} failed: {err}"));
        }
        store
    }

    /// An in-memory store with `accounts(n)` owned by `player(owner)`,
    /// labelled with `currency`.
    pub fn store_with_owned<I>(rows: I) -> InMemoryBalanceStore
    where
        I: IntoIterator<Item = (u128, u128, Balance, &'static str)>,
    {
        let store = InMemoryBalanceStore::new();
        for (id, owner, value, currency) in rows {
            let mut labels = Labels::new();
            labels.insert("currency".to_string(), currency.to_string());
            let record = AccountRecord {
                owner: Some(player(owner)),
                value,
                labels,
            };
            store
                .insert_account(account(id), record)
                .unwrap_or_else(|err| panic!("seeding account {id} failed: {err}"));
        }
        store
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for store results.

    use super::*;

    #[track_caller]
    pub fn assert_store_ok<T: std::fmt::Debug>(result: &StoreResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a result is a query failure.
    #[track_caller]
    pub fn assert_query_failed<T: std::fmt::Debug>(result: &StoreResult<T>) {
        match result {
            Err(StoreError::QueryFailed { .. }) => {}
            other => panic!("Expected QueryFailed, got: {:?}", other),
        }
    }

    /// Assert that a result reports an unreachable store.
    #[track_caller]
    pub fn assert_unavailable<T: std::fmt::Debug>(result: &StoreResult<T>) {
        match result {
            Err(StoreError::Unavailable { .. }) => {}
            other => panic!("Expected Unavailable, got: {:?}", other),
        }
    }
}
