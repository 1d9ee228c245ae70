//! Push-based invalidation from the authoritative store.
//!
//! Balance changes reported by the store refresh the account cache in place,
//! so the next read needs no round trip. Player metrics cannot be recomputed
//! from a single balance; the players a transaction names are evicted instead
//! and refetched on their next read.

use async_trait::async_trait;
use capital_core::{AccountMutation, BalanceEvent, TransactionEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::account::AccountBalanceCache;
use super::engine::CacheEngine;
use super::player::PlayerMetricCache;
use super::policy::CachePolicy;
use crate::store::BalanceStore;

/// Receiver of authoritative value changes.
#[async_trait]
pub trait MutationSink<K, V>: Send + Sync {
    async fn on_mutation(&self, key: &K, new_value: V);
}

#[async_trait]
impl<P: CachePolicy> MutationSink<P::Key, P::Value> for CacheEngine<P> {
    async fn on_mutation(&self, key: &P::Key, new_value: P::Value) {
        self.refresh(key, new_value).await;
    }
}

/// Counters for applied invalidations.
#[derive(Debug, Default)]
pub struct InvalidationMetrics {
    pub accounts_refreshed: AtomicU64,
    pub players_evicted: AtomicU64,
    pub events_applied: AtomicU64,
}

impl InvalidationMetrics {
    pub fn snapshot(&self) -> InvalidationSnapshot {
        InvalidationSnapshot {
            accounts_refreshed: self.accounts_refreshed.load(Ordering::Relaxed),
            players_evicted: self.players_evicted.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationSnapshot {
    pub accounts_refreshed: u64,
    pub players_evicted: u64,
    pub events_applied: u64,
}

/// Applies balance events to an account cache and any player metric caches.
pub struct BalanceInvalidator<S: BalanceStore + 'static> {
    accounts: AccountBalanceCache<S>,
    players: Vec<PlayerMetricCache<S>>,
    metrics: InvalidationMetrics,
}

impl<S: BalanceStore + 'static> BalanceInvalidator<S> {
    pub fn new(accounts: AccountBalanceCache<S>) -> Self {
        Self {
            accounts,
            players: Vec::new(),
            metrics: InvalidationMetrics::default(),
        }
    }

    /// Also evict involved players from `cache` on transactions.
    pub fn with_player_cache(mut self, cache: PlayerMetricCache<S>) -> Self {
        self.players.push(cache);
        self
    }

    pub fn metrics(&self) -> &InvalidationMetrics {
        &self.metrics
    }

    pub async fn on_mutation(&self, mutation: &AccountMutation) {
        self.accounts
            .on_mutation(&mutation.account, mutation.new_value)
            .await;
        self.metrics.accounts_refreshed.fetch_add(1, Ordering::Relaxed);
    }

    /// Refresh both sides of the transfer and evict the hinted players.
    pub async fn on_transaction(&self, event: &TransactionEvent) {
        for mutation in event.mutations() {
            self.on_mutation(&mutation).await;
        }

        let mut evicted = 0u64;
        for cache in &self.players {
            for player in &event.involved_players {
                if cache.evict(player).await {
                    evicted += 1;
                }
            }
        }
        self.metrics
            .players_evicted
            .fetch_add(evicted, Ordering::Relaxed);

        tracing::debug!(
            src = %event.src,
            dest = %event.dest,
            amount = event.amount,
            players_evicted = evicted,
            "Applied transaction to caches"
        );
    }

    pub async fn apply(&self, event: &BalanceEvent) {
        match event {
            BalanceEvent::Mutation(mutation) => self.on_mutation(mutation).await,
            BalanceEvent::Transaction(transaction) => self.on_transaction(transaction).await,
        }
        self.metrics.events_applied.fetch_add(1, Ordering::Relaxed);
    }
}

/// Background task that applies balance events until shutdown.
///
/// Stops when the shutdown signal turns `true` or every event sender is
/// dropped. Returns the number of events applied by this task.
pub async fn mutation_listener_task<S: BalanceStore + 'static>(
    invalidator: Arc<BalanceInvalidator<S>>,
    mut events: mpsc::Receiver<BalanceEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> u64 {
    let mut applied = 0u64;
    tracing::info!("Mutation listener started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Mutation listener shutting down");
                    break;
                }
            }

            event = events.recv() => {
                match event {
                    Some(event) => {
                        invalidator.apply(&event).await;
                        applied += 1;
                    }
                    None => {
                        tracing::info!("Mutation feed closed");
                        break;
                    }
                }
            }
        }
    }

    tracing::info!(events_applied = applied, "Mutation listener completed");
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{AccountBalancePolicy, PlayerMetricPolicy};
    use crate::store::{AccountRecord, InMemoryBalanceStore};
    use capital_core::{AccountId, BalanceMetric, LabelSelector, Labels, MetricValue, PlayerId};
    use chrono::Utc;
    use uuid::Uuid;

    fn account(n: u128) -> AccountId {
        AccountId::new(Uuid::from_u128(n))
    }

    fn player(n: u128) -> PlayerId {
        PlayerId::new(Uuid::from_u128(n))
    }

    fn fixture() -> (
        Arc<InMemoryBalanceStore>,
        AccountBalanceCache<InMemoryBalanceStore>,
        PlayerMetricCache<InMemoryBalanceStore>,
    ) {
        let store = Arc::new(InMemoryBalanceStore::new());
        for (id, owner, value) in [(1, 1, 100), (2, 2, 50)] {
            store
                .insert_account(
                    account(id),
                    AccountRecord {
                        owner: Some(player(owner)),
                        value,
                        labels: Labels::new(),
                    },
                )
                .unwrap();
        }
        let accounts = CacheEngine::with_defaults(AccountBalancePolicy::new(Arc::clone(&store)));
        let players = CacheEngine::with_defaults(PlayerMetricPolicy::new(
            Arc::clone(&store),
            BalanceMetric::BalanceSum,
            LabelSelector::new(),
        ));
        (store, accounts, players)
    }

    fn transfer(amount: i64) -> TransactionEvent {
        TransactionEvent {
            src: account(1),
            dest: account(2),
            amount,
            labels: Labels::new(),
            involved_players: vec![player(1), player(2)],
            src_balance: 100 - amount,
            dest_balance: 50 + amount,
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_cache_engine_is_a_mutation_sink() {
        let (_, accounts, _) = fixture();
        let sink: &dyn MutationSink<AccountId, i64> = &accounts;

        sink.on_mutation(&account(7), 12).await;
        assert_eq!(accounts.get(&account(7)).await.unwrap(), Some(12));
        assert_eq!(accounts.stats().store_calls(), 0);
    }

    #[tokio::test]
    async fn test_transaction_refreshes_accounts_and_evicts_players() {
        let (store, accounts, players) = fixture();
        assert_eq!(players.get(&player(1)).await.unwrap(), Some(MetricValue(100.0)));
        players.get(&player(2)).await.unwrap();

        let invalidator =
            BalanceInvalidator::new(accounts.clone()).with_player_cache(players.clone());
        store.set_value(account(1), 70).unwrap();
        store.set_value(account(2), 80).unwrap();
        invalidator.apply(&BalanceEvent::from(transfer(30))).await;

        assert_eq!(accounts.peek(&account(1)), Some(70));
        assert_eq!(accounts.peek(&account(2)), Some(80));
        assert!(players.is_empty());
        assert_eq!(players.get(&player(1)).await.unwrap(), Some(MetricValue(70.0)));

        let snapshot = invalidator.metrics().snapshot();
        assert_eq!(snapshot.accounts_refreshed, 2);
        assert_eq!(snapshot.players_evicted, 2);
        assert_eq!(snapshot.events_applied, 1);
    }

    #[tokio::test]
    async fn test_listener_stops_on_shutdown() {
        let (_, accounts, _) = fixture();
        let invalidator = Arc::new(BalanceInvalidator::new(accounts.clone()));
        let (events_tx, events_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(mutation_listener_task(invalidator, events_rx, shutdown_rx));

        events_tx
            .send(AccountMutation::new(account(1), 5).into())
            .await
            .unwrap();
        while accounts.peek(&account(1)).is_none() {
            tokio::task::yield_now().await;
        }

        shutdown_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_listener_stops_when_feed_closes() {
        let (_, accounts, _) = fixture();
        let invalidator = Arc::new(BalanceInvalidator::new(accounts.clone()));
        let (events_tx, events_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        events_tx
            .send(AccountMutation::new(account(2), 9).into())
            .await
            .unwrap();
        drop(events_tx);

        let applied = mutation_listener_task(invalidator, events_rx, shutdown_rx).await;
        assert_eq!(applied, 1);
        assert_eq!(accounts.peek(&account(2)), Some(9));
    }
}
