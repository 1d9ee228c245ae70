//! Account balance cache policy.

use async_trait::async_trait;
use capital_core::{AccountId, Balance, HookError, StoreResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use super::engine::CacheEngine;
use super::policy::CachePolicy;
use crate::store::BalanceStore;

/// Capacity of the balance change feed. Slow subscribers lag and skip.
const CHANGE_FEED_CAPACITY: usize = 256;

/// A cached balance was replaced by a forced refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceChange {
    pub account: AccountId,
    pub old: Option<Balance>,
    pub new: Balance,
}

/// Caches the balance of each account, keyed by [`AccountId`].
pub struct AccountBalancePolicy<S> {
    store: Arc<S>,
    changes: Option<broadcast::Sender<BalanceChange>>,
}

impl<S: BalanceStore> AccountBalancePolicy<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            changes: None,
        }
    }

    /// Publish every refreshed balance on a broadcast feed.
    pub fn with_change_feed(mut self) -> Self {
        let (sender, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        self.changes = Some(sender);
        self
    }

    /// Subscribe to refreshed balances. `None` if the feed is disabled.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<BalanceChange>> {
        self.changes.as_ref().map(broadcast::Sender::subscribe)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

#[async_trait]
impl<S: BalanceStore + 'static> CachePolicy for AccountBalancePolicy<S> {
    type Key = AccountId;
    type Value = Balance;

    fn project_key(&self, key: &AccountId) -> String {
        key.canonical()
    }

    async fn fetch_one(&self, key: &AccountId) -> StoreResult<Option<Balance>> {
        self.store.fetch_account_value(*key).await
    }

    async fn fetch_many(&self, keys: &[AccountId]) -> StoreResult<HashMap<AccountId, Balance>> {
        self.store.fetch_account_values(keys).await
    }

    async fn on_refresh(
        &self,
        key: &AccountId,
        old: Option<&Balance>,
        new: &Balance,
    ) -> Result<(), HookError> {
        if let Some(changes) = &self.changes {
            let change = BalanceChange {
                account: *key,
                old: old.copied(),
                new: *new,
            };
            // A feed nobody listens to is not a failure.
            if changes.send(change).is_err() {
                trace!(account = %key, "no balance change subscribers");
            }
        }
        Ok(())
    }
}

/// Cache of account balances.
pub type AccountBalanceCache<S> = CacheEngine<AccountBalancePolicy<S>>;
