//! Backing store adapter contract and an in-memory implementation.
//!
//! The authoritative balances live in a slower store. The cache only needs a
//! handful of round trips from it: point and batched balance reads, the
//! balances owned by a player, and paged listings of account and player ids.

use async_trait::async_trait;
use capital_core::{
    AccountId, Balance, LabelSelector, Labels, PlayerId, StoreError, StoreResult,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, RwLock};

/// Async adapter over the authoritative balance store.
///
/// A missing account or player is reported as absence (`None` or an omitted
/// map entry), never as an error.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Read the balance of one account.
    async fn fetch_account_value(&self, account: AccountId) -> StoreResult<Option<Balance>>;

    /// Read the balances of several accounts in one round trip.
    ///
    /// Accounts that do not exist are omitted from the result.
    async fn fetch_account_values(
        &self,
        accounts: &[AccountId],
    ) -> StoreResult<HashMap<AccountId, Balance>>;

    /// Read the balances of the accounts owned by `player` that match
    /// `selector`. Returns `None` if the player is unknown.
    async fn player_account_values(
        &self,
        player: PlayerId,
        selector: &LabelSelector,
    ) -> StoreResult<Option<Vec<Balance>>>;

    /// Batched form of [`BalanceStore::player_account_values`].
    async fn players_account_values(
        &self,
        players: &[PlayerId],
        selector: &LabelSelector,
    ) -> StoreResult<HashMap<PlayerId, Vec<Balance>>>;

    /// List up to `limit` account ids in ascending order, strictly after `after`.
    async fn list_accounts(
        &self,
        after: Option<AccountId>,
        limit: usize,
    ) -> StoreResult<Vec<AccountId>>;

    /// List up to `limit` player ids in ascending order, strictly after `after`.
    async fn list_players(&self, after: Option<PlayerId>, limit: usize)
        -> StoreResult<Vec<PlayerId>>;
}

#[async_trait]
impl<T: BalanceStore + ?Sized> BalanceStore for Arc<T> {
    async fn fetch_account_value(&self, account: AccountId) -> StoreResult<Option<Balance>> {
        (**self).fetch_account_value(account).await
    }

    async fn fetch_account_values(
        &self,
        accounts: &[AccountId],
    ) -> StoreResult<HashMap<AccountId, Balance>> {
        (**self).fetch_account_values(accounts).await
    }

    async fn player_account_values(
        &self,
        player: PlayerId,
        selector: &LabelSelector,
    ) -> StoreResult<Option<Vec<Balance>>> {
        (**self).player_account_values(player, selector).await
    }

    async fn players_account_values(
        &self,
        players: &[PlayerId],
        selector: &LabelSelector,
    ) -> StoreResult<HashMap<PlayerId, Vec<Balance>>> {
        (**self).players_account_values(players, selector).await
    }

    async fn list_accounts(
        &self,
        after: Option<AccountId>,
        limit: usize,
    ) -> StoreResult<Vec<AccountId>> {
        (**self).list_accounts(after, limit).await
    }

    async fn list_players(
        &self,
        after: Option<PlayerId>,
        limit: usize,
    ) -> StoreResult<Vec<PlayerId>> {
        (**self).list_players(after, limit).await
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// A stored account row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub owner: Option<PlayerId>,
    pub value: Balance,
    pub labels: Labels,
}

/// In-memory balance store for testing and local wiring.
#[derive(Debug, Default)]
pub struct InMemoryBalanceStore {
    accounts: RwLock<BTreeMap<AccountId, AccountRecord>>,
}

impl InMemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an account.
    pub fn insert_account(&self, account: AccountId, record: AccountRecord) -> StoreResult<()> {
        self.accounts
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .insert(account, record);
        Ok(())
    }

    /// Insert an unowned, unlabelled account with the given balance.
    pub fn insert_balance(&self, account: AccountId, value: Balance) -> StoreResult<()> {
        self.insert_account(
            account,
            AccountRecord {
                owner: None,
                value,
                labels: Labels::new(),
            },
        )
    }

    /// Overwrite the balance of an existing account.
    ///
    /// Returns the previous balance, or `None` if the account does not exist.
    pub fn set_value(&self, account: AccountId, value: Balance) -> StoreResult<Option<Balance>> {
        let mut accounts = self.accounts.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(accounts
            .get_mut(&account)
            .map(|record| std::mem::replace(&mut record.value, value)))
    }

    pub fn remove_account(&self, account: AccountId) -> StoreResult<Option<AccountRecord>> {
        Ok(self
            .accounts
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .remove(&account))
    }

    pub fn account_count(&self) -> usize {
        self.accounts.read().map(|a| a.len()).unwrap_or(0)
    }

    fn selected_values(
        accounts: &BTreeMap<AccountId, AccountRecord>,
        player: PlayerId,
        selector: &LabelSelector,
    ) -> Option<Vec<Balance>> {
        let mut known = false;
        let mut values = Vec::new();
        for record in accounts.values().filter(|r| r.owner == Some(player)) {
            known = true;
            if selector.matches(&record.labels) {
                values.push(record.value);
            }
        }
        known.then_some(values)
    }
}

#[async_trait]
impl BalanceStore for InMemoryBalanceStore {
    async fn fetch_account_value(&self, account: AccountId) -> StoreResult<Option<Balance>> {
        let accounts = self.accounts.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(accounts.get(&account).map(|record| record.value))
    }

    async fn fetch_account_values(
        &self,
        ids: &[AccountId],
    ) -> StoreResult<HashMap<AccountId, Balance>> {
        let accounts = self.accounts.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(ids
            .iter()
            .filter_map(|id| accounts.get(id).map(|record| (*id, record.value)))
            .collect())
    }

    async fn player_account_values(
        &self,
        player: PlayerId,
        selector: &LabelSelector,
    ) -> StoreResult<Option<Vec<Balance>>> {
        let accounts = self.accounts.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(Self::selected_values(&accounts, player, selector))
    }

    async fn players_account_values(
        &self,
        players: &[PlayerId],
        selector: &LabelSelector,
    ) -> StoreResult<HashMap<PlayerId, Vec<Balance>>> {
        let accounts = self.accounts.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(players
            .iter()
            .filter_map(|&player| {
                Self::selected_values(&accounts, player, selector).map(|values| (player, values))
            })
            .collect())
    }

    async fn list_accounts(
        &self,
        after: Option<AccountId>,
        limit: usize,
    ) -> StoreResult<Vec<AccountId>> {
        let accounts = self.accounts.read().map_err(|_| StoreError::LockPoisoned)?;
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        Ok(accounts
            .range((lower, Bound::Unbounded))
            .map(|(id, _)| *id)
            .take(limit)
            .collect())
    }

    async fn list_players(
        &self,
        after: Option<PlayerId>,
        limit: usize,
    ) -> StoreResult<Vec<PlayerId>> {
        let accounts = self.accounts.read().map_err(|_| StoreError::LockPoisoned)?;
        let players: BTreeSet<PlayerId> = accounts.values().filter_map(|r| r.owner).collect();
        Ok(players
            .into_iter()
            .filter(|player| after.map_or(true, |after| *player > after))
            .take(limit)
            .collect())
    }
}
