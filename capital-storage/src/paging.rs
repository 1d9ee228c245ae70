//! Paged enumeration of the key population.
//!
//! The ranking refresher walks every key through [`KeySource::next_page`],
//! carrying an opaque cursor from one page to the next. A page without a
//! next cursor ends the sequence.

use async_trait::async_trait;
use capital_core::{AccountId, PlayerId, StoreResult};
use std::fmt::Debug;
use std::sync::Arc;

use crate::store::BalanceStore;

/// One page of keys plus the cursor to resume from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<K, C> {
    pub keys: Vec<K>,
    /// `None` marks the end of the sequence.
    pub next: Option<C>,
}

impl<K, C> Page<K, C> {
    pub fn last(keys: Vec<K>) -> Self {
        Self { keys, next: None }
    }

    pub fn is_last(&self) -> bool {
        self.next.is_none()
    }
}

/// Lazily produced sequence of every currently valid key.
#[async_trait]
pub trait KeySource: Send + Sync {
    type Key: Clone + Send + Sync + 'static;
    type Cursor: Clone + Debug + Send + Sync + 'static;

    /// Fetch up to `limit` keys following `cursor` (`None` starts from the
    /// beginning).
    async fn next_page(
        &self,
        cursor: Option<Self::Cursor>,
        limit: usize,
    ) -> StoreResult<Page<Self::Key, Self::Cursor>>;
}

/// Pages keyset-style: a full page resumes after its last key.
fn keyset_page<K: Copy>(keys: Vec<K>, limit: usize) -> Page<K, K> {
    let next = if keys.len() >= limit {
        keys.last().copied()
    } else {
        None
    };
    Page { keys, next }
}

/// Every account in the store, in id order.
pub struct AccountKeySource<S> {
    store: Arc<S>,
}

impl<S: BalanceStore> AccountKeySource<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: BalanceStore + 'static> KeySource for AccountKeySource<S> {
    type Key = AccountId;
    type Cursor = AccountId;

    async fn next_page(
        &self,
        cursor: Option<AccountId>,
        limit: usize,
    ) -> StoreResult<Page<AccountId, AccountId>> {
        let keys = self.store.list_accounts(cursor, limit).await?;
        Ok(keyset_page(keys, limit))
    }
}

/// Every player owning at least one account, in id order.
pub struct PlayerKeySource<S> {
    store: Arc<S>,
}

impl<S: BalanceStore> PlayerKeySource<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: BalanceStore + 'static> KeySource for PlayerKeySource<S> {
    type Key = PlayerId;
    type Cursor = PlayerId;

    async fn next_page(
        &self,
        cursor: Option<PlayerId>,
        limit: usize,
    ) -> StoreResult<Page<PlayerId, PlayerId>> {
        let keys = self.store.list_players(cursor, limit).await?;
        Ok(keyset_page(keys, limit))
    }
}

/// A fixed key list paged by offset.
#[derive(Debug, Clone)]
pub struct StaticKeySource<K> {
    keys: Vec<K>,
}

impl<K> StaticKeySource<K> {
    pub fn new(keys: Vec<K>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl<K: Clone + Send + Sync + 'static> KeySource for StaticKeySource<K> {
    type Key = K;
    type Cursor = usize;

    async fn next_page(&self, cursor: Option<usize>, limit: usize) -> StoreResult<Page<K, usize>> {
        let start = cursor.unwrap_or(0).min(self.keys.len());
        let end = start.saturating_add(limit).min(self.keys.len());
        let keys = self.keys[start..end].to_vec();
        let next = (end < self.keys.len()).then_some(end);
        Ok(Page { keys, next })
    }
}
