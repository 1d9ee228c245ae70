//! Per-quantity cache policy contract.
//!
//! The engine is generic over this capability set. Each kind of cached value
//! (account balance, player metric, ...) implements it once, mapping keys to
//! their canonical string and delegating fetches to the backing store.

use async_trait::async_trait;
use capital_core::{HookError, StoreResult};
use std::collections::HashMap;
use std::hash::Hash;

/// Capability set for one cached quantity.
///
/// # Implementation Requirements
///
/// - `project_key()` must be stable and collision-free: two keys with the
///   same projection share one cache slot.
/// - `fetch_many()` must omit keys that do not exist instead of failing.
/// - Hooks run after the engine has applied the change; their failure is
///   logged and never rolls the change back.
#[async_trait]
pub trait CachePolicy: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    /// Canonical string identity of `key`.
    fn project_key(&self, key: &Self::Key) -> String;

    /// Single-key round trip. `Ok(None)` means not found.
    async fn fetch_one(&self, key: &Self::Key) -> StoreResult<Option<Self::Value>>;

    /// Batched round trip. Missing keys are omitted from the map.
    async fn fetch_many(&self, keys: &[Self::Key]) -> StoreResult<HashMap<Self::Key, Self::Value>>;

    /// Called after a forced refresh replaced `old` with `new`.
    async fn on_refresh(
        &self,
        _key: &Self::Key,
        _old: Option<&Self::Value>,
        _new: &Self::Value,
    ) -> Result<(), HookError> {
        Ok(())
    }

    /// Called once after `value` was removed from the cache.
    async fn on_evict(&self, _key: &Self::Key, _value: &Self::Value) -> Result<(), HookError> {
        Ok(())
    }
}
