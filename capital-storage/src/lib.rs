//! CAPITAL Storage - Backing Store Adapter and Balance Cache
//!
//! Defines the adapter trait over the authoritative balance store, an
//! in-memory implementation, paged key enumeration, and the coalescing cache
//! engine that fronts the store.

pub mod cache;
pub mod paging;
pub mod store;

pub use cache::{
    mutation_listener_task, AccountBalanceCache, AccountBalancePolicy, BalanceChange,
    BalanceInvalidator, CacheEngine, CachePolicy, CacheStats, InvalidationMetrics,
    InvalidationSnapshot, MutationSink, PlayerMetricCache, PlayerMetricPolicy,
};
pub use paging::{AccountKeySource, KeySource, Page, PlayerKeySource, StaticKeySource};
pub use store::{AccountRecord, BalanceStore, InMemoryBalanceStore};
