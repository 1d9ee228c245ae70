//! Coalescing balance cache.
//!
//! A [`CacheEngine`] sits in front of the slower balance store and serves
//! point and batched reads with request coalescing: no matter how many
//! callers ask for a key at once, the store sees at most one round trip for
//! it. What gets cached, and how it is fetched, is decided by a
//! [`CachePolicy`]; two policies ship here, one for account balances and one
//! for per-player metrics.
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(InMemoryBalanceStore::new());
//! let accounts = CacheEngine::new(AccountBalancePolicy::new(store), CacheConfig::from_env());
//!
//! // Concurrent readers of the same account share one store call
//! let (a, b) = tokio::join!(accounts.get(&id), accounts.get(&id));
//!
//! // The store pushed a new balance: no round trip needed for the next read
//! accounts.refresh(&id, 1_250).await;
//! ```

pub mod account;
pub mod engine;
pub mod invalidation;
pub mod player;
pub mod policy;
pub mod stats;

pub use account::{AccountBalanceCache, AccountBalancePolicy, BalanceChange};
pub use engine::CacheEngine;
pub use invalidation::{
    mutation_listener_task, BalanceInvalidator, InvalidationMetrics, InvalidationSnapshot,
    MutationSink,
};
pub use player::{PlayerMetricCache, PlayerMetricPolicy};
pub use policy::CachePolicy;
pub use stats::CacheStats;
