//! CAPITAL Core - Shared Types
//!
//! Identifiers, errors, configuration, metrics and mutation events shared by
//! the cache and analytics crates. This crate holds data types only; the
//! caching and ranking logic lives in `capital-storage` and
//! `capital-analytics`.

pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod labels;
pub mod metric;

pub use config::{
    CacheConfig, RefreshConfig, DEFAULT_BATCH_SIZE, DEFAULT_LIST_LENGTH,
    DEFAULT_REFRESH_INTERVAL_SECS,
};
pub use error::{CapitalError, CapitalResult, ConfigError, HookError, StoreError, StoreResult};
pub use event::{AccountMutation, BalanceEvent, TransactionEvent};
pub use identity::{AccountId, Balance, PlayerId, Timestamp};
pub use labels::{LabelSelector, Labels};
pub use metric::{BalanceMetric, MetricValue};
