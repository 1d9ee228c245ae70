//! CAPITAL Analytics - Periodic Rankings
//!
//! Keeps top-N rankings ("who is the richest player?") fresh without
//! scanning the store on every read. A [`RankingRefresher`] walks the key
//! population in batches through a cache, keeps the best N in a bounded
//! [`TopN`], and swaps the result into a [`RankingPublisher`] that readers
//! query without waiting.

pub mod config;
pub mod refresher;
pub mod snapshot;
pub mod topn;

use capital_storage::{AccountBalancePolicy, AccountKeySource, PlayerKeySource, PlayerMetricPolicy};

pub use config::{AnalyticsConfig, TopQueryConfig, EXAMPLE_QUERY};
pub use refresher::{
    refresh_task, PassReport, RankingRefresher, RefreshCursor, RefreshMetrics,
    RefreshMetricsSnapshot, RefreshPhase,
};
pub use snapshot::{RankEntry, RankingPublisher, RankingSnapshot};
pub use topn::TopN;

/// Ranking of accounts by balance.
pub type AccountRanking<S> = RankingRefresher<AccountBalancePolicy<S>, AccountKeySource<S>>;

/// Ranking of players by a balance metric.
pub type PlayerRanking<S> = RankingRefresher<PlayerMetricPolicy<S>, PlayerKeySource<S>>;
