//! Published rankings and the publisher that swaps them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::watch;

/// One ranked row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankEntry<K, V> {
    /// 1-based position.
    pub rank: usize,
    pub key: K,
    pub value: V,
}

/// An immutable ranking, best first.
///
/// Snapshots are never edited in place; a newer pass replaces the whole
/// snapshot, so readers always see one pass's complete result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankingSnapshot<K, V> {
    entries: Vec<RankEntry<K, V>>,
    computed_at: DateTime<Utc>,
}

impl<K, V> RankingSnapshot<K, V> {
    pub fn new(entries: Vec<RankEntry<K, V>>, computed_at: DateTime<Utc>) -> Self {
        Self {
            entries,
            computed_at,
        }
    }

    /// The ranking shown before any pass completed.
    pub fn empty() -> Self {
        Self::new(Vec::new(), DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn entries(&self) -> &[RankEntry<K, V>] {
        &self.entries
    }

    pub fn computed_at(&self) -> DateTime<Utc> {
        self.computed_at
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The first-ranked entry.
    pub fn leader(&self) -> Option<&RankEntry<K, V>> {
        self.entries.first()
    }

    /// `(key, value)` pairs best first.
    pub fn pairs(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|e| (&e.key, &e.value))
    }

    pub fn rank_of(&self, key: &K) -> Option<usize>
    where
        K: PartialEq,
    {
        self.entries.iter().find(|e| &e.key == key).map(|e| e.rank)
    }
}

impl<K: Display, V: Display> RankingSnapshot<K, V> {
    /// One `#rank key: value` line per entry, for chat-style output.
    pub fn render_lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| format!("#{} {}: {}", e.rank, e.key, e.value))
            .collect()
    }
}

/// Latest-wins holder of the current ranking.
///
/// Publishing is a single pointer swap; readers never block the refresher
/// and never see a half-built ranking. Clones share the same channel.
#[derive(Debug)]
pub struct RankingPublisher<K, V> {
    sender: Arc<watch::Sender<Arc<RankingSnapshot<K, V>>>>,
}

impl<K, V> Clone for RankingPublisher<K, V> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
        }
    }
}

impl<K, V> Default for RankingPublisher<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> RankingPublisher<K, V> {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(Arc::new(RankingSnapshot::empty()));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Replace the current ranking, returning the previous one.
    pub fn publish(&self, snapshot: RankingSnapshot<K, V>) -> Arc<RankingSnapshot<K, V>> {
        self.sender.send_replace(Arc::new(snapshot))
    }

    /// The latest published ranking. Never suspends.
    pub fn current(&self) -> Arc<RankingSnapshot<K, V>> {
        Arc::clone(&self.sender.borrow())
    }

    /// Receiver notified on every publish.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RankingSnapshot<K, V>>> {
        self.sender.subscribe()
    }
}
