//! Per-player metric cache policy.
//!
//! Each player is summarized by one [`BalanceMetric`] over the balances of
//! the accounts they own that match a label selector. A player the store
//! does not know, or one whose selection yields no value, is reported as
//! not found.

use async_trait::async_trait;
use capital_core::{BalanceMetric, LabelSelector, MetricValue, PlayerId, StoreResult};
use std::collections::HashMap;
use std::sync::Arc;

use super::engine::CacheEngine;
use super::policy::CachePolicy;
use crate::store::BalanceStore;

pub struct PlayerMetricPolicy<S> {
    store: Arc<S>,
    metric: BalanceMetric,
    selector: LabelSelector,
}

impl<S: BalanceStore> PlayerMetricPolicy<S> {
    pub fn new(store: Arc<S>, metric: BalanceMetric, selector: LabelSelector) -> Self {
        Self {
            store,
            metric,
            selector,
        }
    }

    pub fn metric(&self) -> BalanceMetric {
        self.metric
    }

    pub fn selector(&self) -> &LabelSelector {
        &self.selector
    }
}

#[async_trait]
impl<S: BalanceStore + 'static> CachePolicy for PlayerMetricPolicy<S> {
    type Key = PlayerId;
    type Value = MetricValue;

    fn project_key(&self, key: &PlayerId) -> String {
        key.canonical()
    }

    async fn fetch_one(&self, key: &PlayerId) -> StoreResult<Option<MetricValue>> {
        let values = self.store.player_account_values(*key, &self.selector).await?;
        Ok(values.and_then(|values| self.metric.apply(&values)))
    }

    async fn fetch_many(&self, keys: &[PlayerId]) -> StoreResult<HashMap<PlayerId, MetricValue>> {
        let values = self
            .store
            .players_account_values(keys, &self.selector)
            .await?;
        Ok(values
            .into_iter()
            .filter_map(|(player, values)| self.metric.apply(&values).map(|v| (player, v)))
            .collect())
    }
}

/// Cache of per-player metric values.
pub type PlayerMetricCache<S> = CacheEngine<PlayerMetricPolicy<S>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AccountRecord, InMemoryBalanceStore};
    use capital_core::{AccountId, Balance, Labels};
    use uuid::Uuid;

    fn account(n: u128) -> AccountId {
        AccountId::new(Uuid::from_u128(n))
    }

    fn player(n: u128) -> PlayerId {
        PlayerId::new(Uuid::from_u128(n))
    }

    fn seed(store: &InMemoryBalanceStore, id: u128, owner: PlayerId, value: Balance, kind: &str) {
        let mut labels = Labels::new();
        labels.insert("kind".to_string(), kind.to_string());
        store
            .insert_account(
                account(id),
                AccountRecord {
                    owner: Some(owner),
                    value,
                    labels,
                },
            )
            .unwrap();
    }

    fn store() -> Arc<InMemoryBalanceStore> {
        let store = InMemoryBalanceStore::new();
        seed(&store, 1, player(1), 100, "wallet");
        seed(&store, 2, player(1), 50, "wallet");
        seed(&store, 3, player(1), 1_000, "bank");
        seed(&store, 4, player(2), 70, "wallet");
        seed(&store, 5, player(3), 5, "bank");
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_sum_over_selected_accounts() {
        let selector = LabelSelector::new().with("kind", "wallet");
        let cache = CacheEngine::with_defaults(PlayerMetricPolicy::new(
            store(),
            BalanceMetric::BalanceSum,
            selector,
        ));

        assert_eq!(cache.get(&player(1)).await.unwrap(), Some(MetricValue(150.0)));
        assert_eq!(cache.get(&player(2)).await.unwrap(), Some(MetricValue(70.0)));
    }

    #[tokio::test]
    async fn test_unknown_and_empty_selection_are_not_found() {
        let selector = LabelSelector::new().with("kind", "wallet");
        let cache = CacheEngine::with_defaults(PlayerMetricPolicy::new(
            store(),
            BalanceMetric::BalanceMax,
            selector,
        ));

        assert_eq!(cache.get(&player(3)).await.unwrap(), None);
        assert_eq!(cache.get(&player(99)).await.unwrap(), None);

        let values = cache
            .get_many(vec![player(1), player(3), player(99)])
            .await
            .unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[&player(1)], MetricValue(100.0));
    }

    #[tokio::test]
    async fn test_account_count_of_empty_selection_is_zero() {
        let selector = LabelSelector::new().with("kind", "wallet");
        let cache = CacheEngine::with_defaults(PlayerMetricPolicy::new(
            store(),
            BalanceMetric::AccountCount,
            selector,
        ));

        assert_eq!(cache.get(&player(3)).await.unwrap(), Some(MetricValue(0.0)));
        assert_eq!(cache.get(&player(1)).await.unwrap(), Some(MetricValue(2.0)));
    }
}
