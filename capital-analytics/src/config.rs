//! Top-player query configuration
//!
//! Each entry under `top-player-commands` describes one ranking of players:
//! which of their accounts count, how their balances are combined, how many
//! players are listed, and how the ranking is refreshed.
//!
//! ```toml
//! [top-player-commands.richest]
//! list-length = 5
//! metric = "balance-sum"
//! selector = { currency = "coins" }
//!
//! [top-player-commands.richest.refresh]
//! batch-size = 100
//! interval-secs = 60
//! ```

use capital_core::{
    BalanceMetric, CacheConfig, ConfigError, LabelSelector, RefreshConfig, DEFAULT_LIST_LENGTH,
};
use capital_storage::{BalanceStore, CacheEngine, PlayerKeySource, PlayerMetricPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::PlayerRanking;

/// Name of the query written into a fresh configuration.
pub const EXAMPLE_QUERY: &str = "richest";

/// One top-player ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TopQueryConfig {
    /// Filled from the table key on load.
    #[serde(skip)]
    pub name: String,
    /// Number of players listed. Overrides `refresh.list-length`.
    pub list_length: usize,
    pub metric: BalanceMetric,
    /// Only accounts carrying every listed label count.
    pub selector: LabelSelector,
    pub refresh: RefreshConfig,
}

impl Default for TopQueryConfig {
    fn default() -> Self {
        Self {
            name: EXAMPLE_QUERY.to_string(),
            list_length: DEFAULT_LIST_LENGTH,
            metric: BalanceMetric::default(),
            selector: LabelSelector::default(),
            refresh: RefreshConfig::default(),
        }
    }
}

impl TopQueryConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_metric(mut self, metric: BalanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_list_length(mut self, list_length: usize) -> Self {
        self.list_length = list_length;
        self
    }

    pub fn with_refresh(mut self, refresh: RefreshConfig) -> Self {
        self.refresh = refresh;
        self
    }

    /// Refresh settings with this query's list length applied.
    pub fn refresh_config(&self) -> RefreshConfig {
        self.refresh.clone().with_list_length(self.list_length)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "name".to_string(),
            });
        }
        self.refresh_config().validate()
    }

    /// Wire a player ranking for this query over `store`.
    ///
    /// The ranking reads through its own player metric cache.
    pub fn build_ranking<S: BalanceStore + 'static>(
        &self,
        store: Arc<S>,
        cache_config: CacheConfig,
    ) -> Result<PlayerRanking<S>, ConfigError> {
        self.validate()?;
        cache_config.validate()?;
        let policy = PlayerMetricPolicy::new(Arc::clone(&store), self.metric, self.selector.clone());
        let cache = CacheEngine::new(policy, cache_config);
        PlayerRanking::new(
            self.name.clone(),
            cache,
            PlayerKeySource::new(store),
            self.refresh_config(),
        )
    }
}

/// Analytics section of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AnalyticsConfig {
    pub top_player_commands: BTreeMap<String, TopQueryConfig>,
}

impl Default for AnalyticsConfig {
    /// A configuration holding the example query.
    fn default() -> Self {
        let mut top_player_commands = BTreeMap::new();
        top_player_commands.insert(EXAMPLE_QUERY.to_string(), TopQueryConfig::default());
        Self {
            top_player_commands,
        }
    }
}

impl AnalyticsConfig {
    /// Parse and validate TOML. Missing sections mean no queries.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "kebab-case")]
        struct Raw {
            #[serde(default)]
            top_player_commands: BTreeMap<String, TopQueryConfig>,
        }

        let raw: Raw = toml::from_str(input).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        let top_player_commands = raw
            .top_player_commands
            .into_iter()
            .map(|(name, mut query)| {
                query.name = name.clone();
                (name, query)
            })
            .collect();

        let config = Self {
            top_player_commands,
        };
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&input)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.top_player_commands
            .values()
            .try_for_each(TopQueryConfig::validate)
    }

    pub fn query(&self, name: &str) -> Option<&TopQueryConfig> {
        self.top_player_commands.get(name)
    }
}
