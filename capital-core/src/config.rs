//! Configuration types
//!
//! Values are validated here before they reach the cache or the ranking
//! refresher. Each struct can be built from defaults, tweaked with `with_*`
//! builders, or read from `CAPITAL_*` environment variables.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of keys scanned per store round trip.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default delay between the end of one ranking pass and the next.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;

/// Default number of entries kept in a ranking.
pub const DEFAULT_LIST_LENGTH: usize = 5;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn at_least_one(field: &str, value: usize) -> Result<(), ConfigError> {
    if value < 1 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// RANKING REFRESH
// ============================================================================

/// Settings for a periodic top-N ranking refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RefreshConfig {
    /// Keys scanned per store round trip.
    pub batch_size: usize,
    /// Minimum delay between the end of one pass and the start of the next.
    #[serde(with = "duration_secs", rename = "interval-secs")]
    pub interval: Duration,
    /// Number of entries kept in the published ranking.
    pub list_length: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            list_length: DEFAULT_LIST_LENGTH,
        }
    }
}

impl RefreshConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_list_length(mut self, list_length: usize) -> Self {
        self.list_length = list_length;
        self
    }

    /// Create a RefreshConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `CAPITAL_TOP_BATCH_SIZE`: Keys per store round trip (default: 100)
    /// - `CAPITAL_TOP_INTERVAL_SECS`: Delay between passes (default: 60)
    /// - `CAPITAL_TOP_LIST_LENGTH`: Entries kept in the ranking (default: 5)
    ///
    /// Unparseable values fall back to the default; the result still has to
    /// pass [`RefreshConfig::validate`].
    pub fn from_env() -> Self {
        Self {
            batch_size: env_parse("CAPITAL_TOP_BATCH_SIZE").unwrap_or(DEFAULT_BATCH_SIZE),
            interval: Duration::from_secs(
                env_parse("CAPITAL_TOP_INTERVAL_SECS").unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS),
            ),
            list_length: env_parse("CAPITAL_TOP_LIST_LENGTH").unwrap_or(DEFAULT_LIST_LENGTH),
        }
    }

    /// Reject a zero batch size or list length.
    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least_one("batch_size", self.batch_size)?;
        at_least_one("list_length", self.list_length)?;
        Ok(())
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Settings for a cache engine instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CacheConfig {
    /// Entries older than this are dropped when next accessed.
    /// `None` keeps entries until they are evicted explicitly.
    #[serde(with = "opt_duration_secs", rename = "entry-ttl-secs")]
    pub entry_ttl: Option<Duration>,
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = Some(ttl);
        self
    }

    /// Create a CacheConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `CAPITAL_CACHE_TTL_SECS`: Entry time-to-live; unset or `0` disables expiry
    pub fn from_env() -> Self {
        let entry_ttl = env_parse::<u64>("CAPITAL_CACHE_TTL_SECS")
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs);
        Self { entry_ttl }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entry_ttl == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                field: "entry_ttl".to_string(),
                value: "0".to_string(),
                reason: "use no ttl instead of a zero ttl".to_string(),
            });
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
