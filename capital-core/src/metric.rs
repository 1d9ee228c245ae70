//! Balance statistics used to reduce a set of account balances to one
//! rankable number.

use crate::{Balance, ConfigError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A totally ordered floating point metric result.
///
/// Ordering follows [`f64::total_cmp`], so `NaN` sorts above every number
/// instead of poisoning comparisons.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricValue(pub f64);

impl MetricValue {
    pub fn get(self) -> f64 {
        self.0
    }
}

impl PartialEq for MetricValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MetricValue {}

impl PartialOrd for MetricValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MetricValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The statistic used to combine the balances of several accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalanceMetric {
    /// The number of accounts selected.
    AccountCount,
    /// The sum of the balances.
    #[default]
    BalanceSum,
    /// The arithmetic mean of the balances.
    BalanceMean,
    /// Population variance: mean of squares minus square of the mean.
    BalanceVariance,
    /// The smallest balance.
    BalanceMin,
    /// The largest balance.
    BalanceMax,
}

impl BalanceMetric {
    pub const ALL: [BalanceMetric; 6] = [
        BalanceMetric::AccountCount,
        BalanceMetric::BalanceSum,
        BalanceMetric::BalanceMean,
        BalanceMetric::BalanceVariance,
        BalanceMetric::BalanceMin,
        BalanceMetric::BalanceMax,
    ];

    /// Configuration name of this metric.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccountCount => "account-count",
            Self::BalanceSum => "balance-sum",
            Self::BalanceMean => "balance-mean",
            Self::BalanceVariance => "balance-variance",
            Self::BalanceMin => "balance-min",
            Self::BalanceMax => "balance-max",
        }
    }

    /// Whether the metric only depends on which accounts exist, not on their
    /// balances.
    pub fn uses_id_only(&self) -> bool {
        matches!(self, Self::AccountCount)
    }

    /// Reduce `balances` with this metric.
    ///
    /// Returns `None` for an empty input, except for [`Self::AccountCount`]
    /// which counts zero accounts.
    pub fn apply(&self, balances: &[Balance]) -> Option<MetricValue> {
        if balances.is_empty() {
            return match self {
                Self::AccountCount => Some(MetricValue(0.0)),
                _ => None,
            };
        }

        let n = balances.len() as f64;
        let value = match self {
            Self::AccountCount => n,
            Self::BalanceSum => balances.iter().map(|&b| b as f64).sum(),
            Self::BalanceMean => balances.iter().map(|&b| b as f64).sum::<f64>() / n,
            Self::BalanceVariance => {
                let mean = balances.iter().map(|&b| b as f64).sum::<f64>() / n;
                let mean_sq = balances.iter().map(|&b| (b as f64) * (b as f64)).sum::<f64>() / n;
                mean_sq - mean * mean
            }
            Self::BalanceMin => *balances.iter().min()? as f64,
            Self::BalanceMax => *balances.iter().max()? as f64,
        };
        Some(MetricValue(value))
    }
}

impl fmt::Display for BalanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BalanceMetric {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|metric| metric.as_str() == s)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "metric".to_string(),
                value: s.to_string(),
                reason: "expected one of account-count, balance-sum, balance-mean, \
                         balance-variance, balance-min, balance-max"
                    .to_string(),
            })
    }
}
