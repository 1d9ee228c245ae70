//! Error types for CAPITAL operations

use thiserror::Error;

/// Backing store errors.
///
/// A key that does not exist in the store is not an error; lookups report it
/// as absence instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Backing store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Query failed: {reason}")]
    QueryFailed { reason: String },

    #[error("Fetch for {key} aborted before completion")]
    FetchAborted { key: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Shorthand for a failed query.
    pub fn query(reason: impl Into<String>) -> Self {
        Self::QueryFailed {
            reason: reason.into(),
        }
    }

    /// Shorthand for an unreachable store.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Failure raised by a cache policy notification hook.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Hook {hook} failed: {reason}")]
pub struct HookError {
    pub hook: String,
    pub reason: String,
}

/// Master error type for all CAPITAL errors.
#[derive(Debug, Clone, Error)]
pub enum CapitalError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Hook error: {0}")]
    Hook(#[from] HookError),
}

/// Result type alias for CAPITAL operations.
pub type CapitalResult<T> = Result<T, CapitalError>;

/// Result type alias for backing store round trips.
pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display_query_failed() {
        let err = StoreError::query("syntax error near SELECT");
        let msg = format!("{}", err);
        assert!(msg.contains("Query failed"));
        assert!(msg.contains("syntax error"));
    }

    #[test]
    fn test_store_error_display_fetch_aborted() {
        let err = StoreError::FetchAborted {
            key: "acc-1".to_string(),
        };
        assert!(err.to_string().contains("acc-1"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "batch_size".to_string(),
            value: "0".to_string(),
            reason: "must be at least 1".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("batch_size"));
        assert!(msg.contains("0"));
        assert!(msg.contains("must be at least 1"));
    }

    #[test]
    fn test_hook_error_display() {
        let err = HookError {
            hook: "on_evict".to_string(),
            reason: "listener already gone".to_string(),
        };
        assert_eq!(err.to_string(), "Hook on_evict failed: listener already gone");
    }

    #[test]
    fn test_capital_error_from_variants() {
        let store = CapitalError::from(StoreError::LockPoisoned);
        assert!(matches!(store, CapitalError::Store(_)));

        let config = CapitalError::from(ConfigError::MissingRequired {
            field: "name".to_string(),
        });
        assert!(matches!(config, CapitalError::Config(_)));

        let hook = CapitalError::from(HookError {
            hook: "on_refresh".to_string(),
            reason: "x".to_string(),
        });
        assert!(matches!(hook, CapitalError::Hook(_)));
    }
}
