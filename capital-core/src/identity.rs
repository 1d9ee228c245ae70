//! Identity types for CAPITAL accounts and players

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Account balance in the smallest currency unit.
pub type Balance = i64;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Wrap an existing UUID.
            pub const fn new(id: Uuid) -> Self {
                Self(id)
            }

            /// Generate a new timestamp-sortable (UUIDv7) identifier.
            pub fn now_v7() -> Self {
                Self(Uuid::now_v7())
            }

            /// The nil identifier.
            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Canonical string form: hyphenated lowercase UUID.
            pub fn canonical(&self) -> String {
                self.0.as_hyphenated().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0.as_hyphenated(), f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a single balance-holding account.
    AccountId
);

uuid_id!(
    /// Identifier of a player owning one or more accounts.
    PlayerId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_is_lowercase_hyphenated() {
        let id = AccountId::new(Uuid::from_u128(0xABCD_EF01_2345_6789_ABCD_EF01_2345_6789));
        assert_eq!(id.canonical(), "abcdef01-2345-6789-abcd-ef0123456789");
        assert_eq!(id.to_string(), id.canonical());
    }

    #[test]
    fn test_parse_roundtrips_canonical_form() {
        let id = PlayerId::now_v7();
        let parsed: PlayerId = id.canonical().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_uppercase_input_projects_to_same_canonical() {
        let lower: AccountId = "abcdef01-2345-6789-abcd-ef0123456789".parse().unwrap();
        let upper: AccountId = "ABCDEF01-2345-6789-ABCD-EF0123456789".parse().unwrap();
        assert_eq!(lower.canonical(), upper.canonical());
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = AccountId::nil();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00000000-0000-0000-0000-000000000000\"");
    }
}
