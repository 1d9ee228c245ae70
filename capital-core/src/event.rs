//! Balance mutation events reported by the authoritative store.

use crate::{AccountId, Balance, Labels, PlayerId, Timestamp};
use serde::{Deserialize, Serialize};

/// The balance of one account changed to `new_value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMutation {
    pub account: AccountId,
    pub new_value: Balance,
}

impl AccountMutation {
    pub fn new(account: AccountId, new_value: Balance) -> Self {
        Self { account, new_value }
    }
}

/// A completed transfer between two accounts.
///
/// Carries the balances of both sides after the transfer so caches can be
/// refreshed without a store round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub src: AccountId,
    pub dest: AccountId,
    pub amount: Balance,
    pub labels: Labels,
    /// Players probably related to this transaction, used as a hint for
    /// refreshing player-level caches early. Not exhaustive.
    pub involved_players: Vec<PlayerId>,
    pub src_balance: Balance,
    pub dest_balance: Balance,
    pub occurred_at: Timestamp,
}

impl TransactionEvent {
    /// The two balance mutations this transaction implies, source first.
    pub fn mutations(&self) -> [AccountMutation; 2] {
        [
            AccountMutation::new(self.src, self.src_balance),
            AccountMutation::new(self.dest, self.dest_balance),
        ]
    }
}

/// A balance change delivered to cache invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BalanceEvent {
    Mutation(AccountMutation),
    Transaction(TransactionEvent),
}

impl From<AccountMutation> for BalanceEvent {
    fn from(mutation: AccountMutation) -> Self {
        Self::Mutation(mutation)
    }
}

impl From<TransactionEvent> for BalanceEvent {
    fn from(event: TransactionEvent) -> Self {
        Self::Transaction(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_transaction_mutations_source_first() {
        let src = AccountId::now_v7();
        let dest = AccountId::now_v7();
        let event = TransactionEvent {
            src,
            dest,
            amount: 25,
            labels: Labels::new(),
            involved_players: vec![],
            src_balance: 75,
            dest_balance: 125,
            occurred_at: Utc::now(),
        };

        let [first, second] = event.mutations();
        assert_eq!(first, AccountMutation::new(src, 75));
        assert_eq!(second, AccountMutation::new(dest, 125));
    }
}
