use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type AccountId = i64;
pub type EntryId = i64;
pub type TransferId = i64;

/// Money in minor units (cents for USD).
pub type Amount = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner: String,
    pub currency: String,
    pub balance: Amount,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Same account with `delta` applied to the balance, or `None` on overflow.
    ///
    /// Does not check for negative results, that is up to the caller.
    pub fn with_delta(&self, delta: Amount) -> Option<Account> {
        let balance = self.balance.checked_add(delta)?;
        Some(Account {
            balance,
            ..self.clone()
        })
    }
}

/// Single signed balance change against one account.
/// Positive amounts are credits, negative amounts are debits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub account_id: AccountId,
    pub amount: Amount,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: Amount,
    pub created_at: DateTime<Utc>,
}

impl Transfer {
    pub fn involves(&self, account_id: AccountId) -> bool {
        self.from_account_id == account_id || self.to_account_id == account_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub owner: String,
    pub currency: String,
    pub balance: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewEntry {
    pub account_id: AccountId,
    pub amount: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewTransfer {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: Amount,
}

impl NewTransfer {
    /// Debit and credit entries that must accompany this transfer.
    pub fn entries(&self) -> [NewEntry; 2] {
        [
            NewEntry {
                account_id: self.from_account_id,
                amount: -self.amount,
            },
            NewEntry {
                account_id: self.to_account_id,
                amount: self.amount,
            },
        ]
    }
}
