use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::{
    account::{
        Account, AccountId, Amount, Entry, EntryId, NewAccount, NewEntry, NewTransfer, Transfer,
        TransferId,
    },
    command::Page,
    config::LedgerConfig,
    error::ErrorKind,
};

pub mod in_memory_store;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Timed out waiting for the lock on account {0}")]
    LockTimeout(AccountId),
    #[error("Account {0} must be locked in the current transaction before it is modified")]
    NotLocked(AccountId),
    #[error("Account {0} does not exist")]
    AccountNotFound(AccountId),
    #[error("Owner `{owner}` already has an account in {currency}")]
    DuplicateAccount { owner: String, currency: String },
    #[error("Balance of account {account} would become negative ({balance})")]
    NegativeBalance { account: AccountId, balance: Amount },
    #[error("Gave up waiting for the lock on account {0}")]
    Cancelled(AccountId),
    #[error("Storage backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::AccountNotFound(_) => ErrorKind::NotFound,
            StoreError::DuplicateAccount { .. } | StoreError::NegativeBalance { .. } => {
                ErrorKind::Conflict
            }
            StoreError::LockTimeout(_)
            | StoreError::Cancelled(_)
            | StoreError::NotLocked(_)
            | StoreError::Backend(_) => ErrorKind::Storage,
        }
    }
}

/// Operations available inside one atomic unit of [`LedgerStore::run_atomic`].
///
/// Nothing done through a transaction is visible to other callers before it
/// commits, and nothing survives if it rolls back.
pub trait LedgerTx {
    /// Takes the exclusive row lock for `id` and returns the row as seen by
    /// this transaction. Blocks while another transaction holds the lock.
    ///
    /// Locking an id that doesn't exist still takes the lock and returns `None`.
    fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Like [`LedgerTx::lock_account`], but stops waiting with
    /// [`StoreError::Cancelled`] once `cancel` is raised.
    ///
    /// The default only looks at the flag before blocking; stores whose lock
    /// wait can be interrupted should override it.
    fn lock_account_cancellable(
        &mut self,
        id: AccountId,
        cancel: &AtomicBool,
    ) -> Result<Option<Account>, StoreError> {
        if cancel.load(Ordering::Acquire) {
            return Err(StoreError::Cancelled(id));
        }
        self.lock_account(id)
    }

    /// Overwrites the balance of a row locked by this transaction.
    /// Owner and currency are immutable and ignored.
    fn write_account(&mut self, account: &Account) -> Result<(), StoreError>;

    fn insert_account(&mut self, account: NewAccount) -> Result<Account, StoreError>;

    /// Removes a row locked by this transaction. Entries and transfers that
    /// reference it are left untouched.
    fn delete_account(&mut self, id: AccountId) -> Result<(), StoreError>;

    fn insert_entry(&mut self, entry: NewEntry) -> Result<Entry, StoreError>;

    fn insert_transfer(&mut self, transfer: NewTransfer) -> Result<Transfer, StoreError>;
}

/// Durable home of accounts, entries and transfers.
///
/// Implementations must enforce two constraints at commit time: a unique
/// `(owner, currency)` pair per account, and a non-negative balance.
pub trait LedgerStore: Send + Sync {
    /// Settings the store was built with. Registry and engine read paging
    /// and defaults from here so they never disagree with the store.
    fn config(&self) -> &LedgerConfig;

    /// Runs `f` as one transaction. An `Err` from `f` rolls back every write
    /// made through the transaction; `Ok` commits all of them at once.
    fn run_atomic<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, E>,
        E: From<StoreError>;

    fn account(&self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Most recently created first.
    fn accounts(&self, page: Page) -> Result<Vec<Account>, StoreError>;

    /// Most recently created first.
    fn accounts_by_owner(&self, owner: &str, page: Page) -> Result<Vec<Account>, StoreError>;

    fn entry(&self, id: EntryId) -> Result<Option<Entry>, StoreError>;

    /// Most recent first.
    fn entries_by_account(
        &self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Entry>, StoreError>;

    fn transfer(&self, id: TransferId) -> Result<Option<Transfer>, StoreError>;

    /// Transfers where the account is either source or destination, most
    /// recent first.
    fn transfers_by_account(
        &self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Transfer>, StoreError>;
}
