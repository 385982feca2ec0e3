use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::{
    account::{Account, AccountId, Amount, Entry, EntryId, NewAccount, NewEntry},
    command::{CommandError, CreateAccountCommand, PageRequest, UpdateBalanceCommand},
    error::ErrorKind,
    store::{LedgerStore, StoreError},
};

#[derive(Debug, Error)]
pub enum AccountError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("Account {0} not found")]
    AccountNotFound(AccountId),
    #[error("Entry {0} not found")]
    EntryNotFound(EntryId),
    #[error("Owner `{owner}` already has an account in {currency}")]
    DuplicateAccount { owner: String, currency: String },
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for AccountError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccountNotFound(id) => AccountError::AccountNotFound(id),
            StoreError::DuplicateAccount { owner, currency } => {
                AccountError::DuplicateAccount { owner, currency }
            }
            err => AccountError::Store(err),
        }
    }
}

impl AccountError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AccountError::Command(err) => err.kind(),
            AccountError::AccountNotFound(_) | AccountError::EntryNotFound(_) => {
                ErrorKind::NotFound
            }
            AccountError::DuplicateAccount { .. } => ErrorKind::Conflict,
            AccountError::Store(err) => err.kind(),
        }
    }
}

/// Account lifecycle on top of a [`LedgerStore`].
///
/// Every balance change made here is paired with an entry in the same
/// transaction, so an account's balance always equals the sum of its entries.
#[derive(Debug)]
pub struct AccountRegistry<S> {
    store: Arc<S>,
}

impl<S> Clone for AccountRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LedgerStore> AccountRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Opens an account together with its opening entry.
    ///
    /// A missing currency falls back to the configured default. The
    /// `(owner, currency)` pair must be unused, which the store checks at
    /// commit so concurrent callers cannot both succeed.
    pub fn create_account(
        &self,
        owner: &str,
        currency: Option<&str>,
        initial_balance: Amount,
    ) -> Result<Account, AccountError> {
        let command =
            CreateAccountCommand::parse(owner, currency, initial_balance, self.store.config())?;

        let account = self
            .store
            .run_atomic(|tx| -> Result<Account, AccountError> {
                let account = tx.insert_account(NewAccount {
                    owner: command.owner.clone(),
                    currency: command.currency.clone(),
                    balance: command.initial_balance,
                })?;
                tx.insert_entry(NewEntry {
                    account_id: account.id,
                    amount: command.initial_balance,
                })?;
                Ok(account)
            })?;

        info!(
            account_id = account.id,
            owner = %account.owner,
            currency = %account.currency,
            balance = account.balance,
            "Account created"
        );
        Ok(account)
    }

    pub fn get_account(&self, id: AccountId) -> Result<Account, AccountError> {
        self.store
            .account(id)?
            .ok_or(AccountError::AccountNotFound(id))
    }

    pub fn list_accounts(&self, page: PageRequest) -> Result<Vec<Account>, AccountError> {
        Ok(self.store.accounts(page.resolve(self.store.config()))?)
    }

    pub fn get_accounts_by_owner(
        &self,
        owner: &str,
        page: PageRequest,
    ) -> Result<Vec<Account>, AccountError> {
        Ok(self
            .store
            .accounts_by_owner(owner, page.resolve(self.store.config()))?)
    }

    /// Administrative balance correction.
    ///
    /// Writes a corrective entry for the difference in the same transaction,
    /// nothing is written when the balance is already `balance`.
    pub fn update_account(
        &self,
        id: AccountId,
        balance: Amount,
    ) -> Result<Account, AccountError> {
        let command = UpdateBalanceCommand::parse(id, balance)?;

        let (account, delta) = self
            .store
            .run_atomic(|tx| -> Result<(Account, Amount), AccountError> {
                let current = tx
                    .lock_account(command.account_id)?
                    .ok_or(AccountError::AccountNotFound(command.account_id))?;
                // both sides are non-negative, the difference can't overflow
                let delta = command.balance - current.balance;
                if delta == 0 {
                    return Ok((current, 0));
                }
                let updated = Account {
                    balance: command.balance,
                    ..current
                };
                tx.write_account(&updated)?;
                tx.insert_entry(NewEntry {
                    account_id: updated.id,
                    amount: delta,
                })?;
                Ok((updated, delta))
            })?;

        info!(
            account_id = account.id,
            balance = account.balance,
            delta,
            "Account balance corrected"
        );
        Ok(account)
    }

    /// Hard delete. Balance is not required to be zero and the account's
    /// entries and transfers stay in place.
    pub fn delete_account(&self, id: AccountId) -> Result<(), AccountError> {
        self.store.run_atomic(|tx| -> Result<(), AccountError> {
            tx.lock_account(id)?
                .ok_or(AccountError::AccountNotFound(id))?;
            tx.delete_account(id)?;
            Ok(())
        })?;

        info!(account_id = id, "Account deleted");
        Ok(())
    }

    pub fn get_entry(&self, id: EntryId) -> Result<Entry, AccountError> {
        self.store.entry(id)?.ok_or(AccountError::EntryNotFound(id))
    }

    pub fn list_entries(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Vec<Entry>, AccountError> {
        Ok(self
            .store
            .entries_by_account(account_id, page.resolve(self.store.config()))?)
    }
}
