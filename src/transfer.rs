use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    account::{Account, AccountId, Amount, NewTransfer, Transfer, TransferId},
    command::{CommandError, PageRequest, TransferCommand},
    error::ErrorKind,
    store::{LedgerStore, LedgerTx, StoreError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => f.write_str("Source"),
            Side::Destination => f.write_str("Destination"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("{side} account {id} not found")]
    AccountNotFound { side: Side, id: AccountId },
    #[error("Accounts have different currencies: {from} and {to}")]
    CurrencyMismatch { from: String, to: String },
    #[error(
        "Insufficient balance in account {account}: {balance} available, {amount} requested"
    )]
    InsufficientBalance {
        account: AccountId,
        balance: Amount,
        amount: Amount,
    },
    #[error("Balance of account {0} would overflow")]
    BalanceOverflow(AccountId),
    #[error("Transfer {0} not found")]
    TransferNotFound(TransferId),
    #[error("Transfer was cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Cancelled(_) => TransferError::Cancelled,
            err => TransferError::Store(err),
        }
    }
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Command(err) => err.kind(),
            TransferError::AccountNotFound { .. } | TransferError::TransferNotFound(_) => {
                ErrorKind::NotFound
            }
            TransferError::CurrencyMismatch { .. }
            | TransferError::InsufficientBalance { .. }
            | TransferError::BalanceOverflow(_) => ErrorKind::Conflict,
            TransferError::Cancelled => ErrorKind::Storage,
            TransferError::Store(err) => err.kind(),
        }
    }
}

/// Moves money between two accounts of the same currency.
///
/// Each transfer runs as one store transaction: both balance writes, the
/// transfer record and its debit and credit entries commit together or not
/// at all. Row locks are always taken in ascending account id order, so
/// transfers running in opposite directions over the same pair of accounts
/// cannot deadlock.
#[derive(Debug)]
pub struct TransferEngine<S> {
    store: Arc<S>,
}

impl<S> Clone for TransferEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LedgerStore> TransferEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn create_transfer(
        &self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Amount,
    ) -> Result<Transfer, TransferError> {
        self.execute(from_account_id, to_account_id, amount, None)
    }

    /// Like [`TransferEngine::create_transfer`], but gives up with
    /// [`TransferError::Cancelled`] when `cancel` is raised while waiting for
    /// a row lock, once both locks are held, or right before commit. Nothing
    /// is written in that case.
    pub fn create_transfer_cancellable(
        &self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Amount,
        cancel: &AtomicBool,
    ) -> Result<Transfer, TransferError> {
        self.execute(from_account_id, to_account_id, amount, Some(cancel))
    }

    pub fn get_transfer(&self, id: TransferId) -> Result<Transfer, TransferError> {
        self.store
            .transfer(id)?
            .ok_or(TransferError::TransferNotFound(id))
    }

    /// Transfers in or out of `account_id`, most recent first.
    pub fn list_transfers(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Vec<Transfer>, TransferError> {
        Ok(self
            .store
            .transfers_by_account(account_id, page.resolve(self.store.config()))?)
    }

    fn execute(
        &self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Amount,
        cancel: Option<&AtomicBool>,
    ) -> Result<Transfer, TransferError> {
        let command = TransferCommand::parse(from_account_id, to_account_id, amount)?;

        let result = self
            .store
            .run_atomic(|tx| -> Result<Transfer, TransferError> {
                let [first, second] = command.lock_order();
                let first_row = lock(tx, first, cancel)?;
                let second_row = lock(tx, second, cancel)?;
                let (source, destination) = if first == command.from_account_id {
                    (first_row, second_row)
                } else {
                    (second_row, first_row)
                };
                check_cancelled(cancel)?;

                let source = source.ok_or(TransferError::AccountNotFound {
                    side: Side::Source,
                    id: command.from_account_id,
                })?;
                let destination = destination.ok_or(TransferError::AccountNotFound {
                    side: Side::Destination,
                    id: command.to_account_id,
                })?;
                if source.currency != destination.currency {
                    return Err(TransferError::CurrencyMismatch {
                        from: source.currency,
                        to: destination.currency,
                    });
                }
                if source.balance < command.amount {
                    return Err(TransferError::InsufficientBalance {
                        account: source.id,
                        balance: source.balance,
                        amount: command.amount,
                    });
                }

                let debited = source
                    .with_delta(-command.amount)
                    .ok_or(TransferError::BalanceOverflow(source.id))?;
                let credited = destination
                    .with_delta(command.amount)
                    .ok_or(TransferError::BalanceOverflow(destination.id))?;
                tx.write_account(&debited)?;
                tx.write_account(&credited)?;

                let new_transfer = NewTransfer {
                    from_account_id: command.from_account_id,
                    to_account_id: command.to_account_id,
                    amount: command.amount,
                };
                let transfer = tx.insert_transfer(new_transfer)?;
                for entry in new_transfer.entries() {
                    tx.insert_entry(entry)?;
                }
                check_cancelled(cancel)?;
                Ok(transfer)
            });

        match &result {
            Ok(transfer) => info!(
                transfer_id = transfer.id,
                from = transfer.from_account_id,
                to = transfer.to_account_id,
                amount = transfer.amount,
                "Transfer committed"
            ),
            Err(err) if err.kind() == ErrorKind::Storage => warn!(
                from = from_account_id,
                to = to_account_id,
                amount,
                "Transfer failed: {err}"
            ),
            Err(err) => debug!(
                from = from_account_id,
                to = to_account_id,
                amount,
                kind = ?err.kind(),
                "Transfer rejected: {err}"
            ),
        }
        result
    }
}

fn lock(
    tx: &mut dyn LedgerTx,
    id: AccountId,
    cancel: Option<&AtomicBool>,
) -> Result<Option<Account>, StoreError> {
    match cancel {
        Some(flag) => tx.lock_account_cancellable(id, flag),
        None => tx.lock_account(id),
    }
}

fn check_cancelled(cancel: Option<&AtomicBool>) -> Result<(), TransferError> {
    match cancel {
        Some(flag) if flag.load(Ordering::Acquire) => Err(TransferError::Cancelled),
        _ => Ok(()),
    }
}
