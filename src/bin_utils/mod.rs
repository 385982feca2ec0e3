//! Batch driver: replays ledger operations from CSV against a fresh in-memory
//! ledger and prints the resulting balances as CSV.

use std::{
    io::{Read, Write},
    sync::Arc,
};

use crate::{
    account::Account,
    command::PageRequest,
    config::LedgerConfig,
    error::ErrorKind,
    registry::{AccountError, AccountRegistry},
    store::{LedgerStore, in_memory_store::InMemoryLedgerStore},
    transfer::{TransferEngine, TransferError},
};
use anyhow::Result;
use csv_parser::{CsvOperationParser, Operation, OperationKind};
use csv_printer::{AccountRow, print_accounts};
use thiserror::Error;
pub mod csv_parser;
pub mod csv_printer;

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("Malformed row: {0}")]
    Malformed(#[from] csv::Error),
    #[error("Missing `{field}` for {kind:?}")]
    MissingField {
        kind: OperationKind,
        field: &'static str,
    },
    #[error(transparent)]
    AccountErr(#[from] AccountError),
    #[error(transparent)]
    TransferErr(#[from] TransferError),
}

impl OperationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OperationError::Malformed(_) | OperationError::MissingField { .. } => {
                ErrorKind::Validation
            }
            OperationError::AccountErr(err) => err.kind(),
            OperationError::TransferErr(err) => err.kind(),
        }
    }
}

pub struct Service<'w, R, W: 'w> {
    pub input: R,
    pub output: &'w mut W,
    pub config: LedgerConfig,
    pub error_printer: Box<dyn FnMut(u64, OperationError)>,
}

impl<'w, R, W> Service<'w, R, W>
where
    R: Read,
    W: Write + 'w,
{
    pub fn run(mut self) -> Result<()> {
        let store = Arc::new(InMemoryLedgerStore::new(self.config));
        let registry = AccountRegistry::new(Arc::clone(&store));
        let engine = TransferEngine::new(store);

        for (line, row) in CsvOperationParser::new(self.input) {
            let result = row
                .map_err(OperationError::from)
                .and_then(|operation| apply(&registry, &engine, operation));
            if let Err(err) = result {
                (self.error_printer)(line, err);
            }
        }

        let mut accounts = all_accounts(&registry)?;
        accounts.sort_by_key(|account| account.id);
        print_accounts(self.output, accounts.into_iter().map(AccountRow::from))
    }
}

fn apply<S: LedgerStore>(
    registry: &AccountRegistry<S>,
    engine: &TransferEngine<S>,
    operation: Operation,
) -> Result<(), OperationError> {
    let kind = operation.kind;
    match kind {
        OperationKind::Open => {
            let owner = required(operation.owner.as_deref(), kind, "owner")?;
            registry.create_account(
                owner,
                operation.currency.as_deref(),
                operation.amount.unwrap_or(0),
            )?;
        }
        OperationKind::Transfer => {
            engine.create_transfer(
                required(operation.account, kind, "account")?,
                required(operation.to, kind, "to")?,
                required(operation.amount, kind, "amount")?,
            )?;
        }
        OperationKind::Adjust => {
            registry.update_account(
                required(operation.account, kind, "account")?,
                required(operation.amount, kind, "amount")?,
            )?;
        }
        OperationKind::Close => {
            registry.delete_account(required(operation.account, kind, "account")?)?;
        }
    }
    Ok(())
}

fn required<T>(
    value: Option<T>,
    kind: OperationKind,
    field: &'static str,
) -> Result<T, OperationError> {
    value.ok_or(OperationError::MissingField { kind, field })
}

fn all_accounts<S: LedgerStore>(registry: &AccountRegistry<S>) -> Result<Vec<Account>> {
    let mut accounts = Vec::new();
    // oversized pages are clamped to the configured maximum
    for page in 1.. {
        let batch = registry.list_accounts(PageRequest::new(page, u32::MAX))?;
        if batch.is_empty() {
            break;
        }
        accounts.extend(batch);
    }
    Ok(accounts)
}
