use thiserror::Error;

use crate::{
    account::{AccountId, Amount},
    config::LedgerConfig,
    error::ErrorKind,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Owner must not be empty")]
    EmptyOwner,
    #[error("Balance must not be negative, got {balance}")]
    NegativeBalance { balance: Amount },
    #[error("Transfer amount must be positive, got {amount}")]
    InvalidAmount { amount: Amount },
    #[error("Cannot transfer from account {account} to itself")]
    SameAccount { account: AccountId },
}

impl CommandError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAccountCommand {
    pub owner: String,
    pub currency: String,
    pub initial_balance: Amount,
}

impl CreateAccountCommand {
    pub fn parse(
        owner: &str,
        currency: Option<&str>,
        initial_balance: Amount,
        config: &LedgerConfig,
    ) -> Result<Self, CommandError> {
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(CommandError::EmptyOwner);
        }
        if initial_balance < 0 {
            return Err(CommandError::NegativeBalance {
                balance: initial_balance,
            });
        }
        let currency = match currency.map(str::trim) {
            Some(currency) if !currency.is_empty() => currency,
            _ => config.default_currency.as_str(),
        };
        Ok(Self {
            owner: owner.to_string(),
            currency: currency.to_string(),
            initial_balance,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferCommand {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: Amount,
}

impl TransferCommand {
    pub fn parse(
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Amount,
    ) -> Result<Self, CommandError> {
        if amount <= 0 {
            return Err(CommandError::InvalidAmount { amount });
        }
        if from_account_id == to_account_id {
            return Err(CommandError::SameAccount {
                account: from_account_id,
            });
        }
        Ok(Self {
            from_account_id,
            to_account_id,
            amount,
        })
    }

    /// Both account ids in the order their rows must be locked.
    ///
    /// Ascending id regardless of direction, so opposite transfers between the
    /// same pair never wait on each other in a cycle.
    pub fn lock_order(&self) -> [AccountId; 2] {
        if self.from_account_id < self.to_account_id {
            [self.from_account_id, self.to_account_id]
        } else {
            [self.to_account_id, self.from_account_id]
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateBalanceCommand {
    pub account_id: AccountId,
    pub balance: Amount,
}

impl UpdateBalanceCommand {
    pub fn parse(account_id: AccountId, balance: Amount) -> Result<Self, CommandError> {
        if balance < 0 {
            return Err(CommandError::NegativeBalance { balance });
        }
        Ok(Self {
            account_id,
            balance,
        })
    }
}

/// Raw pagination parameters as received from a caller. Zero means "unset".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

/// Normalized window into a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self { page, page_size }
    }

    pub fn resolve(&self, config: &LedgerConfig) -> Page {
        let page = self.page.max(1) as usize;
        let limit = match self.page_size {
            0 => config.default_page_size,
            size => (size as usize).min(config.max_page_size),
        };
        Page {
            offset: (page - 1) * limit,
            limit,
        }
    }
}
