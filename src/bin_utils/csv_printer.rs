use std::io::Write;

use crate::account::{Account, AccountId, Amount};
use anyhow::Context;
use csv::Writer;
use serde::Serialize;

/// Output shape of a single account, `created_at` is left out.
#[derive(Debug, Serialize)]
pub struct AccountRow {
    pub id: AccountId,
    pub owner: String,
    pub currency: String,
    pub balance: Amount,
}

impl From<Account> for AccountRow {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            owner: account.owner,
            currency: account.currency,
            balance: account.balance,
        }
    }
}

pub fn print_accounts<W>(
    output: &mut W,
    accounts: impl Iterator<Item = AccountRow>,
) -> anyhow::Result<()>
where
    W: Write,
{
    let mut writer = Writer::from_writer(output);
    for row in accounts {
        let id = row.id;
        writer
            .serialize(row)
            .with_context(|| format!("Failed to write account {id} to CSV"))?;
    }
    writer.flush().context("Failed to flush CSV writer")
}
