use std::io::Read;

use crate::account::{AccountId, Amount};
use csv::{DeserializeRecordsIntoIter, Trim};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Create an account: `owner`, optional `currency`, `amount` as opening balance.
    Open,
    /// Move `amount` from `account` to `to`.
    Transfer,
    /// Administrative correction of `account` balance to `amount`.
    Adjust,
    /// Delete `account`.
    Close,
}

#[derive(Debug, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub owner: Option<String>,
    pub currency: Option<String>,
    pub account: Option<AccountId>,
    pub to: Option<AccountId>,
    pub amount: Option<Amount>,
}

/// Parses ledger operations in CSV format. Yields the line number of each
/// row alongside the parsed row, malformed rows come back as errors.
pub struct CsvOperationParser<R> {
    iter: DeserializeRecordsIntoIter<R, Operation>,
}

impl<R> CsvOperationParser<R>
where
    R: Read,
{
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(source);

        Self {
            iter: reader.into_deserialize(),
        }
    }
}

impl<R> Iterator for CsvOperationParser<R>
where
    R: Read,
{
    type Item = (u64, Result<Operation, csv::Error>);

    fn next(&mut self) -> Option<Self::Item> {
        let curr_line = self.iter.reader().position().line();
        self.iter.next().map(|row| (curr_line, row))
    }
}
