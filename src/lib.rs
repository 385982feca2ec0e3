/// Accounts, entries and transfers, the records every other module works on.
pub mod account;

/// Validated inputs for registry and engine operations, plus pagination.
/// Everything here is checked before a store transaction is opened.
pub mod command;

/// Ledger settings, loaded from TOML.
pub mod config;

/// Error classification shared across modules.
pub mod error;

/// Storage contract the ledger needs (row locks, atomic transactions,
/// append-only inserts), plus the in-memory implementation.
pub mod store;

/// Account lifecycle: open, read, correct, delete.
pub mod registry;

/// Atomic money movement between accounts.
///
/// NOTE: lock acquisition order is what keeps concurrent opposite transfers
/// from deadlocking, see [`command::TransferCommand::lock_order`].
pub mod transfer;

/// CSV batch driver used by the binary and the integration tests.
pub mod bin_utils;
