use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::atomic::{AtomicBool, AtomicI64, Ordering},
    time::{Duration, Instant},
};

use chrono::Utc;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use crate::{
    account::{
        Account, AccountId, Entry, EntryId, NewAccount, NewEntry, NewTransfer, Transfer,
        TransferId,
    },
    command::Page,
    config::LedgerConfig,
};

use super::{LedgerStore, LedgerTx, StoreError};

/// Committed state. Only ever mutated by [`InMemoryTx::commit`].
#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    /// Unique index over `(owner, currency)`.
    owners: HashMap<(String, String), AccountId>,
    entries: BTreeMap<EntryId, Entry>,
    transfers: BTreeMap<TransferId, Transfer>,
}

/// How often a cancellable lock wait wakes up to look at its flag.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Exclusive per-account locks, held from acquisition until the owning
/// transaction ends.
#[derive(Debug, Default)]
struct RowLocks {
    held: Mutex<HashSet<AccountId>>,
    released: Condvar,
}

impl RowLocks {
    fn acquire(
        &self,
        id: AccountId,
        timeout: Duration,
        cancel: Option<&AtomicBool>,
    ) -> Result<(), StoreError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut held = self.held.lock();
        while held.contains(&id) {
            if cancel.is_some_and(|flag| flag.load(Ordering::Acquire)) {
                debug!(account_id = id, "Row lock wait cancelled");
                return Err(StoreError::Cancelled(id));
            }
            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                warn!(account_id = id, ?timeout, "Row lock wait timed out");
                return Err(StoreError::LockTimeout(id));
            }
            let poll = cancel.and_then(|_| now.checked_add(CANCEL_POLL));
            let wake = match (deadline, poll) {
                (Some(deadline), Some(poll)) => Some(deadline.min(poll)),
                (deadline, poll) => deadline.or(poll),
            };
            match wake {
                Some(wake) => {
                    self.released.wait_until(&mut held, wake);
                }
                None => self.released.wait(&mut held),
            }
        }
        held.insert(id);
        Ok(())
    }

    fn release(&self, ids: &BTreeSet<AccountId>) {
        if ids.is_empty() {
            return;
        }
        let mut held = self.held.lock();
        for id in ids {
            held.remove(id);
        }
        drop(held);
        self.released.notify_all();
    }
}

/// Thread safe [`LedgerStore`] keeping everything in process memory.
///
/// Transactions stage their writes privately and publish them under a single
/// write lock at commit, so readers never observe half of a transaction.
#[derive(Debug)]
pub struct InMemoryLedgerStore {
    tables: RwLock<Tables>,
    row_locks: RowLocks,
    next_account_id: AtomicI64,
    next_entry_id: AtomicI64,
    next_transfer_id: AtomicI64,
    config: LedgerConfig,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

impl InMemoryLedgerStore {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            row_locks: RowLocks::default(),
            next_account_id: AtomicI64::new(1),
            next_entry_id: AtomicI64::new(1),
            next_transfer_id: AtomicI64::new(1),
            config,
        }
    }

    // ids are never reused, rolled back inserts leave gaps
    fn next_id(counter: &AtomicI64) -> i64 {
        counter.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug)]
enum StagedRow {
    Write(Account),
    Delete,
}

pub struct InMemoryTx<'s> {
    store: &'s InMemoryLedgerStore,
    locked: BTreeSet<AccountId>,
    staged: BTreeMap<AccountId, StagedRow>,
    new_accounts: BTreeMap<AccountId, Account>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
    committed: bool,
}

impl<'s> InMemoryTx<'s> {
    fn new(store: &'s InMemoryLedgerStore) -> Self {
        Self {
            store,
            locked: BTreeSet::new(),
            staged: BTreeMap::new(),
            new_accounts: BTreeMap::new(),
            entries: Vec::new(),
            transfers: Vec::new(),
            committed: false,
        }
    }

    /// Row as seen from inside this transaction.
    fn view(&self, id: AccountId) -> Option<Account> {
        if let Some(account) = self.new_accounts.get(&id) {
            return Some(account.clone());
        }
        match self.staged.get(&id) {
            Some(StagedRow::Write(account)) => Some(account.clone()),
            Some(StagedRow::Delete) => None,
            None => self.store.tables.read().accounts.get(&id).cloned(),
        }
    }

    // accounts inserted by this transaction are invisible to everyone else
    fn ensure_locked(&self, id: AccountId) -> Result<(), StoreError> {
        if self.locked.contains(&id) || self.new_accounts.contains_key(&id) {
            Ok(())
        } else {
            Err(StoreError::NotLocked(id))
        }
    }

    fn acquire(&mut self, id: AccountId, cancel: Option<&AtomicBool>) -> Result<(), StoreError> {
        if !self.locked.contains(&id) && !self.new_accounts.contains_key(&id) {
            let timeout = self.store.config.lock_timeout();
            self.store.row_locks.acquire(id, timeout, cancel)?;
            self.locked.insert(id);
            debug!(account_id = id, "Row lock acquired");
        }
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        !self.staged.is_empty()
            || !self.new_accounts.is_empty()
            || !self.entries.is_empty()
            || !self.transfers.is_empty()
    }

    fn check_constraints(&self, tables: &Tables) -> Result<(), StoreError> {
        for row in self.staged.values() {
            if let StagedRow::Write(account) = row {
                if account.balance < 0 {
                    return Err(StoreError::NegativeBalance {
                        account: account.id,
                        balance: account.balance,
                    });
                }
            }
        }

        let mut claimed = HashSet::new();
        for account in self.new_accounts.values() {
            if account.balance < 0 {
                return Err(StoreError::NegativeBalance {
                    account: account.id,
                    balance: account.balance,
                });
            }
            let key = (account.owner.clone(), account.currency.clone());
            let taken = match tables.owners.get(&key) {
                Some(existing) => !matches!(self.staged.get(existing), Some(StagedRow::Delete)),
                None => false,
            };
            if taken || !claimed.insert(key) {
                return Err(StoreError::DuplicateAccount {
                    owner: account.owner.clone(),
                    currency: account.currency.clone(),
                });
            }
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let mut guard = self.store.tables.write();
        let tables = &mut *guard;
        self.check_constraints(tables)?;

        for (id, row) in std::mem::take(&mut self.staged) {
            match row {
                StagedRow::Write(account) => {
                    if let Some(existing) = tables.accounts.get_mut(&id) {
                        existing.balance = account.balance;
                    }
                }
                StagedRow::Delete => {
                    if let Some(removed) = tables.accounts.remove(&id) {
                        tables.owners.remove(&(removed.owner, removed.currency));
                    }
                }
            }
        }
        for (id, account) in std::mem::take(&mut self.new_accounts) {
            tables
                .owners
                .insert((account.owner.clone(), account.currency.clone()), id);
            tables.accounts.insert(id, account);
        }
        let entries = std::mem::take(&mut self.entries);
        let transfers = std::mem::take(&mut self.transfers);
        debug!(
            entries = entries.len(),
            transfers = transfers.len(),
            locked = self.locked.len(),
            "Transaction committed"
        );
        tables
            .entries
            .extend(entries.into_iter().map(|entry| (entry.id, entry)));
        tables
            .transfers
            .extend(transfers.into_iter().map(|transfer| (transfer.id, transfer)));

        self.committed = true;
        Ok(())
    }
}

impl Drop for InMemoryTx<'_> {
    fn drop(&mut self) {
        if !self.committed && self.is_dirty() {
            debug!(locked = self.locked.len(), "Transaction rolled back");
        }
        // only after commit has published, so waiters read the new rows
        self.store.row_locks.release(&self.locked);
    }
}

impl LedgerTx for InMemoryTx<'_> {
    fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        self.acquire(id, None)?;
        Ok(self.view(id))
    }

    fn lock_account_cancellable(
        &mut self,
        id: AccountId,
        cancel: &AtomicBool,
    ) -> Result<Option<Account>, StoreError> {
        self.acquire(id, Some(cancel))?;
        Ok(self.view(id))
    }

    fn write_account(&mut self, account: &Account) -> Result<(), StoreError> {
        self.ensure_locked(account.id)?;
        let Some(mut row) = self.view(account.id) else {
            return Err(StoreError::AccountNotFound(account.id));
        };
        row.balance = account.balance;
        match self.new_accounts.get_mut(&account.id) {
            Some(new_account) => *new_account = row,
            None => {
                self.staged.insert(account.id, StagedRow::Write(row));
            }
        }
        Ok(())
    }

    fn insert_account(&mut self, account: NewAccount) -> Result<Account, StoreError> {
        let account = Account {
            id: InMemoryLedgerStore::next_id(&self.store.next_account_id),
            owner: account.owner,
            currency: account.currency,
            balance: account.balance,
            created_at: Utc::now(),
        };
        self.new_accounts.insert(account.id, account.clone());
        Ok(account)
    }

    fn delete_account(&mut self, id: AccountId) -> Result<(), StoreError> {
        self.ensure_locked(id)?;
        if self.view(id).is_none() {
            return Err(StoreError::AccountNotFound(id));
        }
        if self.new_accounts.remove(&id).is_none() {
            self.staged.insert(id, StagedRow::Delete);
        }
        Ok(())
    }

    fn insert_entry(&mut self, entry: NewEntry) -> Result<Entry, StoreError> {
        let entry = Entry {
            id: InMemoryLedgerStore::next_id(&self.store.next_entry_id),
            account_id: entry.account_id,
            amount: entry.amount,
            created_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    fn insert_transfer(&mut self, transfer: NewTransfer) -> Result<Transfer, StoreError> {
        let transfer = Transfer {
            id: InMemoryLedgerStore::next_id(&self.store.next_transfer_id),
            from_account_id: transfer.from_account_id,
            to_account_id: transfer.to_account_id,
            amount: transfer.amount,
            created_at: Utc::now(),
        };
        self.transfers.push(transfer.clone());
        Ok(transfer)
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn run_atomic<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut tx = InMemoryTx::new(self);
        let value = f(&mut tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.tables.read().accounts.get(&id).cloned())
    }

    fn accounts(&self, page: Page) -> Result<Vec<Account>, StoreError> {
        Ok(self
            .tables
            .read()
            .accounts
            .values()
            .rev()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    fn accounts_by_owner(&self, owner: &str, page: Page) -> Result<Vec<Account>, StoreError> {
        Ok(self
            .tables
            .read()
            .accounts
            .values()
            .rev()
            .filter(|account| account.owner == owner)
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    fn entry(&self, id: EntryId) -> Result<Option<Entry>, StoreError> {
        Ok(self.tables.read().entries.get(&id).cloned())
    }

    fn entries_by_account(
        &self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Entry>, StoreError> {
        Ok(self
            .tables
            .read()
            .entries
            .values()
            .rev()
            .filter(|entry| entry.account_id == account_id)
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    fn transfer(&self, id: TransferId) -> Result<Option<Transfer>, StoreError> {
        Ok(self.tables.read().transfers.get(&id).cloned())
    }

    fn transfers_by_account(
        &self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Transfer>, StoreError> {
        Ok(self
            .tables
            .read()
            .transfers
            .values()
            .rev()
            .filter(|transfer| transfer.involves(account_id))
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    fn with_lock_timeout(lock_timeout_ms: u64) -> InMemoryLedgerStore {
        InMemoryLedgerStore::new(LedgerConfig {
            lock_timeout_ms,
            ..LedgerConfig::default()
        })
    }

    const ALL: Page = Page {
        offset: 0,
        limit: usize::MAX,
    };

    fn new_account(owner: &str, balance: i64) -> NewAccount {
        NewAccount {
            owner: owner.to_string(),
            currency: "USD".to_string(),
            balance,
        }
    }

    fn open(store: &InMemoryLedgerStore, owner: &str, balance: i64) -> Account {
        store
            .run_atomic(|tx| tx.insert_account(new_account(owner, balance)))
            .unwrap()
    }

    #[test]
    fn commit_publishes_everything() {
        let store = InMemoryLedgerStore::default();
        let account = store
            .run_atomic(|tx| {
                let account = tx.insert_account(new_account("alice", 50))?;
                tx.insert_entry(NewEntry {
                    account_id: account.id,
                    amount: 50,
                })?;
                Ok::<_, StoreError>(account)
            })
            .unwrap();

        assert_eq!(store.account(account.id).unwrap(), Some(account.clone()));
        let entries = store.entries_by_account(account.id, ALL).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, 50);
    }

    #[test]
    fn error_rolls_back_everything() {
        let store = InMemoryLedgerStore::default();
        let alice = open(&store, "alice", 100);

        let err = store
            .run_atomic(|tx| {
                let mut row = tx.lock_account(alice.id)?.unwrap();
                row.balance = 10;
                tx.write_account(&row)?;
                tx.insert_entry(NewEntry {
                    account_id: alice.id,
                    amount: -90,
                })?;
                tx.insert_account(new_account("bob", 0))?;
                Err::<(), _>(StoreError::Backend("boom".to_string()))
            })
            .unwrap_err();
        assert_eq!(err, StoreError::Backend("boom".to_string()));

        assert_eq!(store.account(alice.id).unwrap().unwrap().balance, 100);
        assert!(store.entries_by_account(alice.id, ALL).unwrap().is_empty());
        assert_eq!(store.accounts(ALL).unwrap().len(), 1);
    }

    #[test]
    fn transaction_reads_own_writes() {
        let store = InMemoryLedgerStore::default();
        let alice = open(&store, "alice", 100);

        store
            .run_atomic(|tx| {
                let row = tx.lock_account(alice.id)?.unwrap();
                tx.write_account(&row.with_delta(-40).unwrap())?;
                // relocking is a no-op and sees the staged balance
                assert_eq!(tx.lock_account(alice.id)?.unwrap().balance, 60);
                // committed state is untouched until commit
                assert_eq!(store.account(alice.id)?.unwrap().balance, 100);
                Ok::<_, StoreError>(())
            })
            .unwrap();
        assert_eq!(store.account(alice.id).unwrap().unwrap().balance, 60);
    }

    #[test]
    fn writes_require_lock() {
        let store = InMemoryLedgerStore::default();
        let alice = open(&store, "alice", 100);

        let err = store
            .run_atomic(|tx| tx.write_account(&alice))
            .unwrap_err();
        assert_eq!(err, StoreError::NotLocked(alice.id));

        let err = store.run_atomic(|tx| tx.delete_account(alice.id)).unwrap_err();
        assert_eq!(err, StoreError::NotLocked(alice.id));
    }

    #[test]
    fn lock_missing_account() {
        let store = InMemoryLedgerStore::default();
        let row = store.run_atomic(|tx| tx.lock_account(42)).unwrap();
        assert_eq!(row, None);

        let err = store
            .run_atomic(|tx| {
                tx.lock_account(42)?;
                tx.delete_account(42)
            })
            .unwrap_err();
        assert_eq!(err, StoreError::AccountNotFound(42));
    }

    #[test]
    fn unique_owner_currency() {
        let store = InMemoryLedgerStore::default();
        open(&store, "alice", 0);

        let err = store
            .run_atomic(|tx| tx.insert_account(new_account("alice", 5)))
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::DuplicateAccount {
                owner: "alice".to_string(),
                currency: "USD".to_string()
            }
        );

        // duplicates inside a single transaction are caught as well
        let err = store
            .run_atomic(|tx| {
                tx.insert_account(new_account("bob", 0))?;
                tx.insert_account(new_account("bob", 0))
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateAccount { .. }));
        assert!(store.accounts_by_owner("bob", ALL).unwrap().is_empty());

        // another currency is fine
        store
            .run_atomic(|tx| {
                tx.insert_account(NewAccount {
                    currency: "EUR".to_string(),
                    ..new_account("alice", 0)
                })
            })
            .unwrap();
        assert_eq!(store.accounts_by_owner("alice", ALL).unwrap().len(), 2);
    }

    #[test]
    fn delete_frees_owner_currency() {
        let store = InMemoryLedgerStore::default();
        let alice = open(&store, "alice", 0);

        store
            .run_atomic(|tx| {
                tx.lock_account(alice.id)?;
                tx.delete_account(alice.id)?;
                tx.insert_account(new_account("alice", 7))
            })
            .unwrap();

        assert_eq!(store.account(alice.id).unwrap(), None);
        let accounts = store.accounts_by_owner("alice", ALL).unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].balance, 7);
    }

    #[test]
    fn negative_balance_rejected_at_commit() {
        let store = InMemoryLedgerStore::default();
        let alice = open(&store, "alice", 10);

        let err = store
            .run_atomic(|tx| {
                let row = tx.lock_account(alice.id)?.unwrap();
                tx.write_account(&row.with_delta(-11).unwrap())
            })
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::NegativeBalance {
                account: alice.id,
                balance: -1
            }
        );
        assert_eq!(store.account(alice.id).unwrap().unwrap().balance, 10);
    }

    #[test]
    fn listings_are_most_recent_first() {
        let store = InMemoryLedgerStore::default();
        let ids: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|owner| open(&store, owner, 0).id)
            .collect();

        let listed: Vec<_> = store
            .accounts(Page {
                offset: 1,
                limit: 5,
            })
            .unwrap()
            .into_iter()
            .map(|account| account.id)
            .collect();
        assert_eq!(listed, vec![ids[1], ids[0]]);
    }

    #[test]
    fn lock_wait_times_out() {
        let store = with_lock_timeout(50);
        let alice = open(&store, "alice", 100);
        let (locked_tx, locked_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let holder = &store;
        std::thread::scope(|s| {
            s.spawn(move || {
                holder
                    .run_atomic(|tx| {
                        tx.lock_account(alice.id)?;
                        locked_tx.send(()).unwrap();
                        done_rx.recv().unwrap();
                        Ok::<_, StoreError>(())
                    })
                    .unwrap();
            });

            locked_rx.recv().unwrap();
            let err = store
                .run_atomic(|tx| tx.lock_account(alice.id))
                .unwrap_err();
            assert_eq!(err, StoreError::LockTimeout(alice.id));
            done_tx.send(()).unwrap();
        });

        // lock is released once the holder finishes
        assert!(store.run_atomic(|tx| tx.lock_account(alice.id)).is_ok());
    }

    #[test]
    fn cancel_interrupts_lock_wait() {
        let store = with_lock_timeout(60_000);
        let alice = open(&store, "alice", 100);
        let cancel = AtomicBool::new(false);
        let (locked_tx, locked_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let holder = &store;
        std::thread::scope(|s| {
            s.spawn(move || {
                holder
                    .run_atomic(|tx| {
                        tx.lock_account(alice.id)?;
                        locked_tx.send(()).unwrap();
                        done_rx.recv().unwrap();
                        Ok::<_, StoreError>(())
                    })
                    .unwrap();
            });
            locked_rx.recv().unwrap();

            let started = Instant::now();
            let waiter = s.spawn(|| {
                store.run_atomic(|tx| tx.lock_account_cancellable(alice.id, &cancel))
            });
            std::thread::sleep(Duration::from_millis(50));
            cancel.store(true, Ordering::Release);

            let err = waiter.join().unwrap().unwrap_err();
            assert_eq!(err, StoreError::Cancelled(alice.id));
            assert!(started.elapsed() < Duration::from_secs(10));
            done_tx.send(()).unwrap();
        });

        // the cancelled waiter never got the lock, so nothing is left held
        assert!(store.run_atomic(|tx| tx.lock_account(alice.id)).is_ok());
    }
}
