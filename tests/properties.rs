//! Property-based checks of the ledger invariants over random transfer
//! sequences: conservation, non-negativity and balance == sum(entries).

use std::sync::Arc;

use bank_ledger::{
    account::{AccountId, Amount},
    command::PageRequest,
    registry::AccountRegistry,
    store::in_memory_store::InMemoryLedgerStore,
    transfer::{TransferEngine, TransferError},
};
use proptest::prelude::*;

const ACCOUNTS: usize = 4;

fn transfer_strategy() -> impl Strategy<Value = (usize, usize, Amount)> {
    (0..ACCOUNTS, 0..ACCOUNTS, -50i64..2_000)
}

fn entries_sum(registry: &AccountRegistry<InMemoryLedgerStore>, id: AccountId) -> Amount {
    let mut sum = 0;
    for page in 1.. {
        let batch = registry.list_entries(id, PageRequest::new(page, 100)).unwrap();
        if batch.is_empty() {
            break;
        }
        sum += batch.iter().map(|entry| entry.amount).sum::<Amount>();
    }
    sum
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn transfers_conserve_value(
        balances in prop::collection::vec(0i64..5_000, ACCOUNTS),
        transfers in prop::collection::vec(transfer_strategy(), 1..60),
    ) {
        let store = Arc::new(InMemoryLedgerStore::default());
        let registry = AccountRegistry::new(Arc::clone(&store));
        let engine = TransferEngine::new(store);

        let ids: Vec<AccountId> = balances
            .iter()
            .enumerate()
            .map(|(i, balance)| {
                registry.create_account(&format!("owner-{i}"), None, *balance).unwrap().id
            })
            .collect();
        let total: Amount = balances.iter().sum();

        for (from, to, amount) in transfers {
            let before_from = registry.get_account(ids[from]).unwrap().balance;
            let before_to = registry.get_account(ids[to]).unwrap().balance;

            match engine.create_transfer(ids[from], ids[to], amount) {
                Ok(transfer) => {
                    prop_assert!(transfer.amount > 0);
                    prop_assert_eq!(transfer.amount, amount);
                    prop_assert_eq!(
                        registry.get_account(ids[from]).unwrap().balance,
                        before_from - amount
                    );
                    prop_assert_eq!(
                        registry.get_account(ids[to]).unwrap().balance,
                        before_to + amount
                    );
                    prop_assert_eq!(engine.get_transfer(transfer.id).unwrap(), transfer);
                }
                Err(TransferError::InsufficientBalance { .. }) => {
                    prop_assert!(amount > before_from);
                    prop_assert_eq!(registry.get_account(ids[from]).unwrap().balance, before_from);
                    prop_assert_eq!(registry.get_account(ids[to]).unwrap().balance, before_to);
                }
                Err(TransferError::Command(_)) => {
                    prop_assert!(amount <= 0 || from == to);
                }
                Err(err) => prop_assert!(false, "unexpected error: {}", err),
            }

            let current: Amount = ids
                .iter()
                .map(|id| registry.get_account(*id).unwrap().balance)
                .sum();
            prop_assert_eq!(current, total);
        }

        for id in &ids {
            let balance = registry.get_account(*id).unwrap().balance;
            prop_assert!(balance >= 0);
            prop_assert_eq!(balance, entries_sum(&registry, *id));
        }
    }
}
