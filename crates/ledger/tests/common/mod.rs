//! Shared chart of accounts for the ledger integration tests.
#![allow(dead_code)]

use std::time::Duration;

use dualbook_core::{
    Account, AccountRegistry, Currency, LineFilter, Money, TransferDefinition, TransferRegistry,
};
use dualbook_infra::{InMemoryLedgerStore, LedgerConfig, LockConfig};
use dualbook_ledger::{Ledger, TransferRequest};

pub const MOVERS: [&str; 4] = ["a", "b", "c", "d"];

pub fn usd(amount: i64) -> Money {
    Money::new(amount, Currency::USD)
}

pub fn accounts() -> AccountRegistry {
    let mut builder = AccountRegistry::builder();
    builder
        .define(Account::new("work"))
        .unwrap()
        .define(Account::new("cash"))
        .unwrap()
        .define(Account::new("savings").positive_only())
        .unwrap()
        .define(Account::new("loan").negative_only())
        .unwrap()
        .define(Account::new("wallet").scoped_by(|user| format!("user:{user}")))
        .unwrap()
        .define(Account::new("travel").currency(Currency::EUR))
        .unwrap();
    for mover in MOVERS {
        builder.define(Account::new(mover)).unwrap();
    }
    builder.build()
}

pub fn transfers() -> TransferRegistry {
    let mut builder = TransferRegistry::builder();
    builder
        .define(TransferDefinition::new("work", "cash", "salary"))
        .unwrap()
        .define(TransferDefinition::new("work", "cash", "bonus"))
        .unwrap()
        .define(TransferDefinition::new("cash", "savings", "deposit"))
        .unwrap()
        .define(TransferDefinition::new("savings", "cash", "withdraw"))
        .unwrap()
        .define(TransferDefinition::new("loan", "cash", "borrow"))
        .unwrap()
        .define(TransferDefinition::new("cash", "loan", "repay"))
        .unwrap()
        .define(TransferDefinition::new("cash", "wallet", "top_up"))
        .unwrap()
        .define(TransferDefinition::new("wallet", "wallet", "gift"))
        .unwrap()
        .define(TransferDefinition::new("cash", "travel", "exchange"))
        .unwrap();
    for from in MOVERS {
        for to in MOVERS {
            if from != to {
                builder
                    .define(TransferDefinition::new(from, to, "move"))
                    .unwrap();
            }
        }
    }
    builder.build()
}

pub fn config() -> LedgerConfig {
    LedgerConfig {
        lock_wait_timeout: Duration::from_secs(5),
        validation_batch_size: 7,
        ..LedgerConfig::default()
    }
}

pub fn ledger() -> Ledger<InMemoryLedgerStore> {
    ledger_with(config())
}

pub fn ledger_with(config: LedgerConfig) -> Ledger<InMemoryLedgerStore> {
    dualbook_observability::init_for_tests();
    let store = InMemoryLedgerStore::with_lock_wait_timeout(config.lock_wait_timeout);
    Ledger::new(accounts(), transfers(), store, config)
}

/// A ledger that lets one application transaction stay open around lock scopes.
pub fn nested_ledger() -> Ledger<InMemoryLedgerStore> {
    ledger_with(LedgerConfig {
        lock: LockConfig {
            allowed_open_transactions: 1,
            ..LockConfig::default()
        },
        ..config()
    })
}

pub async fn pay(ledger: &Ledger<InMemoryLedgerStore>, from: &str, to: &str, amount: i64, code: &str) {
    let request = TransferRequest::new(
        usd(amount),
        ledger.account(from).unwrap(),
        ledger.account(to).unwrap(),
        code,
    );
    ledger.transfer(request).await.unwrap();
}

pub async fn current(ledger: &Ledger<InMemoryLedgerStore>, identifier: &str) -> i64 {
    let account = ledger.account(identifier).unwrap();
    ledger
        .balance(&account, &Default::default())
        .await
        .unwrap()
        .amount
}

pub async fn line_count(ledger: &Ledger<InMemoryLedgerStore>, identifier: &str) -> usize {
    let account = ledger.account(identifier).unwrap();
    ledger.lines(&account, &LineFilter::all()).await.unwrap().len()
}
