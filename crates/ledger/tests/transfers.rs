mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::Notify;

use common::{config, current, ledger, ledger_with, line_count, nested_ledger, pay, usd};
use dualbook_core::{Currency, LedgerError, LineDetail, LineFilter, Money};
use dualbook_infra::{LedgerConfig, LedgerStore};
use dualbook_ledger::TransferRequest;

#[tokio::test]
async fn salary_moves_value_between_accounts() {
    let ledger = ledger();
    let work = ledger.account("work").unwrap();
    let cash = ledger.account("cash").unwrap();

    let outcome = ledger
        .transfer(TransferRequest::new(usd(100_000), work.clone(), cash.clone(), "salary"))
        .await
        .unwrap();

    assert_eq!(current(&ledger, "work").await, -100_000);
    assert_eq!(current(&ledger, "cash").await, 100_000);

    let work_lines = ledger.lines(&work, &LineFilter::all()).await.unwrap();
    let cash_lines = ledger.lines(&cash, &LineFilter::all()).await.unwrap();
    assert_eq!(work_lines.len(), 1);
    assert_eq!(cash_lines.len(), 1);

    let (credit, debit) = (&work_lines[0], &cash_lines[0]);
    assert_eq!(credit, &outcome.credit);
    assert_eq!(debit, &outcome.debit);
    assert_eq!(credit.partner_id, debit.id);
    assert_eq!(debit.partner_id, credit.id);
    assert_eq!(credit.amount, -100_000);
    assert_eq!(debit.amount, 100_000);
    assert_eq!(credit.partner_account, cash.key());
    assert_eq!(debit.partner_account, work.key());
    assert_eq!(credit.code, "salary");
}

#[tokio::test]
async fn running_balances_accumulate() {
    let ledger = ledger();
    pay(&ledger, "work", "cash", 300, "salary").await;
    pay(&ledger, "work", "cash", 50, "bonus").await;
    pay(&ledger, "cash", "savings", 120, "deposit").await;

    let cash = ledger.account("cash").unwrap();
    let balances: Vec<i64> = ledger
        .lines(&cash, &LineFilter::all())
        .await
        .unwrap()
        .iter()
        .map(|line| line.balance)
        .collect();
    assert_eq!(balances, vec![300, 350, 230]);
    assert_eq!(
        ledger.store().cached_balance(&cash.key()).await.unwrap().map(|row| row.balance),
        Some(230)
    );
}

#[tokio::test]
async fn positive_only_violation_writes_nothing() {
    let ledger = ledger();
    pay(&ledger, "work", "cash", 100, "salary").await;
    pay(&ledger, "cash", "savings", 40, "deposit").await;

    let err = ledger
        .transfer(TransferRequest::new(
            usd(41),
            ledger.account("savings").unwrap(),
            ledger.account("cash").unwrap(),
            "withdraw",
        ))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        LedgerError::AccountWouldBeSentNegative {
            account: "savings".into(),
            balance: -1
        }
    );
    assert_eq!(line_count(&ledger, "savings").await, 1);
    assert_eq!(line_count(&ledger, "cash").await, 2);
    assert_eq!(current(&ledger, "savings").await, 40);
    assert_eq!(current(&ledger, "cash").await, 60);
}

#[tokio::test]
async fn negative_only_accounts_cannot_be_overpaid() {
    let ledger = ledger();
    pay(&ledger, "loan", "cash", 500, "borrow").await;
    pay(&ledger, "cash", "loan", 500, "repay").await;
    assert_eq!(current(&ledger, "loan").await, 0);

    let err = ledger
        .transfer(TransferRequest::new(
            usd(1),
            ledger.account("cash").unwrap(),
            ledger.account("loan").unwrap(),
            "repay",
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::AccountWouldBeSentPositive { balance: 1, .. }));
}

#[tokio::test]
async fn undeclared_transfers_are_rejected_before_writing() {
    let ledger = ledger();
    let err = ledger
        .transfer(TransferRequest::new(
            usd(10),
            ledger.account("cash").unwrap(),
            ledger.account("work").unwrap(),
            "salary",
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::TransferNotAllowed { ref code, .. } if code == "salary"));
    assert_eq!(line_count(&ledger, "cash").await, 0);
}

#[tokio::test]
async fn currency_of_amount_must_match_accounts() {
    let ledger = ledger();
    let err = ledger
        .transfer(TransferRequest::new(
            Money::new(10, Currency::EUR),
            ledger.account("work").unwrap(),
            ledger.account("cash").unwrap(),
            "salary",
        ))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        LedgerError::MismatchedCurrencies {
            expected: Currency::USD,
            actual: Currency::EUR
        }
    );

    let err = ledger
        .transfer(TransferRequest::new(
            usd(10),
            ledger.account("cash").unwrap(),
            ledger.account("travel").unwrap(),
            "exchange",
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::MismatchedCurrencies { .. }));
}

#[tokio::test]
async fn scoped_accounts_are_distinct_per_scope() {
    let ledger = ledger();
    let cash = ledger.account("cash").unwrap();
    let alice = ledger.scoped_account("wallet", &7).unwrap();
    let bob = ledger.scoped_account("wallet", &8).unwrap();
    assert_eq!(alice.scope_identity(), Some("user:7"));

    ledger
        .transfer(TransferRequest::new(usd(90), cash, alice.clone(), "top_up"))
        .await
        .unwrap();
    ledger
        .transfer(TransferRequest::new(usd(40), alice.clone(), bob.clone(), "gift"))
        .await
        .unwrap();

    let alice_balance = ledger.balance(&alice, &Default::default()).await.unwrap();
    let bob_balance = ledger.balance(&bob, &Default::default()).await.unwrap();
    assert_eq!(alice_balance, usd(50));
    assert_eq!(bob_balance, usd(40));

    let err = ledger
        .transfer(TransferRequest::new(usd(1), alice.clone(), alice, "gift"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::TransferNotAllowed { .. }));
}

#[tokio::test]
async fn metadata_detail_and_timestamp_are_stored_on_both_lines() {
    let ledger = ledger();
    let paid_at = Utc.with_ymd_and_hms(2024, 2, 29, 9, 30, 0).unwrap();
    let request = TransferRequest::new(
        usd(2_500),
        ledger.account("work").unwrap(),
        ledger.account("cash").unwrap(),
        "salary",
    )
    .metadata("payslip", 42)
    .metadata("period", "2024-02")
    .detail(LineDetail::new("payroll_run", 17))
    .occurred_at(paid_at);

    let outcome = ledger.transfer(request).await.unwrap();

    for line in [&outcome.credit, &outcome.debit] {
        let stored = ledger.store().line(line.id).await.unwrap().unwrap();
        assert_eq!(stored.metadata.get("payslip").map(String::as_str), Some("42"));
        assert_eq!(stored.metadata.get("period").map(String::as_str), Some("2024-02"));
        assert_eq!(stored.detail, Some(LineDetail::new("payroll_run", "17")));
        assert_eq!(stored.created_at, paid_at);
    }

    let definition = ledger
        .transfers()
        .find(&ledger.account("work").unwrap(), &ledger.account("cash").unwrap(), "salary")
        .unwrap();
    assert_eq!(definition.describe(&outcome.debit), "salary");
}

#[tokio::test]
async fn transfers_inside_a_lock_scope_see_each_others_balances() {
    let ledger = std::sync::Arc::new(ledger());
    pay(&ledger, "work", "cash", 100, "salary").await;

    let cash = ledger.account("cash").unwrap();
    let savings = ledger.account("savings").unwrap();
    let mut session = ledger.session();

    let inner = std::sync::Arc::clone(&ledger);
    let (from, to) = (cash.clone(), savings.clone());
    ledger
        .lock_accounts(&mut session, &[cash, savings], move |s| {
            let ledger = std::sync::Arc::clone(&inner);
            let (cash, savings) = (from.clone(), to.clone());
            Box::pin(async move {
                ledger
                    .transfer_in(s, TransferRequest::new(usd(70), cash.clone(), savings.clone(), "deposit"))
                    .await?;
                ledger
                    .transfer_in(s, TransferRequest::new(usd(30), savings.clone(), cash.clone(), "withdraw"))
                    .await?;
                assert_eq!(s.balance_for_locked_account(&savings)?.balance, 40);
                Ok(())
            })
        })
        .await
        .unwrap();

    assert_eq!(current(&ledger, "cash").await, 60);
    assert_eq!(current(&ledger, "savings").await, 40);
}

#[tokio::test]
async fn failed_nested_transfer_rolls_back_the_whole_scope() {
    let ledger = std::sync::Arc::new(ledger());
    pay(&ledger, "work", "cash", 100, "salary").await;

    let cash = ledger.account("cash").unwrap();
    let savings = ledger.account("savings").unwrap();
    let mut session = ledger.session();

    let inner = std::sync::Arc::clone(&ledger);
    let (from, to) = (cash.clone(), savings.clone());
    let err = ledger
        .lock_accounts(&mut session, &[cash, savings], move |s| {
            let ledger = std::sync::Arc::clone(&inner);
            let (cash, savings) = (from.clone(), to.clone());
            Box::pin(async move {
                ledger
                    .transfer_in(s, TransferRequest::new(usd(70), cash.clone(), savings.clone(), "deposit"))
                    .await?;
                ledger
                    .transfer_in(s, TransferRequest::new(usd(71), savings, cash, "withdraw"))
                    .await
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::AccountWouldBeSentNegative { .. }));
    assert_eq!(current(&ledger, "cash").await, 100);
    assert_eq!(line_count(&ledger, "savings").await, 0);
}

#[tokio::test]
async fn nested_transfer_on_unlocked_account_fails() {
    let ledger = std::sync::Arc::new(ledger());
    let work = ledger.account("work").unwrap();
    let cash = ledger.account("cash").unwrap();
    let mut session = ledger.session();

    let inner = std::sync::Arc::clone(&ledger);
    let (from, to) = (work.clone(), cash.clone());
    let err = ledger
        .lock_accounts(&mut session, &[cash], move |s| {
            let ledger = std::sync::Arc::clone(&inner);
            let request = TransferRequest::new(usd(5), from.clone(), to.clone(), "salary");
            Box::pin(async move { ledger.transfer_in(s, request).await })
        })
        .await
        .unwrap_err();

    assert_eq!(err, LedgerError::LockNotHeld { account: "work".into() });
    assert_eq!(line_count(&ledger, "cash").await, 0);
}

#[tokio::test]
async fn transfer_inside_application_transaction_needs_allowance() {
    let strict = ledger();
    let mut session = strict.session();
    session.begin(strict.store()).await.unwrap();
    let err = strict
        .transfer_in(
            &mut session,
            TransferRequest::new(usd(5), strict.account("work").unwrap(), strict.account("cash").unwrap(), "salary"),
        )
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::LockMustBeOutermostTransaction);
    session.rollback().await.unwrap();

    let relaxed = nested_ledger();
    let mut session = relaxed.session();
    session.begin(relaxed.store()).await.unwrap();
    relaxed
        .transfer_in(
            &mut session,
            TransferRequest::new(usd(5), relaxed.account("work").unwrap(), relaxed.account("cash").unwrap(), "salary"),
        )
        .await
        .unwrap();
    assert_eq!(current(&relaxed, "cash").await, 0);
    session.commit().await.unwrap();
    assert_eq!(current(&relaxed, "cash").await, 5);
}

#[tokio::test]
async fn application_rollback_discards_allowed_transfers() {
    let ledger = nested_ledger();
    let mut session = ledger.session();
    session.begin(ledger.store()).await.unwrap();
    ledger
        .transfer_in(
            &mut session,
            TransferRequest::new(usd(5), ledger.account("work").unwrap(), ledger.account("cash").unwrap(), "salary"),
        )
        .await
        .unwrap();
    session.rollback().await.unwrap();

    assert_eq!(line_count(&ledger, "cash").await, 0);
    assert_eq!(ledger.store().line_count().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lock_wait_timeout_surfaces_without_retrying() {
    let ledger = Arc::new(ledger_with(LedgerConfig {
        lock_wait_timeout: Duration::from_millis(100),
        ..config()
    }));
    pay(&ledger, "work", "cash", 10, "salary").await;
    let work = ledger.account("work").unwrap();
    let cash = ledger.account("cash").unwrap();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let holder = {
        let ledger = Arc::clone(&ledger);
        let (entered, release) = (Arc::clone(&entered), Arc::clone(&release));
        let accounts = [work.clone(), cash.clone()];
        tokio::spawn(async move {
            let mut session = ledger.session();
            ledger
                .lock_accounts(&mut session, &accounts, move |_| {
                    let (entered, release) = (Arc::clone(&entered), Arc::clone(&release));
                    Box::pin(async move {
                        entered.notify_one();
                        release.notified().await;
                        Ok(())
                    })
                })
                .await
        })
    };
    entered.notified().await;

    // A retry would time out again for as long as the holder keeps its lock.
    let err = tokio::time::timeout(
        Duration::from_secs(2),
        ledger.transfer(TransferRequest::new(usd(5), work, cash, "salary")),
    )
    .await
    .expect("lock wait timeout must not be retried")
    .unwrap_err();
    assert!(matches!(err, LedgerError::LockWaitTimeout(_)), "{err:?}");
    assert!(!holder.is_finished());

    release.notify_one();
    holder.await.unwrap().unwrap();
    assert_eq!(current(&ledger, "cash").await, 10);
    assert_eq!(line_count(&ledger, "cash").await, 1);
}

#[tokio::test]
async fn long_metadata_keys_are_stored() {
    let ledger = ledger();
    let key = "k".repeat(200);
    let request = TransferRequest::new(
        usd(1),
        ledger.account("work").unwrap(),
        ledger.account("cash").unwrap(),
        "salary",
    )
    .metadata(key.clone(), "v");

    let outcome = ledger.transfer(request).await.unwrap();
    let stored = ledger.store().line(outcome.debit.id).await.unwrap().unwrap();
    assert_eq!(stored.metadata.get(&key).map(String::as_str), Some("v"));
}
