mod common;

use chrono::{DateTime, Duration, TimeZone, Utc};

use common::{ledger, usd};
use dualbook_core::{Interval, LedgerError, LineFilter};
use dualbook_infra::InMemoryLedgerStore;
use dualbook_ledger::{BalanceQuery, Ledger, TransferRequest};

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, d, 12, 0, 0).unwrap()
}

async fn pay_on(ledger: &Ledger<InMemoryLedgerStore>, amount: i64, code: &str, at: DateTime<Utc>) {
    let request = TransferRequest::new(
        usd(amount),
        ledger.account("work").unwrap(),
        ledger.account("cash").unwrap(),
        code,
    )
    .occurred_at(at);
    ledger.transfer(request).await.unwrap();
}

async fn history() -> Ledger<InMemoryLedgerStore> {
    let ledger = ledger();
    pay_on(&ledger, 1_000, "salary", day(1)).await;
    pay_on(&ledger, 200, "bonus", day(5)).await;
    pay_on(&ledger, 1_000, "salary", day(10)).await;
    pay_on(&ledger, 50, "bonus", day(15)).await;
    ledger
}

async fn cash_balance(ledger: &Ledger<InMemoryLedgerStore>, query: BalanceQuery) -> i64 {
    let cash = ledger.account("cash").unwrap();
    ledger.balance(&cash, &query).await.unwrap().amount
}

#[tokio::test]
async fn current_balance_reads_latest_running_balance() {
    let ledger = history().await;
    assert_eq!(cash_balance(&ledger, BalanceQuery::current()).await, 2_250);

    let work = ledger.account("work").unwrap();
    let money = ledger.balance(&work, &BalanceQuery::current()).await.unwrap();
    assert_eq!(money, usd(-2_250));
}

#[tokio::test]
async fn accounts_without_lines_have_zero_balance() {
    let ledger = ledger();
    assert_eq!(cash_balance(&ledger, BalanceQuery::current()).await, 0);
    assert_eq!(cash_balance(&ledger, BalanceQuery::at(day(3))).await, 0);
}

#[tokio::test]
async fn historic_balance_is_inclusive_of_the_instant() {
    let ledger = history().await;
    assert_eq!(cash_balance(&ledger, BalanceQuery::at(day(1) - Duration::seconds(1))).await, 0);
    assert_eq!(cash_balance(&ledger, BalanceQuery::at(day(5))).await, 1_200);
    assert_eq!(cash_balance(&ledger, BalanceQuery::at(day(12))).await, 2_200);
}

#[tokio::test]
async fn range_balance_sums_half_open_interval() {
    let ledger = history().await;
    let range = Interval::new(day(5), day(15));
    assert_eq!(cash_balance(&ledger, BalanceQuery::between(range)).await, 1_200);

    let everything = Interval::new(day(1), day(16));
    assert_eq!(cash_balance(&ledger, BalanceQuery::between(&everything)).await, 2_250);
}

#[tokio::test]
async fn code_filters_sum_matching_lines() {
    let ledger = history().await;
    assert_eq!(cash_balance(&ledger, BalanceQuery::current().code("bonus")).await, 250);
    assert_eq!(
        cash_balance(&ledger, BalanceQuery::current().codes(["salary", "bonus"])).await,
        2_250
    );
    assert_eq!(cash_balance(&ledger, BalanceQuery::at(day(12)).code("salary")).await, 2_000);
    assert_eq!(
        cash_balance(&ledger, BalanceQuery::between(Interval::new(day(2), day(20))).code("salary")).await,
        1_000
    );
}

#[tokio::test]
async fn raw_lines_can_be_filtered() {
    let ledger = history().await;
    let cash = ledger.account("cash").unwrap();

    let bonuses = ledger
        .lines(
            &cash,
            &LineFilter {
                codes: vec!["bonus".into()],
                ..LineFilter::all()
            },
        )
        .await
        .unwrap();
    assert_eq!(bonuses.iter().map(|l| l.amount).collect::<Vec<_>>(), vec![200, 50]);

    let early = ledger
        .lines(
            &cash,
            &LineFilter {
                at: Some(day(5)),
                ..LineFilter::all()
            },
        )
        .await
        .unwrap();
    assert_eq!(early.len(), 2);
    assert!(early.windows(2).all(|pair| pair[0].id < pair[1].id));
}

#[tokio::test]
async fn backdated_transfers_are_refused() {
    let ledger = ledger();
    pay_on(&ledger, 100, "salary", day(10)).await;

    let backdated = TransferRequest::new(
        usd(5),
        ledger.account("work").unwrap(),
        ledger.account("cash").unwrap(),
        "bonus",
    )
    .occurred_at(day(2));
    let err = ledger.transfer(backdated).await.unwrap_err();
    assert_eq!(
        err,
        LedgerError::TransferBackdated {
            account: "work".into(),
            occurred_at: day(2),
            latest: day(10),
        }
    );

    // Running-balance and summed answers still agree at every instant.
    for at in [day(3), day(10), day(11)] {
        let fast = cash_balance(&ledger, BalanceQuery::at(at)).await;
        let summed = cash_balance(&ledger, BalanceQuery::at(at).codes(["salary", "bonus"])).await;
        assert_eq!(fast, summed);
    }
    assert_eq!(cash_balance(&ledger, BalanceQuery::at(day(3))).await, 0);
    assert_eq!(cash_balance(&ledger, BalanceQuery::current()).await, 100);
    assert_eq!(common::line_count(&ledger, "cash").await, 1);
}

#[tokio::test]
async fn transfers_may_share_the_latest_instant() {
    let ledger = ledger();
    pay_on(&ledger, 100, "salary", day(10)).await;
    pay_on(&ledger, 5, "bonus", day(10)).await;

    assert_eq!(cash_balance(&ledger, BalanceQuery::at(day(10))).await, 105);
    assert_eq!(cash_balance(&ledger, BalanceQuery::at(day(10)).code("bonus")).await, 5);
}

#[tokio::test]
async fn undated_transfers_never_precede_existing_lines() {
    let ledger = ledger();
    let future = Utc::now() + Duration::days(30);
    pay_on(&ledger, 100, "salary", future).await;

    // Stamped no earlier than the forward-dated line, so it still succeeds.
    common::pay(&ledger, "work", "cash", 5, "bonus").await;

    let cash = ledger.account("cash").unwrap();
    let lines = ledger.lines(&cash, &LineFilter::all()).await.unwrap();
    assert_eq!(lines.len(), 2);
    assert!(lines[1].created_at >= lines[0].created_at);
    assert_eq!(cash_balance(&ledger, BalanceQuery::at(future)).await, 105);
}
