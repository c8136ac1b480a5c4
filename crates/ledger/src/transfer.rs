//! Transfer processing: validate a request, lock both accounts, write the line pair.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use dualbook_core::{
    AccountInstance, AccountKey, LedgerError, LedgerResult, Line, LineDetail, LineMetadata, Money,
    NewLine, TransferRegistry,
};
use dualbook_infra::{LedgerStore, StoreTransaction};

use crate::locking::LockingCoordinator;
use crate::session::LedgerSession;

/// A request to move `amount` from one account to another.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub amount: Money,
    pub from: AccountInstance,
    pub to: AccountInstance,
    pub code: String,
    pub metadata: LineMetadata,
    pub detail: Option<LineDetail>,
    /// Timestamp stamped on both lines; defaults to the time of writing.
    pub occurred_at: Option<DateTime<Utc>>,
}

impl TransferRequest {
    pub fn new(
        amount: Money,
        from: AccountInstance,
        to: AccountInstance,
        code: impl Into<String>,
    ) -> Self {
        Self {
            amount,
            from,
            to,
            code: code.into(),
            metadata: LineMetadata::new(),
            detail: None,
            occurred_at: None,
        }
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    pub fn detail(mut self, detail: LineDetail) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(at);
        self
    }
}

/// The two lines written by a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub credit: Line,
    pub debit: Line,
}

pub struct TransferProcessor<S> {
    transfers: Arc<TransferRegistry>,
    locking: LockingCoordinator<S>,
}

impl<S> Clone for TransferProcessor<S> {
    fn clone(&self) -> Self {
        Self {
            transfers: Arc::clone(&self.transfers),
            locking: self.locking.clone(),
        }
    }
}

impl<S: LedgerStore> TransferProcessor<S> {
    pub fn new(transfers: Arc<TransferRegistry>, locking: LockingCoordinator<S>) -> Self {
        Self { transfers, locking }
    }

    /// Checks that need no database access, in the order they are reported.
    pub fn validate(&self, request: &TransferRequest) -> LedgerResult<()> {
        if request.amount.is_negative() {
            return Err(LedgerError::TransferIsNegative {
                amount: request.amount.amount,
            });
        }

        let from = request.from.identifier();
        let to = request.to.identifier();
        if request.from == request.to {
            return Err(LedgerError::not_allowed(
                from,
                to,
                &request.code,
                "source and destination are the same account",
            ));
        }

        let currency = request.from.currency();
        if request.to.currency() != currency {
            return Err(LedgerError::MismatchedCurrencies {
                expected: currency,
                actual: request.to.currency(),
            });
        }
        if request.amount.currency != currency {
            return Err(LedgerError::MismatchedCurrencies {
                expected: currency,
                actual: request.amount.currency,
            });
        }

        self.transfers
            .authorize(&request.from, &request.to, &request.code)?;
        Ok(())
    }

    /// Validate and write `request` inside a lock on both of its accounts.
    ///
    /// Within an enclosing lock scope both accounts must already be held.
    #[instrument(
        skip_all,
        fields(from = %request.from, to = %request.to, code = %request.code, amount = request.amount.amount)
    )]
    pub async fn process(
        &self,
        session: &mut LedgerSession<S::Tx>,
        request: TransferRequest,
    ) -> LedgerResult<TransferOutcome> {
        self.validate(&request)?;

        let accounts = [request.from.clone(), request.to.clone()];
        let request = Arc::new(request);
        let outcome = self
            .locking
            .lock(session, &accounts, move |s| {
                let request = Arc::clone(&request);
                Box::pin(async move { write_transfer(s, &request).await })
            })
            .await?;

        debug!(credit = %outcome.credit.id, debit = %outcome.debit.id, "transfer written");
        Ok(outcome)
    }
}

async fn write_transfer<Tx: StoreTransaction>(
    session: &mut LedgerSession<Tx>,
    request: &TransferRequest,
) -> LedgerResult<TransferOutcome> {
    let amount = request.amount.amount;
    let from_balance = session.balance_for_locked_account(&request.from)?.balance;
    let to_balance = session.balance_for_locked_account(&request.to)?.balance;

    let credit_balance = from_balance
        .checked_sub(amount)
        .ok_or_else(|| LedgerError::store(format!("balance of {} overflows", request.from)))?;
    let debit_balance = to_balance
        .checked_add(amount)
        .ok_or_else(|| LedgerError::store(format!("balance of {} overflows", request.to)))?;
    ensure_sign_allowed(&request.from, credit_balance)?;
    ensure_sign_allowed(&request.to, debit_balance)?;

    let from_key = request.from.key();
    let to_key = request.to.key();

    let tx = session.transaction()?;
    let accounts = [(&request.from, &from_key), (&request.to, &to_key)];
    let created_at = stamp(tx, request, accounts).await?;
    let mut credit = tx
        .insert_line(NewLine {
            account: from_key.clone(),
            partner_account: to_key.clone(),
            code: request.code.clone(),
            amount: -amount,
            balance: credit_balance,
            detail: request.detail.clone(),
            created_at,
        })
        .await?;
    let mut debit = tx
        .insert_line(NewLine {
            account: to_key.clone(),
            partner_account: from_key.clone(),
            code: request.code.clone(),
            amount,
            balance: debit_balance,
            detail: request.detail.clone(),
            created_at,
        })
        .await?;
    tx.link_partners(credit.id, debit.id).await?;
    tx.update_balance(&from_key, credit_balance).await?;
    tx.update_balance(&to_key, debit_balance).await?;
    if !request.metadata.is_empty() {
        tx.attach_metadata(credit.id, &request.metadata).await?;
        tx.attach_metadata(debit.id, &request.metadata).await?;
    }

    session.set_locked_balance(&request.from, credit_balance)?;
    session.set_locked_balance(&request.to, debit_balance)?;

    credit.partner_id = debit.id;
    debit.partner_id = credit.id;
    credit.metadata = request.metadata.clone();
    debit.metadata = request.metadata.clone();
    Ok(TransferOutcome { credit, debit })
}

/// Timestamp for the new line pair.
///
/// Historic balances read the running balance of the latest line at or before an
/// instant, which is only correct while id order and time order agree. An explicit
/// `occurred_at` older than either account's latest line is refused; the default
/// stamp never goes backwards.
async fn stamp<Tx: StoreTransaction>(
    tx: &mut Tx,
    request: &TransferRequest,
    accounts: [(&AccountInstance, &AccountKey); 2],
) -> LedgerResult<DateTime<Utc>> {
    let mut created_at = request.occurred_at.unwrap_or_else(Utc::now);
    for (account, key) in accounts {
        let Some(latest) = tx.latest_line(key).await?.map(|line| line.created_at) else {
            continue;
        };
        if latest <= created_at {
            continue;
        }
        match request.occurred_at {
            Some(occurred_at) => {
                return Err(LedgerError::TransferBackdated {
                    account: account.to_string(),
                    occurred_at,
                    latest,
                });
            }
            None => created_at = latest,
        }
    }
    Ok(created_at)
}

/// Positive-only and negative-only flags apply to whichever side an account is on.
fn ensure_sign_allowed(account: &AccountInstance, balance: i64) -> LedgerResult<()> {
    if account.is_positive_only() && balance < 0 {
        return Err(LedgerError::AccountWouldBeSentNegative {
            account: account.to_string(),
            balance,
        });
    }
    if account.is_negative_only() && balance > 0 {
        return Err(LedgerError::AccountWouldBeSentPositive {
            account: account.to_string(),
            balance,
        });
    }
    Ok(())
}
