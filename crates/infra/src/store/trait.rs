use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use dualbook_core::{
    AccountBalance, AccountKey, LedgerError, Line, LineCheck, LineFilter, LineId, LineMetadata,
    NewLine, NewLineCheck,
};

/// Store operation error, classified so callers never match on message text.
///
/// ## Error Categories
///
/// - **Deadlock**: the store chose this transaction as a deadlock (or serialization) victim;
///   the whole transaction may be retried
/// - **UniqueViolation**: an insert collided with a row another transaction created
/// - **LockWaitTimeout**: waiting for a row lock exceeded the store's own bound
/// - **Database**: any other backend failure
/// - **Corrupt**: a persisted row could not be decoded
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("deadlock detected: {0}")]
    Deadlock(String),

    #[error("unique violation: {0}")]
    UniqueViolation(String),

    #[error("lock wait timeout: {0}")]
    LockWaitTimeout(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Deadlock(msg) => LedgerError::TransientConflict(msg),
            StoreError::LockWaitTimeout(msg) => LedgerError::LockWaitTimeout(msg),
            other => LedgerError::Store(other.to_string()),
        }
    }
}

/// Relational store backing the ledger.
///
/// Reads on the store itself run outside any transaction and see committed data only.
/// All mutation of balances and lines goes through a [`StoreTransaction`].
///
/// ## Implementation Requirements
///
/// Implementations must:
/// - assign strictly increasing line ids
/// - hold balance row locks from `select_balance_for_update`/`insert_balance` until the
///   transaction ends
/// - report deadlocks as [`StoreError::Deadlock`] and duplicate balance rows as
///   [`StoreError::UniqueViolation`], leaving the transaction usable after the latter
/// - order "latest line" lookups by id, never by timestamp
#[async_trait]
pub trait LedgerStore: Send + Sync {
    type Tx: StoreTransaction + 'static;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Most recent line of `account` (by id), optionally created at or before `at`.
    async fn latest_line(
        &self,
        account: &AccountKey,
        at: Option<DateTime<Utc>>,
    ) -> Result<Option<Line>, StoreError>;

    async fn sum_amounts(&self, account: &AccountKey, filter: &LineFilter)
    -> Result<i64, StoreError>;

    /// Lines of `account` matching `filter`, ascending by id.
    async fn lines(&self, account: &AccountKey, filter: &LineFilter)
    -> Result<Vec<Line>, StoreError>;

    /// Up to `limit` lines of any account with id greater than `after`, ascending.
    async fn lines_after(&self, after: LineId, limit: usize) -> Result<Vec<Line>, StoreError>;

    /// Latest line of `account` with id less than `before`.
    async fn previous_line(
        &self,
        account: &AccountKey,
        before: LineId,
    ) -> Result<Option<Line>, StoreError>;

    async fn line(&self, id: LineId) -> Result<Option<Line>, StoreError>;

    async fn cached_balance(&self, account: &AccountKey)
    -> Result<Option<AccountBalance>, StoreError>;

    async fn last_line_check(&self) -> Result<Option<LineCheck>, StoreError>;

    async fn insert_line_check(&self, check: NewLineCheck) -> Result<LineCheck, StoreError>;
}

/// One open top-level store transaction.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Lock the balance row of `account`. `None` (and no lock) if the row does not exist.
    async fn select_balance_for_update(
        &mut self,
        account: &AccountKey,
    ) -> Result<Option<AccountBalance>, StoreError>;

    /// Create (and lock) the balance row of `account`.
    async fn insert_balance(
        &mut self,
        account: &AccountKey,
        balance: i64,
    ) -> Result<AccountBalance, StoreError>;

    async fn update_balance(&mut self, account: &AccountKey, balance: i64)
    -> Result<(), StoreError>;

    /// Sum of every line amount of `account`, as seen by this transaction.
    async fn sum_amounts(&mut self, account: &AccountKey) -> Result<i64, StoreError>;

    /// Most recent line of `account` (by id), as seen by this transaction.
    async fn latest_line(&mut self, account: &AccountKey) -> Result<Option<Line>, StoreError>;

    async fn insert_line(&mut self, line: NewLine) -> Result<Line, StoreError>;

    /// Point `first` and `second` at each other through `partner_id`.
    async fn link_partners(&mut self, first: LineId, second: LineId) -> Result<(), StoreError>;

    async fn attach_metadata(
        &mut self,
        line: LineId,
        metadata: &LineMetadata,
    ) -> Result<(), StoreError>;

    /// Every line of `account`, ascending by id, as seen by this transaction.
    async fn account_lines(&mut self, account: &AccountKey) -> Result<Vec<Line>, StoreError>;

    async fn update_line_balance(&mut self, line: LineId, balance: i64) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    type Tx = S::Tx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        (**self).begin().await
    }

    async fn latest_line(
        &self,
        account: &AccountKey,
        at: Option<DateTime<Utc>>,
    ) -> Result<Option<Line>, StoreError> {
        (**self).latest_line(account, at).await
    }

    async fn sum_amounts(
        &self,
        account: &AccountKey,
        filter: &LineFilter,
    ) -> Result<i64, StoreError> {
        (**self).sum_amounts(account, filter).await
    }

    async fn lines(
        &self,
        account: &AccountKey,
        filter: &LineFilter,
    ) -> Result<Vec<Line>, StoreError> {
        (**self).lines(account, filter).await
    }

    async fn lines_after(&self, after: LineId, limit: usize) -> Result<Vec<Line>, StoreError> {
        (**self).lines_after(after, limit).await
    }

    async fn previous_line(
        &self,
        account: &AccountKey,
        before: LineId,
    ) -> Result<Option<Line>, StoreError> {
        (**self).previous_line(account, before).await
    }

    async fn line(&self, id: LineId) -> Result<Option<Line>, StoreError> {
        (**self).line(id).await
    }

    async fn cached_balance(
        &self,
        account: &AccountKey,
    ) -> Result<Option<AccountBalance>, StoreError> {
        (**self).cached_balance(account).await
    }

    async fn last_line_check(&self) -> Result<Option<LineCheck>, StoreError> {
        (**self).last_line_check().await
    }

    async fn insert_line_check(&self, check: NewLineCheck) -> Result<LineCheck, StoreError> {
        (**self).insert_line_check(check).await
    }
}
