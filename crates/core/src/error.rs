//! Ledger error model.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::money::Currency;

/// Result type used across the ledger.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Ledger-level error.
///
/// Variants fall into the categories below. Only the concurrency-contention
/// variant ([`LedgerError::TransientConflict`]) is retried internally; everything
/// else propagates to the caller unchanged.
///
/// ## Categories
///
/// - **Configuration**: duplicate definitions, identifiers/codes/scopes over their bound,
///   empty scope identities
/// - **Authorization**: unknown account, undeclared transfer, negative amount, mismatched
///   currencies, identical endpoints
/// - **Invariant**: positive-only / negative-only account would flip sign, a transfer
///   dated before an existing line of either account
/// - **Locking protocol**: lock outside the outermost transaction, account lock not held
/// - **Timeout**: the store's own lock-wait bound was exceeded
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("account '{identifier}' (scoped: {scoped}) is already defined")]
    DuplicateAccount { identifier: String, scoped: bool },

    #[error("account identifier '{identifier}' is longer than {max} characters")]
    IdentifierTooLong { identifier: String, max: usize },

    #[error("scope identity '{scope}' is longer than {max} characters")]
    ScopeIdentifierTooLong { scope: String, max: usize },

    #[error("scoped account '{identifier}' resolved to an empty scope identity")]
    EmptyScopeIdentifier { identifier: String },

    #[error("no account '{identifier}' (scoped: {scoped}) is defined")]
    UnknownAccount { identifier: String, scoped: bool },

    #[error("transfer {from} -> {to} ({code}) is already defined")]
    DuplicateTransfer { from: String, to: String, code: String },

    #[error("transfer code '{code}' is longer than {max} characters")]
    CodeTooLong { code: String, max: usize },

    #[error("transfer {from} -> {to} ({code}) not allowed: {reason}")]
    TransferNotAllowed {
        from: String,
        to: String,
        code: String,
        reason: String,
    },

    #[error("transfer amount must not be negative (got {amount})")]
    TransferIsNegative { amount: i64 },

    #[error("mismatched currencies: {expected} vs {actual}")]
    MismatchedCurrencies { expected: Currency, actual: Currency },

    #[error("account {account} would be sent negative (balance {balance})")]
    AccountWouldBeSentNegative { account: String, balance: i64 },

    #[error("account {account} would be sent positive (balance {balance})")]
    AccountWouldBeSentPositive { account: String, balance: i64 },

    #[error("transfer dated {occurred_at} precedes the latest line of {account} ({latest})")]
    TransferBackdated {
        account: String,
        occurred_at: DateTime<Utc>,
        latest: DateTime<Utc>,
    },

    #[error("accounts must be locked in the outermost transaction")]
    LockMustBeOutermostTransaction,

    #[error("lock not held for account {account}")]
    LockNotHeld { account: String },

    #[error("lock wait timeout: {0}")]
    LockWaitTimeout(String),

    #[error("gave up after {attempts} deadlock retries")]
    DeadlockRetriesExhausted { attempts: u32 },

    /// Deadlock or serialization conflict reported by the store. Retried by the
    /// locking coordinator at the outermost transaction.
    #[error("transient conflict: {0}")]
    TransientConflict(String),

    #[error("store error: {0}")]
    Store(String),
}

impl LedgerError {
    pub fn not_allowed(
        from: impl Into<String>,
        to: impl Into<String>,
        code: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::TransferNotAllowed {
            from: from.into(),
            to: to.into(),
            code: code.into(),
            reason: reason.into(),
        }
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Whether the whole outermost transaction should be restarted.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientConflict(_))
    }
}
