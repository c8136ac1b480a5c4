//! Persisted ledger records: entry lines, cached balances and audit checks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::AccountKey;
use crate::id::{LineCheckId, LineId};

/// Key/value pairs attached to both lines of a transfer.
pub type LineMetadata = BTreeMap<String, String>;

/// Tagged reference to an application record a transfer was made for.
///
/// The ledger stores and returns it; it never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineDetail {
    pub kind: String,
    pub id: String,
}

impl LineDetail {
    pub fn new(kind: impl Into<String>, id: impl ToString) -> Self {
        Self {
            kind: kind.into(),
            id: id.to_string(),
        }
    }
}

/// One half of a transfer.
///
/// `amount` is negative for the credited (`from`) side and positive for the debited
/// (`to`) side. `balance` is the running balance of `account` right after this line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub id: LineId,
    pub account: AccountKey,
    pub partner_account: AccountKey,
    /// Zero until the partner line has been written.
    pub partner_id: LineId,
    pub code: String,
    pub amount: i64,
    pub balance: i64,
    pub detail: Option<LineDetail>,
    #[serde(default)]
    pub metadata: LineMetadata,
    pub created_at: DateTime<Utc>,
}

impl Line {
    pub fn is_credit(&self) -> bool {
        self.amount < 0
    }
}

/// A line about to be inserted (no id yet).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLine {
    pub account: AccountKey,
    pub partner_account: AccountKey,
    pub code: String,
    pub amount: i64,
    pub balance: i64,
    pub detail: Option<LineDetail>,
    pub created_at: DateTime<Utc>,
}

/// Cached current balance of one account; also the row-lock target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub account: AccountKey,
    pub balance: i64,
}

/// Audit record written by a consistency validation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCheck {
    pub id: LineCheckId,
    /// Highest line id scanned; the checkpoint for the next run.
    pub last_line_id: LineId,
    pub errors_found: bool,
    pub log: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLineCheck {
    pub last_line_id: LineId,
    pub errors_found: bool,
    pub log: String,
    pub created_at: DateTime<Utc>,
}

/// Selects lines of one account for summation or listing.
///
/// `from`/`to` bound `created_at` as a half-open `[from, to)` interval; `at` is an
/// inclusive upper bound. An empty `codes` list means every code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub at: Option<DateTime<Utc>>,
    pub codes: Vec<String>,
}

impl LineFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, line: &Line) -> bool {
        if let Some(from) = self.from {
            if line.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if line.created_at >= to {
                return false;
            }
        }
        if let Some(at) = self.at {
            if line.created_at > at {
                return false;
            }
        }
        self.codes.is_empty() || self.codes.iter().any(|c| c == &line.code)
    }
}
