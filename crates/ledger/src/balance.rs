//! Balance queries: current, historic, ranged and code-filtered.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::instrument;

use dualbook_core::{AccountInstance, LedgerResult, LineFilter, Money, TimeRange};
use dualbook_infra::LedgerStore;

/// What to compute a balance over. The default is the current balance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    at: Option<DateTime<Utc>>,
    codes: Vec<String>,
}

impl BalanceQuery {
    pub fn current() -> Self {
        Self::default()
    }

    /// Balance as of `at`, inclusive.
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at: Some(at),
            ..Self::default()
        }
    }

    /// Net movement within `[start, finish)`.
    pub fn between(range: impl TimeRange) -> Self {
        Self {
            from: Some(range.start()),
            to: Some(range.finish()),
            ..Self::default()
        }
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.codes.push(code.into());
        self
    }

    pub fn codes<I, C>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        self.codes.extend(codes.into_iter().map(Into::into));
        self
    }

    /// Ranges and code filters need a sum; everything else reads a running balance.
    fn needs_summation(&self) -> bool {
        !self.codes.is_empty() || (self.at.is_none() && self.from.is_some() && self.to.is_some())
    }

    fn filter(&self) -> LineFilter {
        let (from, to) = if self.at.is_some() {
            (None, None)
        } else {
            (self.from, self.to)
        };
        LineFilter {
            from,
            to,
            at: self.at,
            codes: self.codes.clone(),
        }
    }
}

pub struct BalanceCalculator<S> {
    store: Arc<S>,
}

impl<S> Clone for BalanceCalculator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LedgerStore> BalanceCalculator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Reads committed data only; a pending transfer is invisible until it commits.
    #[instrument(skip(self, account), fields(account = %account))]
    pub async fn calculate(
        &self,
        account: &AccountInstance,
        query: &BalanceQuery,
    ) -> LedgerResult<Money> {
        let key = account.key();
        let amount = if query.needs_summation() {
            self.store.sum_amounts(&key, &query.filter()).await?
        } else {
            self.store
                .latest_line(&key, query.at)
                .await?
                .map_or(0, |line| line.balance)
        };
        Ok(Money::new(amount, account.currency()))
    }
}
