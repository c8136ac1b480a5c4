//! In-memory ledger store.
//!
//! Intended for tests/dev. Mirrors the behaviour of a row-locking relational store
//! closely enough to exercise the locking protocol:
//!
//! - writes are buffered per transaction and become visible atomically on commit
//! - balance row locks are held until commit, rollback or drop
//! - a blocked lock request gives up after the lock-wait timeout
//! - a lock request that would close a wait-for cycle fails with `Deadlock`
//! - a balance insert racing a concurrent insert of the same key waits for it, then
//!   reports `UniqueViolation`

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use dualbook_core::{
    AccountBalance, AccountKey, Line, LineCheck, LineCheckId, LineFilter, LineId, LineMetadata,
    NewLine, NewLineCheck,
};

use super::r#trait::{LedgerStore, StoreError, StoreTransaction};

const DEFAULT_LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

type TxId = u64;

#[derive(Debug, Default)]
struct State {
    balances: BTreeMap<AccountKey, i64>,
    lines: BTreeMap<LineId, Line>,
    checks: Vec<LineCheck>,
    last_line_id: i64,
    last_check_id: i64,
    row_locks: HashMap<AccountKey, TxId>,
    waiting: HashMap<TxId, AccountKey>,
}

impl State {
    /// Whether `tx` waiting for `key` would close a cycle in the wait-for graph.
    fn would_deadlock(&self, tx: TxId, key: &AccountKey) -> bool {
        let mut seen = HashSet::new();
        let mut current = key;
        while let Some(&owner) = self.row_locks.get(current) {
            if owner == tx {
                return true;
            }
            if !seen.insert(owner) {
                return false;
            }
            match self.waiting.get(&owner) {
                Some(next) => current = next,
                None => return false,
            }
        }
        false
    }

    fn account_lines<'a>(&'a self, account: &'a AccountKey) -> impl Iterator<Item = &'a Line> {
        self.lines.values().filter(move |l| &l.account == account)
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    released: Notify,
    next_tx: AtomicU64,
    lock_wait_timeout: Duration,
}

impl Shared {
    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Database("lock poisoned".to_string()))
    }

    fn release_all(&self, tx: TxId) {
        if let Ok(mut state) = self.state.lock() {
            state.row_locks.retain(|_, owner| *owner != tx);
            state.waiting.remove(&tx);
        }
        self.released.notify_waiters();
    }
}

/// In-memory ledger store. Cheap to clone; clones share the same data.
#[derive(Debug, Clone)]
pub struct InMemoryLedgerStore {
    shared: Arc<Shared>,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::with_lock_wait_timeout(DEFAULT_LOCK_WAIT_TIMEOUT)
    }

    pub fn with_lock_wait_timeout(lock_wait_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                released: Notify::new(),
                next_tx: AtomicU64::new(1),
                lock_wait_timeout,
            }),
        }
    }

    /// Overwrite a committed line's running balance, bypassing the ledger.
    ///
    /// Fault injection for consistency-check tests.
    pub fn overwrite_line_balance(&self, id: LineId, balance: i64) -> Result<(), StoreError> {
        let mut state = self.shared.state()?;
        let line = state
            .lines
            .get_mut(&id)
            .ok_or_else(|| StoreError::Database(format!("no line {id}")))?;
        line.balance = balance;
        Ok(())
    }

    /// Overwrite a committed cached balance, bypassing the ledger.
    pub fn overwrite_cached_balance(
        &self,
        account: &AccountKey,
        balance: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.shared.state()?;
        let slot = state
            .balances
            .get_mut(account)
            .ok_or_else(|| StoreError::Database(format!("no balance row for {account}")))?;
        *slot = balance;
        Ok(())
    }

    /// Number of committed lines.
    pub fn line_count(&self) -> Result<usize, StoreError> {
        Ok(self.shared.state()?.lines.len())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            id: self.shared.next_tx.fetch_add(1, Ordering::Relaxed),
            pending: Pending::default(),
            finished: false,
        })
    }

    async fn latest_line(
        &self,
        account: &AccountKey,
        at: Option<DateTime<Utc>>,
    ) -> Result<Option<Line>, StoreError> {
        let state = self.shared.state()?;
        Ok(state
            .lines
            .values()
            .rev()
            .find(|l| &l.account == account && at.is_none_or(|at| l.created_at <= at))
            .cloned())
    }

    async fn sum_amounts(
        &self,
        account: &AccountKey,
        filter: &LineFilter,
    ) -> Result<i64, StoreError> {
        let state = self.shared.state()?;
        checked_sum(state.account_lines(account).filter(|l| filter.matches(l)), account)
    }

    async fn lines(
        &self,
        account: &AccountKey,
        filter: &LineFilter,
    ) -> Result<Vec<Line>, StoreError> {
        let state = self.shared.state()?;
        Ok(state
            .account_lines(account)
            .filter(|l| filter.matches(l))
            .cloned()
            .collect())
    }

    async fn lines_after(&self, after: LineId, limit: usize) -> Result<Vec<Line>, StoreError> {
        let state = self.shared.state()?;
        Ok(state
            .lines
            .range((Bound::Excluded(after), Bound::Unbounded))
            .take(limit)
            .map(|(_, l)| l.clone())
            .collect())
    }

    async fn previous_line(
        &self,
        account: &AccountKey,
        before: LineId,
    ) -> Result<Option<Line>, StoreError> {
        let state = self.shared.state()?;
        Ok(state
            .lines
            .range(..before)
            .rev()
            .map(|(_, l)| l)
            .find(|l| &l.account == account)
            .cloned())
    }

    async fn line(&self, id: LineId) -> Result<Option<Line>, StoreError> {
        Ok(self.shared.state()?.lines.get(&id).cloned())
    }

    async fn cached_balance(
        &self,
        account: &AccountKey,
    ) -> Result<Option<AccountBalance>, StoreError> {
        let state = self.shared.state()?;
        Ok(state.balances.get(account).map(|&balance| AccountBalance {
            account: account.clone(),
            balance,
        }))
    }

    async fn last_line_check(&self) -> Result<Option<LineCheck>, StoreError> {
        Ok(self.shared.state()?.checks.last().cloned())
    }

    async fn insert_line_check(&self, check: NewLineCheck) -> Result<LineCheck, StoreError> {
        let mut state = self.shared.state()?;
        state.last_check_id += 1;
        let stored = LineCheck {
            id: LineCheckId::new(state.last_check_id),
            last_line_id: check.last_line_id,
            errors_found: check.errors_found,
            log: check.log,
            created_at: check.created_at,
        };
        state.checks.push(stored.clone());
        Ok(stored)
    }
}

/// Writes buffered by an open transaction.
#[derive(Debug, Default)]
struct Pending {
    balances: BTreeMap<AccountKey, i64>,
    /// New lines plus rewritten copies of committed lines.
    lines: BTreeMap<LineId, Line>,
}

#[derive(Debug)]
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    id: TxId,
    pending: Pending,
    finished: bool,
}

impl InMemoryTransaction {
    /// Take the row lock for `account`, waiting for its current holder.
    ///
    /// With `only_existing`, returns `false` without locking when no row exists.
    async fn lock_row(&mut self, account: &AccountKey, only_existing: bool) -> Result<bool, StoreError> {
        let shared = Arc::clone(&self.shared);
        let deadline = Instant::now() + shared.lock_wait_timeout;

        loop {
            // Registered before the state lock is released so a release in between
            // is not missed; `notify_waiters` keeps no permit.
            let notified = shared.released.notified();
            tokio::pin!(notified);
            {
                let mut state = shared.state()?;
                state.waiting.remove(&self.id);

                if only_existing
                    && !state.balances.contains_key(account)
                    && !self.pending.balances.contains_key(account)
                {
                    return Ok(false);
                }

                match state.row_locks.get(account).copied() {
                    None => {
                        state.row_locks.insert(account.clone(), self.id);
                        return Ok(true);
                    }
                    Some(owner) if owner == self.id => return Ok(true),
                    Some(_) => {
                        if state.would_deadlock(self.id, account) {
                            debug!(tx = self.id, account = %account, "wait-for cycle, failing requester");
                            return Err(StoreError::Deadlock(format!(
                                "transaction {} waiting for {account}",
                                self.id
                            )));
                        }
                        state.waiting.insert(self.id, account.clone());
                        notified.as_mut().enable();
                    }
                }
            }

            let now = Instant::now();
            let woke = now < deadline
                && tokio::time::timeout(deadline - now, notified).await.is_ok();
            if !woke {
                if let Ok(mut state) = shared.state.lock() {
                    state.waiting.remove(&self.id);
                }
                return Err(StoreError::LockWaitTimeout(format!(
                    "balance row {account} still locked after {:?}",
                    shared.lock_wait_timeout
                )));
            }
        }
    }

    fn visible_balance(&self, state: &State, account: &AccountKey) -> Option<i64> {
        self.pending
            .balances
            .get(account)
            .or_else(|| state.balances.get(account))
            .copied()
    }

    fn visible_line(&self, state: &State, id: LineId) -> Option<Line> {
        self.pending
            .lines
            .get(&id)
            .or_else(|| state.lines.get(&id))
            .cloned()
    }

    fn visible_account_lines(&self, state: &State, account: &AccountKey) -> Vec<Line> {
        let mut lines: BTreeMap<LineId, Line> = state
            .account_lines(account)
            .map(|l| (l.id, l.clone()))
            .collect();
        for (id, line) in &self.pending.lines {
            if &line.account == account {
                lines.insert(*id, line.clone());
            }
        }
        lines.into_values().collect()
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.shared.release_all(self.id);
        }
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        self.finish();
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn select_balance_for_update(
        &mut self,
        account: &AccountKey,
    ) -> Result<Option<AccountBalance>, StoreError> {
        if !self.lock_row(account, true).await? {
            return Ok(None);
        }
        let state = self.shared.state()?;
        Ok(self
            .visible_balance(&state, account)
            .map(|balance| AccountBalance {
                account: account.clone(),
                balance,
            }))
    }

    async fn insert_balance(
        &mut self,
        account: &AccountKey,
        balance: i64,
    ) -> Result<AccountBalance, StoreError> {
        self.lock_row(account, false).await?;
        let state = self.shared.state()?;
        if self.visible_balance(&state, account).is_some() {
            return Err(StoreError::UniqueViolation(format!(
                "balance row for {account} already exists"
            )));
        }
        drop(state);
        self.pending.balances.insert(account.clone(), balance);
        Ok(AccountBalance {
            account: account.clone(),
            balance,
        })
    }

    async fn update_balance(
        &mut self,
        account: &AccountKey,
        balance: i64,
    ) -> Result<(), StoreError> {
        let state = self.shared.state()?;
        if self.visible_balance(&state, account).is_none() {
            return Err(StoreError::Database(format!("no balance row for {account}")));
        }
        drop(state);
        self.pending.balances.insert(account.clone(), balance);
        Ok(())
    }

    async fn sum_amounts(&mut self, account: &AccountKey) -> Result<i64, StoreError> {
        let state = self.shared.state()?;
        checked_sum(self.visible_account_lines(&state, account).iter(), account)
    }

    async fn latest_line(&mut self, account: &AccountKey) -> Result<Option<Line>, StoreError> {
        let state = self.shared.state()?;
        Ok(self.visible_account_lines(&state, account).pop())
    }

    async fn insert_line(&mut self, line: NewLine) -> Result<Line, StoreError> {
        let id = {
            let mut state = self.shared.state()?;
            state.last_line_id += 1;
            LineId::new(state.last_line_id)
        };
        let stored = Line {
            id,
            account: line.account,
            partner_account: line.partner_account,
            partner_id: LineId::ZERO,
            code: line.code,
            amount: line.amount,
            balance: line.balance,
            detail: line.detail,
            metadata: LineMetadata::new(),
            created_at: line.created_at,
        };
        self.pending.lines.insert(id, stored.clone());
        Ok(stored)
    }

    async fn link_partners(&mut self, first: LineId, second: LineId) -> Result<(), StoreError> {
        let state = self.shared.state()?;
        let mut a = self
            .visible_line(&state, first)
            .ok_or_else(|| StoreError::Database(format!("no line {first}")))?;
        let mut b = self
            .visible_line(&state, second)
            .ok_or_else(|| StoreError::Database(format!("no line {second}")))?;
        drop(state);
        a.partner_id = second;
        b.partner_id = first;
        self.pending.lines.insert(first, a);
        self.pending.lines.insert(second, b);
        Ok(())
    }

    async fn attach_metadata(
        &mut self,
        line: LineId,
        metadata: &LineMetadata,
    ) -> Result<(), StoreError> {
        let state = self.shared.state()?;
        let mut stored = self
            .visible_line(&state, line)
            .ok_or_else(|| StoreError::Database(format!("no line {line}")))?;
        drop(state);
        stored
            .metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.pending.lines.insert(line, stored);
        Ok(())
    }

    async fn account_lines(&mut self, account: &AccountKey) -> Result<Vec<Line>, StoreError> {
        let state = self.shared.state()?;
        Ok(self.visible_account_lines(&state, account))
    }

    async fn update_line_balance(&mut self, line: LineId, balance: i64) -> Result<(), StoreError> {
        let state = self.shared.state()?;
        let mut stored = self
            .visible_line(&state, line)
            .ok_or_else(|| StoreError::Database(format!("no line {line}")))?;
        drop(state);
        stored.balance = balance;
        self.pending.lines.insert(line, stored);
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        let pending = std::mem::take(&mut self.pending);
        {
            let mut state = self.shared.state()?;
            state.balances.extend(pending.balances);
            state.lines.extend(pending.lines);
        }
        self.finish();
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        self.pending = Pending::default();
        self.finish();
        Ok(())
    }
}

/// Sum of line amounts, failing like a `BIGINT` sum would instead of wrapping.
fn checked_sum<'a>(
    mut lines: impl Iterator<Item = &'a Line>,
    account: &AccountKey,
) -> Result<i64, StoreError> {
    lines
        .try_fold(0i64, |total, line| total.checked_add(line.amount))
        .ok_or_else(|| StoreError::Database(format!("sum of lines of {account} overflows i64")))
}
