//! Consistency validation and repair of the entry log and cached balances.
//!
//! A run scans every line written since the last checkpoint, re-derives each line's
//! running balance from its predecessor, compares every touched account's cached
//! balance with the sum of its lines, and repairs each incorrect account under its
//! own lock. Drift never surfaces as an error; it is written to the audit log.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, instrument, warn};

use dualbook_core::{
    AccountInstance, AccountKey, AccountRegistry, LedgerResult, LineCheck, LineFilter, LineId,
    NewLineCheck,
};
use dualbook_infra::{LedgerStore, StoreTransaction};

use crate::locking::LockingCoordinator;
use crate::session::LedgerSession;

const SEPARATOR: &str = "*********************************";

/// Repair strategy for one incorrect account.
///
/// Called with `account` already locked in `session`; must leave every line's
/// running balance and the cached balance consistent and return the new balance.
#[async_trait]
pub trait AccountFixer<Tx: StoreTransaction>: Send + Sync {
    async fn recalculate(
        &self,
        session: &mut LedgerSession<Tx>,
        account: &AccountInstance,
    ) -> LedgerResult<i64>;
}

/// Replays an account's lines in id order, rewriting any wrong running balance.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayFixer;

#[async_trait]
impl<Tx: StoreTransaction + 'static> AccountFixer<Tx> for ReplayFixer {
    async fn recalculate(
        &self,
        session: &mut LedgerSession<Tx>,
        account: &AccountInstance,
    ) -> LedgerResult<i64> {
        let key = account.key();
        let tx = session.transaction()?;
        let mut running = 0i64;
        for line in tx.account_lines(&key).await? {
            running = running.saturating_add(line.amount);
            if line.balance != running {
                warn!(line = %line.id, stored = line.balance, expected = running, "rewriting running balance");
                tx.update_line_balance(line.id, running).await?;
            }
        }
        tx.update_balance(&key, running).await?;
        session.set_locked_balance(account, running)?;
        Ok(running)
    }
}

/// Outcome of one validation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors_found: bool,
    pub log: String,
    /// Highest line id scanned, or the previous checkpoint when nothing was new.
    pub last_line_id: LineId,
    pub scanned_lines: usize,
    pub repaired_accounts: Vec<AccountKey>,
    /// The audit record written by this run; `None` when there was nothing to scan.
    pub check: Option<LineCheck>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        !self.errors_found
    }
}

pub struct ConsistencyValidator<S: LedgerStore> {
    store: Arc<S>,
    accounts: Arc<AccountRegistry>,
    locking: LockingCoordinator<S>,
    fixer: Arc<dyn AccountFixer<S::Tx>>,
    batch_size: usize,
}

impl<S: LedgerStore> ConsistencyValidator<S> {
    pub fn new(
        store: Arc<S>,
        accounts: Arc<AccountRegistry>,
        locking: LockingCoordinator<S>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            accounts,
            locking,
            fixer: Arc::new(ReplayFixer),
            batch_size: batch_size.max(1),
        }
    }

    pub fn with_fixer(mut self, fixer: Arc<dyn AccountFixer<S::Tx>>) -> Self {
        self.fixer = fixer;
        self
    }

    #[instrument(skip(self))]
    pub async fn perform(&self) -> LedgerResult<ValidationReport> {
        let checkpoint = self
            .store
            .last_line_check()
            .await?
            .map_or(LineId::ZERO, |check| check.last_line_id);

        let mut log = String::new();
        let mut incorrect = BTreeSet::new();
        let mut active = BTreeSet::new();
        let mut last_line_id = checkpoint;
        let mut scanned_lines = 0usize;

        loop {
            let batch = self.store.lines_after(last_line_id, self.batch_size).await?;
            for line in &batch {
                scanned_lines += 1;
                last_line_id = line.id;
                active.insert(line.account.clone());

                let previous = self
                    .store
                    .previous_line(&line.account, line.id)
                    .await?
                    .map_or(0, |previous| previous.balance);
                if previous.checked_add(line.amount) != Some(line.balance) {
                    incorrect.insert(line.account.clone());
                    log.push_str(&format!(
                        "{SEPARATOR}\nError on line {} ({}): balance {} != {} + {}\n",
                        line.id, line.account, line.balance, previous, line.amount
                    ));
                }
            }
            if batch.len() < self.batch_size {
                break;
            }
        }

        for account in &active {
            let cached = self.store.cached_balance(account).await?.map(|row| row.balance);
            let actual = self.store.sum_amounts(account, &LineFilter::all()).await?;
            if cached != Some(actual) {
                incorrect.insert(account.clone());
                let cached = cached.map_or_else(|| "missing".to_string(), |c| c.to_string());
                log.push_str(&format!(
                    "{SEPARATOR}\nError on account {account}: cached balance {cached} != {actual}\n"
                ));
            }
        }

        let mut repaired_accounts = Vec::with_capacity(incorrect.len());
        for key in &incorrect {
            let account = match self.accounts.from_key(key) {
                Ok(account) => account,
                Err(err) => {
                    warn!(account = %key, error = %err, "cannot repair account");
                    log.push_str(&format!("{SEPARATOR}\nCannot repair {key}: {err}\n"));
                    continue;
                }
            };
            let balance = self.repair(account).await?;
            warn!(account = %key, balance, "repaired ledger account");
            repaired_accounts.push(key.clone());
        }

        let errors_found = !incorrect.is_empty();
        let check = if active.is_empty() {
            None
        } else {
            Some(
                self.store
                    .insert_line_check(NewLineCheck {
                        last_line_id,
                        errors_found,
                        log: log.clone(),
                        created_at: Utc::now(),
                    })
                    .await?,
            )
        };

        info!(scanned_lines, errors_found, last_line_id = %last_line_id, "ledger validation finished");
        Ok(ValidationReport {
            errors_found,
            log,
            last_line_id,
            scanned_lines,
            repaired_accounts,
            check,
        })
    }

    /// Lock only `account` and hand it to the fixer.
    #[instrument(skip_all, fields(account = %account))]
    async fn repair(&self, account: AccountInstance) -> LedgerResult<i64> {
        let mut session = LedgerSession::new();
        let fixer = Arc::clone(&self.fixer);
        let target = account.clone();
        self.locking
            .lock(&mut session, &[account], move |s| {
                let fixer = Arc::clone(&fixer);
                let target = target.clone();
                Box::pin(async move { fixer.recalculate(s, &target).await })
            })
            .await
    }
}
