//! Deadlock-free multi-account locking.
//!
//! Accounts are locked in one global order (scope identity, then identifier) by
//! row-locking their balance rows inside a single store transaction. The body runs
//! with the session marked as locked; the transaction commits when it succeeds and
//! rolls back otherwise. Transient conflicts restart the whole transaction, body
//! included, so bodies must be safe to run more than once.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, instrument, warn};

use dualbook_core::{AccountBalance, AccountInstance, LedgerError, LedgerResult};
use dualbook_infra::{LedgerStore, LockConfig, StoreError, StoreTransaction};

use crate::session::LedgerSession;

pub struct LockingCoordinator<S> {
    store: Arc<S>,
    config: LockConfig,
}

impl<S> Clone for LockingCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

impl<S: LedgerStore> LockingCoordinator<S> {
    pub fn new(store: Arc<S>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Lock `accounts` for the duration of `body`.
    ///
    /// Inside an existing lock scope no new locks are taken: every requested account
    /// must already be held, and `body` runs once as part of the outer scope.
    #[instrument(skip_all, fields(session = %session.id(), accounts = accounts.len()))]
    pub async fn lock<R, F>(
        &self,
        session: &mut LedgerSession<S::Tx>,
        accounts: &[AccountInstance],
        mut body: F,
    ) -> LedgerResult<R>
    where
        R: Send,
        F: for<'s> FnMut(&'s mut LedgerSession<S::Tx>) -> BoxFuture<'s, LedgerResult<R>> + Send,
    {
        let mut ordered = accounts.to_vec();
        ordered.sort();
        ordered.dedup();

        if session.is_locked() {
            session.ensure_locked(&ordered)?;
            return body(session).await;
        }

        let open = session.open_transactions();
        if open > self.config.allowed_open_transactions {
            return Err(LedgerError::LockMustBeOutermostTransaction);
        }
        if open > 0 {
            // Nested in a permitted application transaction. Nothing here can be
            // restarted, so transient errors go straight back to the caller.
            let held = acquire(session, &ordered).await?;
            session.enter_lock(held);
            let result = body(session).await;
            session.exit_lock();
            return result;
        }

        let mut retries = 0u32;
        loop {
            let tx = self.store.begin().await?;
            session.attach(tx);

            let result = match acquire(session, &ordered).await {
                Ok(held) => {
                    session.enter_lock(held);
                    body(session).await
                }
                Err(err) => Err(err),
            };
            session.exit_lock();

            let tx = session
                .detach()
                .ok_or_else(|| LedgerError::store("lock transaction closed inside lock scope"))?;
            let result = match result {
                Ok(value) => tx.commit().await.map(|()| value).map_err(LedgerError::from),
                Err(err) => {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(error = %rollback, "rollback after failed lock scope failed");
                    }
                    Err(err)
                }
            };

            match result {
                Err(err) if err.is_transient() => {
                    if self
                        .config
                        .max_deadlock_retries
                        .is_some_and(|max| retries >= max)
                    {
                        return Err(LedgerError::DeadlockRetriesExhausted { attempts: retries });
                    }
                    retries += 1;
                    warn!(attempt = retries, error = %err, "deadlock while locking accounts, restarting transaction");
                }
                other => return other,
            }
        }
    }
}

async fn acquire<Tx: StoreTransaction>(
    session: &mut LedgerSession<Tx>,
    ordered: &[AccountInstance],
) -> LedgerResult<HashMap<AccountInstance, AccountBalance>> {
    let tx = session.transaction()?;
    let mut held = HashMap::with_capacity(ordered.len());
    for account in ordered {
        let row = lock_balance_row(tx, account).await?;
        held.insert(account.clone(), row);
    }
    Ok(held)
}

/// Row-lock the balance row of `account`, creating it from the line sum on first use.
async fn lock_balance_row<Tx: StoreTransaction>(
    tx: &mut Tx,
    account: &AccountInstance,
) -> LedgerResult<AccountBalance> {
    let key = account.key();
    if let Some(row) = tx.select_balance_for_update(&key).await? {
        return Ok(row);
    }

    let seed = tx.sum_amounts(&key).await?;
    match tx.insert_balance(&key, seed).await {
        Ok(row) => Ok(row),
        Err(StoreError::UniqueViolation(_)) => {
            debug!(account = %account, "balance row created concurrently, locking existing row");
            tx.select_balance_for_update(&key).await?.ok_or_else(|| {
                LedgerError::store(format!("balance row for {account} missing after duplicate insert"))
            })
        }
        Err(err) => Err(err.into()),
    }
}
