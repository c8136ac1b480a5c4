//! Double-entry ledger engine.
//!
//! [`Ledger`] ties the account and transfer registries to a [`LedgerStore`] and
//! exposes the whole query surface: resolve accounts, run transfers, lock groups of
//! accounts, read balances and lines, and validate the entry log.
//!
//! ```ignore
//! let ledger = Ledger::new(accounts, transfers, InMemoryLedgerStore::new(), LedgerConfig::default());
//! let work = ledger.account("work")?;
//! let cash = ledger.account("cash")?;
//! ledger.transfer(TransferRequest::new(Money::new(100_000, Currency::USD), work, cash, "salary")).await?;
//! ```

pub mod balance;
pub mod locking;
pub mod session;
pub mod transfer;
pub mod validation;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use dualbook_core::{
    AccountInstance, AccountRegistry, LedgerResult, Line, LineFilter, Money, TransferRegistry,
};
use dualbook_infra::{LedgerConfig, LedgerStore};

pub use balance::{BalanceCalculator, BalanceQuery};
pub use locking::LockingCoordinator;
pub use session::LedgerSession;
pub use transfer::{TransferOutcome, TransferProcessor, TransferRequest};
pub use validation::{AccountFixer, ConsistencyValidator, ReplayFixer, ValidationReport};

pub struct Ledger<S: LedgerStore> {
    accounts: Arc<AccountRegistry>,
    transfers: Arc<TransferRegistry>,
    store: Arc<S>,
    locking: LockingCoordinator<S>,
    processor: TransferProcessor<S>,
    calculator: BalanceCalculator<S>,
    config: LedgerConfig,
}

impl<S: LedgerStore> Ledger<S> {
    pub fn new(
        accounts: AccountRegistry,
        transfers: TransferRegistry,
        store: S,
        config: LedgerConfig,
    ) -> Self {
        let accounts = Arc::new(accounts);
        let transfers = Arc::new(transfers);
        let store = Arc::new(store);
        let locking = LockingCoordinator::new(Arc::clone(&store), config.lock.clone());
        let processor = TransferProcessor::new(Arc::clone(&transfers), locking.clone());
        let calculator = BalanceCalculator::new(Arc::clone(&store));
        Self {
            accounts,
            transfers,
            store,
            locking,
            processor,
            calculator,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn accounts(&self) -> &AccountRegistry {
        &self.accounts
    }

    pub fn transfers(&self) -> &TransferRegistry {
        &self.transfers
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn account(&self, identifier: &str) -> LedgerResult<AccountInstance> {
        self.accounts.account(identifier)
    }

    pub fn scoped_account(
        &self,
        identifier: &str,
        scope: &dyn fmt::Display,
    ) -> LedgerResult<AccountInstance> {
        self.accounts.scoped_account(identifier, scope)
    }

    pub fn session(&self) -> LedgerSession<S::Tx> {
        LedgerSession::new()
    }

    /// Execute one transfer in its own lock scope and transaction.
    pub async fn transfer(&self, request: TransferRequest) -> LedgerResult<TransferOutcome> {
        let mut session = self.session();
        self.processor.process(&mut session, request).await
    }

    /// Execute a transfer on `session`, joining its lock scope if one is active.
    pub async fn transfer_in(
        &self,
        session: &mut LedgerSession<S::Tx>,
        request: TransferRequest,
    ) -> LedgerResult<TransferOutcome> {
        self.processor.process(session, request).await
    }

    /// Run `body` with `accounts` locked. See [`LockingCoordinator::lock`].
    pub async fn lock_accounts<R, F>(
        &self,
        session: &mut LedgerSession<S::Tx>,
        accounts: &[AccountInstance],
        body: F,
    ) -> LedgerResult<R>
    where
        R: Send,
        F: for<'s> FnMut(&'s mut LedgerSession<S::Tx>) -> BoxFuture<'s, LedgerResult<R>> + Send,
    {
        self.locking.lock(session, accounts, body).await
    }

    pub async fn balance(
        &self,
        account: &AccountInstance,
        query: &BalanceQuery,
    ) -> LedgerResult<Money> {
        self.calculator.calculate(account, query).await
    }

    /// Raw lines of `account`, ascending by id.
    pub async fn lines(
        &self,
        account: &AccountInstance,
        filter: &LineFilter,
    ) -> LedgerResult<Vec<Line>> {
        Ok(self.store.lines(&account.key(), filter).await?)
    }

    pub fn validator(&self) -> ConsistencyValidator<S> {
        ConsistencyValidator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.accounts),
            self.locking.clone(),
            self.config.validation_batch_size,
        )
    }

    /// Validate with the default replaying repair.
    pub async fn validate(&self) -> LedgerResult<ValidationReport> {
        self.validator().perform().await
    }

    /// A transfer processor sharing this ledger's registries and locks.
    pub fn processor(&self) -> &TransferProcessor<S> {
        &self.processor
    }
}
