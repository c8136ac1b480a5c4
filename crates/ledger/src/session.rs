//! Explicit execution context for ledger work.
//!
//! A `LedgerSession` is the value every lock-aware call is threaded through. It
//! owns at most one open store transaction and, while inside a lock scope, the map
//! of locked accounts to their balance rows. Nothing about locking is ambient.

use std::collections::HashMap;

use uuid::Uuid;

use dualbook_core::{AccountBalance, AccountInstance, LedgerError, LedgerResult};
use dualbook_infra::{LedgerStore, StoreTransaction};

pub struct LedgerSession<Tx> {
    id: Uuid,
    tx: Option<Tx>,
    /// The open transaction was started by the application, not by a lock scope.
    application_tx: bool,
    held: Option<HashMap<AccountInstance, AccountBalance>>,
}

impl<Tx> Default for LedgerSession<Tx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Tx> core::fmt::Debug for LedgerSession<Tx> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LedgerSession")
            .field("id", &self.id)
            .field("in_transaction", &self.tx.is_some())
            .field("locked", &self.held.as_ref().map(HashMap::len))
            .finish()
    }
}

impl<Tx> LedgerSession<Tx> {
    pub fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            tx: None,
            application_tx: false,
            held: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_locked(&self) -> bool {
        self.held.is_some()
    }

    /// Transactions opened by the application that a lock scope would nest inside.
    pub fn open_transactions(&self) -> usize {
        usize::from(self.application_tx && self.tx.is_some())
    }

    /// Accounts locked by the current lock scope, in lock order.
    pub fn locked_accounts(&self) -> Vec<AccountInstance> {
        let mut accounts: Vec<_> = self
            .held
            .as_ref()
            .map(|held| held.keys().cloned().collect())
            .unwrap_or_default();
        accounts.sort();
        accounts
    }

    /// The balance row held for `account`; fails unless the account is locked.
    pub fn balance_for_locked_account(
        &self,
        account: &AccountInstance,
    ) -> LedgerResult<&AccountBalance> {
        self.held
            .as_ref()
            .and_then(|held| held.get(account))
            .ok_or_else(|| LedgerError::LockNotHeld {
                account: account.to_string(),
            })
    }

    /// Record a new balance for a locked account after writing it to the store.
    pub fn set_locked_balance(&mut self, account: &AccountInstance, balance: i64) -> LedgerResult<()> {
        let row = self
            .held
            .as_mut()
            .and_then(|held| held.get_mut(account))
            .ok_or_else(|| LedgerError::LockNotHeld {
                account: account.to_string(),
            })?;
        row.balance = balance;
        Ok(())
    }

    /// Fails with `LockNotHeld` naming the first of `accounts` not held.
    pub fn ensure_locked(&self, accounts: &[AccountInstance]) -> LedgerResult<()> {
        for account in accounts {
            self.balance_for_locked_account(account)?;
        }
        Ok(())
    }

    /// The open transaction.
    pub fn transaction(&mut self) -> LedgerResult<&mut Tx> {
        self.tx
            .as_mut()
            .ok_or_else(|| LedgerError::store("no transaction is open in this session"))
    }

    pub(crate) fn attach(&mut self, tx: Tx) {
        self.tx = Some(tx);
        self.application_tx = false;
    }

    pub(crate) fn detach(&mut self) -> Option<Tx> {
        self.tx.take()
    }

    pub(crate) fn enter_lock(&mut self, held: HashMap<AccountInstance, AccountBalance>) {
        self.held = Some(held);
    }

    pub(crate) fn exit_lock(&mut self) {
        self.held = None;
    }
}

impl<Tx: StoreTransaction> LedgerSession<Tx> {
    /// Open an application transaction on this session.
    pub async fn begin<S>(&mut self, store: &S) -> LedgerResult<()>
    where
        S: LedgerStore<Tx = Tx>,
    {
        if self.tx.is_some() {
            return Err(LedgerError::store("a transaction is already open in this session"));
        }
        self.tx = Some(store.begin().await?);
        self.application_tx = true;
        Ok(())
    }

    pub async fn commit(&mut self) -> LedgerResult<()> {
        let tx = self.take_application_tx()?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(&mut self) -> LedgerResult<()> {
        let tx = self.take_application_tx()?;
        tx.rollback().await?;
        Ok(())
    }

    fn take_application_tx(&mut self) -> LedgerResult<Tx> {
        if self.is_locked() {
            return Err(LedgerError::store(
                "cannot end the transaction from inside a lock scope",
            ));
        }
        if !self.application_tx {
            return Err(LedgerError::store("no application transaction is open"));
        }
        self.application_tx = false;
        self.tx
            .take()
            .ok_or_else(|| LedgerError::store("no application transaction is open"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dualbook_core::{Account, AccountRegistry};
    use dualbook_infra::{InMemoryLedgerStore, store::InMemoryTransaction};

    fn cash() -> AccountInstance {
        let mut builder = AccountRegistry::builder();
        builder.define(Account::new("cash")).unwrap();
        builder.build().account("cash").unwrap()
    }

    #[test]
    fn unlocked_session_holds_nothing() {
        let session: LedgerSession<InMemoryTransaction> = LedgerSession::new();
        assert!(!session.is_locked());
        let err = session.balance_for_locked_account(&cash()).unwrap_err();
        assert_eq!(err, LedgerError::LockNotHeld { account: "cash".into() });
    }

    #[test]
    fn held_balances_can_be_updated() {
        let account = cash();
        let mut session: LedgerSession<InMemoryTransaction> = LedgerSession::new();
        session.enter_lock(HashMap::from([(
            account.clone(),
            AccountBalance {
                account: account.key(),
                balance: 10,
            },
        )]));
        session.set_locked_balance(&account, 25).unwrap();
        assert_eq!(session.balance_for_locked_account(&account).unwrap().balance, 25);
        session.exit_lock();
        assert!(session.ensure_locked(&[account]).is_err());
    }

    #[tokio::test]
    async fn application_transactions_count_as_open() {
        let store = InMemoryLedgerStore::new();
        let mut session = LedgerSession::new();
        assert_eq!(session.open_transactions(), 0);
        session.begin(&store).await.unwrap();
        assert_eq!(session.open_transactions(), 1);
        assert!(session.begin(&store).await.is_err());
        session.commit().await.unwrap();
        assert_eq!(session.open_transactions(), 0);
        assert!(session.rollback().await.is_err());
    }
}
