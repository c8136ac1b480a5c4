//! Account definitions, the account registry and resolved account instances.

use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};
use crate::money::Currency;

/// Longest accepted account identifier.
pub const MAX_IDENTIFIER_LEN: usize = 31;

/// Longest accepted scope identity (after the scope function ran).
pub const MAX_SCOPE_LEN: usize = 23;

/// Maps a caller-supplied scope value (e.g. a user id) to the stored scope identity.
pub type ScopeIdentifier = Arc<dyn Fn(&dyn fmt::Display) -> String + Send + Sync>;

/// Storage key of an account: identifier plus optional scope identity.
///
/// This is what the balance cache and the entry log are keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountKey {
    pub account: String,
    pub scope: Option<String>,
}

impl AccountKey {
    pub fn new(account: impl Into<String>, scope: Option<String>) -> Self {
        Self {
            account: account.into(),
            scope,
        }
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}[{}]", self.account, scope),
            None => f.write_str(&self.account),
        }
    }
}

/// A named ledger bucket, optionally scoped per external entity.
///
/// Built with the chained setters and handed to [`AccountRegistryBuilder::define`].
#[derive(Clone)]
pub struct Account {
    identifier: String,
    scope_identifier: Option<ScopeIdentifier>,
    positive_only: bool,
    negative_only: bool,
    currency: Option<Currency>,
}

impl Account {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            scope_identifier: None,
            positive_only: false,
            negative_only: false,
            currency: None,
        }
    }

    /// Scope this account with the default scope function (the value's `Display`).
    pub fn scoped(self) -> Self {
        self.scoped_by(|value| value.to_string())
    }

    /// Scope this account with a custom scope function.
    pub fn scoped_by<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn fmt::Display) -> String + Send + Sync + 'static,
    {
        self.scope_identifier = Some(Arc::new(f));
        self
    }

    pub fn positive_only(mut self) -> Self {
        self.positive_only = true;
        self
    }

    pub fn negative_only(mut self) -> Self {
        self.negative_only = true;
        self
    }

    pub fn currency(mut self, currency: Currency) -> Self {
        self.currency = Some(currency);
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn is_scoped(&self) -> bool {
        self.scope_identifier.is_some()
    }

    pub fn is_positive_only(&self) -> bool {
        self.positive_only
    }

    pub fn is_negative_only(&self) -> bool {
        self.negative_only
    }

    /// Currency of the account. Always set once the account is registered.
    pub fn account_currency(&self) -> Currency {
        self.currency.unwrap_or(Currency::USD)
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("identifier", &self.identifier)
            .field("scoped", &self.is_scoped())
            .field("positive_only", &self.positive_only)
            .field("negative_only", &self.negative_only)
            .field("currency", &self.currency)
            .finish()
    }
}

/// A resolved `(Account, scope identity)` pair.
///
/// Equality, hashing and ordering only look at `(scope identity, identifier)`. The
/// ordering is the global lock order used by every multi-account lock.
#[derive(Clone)]
pub struct AccountInstance {
    account: Arc<Account>,
    scope: Option<String>,
}

impl AccountInstance {
    pub fn identifier(&self) -> &str {
        self.account.identifier()
    }

    pub fn scope_identity(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn currency(&self) -> Currency {
        self.account.account_currency()
    }

    pub fn is_positive_only(&self) -> bool {
        self.account.positive_only
    }

    pub fn is_negative_only(&self) -> bool {
        self.account.negative_only
    }

    pub fn key(&self) -> AccountKey {
        AccountKey::new(self.identifier(), self.scope.clone())
    }
}

impl PartialEq for AccountInstance {
    fn eq(&self, other: &Self) -> bool {
        self.identifier() == other.identifier() && self.scope == other.scope
    }
}

impl Eq for AccountInstance {}

impl Hash for AccountInstance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identifier().hash(state);
        self.scope.hash(state);
    }
}

impl PartialOrd for AccountInstance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AccountInstance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.scope
            .cmp(&other.scope)
            .then_with(|| self.identifier().cmp(other.identifier()))
    }
}

impl fmt::Debug for AccountInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountInstance({})", self)
    }
}

impl fmt::Display for AccountInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}[{}]", self.identifier(), scope),
            None => f.write_str(self.identifier()),
        }
    }
}

/// Immutable set of defined accounts, keyed by `(identifier, scoped?)`.
#[derive(Debug, Clone)]
pub struct AccountRegistry {
    accounts: HashMap<(String, bool), Arc<Account>>,
}

impl AccountRegistry {
    pub fn builder() -> AccountRegistryBuilder {
        AccountRegistryBuilder::default()
    }

    /// Resolve an identifier (and scope value for scoped accounts) to an instance.
    pub fn resolve(
        &self,
        identifier: &str,
        scope: Option<&dyn fmt::Display>,
    ) -> LedgerResult<AccountInstance> {
        let scoped = scope.is_some();
        let account = self
            .accounts
            .get(&(identifier.to_string(), scoped))
            .ok_or_else(|| LedgerError::UnknownAccount {
                identifier: identifier.to_string(),
                scoped,
            })?;

        let scope = match (scope, &account.scope_identifier) {
            (Some(value), Some(f)) => {
                let identity = f(value);
                // An empty identity would share storage with the unscoped account.
                if identity.is_empty() {
                    return Err(LedgerError::EmptyScopeIdentifier {
                        identifier: identifier.to_string(),
                    });
                }
                if identity.chars().count() > MAX_SCOPE_LEN {
                    return Err(LedgerError::ScopeIdentifierTooLong {
                        scope: identity,
                        max: MAX_SCOPE_LEN,
                    });
                }
                Some(identity)
            }
            _ => None,
        };

        Ok(AccountInstance {
            account: Arc::clone(account),
            scope,
        })
    }

    /// Resolve an unscoped account.
    pub fn account(&self, identifier: &str) -> LedgerResult<AccountInstance> {
        self.resolve(identifier, None)
    }

    /// Resolve a scoped account.
    pub fn scoped_account(
        &self,
        identifier: &str,
        scope: &dyn fmt::Display,
    ) -> LedgerResult<AccountInstance> {
        self.resolve(identifier, Some(scope))
    }

    /// Rebuild an instance from a stored key, e.g. when scanning the entry log.
    pub fn from_key(&self, key: &AccountKey) -> LedgerResult<AccountInstance> {
        if key.scope.as_deref() == Some("") {
            return Err(LedgerError::EmptyScopeIdentifier {
                identifier: key.account.clone(),
            });
        }
        let scoped = key.scope.is_some();
        let account = self
            .accounts
            .get(&(key.account.clone(), scoped))
            .ok_or_else(|| LedgerError::UnknownAccount {
                identifier: key.account.clone(),
                scoped,
            })?;
        Ok(AccountInstance {
            account: Arc::clone(account),
            scope: key.scope.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

/// Collects account definitions at configuration time.
#[derive(Debug)]
pub struct AccountRegistryBuilder {
    accounts: HashMap<(String, bool), Arc<Account>>,
    default_currency: Currency,
}

impl Default for AccountRegistryBuilder {
    fn default() -> Self {
        Self {
            accounts: HashMap::new(),
            default_currency: Currency::USD,
        }
    }
}

impl AccountRegistryBuilder {
    /// Currency given to accounts defined afterwards without an explicit one.
    pub fn default_currency(&mut self, currency: Currency) -> &mut Self {
        self.default_currency = currency;
        self
    }

    pub fn define(&mut self, mut account: Account) -> LedgerResult<&mut Self> {
        if account.identifier.chars().count() > MAX_IDENTIFIER_LEN {
            return Err(LedgerError::IdentifierTooLong {
                identifier: account.identifier,
                max: MAX_IDENTIFIER_LEN,
            });
        }

        let key = (account.identifier.clone(), account.is_scoped());
        if self.accounts.contains_key(&key) {
            return Err(LedgerError::DuplicateAccount {
                identifier: key.0,
                scoped: key.1,
            });
        }

        account.currency.get_or_insert(self.default_currency);
        self.accounts.insert(key, Arc::new(account));
        Ok(self)
    }

    pub fn build(&mut self) -> AccountRegistry {
        AccountRegistry {
            accounts: std::mem::take(&mut self.accounts),
        }
    }
}
