//! Legal transfer definitions.

use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;

use crate::account::AccountInstance;
use crate::error::{LedgerError, LedgerResult};
use crate::records::Line;

/// Longest accepted transfer code.
pub const MAX_CODE_LEN: usize = 47;

/// Produces a human-readable description of a line written by a transfer.
pub type DescribeLine = Arc<dyn Fn(&Line) -> String + Send + Sync>;

/// A declared movement template: `from -> to` under `code`.
#[derive(Clone)]
pub struct TransferDefinition {
    from: String,
    to: String,
    code: String,
    description: Option<DescribeLine>,
}

impl TransferDefinition {
    pub fn new(from: impl Into<String>, to: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            code: code.into(),
            description: None,
        }
    }

    pub fn described_by<F>(mut self, f: F) -> Self
    where
        F: Fn(&Line) -> String + Send + Sync + 'static,
    {
        self.description = Some(Arc::new(f));
        self
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    /// Description of `line`, falling back to the transfer code.
    pub fn describe(&self, line: &Line) -> String {
        match &self.description {
            Some(f) => f(line),
            None => self.code.clone(),
        }
    }
}

impl fmt::Debug for TransferDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferDefinition")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("code", &self.code)
            .field("described", &self.description.is_some())
            .finish()
    }
}

type TransferKey = (String, String, String);

/// Immutable set of legal transfers, keyed by `(from, to, code)`.
#[derive(Debug, Clone, Default)]
pub struct TransferRegistry {
    transfers: HashMap<TransferKey, Arc<TransferDefinition>>,
}

impl TransferRegistry {
    pub fn builder() -> TransferRegistryBuilder {
        TransferRegistryBuilder::default()
    }

    pub fn find(
        &self,
        from: &AccountInstance,
        to: &AccountInstance,
        code: &str,
    ) -> Option<&TransferDefinition> {
        let key = (
            from.identifier().to_string(),
            to.identifier().to_string(),
            code.to_string(),
        );
        self.transfers.get(&key).map(Arc::as_ref)
    }

    /// Like [`find`](Self::find) but fails with `TransferNotAllowed` when undeclared.
    pub fn authorize(
        &self,
        from: &AccountInstance,
        to: &AccountInstance,
        code: &str,
    ) -> LedgerResult<&TransferDefinition> {
        self.find(from, to, code).ok_or_else(|| {
            LedgerError::not_allowed(
                from.identifier(),
                to.identifier(),
                code,
                "no such transfer is defined",
            )
        })
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TransferRegistryBuilder {
    transfers: HashMap<TransferKey, Arc<TransferDefinition>>,
}

impl TransferRegistryBuilder {
    pub fn define(&mut self, transfer: TransferDefinition) -> LedgerResult<&mut Self> {
        if transfer.code.chars().count() > MAX_CODE_LEN {
            return Err(LedgerError::CodeTooLong {
                code: transfer.code,
                max: MAX_CODE_LEN,
            });
        }

        let key = (
            transfer.from.clone(),
            transfer.to.clone(),
            transfer.code.clone(),
        );
        if self.transfers.contains_key(&key) {
            let (from, to, code) = key;
            return Err(LedgerError::DuplicateTransfer { from, to, code });
        }
        self.transfers.insert(key, Arc::new(transfer));
        Ok(self)
    }

    pub fn build(&mut self) -> TransferRegistry {
        TransferRegistry {
            transfers: std::mem::take(&mut self.transfers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, AccountRegistry};

    fn accounts() -> AccountRegistry {
        let mut builder = AccountRegistry::builder();
        builder
            .define(Account::new("work"))
            .unwrap()
            .define(Account::new("cash"))
            .unwrap()
            .define(Account::new("cash").scoped())
            .unwrap();
        builder.build()
    }

    #[test]
    fn duplicate_transfers_are_rejected() {
        let mut builder = TransferRegistry::builder();
        builder.define(TransferDefinition::new("work", "cash", "salary")).unwrap();
        let err = builder
            .define(TransferDefinition::new("work", "cash", "salary"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateTransfer { .. }));
        assert!(builder.define(TransferDefinition::new("cash", "work", "salary")).is_ok());
    }

    #[test]
    fn long_codes_are_rejected() {
        let mut builder = TransferRegistry::builder();
        let err = builder
            .define(TransferDefinition::new("work", "cash", "c".repeat(MAX_CODE_LEN + 1)))
            .unwrap_err();
        assert!(matches!(err, LedgerError::CodeTooLong { .. }));
    }

    #[test]
    fn authorize_applies_to_scoped_and_unscoped_instances() {
        let reg = accounts();
        let mut builder = TransferRegistry::builder();
        builder.define(TransferDefinition::new("work", "cash", "salary")).unwrap();
        let transfers = builder.build();

        let work = reg.account("work").unwrap();
        let cash = reg.account("cash").unwrap();
        let user_cash = reg.scoped_account("cash", &7).unwrap();

        assert!(transfers.authorize(&work, &cash, "salary").is_ok());
        assert!(transfers.find(&work, &user_cash, "salary").is_some());
        assert!(transfers.find(&cash, &work, "salary").is_none());

        let err = transfers.authorize(&work, &cash, "bonus").unwrap_err();
        assert!(matches!(
            err,
            LedgerError::TransferNotAllowed { ref code, .. } if code == "bonus"
        ));
    }
}
