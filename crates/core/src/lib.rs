//! `dualbook-core`: double-entry ledger domain building blocks.
//!
//! Pure domain only: account and transfer registries, money, record types and the
//! error taxonomy. No IO.

pub mod account;
pub mod error;
pub mod id;
pub mod money;
pub mod records;
pub mod time_range;
pub mod transfer;

pub use account::{
    Account, AccountInstance, AccountKey, AccountRegistry, AccountRegistryBuilder,
    MAX_IDENTIFIER_LEN, MAX_SCOPE_LEN,
};
pub use error::{LedgerError, LedgerResult};
pub use id::{LineCheckId, LineId};
pub use money::{Currency, InvalidCurrency, Money};
pub use records::{
    AccountBalance, Line, LineCheck, LineDetail, LineFilter, LineMetadata, NewLine, NewLineCheck,
};
pub use time_range::{Interval, TimeRange};
pub use transfer::{MAX_CODE_LEN, TransferDefinition, TransferRegistry, TransferRegistryBuilder};
