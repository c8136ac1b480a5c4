//! Ledger persistence boundary.
//!
//! The ledger engine talks to a relational store only through [`LedgerStore`] and
//! [`StoreTransaction`]; correctness under concurrency rests on the row locks and
//! transaction isolation those provide.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod schema;
pub mod r#trait;

pub use in_memory::{InMemoryLedgerStore, InMemoryTransaction};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresLedgerStore, PostgresTransaction};
pub use r#trait::{LedgerStore, StoreError, StoreTransaction};
