//! Infrastructure layer: ledger stores (in-memory, Postgres) and configuration.

pub mod config;
pub mod store;

pub use config::{ConfigError, LedgerConfig, LockConfig};
pub use store::{InMemoryLedgerStore, LedgerStore, StoreError, StoreTransaction};
#[cfg(feature = "postgres")]
pub use store::PostgresLedgerStore;
