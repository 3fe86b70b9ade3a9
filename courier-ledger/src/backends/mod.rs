//! Backing store implementations for the ledger
//!
//! - `sqlite`: SQLite database through `sqlx`, for real campaigns
//! - `memory`: `DashMap`-backed store for tests and dry runs

pub mod memory;
pub mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;
