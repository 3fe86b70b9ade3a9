//! Account ledger and delivery log
//!
//! The account ledger is the authoritative record of each sending identity's
//! quota, usage and rate-limit state; the delivery log is an append-only
//! record of every send attempt. Both live in the same store.

pub mod backends;
pub mod config;
pub mod error;
pub mod r#trait;
pub mod types;

pub use backends::{MemoryLedger, SqliteLedger};
pub use config::LedgerConfig;
pub use error::{LedgerError, Result};
pub use r#trait::{AccountLedger, DeliveryLog, Ledger};
pub use types::{DeliveryRecord, DeliveryStatus, IdentityStats, IdentityStatus, SendingIdentity};
