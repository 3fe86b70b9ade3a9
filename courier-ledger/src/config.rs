use std::sync::Arc;

use serde::Deserialize;

use crate::{Ledger, MemoryLedger, SqliteLedger};

/// Ledger backend selection
///
/// # Examples
///
/// SQLite database (production):
/// ```ron
/// Courier (
///     ledger: Sqlite(
///         url: "sqlite:///var/lib/courier/ledger.db",
///     ),
/// )
/// ```
///
/// In-memory ledger, nothing persisted (testing):
/// ```ron
/// Courier (
///     ledger: Memory,
/// )
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub enum LedgerConfig {
    Sqlite {
        #[serde(default = "default_url")]
        url: String,
    },
    Memory,
}

fn default_url() -> String {
    "sqlite://courier.db".to_string()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self::Sqlite { url: default_url() }
    }
}

impl LedgerConfig {
    /// Open the configured store as a trait object
    ///
    /// # Errors
    /// If the database can't be reached or its tables can't be created. This
    /// happens before any send, so it aborts the run.
    pub async fn into_ledger(self) -> crate::Result<Arc<dyn Ledger>> {
        match self {
            Self::Sqlite { url } => Ok(Arc::new(SqliteLedger::connect(&url).await?)),
            Self::Memory => Ok(Arc::new(MemoryLedger::new())),
        }
    }
}
