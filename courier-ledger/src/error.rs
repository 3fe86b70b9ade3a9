//! Error types for the courier-ledger crate.
//!
//! Every ledger and delivery log operation returns [`LedgerError`]. Any of
//! these reaching the dispatcher means it can no longer trust its own
//! bookkeeping, so callers propagate rather than retry.

use thiserror::Error;

/// Top-level ledger error type.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The backing database failed or is unreachable.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No identity is registered under this address.
    #[error("Unknown identity: {0}")]
    UnknownIdentity(String),

    /// An identity can't be created without a credential.
    #[error("A credential is required to create identity {0}")]
    MissingCredential(String),

    /// Quotas must be positive.
    #[error("Invalid send limit {limit} for {address}: must be greater than zero")]
    InvalidLimit { address: String, limit: u64 },

    /// A stored row couldn't be decoded.
    #[error("Corrupted ledger data: {0}")]
    Corrupted(String),
}

impl LedgerError {
    /// Returns `true` if the error came from the store itself rather than from
    /// the caller's input.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Corrupted(_))
    }
}

/// Specialized `Result` type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_classification() {
        assert!(LedgerError::Database(sqlx::Error::PoolClosed).is_storage());
        assert!(LedgerError::Corrupted("status".to_string()).is_storage());
        assert!(!LedgerError::UnknownIdentity("a@b.c".to_string()).is_storage());
        assert!(!LedgerError::MissingCredential("a@b.c".to_string()).is_storage());
    }

    #[test]
    fn test_error_display() {
        let error = LedgerError::InvalidLimit {
            address: "sender@example.com".to_string(),
            limit: 0,
        };
        assert_eq!(
            error.to_string(),
            "Invalid send limit 0 for sender@example.com: must be greater than zero"
        );
    }
}
