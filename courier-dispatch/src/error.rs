//! Typed error handling for dispatch operations.
//!
//! This module separates failures by how the engine reacts to them:
//! - Transport errors: per-recipient, recovered by rotation when they carry a
//!   rate-limit signature, otherwise recorded and reported
//! - Progress file errors: the checkpoint can't be read or written
//! - Dispatch errors: fatal for the run (setup, exhaustion, bookkeeping)

use std::path::PathBuf;

use courier_ledger::LedgerError;
use thiserror::Error;

use crate::signature;

/// Errors raised by the external transport for a single identity binding.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The provider rejected the session or the message.
    #[error("SMTP error: {0}")]
    Smtp(String),

    /// The message or binding couldn't be constructed.
    #[error("Failed to build message: {0}")]
    Build(String),

    /// A sender or recipient address was rejected before sending.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The transport doesn't offer this capability.
    #[error("Operation not supported by this transport")]
    Unsupported,
}

impl TransportError {
    /// Returns `true` if the provider is throttling this identity, meaning
    /// the recipient should be retried from another identity.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::Smtp(message) => signature::is_rate_limited(message),
            Self::Build(_) | Self::InvalidAddress(_) | Self::Unsupported => false,
        }
    }
}

/// Errors reading or writing a progress file.
#[derive(Debug, Error)]
pub enum RecipientError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The header row doesn't contain the recipient column.
    #[error("Progress file has no '{0}' column")]
    MissingColumn(String),
}

impl RecipientError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Run-level errors.
///
/// Anything surfacing as a `DispatchError` stops the batch loop; the progress
/// file is still rewritten with what was sent so far before it is returned.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The ledger or delivery log couldn't be read or written.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// The progress file couldn't be read or written.
    #[error("Progress file error: {0}")]
    Recipients(#[from] RecipientError),

    /// A transport binding couldn't be created for the selected identity.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The message template couldn't be loaded.
    #[error("Failed to read template {path}: {source}")]
    Template {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl DispatchError {
    /// Returns `true` for failures detected before any message is sent.
    #[must_use]
    pub const fn is_setup(&self) -> bool {
        matches!(self, Self::Template { .. } | Self::Configuration(_))
    }
}
