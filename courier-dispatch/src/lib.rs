//! Account rotation and resumable batch delivery
//!
//! This crate provides functionality to:
//! - Read and rewrite CSV progress files, the per-run checkpoint
//! - Choose and rotate sending identities under a quota and rate limits
//! - Send batches concurrently and recover from provider throttling
//! - Maintain recipient lists across several progress files

pub mod campaign;
pub mod engine;
mod error;
pub mod recipients;
mod report;
pub mod selector;
pub mod signature;
mod template;
pub mod transport;

pub use engine::{DispatchConfig, DispatchEngine};
pub use error::{DispatchError, RecipientError, TransportError};
pub use recipients::{ColumnConfig, RecipientEntry, RecipientLedger};
pub use report::{DispatchReport, FailedRecipient};
pub use selector::{
    DispatchSession, Rotation, RotationPolicy, RotationReason, Rotator, ThresholdRange,
};
pub use template::MessageTemplate;
pub use transport::{Binding, OutgoingMessage, SmtpConfig, SmtpTransport, TlsMode, Transport};
