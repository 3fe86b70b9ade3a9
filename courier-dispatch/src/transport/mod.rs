//! The seam between the dispatcher and the mail provider.
//!
//! A [`Transport`] turns a sending identity into a [`Binding`]: an
//! authenticated, reusable connection that sends as that identity until it is
//! closed. The engine holds at most one binding at a time and closes it on
//! every rotation.

pub mod smtp;

use std::sync::Arc;

use async_trait::async_trait;
use courier_common::Address;
use courier_ledger::SendingIdentity;

pub use self::smtp::{SmtpConfig, SmtpTransport, TlsMode};
use crate::error::TransportError;

/// A single rendered message for one recipient
#[derive(Debug, Clone, Copy)]
pub struct OutgoingMessage<'a> {
    pub to: &'a Address,
    pub subject: &'a str,
    pub html: &'a str,
}

#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Authenticate as `identity` and return a binding that sends as it.
    ///
    /// # Errors
    /// If the binding can't be constructed. Authentication failures may also
    /// surface later, on the first send.
    async fn bind(&self, identity: &SendingIdentity) -> Result<Arc<dyn Binding>, TransportError>;

    /// Verification-only handshake: connect and authenticate as `identity`
    /// without sending anything.
    ///
    /// # Errors
    /// `TransportError::Unsupported` unless the transport implements it.
    async fn verify(&self, identity: &SendingIdentity) -> Result<(), TransportError> {
        let _ = identity;
        Err(TransportError::Unsupported)
    }
}

#[async_trait]
pub trait Binding: Send + Sync + std::fmt::Debug {
    /// The identity this binding sends as
    fn identity(&self) -> &Address;

    /// Send one message, returning the provider message id.
    ///
    /// # Errors
    /// A descriptive error carrying the provider's response text, which the
    /// engine inspects for rate-limit signatures.
    async fn send(&self, message: OutgoingMessage<'_>) -> Result<String, TransportError>;

    /// Release pooled connections. Sends after `close` fail.
    async fn close(&self);
}
