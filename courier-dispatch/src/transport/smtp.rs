//! SMTP transport built on `lettre`
//!
//! Every identity gets its own pooled `AsyncSmtpTransport` authenticated with
//! the identity's credential. Connections are reused across sends until the
//! binding is closed.

use std::sync::Arc;

use async_trait::async_trait;
use courier_common::{Address, outgoing};
use courier_ledger::SendingIdentity;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::{PoolConfig, authentication::Credentials},
};
use parking_lot::Mutex;
use serde::Deserialize;

use super::{Binding, OutgoingMessage, Transport};
use crate::error::TransportError;

type Pool = AsyncSmtpTransport<Tokio1Executor>;

/// How the connection to the relay is secured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum TlsMode {
    /// TLS from the first byte, usually on port 465
    #[default]
    Wrapper,
    /// Plain connection upgraded with STARTTLS, usually on port 587
    StartTls,
    /// No encryption at all. Only for local relays and tests.
    None,
}

/// Relay settings shared by every identity
///
/// ```ron
/// smtp: (
///     host: "smtp.gmail.com",
///     port: 465,
///     tls: Wrapper,
///     pool_max_size: 3,
/// )
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SmtpConfig {
    pub host: String,

    #[serde(default = "defaults::port")]
    pub port: u16,

    #[serde(default)]
    pub tls: TlsMode,

    /// Upper bound on pooled connections per identity
    #[serde(default = "defaults::pool_max_size")]
    pub pool_max_size: u32,
}

mod defaults {
    pub const fn port() -> u16 {
        465
    }

    pub const fn pool_max_size() -> u32 {
        3
    }
}

impl SmtpConfig {
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: defaults::port(),
            tls: TlsMode::default(),
            pool_max_size: defaults::pool_max_size(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmtpTransport {
    config: SmtpConfig,
}

impl SmtpTransport {
    #[must_use]
    pub const fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn pool_for(&self, identity: &SendingIdentity, max_size: u32) -> Result<Pool, TransportError> {
        let credentials = Credentials::new(
            identity.address.to_string(),
            identity.credential.clone(),
        );

        let builder = match self.config.tls {
            TlsMode::Wrapper => Pool::relay(&self.config.host)
                .map_err(|e| TransportError::Build(e.to_string()))?,
            TlsMode::StartTls => Pool::starttls_relay(&self.config.host)
                .map_err(|e| TransportError::Build(e.to_string()))?,
            TlsMode::None => Pool::builder_dangerous(&self.config.host),
        };

        Ok(builder
            .port(self.config.port)
            .credentials(credentials)
            .pool_config(PoolConfig::new().max_size(max_size))
            .build())
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn bind(&self, identity: &SendingIdentity) -> Result<Arc<dyn Binding>, TransportError> {
        let pool = self.pool_for(identity, self.config.pool_max_size)?;
        let mailbox: Mailbox = identity
            .address
            .parse()
            .map_err(|_| TransportError::InvalidAddress(identity.address.to_string()))?;

        outgoing!(
            level = DEBUG,
            identity = %identity.address,
            host = %self.config.host,
            port = self.config.port,
            "Bound SMTP transport"
        );

        Ok(Arc::new(SmtpBinding {
            address: identity.address.clone(),
            mailbox,
            pool: Mutex::new(Some(pool)),
        }))
    }

    async fn verify(&self, identity: &SendingIdentity) -> Result<(), TransportError> {
        let pool = self.pool_for(identity, 1)?;

        let connected = pool
            .test_connection()
            .await
            .map_err(|e| TransportError::Smtp(e.to_string()))?;

        outgoing!(
            level = INFO,
            identity = %identity.address,
            connected,
            "Verification handshake finished"
        );

        if connected {
            Ok(())
        } else {
            Err(TransportError::Smtp(format!(
                "{}:{} refused the connection",
                self.config.host, self.config.port
            )))
        }
    }
}

#[derive(Debug)]
struct SmtpBinding {
    address: Address,
    mailbox: Mailbox,
    pool: Mutex<Option<Pool>>,
}

impl SmtpBinding {
    fn build_message(&self, message: OutgoingMessage<'_>) -> Result<(Message, String), TransportError> {
        let to: Mailbox = message
            .to
            .parse()
            .map_err(|_| TransportError::InvalidAddress(message.to.to_string()))?;

        let message_id = message_id(&self.address);
        let built = Message::builder()
            .from(self.mailbox.clone())
            .to(to)
            .subject(message.subject)
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_HTML)
            .body(message.html.to_string())
            .map_err(|e| TransportError::Build(e.to_string()))?;

        Ok((built, message_id))
    }
}

#[async_trait]
impl Binding for SmtpBinding {
    fn identity(&self) -> &Address {
        &self.address
    }

    async fn send(&self, message: OutgoingMessage<'_>) -> Result<String, TransportError> {
        let (built, message_id) = self.build_message(message)?;

        // Clones share the same connection pool.
        let pool = self
            .pool
            .lock()
            .clone()
            .ok_or_else(|| TransportError::Smtp(format!("binding for {} is closed", self.address)))?;

        pool.send(built)
            .await
            .map_err(|e| TransportError::Smtp(e.to_string()))?;

        outgoing!(
            identity = %self.address,
            recipient = %message.to,
            message_id = %message_id,
            "Message accepted"
        );

        Ok(message_id)
    }

    async fn close(&self) {
        if self.pool.lock().take().is_some() {
            outgoing!(level = DEBUG, identity = %self.address, "Closed SMTP transport");
        }
    }
}

/// `<ULID@sender-domain>`
fn message_id(sender: &Address) -> String {
    format!("<{}@{}>", ulid::Ulid::new(), sender.domain())
}
