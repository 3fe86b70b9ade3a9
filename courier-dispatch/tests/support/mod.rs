//! Scripted transport for dispatch tests
//!
//! Identities and recipients can be told to fail in specific ways; every bind,
//! close and accepted message is recorded for later assertions.
//!
//! ```rust,no_run
//! let transport = MockTransport::builder()
//!     .rate_limited("a@example.com")
//!     .failing_recipient("bad@example.com", "550 5.1.1 User unknown")
//!     .build();
//! ```
#![allow(dead_code)] // Not every test binary uses every helper

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use courier_common::Address;
use courier_dispatch::{
    Binding, DispatchConfig, DispatchEngine, MessageTemplate, OutgoingMessage, RotationPolicy,
    ThresholdRange, Transport, TransportError,
};
use courier_ledger::{
    AccountLedger, DeliveryLog, DeliveryRecord, IdentityStats, Ledger, LedgerError, MemoryLedger,
    SendingIdentity,
};
use parking_lot::Mutex;

pub const RATE_LIMIT_RESPONSE: &str = "454 4.7.0 Too many login attempts, please try again later";

pub fn address(raw: &str) -> Address {
    Address::parse(raw).expect("valid test address")
}

#[derive(Debug, Default)]
struct Script {
    rate_limited: AHashSet<Address>,
    failing_recipients: AHashMap<Address, String>,
}

#[derive(Debug, Default)]
struct Journal {
    binds: Vec<Address>,
    closes: Vec<Address>,
    /// (identity, recipient) for every accepted message
    delivered: Vec<(Address, Address)>,
    attempts: usize,
}

#[derive(Debug, Default)]
struct Shared {
    script: Script,
    journal: Mutex<Journal>,
    ids: AtomicUsize,
}

impl Shared {
    fn respond(&self, identity: &Address, recipient: &Address) -> Result<String, TransportError> {
        let mut journal = self.journal.lock();
        journal.attempts += 1;

        if self.script.rate_limited.contains(identity) {
            return Err(TransportError::Smtp(RATE_LIMIT_RESPONSE.to_string()));
        }
        if let Some(response) = self.script.failing_recipients.get(recipient) {
            return Err(TransportError::Smtp(response.clone()));
        }

        journal.delivered.push((identity.clone(), recipient.clone()));
        let id = self.ids.fetch_add(1, Ordering::SeqCst);
        Ok(format!("<{id}@{}>", identity.domain()))
    }
}

#[derive(Debug, Default)]
pub struct MockTransportBuilder {
    script: Script,
}

impl MockTransportBuilder {
    /// Every send from `identity` is answered with a throttling response
    #[must_use]
    pub fn rate_limited(mut self, identity: &str) -> Self {
        self.script.rate_limited.insert(address(identity));
        self
    }

    /// Every send to `recipient` fails with `response`
    #[must_use]
    pub fn failing_recipient(mut self, recipient: &str, response: &str) -> Self {
        self.script
            .failing_recipients
            .insert(address(recipient), response.to_string());
        self
    }

    pub fn build(self) -> Arc<MockTransport> {
        Arc::new(MockTransport {
            shared: Arc::new(Shared {
                script: self.script,
                ..Shared::default()
            }),
        })
    }
}

#[derive(Debug)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl MockTransport {
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::default()
    }

    pub fn accepting() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn binds(&self) -> Vec<Address> {
        self.shared.journal.lock().binds.clone()
    }

    pub fn closes(&self) -> Vec<Address> {
        self.shared.journal.lock().closes.clone()
    }

    pub fn delivered(&self) -> Vec<(Address, Address)> {
        self.shared.journal.lock().delivered.clone()
    }

    pub fn attempts(&self) -> usize {
        self.shared.journal.lock().attempts
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn bind(&self, identity: &SendingIdentity) -> Result<Arc<dyn Binding>, TransportError> {
        self.shared
            .journal
            .lock()
            .binds
            .push(identity.address.clone());

        Ok(Arc::new(MockBinding {
            address: identity.address.clone(),
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
struct MockBinding {
    address: Address,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

#[async_trait]
impl Binding for MockBinding {
    fn identity(&self) -> &Address {
        &self.address
    }

    async fn send(&self, message: OutgoingMessage<'_>) -> Result<String, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Smtp("binding closed".to_string()));
        }

        // Let sibling sends interleave.
        tokio::task::yield_now().await;

        self.shared.respond(&self.address, message.to)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.journal.lock().closes.push(self.address.clone());
        }
    }
}

/// Dispatch settings for tests: no delay between batches
pub fn config(policy: RotationPolicy, batch_size: usize) -> DispatchConfig {
    DispatchConfig {
        batch_size,
        batch_delay_ms: 0,
        policy,
        rotation_threshold: ThresholdRange { min: 1000, max: 1000 },
        max_reported_failures: 10,
    }
}

pub fn engine(
    ledger: Arc<dyn Ledger>,
    transport: Arc<MockTransport>,
    config: DispatchConfig,
) -> DispatchEngine {
    DispatchEngine::new(
        ledger,
        transport,
        config,
        MessageTemplate::new("Quarterly update", "<p>Hello</p>"),
    )
    .expect("valid dispatch config")
}

/// Register identities, each with `(address, sent_count, max_send_limit)`
pub async fn seed(ledger: &dyn Ledger, identities: &[(&str, u64, u64)]) {
    for (raw, sent_count, limit) in identities {
        let sender = address(raw);
        ledger
            .upsert(&sender, Some("app-password"), *limit)
            .await
            .expect("upsert failed");
        for _ in 0..*sent_count {
            ledger.record_use(&sender).await.expect("record_use failed");
        }
    }
}

/// Write a progress file with one row per recipient and a passthrough column
pub async fn progress_file(dir: &Path, recipients: &[(&str, bool)]) -> PathBuf {
    let mut contents = String::from("Name,E-mail 1 - Value,Sent\n");
    for (n, (recipient, sent)) in recipients.iter().enumerate() {
        let marker = if *sent { "yes" } else { "no" };
        contents.push_str(&format!("Person {n},{recipient},{marker}\n"));
    }

    let path = dir.join("recipients.csv");
    tokio::fs::write(&path, contents)
        .await
        .expect("failed to write progress file");
    path
}

/// Memory ledger whose usage counter can't be written, everything else
/// delegated
#[derive(Debug, Default)]
pub struct BrokenUsageLedger {
    pub inner: MemoryLedger,
}

#[async_trait]
impl AccountLedger for BrokenUsageLedger {
    async fn upsert(
        &self,
        address: &Address,
        credential: Option<&str>,
        max_send_limit: u64,
    ) -> courier_ledger::Result<SendingIdentity> {
        self.inner.upsert(address, credential, max_send_limit).await
    }

    async fn find_all_available(&self) -> courier_ledger::Result<Vec<SendingIdentity>> {
        self.inner.find_all_available().await
    }

    async fn record_use(&self, _address: &Address) -> courier_ledger::Result<()> {
        Err(LedgerError::Corrupted("sent_count unwritable".to_string()))
    }

    async fn mark_rate_limited(&self, address: &Address) -> courier_ledger::Result<()> {
        self.inner.mark_rate_limited(address).await
    }

    async fn reset_all(&self) -> courier_ledger::Result<u64> {
        self.inner.reset_all().await
    }

    async fn stats(&self, address: &Address) -> courier_ledger::Result<Option<IdentityStats>> {
        self.inner.stats(address).await
    }

    async fn list(&self) -> courier_ledger::Result<Vec<SendingIdentity>> {
        self.inner.list().await
    }

    async fn get(&self, address: &Address) -> courier_ledger::Result<Option<SendingIdentity>> {
        self.inner.get(address).await
    }

    async fn set_limit_all(&self, max_send_limit: u64) -> courier_ledger::Result<u64> {
        self.inner.set_limit_all(max_send_limit).await
    }

    async fn disable(&self, address: &Address) -> courier_ledger::Result<()> {
        self.inner.disable(address).await
    }
}

#[async_trait]
impl DeliveryLog for BrokenUsageLedger {
    async fn append(&self, record: &DeliveryRecord) -> courier_ledger::Result<()> {
        self.inner.append(record).await
    }

    async fn was_sent(
        &self,
        recipient: &Address,
        source_batch_file: Option<&str>,
    ) -> courier_ledger::Result<bool> {
        self.inner.was_sent(recipient, source_batch_file).await
    }

    async fn recent(&self, limit: usize) -> courier_ledger::Result<Vec<DeliveryRecord>> {
        self.inner.recent(limit).await
    }
}
