use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use courier_common::Address;
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::RwLock;

use crate::{
    DeliveryRecord, DeliveryStatus, IdentityStats, IdentityStatus, LedgerError, SendingIdentity,
    r#trait::{AccountLedger, DeliveryLog, validate_limit},
};

/// In-memory ledger
///
/// Identities live in a `DashMap`, so every per-identity mutation happens
/// under that entry's shard lock and is atomic with respect to concurrent
/// sends. The delivery log is a plain vector behind an `RwLock`.
///
/// Nothing survives the process; intended for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    identities: Arc<DashMap<Address, SendingIdentity>>,
    records: Arc<RwLock<Vec<DeliveryRecord>>>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record appended so far, oldest first
    #[must_use]
    pub fn records(&self) -> Vec<DeliveryRecord> {
        self.records.read().clone()
    }

    fn delivered_from(&self, address: &Address) -> u64 {
        self.records
            .read()
            .iter()
            .filter(|r| r.status == DeliveryStatus::Success && &r.from_identity == address)
            .count() as u64
    }

    fn modify<F>(&self, address: &Address, f: F) -> crate::Result<()>
    where
        F: FnOnce(&mut SendingIdentity),
    {
        let mut entry = self
            .identities
            .get_mut(address)
            .ok_or_else(|| LedgerError::UnknownIdentity(address.to_string()))?;
        f(entry.value_mut());
        entry.value_mut().updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl AccountLedger for MemoryLedger {
    async fn upsert(
        &self,
        address: &Address,
        credential: Option<&str>,
        max_send_limit: u64,
    ) -> crate::Result<SendingIdentity> {
        validate_limit(address, max_send_limit)?;

        match self.identities.entry(address.clone()) {
            Entry::Occupied(mut entry) => {
                let identity = entry.get_mut();
                if let Some(credential) = credential {
                    credential.clone_into(&mut identity.credential);
                }
                identity.max_send_limit = max_send_limit;
                identity.rate_limited = false;
                identity.rate_limited_at = None;
                identity.status = IdentityStatus::Active;
                identity.updated_at = Utc::now();
                Ok(identity.clone())
            }
            Entry::Vacant(entry) => {
                let credential =
                    credential.ok_or_else(|| LedgerError::MissingCredential(address.to_string()))?;
                let identity = SendingIdentity::new(address.clone(), credential, max_send_limit);
                entry.insert(identity.clone());
                Ok(identity)
            }
        }
    }

    async fn find_all_available(&self) -> crate::Result<Vec<SendingIdentity>> {
        let mut available: Vec<_> = self
            .identities
            .iter()
            .filter(|entry| entry.value().is_available())
            .map(|entry| entry.value().clone())
            .collect();

        available.sort_by(|a, b| {
            a.sent_count
                .cmp(&b.sent_count)
                .then_with(|| a.address.cmp(&b.address))
        });

        Ok(available)
    }

    async fn record_use(&self, address: &Address) -> crate::Result<()> {
        self.modify(address, |identity| {
            identity.sent_count += 1;
            identity.last_used_at = Some(Utc::now());
        })
    }

    async fn mark_rate_limited(&self, address: &Address) -> crate::Result<()> {
        self.modify(address, |identity| {
            if identity.status == IdentityStatus::Disabled {
                return;
            }
            let now = Utc::now();
            identity.rate_limited = true;
            identity.status = IdentityStatus::RateLimited;
            identity.rate_limited_at = Some(now);
        })
    }

    async fn reset_all(&self) -> crate::Result<u64> {
        let now = Utc::now();
        let mut touched = 0;
        for mut entry in self.identities.iter_mut() {
            let identity = entry.value_mut();
            identity.sent_count = 0;
            identity.rate_limited = false;
            identity.rate_limited_at = None;
            identity.status = IdentityStatus::Active;
            identity.updated_at = now;
            touched += 1;
        }
        Ok(touched)
    }

    async fn stats(&self, address: &Address) -> crate::Result<Option<IdentityStats>> {
        let Some(identity) = self.identities.get(address).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        Ok(Some(IdentityStats::from_identity(
            &identity,
            self.delivered_from(address),
        )))
    }

    async fn list(&self) -> crate::Result<Vec<SendingIdentity>> {
        let mut identities: Vec<_> = self
            .identities
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        identities.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(identities)
    }

    async fn get(&self, address: &Address) -> crate::Result<Option<SendingIdentity>> {
        Ok(self.identities.get(address).map(|e| e.value().clone()))
    }

    async fn set_limit_all(&self, max_send_limit: u64) -> crate::Result<u64> {
        validate_limit("*", max_send_limit)?;

        let now = Utc::now();
        let mut touched = 0;
        for mut entry in self.identities.iter_mut() {
            let identity = entry.value_mut();
            identity.max_send_limit = max_send_limit;
            identity.updated_at = now;
            touched += 1;
        }
        Ok(touched)
    }

    async fn disable(&self, address: &Address) -> crate::Result<()> {
        self.modify(address, |identity| {
            identity.status = IdentityStatus::Disabled;
            identity.rate_limited = false;
            identity.rate_limited_at = None;
        })
    }
}

#[async_trait]
impl DeliveryLog for MemoryLedger {
    async fn append(&self, record: &DeliveryRecord) -> crate::Result<()> {
        self.records.write().push(record.clone());
        Ok(())
    }

    async fn was_sent(
        &self,
        recipient: &Address,
        source_batch_file: Option<&str>,
    ) -> crate::Result<bool> {
        Ok(self.records.read().iter().any(|record| {
            record.status == DeliveryStatus::Success
                && &record.to_recipient == recipient
                && source_batch_file
                    .is_none_or(|file| record.source_batch_file.as_deref() == Some(file))
        }))
    }

    async fn recent(&self, limit: usize) -> crate::Result<Vec<DeliveryRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn address(raw: &str) -> Address {
        Address::parse(raw).expect("valid test address")
    }

    #[tokio::test]
    async fn test_upsert_creates_then_updates() {
        let ledger = MemoryLedger::new();
        let sender = address("sender@example.com");

        let created = ledger
            .upsert(&sender, Some("secret"), 100)
            .await
            .expect("Failed to create");
        assert_eq!(created.sent_count, 0);
        assert_eq!(created.status, IdentityStatus::Active);

        ledger.mark_rate_limited(&sender).await.unwrap();
        let updated = ledger.upsert(&sender, None, 250).await.unwrap();

        assert_eq!(updated.max_send_limit, 250);
        assert_eq!(updated.credential, "secret");
        assert!(!updated.rate_limited);
        assert_eq!(updated.status, IdentityStatus::Active);
        assert_eq!(ledger.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_requires_credential_on_create() {
        let ledger = MemoryLedger::new();
        let result = ledger.upsert(&address("new@example.com"), None, 10).await;
        assert!(matches!(result, Err(LedgerError::MissingCredential(_))));
        assert!(ledger.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_record_use_is_atomic() {
        let ledger = MemoryLedger::new();
        let sender = address("busy@example.com");
        ledger.upsert(&sender, Some("pw"), 1_000).await.unwrap();

        let mut handles = vec![];
        for _ in 0..50 {
            let ledger = ledger.clone();
            let sender = sender.clone();
            handles.push(tokio::spawn(async move {
                ledger.record_use(&sender).await
            }));
        }
        for handle in handles {
            handle.await.expect("Task panicked").expect("record_use failed");
        }

        let identity = ledger.get(&sender).await.unwrap().unwrap();
        assert_eq!(identity.sent_count, 50);
        assert!(identity.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_record_use_unknown_identity() {
        let ledger = MemoryLedger::new();
        let result = ledger.record_use(&address("ghost@example.com")).await;
        assert!(matches!(result, Err(LedgerError::UnknownIdentity(_))));
    }

    #[tokio::test]
    async fn test_disabled_identity_is_not_available() {
        let ledger = MemoryLedger::new();
        let sender = address("off@example.com");
        ledger.upsert(&sender, Some("pw"), 10).await.unwrap();
        ledger.disable(&sender).await.unwrap();

        assert!(ledger.find_available().await.unwrap().is_none());

        ledger.reset_all().await.unwrap();
        assert!(ledger.find_available().await.unwrap().is_some());
    }
}
