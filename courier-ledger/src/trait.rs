use async_trait::async_trait;
use courier_common::Address;

use crate::{DeliveryRecord, IdentityStats, Result, SendingIdentity};

/// Authoritative record of every sending identity's quota, usage and
/// rate-limit state.
///
/// Mutations are single atomic operations in the backing store. Two sends in
/// the same batch may hit the same identity's counters concurrently, so no
/// implementation may read-modify-write in caller memory.
#[async_trait]
pub trait AccountLedger: Send + Sync + std::fmt::Debug {
    /// Create the identity, or update its quota (and credential, if given)
    /// and clear any rate-limit state.
    ///
    /// # Errors
    /// `MissingCredential` when creating without a credential, `InvalidLimit`
    /// for a zero quota, or a storage error.
    async fn upsert(
        &self,
        address: &Address,
        credential: Option<&str>,
        max_send_limit: u64,
    ) -> Result<SendingIdentity>;

    /// Every identity that is active, not rate-limited and under quota,
    /// least-used first.
    async fn find_all_available(&self) -> Result<Vec<SendingIdentity>>;

    /// The single least-used available identity
    async fn find_available(&self) -> Result<Option<SendingIdentity>> {
        Ok(self.find_all_available().await?.into_iter().next())
    }

    /// Atomically increment `sent_count` and stamp `last_used_at`
    async fn record_use(&self, address: &Address) -> Result<()>;

    /// Flag the identity as throttled by the provider. Idempotent. A disabled
    /// identity stays disabled and is left untouched.
    async fn mark_rate_limited(&self, address: &Address) -> Result<()>;

    /// Zero all usage and clear every rate-limit and disabled flag, returning
    /// the number of identities touched. Leaves the delivery log alone.
    async fn reset_all(&self) -> Result<u64>;

    /// Usage counters joined with the identity's successful deliveries
    async fn stats(&self, address: &Address) -> Result<Option<IdentityStats>>;

    /// Every identity, ordered by address
    async fn list(&self) -> Result<Vec<SendingIdentity>>;

    async fn get(&self, address: &Address) -> Result<Option<SendingIdentity>>;

    /// Set the same quota on every identity, returning how many were updated
    async fn set_limit_all(&self, max_send_limit: u64) -> Result<u64>;

    /// Take the identity out of rotation until the next upsert or reset.
    /// Clears any rate-limit flag, since disabled takes precedence.
    async fn disable(&self, address: &Address) -> Result<()>;
}

/// Append-only record of send attempts
#[async_trait]
pub trait DeliveryLog: Send + Sync + std::fmt::Debug {
    async fn append(&self, record: &DeliveryRecord) -> Result<()>;

    /// Whether a successful delivery to `recipient` exists, optionally scoped
    /// to a single progress file
    async fn was_sent(&self, recipient: &Address, source_batch_file: Option<&str>)
    -> Result<bool>;

    /// The newest `limit` records, newest first
    async fn recent(&self, limit: usize) -> Result<Vec<DeliveryRecord>>;
}

/// A store that carries both collections
pub trait Ledger: AccountLedger + DeliveryLog {}

impl<T: AccountLedger + DeliveryLog> Ledger for T {}

/// `target` is the address being configured, or `*` for bulk updates
pub(crate) fn validate_limit(target: &str, max_send_limit: u64) -> Result<()> {
    if max_send_limit == 0 {
        return Err(crate::LedgerError::InvalidLimit {
            address: target.to_string(),
            limit: max_send_limit,
        });
    }
    Ok(())
}
