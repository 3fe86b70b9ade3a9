use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use courier_common::Address;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a sending identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityStatus {
    Active,
    RateLimited,
    Disabled,
}

impl IdentityStatus {
    /// Stored representation, shared by every backend
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::RateLimited => "rate-limited",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "rate-limited" => Some(Self::RateLimited),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

impl Display for IdentityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sending account: address, credential, quota and rate-limit state.
///
/// `status == RateLimited` always coincides with `rate_limited == true`; the
/// backends only ever change the two together.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendingIdentity {
    pub address: Address,
    pub credential: String,
    pub sent_count: u64,
    pub max_send_limit: u64,
    pub rate_limited: bool,
    pub rate_limited_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub status: IdentityStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SendingIdentity {
    /// A fresh identity with no usage
    #[must_use]
    pub fn new(address: Address, credential: impl Into<String>, max_send_limit: u64) -> Self {
        let now = Utc::now();
        Self {
            address,
            credential: credential.into(),
            sent_count: 0,
            max_send_limit,
            rate_limited: false,
            rate_limited_at: None,
            last_used_at: None,
            status: IdentityStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the selector may hand this identity out
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.status == IdentityStatus::Active
            && !self.rate_limited
            && self.sent_count < self.max_send_limit
    }

    /// Sends left before the quota is reached
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.max_send_limit.saturating_sub(self.sent_count)
    }
}

// The credential must never end up in logs.
impl fmt::Debug for SendingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendingIdentity")
            .field("address", &self.address)
            .field("credential", &"<redacted>")
            .field("sent_count", &self.sent_count)
            .field("max_send_limit", &self.max_send_limit)
            .field("rate_limited", &self.rate_limited)
            .field("rate_limited_at", &self.rate_limited_at)
            .field("last_used_at", &self.last_used_at)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Outcome stored on a delivery record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Success,
    Failed,
}

impl DeliveryStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One send attempt, as written to the delivery log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub from_identity: Address,
    pub to_recipient: Address,
    pub subject: String,
    pub sent_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub error_message: Option<String>,
    pub provider_message_id: Option<String>,
    pub source_batch_file: Option<String>,
}

impl DeliveryRecord {
    /// A successful delivery
    #[must_use]
    pub fn success(
        from_identity: Address,
        to_recipient: Address,
        subject: impl Into<String>,
        provider_message_id: Option<String>,
    ) -> Self {
        Self {
            from_identity,
            to_recipient,
            subject: subject.into(),
            sent_at: Utc::now(),
            status: DeliveryStatus::Success,
            error_message: None,
            provider_message_id,
            source_batch_file: None,
        }
    }

    /// A failed delivery with the provider's error text
    #[must_use]
    pub fn failure(
        from_identity: Address,
        to_recipient: Address,
        subject: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            from_identity,
            to_recipient,
            subject: subject.into(),
            sent_at: Utc::now(),
            status: DeliveryStatus::Failed,
            error_message: Some(error_message.into()),
            provider_message_id: None,
            source_batch_file: None,
        }
    }

    /// Tag the record with the progress file it was sent from
    #[must_use]
    pub fn with_batch_file(mut self, source_batch_file: Option<String>) -> Self {
        self.source_batch_file = source_batch_file;
        self
    }
}

/// Usage counters joined with the delivery log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityStats {
    pub address: Address,
    pub status: IdentityStatus,
    pub sent_count: u64,
    pub max_send_limit: u64,
    pub remaining: u64,
    pub rate_limited: bool,
    pub rate_limited_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Successful records in the delivery log sent from this identity
    pub delivered: u64,
}

impl IdentityStats {
    #[must_use]
    pub fn from_identity(identity: &SendingIdentity, delivered: u64) -> Self {
        Self {
            address: identity.address.clone(),
            status: identity.status,
            sent_count: identity.sent_count,
            max_send_limit: identity.max_send_limit,
            remaining: identity.remaining(),
            rate_limited: identity.rate_limited,
            rate_limited_at: identity.rate_limited_at,
            last_used_at: identity.last_used_at,
            delivered,
        }
    }
}
