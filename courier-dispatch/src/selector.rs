//! Account selection and rotation
//!
//! The choice of identity is a pure function over the ledger's available
//! identities and the session's state ([`choose`]). [`Rotator`] wraps it with
//! the side effects of a switch: closing the old binding, binding the new
//! identity and resetting the session counters.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use courier_common::{Address, internal};
use courier_ledger::{Ledger, SendingIdentity};
use rand::Rng;
use serde::Deserialize;

use crate::{
    error::DispatchError,
    transport::{Binding, Transport},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum RotationPolicy {
    /// Stay on the least-used identity until it runs out or is throttled
    Simple,
    /// Spread sends across identities, rotating at a randomised threshold
    #[default]
    Fair,
}

/// Why a rotation was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    /// Nothing is bound yet
    Initial,
    /// The current identity reached its quota
    Exhausted,
    /// The provider throttled the current identity
    RateLimited,
    /// The randomised per-identity send threshold was reached
    Threshold,
}

impl RotationReason {
    /// Whether the current identity is ruled out as a candidate
    #[must_use]
    pub const fn excludes_current(self) -> bool {
        matches!(self, Self::Exhausted | Self::RateLimited)
    }
}

/// Range the per-identity rotation threshold is drawn from, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ThresholdRange {
    #[serde(default = "defaults::min")]
    pub min: u64,
    #[serde(default = "defaults::max")]
    pub max: u64,
}

mod defaults {
    pub const fn min() -> u64 {
        15
    }

    pub const fn max() -> u64 {
        30
    }
}

impl Default for ThresholdRange {
    fn default() -> Self {
        Self {
            min: defaults::min(),
            max: defaults::max(),
        }
    }
}

impl ThresholdRange {
    /// # Errors
    /// If `min` is zero or greater than `max`.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.min == 0 {
            return Err(DispatchError::Configuration(
                "rotation_threshold.min must be at least 1".to_string(),
            ));
        }
        if self.min > self.max {
            return Err(DispatchError::Configuration(format!(
                "rotation_threshold.min ({}) is greater than max ({})",
                self.min, self.max
            )));
        }
        Ok(())
    }

    /// Draw a threshold uniformly from the range
    pub fn draw(&self) -> u64 {
        rand::rng().random_range(self.min..=self.max.max(self.min))
    }
}

/// Result of [`choose`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice<'a> {
    Keep,
    Switch(&'a SendingIdentity),
    None,
}

/// Pick the identity to send from next.
///
/// `available` must be ordered least-used first, as returned by
/// `find_all_available`. `current` is the bound identity, if any, and `used`
/// holds every identity bound earlier in this run.
pub fn choose<'a>(
    policy: RotationPolicy,
    reason: RotationReason,
    available: &'a [SendingIdentity],
    current: Option<&Address>,
    used: &AHashSet<Address>,
) -> Choice<'a> {
    let is_current = |identity: &SendingIdentity| Some(&identity.address) == current;

    let mut candidates = available
        .iter()
        .filter(|&identity| !(reason.excludes_current() && is_current(identity)))
        .peekable();

    let Some(&least_used) = candidates.peek() else {
        return Choice::None;
    };

    let Some(current_address) = current else {
        return match policy {
            RotationPolicy::Simple => Choice::Switch(least_used),
            RotationPolicy::Fair => Choice::Switch(
                candidates
                    .find(|identity| !used.contains(&identity.address))
                    .unwrap_or(least_used),
            ),
        };
    };

    match (policy, reason) {
        (RotationPolicy::Simple, RotationReason::Initial | RotationReason::Threshold) => {
            // Only a forced rotation moves a simple session off a usable identity.
            if available.iter().any(is_current) {
                Choice::Keep
            } else {
                Choice::Switch(least_used)
            }
        }
        (RotationPolicy::Simple, _) => Choice::Switch(least_used),
        (RotationPolicy::Fair, RotationReason::Initial) => {
            if available.iter().any(is_current) {
                Choice::Keep
            } else {
                Choice::Switch(least_used)
            }
        }
        (RotationPolicy::Fair, _) => {
            let others: Vec<&SendingIdentity> = candidates
                .filter(|identity| &identity.address != current_address)
                .collect();

            others
                .iter()
                .find(|identity| !used.contains(&identity.address))
                .or_else(|| others.first())
                .copied()
                .map_or(Choice::Keep, Choice::Switch)
        }
    }
}

/// The identity a session is currently sending as
#[derive(Debug, Clone)]
pub struct ActiveIdentity {
    /// Snapshot from the ledger, with `sent_count` advanced locally on every
    /// success so the quota check doesn't need a round trip
    pub identity: SendingIdentity,
    pub binding: Arc<dyn Binding>,
}

/// Rotation state for one run
#[derive(Debug)]
pub struct DispatchSession {
    current: Option<ActiveIdentity>,
    used: AHashSet<Address>,
    session_send_count: u64,
    rotation_threshold: u64,
    rotations: u64,
    /// Sends started but not yet settled, per identity. They count against
    /// the identity's quota until the ledger has recorded them.
    in_flight: AHashMap<Address, u64>,
    /// Bindings rotated away from while sends were still using them
    retired: Vec<Arc<dyn Binding>>,
}

impl Default for DispatchSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: None,
            used: AHashSet::new(),
            session_send_count: 0,
            rotation_threshold: 0,
            rotations: 0,
            in_flight: AHashMap::new(),
            retired: Vec::new(),
        }
    }

    #[must_use]
    pub fn current(&self) -> Option<&ActiveIdentity> {
        self.current.as_ref()
    }

    #[must_use]
    pub fn current_address(&self) -> Option<&Address> {
        self.current.as_ref().map(|active| &active.identity.address)
    }

    /// Identities bound at some point in this run
    #[must_use]
    pub const fn used(&self) -> &AHashSet<Address> {
        &self.used
    }

    #[must_use]
    pub const fn session_send_count(&self) -> u64 {
        self.session_send_count
    }

    #[must_use]
    pub const fn rotation_threshold(&self) -> u64 {
        self.rotation_threshold
    }

    /// Number of switches so far, the first bind included
    #[must_use]
    pub const fn rotations(&self) -> u64 {
        self.rotations
    }

    #[must_use]
    pub const fn threshold_reached(&self) -> bool {
        self.current.is_some() && self.session_send_count >= self.rotation_threshold
    }

    #[must_use]
    pub fn in_flight(&self, address: &Address) -> u64 {
        self.in_flight.get(address).copied().unwrap_or(0)
    }

    /// Whether `identity` still has quota once unsettled sends are counted
    #[must_use]
    pub fn has_capacity(&self, identity: &SendingIdentity) -> bool {
        identity.sent_count + self.in_flight(&identity.address) < identity.max_send_limit
    }

    /// Reserve one send against the current identity's quota.
    ///
    /// Returns `None` when nothing is bound or the quota, counting sends
    /// already in flight, is used up.
    pub fn reserve(&mut self) -> Option<(Address, Arc<dyn Binding>)> {
        let active = self.current.as_ref()?;
        if !self.has_capacity(&active.identity) {
            return None;
        }

        let reserved = (active.identity.address.clone(), Arc::clone(&active.binding));
        *self.in_flight.entry(reserved.0.clone()).or_insert(0) += 1;
        Some(reserved)
    }

    /// Settle a send made as `address` that the ledger has recorded
    pub fn record_success(&mut self, address: &Address) {
        self.release(address);

        if let Some(active) = self
            .current
            .as_mut()
            .filter(|active| &active.identity.address == address)
        {
            active.identity.sent_count += 1;
            self.session_send_count += 1;
        }
    }

    /// Drop the reservation of a send made as `address` that didn't succeed
    pub fn release(&mut self, address: &Address) {
        if let Some(count) = self.in_flight.get_mut(address) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.in_flight.remove(address);
            }
        }
    }

    /// Unbind the current identity. Its binding is closed now, or once the
    /// sends still using it have settled.
    async fn unbind(&mut self) {
        if let Some(active) = self.current.take() {
            if self.in_flight(&active.identity.address) == 0 {
                active.binding.close().await;
            } else {
                self.retired.push(active.binding);
            }
        }
    }

    /// Close bindings left behind by rotations. Call with no sends in flight.
    pub async fn close_retired(&mut self) {
        for binding in std::mem::take(&mut self.retired) {
            binding.close().await;
        }
    }

    /// Unbind the current identity and close every binding
    pub async fn close(&mut self) {
        if let Some(active) = self.current.take() {
            active.binding.close().await;
        }
        self.close_retired().await;
    }

    fn switch_to(&mut self, identity: SendingIdentity, binding: Arc<dyn Binding>, threshold: u64) {
        self.used.insert(identity.address.clone());
        self.current = Some(ActiveIdentity { identity, binding });
        self.session_send_count = 0;
        self.rotation_threshold = threshold;
        self.rotations += 1;
    }
}

/// Outcome of [`Rotator::rotate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    Kept,
    Switched(Address),
    /// No identity is available; the run can't continue
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Rotator {
    policy: RotationPolicy,
    threshold: ThresholdRange,
}

impl Rotator {
    #[must_use]
    pub const fn new(policy: RotationPolicy, threshold: ThresholdRange) -> Self {
        Self { policy, threshold }
    }

    #[must_use]
    pub const fn policy(&self) -> RotationPolicy {
        self.policy
    }

    /// Re-evaluate the session's identity and switch if needed.
    ///
    /// # Errors
    /// If the ledger can't be queried or the new identity can't be bound.
    pub async fn rotate(
        &self,
        ledger: &dyn Ledger,
        transport: &dyn Transport,
        session: &mut DispatchSession,
        reason: RotationReason,
    ) -> Result<Rotation, DispatchError> {
        let available: Vec<SendingIdentity> = ledger
            .find_all_available()
            .await?
            .into_iter()
            .filter(|identity| session.has_capacity(identity))
            .collect();
        let choice = choose(
            self.policy,
            reason,
            &available,
            session.current_address(),
            &session.used,
        );

        match choice {
            Choice::Keep => {
                internal!(
                    identity = ?session.current_address().map(Address::as_str),
                    reason = ?reason,
                    "Keeping current identity"
                );
                Ok(Rotation::Kept)
            }
            Choice::None => {
                internal!(
                    level = WARN,
                    previous = ?session.current_address().map(Address::as_str),
                    reason = ?reason,
                    "No available identity"
                );
                session.unbind().await;
                Ok(Rotation::Exhausted)
            }
            Choice::Switch(identity) => {
                let previous = session.current_address().cloned();
                session.unbind().await;

                let binding = transport.bind(identity).await?;
                let threshold = self.threshold.draw();
                let address = identity.address.clone();
                session.switch_to(identity.clone(), binding, threshold);

                internal!(
                    level = INFO,
                    identity = %address,
                    previous = ?previous.as_ref().map(Address::as_str),
                    reason = ?reason,
                    remaining = identity.remaining(),
                    threshold,
                    "Switched sending identity"
                );

                Ok(Rotation::Switched(address))
            }
        }
    }
}
