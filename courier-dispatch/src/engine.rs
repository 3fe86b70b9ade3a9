//! Batch dispatch
//!
//! Recipients are sent in small batches. Sends within a batch run
//! concurrently on the calling task and share the [`DispatchSession`] through
//! a mutex that is only held while an identity is reserved or rotated, never
//! while a message is in transit. Between batches the controlling task applies
//! the outcomes to the progress file and rewrites it.

use std::{sync::Arc, time::Duration};

use ahash::AHashSet;
use courier_common::{Address, internal, outgoing};
use courier_ledger::{AccountLedger, DeliveryLog, DeliveryRecord, Ledger};
use futures_util::future::join_all;
use tokio::sync::Mutex;

use crate::{
    error::DispatchError,
    recipients::RecipientLedger,
    report::DispatchReport,
    selector::{DispatchSession, Rotation, RotationPolicy, RotationReason, Rotator, ThresholdRange},
    template::MessageTemplate,
    transport::Transport,
};

/// Failure text for recipients left over once every identity is spent
pub const NO_AVAILABLE_ACCOUNTS: &str = "no available accounts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Concurrent sends per batch
    pub batch_size: usize,
    /// Pause between batches, in milliseconds
    pub batch_delay_ms: u64,
    pub policy: RotationPolicy,
    pub rotation_threshold: ThresholdRange,
    /// Cap on failures listed in the report
    pub max_reported_failures: usize,
}

pub mod defaults {
    pub const fn batch_size() -> usize {
        5
    }

    pub const fn batch_delay_ms() -> u64 {
        2000
    }

    pub const fn max_reported_failures() -> usize {
        10
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::batch_size(),
            batch_delay_ms: defaults::batch_delay_ms(),
            policy: RotationPolicy::default(),
            rotation_threshold: ThresholdRange::default(),
            max_reported_failures: defaults::max_reported_failures(),
        }
    }
}

impl DispatchConfig {
    /// # Errors
    /// `DispatchError::Configuration` for a zero batch size or an invalid
    /// threshold range.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.batch_size == 0 {
            return Err(DispatchError::Configuration(
                "batch_size must be at least 1".to_string(),
            ));
        }
        self.rotation_threshold.validate()
    }
}

/// How a single recipient ended
#[derive(Debug)]
enum Outcome {
    Sent(Address),
    Failed(Address, String),
    /// Nothing left to send from
    Exhausted(Address),
    /// Bookkeeping failed; the run stops after this batch
    Fatal(Address, DispatchError),
    /// The provider accepted the message but the ledger couldn't record it
    Unrecorded(Address, DispatchError),
}

#[derive(Debug)]
pub struct DispatchEngine {
    ledger: Arc<dyn Ledger>,
    transport: Arc<dyn Transport>,
    rotator: Rotator,
    config: DispatchConfig,
    template: MessageTemplate,
}

impl DispatchEngine {
    /// # Errors
    /// If the configuration is invalid.
    pub fn new(
        ledger: Arc<dyn Ledger>,
        transport: Arc<dyn Transport>,
        config: DispatchConfig,
        template: MessageTemplate,
    ) -> Result<Self, DispatchError> {
        config.validate()?;

        Ok(Self {
            ledger,
            transport,
            rotator: Rotator::new(config.policy, config.rotation_threshold),
            config,
            template,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Send to every recipient in `recipients` not yet marked sent.
    ///
    /// Running out of identities stops the run early but still returns a
    /// report with `aborted` set. The progress file is rewritten after every
    /// batch and once more at the end, including when an error is returned.
    ///
    /// # Errors
    /// If the ledger, delivery log or progress file can't be written, or an
    /// identity can't be bound.
    pub async fn run(
        &self,
        recipients: &mut RecipientLedger,
    ) -> Result<DispatchReport, DispatchError> {
        let mut report = DispatchReport::new(self.config.max_reported_failures);
        let source_batch_file = recipients
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());

        let mut seen = AHashSet::new();
        let mut queue = Vec::new();
        for entry in recipients.entries() {
            if entry.already_sent || !seen.insert(entry.address.clone()) {
                report.skipped += 1;
            } else {
                queue.push(entry.address.clone());
            }
        }

        // Every rate-limited attempt burns an identity, so this bounds retries.
        let max_attempts = self.ledger.list().await?.len().max(1);

        internal!(
            level = INFO,
            file = ?source_batch_file,
            pending = queue.len(),
            skipped = report.skipped,
            policy = ?self.config.policy,
            "Starting dispatch"
        );

        let mut session = DispatchSession::new();
        let mut fatal = None;

        for (batch, chunk) in queue.chunks(self.config.batch_size).enumerate() {
            if batch > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.batch_delay_ms)).await;

                if self.config.policy == RotationPolicy::Fair && session.threshold_reached() {
                    match self.rotate(&mut session, RotationReason::Threshold).await {
                        Ok(Rotation::Exhausted) => {
                            report.aborted = Some(NO_AVAILABLE_ACCOUNTS.to_string());
                            break;
                        }
                        Ok(Rotation::Kept | Rotation::Switched(_)) => {}
                        Err(e) => {
                            fatal = Some(e);
                            break;
                        }
                    }
                }
            }

            let (returned, outcomes) = self
                .run_batch(session, chunk, source_batch_file.as_deref(), max_attempts)
                .await;
            session = returned;

            for outcome in outcomes {
                match outcome {
                    Outcome::Sent(recipient) => {
                        recipients.mark_sent(&recipient);
                        report.sent += 1;
                    }
                    Outcome::Failed(recipient, error) => report.record_failure(recipient, error),
                    Outcome::Exhausted(recipient) => {
                        report.record_failure(recipient, NO_AVAILABLE_ACCOUNTS);
                        report.aborted = Some(NO_AVAILABLE_ACCOUNTS.to_string());
                    }
                    Outcome::Fatal(recipient, error) => {
                        report.record_failure(recipient, error.to_string());
                        fatal.get_or_insert(error);
                    }
                    Outcome::Unrecorded(recipient, error) => {
                        // Delivered: a resume must not send it again.
                        recipients.mark_sent(&recipient);
                        report.sent += 1;
                        fatal.get_or_insert(error);
                    }
                }
            }

            internal!(
                level = INFO,
                batch = batch + 1,
                sent = report.sent,
                failed = report.failed,
                "Batch finished"
            );

            if let Err(e) = recipients.save().await {
                fatal.get_or_insert(e.into());
            }

            if fatal.is_some() || report.aborted.is_some() {
                break;
            }
        }

        let saved = recipients.save().await;
        session.close().await;

        if let Some(error) = fatal {
            internal!(level = ERROR, error = %error, "Dispatch stopped");
            return Err(error);
        }
        saved?;

        internal!(
            level = INFO,
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            aborted = ?report.aborted,
            rotations = session.rotations(),
            "Dispatch finished"
        );

        Ok(report)
    }

    async fn rotate(
        &self,
        session: &mut DispatchSession,
        reason: RotationReason,
    ) -> Result<Rotation, DispatchError> {
        self.rotator
            .rotate(self.ledger.as_ref(), self.transport.as_ref(), session, reason)
            .await
    }

    /// Send one batch concurrently, handing the session back once every send
    /// has settled
    async fn run_batch(
        &self,
        session: DispatchSession,
        batch: &[Address],
        source_batch_file: Option<&str>,
        max_attempts: usize,
    ) -> (DispatchSession, Vec<Outcome>) {
        let session = Mutex::new(session);

        let outcomes = join_all(
            batch
                .iter()
                .map(|recipient| self.deliver(&session, recipient, source_batch_file, max_attempts)),
        )
        .await;

        let mut session = session.into_inner();
        session.close_retired().await;

        (session, outcomes)
    }

    async fn deliver(
        &self,
        session: &Mutex<DispatchSession>,
        recipient: &Address,
        source_batch_file: Option<&str>,
        max_attempts: usize,
    ) -> Outcome {
        let mut attempts = 0;

        loop {
            let (identity, binding) = {
                let mut session = session.lock().await;
                loop {
                    if let Some(reserved) = session.reserve() {
                        break reserved;
                    }

                    let reason = if session.current().is_none() {
                        RotationReason::Initial
                    } else {
                        RotationReason::Exhausted
                    };

                    match self.rotate(&mut session, reason).await {
                        Ok(Rotation::Exhausted) => return Outcome::Exhausted(recipient.clone()),
                        Ok(Rotation::Kept | Rotation::Switched(_)) => {}
                        Err(e) => return Outcome::Fatal(recipient.clone(), e),
                    }
                }
            };

            outgoing!(identity = %identity, recipient = %recipient, "Sending");

            match binding.send(self.template.render(recipient)).await {
                Ok(message_id) => {
                    let outcome = self
                        .record_success(&identity, recipient, message_id, source_batch_file)
                        .await;
                    // Settle only after the ledger has counted the send.
                    session.lock().await.record_success(&identity);
                    return outcome;
                }
                Err(e) if e.is_rate_limited() && attempts < max_attempts => {
                    attempts += 1;
                    internal!(
                        level = WARN,
                        identity = %identity,
                        recipient = %recipient,
                        error = %e,
                        attempt = attempts,
                        "Identity rate limited, switching"
                    );

                    if let Err(e) = self.ledger.mark_rate_limited(&identity).await {
                        session.lock().await.release(&identity);
                        return Outcome::Fatal(recipient.clone(), e.into());
                    }

                    let mut session = session.lock().await;
                    session.release(&identity);

                    // A sibling send may have rotated away already.
                    if session.current_address() == Some(&identity) {
                        match self.rotate(&mut session, RotationReason::RateLimited).await {
                            Ok(Rotation::Exhausted) => {
                                return Outcome::Exhausted(recipient.clone());
                            }
                            Ok(Rotation::Kept | Rotation::Switched(_)) => {}
                            Err(e) => return Outcome::Fatal(recipient.clone(), e),
                        }
                    }
                }
                Err(e) => {
                    session.lock().await.release(&identity);
                    return self
                        .record_failure(&identity, recipient, &e.to_string(), source_batch_file)
                        .await;
                }
            }
        }
    }

    async fn record_success(
        &self,
        identity: &Address,
        recipient: &Address,
        message_id: String,
        source_batch_file: Option<&str>,
    ) -> Outcome {
        internal!(
            level = DEBUG,
            identity = %identity,
            recipient = %recipient,
            message_id = %message_id,
            "Delivered"
        );

        if let Err(e) = self.ledger.record_use(identity).await {
            return Outcome::Unrecorded(recipient.clone(), e.into());
        }

        let record = DeliveryRecord::success(
            identity.clone(),
            recipient.clone(),
            self.template.subject(),
            Some(message_id),
        )
        .with_batch_file(source_batch_file.map(str::to_string));

        match self.ledger.append(&record).await {
            Ok(()) => Outcome::Sent(recipient.clone()),
            Err(e) => Outcome::Unrecorded(recipient.clone(), e.into()),
        }
    }

    async fn record_failure(
        &self,
        identity: &Address,
        recipient: &Address,
        error: &str,
        source_batch_file: Option<&str>,
    ) -> Outcome {
        internal!(
            level = WARN,
            identity = %identity,
            recipient = %recipient,
            error,
            "Delivery failed"
        );

        let record = DeliveryRecord::failure(
            identity.clone(),
            recipient.clone(),
            self.template.subject(),
            error,
        )
        .with_batch_file(source_batch_file.map(str::to_string));

        match self.ledger.append(&record).await {
            Ok(()) => Outcome::Failed(recipient.clone(), error.to_string()),
            Err(e) => Outcome::Fatal(recipient.clone(), e.into()),
        }
    }
}
