use std::fmt::{self, Display};

use courier_common::Address;
use serde::Serialize;

/// A recipient that couldn't be delivered to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRecipient {
    pub recipient: Address,
    pub error: String,
}

/// Summary of a dispatch run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub sent: u64,
    pub failed: u64,
    /// Recipients already marked sent, or repeated within the file
    pub skipped: u64,
    /// The first failures, up to the configured cap
    pub failures: Vec<FailedRecipient>,
    /// Set when the run stopped before reaching the end of the file
    pub aborted: Option<String>,
    #[serde(skip)]
    max_reported_failures: usize,
}

impl DispatchReport {
    #[must_use]
    pub fn new(max_reported_failures: usize) -> Self {
        Self {
            max_reported_failures,
            ..Self::default()
        }
    }

    pub fn record_failure(&mut self, recipient: Address, error: impl Into<String>) {
        self.failed += 1;
        if self.failures.len() < self.max_reported_failures {
            self.failures.push(FailedRecipient {
                recipient,
                error: error.into(),
            });
        }
    }

    /// Percentage of attempted recipients that were sent, `None` if nothing
    /// was attempted
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> Option<f64> {
        let attempted = self.sent + self.failed;
        (attempted > 0).then(|| self.sent as f64 / attempted as f64 * 100.0)
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }
}

impl Display for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sent:    {}", self.sent)?;
        writeln!(f, "Failed:  {}", self.failed)?;
        writeln!(f, "Skipped: {}", self.skipped)?;
        match self.success_rate() {
            Some(rate) => writeln!(f, "Success rate: {rate:.1}%")?,
            None => writeln!(f, "Success rate: n/a")?,
        }

        if !self.failures.is_empty() {
            writeln!(f, "Failures:")?;
            for failure in &self.failures {
                writeln!(f, "  {}: {}", failure.recipient, failure.error)?;
            }
            let unlisted = self.failed.saturating_sub(self.failures.len() as u64);
            if unlisted > 0 {
                writeln!(f, "  ... and {unlisted} more")?;
            }
        }

        if let Some(reason) = &self.aborted {
            writeln!(f, "Stopped early: {reason}")?;
        }

        Ok(())
    }
}
