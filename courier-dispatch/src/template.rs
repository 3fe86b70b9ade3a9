use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use courier_common::{Address, internal};

use crate::{error::DispatchError, transport::OutgoingMessage};

/// The HTML body and subject shared by every message of a run.
///
/// Loaded once, before the first send. The same body goes to every recipient.
#[derive(Debug, Clone)]
pub struct MessageTemplate {
    subject: Arc<str>,
    html: Arc<str>,
}

impl MessageTemplate {
    #[must_use]
    pub fn new(subject: impl Into<Arc<str>>, html: impl Into<Arc<str>>) -> Self {
        Self {
            subject: subject.into(),
            html: html.into(),
        }
    }

    /// Read the HTML body from `path`.
    ///
    /// # Errors
    /// `DispatchError::Template` if the file can't be read. Nothing has been
    /// sent at that point, so callers treat it as fatal.
    pub async fn load(path: impl AsRef<Path>, subject: &str) -> Result<Self, DispatchError> {
        let path = path.as_ref();
        let html = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| DispatchError::Template {
                path: PathBuf::from(path),
                source,
            })?;

        internal!(
            level = DEBUG,
            template = %path.display(),
            bytes = html.len(),
            "Loaded message template"
        );

        Ok(Self::new(subject, html))
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub fn html(&self) -> &str {
        &self.html
    }

    /// The message for one recipient
    #[must_use]
    pub fn render<'a>(&'a self, to: &'a Address) -> OutgoingMessage<'a> {
        OutgoingMessage {
            to,
            subject: &self.subject,
            html: &self.html,
        }
    }
}
