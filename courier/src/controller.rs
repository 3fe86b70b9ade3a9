use std::{path::Path, sync::Arc};

use anyhow::Context;
use courier_common::internal;
use courier_dispatch::{
    DispatchEngine, DispatchReport, MessageTemplate, RecipientLedger, SmtpConfig, SmtpTransport,
    Transport,
};
use courier_ledger::{Ledger, LedgerConfig};
use serde::Deserialize;

use crate::config::CampaignConfig;

/// Top-level configuration, read from `courier.config.ron`
///
/// ```ron
/// Courier (
///     ledger: Sqlite(url: "sqlite://courier.db"),
///     smtp: (host: "smtp.gmail.com", port: 465, tls: Wrapper, pool_max_size: 3),
///     campaign: (subject: "Hello", template: "template.html"),
/// )
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Courier {
    pub ledger: LedgerConfig,
    pub smtp: SmtpConfig,
    pub campaign: CampaignConfig,
}

impl Courier {
    /// Parse and validate a configuration
    ///
    /// # Errors
    /// If the text isn't valid RON for this structure, or a value is out of
    /// range (zero batch size, inverted or zero rotation threshold).
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let courier: Self = ron::from_str(content)?;
        courier.campaign.dispatch_config().validate()?;
        Ok(courier)
    }

    /// Read a configuration file. A relative template path is taken relative
    /// to the file's directory.
    ///
    /// # Errors
    /// If the file can't be read or doesn't parse.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let mut courier = Self::parse(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;

        if let Some(base) = path.parent() {
            courier.campaign.resolve_template(base);
        }

        Ok(courier)
    }

    /// Connect to the configured ledger
    ///
    /// # Errors
    /// If the store can't be opened.
    pub async fn open_ledger(&self) -> anyhow::Result<Arc<dyn Ledger>> {
        Ok(self.ledger.clone().into_ledger().await?)
    }

    #[must_use]
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(SmtpTransport::new(self.smtp.clone()))
    }

    /// Send the campaign to every pending recipient in `file`
    ///
    /// # Errors
    /// If setup fails (ledger, template, progress file) or the run hits a
    /// fatal bookkeeping error. Running out of identities is not an error;
    /// the report says so.
    pub async fn send(&self, file: &Path) -> anyhow::Result<DispatchReport> {
        let ledger = self.open_ledger().await?;
        self.send_with(file, ledger, self.transport()).await
    }

    /// [`Courier::send`] with an explicit ledger and transport
    ///
    /// # Errors
    /// As [`Courier::send`].
    pub async fn send_with(
        &self,
        file: &Path,
        ledger: Arc<dyn Ledger>,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<DispatchReport> {
        let template =
            MessageTemplate::load(&self.campaign.template, &self.campaign.subject).await?;

        let mut recipients = RecipientLedger::load(file, &self.campaign.columns())
            .await
            .with_context(|| format!("Failed to read progress file {}", file.display()))?;

        let engine = DispatchEngine::new(
            ledger,
            transport,
            self.campaign.dispatch_config(),
            template,
        )?;

        internal!(
            level = INFO,
            file = %file.display(),
            subject = %self.campaign.subject,
            "Campaign starting"
        );

        Ok(engine.run(&mut recipients).await?)
    }
}
