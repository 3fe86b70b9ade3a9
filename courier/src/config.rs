use std::path::{Path, PathBuf};

use courier_dispatch::{
    ColumnConfig, DispatchConfig, RotationPolicy, ThresholdRange, engine,
    recipients::{DEFAULT_ADDRESS_COLUMN, DEFAULT_SENT_COLUMN},
};
use serde::Deserialize;

/// Per-campaign settings
///
/// ```ron
/// campaign: (
///     subject: "Hello",
///     template: "template.html",
///     batch_size: 5,
///     batch_delay_ms: 2000,
///     policy: Fair,
///     rotation_threshold: (min: 15, max: 30),
///     max_reported_failures: 10,
///     address_column: "E-mail 1 - Value",
///     sent_column: "Sent",
/// )
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CampaignConfig {
    pub subject: String,

    /// HTML body, read once before the first send
    pub template: PathBuf,

    #[serde(default = "engine::defaults::batch_size")]
    pub batch_size: usize,

    #[serde(default = "engine::defaults::batch_delay_ms")]
    pub batch_delay_ms: u64,

    #[serde(default)]
    pub policy: RotationPolicy,

    #[serde(default)]
    pub rotation_threshold: ThresholdRange,

    #[serde(default = "engine::defaults::max_reported_failures")]
    pub max_reported_failures: usize,

    #[serde(default = "default_address_column")]
    pub address_column: String,

    #[serde(default = "default_sent_column")]
    pub sent_column: String,
}

fn default_address_column() -> String {
    DEFAULT_ADDRESS_COLUMN.to_string()
}

fn default_sent_column() -> String {
    DEFAULT_SENT_COLUMN.to_string()
}

impl CampaignConfig {
    #[must_use]
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            batch_size: self.batch_size,
            batch_delay_ms: self.batch_delay_ms,
            policy: self.policy,
            rotation_threshold: self.rotation_threshold,
            max_reported_failures: self.max_reported_failures,
        }
    }

    #[must_use]
    pub fn columns(&self) -> ColumnConfig {
        ColumnConfig {
            address_column: self.address_column.clone(),
            sent_column: self.sent_column.clone(),
        }
    }

    /// Resolve the template path against the configuration file's directory
    pub(crate) fn resolve_template(&mut self, base: &Path) {
        if self.template.is_relative() {
            self.template = base.join(&self.template);
        }
    }
}

pub const CONFIG_ENV: &str = "COURIER_CONFIG";
const CONFIG_FILE_NAME: &str = "courier.config.ron";

/// Locate `courier.config.ron`. An explicit `COURIER_CONFIG` must exist; it is
/// never silently replaced by a default location. Otherwise the working
/// directory wins over `/etc/courier`.
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    let candidates = [
        Path::new(".").join(CONFIG_FILE_NAME),
        Path::new("/etc/courier").join(CONFIG_FILE_NAME),
    ];
    locate(std::env::var_os(CONFIG_ENV).map(PathBuf::from), &candidates)
}

fn locate(explicit: Option<PathBuf>, candidates: &[PathBuf]) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        anyhow::ensure!(
            path.is_file(),
            "{CONFIG_ENV} is set to {}, which doesn't exist",
            path.display()
        );
        return Ok(path);
    }

    if let Some(found) = candidates.iter().find(|path| path.is_file()) {
        return Ok(found.clone());
    }

    let searched: Vec<String> = candidates
        .iter()
        .map(|path| path.display().to_string())
        .collect();
    anyhow::bail!(
        "Couldn't find {CONFIG_FILE_NAME}: {CONFIG_ENV} is unset and none of [{}] exist",
        searched.join(", ")
    )
}
