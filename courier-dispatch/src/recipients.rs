//! Progress file: the CSV recipient list that doubles as a checkpoint
//!
//! Rows are read leniently (BOM, ragged rows, stray quotes, invalid UTF-8) and
//! written back in full after every batch with the sent-marker column set to
//! `yes` or `no`. Every other column is carried through untouched.

use std::path::{Path, PathBuf};

use courier_common::{Address, internal};
use tokio::fs;

use crate::error::RecipientError;

/// Column names used to read and write a progress file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnConfig {
    /// Header of the column holding the recipient address
    pub address_column: String,

    /// Header of the sent-marker column, added on first save if missing
    pub sent_column: String,
}

pub const DEFAULT_ADDRESS_COLUMN: &str = "E-mail 1 - Value";
pub const DEFAULT_SENT_COLUMN: &str = "Sent";

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            address_column: DEFAULT_ADDRESS_COLUMN.to_string(),
            sent_column: DEFAULT_SENT_COLUMN.to_string(),
        }
    }
}

/// Whether a marker cell means "already sent"
pub fn is_sent_marker(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "yes" | "true" | "1"
    )
}

/// One recipient row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientEntry {
    pub address: Address,
    pub already_sent: bool,
    /// Every cell of the row, aligned with the file's headers
    pub(crate) fields: Vec<String>,
}

impl RecipientEntry {
    /// All cells of the row, in header order
    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

/// A loaded progress file
#[derive(Debug, Clone)]
pub struct RecipientLedger {
    path: PathBuf,
    headers: Vec<String>,
    sent_idx: usize,
    entries: Vec<RecipientEntry>,
}

impl RecipientLedger {
    /// Read and parse a progress file.
    ///
    /// # Errors
    /// If the file can't be read, has no header row, or the header row has no
    /// recipient column.
    pub async fn load(
        path: impl AsRef<Path>,
        columns: &ColumnConfig,
    ) -> Result<Self, RecipientError> {
        let path = path.as_ref();
        let raw = fs::read(path)
            .await
            .map_err(|e| RecipientError::io(path, e))?;

        let ledger = Self::parse(path, &raw, columns)?;

        internal!(
            level = DEBUG,
            file = %path.display(),
            rows = ledger.entries.len(),
            pending = ledger.pending().count(),
            "Loaded progress file"
        );

        Ok(ledger)
    }

    fn parse(path: &Path, raw: &[u8], columns: &ColumnConfig) -> Result<Self, RecipientError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .has_headers(true)
            .from_reader(strip_preamble(raw));

        let mut headers: Vec<String> = reader
            .byte_headers()?
            .iter()
            .map(|cell| String::from_utf8_lossy(cell).trim().to_string())
            .collect();

        let address_idx = headers
            .iter()
            .position(|header| header == &columns.address_column)
            .ok_or_else(|| RecipientError::MissingColumn(columns.address_column.clone()))?;

        // Cells past the file's own header never count as a marker.
        let file_width = headers.len();
        let marker_idx = headers
            .iter()
            .position(|header| header == &columns.sent_column);
        let sent_idx = marker_idx.unwrap_or_else(|| {
            headers.push(columns.sent_column.clone());
            file_width
        });

        let mut entries = Vec::new();
        for (line, record) in reader.byte_records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    internal!(
                        level = WARN,
                        file = %path.display(),
                        row = line + 1,
                        error = %e,
                        "Skipping unreadable row"
                    );
                    continue;
                }
            };

            let mut fields: Vec<String> = record
                .iter()
                .take(file_width)
                .map(|cell| String::from_utf8_lossy(cell).into_owned())
                .collect();
            fields.resize(headers.len(), String::new());

            let Some(address) = Address::parse(&fields[address_idx]) else {
                continue;
            };

            let already_sent = marker_idx.is_some() && is_sent_marker(&fields[sent_idx]);
            entries.push(RecipientEntry {
                address,
                already_sent,
                fields,
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            headers,
            sent_idx,
            entries,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    #[must_use]
    pub fn entries(&self) -> &[RecipientEntry] {
        &self.entries
    }

    /// Entries that still need sending, in file order
    pub fn pending(&self) -> impl Iterator<Item = &RecipientEntry> {
        self.entries.iter().filter(|entry| !entry.already_sent)
    }

    /// Mark every row carrying `address` as sent, returning how many changed
    pub fn mark_sent(&mut self, address: &Address) -> usize {
        let mut changed = 0;
        for entry in self
            .entries
            .iter_mut()
            .filter(|entry| &entry.address == address && !entry.already_sent)
        {
            entry.already_sent = true;
            changed += 1;
        }
        changed
    }

    /// Keep only the rows for which `keep` returns `true`, returning how many
    /// were removed
    pub fn retain(&mut self, mut keep: impl FnMut(&RecipientEntry) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| keep(entry));
        before - self.entries.len()
    }

    /// Serialise the whole file, marker column included
    ///
    /// # Errors
    /// If the CSV writer fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, RecipientError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.headers)?;

        for entry in &self.entries {
            let marker = if entry.already_sent { "yes" } else { "no" };
            writer.write_record(entry.fields.iter().enumerate().map(|(idx, cell)| {
                if idx == self.sent_idx {
                    marker
                } else {
                    cell.as_str()
                }
            }))?;
        }

        writer
            .into_inner()
            .map_err(|e| RecipientError::io(&self.path, e.into_error()))
    }

    /// Rewrite the file in place: write a sibling temp file, then rename it
    /// over the original.
    ///
    /// # Errors
    /// If the file can't be written or renamed.
    pub async fn save(&self) -> Result<(), RecipientError> {
        write_atomic(&self.path, &self.to_bytes()?).await?;

        internal!(
            level = DEBUG,
            file = %self.path.display(),
            sent = self.entries.iter().filter(|e| e.already_sent).count(),
            "Saved progress file"
        );

        Ok(())
    }
}

/// Drop a UTF-8 BOM and any leading blank lines
pub(crate) fn strip_preamble(raw: &[u8]) -> &[u8] {
    let mut raw = raw.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(raw);

    while let Some(end) = raw.iter().position(|&b| b == b'\n') {
        if raw[..end].iter().all(u8::is_ascii_whitespace) {
            raw = &raw[end + 1..];
        } else {
            break;
        }
    }

    raw
}

pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), RecipientError> {
    let file_name = path
        .file_name()
        .map_or_else(|| "progress.csv".into(), |name| name.to_string_lossy());
    let temp_path = path.with_file_name(format!(".tmp_{file_name}"));

    fs::write(&temp_path, contents)
        .await
        .map_err(|e| RecipientError::io(&temp_path, e))?;
    fs::rename(&temp_path, path)
        .await
        .map_err(|e| RecipientError::io(path, e))
}
