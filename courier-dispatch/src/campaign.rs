//! Recipient list maintenance across several progress files

use std::path::{Path, PathBuf};

use ahash::AHashSet;
use courier_common::{Address, internal};

use crate::{
    error::RecipientError,
    recipients::{ColumnConfig, RecipientLedger, write_atomic},
};

/// Rows removed from one file by [`dedupe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDedupe {
    pub path: PathBuf,
    pub removed: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupeSummary {
    pub files: Vec<FileDedupe>,
}

impl DedupeSummary {
    #[must_use]
    pub fn total_removed(&self) -> usize {
        self.files.iter().map(|file| file.removed).sum()
    }

    #[must_use]
    pub fn total_remaining(&self) -> usize {
        self.files.iter().map(|file| file.remaining).sum()
    }
}

/// Remove recipients that already appear earlier, within the same file or in
/// a file that sorts before it, and rewrite every file.
///
/// Files are processed in lexical path order regardless of the order given.
///
/// # Errors
/// If any file can't be read or written. Files processed before the failing
/// one have already been rewritten.
pub async fn dedupe(
    files: &[PathBuf],
    columns: &ColumnConfig,
) -> Result<DedupeSummary, RecipientError> {
    let mut files = files.to_vec();
    files.sort();

    let mut seen = AHashSet::new();
    let mut summary = DedupeSummary::default();

    for path in files {
        let mut ledger = RecipientLedger::load(&path, columns).await?;
        let removed = ledger.retain(|entry| seen.insert(entry.address.clone()));
        ledger.save().await?;

        internal!(
            level = INFO,
            file = %path.display(),
            removed,
            "Removed duplicate recipients"
        );

        summary.files.push(FileDedupe {
            remaining: ledger.entries().len(),
            path,
            removed,
        });
    }

    Ok(summary)
}

/// Collapse several files into a single-column file of distinct recipients,
/// each placed at its last occurrence across the inputs (taken in the order
/// given). Returns the number of addresses written.
///
/// # Errors
/// If an input can't be read or the output can't be written.
pub async fn merge(
    output: &Path,
    files: &[PathBuf],
    columns: &ColumnConfig,
) -> Result<usize, RecipientError> {
    let mut occurrences: Vec<Address> = Vec::new();
    for path in files {
        let ledger = RecipientLedger::load(path, columns).await?;
        occurrences.extend(ledger.entries().iter().map(|entry| entry.address.clone()));
    }

    let mut seen = AHashSet::new();
    let mut ordered: Vec<Address> = occurrences
        .into_iter()
        .rev()
        .filter(|address| seen.insert(address.clone()))
        .collect();
    ordered.reverse();

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([columns.address_column.as_str()])?;
    for address in &ordered {
        writer.write_record([address.as_str()])?;
    }
    let contents = writer
        .into_inner()
        .map_err(|e| RecipientError::io(output, e.into_error()))?;

    write_atomic(output, &contents).await?;

    internal!(
        level = INFO,
        file = %output.display(),
        inputs = files.len(),
        recipients = ordered.len(),
        "Merged recipient lists"
    );

    Ok(ordered.len())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    async fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, contents).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_dedupe_across_files_in_lexical_order() {
        let dir = tempfile::tempdir().unwrap();
        let b = write(
            dir.path(),
            "list-b.csv",
            "Name,E-mail 1 - Value\nAnn,ANN@example.com\nDee,dee@example.com\n",
        )
        .await;
        let a = write(
            dir.path(),
            "list-a.csv",
            "Name,E-mail 1 - Value\nAnn,ann@example.com\nBob,bob@example.com\nBob2,bob@example.com\n",
        )
        .await;

        let summary = dedupe(&[b.clone(), a.clone()], &ColumnConfig::default())
            .await
            .unwrap();

        assert_eq!(summary.files[0].path, a);
        assert_eq!(summary.files[0].removed, 1);
        assert_eq!(summary.files[1].removed, 1);
        assert_eq!(summary.total_removed(), 2);
        assert_eq!(summary.total_remaining(), 3);

        let rewritten = tokio::fs::read_to_string(&b).await.unwrap();
        assert_eq!(rewritten, "Name,E-mail 1 - Value,Sent\nDee,dee@example.com,no\n");
    }

    #[tokio::test]
    async fn test_merge_keeps_last_occurrence_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = write(
            dir.path(),
            "first.csv",
            "E-mail 1 - Value\na@example.com\nb@example.com\nc@example.com\n",
        )
        .await;
        let second = write(
            dir.path(),
            "second.csv",
            "Other,E-mail 1 - Value\nx,A@example.com\ny,\n",
        )
        .await;
        let output = dir.path().join("master.csv");

        let written = merge(&output, &[first, second], &ColumnConfig::default())
            .await
            .unwrap();

        assert_eq!(written, 3);
        assert_eq!(
            tokio::fs::read_to_string(&output).await.unwrap(),
            "E-mail 1 - Value\nb@example.com\nc@example.com\na@example.com\n"
        );
    }
}
