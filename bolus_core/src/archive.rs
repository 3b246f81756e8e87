//! CSV archive for rolled-up journal doses.
//!
//! The journal grows without bound, but a dose older than the longest
//! insulin duration can never contribute to IOB again. Rollup moves journal
//! entries into a CSV archive atomically so nothing is lost if the process
//! dies mid-way.

use crate::{InsulinEntry, Result};
use std::fs::OpenOptions;
use std::path::Path;

/// A row in the CSV output
#[derive(Debug, serde::Serialize)]
struct CsvRow {
    id: String,
    units: f64,
    kind: String,
    taken_at: String,
}

impl From<&InsulinEntry> for CsvRow {
    fn from(entry: &InsulinEntry) -> Self {
        CsvRow {
            id: entry.id.to_string(),
            units: entry.units,
            kind: entry.kind.label().to_string(),
            taken_at: entry.taken_at.to_rfc3339(),
        }
    }
}

/// Roll up journal doses into CSV and archive the journal atomically
///
/// This function:
/// 1. Reads all doses from the journal
/// 2. Appends them to the CSV file (creates with headers if needed)
/// 3. Syncs the CSV to disk
/// 4. Renames the journal to .processed
/// 5. Returns the number of doses processed
///
/// # Safety
/// - CSV is fsynced before the journal is renamed
/// - The journal is renamed (not deleted) to allow manual recovery
/// - Processed journal files can be cleaned up separately
pub fn journal_to_csv_and_archive(journal_path: &Path, csv_path: &Path) -> Result<usize> {
    // Read all doses from the journal
    let entries = crate::journal::read_entries(journal_path)?;

    if entries.is_empty() {
        tracing::info!("No doses in journal to roll up");
        return Ok(0);
    }

    // Ensure parent directory exists
    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Open CSV file for appending
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(csv_path)?;

    // Determine if we need to write headers by checking file size after opening
    let needs_headers = file.metadata()?.len() == 0;

    // For appending, we need to skip headers if the file already has content
    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_headers)
        .from_writer(file);

    // Write all doses to CSV
    for entry in &entries {
        let row = CsvRow::from(entry);
        writer.serialize(row)?;
    }

    // Flush and sync to disk
    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    tracing::info!("Wrote {} doses to CSV", entries.len());

    // Atomically archive the journal by renaming it
    let processed_path = journal_path.with_extension("jsonl.processed");
    std::fs::rename(journal_path, &processed_path)?;

    tracing::info!("Archived journal to {:?}", processed_path);

    Ok(entries.len())
}

/// Clean up old processed journal files
///
/// This removes all .jsonl.processed files in the given directory.
pub fn cleanup_processed_journals(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if let Some(extension) = path.extension() {
            if extension == "processed" {
                std::fs::remove_file(&path)?;
                tracing::debug!("Removed processed journal: {:?}", path);
                count += 1;
            }
        }
    }

    if count > 0 {
        tracing::info!("Cleaned up {} processed journal files", count);
    }

    Ok(count)
}
