//! Append-only dose journal for IOB accounting.
//!
//! Administered doses are appended to a JSONL (JSON Lines) file with file
//! locking to ensure safe concurrent access. The read side also pulls from
//! the CSV archive so rolled-up entries still count toward IOB until they
//! decay out.

use crate::{Error, InsulinEntry, Result};
use chrono::{DateTime, Utc};
use csv::ReaderBuilder;
use fs2::FileExt;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Dose sink trait for persisting administered doses
pub trait DoseSink {
    fn append(&mut self, entry: &InsulinEntry) -> Result<()>;
}

/// JSONL-based dose sink with file locking
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    /// Create a new JSONL sink for the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Ensure the parent directory exists
    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl DoseSink for JsonlSink {
    fn append(&mut self, entry: &InsulinEntry) -> Result<()> {
        self.ensure_parent_dir()?;

        // Open file for appending
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        // Acquire exclusive lock
        file.lock_exclusive()?;

        // Write entry as JSON line
        let mut writer = std::io::BufWriter::new(&file);
        let line = serde_json::to_string(entry)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        file.unlock()?;

        tracing::debug!("Appended dose {} to journal", entry.id);
        Ok(())
    }
}

/// Read all entries from a journal file
pub fn read_entries(path: &Path) -> Result<Vec<InsulinEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    // Acquire shared lock for reading
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut entries = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<InsulinEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!("Failed to parse dose at line {}: {}", line_num + 1, e);
                // Continue reading, don't fail completely
            }
        }
    }

    file.unlock()?;
    tracing::debug!("Read {} doses from journal", entries.len());
    Ok(entries)
}

/// CSV row format for reading archived doses
#[derive(Debug, Deserialize)]
struct CsvRow {
    id: String,
    units: f64,
    kind: String,
    taken_at: String,
}

impl TryFrom<CsvRow> for InsulinEntry {
    type Error = Error;

    fn try_from(row: CsvRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| Error::Other(format!("Invalid UUID: {}", e)))?;

        let kind = row.kind.parse()?;

        let taken_at = DateTime::parse_from_rfc3339(&row.taken_at)
            .map_err(|e| Error::Other(format!("Invalid date: {}", e)))?
            .with_timezone(&Utc);

        Ok(InsulinEntry {
            id,
            units: row.units,
            kind,
            taken_at,
        })
    }
}

/// Load doses still inside their decay window from journal and CSV archive
///
/// Returns entries sorted by taken_at ascending, so a later stable sort on
/// remaining units sees them in administration order. Doses that appear in
/// both files (mid-rollup crash) are deduplicated by id, journal first.
pub fn load_active_entries(
    journal_path: &Path,
    csv_path: &Path,
    now: DateTime<Utc>,
) -> Result<Vec<InsulinEntry>> {
    let mut entries = Vec::new();
    let mut seen_ids = HashSet::new();

    // Load from the journal first (most recent)
    if journal_path.exists() {
        for entry in read_entries(journal_path)? {
            if entry.expires_at() > now {
                seen_ids.insert(entry.id);
                entries.push(entry);
            }
        }
        tracing::debug!("Loaded {} active doses from journal", entries.len());
    }

    // Load from the CSV archive
    if csv_path.exists() {
        let mut csv_count = 0;
        for entry in load_entries_from_csv(csv_path)? {
            if entry.expires_at() > now && !seen_ids.contains(&entry.id) {
                seen_ids.insert(entry.id);
                entries.push(entry);
                csv_count += 1;
            }
        }
        tracing::debug!("Loaded {} active doses from CSV", csv_count);
    }

    // Sort by taken_at, oldest first (administration order)
    entries.sort_by(|a, b| a.taken_at.cmp(&b.taken_at));

    tracing::info!("Loaded {} doses still on board", entries.len());

    Ok(entries)
}

/// Load all entries from a CSV file
fn load_entries_from_csv(path: &Path) -> Result<Vec<InsulinEntry>> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;

    let mut entries = Vec::new();
    for result in reader.deserialize::<CsvRow>() {
        match result {
            Ok(row) => match InsulinEntry::try_from(row) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!("Failed to parse CSV row: {}", e);
                    // Continue processing other rows
                }
            },
            Err(e) => {
                tracing::warn!("Failed to deserialize CSV row: {}", e);
            }
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InsulinKind;
    use chrono::Duration;

    fn entry_taken(units: f64, kind: InsulinKind, hours_ago: i64) -> InsulinEntry {
        InsulinEntry::new(units, kind, Utc::now() - Duration::hours(hours_ago))
    }

    #[test]
    fn test_append_and_read_single_entry() {
        let temp_dir = tempfile::tempdir().unwrap();
        let journal_path = temp_dir.path().join("test.jsonl");

        let entry = entry_taken(5.0, InsulinKind::Rapid, 1);
        let entry_id = entry.id;

        let mut sink = JsonlSink::new(&journal_path);
        sink.append(&entry).unwrap();

        let entries = read_entries(&journal_path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, entry_id);
        assert_eq!(entries[0].units, 5.0);
    }

    #[test]
    fn test_append_multiple_entries() {
        let temp_dir = tempfile::tempdir().unwrap();
        let journal_path = temp_dir.path().join("test.jsonl");

        let mut sink = JsonlSink::new(&journal_path);
        for _ in 0..5 {
            sink.append(&entry_taken(2.0, InsulinKind::Rapid, 1)).unwrap();
        }

        let entries = read_entries(&journal_path).unwrap();
        assert_eq!(entries.len(), 5);
    }

    #[test]
    fn test_read_empty_journal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let journal_path = temp_dir.path().join("nonexistent.jsonl");

        let entries = read_entries(&journal_path).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let journal_path = temp_dir.path().join("test.jsonl");

        let mut sink = JsonlSink::new(&journal_path);
        sink.append(&entry_taken(5.0, InsulinKind::Rapid, 1)).unwrap();

        // Simulate a torn write
        let mut file = OpenOptions::new()
            .append(true)
            .open(&journal_path)
            .unwrap();
        file.write_all(b"{ torn li").unwrap();
        file.write_all(b"\n").unwrap();

        sink.append(&entry_taken(3.0, InsulinKind::Short, 2)).unwrap();

        let entries = read_entries(&journal_path).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_load_active_filters_expired() {
        let temp_dir = tempfile::tempdir().unwrap();
        let journal_path = temp_dir.path().join("doses.jsonl");
        let csv_path = temp_dir.path().join("doses.csv");

        let mut sink = JsonlSink::new(&journal_path);
        sink.append(&entry_taken(10.0, InsulinKind::Rapid, 5)).unwrap(); // Expired
        sink.append(&entry_taken(4.0, InsulinKind::Rapid, 1)).unwrap();
        sink.append(&entry_taken(2.0, InsulinKind::Long, 20)).unwrap(); // 24h kind, active

        let entries = load_active_entries(&journal_path, &csv_path, Utc::now()).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_load_active_sorted_by_taken_at() {
        let temp_dir = tempfile::tempdir().unwrap();
        let journal_path = temp_dir.path().join("doses.jsonl");
        let csv_path = temp_dir.path().join("doses.csv");

        let mut sink = JsonlSink::new(&journal_path);
        let newer = entry_taken(4.0, InsulinKind::Rapid, 1);
        let older = entry_taken(6.0, InsulinKind::Rapid, 3);
        sink.append(&newer).unwrap();
        sink.append(&older).unwrap();

        let entries = load_active_entries(&journal_path, &csv_path, Utc::now()).unwrap();
        assert_eq!(entries[0].id, older.id);
        assert_eq!(entries[1].id, newer.id);
    }

    #[test]
    fn test_deduplication_across_journal_and_csv() {
        let temp_dir = tempfile::tempdir().unwrap();
        let journal_path = temp_dir.path().join("doses.jsonl");
        let csv_path = temp_dir.path().join("doses.csv");

        let entry = entry_taken(5.0, InsulinKind::Rapid, 1);
        let entry_id = entry.id;
        let mut sink = JsonlSink::new(&journal_path);
        sink.append(&entry).unwrap();

        // Roll up to CSV, then re-append to the journal to simulate a
        // crash between the CSV write and the journal rename
        crate::archive::journal_to_csv_and_archive(&journal_path, &csv_path).unwrap();
        let mut sink = JsonlSink::new(&journal_path);
        sink.append(&entry).unwrap();

        let entries = load_active_entries(&journal_path, &csv_path, Utc::now()).unwrap();
        let count = entries.iter().filter(|e| e.id == entry_id).count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_csv_row_roundtrip() {
        let row = CsvRow {
            id: "550e8400-e29b-41d4-a716-446655440000".into(),
            units: 4.5,
            kind: "rapid".into(),
            taken_at: "2026-01-15T22:30:00Z".into(),
        };
        let entry = InsulinEntry::try_from(row).unwrap();
        assert_eq!(entry.units, 4.5);
        assert_eq!(entry.kind, InsulinKind::Rapid);
    }

    #[test]
    fn test_csv_row_rejects_bad_kind() {
        let row = CsvRow {
            id: "550e8400-e29b-41d4-a716-446655440000".into(),
            units: 4.5,
            kind: "ultra".into(),
            taken_at: "2026-01-15T22:30:00Z".into(),
        };
        assert!(InsulinEntry::try_from(row).is_err());
    }
}
