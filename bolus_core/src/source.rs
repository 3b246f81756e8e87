//! Record source collaborators and the file-backed reference backend.
//!
//! The engine never talks to a transport directly. It sees three seams:
//! a read side for the authoritative dosing record, a write side for
//! acknowledging injections, and an alert sink. `FileRecordBackend`
//! implements the first two over a JSON file in the shape a background
//! sync agent drops on disk; tests swap in mocks.

use crate::{DosingRecord, Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

/// Read side of the authoritative record store
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetch the latest dosing record for a user
    ///
    /// `Ok(None)` means the source answered and has no record (deleted or
    /// never created). `Err` means the source could not answer at all;
    /// callers must leave local state exactly as it was.
    async fn fetch_latest(&self, user_id: &str) -> Result<Option<DosingRecord>>;
}

/// Write side of the record store, for acknowledging injections
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Mark a record as injected at the given instant
    ///
    /// Fails with [`Error::SyncFailed`] when the record is no longer the
    /// current one on the source side.
    async fn mark_injected(&self, record_id: Uuid, at: DateTime<Utc>) -> Result<()>;
}

/// What kind of event an alert reports
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    NightHypoRisk,
    SyncFailed,
    TimerExpired,
}

/// How loudly the alert should surface
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Notice,
    Warning,
    Critical,
}

/// Sink for user-facing alerts
///
/// Implementations must not block: the engine raises alerts from inside
/// its state lock.
pub trait AlertSink: Send + Sync {
    fn raise_alert(&self, kind: AlertKind, severity: AlertSeverity, message: &str);
}

/// Alert sink that forwards everything to the log
///
/// The default sink for headless use; hosts with a real notification
/// surface provide their own.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn raise_alert(&self, kind: AlertKind, severity: AlertSeverity, message: &str) {
        match severity {
            AlertSeverity::Critical => tracing::error!("ALERT [{:?}]: {}", kind, message),
            AlertSeverity::Warning => tracing::warn!("ALERT [{:?}]: {}", kind, message),
            AlertSeverity::Notice => tracing::info!("ALERT [{:?}]: {}", kind, message),
        }
    }
}

/// On-disk record file format (matches the sync agent's output)
#[derive(Debug, Serialize, Deserialize)]
struct RecordFile {
    user_id: String,
    record: DosingRecord,
}

/// File-backed record source and store
pub struct FileRecordBackend {
    path: PathBuf,
}

impl FileRecordBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Write a record for a user, replacing whatever is there
    ///
    /// Not part of the engine-facing traits; the sync agent (and tests)
    /// seed records through this.
    pub fn put_record(&self, user_id: &str, record: &DosingRecord) -> Result<()> {
        let file = RecordFile {
            user_id: user_id.to_string(),
            record: record.clone(),
        };
        self.write_file(&file)
    }

    fn read_file(&self) -> Result<Option<RecordFile>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let file = File::open(&self.path)
            .map_err(|e| Error::RecordSource(format!("open {:?}: {}", self.path, e)))?;
        file.lock_shared()
            .map_err(|e| Error::RecordSource(format!("lock {:?}: {}", self.path, e)))?;

        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(&file);
        let read_result = reader.read_to_string(&mut contents);
        let _ = file.unlock();
        read_result.map_err(|e| Error::RecordSource(format!("read {:?}: {}", self.path, e)))?;

        let parsed: RecordFile = serde_json::from_str(&contents)
            .map_err(|e| Error::RecordSource(format!("parse {:?}: {}", self.path, e)))?;

        Ok(Some(parsed))
    }

    fn write_file(&self, file: &RecordFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp = NamedTempFile::new_in(self.path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "record path missing parent")
        })?)?;

        temp.as_file().lock_exclusive()?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string(file)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;

        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Wrote record {} to {:?}", file.record.id, self.path);
        Ok(())
    }
}

#[async_trait]
impl RecordSource for FileRecordBackend {
    async fn fetch_latest(&self, user_id: &str) -> Result<Option<DosingRecord>> {
        let file = match self.read_file()? {
            Some(file) => file,
            None => {
                tracing::debug!("No record file at {:?}", self.path);
                return Ok(None);
            }
        };

        if file.user_id != user_id {
            tracing::debug!(
                "Record file belongs to '{}', not '{}'",
                file.user_id,
                user_id
            );
            return Ok(None);
        }

        Ok(Some(file.record))
    }
}

#[async_trait]
impl RecordStore for FileRecordBackend {
    async fn mark_injected(&self, record_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut file = self.read_file()?.ok_or_else(|| {
            Error::SyncFailed(format!("no record file to acknowledge {}", record_id))
        })?;

        if file.record.id != record_id {
            return Err(Error::SyncFailed(format!(
                "record {} is no longer current (source has {})",
                record_id, file.record.id
            )));
        }

        file.record.mark_injected(at);
        self.write_file(&file)?;

        tracing::info!("Acknowledged injection of record {} to source", record_id);
        Ok(())
    }
}

/// Build the record file path inside a data directory
pub fn record_path(data_dir: &Path) -> PathBuf {
    data_dir.join("record.json")
}
