//! Timer snapshot persistence with file locking.
//!
//! The snapshot stores the timer's wall-clock anchor and duration, never a
//! countdown value, so a process that restarts hours later resumes exactly
//! where the wall clock says it should be. Corrupt or missing snapshots
//! degrade to an idle timer rather than aborting; the record source is
//! authoritative and will rebuild state on the next reconcile.

use crate::{Error, Result, TimerStateMachine};
use fs2::FileExt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;

impl TimerStateMachine {
    /// Load the timer snapshot with shared locking
    ///
    /// Returns an idle machine if the file doesn't exist.
    /// If the file is corrupted, logs a warning and returns an idle machine.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No timer snapshot found, starting idle");
            return Ok(Self::default());
        }

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(
                    "Unable to open timer snapshot {:?}: {}. Starting idle.",
                    path,
                    e
                );
                return Ok(Self::default());
            }
        };

        // Acquire shared lock for reading
        if let Err(e) = file.lock_shared() {
            tracing::warn!(
                "Unable to lock timer snapshot {:?}: {}. Starting idle.",
                path,
                e
            );
            return Ok(Self::default());
        }

        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(&file);
        if let Err(e) = reader.read_to_string(&mut contents) {
            let _ = file.unlock();
            tracing::warn!(
                "Failed to read timer snapshot {:?}: {}. Starting idle.",
                path,
                e
            );
            return Ok(Self::default());
        }

        file.unlock()?;

        match serde_json::from_str::<TimerStateMachine>(&contents) {
            Ok(timer) => {
                tracing::debug!("Loaded timer snapshot from {:?}", path);
                Ok(timer)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to parse timer snapshot {:?}: {}. Starting idle.",
                    path,
                    e
                );
                Ok(Self::default())
            }
        }
    }

    /// Save the timer snapshot with exclusive locking
    ///
    /// Atomically writes the snapshot by:
    /// 1. Writing to a temp file
    /// 2. Syncing to disk
    /// 3. Renaming over the original
    pub fn save(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Create unique temp file in the same directory for atomic rename
        let temp = NamedTempFile::new_in(path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "snapshot path missing parent")
        })?)?;

        // Acquire exclusive lock on the temp file to serialize concurrent writers
        temp.as_file().lock_exclusive()?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string(self)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;

        // Atomically replace old snapshot
        temp.persist(path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Saved timer snapshot to {:?}", path);
        Ok(())
    }

    /// Load the snapshot, modify it, and save it back atomically
    pub fn update<F>(path: &Path, f: F) -> Result<Self>
    where
        F: FnOnce(&mut TimerStateMachine) -> Result<()>,
    {
        let mut timer = Self::load(path)?;
        f(&mut timer)?;
        timer.save(path)?;
        Ok(timer)
    }
}
