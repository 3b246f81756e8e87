//! External exercise signal loader.
//!
//! This module loads exercise session information dropped by an external
//! tracker to inform night-hypo risk and dose-reduction guidance.

use crate::{ExerciseIntensity, ExerciseSignal, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Sessions younger than this count as "recent exercise" for risk checks
pub const RECENT_EXERCISE_WINDOW_HOURS: i64 = 24;

/// Exercise signal file format (matches external tracker output)
#[derive(Debug, Serialize, Deserialize)]
struct ExerciseSignalFile {
    last_session_at: DateTime<Utc>,
    intensity: String,
    #[serde(default)]
    duration_minutes: u32,
}

/// Load the external exercise signal from a JSON file
///
/// Returns None if the file doesn't exist (no exercise logged). A file
/// that exists but can't be read or parsed is ignored with a warning, not
/// an error; a broken tracker should never block a dose calculation.
pub fn load_exercise_signal(path: &Path) -> Result<Option<ExerciseSignal>> {
    if !path.exists() {
        tracing::debug!("No exercise signal file found at {:?}", path);
        return Ok(None);
    }

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!(
                "Failed to read exercise signal at {:?}: {}. Ignoring signal.",
                path,
                e
            );
            return Ok(None);
        }
    };

    let file: ExerciseSignalFile = match serde_json::from_str(&contents) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(
                "Failed to parse exercise signal at {:?}: {}. Ignoring signal.",
                path,
                e
            );
            return Ok(None);
        }
    };

    let intensity = parse_intensity(&file.intensity);

    tracing::info!(
        "Loaded exercise signal: {:?} for {} min at {}",
        intensity,
        file.duration_minutes,
        file.last_session_at
    );

    Ok(Some(ExerciseSignal {
        last_session_at: file.last_session_at,
        intensity,
        duration_minutes: file.duration_minutes,
    }))
}

/// Persist an exercise session so later risk checks see it
///
/// Writes the same format the external tracker drops, so a manually
/// logged session and a tracker-synced one read back identically.
pub fn save_exercise_signal(path: &Path, signal: &ExerciseSignal) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = ExerciseSignalFile {
        last_session_at: signal.last_session_at,
        intensity: intensity_str(signal.intensity).to_string(),
        duration_minutes: signal.duration_minutes,
    };
    let json = serde_json::to_string_pretty(&file)?;
    std::fs::write(path, json)?;

    tracing::info!("Saved exercise signal to {:?}", path);
    Ok(())
}

/// Whether a loaded signal counts as recent exercise at `now`
pub fn is_recent(signal: Option<&ExerciseSignal>, now: DateTime<Utc>) -> bool {
    match signal {
        Some(s) => now - s.last_session_at < Duration::hours(RECENT_EXERCISE_WINDOW_HOURS),
        None => false,
    }
}

fn intensity_str(intensity: ExerciseIntensity) -> &'static str {
    match intensity {
        ExerciseIntensity::Low => "low",
        ExerciseIntensity::Moderate => "moderate",
        ExerciseIntensity::High => "high",
    }
}

/// Parse intensity string into enum, defaulting unknown values to moderate
fn parse_intensity(s: &str) -> ExerciseIntensity {
    match s.to_lowercase().as_str() {
        "low" | "light" => ExerciseIntensity::Low,
        "moderate" | "medium" => ExerciseIntensity::Moderate,
        "high" | "intense" | "vigorous" => ExerciseIntensity::High,
        other => {
            tracing::warn!("Unknown exercise intensity '{}', assuming moderate", other);
            ExerciseIntensity::Moderate
        }
    }
}
