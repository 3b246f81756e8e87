//! Core domain types for the bolus dosing system.
//!
//! This module defines the fundamental types used throughout the system:
//! - Dosing records synced from the authoritative record source
//! - Insulin entries and their decay characteristics
//! - Exercise signal integration

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Dosing Record Types
// ============================================================================

/// A dosing record as synced from the record source.
///
/// Carries both the raw inputs (glucose, carbs, therapy parameters) and the
/// derived dose fields so consumers can display a record without recomputing
/// it. `timer_duration_minutes` drives the injection-site timer started when
/// this record becomes active.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DosingRecord {
    pub id: Uuid,
    pub current_glucose: f64,
    pub target_glucose: f64,
    pub carbohydrates: f64,
    pub insulin_ratio: f64,
    pub correction_factor: f64,
    pub carb_insulin: f64,
    pub correction_insulin: f64,
    pub total_insulin: f64,
    pub timer_duration_minutes: u32,
    pub insulin_injected: bool,
    pub injected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DosingRecord {
    /// Timer duration in seconds, the unit the timer state machine works in
    pub fn timer_duration_seconds(&self) -> u32 {
        self.timer_duration_minutes.saturating_mul(60)
    }

    /// Mark this record as injected at the given instant
    pub fn mark_injected(&mut self, at: DateTime<Utc>) {
        self.insulin_injected = true;
        self.injected_at = Some(at);
    }
}

// ============================================================================
// Insulin Entry Types
// ============================================================================

/// Insulin preparation category, determining the nominal decay duration
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InsulinKind {
    Rapid,
    Short,
    Intermediate,
    Long,
}

impl InsulinKind {
    /// Nominal active duration for this insulin kind, in hours
    pub fn duration_hours(&self) -> f64 {
        match self {
            InsulinKind::Rapid => 4.0,
            InsulinKind::Short => 6.0,
            InsulinKind::Intermediate => 12.0,
            InsulinKind::Long => 24.0,
        }
    }

    /// Human-readable label used by display surfaces
    pub fn label(&self) -> &'static str {
        match self {
            InsulinKind::Rapid => "rapid",
            InsulinKind::Short => "short",
            InsulinKind::Intermediate => "intermediate",
            InsulinKind::Long => "long",
        }
    }
}

impl std::str::FromStr for InsulinKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rapid" => Ok(InsulinKind::Rapid),
            "short" => Ok(InsulinKind::Short),
            "intermediate" => Ok(InsulinKind::Intermediate),
            "long" => Ok(InsulinKind::Long),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown insulin kind '{}' (expected rapid, short, intermediate, or long)",
                other
            ))),
        }
    }
}

/// A single administered insulin dose, the unit of IOB accounting
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InsulinEntry {
    pub id: Uuid,
    pub units: f64,
    pub kind: InsulinKind,
    pub taken_at: DateTime<Utc>,
}

impl InsulinEntry {
    /// Create a new entry with a fresh id
    pub fn new(units: f64, kind: InsulinKind, taken_at: DateTime<Utc>) -> Self {
        InsulinEntry {
            id: Uuid::new_v4(),
            units,
            kind,
            taken_at,
        }
    }

    /// Instant after which this entry no longer contributes to IOB
    pub fn expires_at(&self) -> DateTime<Utc> {
        let minutes = (self.kind.duration_hours() * 60.0) as i64;
        self.taken_at + Duration::minutes(minutes)
    }
}

// ============================================================================
// Exercise Signal Types
// ============================================================================

/// Exercise intensity as reported by the external tracker
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExerciseIntensity {
    Low,
    Moderate,
    High,
}

/// External exercise signal (from another system)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExerciseSignal {
    pub last_session_at: DateTime<Utc>,
    pub intensity: ExerciseIntensity,
    pub duration_minutes: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insulin_kind_durations() {
        assert_eq!(InsulinKind::Rapid.duration_hours(), 4.0);
        assert_eq!(InsulinKind::Short.duration_hours(), 6.0);
        assert_eq!(InsulinKind::Intermediate.duration_hours(), 12.0);
        assert_eq!(InsulinKind::Long.duration_hours(), 24.0);
    }

    #[test]
    fn test_entry_expiry() {
        let taken = Utc::now();
        let entry = InsulinEntry::new(5.0, InsulinKind::Rapid, taken);
        assert_eq!(entry.expires_at(), taken + Duration::hours(4));
    }

    #[test]
    fn test_timer_duration_seconds() {
        let record = DosingRecord {
            id: Uuid::new_v4(),
            current_glucose: 150.0,
            target_glucose: 100.0,
            carbohydrates: 60.0,
            insulin_ratio: 10.0,
            correction_factor: 50.0,
            carb_insulin: 6.0,
            correction_insulin: 1.0,
            total_insulin: 7.0,
            timer_duration_minutes: 180,
            insulin_injected: false,
            injected_at: None,
            created_at: Utc::now(),
        };
        assert_eq!(record.timer_duration_seconds(), 10_800);
    }

    #[test]
    fn test_mark_injected() {
        let mut record = DosingRecord {
            id: Uuid::new_v4(),
            current_glucose: 150.0,
            target_glucose: 100.0,
            carbohydrates: 60.0,
            insulin_ratio: 10.0,
            correction_factor: 50.0,
            carb_insulin: 6.0,
            correction_insulin: 1.0,
            total_insulin: 7.0,
            timer_duration_minutes: 180,
            insulin_injected: false,
            injected_at: None,
            created_at: Utc::now(),
        };
        let at = Utc::now();
        record.mark_injected(at);
        assert!(record.insulin_injected);
        assert_eq!(record.injected_at, Some(at));
    }

    #[test]
    fn test_insulin_kind_serde_snake_case() {
        let json = serde_json::to_string(&InsulinKind::Rapid).unwrap();
        assert_eq!(json, "\"rapid\"");
        let kind: InsulinKind = serde_json::from_str("\"intermediate\"").unwrap();
        assert_eq!(kind, InsulinKind::Intermediate);
    }

    #[test]
    fn test_insulin_kind_from_str() {
        assert_eq!("rapid".parse::<InsulinKind>().unwrap(), InsulinKind::Rapid);
        assert_eq!(" Long ".parse::<InsulinKind>().unwrap(), InsulinKind::Long);
        assert!("ultra".parse::<InsulinKind>().is_err());
    }
}
