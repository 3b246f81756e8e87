//! Risk assessment rules for overnight hypoglycemia, exercise, and
//! menstrual-cycle insulin sensitivity.
//!
//! This module implements banded rule tables:
//! - Night-hypo risk from bedtime glucose, IOB, and recent exercise
//! - Dose reduction and monitoring guidance around exercise
//! - Cycle-phase insulin sensitivity adjustments
//!
//! Every input maps to exactly one band; there are no gaps.

use crate::ExerciseIntensity;
use serde::{Deserialize, Serialize};

/// Default bedtime glucose bound below which night-hypo risk is high
pub const DEFAULT_NIGHT_HYPO_THRESHOLD: f64 = 70.0;

/// Upper bound of the borderline bedtime glucose band
pub const BORDERLINE_BEDTIME_GLUCOSE: f64 = 100.0;

/// IOB above this makes a borderline bedtime reading high risk
pub const NIGHT_IOB_HIGH: f64 = 2.0;

/// IOB above this alone is enough for medium risk
pub const NIGHT_IOB_MEDIUM: f64 = 1.0;

/// Exercise dose reduction is never advised beyond this percentage
pub const MAX_REDUCTION_PERCENT: u8 = 50;

/// Assessed risk level
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Outcome of a bedtime risk check
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NightHypoAssessment {
    pub level: RiskLevel,
    /// Only high risk warrants waking-level alerts
    pub should_alert: bool,
    pub reason: String,
}

/// Guidance for dosing around an exercise session
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExerciseImpact {
    /// Suggested bolus reduction, percent of the computed dose
    pub dose_reduction_percent: u8,
    /// Suggested carb intake before/during the session, grams
    pub carb_intake_grams: (u8, u8),
    /// How long to keep checking glucose after the session, hours
    pub monitoring_hours: u8,
}

/// Menstrual cycle phase
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Menstrual,
    Follicular,
    Ovulation,
    Luteal,
}

/// Cycle-phase insulin sensitivity guidance
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CycleImpact {
    pub phase: CyclePhase,
    /// Suggested basal/bolus adjustment, percent (negative means reduce)
    pub dose_adjustment_percent: i8,
    pub note: String,
}

/// Assess overnight hypoglycemia risk from a bedtime reading
///
/// ## Risk rules
///
/// 1. Glucose below `threshold` → high
/// 2. Glucose in `[threshold, 100)` with IOB above 2 units or recent
///    exercise → high
/// 3. Otherwise, glucose in `[threshold, 100)` or IOB above 1 unit → medium
/// 4. Otherwise → low
///
/// Only high risk sets `should_alert`. A non-finite glucose reading is
/// treated as zero, which lands in the high band; a broken sensor should
/// wake someone up, not pass silently.
pub fn night_hypo_risk(
    bedtime_glucose: f64,
    active_iob: f64,
    recent_exercise: bool,
    threshold: f64,
) -> NightHypoAssessment {
    let glucose = if bedtime_glucose.is_finite() {
        bedtime_glucose
    } else {
        tracing::warn!(
            "Non-finite bedtime glucose {}, treating as 0",
            bedtime_glucose
        );
        0.0
    };

    let borderline = glucose >= threshold && glucose < BORDERLINE_BEDTIME_GLUCOSE;

    let (level, reason) = if glucose < threshold {
        (
            RiskLevel::High,
            format!("bedtime glucose {} below {}", glucose, threshold),
        )
    } else if borderline && active_iob > NIGHT_IOB_HIGH {
        (
            RiskLevel::High,
            format!(
                "borderline glucose {} with {} units on board",
                glucose, active_iob
            ),
        )
    } else if borderline && recent_exercise {
        (
            RiskLevel::High,
            format!("borderline glucose {} after recent exercise", glucose),
        )
    } else if borderline {
        (
            RiskLevel::Medium,
            format!("borderline bedtime glucose {}", glucose),
        )
    } else if active_iob > NIGHT_IOB_MEDIUM {
        (
            RiskLevel::Medium,
            format!("{} units still on board at bedtime", active_iob),
        )
    } else {
        (RiskLevel::Low, "glucose and IOB in safe range".to_string())
    };

    let should_alert = level == RiskLevel::High;
    if should_alert {
        tracing::warn!("Night hypo risk HIGH: {}", reason);
    } else {
        tracing::debug!("Night hypo risk {:?}: {}", level, reason);
    }

    NightHypoAssessment {
        level,
        should_alert,
        reason,
    }
}

/// Dose and monitoring guidance for an exercise session
///
/// Base reduction scales with intensity (10/20/30 percent) and grows with
/// duration: +10 for 30-59 minutes, +20 for an hour or more, capped at
/// [`MAX_REDUCTION_PERCENT`]. Monitoring extends by two hours after long
/// sessions because delayed hypos show up well after activity ends.
pub fn exercise_impact(intensity: ExerciseIntensity, duration_minutes: u32) -> ExerciseImpact {
    let base_reduction: u8 = match intensity {
        ExerciseIntensity::Low => 10,
        ExerciseIntensity::Moderate => 20,
        ExerciseIntensity::High => 30,
    };

    let duration_bump: u8 = if duration_minutes >= 60 {
        20
    } else if duration_minutes >= 30 {
        10
    } else {
        0
    };

    let dose_reduction_percent =
        (base_reduction + duration_bump).min(MAX_REDUCTION_PERCENT);

    let carb_intake_grams = match intensity {
        ExerciseIntensity::Low => (10, 15),
        ExerciseIntensity::Moderate => (15, 30),
        ExerciseIntensity::High => (30, 45),
    };

    let base_monitoring: u8 = match intensity {
        ExerciseIntensity::Low => 2,
        ExerciseIntensity::Moderate => 4,
        ExerciseIntensity::High => 6,
    };
    let monitoring_hours = if duration_minutes >= 60 {
        base_monitoring + 2
    } else {
        base_monitoring
    };

    tracing::debug!(
        "Exercise impact: {:?} for {} min → -{}% dose, {} h monitoring",
        intensity,
        duration_minutes,
        dose_reduction_percent,
        monitoring_hours
    );

    ExerciseImpact {
        dose_reduction_percent,
        carb_intake_grams,
        monitoring_hours,
    }
}

/// Cycle-phase insulin sensitivity guidance
///
/// Bands by day into the cycle: 1-5 menstrual, 6-13 follicular, 14-16
/// ovulation, 17 onward luteal. The last band is open-ended so every day
/// value maps somewhere, including long or irregular cycles.
pub fn menstrual_cycle_impact(days_into_cycle: u32) -> CycleImpact {
    let (phase, dose_adjustment_percent, note) = match days_into_cycle {
        0..=5 => (
            CyclePhase::Menstrual,
            -5,
            "Sensitivity often improves; watch for lows.",
        ),
        6..=13 => (
            CyclePhase::Follicular,
            0,
            "Baseline sensitivity; no adjustment expected.",
        ),
        14..=16 => (
            CyclePhase::Ovulation,
            5,
            "Brief resistance around ovulation; doses may run short.",
        ),
        _ => (
            CyclePhase::Luteal,
            15,
            "Progesterone-driven resistance; expect higher needs.",
        ),
    };

    tracing::debug!(
        "Cycle day {} → {:?}, {}% adjustment",
        days_into_cycle,
        phase,
        dose_adjustment_percent
    );

    CycleImpact {
        phase,
        dose_adjustment_percent,
        note: note.to_string(),
    }
}
