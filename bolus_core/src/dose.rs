//! Bolus dose math and insulin-on-board accounting.
//!
//! This module implements the pure dosing calculations:
//! - Carb and correction insulin from therapy parameters
//! - Linear insulin-on-board (IOB) decay over each entry's duration
//! - Final bolus recommendation with safety warnings
//!
//! Everything here is side-effect free and takes `now` as a parameter, so
//! every rule is unit testable without a clock or a runtime.

use crate::{Error, InsulinEntry, InsulinKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hard ceiling for any computed dose field, in insulin units
pub const MAX_DOSE_UNITS: f64 = 9999.9;

/// Glucose below this is hypoglycemia; the recommendation says do not dose
pub const HYPO_GLUCOSE: f64 = 70.0;

/// Borderline glucose bound used by the low-carb warning
pub const BORDERLINE_GLUCOSE: f64 = 100.0;

/// Final recommendations above this are flagged as unusually high
pub const HIGH_DOSE_UNITS: f64 = 15.0;

/// Active IOB above this triggers the stacking warning
pub const IOB_STACKING_UNITS: f64 = 5.0;

/// Carb intake below this counts as a low-carb meal
pub const LOW_CARB_GRAMS: f64 = 20.0;

/// Round to one decimal place, half away from zero
pub fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Round to the nearest 0.5 unit (insulin pen increments)
///
/// Used only for the final recommendation; intermediate dose fields stay at
/// one-decimal precision.
pub fn round_to_half_unit(value: f64) -> f64 {
    (value * 2.0).round() / 2.0
}

/// The components of a computed bolus dose
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct DoseBreakdown {
    pub carb_insulin: f64,
    pub correction_insulin: f64,
    pub total_insulin: f64,
}

/// One journal entry's remaining contribution to IOB
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IobContribution {
    pub entry_id: Uuid,
    pub kind: InsulinKind,
    pub units: f64,
    pub remaining_units: f64,
    pub taken_at: DateTime<Utc>,
}

/// Insulin-on-board at a point in time
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IobReport {
    /// One-decimal rounding of the raw sum of contributions
    pub total_iob: f64,
    /// Sorted by remaining units descending; ties keep insertion order
    pub contributions: Vec<IobContribution>,
}

/// Safety warnings attached to a recommendation, most severe first.
///
/// At most one warning is ever surfaced; selection is first-match-wins in
/// the order the variants are declared.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoseWarning {
    /// Glucose below the hypoglycemia bound: treat the low, do not dose
    Hypoglycemia,
    /// Final recommendation exceeds the high-dose bound
    HighDose,
    /// Active IOB exceeds the stacking bound
    IobStacking,
    /// Borderline glucose combined with a low-carb meal
    LowGlucoseLowCarb,
}

impl DoseWarning {
    /// Display text for alert surfaces
    pub fn message(&self) -> &'static str {
        match self {
            DoseWarning::Hypoglycemia => {
                "Glucose is below 70 mg/dL. Treat the low first; do NOT dose insulin."
            }
            DoseWarning::HighDose => {
                "Recommended dose exceeds 15 units. Double-check inputs before injecting."
            }
            DoseWarning::IobStacking => {
                "More than 5 units already on board. Dosing now risks insulin stacking."
            }
            DoseWarning::LowGlucoseLowCarb => {
                "Glucose is under 100 mg/dL with a low-carb meal. Consider a reduced dose."
            }
        }
    }
}

/// Inputs for a full bolus recommendation
#[derive(Clone, Copy, Debug)]
pub struct RecommendationInput {
    pub current_glucose: f64,
    pub target_glucose: f64,
    pub carbohydrates: f64,
    pub insulin_ratio: f64,
    pub correction_factor: f64,
    pub active_iob: f64,
}

/// A bolus recommendation ready for display
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct BolusRecommendation {
    pub breakdown: DoseBreakdown,
    /// The IOB amount subtracted from the total before flooring at zero
    pub iob_adjustment: f64,
    /// Nearest-0.5-unit dose, never negative
    pub final_recommendation: f64,
    pub warning: Option<DoseWarning>,
}

/// Compute carb and correction insulin from therapy parameters
///
/// ## Dose rules
///
/// 1. `carb_insulin = carbohydrates / insulin_ratio`
/// 2. `correction_insulin = (current - target) / correction_factor`,
///    floored at zero: being under target never subtracts insulin here
/// 3. `total_insulin = carb_insulin + correction_insulin`
///
/// All three fields are rounded to one decimal and clamped to
/// [`MAX_DOSE_UNITS`]. Inputs are validated up front; no NaN or infinity
/// ever comes out of this function.
pub fn bolus_dose(
    current_glucose: f64,
    target_glucose: f64,
    carbohydrates: f64,
    insulin_ratio: f64,
    correction_factor: f64,
) -> Result<DoseBreakdown> {
    validate_finite("current_glucose", current_glucose)?;
    validate_finite("target_glucose", target_glucose)?;
    validate_finite("carbohydrates", carbohydrates)?;
    validate_finite("insulin_ratio", insulin_ratio)?;
    validate_finite("correction_factor", correction_factor)?;

    if current_glucose <= 0.0 {
        return Err(Error::InvalidInput(format!(
            "current_glucose must be positive, got {}",
            current_glucose
        )));
    }
    if target_glucose <= 0.0 {
        return Err(Error::InvalidInput(format!(
            "target_glucose must be positive, got {}",
            target_glucose
        )));
    }
    if carbohydrates < 0.0 {
        return Err(Error::InvalidInput(format!(
            "carbohydrates must not be negative, got {}",
            carbohydrates
        )));
    }
    if insulin_ratio <= 0.0 {
        return Err(Error::InvalidInput(format!(
            "insulin_ratio must be positive, got {}",
            insulin_ratio
        )));
    }
    if correction_factor <= 0.0 {
        return Err(Error::InvalidInput(format!(
            "correction_factor must be positive, got {}",
            correction_factor
        )));
    }

    let carb_insulin = clamp_units(round_to_tenth(carbohydrates / insulin_ratio));
    let correction_raw = (current_glucose - target_glucose) / correction_factor;
    let correction_insulin = clamp_units(round_to_tenth(correction_raw.max(0.0)));
    let total_insulin = clamp_units(round_to_tenth(carb_insulin + correction_insulin));

    tracing::debug!(
        "Dose breakdown: carb={} correction={} total={}",
        carb_insulin,
        correction_insulin,
        total_insulin
    );

    Ok(DoseBreakdown {
        carb_insulin,
        correction_insulin,
        total_insulin,
    })
}

/// Compute insulin-on-board from journal entries using linear decay
///
/// An entry with duration D hours contributes `units * (D - elapsed) / D`
/// while `elapsed < D`. Expired entries are excluded entirely rather than
/// listed at zero. Entries dated in the future (clock skew between devices)
/// count at full strength: the fraction is clamped to [0, 1].
pub fn insulin_on_board(entries: &[InsulinEntry], now: DateTime<Utc>) -> IobReport {
    let mut contributions: Vec<IobContribution> = Vec::new();
    let mut raw_total = 0.0;

    for entry in entries {
        let duration_hours = entry.kind.duration_hours();
        let elapsed_hours = (now - entry.taken_at).num_seconds() as f64 / 3600.0;

        if elapsed_hours >= duration_hours {
            continue;
        }

        let fraction = ((duration_hours - elapsed_hours) / duration_hours).clamp(0.0, 1.0);
        let remaining_units = entry.units * fraction;

        // Non-finite units would poison the sum; drop them with the zeros
        if !remaining_units.is_finite() || remaining_units <= 0.0 {
            continue;
        }

        raw_total += remaining_units;
        contributions.push(IobContribution {
            entry_id: entry.id,
            kind: entry.kind,
            units: entry.units,
            remaining_units,
            taken_at: entry.taken_at,
        });
    }

    // Stable sort, so ties keep journal insertion order
    contributions.sort_by(|a, b| {
        b.remaining_units
            .partial_cmp(&a.remaining_units)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    IobReport {
        total_iob: round_to_tenth(raw_total),
        contributions,
    }
}

/// Compute the final bolus recommendation with safety warnings
///
/// `final = max(0, total - active_iob)` rounded to the nearest 0.5 unit.
/// Exactly one warning (the first match below) is attached:
///
/// 1. Glucose below [`HYPO_GLUCOSE`] → [`DoseWarning::Hypoglycemia`]
/// 2. Final above [`HIGH_DOSE_UNITS`] → [`DoseWarning::HighDose`]
/// 3. IOB above [`IOB_STACKING_UNITS`] → [`DoseWarning::IobStacking`]
/// 4. Glucose under [`BORDERLINE_GLUCOSE`] and carbs under
///    [`LOW_CARB_GRAMS`] → [`DoseWarning::LowGlucoseLowCarb`]
pub fn bolus_recommendation(input: &RecommendationInput) -> Result<BolusRecommendation> {
    validate_finite("active_iob", input.active_iob)?;
    if input.active_iob < 0.0 {
        return Err(Error::InvalidInput(format!(
            "active_iob must not be negative, got {}",
            input.active_iob
        )));
    }

    let breakdown = bolus_dose(
        input.current_glucose,
        input.target_glucose,
        input.carbohydrates,
        input.insulin_ratio,
        input.correction_factor,
    )?;

    let final_recommendation =
        round_to_half_unit((breakdown.total_insulin - input.active_iob).max(0.0));

    let warning = if input.current_glucose < HYPO_GLUCOSE {
        Some(DoseWarning::Hypoglycemia)
    } else if final_recommendation > HIGH_DOSE_UNITS {
        Some(DoseWarning::HighDose)
    } else if input.active_iob > IOB_STACKING_UNITS {
        Some(DoseWarning::IobStacking)
    } else if input.current_glucose < BORDERLINE_GLUCOSE && input.carbohydrates < LOW_CARB_GRAMS {
        Some(DoseWarning::LowGlucoseLowCarb)
    } else {
        None
    };

    if let Some(w) = warning {
        tracing::warn!("Dose warning: {:?} ({})", w, w.message());
    }
    tracing::info!(
        "Bolus recommendation: total={} iob={} final={}",
        breakdown.total_insulin,
        input.active_iob,
        final_recommendation
    );

    Ok(BolusRecommendation {
        breakdown,
        iob_adjustment: input.active_iob,
        final_recommendation,
        warning,
    })
}

fn validate_finite(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(Error::InvalidInput(format!(
            "{} must be a finite number, got {}",
            name, value
        )));
    }
    Ok(())
}

fn clamp_units(value: f64) -> f64 {
    value.min(MAX_DOSE_UNITS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry_taken(units: f64, kind: InsulinKind, hours_ago: i64) -> InsulinEntry {
        InsulinEntry::new(units, kind, Utc::now() - Duration::hours(hours_ago))
    }

    fn base_input() -> RecommendationInput {
        RecommendationInput {
            current_glucose: 150.0,
            target_glucose: 100.0,
            carbohydrates: 60.0,
            insulin_ratio: 10.0,
            correction_factor: 50.0,
            active_iob: 0.0,
        }
    }

    #[test]
    fn test_carb_dose_simple() {
        let b = bolus_dose(100.0, 100.0, 60.0, 10.0, 50.0).unwrap();
        assert_eq!(b.carb_insulin, 6.0);
        assert_eq!(b.correction_insulin, 0.0);
        assert_eq!(b.total_insulin, 6.0);
    }

    #[test]
    fn test_carb_dose_rounds_half_away_from_zero() {
        // 50 / 12 = 4.1666... → 4.2
        let b = bolus_dose(100.0, 100.0, 50.0, 12.0, 50.0).unwrap();
        assert_eq!(b.carb_insulin, 4.2);

        // 10 / 8 = 1.25, the exact half case → 1.3, not banker's 1.2
        let b = bolus_dose(100.0, 100.0, 10.0, 8.0, 50.0).unwrap();
        assert_eq!(b.carb_insulin, 1.3);
    }

    #[test]
    fn test_correction_dose() {
        // (180 - 100) / 50 = 1.6
        let b = bolus_dose(180.0, 100.0, 0.0, 10.0, 50.0).unwrap();
        assert_eq!(b.correction_insulin, 1.6);
        assert_eq!(b.total_insulin, 1.6);
    }

    #[test]
    fn test_correction_never_negative_below_target() {
        let b = bolus_dose(80.0, 100.0, 30.0, 10.0, 50.0).unwrap();
        assert_eq!(b.correction_insulin, 0.0);
        assert_eq!(b.total_insulin, 3.0);
    }

    #[test]
    fn test_correction_zero_at_target() {
        let b = bolus_dose(100.0, 100.0, 0.0, 10.0, 50.0).unwrap();
        assert_eq!(b.correction_insulin, 0.0);
    }

    #[test]
    fn test_total_consistency_law() {
        // Total always equals the rounded sum of the rounded components
        let cases = [
            (147.0, 95.0, 37.0, 9.0, 42.0),
            (201.0, 110.0, 85.5, 11.0, 38.0),
            (99.0, 100.0, 12.0, 15.0, 50.0),
        ];
        for (g, t, c, r, f) in cases {
            let b = bolus_dose(g, t, c, r, f).unwrap();
            assert_eq!(
                b.total_insulin,
                round_to_tenth(b.carb_insulin + b.correction_insulin)
            );
        }
    }

    #[test]
    fn test_dose_ceiling() {
        let b = bolus_dose(150.0, 100.0, 1_000_000.0, 0.1, 50.0).unwrap();
        assert_eq!(b.carb_insulin, MAX_DOSE_UNITS);
        assert_eq!(b.total_insulin, MAX_DOSE_UNITS);
    }

    #[test]
    fn test_carb_dose_non_decreasing_in_carbs() {
        // More carbs never means less carb insulin
        let mut prev = 0.0;
        for carbs in (0..=300).step_by(5) {
            let b = bolus_dose(100.0, 100.0, carbs as f64, 10.0, 50.0).unwrap();
            assert!(
                b.carb_insulin >= prev,
                "carb insulin dropped from {} to {} at {} g",
                prev,
                b.carb_insulin,
                carbs
            );
            prev = b.carb_insulin;
        }
    }

    #[test]
    fn test_rejects_bad_inputs() {
        assert!(bolus_dose(150.0, 100.0, 60.0, 0.0, 50.0).is_err());
        assert!(bolus_dose(150.0, 100.0, 60.0, -10.0, 50.0).is_err());
        assert!(bolus_dose(150.0, 100.0, 60.0, 10.0, 0.0).is_err());
        assert!(bolus_dose(0.0, 100.0, 60.0, 10.0, 50.0).is_err());
        assert!(bolus_dose(150.0, 0.0, 60.0, 10.0, 50.0).is_err());
        assert!(bolus_dose(150.0, 100.0, -5.0, 10.0, 50.0).is_err());
        assert!(bolus_dose(f64::NAN, 100.0, 60.0, 10.0, 50.0).is_err());
        assert!(bolus_dose(150.0, 100.0, f64::INFINITY, 10.0, 50.0).is_err());
    }

    #[test]
    fn test_round_helpers_are_distinct() {
        assert_eq!(round_to_tenth(1.25), 1.3);
        assert_eq!(round_to_tenth(-1.25), -1.3);
        assert_eq!(round_to_tenth(2.04), 2.0);
        assert_eq!(round_to_half_unit(1.2), 1.0);
        assert_eq!(round_to_half_unit(1.3), 1.5);
        assert_eq!(round_to_half_unit(1.75), 2.0);
    }

    #[test]
    fn test_iob_linear_decay_halfway() {
        // 10 units of rapid (4h) taken 2h ago → 5.0 remaining
        let entries = vec![entry_taken(10.0, InsulinKind::Rapid, 2)];
        let report = insulin_on_board(&entries, Utc::now());
        assert_eq!(report.total_iob, 5.0);
        assert_eq!(report.contributions.len(), 1);
    }

    #[test]
    fn test_iob_full_at_zero_elapsed() {
        let now = Utc::now();
        let entries = vec![InsulinEntry::new(8.0, InsulinKind::Rapid, now)];
        let report = insulin_on_board(&entries, now);
        assert_eq!(report.total_iob, 8.0);
    }

    #[test]
    fn test_iob_excludes_expired_entries() {
        let entries = vec![
            entry_taken(10.0, InsulinKind::Rapid, 5),
            entry_taken(4.0, InsulinKind::Rapid, 1),
        ];
        let report = insulin_on_board(&entries, Utc::now());
        assert_eq!(report.contributions.len(), 1);
        assert_eq!(report.total_iob, 3.0);
    }

    #[test]
    fn test_iob_future_dated_entry_counts_full() {
        // Clock skew: entry from "the future" contributes full units
        let entries = vec![InsulinEntry::new(
            6.0,
            InsulinKind::Rapid,
            Utc::now() + Duration::minutes(10),
        )];
        let report = insulin_on_board(&entries, Utc::now());
        assert_eq!(report.total_iob, 6.0);
    }

    #[test]
    fn test_iob_total_rounds_raw_sum() {
        // Two entries at 1/3 decay each: raw sum rounds once, at the end
        let now = Utc::now();
        let entries = vec![
            InsulinEntry::new(1.0, InsulinKind::Rapid, now - Duration::hours(3)),
            InsulinEntry::new(1.0, InsulinKind::Rapid, now - Duration::hours(3)),
        ];
        let report = insulin_on_board(&entries, now);
        // 0.25 + 0.25 = 0.5 exactly
        assert_eq!(report.total_iob, 0.5);
    }

    #[test]
    fn test_iob_contributions_sorted_descending() {
        let entries = vec![
            entry_taken(2.0, InsulinKind::Rapid, 1),
            entry_taken(10.0, InsulinKind::Rapid, 1),
            entry_taken(6.0, InsulinKind::Rapid, 1),
        ];
        let report = insulin_on_board(&entries, Utc::now());
        let remaining: Vec<f64> = report
            .contributions
            .iter()
            .map(|c| c.remaining_units)
            .collect();
        assert!(remaining[0] > remaining[1]);
        assert!(remaining[1] > remaining[2]);
    }

    #[test]
    fn test_iob_ties_keep_insertion_order() {
        let now = Utc::now();
        let first = InsulinEntry::new(5.0, InsulinKind::Rapid, now - Duration::hours(1));
        let second = InsulinEntry::new(5.0, InsulinKind::Rapid, now - Duration::hours(1));
        let entries = vec![first.clone(), second.clone()];
        let report = insulin_on_board(&entries, now);
        assert_eq!(report.contributions[0].entry_id, first.id);
        assert_eq!(report.contributions[1].entry_id, second.id);
    }

    #[test]
    fn test_iob_empty_journal() {
        let report = insulin_on_board(&[], Utc::now());
        assert_eq!(report.total_iob, 0.0);
        assert!(report.contributions.is_empty());
    }

    #[test]
    fn test_recommendation_subtracts_iob() {
        let mut input = base_input();
        input.active_iob = 2.0;
        // total = 6.0 + 1.0 = 7.0; 7.0 - 2.0 = 5.0
        let rec = bolus_recommendation(&input).unwrap();
        assert_eq!(rec.breakdown.total_insulin, 7.0);
        assert_eq!(rec.iob_adjustment, 2.0);
        assert_eq!(rec.final_recommendation, 5.0);
        assert_eq!(rec.warning, None);
    }

    #[test]
    fn test_recommendation_floors_at_zero() {
        let mut input = base_input();
        input.active_iob = 20.0;
        let rec = bolus_recommendation(&input).unwrap();
        assert_eq!(rec.final_recommendation, 0.0);
    }

    #[test]
    fn test_recommendation_rounds_to_half_unit() {
        let mut input = base_input();
        input.active_iob = 0.3;
        // 7.0 - 0.3 = 6.7 → 6.5
        let rec = bolus_recommendation(&input).unwrap();
        assert_eq!(rec.final_recommendation, 6.5);
    }

    #[test]
    fn test_hypoglycemia_warning_wins_over_stacking() {
        let mut input = base_input();
        input.current_glucose = 60.0;
        input.active_iob = 6.0;
        let rec = bolus_recommendation(&input).unwrap();
        assert_eq!(rec.warning, Some(DoseWarning::Hypoglycemia));
    }

    #[test]
    fn test_high_dose_warning() {
        let mut input = base_input();
        input.carbohydrates = 200.0;
        // 20.0 carb units, no iob → final 21.0 > 15
        let rec = bolus_recommendation(&input).unwrap();
        assert_eq!(rec.warning, Some(DoseWarning::HighDose));
    }

    #[test]
    fn test_stacking_warning() {
        let mut input = base_input();
        input.active_iob = 5.5;
        let rec = bolus_recommendation(&input).unwrap();
        assert_eq!(rec.warning, Some(DoseWarning::IobStacking));
    }

    #[test]
    fn test_low_glucose_low_carb_warning() {
        let mut input = base_input();
        input.current_glucose = 90.0;
        input.carbohydrates = 15.0;
        let rec = bolus_recommendation(&input).unwrap();
        assert_eq!(rec.warning, Some(DoseWarning::LowGlucoseLowCarb));
    }

    #[test]
    fn test_no_warning_in_normal_range() {
        let rec = bolus_recommendation(&base_input()).unwrap();
        assert_eq!(rec.warning, None);
    }

    #[test]
    fn test_recommendation_rejects_negative_iob() {
        let mut input = base_input();
        input.active_iob = -1.0;
        assert!(bolus_recommendation(&input).is_err());
    }
}
