#![forbid(unsafe_code)]

//! Core domain model and business logic for the Bolus dosing assistant.
//!
//! This crate provides:
//! - Domain types (dosing records, insulin entries, exercise signals)
//! - Dose math (bolus calculation, insulin-on-board, recommendations)
//! - Risk assessment (night hypoglycemia, exercise, cycle phase)
//! - Timer state machine, persistence, and the tick poller
//! - The engine that reconciles remote records with local timer state

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod dose;
pub mod risk;
pub mod timer;
pub mod snapshot;
pub mod journal;
pub mod archive;
pub mod signal;
pub mod source;
pub mod engine;
pub mod poller;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use dose::{
    bolus_dose, bolus_recommendation, insulin_on_board, BolusRecommendation, DoseBreakdown,
    DoseWarning, IobReport, RecommendationInput,
};
pub use risk::{
    exercise_impact, menstrual_cycle_impact, night_hypo_risk, CycleImpact, CyclePhase,
    ExerciseImpact, NightHypoAssessment, RiskLevel,
};
pub use timer::{TimerPhase, TimerStateMachine};
pub use journal::{load_active_entries, DoseSink, JsonlSink};
pub use signal::{load_exercise_signal, save_exercise_signal};
pub use source::{
    record_path, AlertKind, AlertSeverity, AlertSink, FileRecordBackend, LogAlertSink,
    RecordSource, RecordStore,
};
pub use engine::{
    DoseEngine, EngineOptions, EngineStatus, InjectionOutcome, TimerReadout,
};
pub use poller::TimerPoller;
