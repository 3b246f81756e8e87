//! Injection-site timer state machine anchored to the wall clock.
//!
//! The machine never counts down. It stores the instant it started and the
//! total duration, and every read recomputes remaining time from those two
//! facts. A process that sleeps for an hour wakes up with the timer already
//! where it should be; there is no drift to correct.
//!
//! All methods take `now` as a parameter so transitions are unit testable
//! without a clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Phase of the injection timer
///
/// Modelled as a single enum so the phases are mutually exclusive by
/// construction; there is no flag combination that means two things.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimerPhase {
    #[default]
    Idle,
    Running,
    Completed,
}

/// Wall-clock-anchored countdown for the active dosing record.
///
/// At most one record drives the timer at any time; starting for a new
/// record unconditionally replaces whatever was running. The whole machine
/// serializes to the snapshot file, so the anchor (not a countdown value)
/// is what survives restarts.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TimerStateMachine {
    pub phase: TimerPhase,
    pub active_record_id: Option<Uuid>,
    pub total_seconds: u32,
    pub started_at: Option<DateTime<Utc>>,
}

impl TimerStateMachine {
    /// Start (or restart) the timer for a record
    ///
    /// Always replaces the current state and resets the anchor to `now`,
    /// regardless of phase. Callers decide whether an already-running timer
    /// should be kept; this method never second-guesses them.
    pub fn start(&mut self, record_id: Uuid, total_seconds: u32, now: DateTime<Utc>) {
        self.phase = TimerPhase::Running;
        self.active_record_id = Some(record_id);
        self.total_seconds = total_seconds;
        self.started_at = Some(now);
        tracing::info!(
            "Timer started for record {} ({} s)",
            record_id,
            total_seconds
        );
    }

    /// Cancel the timer without completing it
    ///
    /// Keeps the record id and duration around for display history; only
    /// the phase changes. Remaining time reads as zero while Idle.
    pub fn stop(&mut self) {
        if self.phase != TimerPhase::Idle {
            tracing::info!("Timer stopped for record {:?}", self.active_record_id);
        }
        self.phase = TimerPhase::Idle;
    }

    /// Mark the timer finished
    pub fn complete(&mut self) {
        self.phase = TimerPhase::Completed;
        tracing::info!("Timer completed for record {:?}", self.active_record_id);
    }

    /// Clear everything back to the initial state
    pub fn reset(&mut self) {
        if self.active_record_id.is_some() {
            tracing::info!(
                "Timer reset, dropping record {:?}",
                self.active_record_id
            );
        }
        *self = TimerStateMachine::default();
    }

    /// Seconds left on the timer, recomputed from the anchor
    ///
    /// Always `clamp(total - elapsed, 0, total)` while Running. A clock that
    /// moved backwards yields a negative elapsed, which clamps so remaining
    /// never exceeds the total. Idle and Completed read as zero.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> u32 {
        if self.phase != TimerPhase::Running {
            return 0;
        }
        let started = match self.started_at {
            Some(s) => s,
            // Running without an anchor is a corrupt snapshot; read as
            // finished rather than running forever
            None => return 0,
        };
        let elapsed = (now - started).num_seconds().max(0);
        let total = i64::from(self.total_seconds);
        (total - elapsed).clamp(0, total) as u32
    }

    /// Recompute and apply any due transition
    ///
    /// Running with nothing remaining becomes Completed. Safe to call on
    /// any cadence and in any phase; everything except that one transition
    /// is a no-op. Returns the new phase when a transition fired.
    pub fn resync(&mut self, now: DateTime<Utc>) -> Option<TimerPhase> {
        if self.phase != TimerPhase::Running {
            return None;
        }
        if self.remaining_seconds(now) == 0 {
            self.phase = TimerPhase::Completed;
            tracing::info!(
                "Timer for record {:?} completed on resync",
                self.active_record_id
            );
            return Some(TimerPhase::Completed);
        }
        None
    }

    /// Progress through the timer as a percentage
    pub fn percent_elapsed(&self, now: DateTime<Utc>) -> f64 {
        match self.phase {
            TimerPhase::Idle => 0.0,
            TimerPhase::Completed => 100.0,
            TimerPhase::Running => {
                if self.total_seconds == 0 {
                    return 100.0;
                }
                let done = self.total_seconds - self.remaining_seconds(now);
                f64::from(done) / f64::from(self.total_seconds) * 100.0
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase == TimerPhase::Running
    }
}
