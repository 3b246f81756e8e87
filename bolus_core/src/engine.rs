//! Dose engine: reconciles the authoritative record with local timer state.
//!
//! This module implements the record lifecycle:
//! - Fetch the latest record and reconcile the timer against it
//! - Confirm injections optimistically, syncing back in the background
//! - Assess bedtime risk and raise each alert at most once
//!
//! The source is authoritative for *which* record is active; the local
//! timer is authoritative for *where the wall clock stands*. A fetch that
//! fails changes nothing locally.

use crate::journal::DoseSink;
use crate::{
    dose, journal, risk, signal, AlertKind, AlertSeverity, AlertSink, DosingRecord, Error,
    InsulinEntry, InsulinKind, NightHypoAssessment, RecordSource, RecordStore, Result,
    TimerPhase, TimerStateMachine,
};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// How many times a failed injection sync is retried in the background
pub const SYNC_RETRY_ATTEMPTS: u32 = 5;

/// Delay between background sync retries, in seconds
pub const SYNC_RETRY_DELAY_SECS: u64 = 30;

/// A display-ready view of the timer, published on every poller tick
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct TimerReadout {
    pub phase: TimerPhase,
    pub record_id: Option<Uuid>,
    pub total_seconds: u32,
    pub remaining_seconds: u32,
    pub percent_elapsed: f64,
}

/// Combined view after a refresh: the record and where the timer stands
#[derive(Clone, Debug)]
pub struct EngineStatus {
    pub record: Option<DosingRecord>,
    pub readout: TimerReadout,
}

/// Outcome of confirming an injection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InjectionOutcome {
    /// Local state updated and the source acknowledged the write
    Synced,
    /// Local state updated; the source write failed and is retrying in
    /// the background
    SyncPending,
    /// The record was already injected; nothing to do
    AlreadyInjected,
}

/// Paths and parameters the engine needs besides its collaborators
#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub user_id: String,
    pub snapshot_path: PathBuf,
    pub journal_path: PathBuf,
    pub archive_path: PathBuf,
    pub signal_path: PathBuf,
    pub night_hypo_threshold: f64,
    pub insulin_kind: InsulinKind,
}

/// Dedupe key for raised alerts: per record when one is active, else per
/// calendar date of the reading
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum AlertMarker {
    NightForRecord(Uuid),
    NightForDate(NaiveDate),
}

struct EngineState {
    timer: TimerStateMachine,
    record: Option<DosingRecord>,
    raised: HashSet<AlertMarker>,
}

/// The dosing engine
///
/// All shared state sits behind one async mutex so a reader never
/// observes a half-updated anchor/duration pair.
pub struct DoseEngine {
    source: Arc<dyn RecordSource>,
    store: Arc<dyn RecordStore>,
    alerts: Arc<dyn AlertSink>,
    options: EngineOptions,
    state: Mutex<EngineState>,
}

impl DoseEngine {
    /// Create an engine, restoring the timer from its snapshot
    pub fn new(
        source: Arc<dyn RecordSource>,
        store: Arc<dyn RecordStore>,
        alerts: Arc<dyn AlertSink>,
        options: EngineOptions,
    ) -> Result<Self> {
        let timer = TimerStateMachine::load(&options.snapshot_path)?;
        if timer.is_running() {
            tracing::info!(
                "Restored running timer for record {:?} from snapshot",
                timer.active_record_id
            );
        }
        Ok(Self {
            source,
            store,
            alerts,
            options,
            state: Mutex::new(EngineState {
                timer,
                record: None,
                raised: HashSet::new(),
            }),
        })
    }

    /// Fetch the latest record and reconcile the timer against it
    ///
    /// ## Reconcile rules
    ///
    /// 1. Fetch failed → local state untouched, error surfaced
    /// 2. No record on the source while one is tracked locally → the timer
    ///    is orphaned, reset it
    /// 3. Record already injected → timer Completed
    /// 4. Different record, or same record with a changed duration →
    ///    fresh start from `now`
    /// 5. Same record, same duration, timer not idle → left alone; only a
    ///    resync runs
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<EngineStatus> {
        let fetched = self.source.fetch_latest(&self.options.user_id).await;

        let mut state = self.state.lock().await;
        let record = match fetched {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Record fetch failed, keeping local state: {}", e);
                return Err(e);
            }
        };

        let mut dirty = false;
        match record {
            None => {
                if state.timer.active_record_id.is_some() || state.record.is_some() {
                    tracing::warn!(
                        "Source has no record but timer tracks {:?}; resetting orphaned timer",
                        state.timer.active_record_id
                    );
                    state.timer.reset();
                    state.record = None;
                    dirty = true;
                }
            }
            Some(record) => {
                dirty = self.reconcile(&mut state, record, now);
            }
        }

        if self.apply_resync(&mut state, now) {
            dirty = true;
        }
        if dirty {
            state.timer.save(&self.options.snapshot_path)?;
        }

        Ok(EngineStatus {
            record: state.record.clone(),
            readout: build_readout(&state.timer, now),
        })
    }

    /// Apply one fetched record to the timer; returns whether state changed
    fn reconcile(&self, state: &mut EngineState, record: DosingRecord, now: DateTime<Utc>) -> bool {
        let mut dirty = false;
        let tracking = state.timer.active_record_id == Some(record.id);

        if record.insulin_injected {
            if !tracking {
                state.timer.start(record.id, record.timer_duration_seconds(), now);
                dirty = true;
            }
            if state.timer.phase != TimerPhase::Completed {
                state.timer.complete();
                dirty = true;
            }
        } else {
            let same_duration = state.timer.total_seconds == record.timer_duration_seconds();
            let keep = tracking && same_duration && state.timer.phase != TimerPhase::Idle;
            if !keep {
                if tracking && !same_duration {
                    tracing::info!(
                        "Record {} duration changed to {} s, restarting timer",
                        record.id,
                        record.timer_duration_seconds()
                    );
                }
                state.timer.start(record.id, record.timer_duration_seconds(), now);
                dirty = true;
            }
        }

        state.record = Some(record);
        dirty
    }

    /// Run the timer's resync and raise the expiry alert on transition
    fn apply_resync(&self, state: &mut EngineState, now: DateTime<Utc>) -> bool {
        if state.timer.resync(now) == Some(TimerPhase::Completed) {
            let message = match state.timer.active_record_id {
                Some(id) => format!("Injection timer for record {} has elapsed", id),
                None => "Injection timer has elapsed".to_string(),
            };
            self.alerts
                .raise_alert(AlertKind::TimerExpired, AlertSeverity::Notice, &message);
            return true;
        }
        false
    }

    /// Recompute the timer and publish any due transition
    ///
    /// The poller calls this every tick; it is also the foreground resync
    /// path. Cheap when nothing changed.
    pub async fn resync_timer(&self, now: DateTime<Utc>) -> Result<TimerReadout> {
        let mut state = self.state.lock().await;
        if self.apply_resync(&mut state, now) {
            state.timer.save(&self.options.snapshot_path)?;
        }
        Ok(build_readout(&state.timer, now))
    }

    /// Current timer view without applying transitions
    pub async fn readout(&self, now: DateTime<Utc>) -> TimerReadout {
        let state = self.state.lock().await;
        build_readout(&state.timer, now)
    }

    /// The record the engine currently tracks, if any
    pub async fn active_record(&self) -> Option<DosingRecord> {
        self.state.lock().await.record.clone()
    }

    /// Confirm that the active record's dose was injected
    ///
    /// Local state is updated first: the record is marked injected, the
    /// timer completes, and the dose lands in the journal. Only then is the
    /// source told. If that write fails, local state stays Completed; a
    /// notice is raised and the write retries in the background with
    /// bounded attempts.
    pub async fn confirm_injection(&self, now: DateTime<Utc>) -> Result<InjectionOutcome> {
        let record_id;
        let units;
        {
            let mut state = self.state.lock().await;
            let record = state.record.as_mut().ok_or_else(|| {
                Error::InvalidInput("no active dosing record to confirm".into())
            })?;

            if record.insulin_injected {
                tracing::info!("Record {} already injected, nothing to confirm", record.id);
                return Ok(InjectionOutcome::AlreadyInjected);
            }

            record.mark_injected(now);
            record_id = record.id;
            units = record.total_insulin;

            state.timer.complete();
            state.timer.save(&self.options.snapshot_path)?;

            let entry = InsulinEntry::new(units, self.options.insulin_kind, now);
            let mut sink = journal::JsonlSink::new(&self.options.journal_path);
            sink.append(&entry)?;
        }

        tracing::info!(
            "Injection of {} units confirmed locally for record {}",
            units,
            record_id
        );

        match self.store.mark_injected(record_id, now).await {
            Ok(()) => Ok(InjectionOutcome::Synced),
            Err(e) => {
                tracing::warn!("Injection sync for record {} failed: {}", record_id, e);
                self.alerts.raise_alert(
                    AlertKind::SyncFailed,
                    AlertSeverity::Notice,
                    &format!(
                        "Injection recorded locally; sync to source failed ({}). Retrying in background.",
                        e
                    ),
                );
                self.spawn_sync_retry(record_id, now);
                Ok(InjectionOutcome::SyncPending)
            }
        }
    }

    /// Retry the injection acknowledgement in the background
    fn spawn_sync_retry(&self, record_id: Uuid, at: DateTime<Utc>) {
        let store = Arc::clone(&self.store);
        let alerts = Arc::clone(&self.alerts);
        tokio::spawn(async move {
            for attempt in 1..=SYNC_RETRY_ATTEMPTS {
                tokio::time::sleep(std::time::Duration::from_secs(SYNC_RETRY_DELAY_SECS)).await;
                match store.mark_injected(record_id, at).await {
                    Ok(()) => {
                        tracing::info!(
                            "Injection sync for record {} succeeded on retry {}",
                            record_id,
                            attempt
                        );
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Injection sync retry {}/{} for record {} failed: {}",
                            attempt,
                            SYNC_RETRY_ATTEMPTS,
                            record_id,
                            e
                        );
                    }
                }
            }
            alerts.raise_alert(
                AlertKind::SyncFailed,
                AlertSeverity::Warning,
                &format!(
                    "Injection of record {} could not be synced after {} attempts",
                    record_id, SYNC_RETRY_ATTEMPTS
                ),
            );
        });
    }

    /// Assess overnight hypo risk and alert at most once per key
    ///
    /// IOB comes from the journal, recent exercise from the signal file.
    /// The dedupe key is the active record id when one exists, otherwise
    /// the calendar date of the reading; markers live for the engine's
    /// lifetime.
    pub async fn assess_night_risk(
        &self,
        bedtime_glucose: f64,
        now: DateTime<Utc>,
    ) -> Result<NightHypoAssessment> {
        let entries = journal::load_active_entries(
            &self.options.journal_path,
            &self.options.archive_path,
            now,
        )?;
        let iob = dose::insulin_on_board(&entries, now).total_iob;

        let exercise = signal::load_exercise_signal(&self.options.signal_path)?;
        let recent_exercise = signal::is_recent(exercise.as_ref(), now);

        let assessment = risk::night_hypo_risk(
            bedtime_glucose,
            iob,
            recent_exercise,
            self.options.night_hypo_threshold,
        );

        if assessment.should_alert {
            let mut state = self.state.lock().await;
            let marker = match &state.record {
                Some(record) => AlertMarker::NightForRecord(record.id),
                None => AlertMarker::NightForDate(now.date_naive()),
            };
            if state.raised.insert(marker) {
                self.alerts.raise_alert(
                    AlertKind::NightHypoRisk,
                    AlertSeverity::Critical,
                    &format!("High overnight hypo risk: {}", assessment.reason),
                );
            } else {
                tracing::debug!("Night hypo alert already raised for {:?}, skipping", marker);
            }
        }

        Ok(assessment)
    }
}

fn build_readout(timer: &TimerStateMachine, now: DateTime<Utc>) -> TimerReadout {
    TimerReadout {
        phase: timer.phase,
        record_id: timer.active_record_id,
        total_seconds: timer.total_seconds,
        remaining_seconds: timer.remaining_seconds(now),
        percent_elapsed: timer.percent_elapsed(now),
    }
}
