//! Timer-driven poller publishing one-second countdown readouts.
//!
//! While the timer is running, a spawned task ticks every second, asks the
//! engine to resync, and publishes the resulting [`TimerReadout`] on a
//! watch channel for display consumers. The tick carries no business
//! logic; every decision lives in the engine and the state machine.
//!
//! The task tears itself down once the timer leaves the Running phase, and
//! can be started again for the next record as long as the poller itself
//! has not been stopped.

use crate::{DoseEngine, Result, TimerPhase, TimerReadout};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Cadence of countdown publishes
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Publishes timer readouts while the timer runs
pub struct TimerPoller {
    engine: Arc<DoseEngine>,
    tx: watch::Sender<TimerReadout>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerPoller {
    pub fn new(engine: Arc<DoseEngine>) -> Self {
        let (tx, _rx) = watch::channel(TimerReadout::default());
        Self {
            engine,
            tx,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Subscribe to published readouts
    pub fn subscribe(&self) -> watch::Receiver<TimerReadout> {
        self.tx.subscribe()
    }

    /// Whether the tick task is currently alive
    pub fn is_active(&self) -> bool {
        self.handle
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Spawn the tick task
    ///
    /// Does nothing if a task is already alive or the poller was stopped.
    /// The task exits on its own when the timer leaves Running, so callers
    /// restart it when a new record begins.
    pub fn start(&self) {
        if self.cancel.is_cancelled() {
            tracing::warn!("Poller already stopped, not starting tick task");
            return;
        }

        let mut guard = match self.handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::debug!("Poller tick task already running");
            return;
        }

        let engine = Arc::clone(&self.engine);
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();

        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            // After a suspension the wall clock has already moved; one
            // fresh recompute beats a burst of catch-up ticks
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Skip the first immediate tick.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match engine.resync_timer(Utc::now()).await {
                            Ok(readout) => {
                                let running = readout.phase == TimerPhase::Running;
                                let _ = tx.send(readout);
                                if !running {
                                    tracing::info!("Timer no longer running, tick task ending");
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Timer resync failed (non-fatal): {}", e);
                            }
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("Poller tick task shutting down");
                        break;
                    }
                }
            }
        }));

        tracing::debug!("Poller tick task started");
    }

    /// Resync once, right now, and publish the result
    ///
    /// Lifecycle hook for returning to the foreground: the display gets a
    /// fresh readout immediately instead of waiting out the current tick.
    pub async fn notify_foreground(&self) -> Result<()> {
        let readout = self.engine.resync_timer(Utc::now()).await?;
        let _ = self.tx.send(readout);
        tracing::debug!("Foreground resync published");
        Ok(())
    }

    /// Stop the poller for good
    ///
    /// Idempotent, and safe to race with an in-flight tick; a tick that
    /// fires after cancellation publishes nothing new and the task exits.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the tick task to finish
    pub async fn join(&self) {
        let handle = {
            let mut guard = match self.handle.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AlertKind, AlertSeverity, AlertSink, DosingRecord, EngineOptions, InsulinKind,
        RecordSource, RecordStore,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::time::Duration;
    use uuid::Uuid;

    struct StaticSource(Option<DosingRecord>);

    #[async_trait]
    impl RecordSource for StaticSource {
        async fn fetch_latest(&self, _user_id: &str) -> crate::Result<Option<DosingRecord>> {
            Ok(self.0.clone())
        }
    }

    struct OkStore;

    #[async_trait]
    impl RecordStore for OkStore {
        async fn mark_injected(&self, _record_id: Uuid, _at: DateTime<Utc>) -> crate::Result<()> {
            Ok(())
        }
    }

    struct NoopAlerts;

    impl AlertSink for NoopAlerts {
        fn raise_alert(&self, _kind: AlertKind, _severity: AlertSeverity, _message: &str) {}
    }

    fn test_record(duration_minutes: u32) -> DosingRecord {
        DosingRecord {
            id: Uuid::new_v4(),
            current_glucose: 150.0,
            target_glucose: 100.0,
            carbohydrates: 60.0,
            insulin_ratio: 10.0,
            correction_factor: 50.0,
            carb_insulin: 6.0,
            correction_insulin: 1.0,
            total_insulin: 7.0,
            timer_duration_minutes: duration_minutes,
            insulin_injected: false,
            injected_at: None,
            created_at: Utc::now(),
        }
    }

    async fn engine_with_record(
        temp_dir: &tempfile::TempDir,
        record: Option<DosingRecord>,
    ) -> Arc<DoseEngine> {
        let options = EngineOptions {
            user_id: "alice".into(),
            snapshot_path: temp_dir.path().join("timer_state.json"),
            journal_path: temp_dir.path().join("doses.jsonl"),
            archive_path: temp_dir.path().join("doses.csv"),
            signal_path: temp_dir.path().join("exercise.json"),
            night_hypo_threshold: 70.0,
            insulin_kind: InsulinKind::Rapid,
        };
        let engine = Arc::new(
            DoseEngine::new(
                Arc::new(StaticSource(record)),
                Arc::new(OkStore),
                Arc::new(NoopAlerts),
                options,
            )
            .unwrap(),
        );
        engine.refresh(Utc::now()).await.unwrap();
        engine
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_publishes_readouts_every_tick() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine_with_record(&temp_dir, Some(test_record(180))).await;

        let poller = TimerPoller::new(engine);
        let mut rx = poller.subscribe();
        poller.start();

        rx.changed().await.unwrap();
        let readout = rx.borrow_and_update().clone();
        assert_eq!(readout.phase, TimerPhase::Running);
        assert_eq!(readout.total_seconds, 10_800);
        assert!(readout.record_id.is_some());

        // Next tick publishes again
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().phase, TimerPhase::Running);

        poller.stop();
        poller.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_tears_down_when_timer_not_running() {
        let temp_dir = tempfile::tempdir().unwrap();
        // Zero-length timer: Completed by the time the poller first ticks
        let engine = engine_with_record(&temp_dir, Some(test_record(0))).await;

        let poller = TimerPoller::new(engine);
        let mut rx = poller.subscribe();
        poller.start();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().phase, TimerPhase::Completed);

        poller.join().await;
        assert!(!poller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_the_task() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine_with_record(&temp_dir, Some(test_record(180))).await;

        let poller = TimerPoller::new(engine);
        poller.start();
        assert!(poller.is_active());

        poller.stop();
        poller.join().await;
        assert!(!poller.is_active());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine_with_record(&temp_dir, None).await;

        let poller = TimerPoller::new(engine);
        poller.stop();
        poller.stop();
        assert!(!poller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_after_stop_does_nothing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine_with_record(&temp_dir, Some(test_record(180))).await;

        let poller = TimerPoller::new(engine);
        poller.stop();
        poller.start();
        assert!(!poller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_keeps_one_task() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine_with_record(&temp_dir, Some(test_record(180))).await;

        let poller = TimerPoller::new(engine);
        poller.start();
        poller.start();
        assert!(poller.is_active());

        poller.stop();
        poller.join().await;
    }

    #[tokio::test]
    async fn test_notify_foreground_publishes_without_ticks() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine_with_record(&temp_dir, Some(test_record(180))).await;

        let poller = TimerPoller::new(engine);
        let mut rx = poller.subscribe();

        // No tick task at all; the lifecycle hook alone publishes
        poller.notify_foreground().await.unwrap();
        assert!(rx.has_changed().unwrap());
        let readout = rx.borrow_and_update().clone();
        assert_eq!(readout.phase, TimerPhase::Running);
        assert_eq!(readout.remaining_seconds, 10_800);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_tick_after_stop_is_harmless() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine_with_record(&temp_dir, Some(test_record(180))).await;

        let poller = TimerPoller::new(engine);
        poller.start();

        // Race stop against the tick loop; nothing should panic and the
        // task must still end
        tokio::time::sleep(Duration::from_millis(999)).await;
        poller.stop();
        poller.join().await;
        assert!(!poller.is_active());
    }
}
