use bolus_core::*;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "bolus")]
#[command(about = "Insulin dosing and injection timer assistant", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// User identifier for record sync
    #[arg(long, global = true, default_value = "local")]
    user: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Calculate a bolus recommendation
    Dose {
        /// Current blood glucose (mg/dL)
        #[arg(long)]
        glucose: f64,

        /// Carbohydrates about to be eaten (grams)
        #[arg(long)]
        carbs: f64,

        /// Target blood glucose (mg/dL); config default when omitted
        #[arg(long)]
        target: Option<f64>,

        /// Insulin-to-carb ratio (grams per unit); config default when omitted
        #[arg(long)]
        ratio: Option<f64>,

        /// Correction factor (mg/dL per unit); config default when omitted
        #[arg(long)]
        factor: Option<f64>,

        /// Insulin on board override (units); computed from the journal when omitted
        #[arg(long)]
        iob: Option<f64>,

        /// Journal the recommended dose as taken now
        #[arg(long)]
        taken: bool,
    },

    /// Show insulin currently on board
    Iob,

    /// Show the active dosing record and timer state (default)
    Status,

    /// Watch the injection timer with a live countdown
    Watch {
        /// Exit after this many readouts (for testing)
        #[arg(long)]
        ticks: Option<u64>,
    },

    /// Confirm the active record's dose was injected
    Inject,

    /// Assess overnight hypoglycemia risk at bedtime
    Night {
        /// Bedtime blood glucose (mg/dL)
        #[arg(long)]
        glucose: f64,
    },

    /// Show dose guidance around an exercise session
    Exercise {
        /// Session intensity (low, moderate, high)
        #[arg(long)]
        intensity: String,

        /// Session duration in minutes
        #[arg(long)]
        duration: u32,

        /// Record the session so later risk checks see it
        #[arg(long)]
        log: bool,
    },

    /// Show dose guidance for a menstrual cycle day
    Cycle {
        /// Day into the cycle, counted from 1
        #[arg(long)]
        day: u32,
    },

    /// Roll up journaled doses to CSV
    Archive {
        /// Clean up processed journal files after archiving
        #[arg(long)]
        cleanup: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    bolus_core::logging::init();

    let cli = Cli::parse();

    // Determine data directory
    let config = Config::load()?;
    let data_dir = cli.data_dir.unwrap_or_else(|| config.data.data_dir.clone());

    match cli.command {
        Some(Commands::Dose {
            glucose,
            carbs,
            target,
            ratio,
            factor,
            iob,
            taken,
        }) => {
            cmd_dose(
                data_dir, &config, glucose, carbs, target, ratio, factor, iob, taken,
            )
        }
        Some(Commands::Iob) => cmd_iob(data_dir),
        Some(Commands::Status) => cmd_status(data_dir, &cli.user, &config).await,
        Some(Commands::Watch { ticks }) => cmd_watch(data_dir, &cli.user, &config, ticks).await,
        Some(Commands::Inject) => cmd_inject(data_dir, &cli.user, &config).await,
        Some(Commands::Night { glucose }) => {
            cmd_night(data_dir, &cli.user, &config, glucose).await
        }
        Some(Commands::Exercise {
            intensity,
            duration,
            log,
        }) => cmd_exercise(data_dir, &intensity, duration, log),
        Some(Commands::Cycle { day }) => cmd_cycle(day),
        Some(Commands::Archive { cleanup }) => cmd_archive(data_dir, cleanup),
        None => {
            // Default to "status" command
            cmd_status(data_dir, &cli.user, &config).await
        }
    }
}

/// Filesystem layout under the data directory
struct DataPaths {
    journal_dir: PathBuf,
    journal: PathBuf,
    snapshot: PathBuf,
    archive: PathBuf,
    signal: PathBuf,
    record: PathBuf,
}

impl DataPaths {
    fn new(data_dir: &Path) -> Self {
        let journal_dir = data_dir.join("journal");
        Self {
            journal: journal_dir.join("doses.jsonl"),
            snapshot: journal_dir.join("timer_state.json"),
            archive: data_dir.join("doses.csv"),
            signal: data_dir.join("signals").join("exercise.json"),
            record: record_path(data_dir),
            journal_dir,
        }
    }

    fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.journal_dir)?;
        Ok(())
    }
}

fn build_engine(paths: &DataPaths, user: &str, config: &Config) -> Result<Arc<DoseEngine>> {
    let backend = Arc::new(FileRecordBackend::new(paths.record.clone()));
    let options = EngineOptions {
        user_id: user.to_string(),
        snapshot_path: paths.snapshot.clone(),
        journal_path: paths.journal.clone(),
        archive_path: paths.archive.clone(),
        signal_path: paths.signal.clone(),
        night_hypo_threshold: config.risk.night_hypo_threshold,
        insulin_kind: config.therapy.insulin_kind,
    };
    Ok(Arc::new(DoseEngine::new(
        backend.clone(),
        backend,
        Arc::new(LogAlertSink),
        options,
    )?))
}

#[allow(clippy::too_many_arguments)]
fn cmd_dose(
    data_dir: PathBuf,
    config: &Config,
    glucose: f64,
    carbs: f64,
    target: Option<f64>,
    ratio: Option<f64>,
    factor: Option<f64>,
    iob_override: Option<f64>,
    taken: bool,
) -> Result<()> {
    let paths = DataPaths::new(&data_dir);
    paths.ensure_dirs()?;

    let now = Utc::now();
    let entries = load_active_entries(&paths.journal, &paths.archive, now)?;
    let report = insulin_on_board(&entries, now);
    let active_iob = iob_override.unwrap_or(report.total_iob);

    let input = RecommendationInput {
        current_glucose: glucose,
        target_glucose: target.unwrap_or(config.therapy.target_glucose),
        carbohydrates: carbs,
        insulin_ratio: ratio.unwrap_or(config.therapy.insulin_ratio),
        correction_factor: factor.unwrap_or(config.therapy.correction_factor),
        active_iob,
    };
    let recommendation = bolus_recommendation(&input)?;

    display_recommendation(&recommendation);

    if taken {
        if recommendation.final_recommendation <= 0.0 {
            println!("Nothing to journal: the recommended dose is zero.");
            return Ok(());
        }

        let entry = InsulinEntry::new(
            recommendation.final_recommendation,
            config.therapy.insulin_kind,
            now,
        );
        let mut sink = JsonlSink::new(&paths.journal);
        sink.append(&entry)?;

        println!("✓ Dose journaled: {:.1} u {}", entry.units, entry.kind.label());
    }

    Ok(())
}

fn cmd_iob(data_dir: PathBuf) -> Result<()> {
    let paths = DataPaths::new(&data_dir);

    let now = Utc::now();
    let entries = load_active_entries(&paths.journal, &paths.archive, now)?;
    let report = insulin_on_board(&entries, now);

    if report.contributions.is_empty() {
        println!("No active insulin on board.");
        return Ok(());
    }

    println!("\n╭─────────────────────────────────────────╮");
    println!("│  INSULIN ON BOARD");
    println!("╰─────────────────────────────────────────╯");
    println!();

    for contribution in &report.contributions {
        let age_minutes = (now - contribution.taken_at).num_minutes();
        println!(
            "  {:>5.1} u left of {:>5.1} u {} ({} min ago)",
            dose::round_to_tenth(contribution.remaining_units),
            contribution.units,
            contribution.kind.label(),
            age_minutes,
        );
    }

    println!("  ─────────────────────────────");
    println!("  Total: {:.1} u", report.total_iob);
    println!();

    Ok(())
}

async fn cmd_status(data_dir: PathBuf, user: &str, config: &Config) -> Result<()> {
    let paths = DataPaths::new(&data_dir);
    paths.ensure_dirs()?;
    let engine = build_engine(&paths, user, config)?;

    let now = Utc::now();
    let status = match engine.refresh(now).await {
        Ok(status) => status,
        Err(e) => {
            eprintln!("Record fetch failed: {}. Showing local state.", e);
            EngineStatus {
                record: engine.active_record().await,
                readout: engine.readout(now).await,
            }
        }
    };

    display_status(&status);
    Ok(())
}

async fn cmd_watch(
    data_dir: PathBuf,
    user: &str,
    config: &Config,
    max_ticks: Option<u64>,
) -> Result<()> {
    const REFRESH_INTERVAL_SECS: u64 = 60;

    let paths = DataPaths::new(&data_dir);
    paths.ensure_dirs()?;
    let engine = build_engine(&paths, user, config)?;

    match engine.refresh(Utc::now()).await {
        Ok(status) => display_status(&status),
        Err(e) => eprintln!("Record fetch failed: {}. Watching local state.", e),
    }

    let poller = TimerPoller::new(engine.clone());
    let mut readouts = poller.subscribe();
    if engine.readout(Utc::now()).await.phase == TimerPhase::Running {
        poller.start();
    } else {
        println!("  Waiting for a running timer. Press Ctrl-C to stop.");
    }

    let cancel = install_signal_handler();

    let mut refresh_interval =
        tokio::time::interval(std::time::Duration::from_secs(REFRESH_INTERVAL_SECS));
    // Skip the first immediate tick.
    refresh_interval.tick().await;

    // SignalKind has no named constructor for SIGCONT
    let mut resumed =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::from_raw(libc::SIGCONT))?;

    let mut seen_ticks: u64 = 0;
    loop {
        tokio::select! {
            changed = readouts.changed() => {
                if changed.is_ok() {
                    let readout = readouts.borrow_and_update().clone();
                    render_countdown(&readout);
                    seen_ticks += 1;
                    if max_ticks.is_some_and(|max| seen_ticks >= max) {
                        println!();
                        break;
                    }
                }
            }
            _ = refresh_interval.tick() => {
                match engine.refresh(Utc::now()).await {
                    Ok(status) => {
                        // A fresh record restarts the countdown
                        if status.readout.phase == TimerPhase::Running {
                            poller.start();
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Record refresh failed (non-fatal): {}", e);
                    }
                }
            }
            _ = resumed.recv() => {
                // Back from a suspension; show where the clock really stands
                poller.notify_foreground().await?;
            }
            _ = cancel.cancelled() => {
                println!();
                println!("Stopping watch.");
                break;
            }
        }
    }

    poller.stop();
    poller.join().await;
    Ok(())
}

async fn cmd_inject(data_dir: PathBuf, user: &str, config: &Config) -> Result<()> {
    let paths = DataPaths::new(&data_dir);
    paths.ensure_dirs()?;
    let engine = build_engine(&paths, user, config)?;

    let now = Utc::now();
    if let Err(e) = engine.refresh(now).await {
        eprintln!("Record fetch failed: {}. Proceeding with local state.", e);
    }

    if engine.active_record().await.is_none() {
        println!("No active dosing record, nothing to inject.");
        return Ok(());
    }

    match engine.confirm_injection(now).await? {
        InjectionOutcome::Synced => {
            println!("✓ Injection recorded and synced");
        }
        InjectionOutcome::SyncPending => {
            println!("✓ Injection recorded locally");
            println!("  ⚠ Backend sync failed; the injection is saved on this device");
        }
        InjectionOutcome::AlreadyInjected => {
            println!("Insulin already marked as injected for this record.");
        }
    }

    Ok(())
}

async fn cmd_night(data_dir: PathBuf, user: &str, config: &Config, glucose: f64) -> Result<()> {
    let paths = DataPaths::new(&data_dir);
    paths.ensure_dirs()?;
    let engine = build_engine(&paths, user, config)?;

    let now = Utc::now();
    if let Err(e) = engine.refresh(now).await {
        eprintln!("Record fetch failed: {}. Assessing with local data.", e);
    }

    let assessment = engine.assess_night_risk(glucose, now).await?;

    println!("\n╭─────────────────────────────────────────╮");
    println!("│  NIGHT HYPO RISK");
    println!("╰─────────────────────────────────────────╯");
    println!();

    let marker = match assessment.level {
        RiskLevel::High => "⚠",
        RiskLevel::Medium => "•",
        RiskLevel::Low => "✓",
    };
    println!("  {} Risk level: {:?}", marker, assessment.level);
    println!("  {}", assessment.reason);

    if assessment.should_alert {
        println!();
        println!("  Set an overnight glucose check alarm.");
    }

    println!();
    Ok(())
}

fn cmd_exercise(data_dir: PathBuf, intensity: &str, duration: u32, log: bool) -> Result<()> {
    let intensity = match intensity.to_lowercase().as_str() {
        "low" => ExerciseIntensity::Low,
        "moderate" => ExerciseIntensity::Moderate,
        "high" => ExerciseIntensity::High,
        other => {
            return Err(Error::InvalidInput(format!(
                "unknown intensity '{}' (expected low, moderate, or high)",
                other
            )));
        }
    };

    let impact = exercise_impact(intensity, duration);

    println!("\n╭─────────────────────────────────────────╮");
    println!("│  EXERCISE GUIDANCE");
    println!("╰─────────────────────────────────────────╯");
    println!();
    println!("  Reduce bolus doses by {}%", impact.dose_reduction_percent);
    println!(
        "  Eat {}-{} g of carbs around the session",
        impact.carb_intake_grams.0, impact.carb_intake_grams.1
    );
    println!(
        "  Monitor glucose for {} hours afterwards",
        impact.monitoring_hours
    );
    println!();

    if log {
        let paths = DataPaths::new(&data_dir);
        let signal = ExerciseSignal {
            last_session_at: Utc::now(),
            intensity,
            duration_minutes: duration,
        };
        save_exercise_signal(&paths.signal, &signal)?;
        println!("✓ Exercise session recorded");
    }

    Ok(())
}

fn cmd_cycle(day: u32) -> Result<()> {
    if day == 0 {
        return Err(Error::InvalidInput("cycle day is counted from 1".into()));
    }

    let impact = menstrual_cycle_impact(day);

    println!("\n╭─────────────────────────────────────────╮");
    println!("│  CYCLE PHASE GUIDANCE");
    println!("╰─────────────────────────────────────────╯");
    println!();
    println!("  Day {}: {:?} phase", day, impact.phase);

    match impact.dose_adjustment_percent {
        0 => println!("  No dose adjustment expected"),
        adj if adj > 0 => println!("  Insulin needs typically up around {}%", adj),
        adj => println!("  Insulin needs typically down around {}%", -adj),
    }
    println!("  {}", impact.note);
    println!();

    Ok(())
}

fn cmd_archive(data_dir: PathBuf, cleanup: bool) -> Result<()> {
    let paths = DataPaths::new(&data_dir);

    if !paths.journal.exists() {
        println!("No dose journal found - nothing to archive.");
        return Ok(());
    }

    let count =
        bolus_core::archive::journal_to_csv_and_archive(&paths.journal, &paths.archive)?;

    println!("✓ Archived {} doses to CSV", count);
    println!("  CSV: {}", paths.archive.display());

    if cleanup {
        let cleaned = bolus_core::archive::cleanup_processed_journals(&paths.journal_dir)?;
        if cleaned > 0 {
            println!("✓ Cleaned up {} processed journal files", cleaned);
        }
    }

    Ok(())
}

fn display_recommendation(recommendation: &BolusRecommendation) {
    println!("\n╭─────────────────────────────────────────╮");
    println!("│  BOLUS RECOMMENDATION");
    println!("╰─────────────────────────────────────────╯");
    println!();
    println!(
        "  Carb insulin:       {:>7.1} u",
        recommendation.breakdown.carb_insulin
    );
    println!(
        "  Correction insulin: {:>7.1} u",
        recommendation.breakdown.correction_insulin
    );
    println!(
        "  Total insulin:      {:>7.1} u",
        recommendation.breakdown.total_insulin
    );
    println!(
        "  Insulin on board:   {:>7.1} u",
        recommendation.iob_adjustment
    );
    println!("  ─────────────────────────────");
    println!(
        "  Recommended dose:   {:>7.1} u",
        recommendation.final_recommendation
    );

    if let Some(warning) = recommendation.warning {
        println!();
        println!("  ⚠ {}", warning.message());
    }

    println!();
}

fn display_status(status: &EngineStatus) {
    println!("\n╭─────────────────────────────────────────╮");
    println!("│  DOSING STATUS");
    println!("╰─────────────────────────────────────────╯");
    println!();

    match &status.record {
        Some(record) => {
            println!("  Record:     {}", record.id);
            println!(
                "  Glucose:    {:.0} mg/dL (target {:.0})",
                record.current_glucose, record.target_glucose
            );
            println!("  Carbs:      {:.0} g", record.carbohydrates);
            println!(
                "  Dose:       {:.1} u ({:.1} carb + {:.1} correction)",
                record.total_insulin, record.carb_insulin, record.correction_insulin
            );
            if record.insulin_injected {
                match record.injected_at {
                    Some(at) => {
                        println!("  Injected:   yes, at {}", at.format("%Y-%m-%d %H:%M UTC"))
                    }
                    None => println!("  Injected:   yes"),
                }
            } else {
                println!("  Injected:   not yet");
            }
        }
        None => {
            println!("  No active dosing record.");
        }
    }

    println!();
    display_timer_line(&status.readout);
    println!();
}

fn display_timer_line(readout: &TimerReadout) {
    match readout.phase {
        TimerPhase::Idle => println!("  Timer:      idle"),
        TimerPhase::Running => println!(
            "  Timer:      {} remaining ({:.0}% elapsed)",
            format_remaining(readout.remaining_seconds),
            readout.percent_elapsed
        ),
        TimerPhase::Completed => println!("  Timer:      complete, glucose check due"),
    }
}

fn render_countdown(readout: &TimerReadout) {
    match readout.phase {
        TimerPhase::Running => {
            print!(
                "\r  ⏱ {} remaining ({:.0}% elapsed)   ",
                format_remaining(readout.remaining_seconds),
                readout.percent_elapsed
            );
            let _ = io::stdout().flush();
        }
        TimerPhase::Completed => {
            println!();
            println!("✓ Timer complete. Time for a glucose check.");
        }
        TimerPhase::Idle => {
            println!();
            println!("Timer reset.");
        }
    }
}

fn format_remaining(seconds: u32) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, secs)
}

/// Install Ctrl-C / SIGTERM handling; the returned token trips once
fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let handler_token = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl-C, shutting down"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
        }

        handler_token.cancel();
    });

    token
}
