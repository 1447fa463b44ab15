use anyhow::{bail, Context, Result};
use chrono::{Datelike, Local, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};
use rollcall_core::{date_key, parse_date_key, GalleryStore, LedgerBook};
use rollcall_engine::{
    driver, AppContext, AutoStop, Config, EnrollmentController, EnrollmentOutcome,
    SessionController, StopSignal, DETECTOR_MODEL_URL,
};
use rollcall_hw::Camera;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Longest wait for queued speech before the process exits.
const FEEDBACK_DRAIN: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "rollcall", about = "Webcam face-recognition attendance tracker")]
struct Cli {
    /// Config file (TOML). Falls back to $ROLLCALL_CONFIG, then built-in defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture face samples for a new person
    Enroll {
        /// Name recorded on the attendance sheet
        #[arg(short, long)]
        name: String,
    },
    /// Take attendance until the stop condition is met or Ctrl-C
    Attend {
        #[arg(long, value_enum, default_value_t = StopMode::All)]
        mode: StopMode,
        /// Target for --mode min (defaults to min(3, registered))
        #[arg(long)]
        min_users: Option<usize>,
        /// Seconds for --mode time (10-300)
        #[arg(long, default_value_t = 60)]
        time_limit: u64,
    },
    /// Show the attendance sheet for a day
    Report {
        /// DD-MM-YYYY or YYYY-MM-DD; defaults to today
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Summarise enrolled people
    Gallery,
    /// List V4L2 capture devices
    Devices,
    /// Download the face detector model into the data directory
    FetchDetector {
        /// Replace an existing model file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StopMode {
    /// Stop once every enrolled person has been seen
    All,
    /// Stop after --min-users distinct people
    Min,
    /// Stop after --time-limit seconds
    Time,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Enroll { name } => enroll(config, &name).await,
        Commands::Attend {
            mode,
            min_users,
            time_limit,
        } => attend(config, mode, min_users, time_limit).await,
        Commands::Report { date, json } => report(&config, date.as_deref(), json),
        Commands::Gallery => gallery(&config),
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
            Ok(())
        }
        Commands::FetchDetector { force } => {
            let path = config.detector_model_path();
            tokio::task::spawn_blocking(move || fetch_detector(&path, force)).await?
        }
    }
}

/// Request a stop on the first Ctrl-C.
fn stop_on_ctrl_c(stop: StopSignal) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; stopping after the current frame");
            stop.request();
        }
    })
}

async fn enroll(config: Config, name: &str) -> Result<()> {
    let mut ctx = AppContext::initialize(config)?;
    let mut enrollment = EnrollmentController::from_config(&ctx);
    let ctrl_c = stop_on_ctrl_c(enrollment.stop_handle());

    let (device, width, height) = camera_settings(&ctx.config);
    println!("Look at the camera, {name}. Move your head slightly between captures.");

    let outcome = tokio::task::block_in_place(|| {
        driver::run_enrollment(
            &mut ctx,
            &mut enrollment,
            name,
            || Camera::open(&device, width, height),
            |step| {
                if step.faces > 0 {
                    tracing::debug!(captured = step.captured, target = step.target, "enrollment progress");
                }
            },
        )
    });
    ctrl_c.abort();
    drain_feedback(&mut ctx);

    match outcome? {
        EnrollmentOutcome::Enrolled { name, samples } => {
            println!("Registered {name} with {samples} face captures");
        }
        EnrollmentOutcome::NoSamples { name } => {
            println!("No face captured for {name}; gallery unchanged");
        }
    }
    Ok(())
}

async fn attend(
    config: Config,
    mode: StopMode,
    min_users: Option<usize>,
    time_limit: u64,
) -> Result<()> {
    let mut ctx = AppContext::initialize(config)?;
    let registered = ctx
        .gallery
        .load()?
        .map(|g| g.distinct_labels().len())
        .unwrap_or(0);

    let policy = match mode {
        StopMode::All => AutoStop::AllRegisteredUsers,
        StopMode::Min => {
            AutoStop::MinimumUsers(min_users.unwrap_or_else(|| AutoStop::default_minimum(registered)))
        }
        StopMode::Time => AutoStop::TimeLimit(Duration::from_secs(time_limit)),
    };

    let mut session = SessionController::new();
    let ctrl_c = stop_on_ctrl_c(session.stop_handle());
    let (device, width, height) = camera_settings(&ctx.config);

    let mut last_text = String::new();
    let summary = tokio::task::block_in_place(|| {
        driver::run_attendance(
            &mut ctx,
            &mut session,
            policy,
            || Camera::open(&device, width, height),
            |report| {
                for record in &report.newly_recorded {
                    println!("  {}  {}", record.time.format("%H:%M:%S"), record.name);
                }
                if report.progress_text != last_text {
                    tracing::debug!(progress = report.progress, "{}", report.progress_text);
                    last_text.clone_from(&report.progress_text);
                }
            },
        )
    });
    ctrl_c.abort();
    drain_feedback(&mut ctx);
    let summary = summary?;

    if let Some(warning) = &summary.warning {
        eprintln!("warning: camera stopped responding: {warning}");
    }
    println!(
        "Session {} ({}): {} newly recorded, {} present, {}s",
        summary.session_id,
        summary.outcome.name(),
        summary.recorded.len(),
        summary.seen.len(),
        summary.elapsed.as_secs()
    );
    println!(
        "Sheet: {}",
        ctx.ledger.path_for(summary.date).display()
    );
    Ok(())
}

/// Give the feedback thread a chance to speak what is still queued.
fn drain_feedback(ctx: &mut AppContext) {
    tokio::task::block_in_place(|| {
        if !ctx.notifier.shutdown(FEEDBACK_DRAIN) {
            tracing::warn!("exiting with feedback messages still queued");
        }
    });
}

fn camera_settings(config: &Config) -> (String, u32, u32) {
    (
        config.camera_device.clone(),
        config.camera_width,
        config.camera_height,
    )
}

fn report(config: &Config, date: Option<&str>, json: bool) -> Result<()> {
    let date = match date {
        Some(text) => parse_date(text)?,
        None => Local::now().date_naive(),
    };
    let ledger = LedgerBook::open(config.attendance_dir())?;
    let records = ledger.list_for_date(date)?;

    if json {
        let out = serde_json::json!({
            "date": date_key(date),
            "weekday": date.weekday().to_string(),
            "records": records,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Attendance for {} {}", date.format("%A"), date_key(date));
    if records.is_empty() {
        println!("  (no one recorded)");
    }
    for r in &records {
        println!("  {}  {}", r.time.format("%H:%M:%S"), r.name);
    }
    println!("{} present", records.len());
    Ok(())
}

fn parse_date(text: &str) -> Result<NaiveDate> {
    if let Some(date) = parse_date_key(text) {
        return Ok(date);
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .with_context(|| format!("unrecognised date {text:?}; use DD-MM-YYYY or YYYY-MM-DD"))
}

fn gallery(config: &Config) -> Result<()> {
    let store = GalleryStore::open(&config.data_dir)?;
    let Some(gallery) = store.load()? else {
        println!("Gallery is empty ({})", store.dir().display());
        return Ok(());
    };

    println!(
        "{} samples, {} people, {} features per sample",
        gallery.len(),
        gallery.distinct_labels().len(),
        gallery.dim().unwrap_or(0)
    );
    for (label, count) in gallery.label_counts() {
        println!("  {label}: {count}");
    }
    Ok(())
}

fn fetch_detector(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("Detector model already present at {}", path.display());
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    tracing::info!(url = DETECTOR_MODEL_URL, "downloading detector model");
    let response = ureq::get(DETECTOR_MODEL_URL)
        .call()
        .context("detector download failed")?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut bytes)
        .context("reading detector download")?;
    if bytes.is_empty() {
        bail!("detector download was empty");
    }

    let partial = path.with_extension("part");
    std::fs::write(&partial, &bytes).with_context(|| format!("writing {}", partial.display()))?;
    std::fs::rename(&partial, path).with_context(|| format!("installing {}", path.display()))?;

    println!("Saved {} bytes to {}", bytes.len(), path.display());
    Ok(())
}
