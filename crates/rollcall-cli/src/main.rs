use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Days, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rollcall_core::{
    AttendanceEngine, AttendanceSchedule, Config, DayStatus, FaceMatcher, JsonFileStore,
    MarkOutcome,
};
use rollcall_hw::{open_channel, Channel, DeviceSession, SessionConfig};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Days covered by `export` when no start date is given.
const DEFAULT_EXPORT_DAYS: u64 = 30;

#[derive(Parser)]
#[command(name = "rollcall", about = "rollcall attendance ledger and device tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the roster
    #[command(subcommand)]
    User(UserCommand),
    /// Train the device on a user's face and store the template
    Enroll {
        id: String,
    },
    /// List records for one day (default: today)
    Records {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Show a user's status for one day (default: today)
    Status {
        id: String,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Mark a user as arrived (default: now)
    Mark {
        id: String,
        /// RFC 3339 timestamp
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Record absences for users with no record today
    Sweep {
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Drop a user from attendance tracking
    Drop {
        id: String,
    },
    /// Clear a user's dropped flag and absence count
    Reinstate {
        id: String,
    },
    /// Zero absence counts for one user, or everyone with --all
    ResetAbsences {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        id: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Print the roster and the records of a date range as JSON
    /// (default: the last 30 days)
    Export {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Export the whole ledger
        #[arg(long, conflicts_with_all = ["from", "to"])]
        all: bool,
    },
    /// Count statuses for one day (default: today)
    Report {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        json: bool,
    },
    /// Talk to the capture device directly
    #[command(subcommand)]
    Device(DeviceCommand),
}

#[derive(Subcommand)]
enum UserCommand {
    /// Add a user to the roster
    Add { id: String, name: String },
    /// Remove a user and their template
    Remove { id: String },
    /// List users
    List,
}

#[derive(Subcommand)]
enum DeviceCommand {
    /// Initialize, capture a frame and run detection and recognition
    Test,
    /// Reset the capture device
    Reset,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;

    match cli.command {
        Commands::User(UserCommand::Add { id, name }) => {
            open_ledger(&config)?.add_user(&id, &name)?;
            println!("Added {id} ({name})");
        }
        Commands::User(UserCommand::Remove { id }) => {
            open_ledger(&config)?.remove_user(&id)?;
            println!("Removed {id}");
        }
        Commands::User(UserCommand::List) => {
            let ledger = open_ledger(&config)?;
            if ledger.users().is_empty() {
                println!("No users enrolled");
            }
            for user in ledger.users() {
                let flag = if user.is_dropped { "  [dropped]" } else { "" };
                println!(
                    "{:<16} {:<24} absences={}{flag}",
                    user.id, user.name, user.absence_count
                );
            }
        }
        Commands::Enroll { id } => {
            let mut ledger = open_ledger(&config)?;
            if ledger.user(&id).is_none() {
                bail!("user {id} not found; add it first with `rollcall user add`");
            }
            let mut session = open_session(&config)?;
            println!("Look at the camera...");
            session.train_face(&id)?;
            let sample = session
                .request_features()?
                .context("device reported no face after training")?;
            ledger.enroll_template(&id, &sample)?;
            println!(
                "Enrolled {id} ({} features, confidence {:.2})",
                sample.features.len(),
                sample.confidence
            );
        }
        Commands::Records { date } => {
            let ledger = open_ledger(&config)?;
            let day = date.unwrap_or_else(|| ledger.schedule().local_day(Utc::now()));
            let records = ledger.records_on(day);
            if records.is_empty() {
                println!("No records for {day}");
            }
            for record in records {
                let name = ledger.user(&record.user_id).map(|u| u.name.as_str()).unwrap_or("");
                println!(
                    "{}  {:<16} {:<24} {}",
                    local_time(ledger.schedule(), record.timestamp),
                    record.user_id,
                    name,
                    record.status
                );
            }
        }
        Commands::Status { id, date } => {
            let ledger = open_ledger(&config)?;
            let day = date.unwrap_or_else(|| ledger.schedule().local_day(Utc::now()));
            match ledger.status(&id, day) {
                DayStatus::NoRecord => println!("{id} {day}: no record"),
                DayStatus::Marked(status) => println!("{id} {day}: {status}"),
            }
        }
        Commands::Mark { id, at } => {
            let mut ledger = open_ledger(&config)?;
            match ledger.mark_attendance(&id, at.unwrap_or_else(Utc::now))? {
                MarkOutcome::Recorded { status, dropped } => {
                    println!("{id}: {status}");
                    if dropped {
                        println!("{id} reached the absence limit and was dropped");
                    }
                }
                MarkOutcome::AlreadyMarked(status) => println!("{id} already marked today ({status})"),
            }
        }
        Commands::Sweep { at } => {
            let mut ledger = open_ledger(&config)?;
            let summary = ledger.process_scheduled_status_changes(at.unwrap_or_else(Utc::now))?;
            println!("Marked absent: {}", summary.marked_absent.len());
            for id in &summary.dropped {
                println!("Dropped: {id}");
            }
        }
        Commands::Drop { id } => {
            open_ledger(&config)?.drop_user(&id, Utc::now())?;
            println!("Dropped {id}");
        }
        Commands::Reinstate { id } => {
            open_ledger(&config)?.reinstate_user(&id)?;
            println!("Reinstated {id}");
        }
        Commands::ResetAbsences { id, all } => {
            let target = if all { None } else { id.as_deref() };
            open_ledger(&config)?.reset_absences(target)?;
            println!("Absences reset");
        }
        Commands::Export { from, to, all } => {
            let ledger = open_ledger(&config)?;
            let export = if all {
                serde_json::json!({
                    "users": ledger.user_entries(),
                    "attendance": ledger.attendance_entries(),
                })
            } else {
                let today = ledger.schedule().local_day(Utc::now());
                let (from, to) = export_range(from, to, today);
                if from > to {
                    bail!("--from {from} is after --to {to}");
                }
                serde_json::json!({
                    "from": from,
                    "to": to,
                    "users": ledger.user_entries(),
                    "attendance": ledger.attendance_entries_between(from, to),
                })
            };
            println!("{}", serde_json::to_string_pretty(&export)?);
        }
        Commands::Report { date, json } => {
            let ledger = open_ledger(&config)?;
            let day = date.unwrap_or_else(|| ledger.schedule().local_day(Utc::now()));
            let report = ledger.day_report(day);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Attendance report for {day}");
                println!("  present   {}", report.present);
                println!("  late      {}", report.late);
                println!("  absent    {}", report.absent);
                println!("  dropped   {}", report.dropped);
                println!("  unmarked  {}", report.unmarked);
            }
        }
        Commands::Device(DeviceCommand::Test) => {
            let mut session = open_session(&config)?;
            println!("Device initialized");
            session.capture_frame()?;
            println!("Frame captured");
            let face = session.detect_face()?;
            println!("Face detected: {face}");
            if face {
                match session.recognize_face()? {
                    Some(id) => println!("Recognized on device: {id}"),
                    None => println!("Face not recognized on device"),
                }
            }
        }
        Commands::Device(DeviceCommand::Reset) => {
            let channel = open_link(&config)?;
            let mut session = DeviceSession::new(channel, SessionConfig::from(&config.device));
            session.reset()?;
            println!("Device reset");
        }
    }

    Ok(())
}

/// Wall-clock time of `at` in the schedule's timezone.
fn local_time(schedule: &AttendanceSchedule, at: DateTime<Utc>) -> String {
    at.with_timezone(&schedule.offset()).format("%H:%M:%S").to_string()
}

/// Resolve the export window: `to` defaults to `today`, `from` to
/// `DEFAULT_EXPORT_DAYS` before `to`.
fn export_range(from: Option<NaiveDate>, to: Option<NaiveDate>, today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let to = to.unwrap_or(today);
    let from = from.unwrap_or_else(|| {
        to.checked_sub_days(Days::new(DEFAULT_EXPORT_DAYS))
            .unwrap_or(NaiveDate::MIN)
    });
    (from, to)
}

fn open_ledger(config: &Config) -> Result<AttendanceEngine<JsonFileStore>> {
    let dir = config.data_dir();
    let store = JsonFileStore::open(&dir)
        .with_context(|| format!("opening data directory {}", dir.display()))?;
    Ok(AttendanceEngine::open(store, config.schedule()?)?.with_matcher(
        FaceMatcher::new(config.matcher.similarity_scale),
        config.matcher.confidence_threshold,
    ))
}

fn open_link(config: &Config) -> Result<Box<dyn Channel + Send>> {
    open_channel(&config.device.path, config.device.baud_rate, CONNECT_TIMEOUT)
        .with_context(|| format!("opening device link {}", config.device.path))
}

/// Open the device link and run the Init handshake.
fn open_session(config: &Config) -> Result<DeviceSession<Box<dyn Channel + Send>>> {
    let mut session = DeviceSession::new(open_link(config)?, SessionConfig::from(&config.device));
    session.initialize().context("initializing capture device")?;
    Ok(session)
}
