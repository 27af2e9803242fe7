//! Assess CLI - Command-line interface for Kinetia Assess
//!
//! Commands:
//! - run: Drive a live assessment session against a sensor service
//! - score: Score a task result payload offline
//! - baseline: Print or check the reference baseline table

use clap::{Parser, Subcommand};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use kinetia_assess::baseline::ReferenceBaseline;
use kinetia_assess::config::SessionConfig;
use kinetia_assess::connection::{ConnectionConfig, ConnectionManager};
use kinetia_assess::coordinator::SessionCoordinator;
use kinetia_assess::scoring::{RiskEngine, RiskThresholds};
use kinetia_assess::session::{SessionPhase, SessionSnapshot, Waiting};
use kinetia_assess::types::TaskResultPayload;
use kinetia_assess::{SessionError, ENGINE_VERSION};

/// Assess - session coordinator and risk scoring for movement assessments
#[derive(Parser)]
#[command(name = "assess")]
#[command(author = "Kinetia Labs")]
#[command(version = ENGINE_VERSION)]
#[command(about = "Run and score sensor-guided movement assessments", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a live assessment session against a sensor service
    Run {
        /// Sensor service endpoint, e.g. ws://localhost:8000/assess
        #[arg(short, long)]
        endpoint: String,

        /// Session configuration file (JSON); defaults to the built-in
        /// jump-landing screen
        #[arg(long)]
        config: Option<PathBuf>,

        /// Reference baseline file (JSON); defaults to the built-in table
        #[arg(long)]
        baseline: Option<PathBuf>,

        /// Confirm prompts automatically instead of waiting for Enter
        #[arg(long)]
        auto_confirm: bool,

        /// Abort if the session has not finished after this many seconds
        #[arg(long, default_value = "300")]
        timeout_secs: u64,
    },

    /// Score a task result payload offline
    Score {
        /// Input file with a task_result payload (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Reference baseline file (JSON); defaults to the built-in table
        #[arg(long)]
        baseline: Option<PathBuf>,

        /// Flexion deviation threshold in degrees
        #[arg(long, default_value = "10.0")]
        flexion_threshold: f64,

        /// Abduction deviation threshold in degrees
        #[arg(long, default_value = "10.0")]
        abduction_threshold: f64,

        /// Deviation at which risk saturates, in degrees
        #[arg(long, default_value = "30.0")]
        max_deviation: f64,
    },

    /// Print the reference baseline table, or check a custom one
    Baseline {
        /// Baseline file to check instead of printing the built-in table
        #[arg(long)]
        check: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), AssessCliError> {
    match cli.command {
        Commands::Run {
            endpoint,
            config,
            baseline,
            auto_confirm,
            timeout_secs,
        } => cmd_run(
            &endpoint,
            config.as_deref(),
            baseline.as_deref(),
            auto_confirm,
            timeout_secs,
        ),

        Commands::Score {
            input,
            baseline,
            flexion_threshold,
            abduction_threshold,
            max_deviation,
        } => cmd_score(
            &input,
            baseline.as_deref(),
            RiskThresholds {
                flexion_threshold_deg: flexion_threshold,
                abduction_threshold_deg: abduction_threshold,
                max_deviation_deg: max_deviation,
            },
        ),

        Commands::Baseline { check } => cmd_baseline(check.as_deref()),
    }
}

fn cmd_run(
    endpoint: &str,
    config_path: Option<&std::path::Path>,
    baseline_path: Option<&std::path::Path>,
    auto_confirm: bool,
    timeout_secs: u64,
) -> Result<(), AssessCliError> {
    let config = match config_path {
        Some(path) => SessionConfig::from_json(&fs::read_to_string(path)?)?,
        None => SessionConfig::jump_landing(),
    };
    let baseline = load_baseline(baseline_path)?;

    // Prompt interactively only when someone is actually at the terminal
    let interactive = !auto_confirm && atty::is(atty::Stream::Stdin);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let reconnect = Duration::from_secs(config.reconnect_delay_secs);
        let connection = ConnectionManager::connect(ConnectionConfig::new(endpoint, reconnect));
        let coordinator = SessionCoordinator::spawn(config, baseline, &connection)?;

        let outcome = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            drive_session(&coordinator, interactive),
        )
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(AssessCliError::Timeout(timeout_secs)),
        };

        coordinator.shutdown().await;
        connection.disconnect().await;
        result
    })
}

async fn drive_session(
    coordinator: &SessionCoordinator,
    interactive: bool,
) -> Result<(), AssessCliError> {
    use kinetia_assess::connection::LinkStatus;

    let mut snapshots = coordinator.watch();

    eprintln!("Waiting for the sensor service...");
    while snapshots.borrow().link != LinkStatus::Connected {
        snapshots
            .changed()
            .await
            .map_err(|_| AssessCliError::CoordinatorStopped)?;
    }

    coordinator.start().await?;
    let mut last_step: Option<String> = None;
    let mut last_waiting: Option<Waiting> = None;

    loop {
        let snapshot = snapshots.borrow().clone();

        announce(&snapshot, &mut last_step);

        if snapshot.phase == SessionPhase::Finished {
            let result = snapshot
                .result
                .ok_or(AssessCliError::NoResult)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            return Ok(());
        }

        if snapshot.waiting != last_waiting {
            last_waiting = snapshot.waiting;
            match snapshot.waiting {
                Some(Waiting::ManualConfirm) | Some(Waiting::ResumeRequired) => {
                    confirm(coordinator, interactive, snapshot.waiting).await?;
                }
                Some(Waiting::ScoringRetry) => {
                    eprintln!(
                        "Scoring failed: {}; waiting for a new task result",
                        snapshot.scoring_error.as_deref().unwrap_or("unknown")
                    );
                }
                _ => {}
            }
        }

        snapshots
            .changed()
            .await
            .map_err(|_| AssessCliError::CoordinatorStopped)?;
    }
}

fn announce(snapshot: &SessionSnapshot, last_step: &mut Option<String>) {
    if snapshot.step_id != *last_step {
        *last_step = snapshot.step_id.clone();
        if let (Some(title), Some(instruction)) = (&snapshot.step_title, &snapshot.instruction) {
            eprintln!(
                "[{}/{}] {} - {}",
                snapshot.step_index + 1,
                snapshot.step_count,
                title,
                instruction
            );
        }
    }
}

async fn confirm(
    coordinator: &SessionCoordinator,
    interactive: bool,
    waiting: Option<Waiting>,
) -> Result<(), AssessCliError> {
    let prompt = match waiting {
        Some(Waiting::ResumeRequired) => "Link restored. Press Enter to resume the step",
        _ => "Press Enter to start the next step",
    };

    if interactive {
        eprintln!("{}", prompt);
        tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            let _ = io::stdin().read_line(&mut line);
        })
        .await
        .map_err(|_| AssessCliError::CoordinatorStopped)?;
    } else {
        eprintln!("{} (auto-confirmed)", prompt);
    }

    coordinator.confirm_advance().await?;
    Ok(())
}

fn cmd_score(
    input: &PathBuf,
    baseline_path: Option<&std::path::Path>,
    thresholds: RiskThresholds,
) -> Result<(), AssessCliError> {
    let input_data = if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        fs::read_to_string(input)?
    };

    let payload: TaskResultPayload = serde_json::from_str(&input_data)
        .map_err(|e| AssessCliError::Parse(format!("not a task result payload: {}", e)))?;
    let baseline = load_baseline(baseline_path)?;

    let result = RiskEngine::score(&payload.into_bundle(), &baseline, &thresholds)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn cmd_baseline(check: Option<&std::path::Path>) -> Result<(), AssessCliError> {
    match check {
        Some(path) => {
            let baseline = ReferenceBaseline::from_json(&fs::read_to_string(path)?)?;
            eprintln!("Baseline '{}' is valid", baseline.version);
            Ok(())
        }
        None => {
            println!("{}", ReferenceBaseline::normative().to_json()?);
            Ok(())
        }
    }
}

fn load_baseline(path: Option<&std::path::Path>) -> Result<ReferenceBaseline, AssessCliError> {
    match path {
        Some(path) => Ok(ReferenceBaseline::from_json(&fs::read_to_string(path)?)?),
        None => Ok(ReferenceBaseline::normative()),
    }
}

// Error types

#[derive(Debug)]
enum AssessCliError {
    Io(io::Error),
    Session(SessionError),
    Json(serde_json::Error),
    Parse(String),
    Timeout(u64),
    CoordinatorStopped,
    NoResult,
}

impl From<io::Error> for AssessCliError {
    fn from(e: io::Error) -> Self {
        AssessCliError::Io(e)
    }
}

impl From<SessionError> for AssessCliError {
    fn from(e: SessionError) -> Self {
        AssessCliError::Session(e)
    }
}

impl From<serde_json::Error> for AssessCliError {
    fn from(e: serde_json::Error) -> Self {
        AssessCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<AssessCliError> for CliError {
    fn from(e: AssessCliError) -> Self {
        match e {
            AssessCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            AssessCliError::Session(e) => CliError {
                code: "SESSION_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            AssessCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            AssessCliError::Parse(msg) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: msg,
                hint: Some("Expected a task_result payload (bundle or legacy flat)".to_string()),
            },
            AssessCliError::Timeout(secs) => CliError {
                code: "TIMEOUT".to_string(),
                message: format!("Session did not finish within {} seconds", secs),
                hint: Some("Raise --timeout-secs or check the sensor service".to_string()),
            },
            AssessCliError::CoordinatorStopped => CliError {
                code: "COORDINATOR_STOPPED".to_string(),
                message: "The session coordinator stopped unexpectedly".to_string(),
                hint: None,
            },
            AssessCliError::NoResult => CliError {
                code: "NO_RESULT".to_string(),
                message: "Session finished without a computed result".to_string(),
                hint: Some("The final step of the configured table is not scored".to_string()),
            },
        }
    }
}
