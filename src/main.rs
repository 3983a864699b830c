//! Beatwatch - RSSI location estimation and policing pattern analysis
//!
//! Estimates device positions from signal-strength readings, attaches
//! them to incident records, builds per-officer activity profiles and
//! flags anomalous patterns in a JSON accountability report.
//!
//! Exit codes:
//!   0 - Success (no flags, or --fail-on-flags not set)
//!   1 - Runtime error (bad input, config, unreadable files, etc.)
//!   2 - Anomalies flagged with --fail-on-flags

mod analysis;
mod cli;
mod config;
mod error;
mod estimator;
mod geo;
mod models;
mod pipeline;
mod registry;
mod report;
mod sources;

use anyhow::{Context, Result};
use cli::{Args, Command};
use config::{Config, CONFIG_FILE};
use models::AccountabilityReport;
use pipeline::Pipeline;
use sources::{JsonDirSource, MeasurementSource, MemorySource};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Flags listed per detector in the console summary.
const TOP_FLAGS: usize = 5;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if matches!(args.command, Command::InitConfig) {
        return handle_init_config();
    }

    // Initialize logging
    init_logging(&args);

    info!("Beatwatch v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle init-config: generate a default .beatwatch.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).with_context(|| format!("Failed to write {}", CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE);
    println!("   Edit it to tune the path-loss model, detector thresholds and device registry.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
///
/// `RUST_LOG` takes precedence over the command-line level.
fn init_logging(args: &Args) {
    let level = args.log_level();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Run the selected command. Returns the exit code (0 or 2).
async fn run(args: Args) -> Result<i32> {
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);
    config.validate().context("Invalid configuration")?;

    let output = PathBuf::from(&config.general.output);
    let pipeline = Pipeline::new(config, !args.quiet);

    let mut fail_on_flags = false;
    let report = match &args.command {
        Command::Locate { measurements, .. } => {
            println!("📡 Estimating positions from {}", measurements.display());
            let source = JsonDirSource::new(measurements);
            pipeline.locate(&source).await?
        }
        Command::Profile {
            incidents, officer, ..
        } => {
            println!("📋 Building activity profiles from {}", incidents.display());
            let source = JsonDirSource::new(incidents);
            pipeline.profile(&source, officer.as_deref()).await?
        }
        Command::Analyze {
            measurements,
            incidents,
            officer,
            fail_on_flags: fail,
            ..
        } => {
            println!("🔬 Analyzing incidents from {}", incidents.display());
            fail_on_flags = *fail;

            let measurement_source: Box<dyn MeasurementSource> = match measurements {
                Some(path) => Box::new(JsonDirSource::new(path)),
                None => {
                    warn!("No measurements given; only incidents that already carry a location are located");
                    Box::new(MemorySource::default())
                }
            };
            let incident_source = JsonDirSource::new(incidents);

            pipeline
                .analyze(
                    measurement_source.as_ref(),
                    &incident_source,
                    officer.as_deref(),
                )
                .await?
        }
        Command::InitConfig => return Ok(0),
    };

    report::write_json_report(&report, &output)?;
    print_summary(&report, &output);

    if fail_on_flags && !report.flags.is_empty() {
        eprintln!(
            "\n⛔ {} anomalies flagged. Failing (exit code 2).",
            report.flags.len()
        );
        return Ok(2);
    }

    Ok(0)
}

fn print_summary(report: &AccountabilityReport, output: &Path) {
    println!("\n📊 Summary:");
    print!("{}", report::console_summary(report, TOP_FLAGS));
    println!("   Duration: {:.1}s", report.metadata.duration_seconds);
    println!("\n✅ Done! Report saved to: {}", output.display());
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}
