//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::estimator::MAX_WINDOW_SECS;
use crate::geo::CoordinateFrame;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// Beatwatch - RSSI location estimation and policing pattern analysis
///
/// Turns signal-strength readings into device position estimates, folds
/// incident records into per-officer activity profiles and flags
/// anomalous patterns. Reports are written as JSON.
///
/// Examples:
///   beatwatch locate --measurements ./signals
///   beatwatch profile --incidents ./incidents --officer 123
///   beatwatch analyze --measurements ./signals --incidents ./incidents
///   beatwatch init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    ///
    /// If not specified, looks for .beatwatch.toml in the current directory
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output, no progress bar)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Frame receiver positions are expressed in (planar, geodetic)
    #[arg(long, value_name = "FRAME", env = "BEATWATCH_FRAME", global = true)]
    pub frame: Option<CoordinateFrame>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Estimate device positions from signal measurements
    Locate {
        /// JSON file or directory of measurement records
        #[arg(short, long, value_name = "PATH")]
        measurements: PathBuf,

        /// Only measurements this close to a source's newest reading are used
        #[arg(long, value_name = "SECS")]
        window_secs: Option<u64>,

        /// Output file path for the report
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Build activity profiles from incident records
    Profile {
        /// JSON file or directory of incident records
        #[arg(short, long, value_name = "PATH")]
        incidents: PathBuf,

        /// Restrict the report to one officer
        #[arg(long, value_name = "ID")]
        officer: Option<String>,

        /// Output file path for the report
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Locate devices, attach locations to incidents and flag anomalies
    Analyze {
        /// JSON file or directory of measurement records
        ///
        /// Without it, only locations already present on incidents are used.
        #[arg(short, long, value_name = "PATH")]
        measurements: Option<PathBuf>,

        /// JSON file or directory of incident records
        #[arg(short, long, value_name = "PATH")]
        incidents: PathBuf,

        /// Restrict the report to one officer
        ///
        /// Population statistics still use every officer.
        #[arg(long, value_name = "ID")]
        officer: Option<String>,

        /// Output file path for the report
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Only measurements this close to a source's newest reading are used
        #[arg(long, value_name = "SECS")]
        window_secs: Option<u64>,

        /// Standard deviations above the mean rate for a high-frequency flag
        #[arg(short, long, value_name = "SIGMAS")]
        k: Option<f64>,

        /// Exit with code 2 when any anomaly is flagged
        #[arg(long)]
        fail_on_flags: bool,
    },

    /// Generate a default .beatwatch.toml configuration file
    InitConfig,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn window_secs(&self) -> Option<u64> {
        match &self.command {
            Command::Locate { window_secs, .. } | Command::Analyze { window_secs, .. } => {
                *window_secs
            }
            _ => None,
        }
    }

    pub fn k(&self) -> Option<f64> {
        match &self.command {
            Command::Analyze { k, .. } => *k,
            _ => None,
        }
    }

    pub fn output(&self) -> Option<&Path> {
        match &self.command {
            Command::Locate { output, .. }
            | Command::Profile { output, .. }
            | Command::Analyze { output, .. } => output.as_deref(),
            Command::InitConfig => None,
        }
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(window) = self.window_secs() {
            if window == 0 || window > MAX_WINDOW_SECS {
                return Err(format!(
                    "Window must be between 1 and {} seconds",
                    MAX_WINDOW_SECS
                ));
            }
        }

        if let Some(k) = self.k() {
            if !k.is_finite() || k < 0.0 {
                return Err("k must be a non-negative number".to_string());
            }
        }

        match &self.command {
            Command::Locate { measurements, .. } => check_input(measurements),
            Command::Profile { incidents, .. } => check_input(incidents),
            Command::Analyze {
                measurements,
                incidents,
                ..
            } => {
                if let Some(measurements) = measurements {
                    check_input(measurements)?;
                }
                check_input(incidents)
            }
            Command::InitConfig => Ok(()),
        }
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

fn check_input(path: &Path) -> Result<(), String> {
    if !path.exists() {
        return Err(format!("Input path does not exist: {}", path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args(command: Command) -> Args {
        Args {
            command,
            config: None,
            verbose: false,
            quiet: false,
            frame: None,
        }
    }

    fn analyze_command() -> Command {
        Command::Analyze {
            measurements: None,
            incidents: std::env::temp_dir(),
            officer: None,
            output: Some(PathBuf::from("out.json")),
            window_secs: Some(30),
            k: Some(1.5),
            fail_on_flags: false,
        }
    }

    #[test]
    fn test_parse_analyze() {
        let args = Args::try_parse_from([
            "beatwatch",
            "analyze",
            "--incidents",
            "incidents",
            "--officer",
            "123",
            "-k",
            "3",
            "--frame",
            "geodetic",
        ])
        .unwrap();

        assert_eq!(args.k(), Some(3.0));
        assert_eq!(args.frame, Some(CoordinateFrame::Geodetic));
        assert!(matches!(
            args.command,
            Command::Analyze { officer: Some(ref o), .. } if o == "123"
        ));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::try_parse_from(["beatwatch", "init-config", "-v"]).unwrap();
        assert!(args.verbose);
        assert!(matches!(args.command, Command::InitConfig));
    }

    #[test]
    fn test_accessors() {
        let args = make_args(analyze_command());
        assert_eq!(args.window_secs(), Some(30));
        assert_eq!(args.k(), Some(1.5));
        assert_eq!(args.output(), Some(Path::new("out.json")));

        let args = make_args(Command::InitConfig);
        assert_eq!(args.window_secs(), None);
        assert_eq!(args.output(), None);
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args(analyze_command());
        assert!(args.validate().is_ok());

        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let args = make_args(Command::Locate {
            measurements: std::env::temp_dir(),
            window_secs: Some(0),
            output: None,
        });
        assert!(args.validate().is_err());

        let args = make_args(Command::Profile {
            incidents: PathBuf::from("/nonexistent/beatwatch"),
            officer: None,
            output: None,
        });
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args(Command::InitConfig);
        assert_eq!(args.log_level(), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
