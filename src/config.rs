//! Configuration file handling.
//!
//! This module handles loading, validating and merging configuration from
//! `.beatwatch.toml` files. Every field has a default so a partial file (or
//! none at all) yields a usable configuration.

use crate::estimator::{ConfidenceModel, SolverStrategy, MAX_WINDOW_SECS};
use crate::geo::CoordinateFrame;
use crate::models::Point;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Default configuration file name.
pub const CONFIG_FILE: &str = ".beatwatch.toml";

/// Upper bound for analyzer durations (one year).
const MAX_ANALYSIS_SECS: i64 = 365 * 86_400;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Path-loss model and solver settings.
    #[serde(default)]
    pub estimator: EstimatorConfig,

    /// Anomaly detector thresholds.
    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    /// Device and identifier mapping.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Estimate-to-incident attachment.
    #[serde(default)]
    pub attach: AttachConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default output file path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Frame receiver positions are reported in.
    #[serde(default)]
    pub frame: CoordinateFrame,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
            frame: CoordinateFrame::default(),
        }
    }
}

fn default_output() -> String {
    "beatwatch_report.json".to_string()
}

/// Path-loss model constants and solver limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Received power at 1 m, in dBm.
    #[serde(default = "default_tx_power")]
    pub tx_power: f64,

    /// Path-loss exponent `n` (2.0 in free space).
    #[serde(default = "default_path_loss_exponent")]
    pub path_loss_exponent: f64,

    /// Variance of RSSI readings, in dB².
    #[serde(default = "default_noise_variance")]
    pub noise_variance: f64,

    /// Implied distances are clamped to `[min_range, max_range]` metres.
    #[serde(default = "default_min_range")]
    pub min_range: f64,

    #[serde(default = "default_max_range")]
    pub max_range: f64,

    /// Width of the measurement window, in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Solver selection.
    #[serde(default)]
    pub strategy: SolverStrategy,

    /// Iteration cap for the least-squares solver.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Convergence threshold on the step length, in metres.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    /// Receiver layouts flatter than this (minor/major axis) are degenerate.
    #[serde(default = "default_min_aspect_ratio")]
    pub min_aspect_ratio: f64,

    /// Confidence scoring formula.
    #[serde(default)]
    pub confidence: ConfidenceModel,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            tx_power: default_tx_power(),
            path_loss_exponent: default_path_loss_exponent(),
            noise_variance: default_noise_variance(),
            min_range: default_min_range(),
            max_range: default_max_range(),
            window_secs: default_window_secs(),
            strategy: SolverStrategy::default(),
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
            min_aspect_ratio: default_min_aspect_ratio(),
            confidence: ConfidenceModel::default(),
        }
    }
}

fn default_tx_power() -> f64 {
    0.0
}

fn default_path_loss_exponent() -> f64 {
    2.0 // free space
}

fn default_noise_variance() -> f64 {
    4.0
}

fn default_min_range() -> f64 {
    1.0
}

fn default_max_range() -> f64 {
    1000.0
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_iterations() -> usize {
    50
}

fn default_tolerance() -> f64 {
    1e-9
}

fn default_min_aspect_ratio() -> f64 {
    0.01
}

/// Thresholds for the three anomaly detectors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default)]
    pub high_frequency: HighFrequencyConfig,

    #[serde(default)]
    pub geographic: GeographicConfig,

    #[serde(default)]
    pub temporal: TemporalConfig,

    /// Frame profile locations are expressed in. Filled from `general.frame`.
    #[serde(skip)]
    pub frame: CoordinateFrame,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighFrequencyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Standard deviations above the mean rate of the other identifiers.
    #[serde(default = "default_k")]
    pub k: f64,

    /// Identifiers with fewer incidents are excluded.
    #[serde(default = "default_min_incidents")]
    pub min_incidents: usize,

    /// Floor on the active span used as the rate denominator, in minutes.
    #[serde(default = "default_min_span_minutes")]
    pub min_span_minutes: i64,

    /// Floor on the spread of the other identifiers' rates, in incidents/hour.
    #[serde(default = "default_min_std_dev")]
    pub min_std_dev: f64,
}

impl Default for HighFrequencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            k: default_k(),
            min_incidents: default_min_incidents(),
            min_span_minutes: default_min_span_minutes(),
            min_std_dev: default_min_std_dev(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_k() -> f64 {
    2.0
}

fn default_min_incidents() -> usize {
    5
}

fn default_min_span_minutes() -> i64 {
    15
}

fn default_min_std_dev() -> f64 {
    0.5
}

/// A place whose repeated targeting should be flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitiveLocation {
    pub name: String,
    pub position: Point,
    /// Radius in metres.
    pub radius: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeographicConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum located incidents before dispersion is meaningful.
    #[serde(default = "default_min_located")]
    pub min_located: usize,

    /// Flag when dispersion is at most this fraction of the population median.
    #[serde(default = "default_tightness_ratio")]
    pub tightness_ratio: f64,

    /// Share of located incidents inside a sensitive radius that raises a flag.
    #[serde(default = "default_sensitive_fraction")]
    pub sensitive_fraction: f64,

    #[serde(default)]
    pub sensitive_locations: Vec<SensitiveLocation>,
}

impl Default for GeographicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_located: default_min_located(),
            tightness_ratio: default_tightness_ratio(),
            sensitive_fraction: default_sensitive_fraction(),
            sensitive_locations: Vec::new(),
        }
    }
}

fn default_min_located() -> usize {
    3
}

fn default_tightness_ratio() -> f64 {
    0.25
}

fn default_sensitive_fraction() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sliding window width, in seconds.
    #[serde(default = "default_burst_window_secs")]
    pub window_secs: i64,

    /// Identifiers with fewer incidents are excluded.
    #[serde(default = "default_min_incidents")]
    pub min_incidents: usize,

    /// A burst needs at least this many incidents in one window.
    #[serde(default = "default_min_burst_count")]
    pub min_burst_count: usize,

    /// Observed-over-expected ratio that counts as a burst.
    #[serde(default = "default_burst_ratio")]
    pub burst_ratio: f64,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: default_burst_window_secs(),
            min_incidents: default_min_incidents(),
            min_burst_count: default_min_burst_count(),
            burst_ratio: default_burst_ratio(),
        }
    }
}

fn default_burst_window_secs() -> i64 {
    3600
}

fn default_min_burst_count() -> usize {
    3
}

fn default_burst_ratio() -> f64 {
    3.0
}

/// Caller-supplied identity mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Device source id (e.g. radio MAC) to officer identifier.
    #[serde(default)]
    pub devices: BTreeMap<String, String>,

    /// Alternate identifier to canonical identifier.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachConfig {
    /// Largest gap between an incident and an estimate attached to it, in seconds.
    #[serde(default = "default_max_skew_secs")]
    pub max_skew_secs: i64,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            max_skew_secs: default_max_skew_secs(),
        }
    }
}

fn default_max_skew_secs() -> i64 {
    300
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when they were given explicitly.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(frame) = args.frame {
            self.general.frame = frame;
        }

        if let Some(window) = args.window_secs() {
            self.estimator.window_secs = window;
        }

        if let Some(k) = args.k() {
            self.analyzer.high_frequency.k = k;
        }

        if let Some(output) = args.output() {
            self.general.output = output.display().to_string();
        }

        if args.verbose {
            self.general.verbose = true;
        }

        self.analyzer.frame = self.general.frame;
    }

    /// Reject constants the estimator or analyzer cannot work with.
    pub fn validate(&self) -> Result<()> {
        let est = &self.estimator;

        if !positive(est.path_loss_exponent) {
            bail!("estimator.path_loss_exponent must be positive");
        }
        if !positive(est.noise_variance) {
            bail!("estimator.noise_variance must be positive");
        }
        if !positive(est.min_range) || est.max_range <= est.min_range {
            bail!("estimator ranges must satisfy 0 < min_range < max_range");
        }
        if est.window_secs == 0 || est.window_secs > MAX_WINDOW_SECS {
            bail!("estimator.window_secs must be between 1 and {}", MAX_WINDOW_SECS);
        }
        if est.max_iterations == 0 {
            bail!("estimator.max_iterations must be at least 1");
        }
        if !(0.0..1.0).contains(&est.min_aspect_ratio) {
            bail!("estimator.min_aspect_ratio must be in [0, 1)");
        }
        est.confidence.validate()?;

        let an = &self.analyzer;
        if !(an.high_frequency.k.is_finite() && an.high_frequency.k >= 0.0) {
            bail!("analyzer.high_frequency.k must be non-negative");
        }
        if an.high_frequency.min_span_minutes <= 0
            || an.high_frequency.min_span_minutes > MAX_ANALYSIS_SECS / 60
        {
            bail!("analyzer.high_frequency.min_span_minutes out of range");
        }
        if !positive(an.high_frequency.min_std_dev) {
            bail!("analyzer.high_frequency.min_std_dev must be positive");
        }
        if !fraction(an.geographic.tightness_ratio) {
            bail!("analyzer.geographic.tightness_ratio must be in (0, 1]");
        }
        if !fraction(an.geographic.sensitive_fraction) {
            bail!("analyzer.geographic.sensitive_fraction must be in (0, 1]");
        }
        for place in &an.geographic.sensitive_locations {
            if !positive(place.radius) || !place.position.is_finite() {
                bail!("sensitive location '{}' needs a positive radius", place.name);
            }
        }
        if an.temporal.window_secs <= 0 || an.temporal.window_secs > MAX_ANALYSIS_SECS {
            bail!(
                "analyzer.temporal.window_secs must be between 1 and {}",
                MAX_ANALYSIS_SECS
            );
        }
        if !(an.temporal.burst_ratio.is_finite() && an.temporal.burst_ratio > 1.0) {
            bail!("analyzer.temporal.burst_ratio must exceed 1");
        }

        if self.attach.max_skew_secs < 0 || self.attach.max_skew_secs > MAX_ANALYSIS_SECS {
            bail!("attach.max_skew_secs out of range");
        }

        Ok(())
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn fraction(value: f64) -> bool {
    value > 0.0 && value <= 1.0
}
