//! Data models for the estimation and analysis engine.
//!
//! This module contains the records supplied by the collectors
//! (measurements, incidents) and the structures derived from them
//! (position estimates, activity profiles, anomaly flags).
//!
//! Every output type serializes with camelCase field names so downstream
//! consumers see `sourceId`, `incidentCounts`, `firstSeen` and so on.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A position in either the planar or the geodetic frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "PointRepr")]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance; only meaningful in a planar frame.
    pub fn distance_to(&self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Accepts both `{"x": .., "y": ..}` and the collectors' `[a, b]` tuples.
#[derive(Deserialize)]
#[serde(untagged)]
enum PointRepr {
    Named { x: f64, y: f64 },
    Pair(f64, f64),
}

impl From<PointRepr> for Point {
    fn from(repr: PointRepr) -> Self {
        match repr {
            PointRepr::Named { x, y } | PointRepr::Pair(x, y) => Point::new(x, y),
        }
    }
}

/// A single signal-strength reading of one source at one receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    /// Transmitter identifier (typically a device MAC address).
    #[serde(alias = "mac")]
    pub source_id: String,
    /// Where the receiver was when the reading was taken.
    #[serde(alias = "position")]
    pub receiver_position: Point,
    /// Received signal strength in dBm.
    #[serde(alias = "signal_strength")]
    pub signal_strength: f64,
    pub timestamp: DateTime<Utc>,
}

/// Estimated location of a signal source.
///
/// Estimates are never edited; a fresher one supersedes the old one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionEstimate {
    pub source_id: String,
    pub position: Point,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// The measurements the fix was computed from, oldest first.
    pub contributing_measurements: Vec<Measurement>,
    /// Timestamp of the newest contributing measurement.
    pub timestamp: DateTime<Utc>,
}

impl PositionEstimate {
    /// Whether this estimate replaces `other` for the same source.
    pub fn supersedes(&self, other: &PositionEstimate) -> bool {
        self.source_id == other.source_id && self.timestamp > other.timestamp
    }
}

/// Kind of incident reported over the air.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "String")]
pub enum IncidentType {
    TrafficStop,
    Arrest,
    NoiseComplaint,
    Other,
}

impl fmt::Display for IncidentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncidentType::TrafficStop => write!(f, "Traffic Stop"),
            IncidentType::Arrest => write!(f, "Arrest"),
            IncidentType::NoiseComplaint => write!(f, "Noise Complaint"),
            IncidentType::Other => write!(f, "Other"),
        }
    }
}

impl From<&str> for IncidentType {
    fn from(s: &str) -> Self {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "trafficstop" => IncidentType::TrafficStop,
            "arrest" => IncidentType::Arrest,
            "noisecomplaint" => IncidentType::NoiseComplaint,
            _ => IncidentType::Other,
        }
    }
}

impl From<String> for IncidentType {
    fn from(s: String) -> Self {
        IncidentType::from(s.as_str())
    }
}

/// One incident attributed to an identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentRecord {
    /// Officer or device identifier.
    #[serde(alias = "officer_id")]
    pub identifier: String,
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "incident_type")]
    pub incident_type: IncidentType,
    #[serde(default, deserialize_with = "lenient_location")]
    pub location: Option<PositionEstimate>,
}

/// Legacy incident files carry free-text locations ("Main St and 5th Ave");
/// anything that is not a position estimate is treated as unknown.
fn lenient_location<'de, D>(deserializer: D) -> Result<Option<PositionEstimate>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum LocationRepr {
        Estimate(PositionEstimate),
        Unknown(serde::de::IgnoredAny),
    }

    Ok(match Option::<LocationRepr>::deserialize(deserializer)? {
        Some(LocationRepr::Estimate(estimate)) => Some(estimate),
        _ => None,
    })
}

/// Reference to an incident record by its (identifier, timestamp) key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentRef {
    pub identifier: String,
    pub timestamp: DateTime<Utc>,
}

/// A located incident inside an activity profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocatedIncident {
    pub position: Point,
    pub timestamp: DateTime<Utc>,
}

/// Per-identifier activity derived from incident records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityProfile {
    pub identifier: String,
    pub incident_counts: BTreeMap<IncidentType, u64>,
    /// Located incidents, in input order.
    pub locations: Vec<LocatedIncident>,
    /// Timestamps of every incident, located or not, in input order.
    pub incident_times: Vec<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl ActivityProfile {
    /// Profile of an identifier with no incidents yet.
    pub fn empty(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            incident_counts: BTreeMap::new(),
            locations: Vec::new(),
            incident_times: Vec::new(),
            first_seen: None,
            last_seen: None,
        }
    }

    pub fn total_incidents(&self) -> u64 {
        self.incident_counts.values().sum()
    }

    pub fn count(&self, incident_type: IncidentType) -> u64 {
        self.incident_counts
            .get(&incident_type)
            .copied()
            .unwrap_or(0)
    }

    /// Time between the first and last incident.
    pub fn active_span(&self) -> Option<Duration> {
        match (self.first_seen, self.last_seen) {
            (Some(first), Some(last)) => Some(last - first),
            _ => None,
        }
    }

    /// Evidence references for a set of incident timestamps.
    pub fn refs<'a, I>(&self, times: I) -> Vec<IncidentRef>
    where
        I: IntoIterator<Item = &'a DateTime<Utc>>,
    {
        times
            .into_iter()
            .map(|t| IncidentRef {
                identifier: self.identifier.clone(),
                timestamp: *t,
            })
            .collect()
    }
}

/// Detector that raised an anomaly flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnomalyKind {
    HighFrequency,
    GeographicCluster,
    TemporalCluster,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyKind::HighFrequency => write!(f, "High Frequency"),
            AnomalyKind::GeographicCluster => write!(f, "Geographic Cluster"),
            AnomalyKind::TemporalCluster => write!(f, "Temporal Cluster"),
        }
    }
}

/// A scored signal that an identifier deviates from the population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyFlag {
    pub identifier: String,
    pub kind: AnomalyKind,
    /// Severity; higher is more anomalous. Comparable within one kind only.
    pub score: f64,
    /// The incident records that produced the flag.
    pub evidence: Vec<IncidentRef>,
    /// Extra context, e.g. the sensitive location involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// An identifier left out of a detector for lack of data.
///
/// This is a policy outcome and is reported separately from flags so that
/// "not enough data" never reads as "nothing unusual".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exclusion {
    pub identifier: String,
    pub detector: AnomalyKind,
    pub required: usize,
    pub available: usize,
}

/// Result of one analysis run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOutcome {
    pub flags: Vec<AnomalyFlag>,
    pub exclusions: Vec<Exclusion>,
}

#[cfg(test)]
impl AnalysisOutcome {
    /// Flags raised for one identifier.
    pub fn flags_for<'a>(&'a self, identifier: &'a str) -> impl Iterator<Item = &'a AnomalyFlag> {
        self.flags.iter().filter(move |f| f.identifier == identifier)
    }

    pub fn is_excluded(&self, identifier: &str, detector: AnomalyKind) -> bool {
        self.exclusions
            .iter()
            .any(|e| e.identifier == identifier && e.detector == detector)
    }
}

/// A source none of whose measurement windows could be turned into a fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnresolvedSource {
    pub source_id: String,
    pub measurement_count: usize,
    pub reason: String,
}

/// Which command produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReportType {
    Locate,
    Profile,
    Analyze,
}

/// Flag counts per detector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagSummary {
    pub total: usize,
    pub high_frequency: usize,
    pub geographic_cluster: usize,
    pub temporal_cluster: usize,
    /// Distinct identifiers with at least one flag.
    pub flagged_identifiers: usize,
}

impl FlagSummary {
    pub fn from_flags(flags: &[AnomalyFlag]) -> Self {
        let mut summary = Self {
            total: flags.len(),
            ..Self::default()
        };

        for flag in flags {
            match flag.kind {
                AnomalyKind::HighFrequency => summary.high_frequency += 1,
                AnomalyKind::GeographicCluster => summary.geographic_cluster += 1,
                AnomalyKind::TemporalCluster => summary.temporal_cluster += 1,
            }
        }

        let identifiers: std::collections::BTreeSet<&str> =
            flags.iter().map(|f| f.identifier.as_str()).collect();
        summary.flagged_identifiers = identifiers.len();

        summary
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMetadata {
    pub report_type: ReportType,
    pub generated_at: DateTime<Utc>,
    pub tool_version: String,
    /// Restricts profiles and flags to one identifier when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub officer: Option<String>,
    pub measurements_read: usize,
    pub incidents_read: usize,
    pub duration_seconds: f64,
}

impl ReportMetadata {
    pub fn new(report_type: ReportType) -> Self {
        Self {
            report_type,
            generated_at: Utc::now(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            officer: None,
            measurements_read: 0,
            incidents_read: 0,
            duration_seconds: 0.0,
        }
    }
}

/// Everything one run produced, ready to serialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountabilityReport {
    pub metadata: ReportMetadata,
    pub summary: FlagSummary,
    pub estimates: Vec<PositionEstimate>,
    pub unresolved: Vec<UnresolvedSource>,
    pub profiles: Vec<ActivityProfile>,
    pub flags: Vec<AnomalyFlag>,
    pub exclusions: Vec<Exclusion>,
}

impl AccountabilityReport {
    pub fn new(metadata: ReportMetadata) -> Self {
        Self {
            metadata,
            summary: FlagSummary::default(),
            estimates: Vec::new(),
            unresolved: Vec::new(),
            profiles: Vec::new(),
            flags: Vec::new(),
            exclusions: Vec::new(),
        }
    }

    /// Attach analysis results and refresh the summary.
    pub fn with_outcome(mut self, outcome: AnalysisOutcome) -> Self {
        self.summary = FlagSummary::from_flags(&outcome.flags);
        self.flags = outcome.flags;
        self.exclusions = outcome.exclusions;
        self
    }
}
