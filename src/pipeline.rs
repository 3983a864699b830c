//! End-to-end run: measurements to estimates, incidents to profiles, and
//! profiles to flags.
//!
//! Per-window estimation and per-identifier aggregation run on tokio's
//! blocking pool. Results are re-sorted by key afterwards, so output never
//! depends on scheduling order.

use crate::analysis::{aggregate, analyze, group_by_identifier};
use crate::config::Config;
use crate::estimator::PositionEstimator;
use crate::models::{
    AccountabilityReport, ActivityProfile, IncidentRecord, Measurement, PositionEstimate,
    ReportMetadata, ReportType, UnresolvedSource,
};
use crate::registry::OfficerRegistry;
use crate::report::restrict_to_officer;
use crate::sources::{IncidentSource, MeasurementSource};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Concurrent blocking tasks in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Estimates and failures from one locate pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocateOutcome {
    /// Every fix, one per resolved window, by source then time.
    pub track: Vec<PositionEstimate>,
    /// The newest fix per source.
    pub estimates: Vec<PositionEstimate>,
    /// Sources with no resolvable window at all.
    pub unresolved: Vec<UnresolvedSource>,
}

/// Measurements per source id.
pub fn group_by_source(measurements: &[Measurement]) -> BTreeMap<String, Vec<Measurement>> {
    let mut grouped: BTreeMap<String, Vec<Measurement>> = BTreeMap::new();
    for m in measurements {
        grouped.entry(m.source_id.clone()).or_default().push(m.clone());
    }
    grouped
}

/// Cut one source's readings into successive windows, oldest first.
///
/// A window opens at its oldest reading and takes every reading up to
/// `window` later; the first reading past that opens the next one.
pub fn split_windows(mut batch: Vec<Measurement>, window: Duration) -> Vec<Vec<Measurement>> {
    batch.sort_by_key(|m| m.timestamp);

    let mut windows: Vec<Vec<Measurement>> = Vec::new();
    for m in batch {
        match windows.last_mut() {
            Some(current) if m.timestamp - current[0].timestamp <= window => current.push(m),
            _ => windows.push(vec![m]),
        }
    }
    windows
}

/// Collapse estimates to the newest one per source.
pub fn newest_per_source(
    estimates: impl IntoIterator<Item = PositionEstimate>,
) -> Vec<PositionEstimate> {
    let mut newest: BTreeMap<String, PositionEstimate> = BTreeMap::new();

    for estimate in estimates {
        match newest.get(&estimate.source_id) {
            Some(current) if !estimate.supersedes(current) => {}
            _ => {
                newest.insert(estimate.source_id.clone(), estimate);
            }
        }
    }

    newest.into_values().collect()
}

fn progress_bar(len: usize, show: bool) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} sources")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Estimate every window of every source.
pub async fn locate_all(
    estimator: Arc<PositionEstimator>,
    measurements: &[Measurement],
    show_progress: bool,
) -> Result<LocateOutcome> {
    let window = estimator.window();
    let jobs: Vec<(String, Vec<Measurement>)> = group_by_source(measurements)
        .into_iter()
        .flat_map(|(source_id, batch)| {
            split_windows(batch, window)
                .into_iter()
                .map(move |w| (source_id.clone(), w))
        })
        .collect();
    let pb = progress_bar(jobs.len(), show_progress);

    let results: Vec<_> = stream::iter(jobs.into_iter().map(|(source_id, batch)| {
        let estimator = Arc::clone(&estimator);
        tokio::task::spawn_blocking(move || {
            let opened = batch.first().map(|m| m.timestamp);
            let count = batch.len();
            (source_id, opened, count, estimator.estimate(&batch, window))
        })
    }))
    .buffer_unordered(DEFAULT_CONCURRENCY)
    .inspect(|_| pb.inc(1))
    .collect()
    .await;

    pb.finish_and_clear();

    let mut track = Vec::new();
    let mut failures: BTreeMap<String, Vec<(Option<DateTime<Utc>>, usize, String)>> =
        BTreeMap::new();

    for joined in results {
        let (source_id, opened, measurement_count, result) = joined?;
        match result {
            Ok(estimate) => track.push(estimate),
            Err(e) => {
                if e.is_unresolvable() {
                    debug!("Source {} window unresolved: {}", source_id, e);
                } else {
                    warn!("Source {} window rejected: {}", source_id, e);
                }
                failures
                    .entry(source_id)
                    .or_default()
                    .push((opened, measurement_count, e.to_string()));
            }
        }
    }

    track.sort_by(|a, b| {
        a.source_id
            .cmp(&b.source_id)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });
    let located: BTreeSet<&str> = track.iter().map(|e| e.source_id.as_str()).collect();

    let unresolved: Vec<UnresolvedSource> = failures
        .into_iter()
        .filter(|(source_id, _)| !located.contains(source_id.as_str()))
        .filter_map(|(source_id, mut windows)| {
            windows.sort();
            let measurement_count = windows.iter().map(|(_, count, _)| count).sum();
            windows.pop().map(|(_, _, reason)| UnresolvedSource {
                source_id,
                measurement_count,
                reason,
            })
        })
        .collect();

    let estimates = newest_per_source(track.iter().cloned());

    info!(
        "Located {} sources from {} fixes ({} unresolved)",
        estimates.len(),
        track.len(),
        unresolved.len()
    );

    Ok(LocateOutcome {
        track,
        estimates,
        unresolved,
    })
}

/// Give unlocated incidents a fix from one of their officer's devices.
///
/// `estimates` is the whole track, so an incident picks up where the
/// officer was around its own time. The candidate closest in time within
/// `max_skew` wins; on a tie the
/// earlier estimate is preferred. Incidents that already carry a location
/// are left alone.
pub fn attach_locations(
    incidents: &[IncidentRecord],
    estimates: &[PositionEstimate],
    registry: &OfficerRegistry,
    max_skew: Duration,
) -> Vec<IncidentRecord> {
    let mut by_officer: BTreeMap<&str, Vec<&PositionEstimate>> = BTreeMap::new();
    for estimate in estimates {
        if let Some(officer) = registry.officer_for_device(&estimate.source_id) {
            by_officer.entry(officer).or_default().push(estimate);
        }
    }

    let mut attached = 0usize;
    let records = incidents
        .iter()
        .map(|incident| {
            if incident.location.is_some() {
                return incident.clone();
            }

            let officer = registry.canonical(&incident.identifier);
            let best = by_officer.get(officer).and_then(|candidates| {
                candidates
                    .iter()
                    .map(|e| ((e.timestamp - incident.timestamp).abs(), *e))
                    .filter(|(skew, _)| *skew <= max_skew)
                    .min_by(|(sa, a), (sb, b)| {
                        sa.cmp(sb)
                            .then_with(|| a.timestamp.cmp(&b.timestamp))
                            .then_with(|| a.source_id.cmp(&b.source_id))
                    })
                    .map(|(_, e)| e)
            });

            let mut record = incident.clone();
            if let Some(estimate) = best {
                attached += 1;
                record.location = Some(estimate.clone());
            }
            record
        })
        .collect();

    debug!("Attached locations to {} incidents", attached);
    records
}

/// Aggregate every identifier concurrently, sorted by identifier.
pub async fn aggregate_concurrently(
    records: &[IncidentRecord],
    registry: &OfficerRegistry,
) -> Result<Vec<ActivityProfile>> {
    let groups = group_by_identifier(records, registry);

    let joined: Vec<_> = stream::iter(groups.into_iter().map(|(identifier, records)| {
        tokio::task::spawn_blocking(move || aggregate(&identifier, &records))
    }))
    .buffer_unordered(DEFAULT_CONCURRENCY)
    .collect()
    .await;

    let mut profiles = joined.into_iter().collect::<Result<Vec<_>, _>>()?;
    profiles.sort_by(|a, b| a.identifier.cmp(&b.identifier));

    Ok(profiles)
}

/// A configured run over the given sources.
pub struct Pipeline {
    config: Config,
    registry: OfficerRegistry,
    estimator: Arc<PositionEstimator>,
    show_progress: bool,
}

impl Pipeline {
    pub fn new(config: Config, show_progress: bool) -> Self {
        let registry = OfficerRegistry::from(&config.registry);
        debug!("Registry holds {} devices", registry.device_count());
        let estimator = Arc::new(PositionEstimator::new(
            &config.estimator,
            config.general.frame,
        ));

        Self {
            config,
            registry,
            estimator,
            show_progress,
        }
    }

    /// Estimate every source in `source`.
    pub async fn locate(&self, source: &dyn MeasurementSource) -> Result<AccountabilityReport> {
        let start = Instant::now();
        let measurements = source.measurements()?;

        let located = locate_all(
            Arc::clone(&self.estimator),
            &measurements,
            self.show_progress,
        )
        .await?;

        let mut metadata = ReportMetadata::new(ReportType::Locate);
        metadata.measurements_read = measurements.len();
        metadata.duration_seconds = start.elapsed().as_secs_f64();

        let mut report = AccountabilityReport::new(metadata);
        report.estimates = located.estimates;
        report.unresolved = located.unresolved;
        Ok(report)
    }

    /// Activity profiles without anomaly analysis.
    pub async fn profile(
        &self,
        incidents: &dyn IncidentSource,
        officer: Option<&str>,
    ) -> Result<AccountabilityReport> {
        let start = Instant::now();
        let records = incidents.incidents()?;
        let profiles = aggregate_concurrently(&records, &self.registry).await?;

        let mut metadata = ReportMetadata::new(ReportType::Profile);
        metadata.incidents_read = records.len();
        metadata.duration_seconds = start.elapsed().as_secs_f64();

        let mut report = AccountabilityReport::new(metadata);
        report.profiles = profiles;
        Ok(self.scoped(report, officer))
    }

    /// Locate, attach, aggregate and analyze.
    ///
    /// Analysis always sees the whole population; `officer` only narrows
    /// what ends up in the report.
    pub async fn analyze(
        &self,
        measurements: &dyn MeasurementSource,
        incidents: &dyn IncidentSource,
        officer: Option<&str>,
    ) -> Result<AccountabilityReport> {
        let start = Instant::now();

        let measurements = measurements.measurements()?;
        let located = locate_all(
            Arc::clone(&self.estimator),
            &measurements,
            self.show_progress,
        )
        .await?;

        let records = incidents.incidents()?;
        let records = attach_locations(
            &records,
            &located.track,
            &self.registry,
            Duration::seconds(self.config.attach.max_skew_secs),
        );

        let profiles = aggregate_concurrently(&records, &self.registry).await?;
        let outcome = analyze(&profiles, &self.config.analyzer);

        let mut metadata = ReportMetadata::new(ReportType::Analyze);
        metadata.measurements_read = measurements.len();
        metadata.incidents_read = records.len();
        metadata.duration_seconds = start.elapsed().as_secs_f64();

        let mut report = AccountabilityReport::new(metadata).with_outcome(outcome);
        report.profiles = profiles;
        report.estimates = located.estimates;
        report.unresolved = located.unresolved;

        Ok(self.scoped(report, officer))
    }

    fn scoped(&self, report: AccountabilityReport, officer: Option<&str>) -> AccountabilityReport {
        match officer {
            Some(officer) => restrict_to_officer(report, officer, &self.registry),
            None => report,
        }
    }
}
