//! Pattern analysis over activity profiles.
//!
//! Three detectors, each toggled by configuration:
//!
//! - **High frequency**: incident rate more than `k` standard deviations
//!   above the mean of every other identifier's rate.
//! - **Geographic cluster**: locations far tighter than the population's
//!   median dispersion, or concentrated around a configured sensitive
//!   location.
//! - **Temporal cluster**: a sliding window holding far more incidents than
//!   a uniform spread over the identifier's active span would put there.
//!
//! Profiles are sorted by identifier before any population statistic is
//! computed and flags are sorted on the way out, so the result does not
//! depend on input order. Nothing here reads the clock.

use crate::config::{AnalyzerConfig, GeographicConfig, HighFrequencyConfig, TemporalConfig};
use crate::geo::CoordinateFrame;
use crate::models::{
    ActivityProfile, AnalysisOutcome, AnomalyFlag, AnomalyKind, Exclusion, LocatedIncident,
};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

/// Flag anomalous identifiers among `profiles`.
pub fn analyze(profiles: &[ActivityProfile], config: &AnalyzerConfig) -> AnalysisOutcome {
    let mut ordered: Vec<&ActivityProfile> = profiles
        .iter()
        .filter(|p| p.total_incidents() > 0)
        .collect();
    ordered.sort_by(|a, b| {
        a.identifier
            .cmp(&b.identifier)
            .then_with(|| a.total_incidents().cmp(&b.total_incidents()))
            .then_with(|| a.first_seen.cmp(&b.first_seen))
            .then_with(|| a.locations.len().cmp(&b.locations.len()))
    });

    let mut outcome = AnalysisOutcome::default();

    if config.high_frequency.enabled {
        detect_high_frequency(&ordered, &config.high_frequency, &mut outcome);
    }
    if config.geographic.enabled {
        detect_geographic_clusters(&ordered, &config.geographic, config.frame, &mut outcome);
        detect_sensitive_locations(&ordered, &config.geographic, config.frame, &mut outcome);
    }
    if config.temporal.enabled {
        detect_temporal_clusters(&ordered, &config.temporal, &mut outcome);
    }

    outcome.flags.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then_with(|| b.score.total_cmp(&a.score))
            .then_with(|| a.identifier.cmp(&b.identifier))
            .then_with(|| a.detail.cmp(&b.detail))
    });
    outcome.exclusions.sort_by(|a, b| {
        a.identifier
            .cmp(&b.identifier)
            .then_with(|| a.detector.cmp(&b.detector))
    });

    info!(
        "Analyzed {} profiles: {} flags, {} exclusions",
        ordered.len(),
        outcome.flags.len(),
        outcome.exclusions.len()
    );

    outcome
}

/// Incidents per hour over the active span, with `min_span` as a floor.
pub fn incident_rate(profile: &ActivityProfile, min_span: Duration) -> Option<f64> {
    let total = profile.total_incidents();
    if total == 0 {
        return None;
    }
    let span = profile.active_span()?.max(min_span);
    let hours = span.num_milliseconds() as f64 / 3_600_000.0;
    if hours <= 0.0 {
        return None;
    }
    Some(total as f64 / hours)
}

/// Mean of pairwise distances between an identifier's located incidents.
pub fn dispersion(locations: &[LocatedIncident], frame: CoordinateFrame) -> Option<f64> {
    if locations.len() < 2 {
        return None;
    }

    let mut sum = 0.0;
    let mut pairs = 0usize;
    for (i, a) in locations.iter().enumerate() {
        for b in &locations[i + 1..] {
            sum += frame.distance(a.position, b.position);
            pairs += 1;
        }
    }
    Some(sum / pairs as f64)
}

/// Population mean and standard deviation.
fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn exclude(
    outcome: &mut AnalysisOutcome,
    profile: &ActivityProfile,
    detector: AnomalyKind,
    required: usize,
    available: usize,
) {
    outcome.exclusions.push(Exclusion {
        identifier: profile.identifier.clone(),
        detector,
        required,
        available,
    });
}

fn detect_high_frequency(
    profiles: &[&ActivityProfile],
    config: &HighFrequencyConfig,
    outcome: &mut AnalysisOutcome,
) {
    let min_span = Duration::minutes(config.min_span_minutes);
    let mut rated: Vec<(&ActivityProfile, f64)> = Vec::new();

    for &profile in profiles {
        let total = profile.total_incidents() as usize;
        if total < config.min_incidents {
            exclude(outcome, profile, AnomalyKind::HighFrequency, config.min_incidents, total);
            continue;
        }
        if let Some(rate) = incident_rate(profile, min_span) {
            rated.push((profile, rate));
        }
    }

    if rated.len() < 3 {
        debug!("High-frequency detector needs a population, have {}", rated.len());
        return;
    }

    let rates: Vec<f64> = rated.iter().map(|(_, rate)| *rate).collect();

    for (i, (profile, rate)) in rated.iter().enumerate() {
        let others: Vec<f64> = rates
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, r)| *r)
            .collect();
        let (mean, std_dev) = mean_std(&others);
        let std_dev = std_dev.max(config.min_std_dev);

        if *rate > mean + config.k * std_dev {
            outcome.flags.push(AnomalyFlag {
                identifier: profile.identifier.clone(),
                kind: AnomalyKind::HighFrequency,
                score: (rate - mean) / std_dev,
                evidence: profile.refs(&profile.incident_times),
                detail: Some(format!(
                    "{:.2} incidents/hour against a mean of {:.2} for the other {}",
                    rate,
                    mean,
                    others.len()
                )),
            });
        }
    }
}

fn detect_geographic_clusters(
    profiles: &[&ActivityProfile],
    config: &GeographicConfig,
    frame: CoordinateFrame,
    outcome: &mut AnalysisOutcome,
) {
    let mut dispersed: Vec<(&ActivityProfile, f64)> = Vec::new();

    for &profile in profiles {
        let located = profile.locations.len();
        if located < config.min_located.max(2) {
            exclude(
                outcome,
                profile,
                AnomalyKind::GeographicCluster,
                config.min_located.max(2),
                located,
            );
            continue;
        }
        if let Some(value) = dispersion(&profile.locations, frame) {
            dispersed.push((profile, value));
        }
    }

    if dispersed.len() < 2 {
        debug!("Geographic detector needs a population, have {}", dispersed.len());
        return;
    }

    let values: Vec<f64> = dispersed.iter().map(|(_, d)| *d).collect();
    let norm = median(&values);
    if norm <= 0.0 {
        return;
    }

    for (profile, value) in dispersed {
        if value <= config.tightness_ratio * norm {
            outcome.flags.push(AnomalyFlag {
                identifier: profile.identifier.clone(),
                kind: AnomalyKind::GeographicCluster,
                score: 1.0 - value / norm,
                evidence: profile.refs(profile.locations.iter().map(|l| &l.timestamp)),
                detail: Some(format!(
                    "mean spread {:.1} m against a population median of {:.1} m",
                    value, norm
                )),
            });
        }
    }
}

fn detect_sensitive_locations(
    profiles: &[&ActivityProfile],
    config: &GeographicConfig,
    frame: CoordinateFrame,
    outcome: &mut AnalysisOutcome,
) {
    if config.sensitive_locations.is_empty() {
        return;
    }

    for &profile in profiles {
        let located = profile.locations.len();
        // Already excluded by the dispersion pass.
        if located < config.min_located.max(2) {
            continue;
        }

        for place in &config.sensitive_locations {
            let inside: Vec<&DateTime<Utc>> = profile
                .locations
                .iter()
                .filter(|l| frame.distance(l.position, place.position) <= place.radius)
                .map(|l| &l.timestamp)
                .collect();
            let fraction = inside.len() as f64 / located as f64;

            if !inside.is_empty() && fraction >= config.sensitive_fraction {
                outcome.flags.push(AnomalyFlag {
                    identifier: profile.identifier.clone(),
                    kind: AnomalyKind::GeographicCluster,
                    score: fraction,
                    evidence: profile.refs(inside.iter().copied()),
                    detail: Some(format!(
                        "{} of {} located incidents within {:.0} m of {}",
                        inside.len(),
                        located,
                        place.radius,
                        place.name
                    )),
                });
            }
        }
    }
}

/// Densest window of width `window` over sorted `times`: (start index, count).
///
/// The earliest window wins ties.
fn densest_window(times: &[DateTime<Utc>], window: Duration) -> (usize, usize) {
    let mut best = (0, 0);
    let mut end = 0;

    for start in 0..times.len() {
        if end < start {
            end = start;
        }
        while end < times.len() && times[end] - times[start] <= window {
            end += 1;
        }
        if end - start > best.1 {
            best = (start, end - start);
        }
    }

    best
}

fn detect_temporal_clusters(
    profiles: &[&ActivityProfile],
    config: &TemporalConfig,
    outcome: &mut AnalysisOutcome,
) {
    let window = Duration::seconds(config.window_secs);

    for &profile in profiles {
        let total = profile.incident_times.len();
        if total < config.min_incidents {
            exclude(outcome, profile, AnomalyKind::TemporalCluster, config.min_incidents, total);
            continue;
        }

        let mut times = profile.incident_times.clone();
        times.sort();

        let span = times[total - 1] - times[0];
        if span <= window {
            // One window covers everything; nothing can stand out.
            continue;
        }

        let (start, count) = densest_window(&times, window);
        let expected = total as f64 * window.num_milliseconds() as f64 / span.num_milliseconds() as f64;
        let ratio = count as f64 / expected;

        if count >= config.min_burst_count && ratio >= config.burst_ratio {
            outcome.flags.push(AnomalyFlag {
                identifier: profile.identifier.clone(),
                kind: AnomalyKind::TemporalCluster,
                score: ratio,
                evidence: profile.refs(&times[start..start + count]),
                detail: Some(format!(
                    "{} of {} incidents within {}s starting {}",
                    count,
                    total,
                    config.window_secs,
                    times[start].to_rfc3339()
                )),
            });
        }
    }
}

/// Flags of one kind, most anomalous first.
pub fn rank(flags: &[AnomalyFlag], kind: AnomalyKind) -> Vec<&AnomalyFlag> {
    let mut ranked: Vec<&AnomalyFlag> = flags.iter().filter(|f| f.kind == kind).collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::aggregator::aggregate;
    use crate::config::SensitiveLocation;
    use crate::models::{IncidentRecord, IncidentType, Point, PositionEstimate};
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn record(identifier: &str, offset_secs: i64, position: Option<Point>) -> IncidentRecord {
        let timestamp = base() + Duration::seconds(offset_secs);
        IncidentRecord {
            identifier: identifier.to_string(),
            timestamp,
            incident_type: IncidentType::TrafficStop,
            location: position.map(|position| PositionEstimate {
                source_id: "00:1A:2B:3C:4D:5E".to_string(),
                position,
                confidence: 0.9,
                contributing_measurements: Vec::new(),
                timestamp,
            }),
        }
    }

    /// `count` unlocated incidents spaced `interval_secs` apart.
    fn steady(identifier: &str, count: i64, interval_secs: i64) -> ActivityProfile {
        let records: Vec<_> = (0..count)
            .map(|i| record(identifier, i * interval_secs, None))
            .collect();
        aggregate(identifier, &records)
    }

    fn at_offsets(identifier: &str, offsets: &[i64]) -> ActivityProfile {
        let records: Vec<_> = offsets.iter().map(|o| record(identifier, *o, None)).collect();
        aggregate(identifier, &records)
    }

    fn located(identifier: &str, positions: &[Point]) -> ActivityProfile {
        let records: Vec<_> = positions
            .iter()
            .enumerate()
            .map(|(i, p)| record(identifier, i as i64 * 86_400, Some(*p)))
            .collect();
        aggregate(identifier, &records)
    }

    fn square(origin: Point, side: f64) -> Vec<Point> {
        vec![
            origin,
            Point::new(origin.x + side, origin.y),
            Point::new(origin.x, origin.y + side),
            Point::new(origin.x + side, origin.y + side),
        ]
    }

    /// Baseline officers at roughly 2/hour, one at 50/hour, one at 5/hour.
    fn frequency_population(baseline: usize) -> Vec<ActivityProfile> {
        let mut profiles: Vec<_> = (0..baseline)
            .map(|i| steady(&format!("b{:02}", i), 10, 1800))
            .collect();
        profiles.push(steady("fast", 50, 72));
        profiles.push(steady("mid", 20, 720));
        profiles
    }

    fn only(kind: AnomalyKind) -> AnalyzerConfig {
        let mut config = AnalyzerConfig::default();
        config.high_frequency.enabled = kind == AnomalyKind::HighFrequency;
        config.geographic.enabled = kind == AnomalyKind::GeographicCluster;
        config.temporal.enabled = kind == AnomalyKind::TemporalCluster;
        config
    }

    #[test]
    fn test_high_frequency_flags_outlier() {
        let outcome = analyze(&frequency_population(10), &only(AnomalyKind::HighFrequency));

        let flagged: Vec<&str> = outcome.flags.iter().map(|f| f.identifier.as_str()).collect();
        assert_eq!(flagged, vec!["fast"]);

        let flag = &outcome.flags[0];
        assert_eq!(flag.kind, AnomalyKind::HighFrequency);
        assert!(flag.score > 2.0);
        assert_eq!(flag.evidence.len(), 50);
    }

    #[test]
    fn test_high_frequency_score_ranks_rates() {
        let mut config = only(AnomalyKind::HighFrequency);
        config.high_frequency.k = 0.0;

        let outcome = analyze(&frequency_population(30), &config);
        let ranked = rank(&outcome.flags, AnomalyKind::HighFrequency);

        let ids: Vec<&str> = ranked.iter().map(|f| f.identifier.as_str()).collect();
        assert_eq!(ids, vec!["fast", "mid"]);
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn test_uniform_rates_are_not_flagged() {
        let profiles: Vec<_> = (0..5).map(|i| steady(&format!("u{}", i), 10, 600)).collect();
        let outcome = analyze(&profiles, &only(AnomalyKind::HighFrequency));
        assert!(outcome.flags.is_empty());
    }

    #[test]
    fn test_high_frequency_small_population() {
        for baseline in [3, 4] {
            let mut profiles: Vec<_> = (0..baseline)
                .map(|i| steady(&format!("b{}", i), 10, 1800))
                .collect();
            profiles.push(steady("fast", 50, 72));

            let outcome = analyze(&profiles, &only(AnomalyKind::HighFrequency));

            let flagged: Vec<&str> = outcome.flags.iter().map(|f| f.identifier.as_str()).collect();
            assert_eq!(flagged, vec!["fast"], "baseline of {}", baseline);
            assert!(outcome.flags[0].score > 2.0);
        }

        let pair = vec![steady("b0", 10, 1800), steady("fast", 50, 72)];
        assert!(analyze(&pair, &only(AnomalyKind::HighFrequency)).flags.is_empty());
    }

    #[test]
    fn test_insufficient_sample_is_excluded() {
        let mut profiles = frequency_population(10);
        profiles.push(steady("sparse", 3, 60));

        let outcome = analyze(&profiles, &AnalyzerConfig::default());

        assert!(outcome.is_excluded("sparse", AnomalyKind::HighFrequency));
        assert!(outcome.is_excluded("sparse", AnomalyKind::TemporalCluster));
        assert_eq!(outcome.flags_for("sparse").count(), 0);

        let exclusion = outcome
            .exclusions
            .iter()
            .find(|e| e.identifier == "sparse" && e.detector == AnomalyKind::HighFrequency)
            .unwrap();
        assert_eq!(exclusion.required, 5);
        assert_eq!(exclusion.available, 3);
    }

    #[test]
    fn test_zero_incident_profile_is_ignored() {
        let mut profiles = frequency_population(10);
        profiles.push(ActivityProfile::empty("ghost"));

        let outcome = analyze(&profiles, &AnalyzerConfig::default());
        assert_eq!(outcome.flags_for("ghost").count(), 0);
        assert!(outcome.exclusions.iter().all(|e| e.identifier != "ghost"));

        assert_eq!(
            analyze(&[ActivityProfile::empty("ghost")], &AnalyzerConfig::default()),
            AnalysisOutcome::default()
        );
    }

    #[test]
    fn test_permutation_invariant() {
        let mut profiles = frequency_population(10);
        profiles.push(located("tight", &square(Point::new(0.0, 0.0), 10.0)));
        for i in 0..4 {
            profiles.push(located(
                &format!("wide{}", i),
                &square(Point::new(i as f64 * 100.0, 0.0), 1000.0),
            ));
        }
        let config = AnalyzerConfig::default();
        let expected = analyze(&profiles, &config);

        let mut reversed = profiles.clone();
        reversed.reverse();
        assert_eq!(analyze(&reversed, &config), expected);

        let mut rotated = profiles.clone();
        rotated.rotate_left(5);
        assert_eq!(analyze(&rotated, &config), expected);
    }

    #[test]
    fn test_deterministic() {
        let profiles = frequency_population(10);
        let config = AnalyzerConfig::default();
        assert_eq!(analyze(&profiles, &config), analyze(&profiles, &config));
    }

    #[test]
    fn test_geographic_cluster() {
        let mut profiles = vec![located("tight", &square(Point::new(0.0, 0.0), 10.0))];
        for i in 0..5 {
            profiles.push(located(
                &format!("wide{}", i),
                &square(Point::new(0.0, i as f64 * 50.0), 1000.0),
            ));
        }

        let outcome = analyze(&profiles, &only(AnomalyKind::GeographicCluster));

        assert_eq!(outcome.flags.len(), 1);
        let flag = &outcome.flags[0];
        assert_eq!(flag.identifier, "tight");
        assert!(flag.score > 0.95 && flag.score <= 1.0);
        assert_eq!(flag.evidence.len(), 4);
    }

    #[test]
    fn test_geographic_exclusion_counts_located_only() {
        let profiles = vec![
            located("tight", &square(Point::new(0.0, 0.0), 10.0)),
            located("few", &[Point::new(0.0, 0.0), Point::new(5.0, 5.0)]),
        ];
        let outcome = analyze(&profiles, &only(AnomalyKind::GeographicCluster));

        assert!(outcome.is_excluded("few", AnomalyKind::GeographicCluster));
        assert!(!outcome.is_excluded("tight", AnomalyKind::GeographicCluster));
    }

    #[test]
    fn test_sensitive_location() {
        let mut config = only(AnomalyKind::GeographicCluster);
        config.geographic.sensitive_locations.push(SensitiveLocation {
            name: "Community Centre".to_string(),
            position: Point::new(500.0, 500.0),
            radius: 50.0,
        });

        let profiles = vec![
            located(
                "watcher",
                &[
                    Point::new(500.0, 500.0),
                    Point::new(510.0, 490.0),
                    Point::new(480.0, 520.0),
                    Point::new(3000.0, 3000.0),
                ],
            ),
            located("elsewhere", &square(Point::new(2000.0, 2000.0), 800.0)),
        ];

        let outcome = analyze(&profiles, &config);
        let flags: Vec<_> = outcome.flags_for("watcher").collect();

        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].score, 0.75);
        assert_eq!(flags[0].evidence.len(), 3);
        assert!(flags[0]
            .detail
            .as_deref()
            .is_some_and(|d| d.contains("Community Centre")));
        assert_eq!(outcome.flags_for("elsewhere").count(), 0);
    }

    #[test]
    fn test_temporal_burst() {
        let mut offsets: Vec<i64> = (0..7).map(|i| i * 300).collect();
        offsets.extend([2 * 86_400, 3 * 86_400, 5 * 86_400]);

        let profiles = vec![
            at_offsets("burst", &offsets),
            steady("steady", 10, 12 * 3600),
            steady("compact", 6, 300),
        ];

        let outcome = analyze(&profiles, &only(AnomalyKind::TemporalCluster));

        let flagged: Vec<&str> = outcome.flags.iter().map(|f| f.identifier.as_str()).collect();
        assert_eq!(flagged, vec!["burst"]);

        let flag = &outcome.flags[0];
        assert_eq!(flag.evidence.len(), 7);
        assert!(flag.score >= 3.0);
        assert_eq!(flag.evidence[0].timestamp, base());
    }

    #[test]
    fn test_densest_window_prefers_earliest() {
        let times: Vec<_> = [0, 10, 20, 5000, 5010, 5020]
            .iter()
            .map(|s| base() + Duration::seconds(*s))
            .collect();
        assert_eq!(densest_window(&times, Duration::seconds(60)), (0, 3));
        assert_eq!(densest_window(&[], Duration::seconds(60)), (0, 0));
    }

    #[test]
    fn test_detectors_can_be_disabled() {
        let mut config = AnalyzerConfig::default();
        config.high_frequency.enabled = false;
        config.geographic.enabled = false;
        config.temporal.enabled = false;

        let outcome = analyze(&frequency_population(10), &config);
        assert_eq!(outcome, AnalysisOutcome::default());
    }

    #[test]
    fn test_incident_rate_uses_span_floor() {
        let profile = steady("quick", 5, 1);
        let rate = incident_rate(&profile, Duration::minutes(15)).unwrap();
        assert!((rate - 20.0).abs() < 1e-9);
        assert_eq!(incident_rate(&ActivityProfile::empty("x"), Duration::minutes(15)), None);
    }
}
