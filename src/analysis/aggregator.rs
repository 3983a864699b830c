//! Activity aggregation.
//!
//! Profiles are a pure fold over an identifier's incident records, so they
//! can always be rebuilt from the records and an incremental [`update`]
//! gives the same result as re-aggregating everything.

use crate::models::{ActivityProfile, IncidentRecord, LocatedIncident};
use crate::registry::OfficerRegistry;
use std::collections::BTreeMap;
use tracing::debug;

/// Fold one record into a profile.
pub fn update(mut profile: ActivityProfile, record: &IncidentRecord) -> ActivityProfile {
    *profile
        .incident_counts
        .entry(record.incident_type)
        .or_insert(0) += 1;

    if let Some(estimate) = &record.location {
        profile.locations.push(LocatedIncident {
            position: estimate.position,
            timestamp: record.timestamp,
        });
    }

    profile.incident_times.push(record.timestamp);
    profile.first_seen = Some(match profile.first_seen {
        Some(first) => first.min(record.timestamp),
        None => record.timestamp,
    });
    profile.last_seen = Some(match profile.last_seen {
        Some(last) => last.max(record.timestamp),
        None => record.timestamp,
    });

    profile
}

/// Build the profile of `identifier` from its records.
///
/// Records belonging to other identifiers are skipped.
pub fn aggregate(identifier: &str, records: &[IncidentRecord]) -> ActivityProfile {
    records
        .iter()
        .filter(|r| {
            let matches = r.identifier == identifier;
            if !matches {
                debug!(
                    "Skipping record for {} while aggregating {}",
                    r.identifier, identifier
                );
            }
            matches
        })
        .fold(ActivityProfile::empty(identifier), update)
}

/// Group records by canonical identifier, preserving input order per group.
pub fn group_by_identifier(
    records: &[IncidentRecord],
    registry: &OfficerRegistry,
) -> BTreeMap<String, Vec<IncidentRecord>> {
    let mut grouped: BTreeMap<String, Vec<IncidentRecord>> = BTreeMap::new();

    for record in records {
        let canonical = registry.canonical(&record.identifier).to_string();
        let mut record = record.clone();
        record.identifier = canonical.clone();
        grouped.entry(canonical).or_default().push(record);
    }

    grouped
}

/// One profile per identifier that has at least one record, sorted by identifier.
pub fn aggregate_all(records: &[IncidentRecord], registry: &OfficerRegistry) -> Vec<ActivityProfile> {
    group_by_identifier(records, registry)
        .into_iter()
        .map(|(identifier, records)| aggregate(&identifier, &records))
        .collect()
}

/// Identifiers ranked by incident count (highest first, ties by identifier).
pub fn most_active(profiles: &[ActivityProfile], n: usize) -> Vec<(&ActivityProfile, u64)> {
    let mut ranked: Vec<_> = profiles
        .iter()
        .map(|p| (p, p.total_incidents()))
        .filter(|(_, count)| *count > 0)
        .collect();

    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.identifier.cmp(&b.0.identifier)));
    ranked.truncate(n);

    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IncidentType, Point, PositionEstimate};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
    }

    fn create_test_record(identifier: &str, minute: u32, incident_type: IncidentType, located: bool) -> IncidentRecord {
        let location = located.then(|| PositionEstimate {
            source_id: "00:1A:2B:3C:4D:5E".to_string(),
            position: Point::new(minute as f64, 1.0),
            confidence: 0.8,
            contributing_measurements: Vec::new(),
            timestamp: at(minute),
        });
        IncidentRecord {
            identifier: identifier.to_string(),
            timestamp: at(minute),
            incident_type,
            location,
        }
    }

    fn sample_records() -> Vec<IncidentRecord> {
        vec![
            create_test_record("123", 10, IncidentType::TrafficStop, true),
            create_test_record("123", 5, IncidentType::Arrest, false),
            create_test_record("123", 20, IncidentType::TrafficStop, true),
            create_test_record("123", 15, IncidentType::NoiseComplaint, false),
        ]
    }

    #[test]
    fn test_aggregate_counts_and_bounds() {
        let profile = aggregate("123", &sample_records());

        assert_eq!(profile.total_incidents(), 4);
        assert_eq!(profile.count(IncidentType::TrafficStop), 2);
        assert_eq!(profile.count(IncidentType::Arrest), 1);
        assert_eq!(profile.count(IncidentType::NoiseComplaint), 1);
        assert_eq!(profile.first_seen, Some(at(5)));
        assert_eq!(profile.last_seen, Some(at(20)));
    }

    #[test]
    fn test_locations_skip_null_and_keep_order() {
        let profile = aggregate("123", &sample_records());

        let times: Vec<_> = profile.locations.iter().map(|l| l.timestamp).collect();
        assert_eq!(times, vec![at(10), at(20)]);
        assert_eq!(profile.incident_times.len(), 4);
    }

    #[test]
    fn test_order_independent_counts() {
        let records = sample_records();
        let mut reversed = records.clone();
        reversed.reverse();

        let a = aggregate("123", &records);
        let b = aggregate("123", &reversed);

        assert_eq!(a.incident_counts, b.incident_counts);
        assert_eq!(a.first_seen, b.first_seen);
        assert_eq!(a.last_seen, b.last_seen);
    }

    #[test]
    fn test_aggregation_is_idempotent() {
        let records = sample_records();
        assert_eq!(aggregate("123", &records), aggregate("123", &records));
    }

    #[test]
    fn test_incremental_matches_batch() {
        let records = sample_records();
        let new_record = create_test_record("123", 2, IncidentType::Other, true);

        let incremental = update(aggregate("123", &records), &new_record);

        let mut appended = records.clone();
        appended.push(new_record);
        let batch = aggregate("123", &appended);

        assert_eq!(incremental.incident_counts, batch.incident_counts);
        assert_eq!(incremental.first_seen, batch.first_seen);
        assert_eq!(incremental.last_seen, batch.last_seen);
        assert_eq!(incremental, batch);
    }

    #[test]
    fn test_update_from_empty() {
        let record = create_test_record("123", 7, IncidentType::Arrest, false);
        let profile = update(ActivityProfile::empty("123"), &record);

        assert_eq!(profile.first_seen, Some(at(7)));
        assert_eq!(profile.last_seen, Some(at(7)));
        assert!(profile.locations.is_empty());
    }

    #[test]
    fn test_aggregate_skips_other_identifiers() {
        let mut records = sample_records();
        records.push(create_test_record("456", 30, IncidentType::Arrest, false));

        let profile = aggregate("123", &records);
        assert_eq!(profile.total_incidents(), 4);
        assert_eq!(profile.last_seen, Some(at(20)));
    }

    #[test]
    fn test_aggregate_all_uses_registry() {
        let registry = OfficerRegistry::new().with_alias("Unit 123", "123");
        let mut records = sample_records();
        records.push(create_test_record("Unit 123", 25, IncidentType::Arrest, false));
        records.push(create_test_record("456", 30, IncidentType::Arrest, false));

        let profiles = aggregate_all(&records, &registry);

        let ids: Vec<&str> = profiles.iter().map(|p| p.identifier.as_str()).collect();
        assert_eq!(ids, vec!["123", "456"]);
        assert_eq!(profiles[0].total_incidents(), 5);
        assert_eq!(profiles[1].total_incidents(), 1);
    }

    #[test]
    fn test_zero_incident_identifier_is_absent() {
        let registry = OfficerRegistry::new().with_device("00:1A:2B:3C:4D:5E", "789");
        let profiles = aggregate_all(&sample_records(), &registry);

        assert!(profiles.iter().all(|p| p.identifier != "789"));
        assert!(aggregate_all(&[], &registry).is_empty());
    }

    #[test]
    fn test_most_active() {
        let mut records = sample_records();
        records.push(create_test_record("456", 30, IncidentType::Arrest, false));
        let profiles = aggregate_all(&records, &OfficerRegistry::new());

        let top = most_active(&profiles, 1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].0.identifier, "123");
        assert_eq!(top[0].1, 4);
    }
}
