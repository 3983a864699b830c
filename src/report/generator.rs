//! Accountability report output.
//!
//! Reports are written as pretty JSON; the console gets a short plain-text
//! summary.

use crate::analysis::{most_active, rank};
use crate::models::{AccountabilityReport, AnomalyKind, FlagSummary, IncidentType};
use crate::registry::OfficerRegistry;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Serialize a report as pretty JSON.
pub fn generate_json_report(report: &AccountabilityReport) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

/// Write a JSON report to `path`, creating parent directories as needed.
pub fn write_json_report(report: &AccountabilityReport, path: &Path) -> Result<()> {
    let content = generate_json_report(report)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    fs::write(path, content).with_context(|| format!("Failed to write report to {}", path.display()))
}

/// Keep only what concerns `officer`: its profile, flags, exclusions and
/// the estimates of devices registered to it.
pub fn restrict_to_officer(
    mut report: AccountabilityReport,
    officer: &str,
    registry: &OfficerRegistry,
) -> AccountabilityReport {
    let canonical = registry.canonical(officer).to_string();

    report.profiles.retain(|p| p.identifier == canonical);
    report.flags.retain(|f| f.identifier == canonical);
    report.exclusions.retain(|e| e.identifier == canonical);
    report
        .estimates
        .retain(|e| registry.officer_for_device(&e.source_id) == Some(canonical.as_str()));
    report
        .unresolved
        .retain(|u| registry.officer_for_device(&u.source_id) == Some(canonical.as_str()));

    report.summary = FlagSummary::from_flags(&report.flags);
    report.metadata.officer = Some(canonical);
    report
}

/// Plain-text digest of a report for the terminal.
pub fn console_summary(report: &AccountabilityReport, top: usize) -> String {
    let mut out = String::new();
    let summary = &report.summary;

    out.push_str(&format!(
        "   Estimates: {} ({} unresolved)\n",
        report.estimates.len(),
        report.unresolved.len()
    ));
    out.push_str(&format!("   Profiles: {}\n", report.profiles.len()));
    for (profile, total) in most_active(&report.profiles, top) {
        out.push_str(&format!(
            "     {}: {} incidents ({} stops, {} arrests)\n",
            profile.identifier,
            total,
            profile.count(IncidentType::TrafficStop),
            profile.count(IncidentType::Arrest)
        ));
    }
    out.push_str(&format!(
        "   Flags: {} across {} identifiers\n",
        summary.total, summary.flagged_identifiers
    ));
    out.push_str(&format!(
        "   - High frequency: {} | Geographic: {} | Temporal: {}\n",
        summary.high_frequency, summary.geographic_cluster, summary.temporal_cluster
    ));
    if !report.exclusions.is_empty() {
        out.push_str(&format!(
            "   Excluded (insufficient sample): {}\n",
            report.exclusions.len()
        ));
    }

    for kind in [
        AnomalyKind::HighFrequency,
        AnomalyKind::GeographicCluster,
        AnomalyKind::TemporalCluster,
    ] {
        for flag in rank(&report.flags, kind).into_iter().take(top) {
            out.push_str(&format!(
                "     {} {} score {:.2}",
                kind, flag.identifier, flag.score
            ));
            if let Some(detail) = &flag.detail {
                out.push_str(&format!(" ({})", detail));
            }
            out.push('\n');
        }
    }

    out
}
