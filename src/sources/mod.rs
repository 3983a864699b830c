//! Measurement and incident sources.
//!
//! The engine consumes plain in-memory collections; these traits are the
//! seam where storage plugs in. Two implementations are provided: an
//! in-memory source and a directory of JSON files.

use crate::models::{IncidentRecord, Measurement};
use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Anything that can hand over a batch of signal measurements.
pub trait MeasurementSource {
    fn measurements(&self) -> Result<Vec<Measurement>>;
}

/// Anything that can hand over a batch of incident records.
pub trait IncidentSource {
    fn incidents(&self) -> Result<Vec<IncidentRecord>>;
}

/// Records held in memory. The default is empty.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    pub measurements: Vec<Measurement>,
    pub incidents: Vec<IncidentRecord>,
}

impl MeasurementSource for MemorySource {
    fn measurements(&self) -> Result<Vec<Measurement>> {
        Ok(self.measurements.clone())
    }
}

impl IncidentSource for MemorySource {
    fn incidents(&self) -> Result<Vec<IncidentRecord>> {
        Ok(self.incidents.clone())
    }
}

/// A JSON file, or a directory tree of `*.json` files.
///
/// Each file holds one record or an array of records. Files that do not
/// parse as the requested record type are skipped with a warning, so one
/// directory can hold both measurements and incidents.
#[derive(Debug, Clone)]
pub struct JsonDirSource {
    root: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl JsonDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// JSON files under the root, in file-name order.
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            bail!("Input path not found: {}", self.root.display());
        }

        if self.root.is_file() {
            return Ok(vec![self.root.clone()]);
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e))
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            if entry.file_type().is_file()
                && path.extension().and_then(|e| e.to_str()) == Some("json")
            {
                files.push(path.to_path_buf());
            }
        }

        Ok(files)
    }

    fn load<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>> {
        let mut records = Vec::new();

        for path in self.files()? {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;

            match serde_json::from_str::<OneOrMany<T>>(&content) {
                Ok(OneOrMany::Many(batch)) => records.extend(batch),
                Ok(OneOrMany::One(record)) => records.push(record),
                Err(e) => warn!("Skipping {} (not {}): {}", path.display(), kind, e),
            }
        }

        info!(
            "Loaded {} {} from {}",
            records.len(),
            kind,
            self.root.display()
        );
        Ok(records)
    }
}

impl MeasurementSource for JsonDirSource {
    fn measurements(&self) -> Result<Vec<Measurement>> {
        let mut measurements: Vec<Measurement> = self.load("measurements")?;
        measurements.sort_by(|a, b| {
            a.source_id
                .cmp(&b.source_id)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
                .then_with(|| a.receiver_position.x.total_cmp(&b.receiver_position.x))
                .then_with(|| a.receiver_position.y.total_cmp(&b.receiver_position.y))
                .then_with(|| a.signal_strength.total_cmp(&b.signal_strength))
        });
        Ok(measurements)
    }
}

impl IncidentSource for JsonDirSource {
    fn incidents(&self) -> Result<Vec<IncidentRecord>> {
        let mut incidents: Vec<IncidentRecord> = self.load("incidents")?;
        incidents.sort_by(|a, b| {
            a.identifier
                .cmp(&b.identifier)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
                .then_with(|| a.incident_type.cmp(&b.incident_type))
        });
        Ok(incidents)
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}
