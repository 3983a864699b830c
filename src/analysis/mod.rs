//! Activity aggregation and pattern analysis.

pub mod aggregator;
pub mod analyzer;

pub use aggregator::*;
pub use analyzer::{analyze, dispersion, incident_rate, rank};
