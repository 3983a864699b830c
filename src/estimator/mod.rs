//! Position estimation from signal-strength measurements.
//!
//! [`PositionEstimator::estimate`] turns the measurements of one source
//! inside one time window into a [`PositionEstimate`] or a typed
//! [`EstimateError`]. It is a pure function of the measurements and the
//! configured constants.

pub mod confidence;
pub mod path_loss;
pub mod solver;

pub use confidence::{ConfidenceInputs, ConfidenceModel};
pub use path_loss::PathLossModel;

use crate::config::EstimatorConfig;
use crate::error::{EstimateError, EstimateResult, Unresolvable};
use crate::geo::{CoordinateFrame, LocalFrame};
use crate::models::{Measurement, Point, PositionEstimate};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use solver::{Anchor, Fit, SolverLimits};
use tracing::debug;

/// Minimum distinct receivers for a 2-D fix.
pub const MIN_RECEIVERS: usize = 3;

/// Longest accepted measurement window (one day).
pub const MAX_WINDOW_SECS: u64 = 86_400;

/// Receivers closer than this (in metres) count as the same receiver.
const SAME_RECEIVER_M: f64 = 1e-6;

/// Which solver produces the fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverStrategy {
    /// Linearized multilateration only.
    ClosedForm,
    /// Iterative least squares from the weighted receiver centroid.
    LeastSquares,
    /// Closed-form seed refined by least squares, keeping the seed if the
    /// refinement does not converge.
    #[default]
    Auto,
}

/// Converts measurement batches into position estimates.
#[derive(Debug, Clone)]
pub struct PositionEstimator {
    model: PathLossModel,
    strategy: SolverStrategy,
    confidence: ConfidenceModel,
    limits: SolverLimits,
    min_aspect_ratio: f64,
    frame: CoordinateFrame,
    window: Duration,
}

impl Default for PositionEstimator {
    fn default() -> Self {
        Self::new(&EstimatorConfig::default(), CoordinateFrame::Planar)
    }
}

impl PositionEstimator {
    pub fn new(config: &EstimatorConfig, frame: CoordinateFrame) -> Self {
        Self {
            model: PathLossModel::from(config),
            strategy: config.strategy,
            confidence: config.confidence,
            limits: SolverLimits {
                max_iterations: config.max_iterations,
                tolerance: config.tolerance,
            },
            min_aspect_ratio: config.min_aspect_ratio,
            frame,
            window: Duration::seconds(config.window_secs.min(MAX_WINDOW_SECS) as i64),
        }
    }

    /// Configured measurement window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Estimate the position of one source.
    ///
    /// All measurements must share a `source_id` and lie within
    /// `within_window` of each other; violations are rejected as
    /// [`EstimateError::InvalidMeasurement`]. Fewer than three distinct
    /// receivers, a degenerate layout or an ill-conditioned system yield
    /// [`EstimateError::Unresolvable`].
    pub fn estimate(
        &self,
        measurements: &[Measurement],
        within_window: Duration,
    ) -> EstimateResult<PositionEstimate> {
        validate_batch(measurements, within_window)?;

        let mut ordered = measurements.to_vec();
        ordered.sort_by_key(|m| m.timestamp);

        let receivers: Vec<Point> = ordered.iter().map(|m| m.receiver_position).collect();
        let projection = match self.frame {
            CoordinateFrame::Planar => None,
            CoordinateFrame::Geodetic => Some(LocalFrame::around(&receivers)),
        };
        let planar: Vec<Point> = receivers
            .iter()
            .map(|&p| projection.map_or(p, |frame| frame.project(p)))
            .collect();

        let distinct = count_distinct(&planar);
        if ordered.len() < MIN_RECEIVERS || distinct < MIN_RECEIVERS {
            return Err(Unresolvable::TooFewReceivers {
                need: MIN_RECEIVERS,
                have: distinct,
            }
            .into());
        }

        let aspect_ratio = solver::aspect_ratio(&planar);
        if aspect_ratio < self.min_aspect_ratio {
            return Err(Unresolvable::DegenerateGeometry { aspect_ratio }.into());
        }

        let anchors: Vec<Anchor> = ordered
            .iter()
            .zip(&planar)
            .map(|(m, &position)| {
                let range = self.model.distance(m.signal_strength);
                Anchor {
                    position,
                    range,
                    weight: self.model.weight(range),
                }
            })
            .collect();

        let fit = self.solve(&anchors)?;
        if !fit.position.is_finite() {
            return Err(Unresolvable::SingularSystem.into());
        }

        let inputs = ConfidenceInputs {
            normalized_residual: solver::normalized_residual(&anchors, fit.position),
            gdop: solver::gdop(&anchors, fit.position),
            measurement_count: anchors.len(),
        };
        let confidence = self.confidence.score(&inputs);

        let position = projection.map_or(fit.position, |frame| frame.unproject(fit.position));
        let source_id = ordered[0].source_id.clone();
        let timestamp = ordered[ordered.len() - 1].timestamp;

        debug!(
            "Estimated {} at ({:.6}, {:.6}) conf={:.3} chi={:.3} gdop={:.3} iters={}",
            source_id,
            position.x,
            position.y,
            confidence,
            inputs.normalized_residual,
            inputs.gdop,
            fit.iterations
        );

        Ok(PositionEstimate {
            source_id,
            position,
            confidence,
            contributing_measurements: ordered,
            timestamp,
        })
    }

    fn solve(&self, anchors: &[Anchor]) -> Result<Fit, Unresolvable> {
        match self.strategy {
            SolverStrategy::ClosedForm => Ok(Fit {
                position: solver::closed_form(anchors)?,
                iterations: 0,
            }),
            SolverStrategy::LeastSquares => {
                solver::least_squares(anchors, solver::weighted_centroid(anchors), &self.limits)
            }
            SolverStrategy::Auto => {
                let seed = solver::closed_form(anchors)?;
                Ok(solver::refine(anchors, seed, &self.limits))
            }
        }
    }
}

#[cfg(test)]
impl PositionEstimator {
    pub fn model(&self) -> &PathLossModel {
        &self.model
    }

    pub fn frame(&self) -> CoordinateFrame {
        self.frame
    }
}

/// Reject malformed batches before they reach the solver.
fn validate_batch(measurements: &[Measurement], within_window: Duration) -> EstimateResult<()> {
    let Some(first) = measurements.first() else {
        return Err(Unresolvable::TooFewReceivers {
            need: MIN_RECEIVERS,
            have: 0,
        }
        .into());
    };

    if let Some(other) = measurements.iter().find(|m| m.source_id != first.source_id) {
        return Err(EstimateError::InvalidMeasurement(format!(
            "batch mixes sources '{}' and '{}'",
            first.source_id, other.source_id
        )));
    }

    if let Some(bad) = measurements
        .iter()
        .find(|m| !m.signal_strength.is_finite() || !m.receiver_position.is_finite())
    {
        return Err(EstimateError::InvalidMeasurement(format!(
            "non-finite reading for '{}' at {}",
            bad.source_id, bad.timestamp
        )));
    }

    let oldest = measurements.iter().map(|m| m.timestamp).min();
    let newest = measurements.iter().map(|m| m.timestamp).max();
    if let (Some(oldest), Some(newest)) = (oldest, newest) {
        if newest - oldest > within_window {
            return Err(EstimateError::InvalidMeasurement(format!(
                "measurements for '{}' span {}s, window is {}s",
                first.source_id,
                (newest - oldest).num_seconds(),
                within_window.num_seconds()
            )));
        }
    }

    Ok(())
}

fn count_distinct(points: &[Point]) -> usize {
    let mut distinct: Vec<Point> = Vec::with_capacity(points.len());
    for &p in points {
        if !distinct.iter().any(|q| q.distance_to(p) < SAME_RECEIVER_M) {
            distinct.push(p);
        }
    }
    distinct.len()
}
