//! Typed outcomes of the position estimator.

use thiserror::Error;

/// Why a batch of measurements could not be turned into a position fix.
///
/// All of these are recoverable: the caller may retry with more
/// measurements or a wider window.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Unresolvable {
    #[error("need at least {need} distinct receivers, got {have}")]
    TooFewReceivers { need: usize, have: usize },

    #[error("receiver geometry is degenerate (aspect ratio {aspect_ratio:.5})")]
    DegenerateGeometry { aspect_ratio: f64 },

    #[error("normal equations are singular")]
    SingularSystem,

    #[error("solver did not converge after {iterations} iterations")]
    NoConvergence { iterations: usize },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EstimateError {
    #[error("position unresolvable: {0}")]
    Unresolvable(#[from] Unresolvable),

    #[error("invalid measurement: {0}")]
    InvalidMeasurement(String),
}

impl EstimateError {
    pub fn is_unresolvable(&self) -> bool {
        matches!(self, EstimateError::Unresolvable(_))
    }
}

pub type EstimateResult<T> = std::result::Result<T, EstimateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = EstimateError::from(Unresolvable::TooFewReceivers { need: 3, have: 2 });
        assert_eq!(
            err.to_string(),
            "position unresolvable: need at least 3 distinct receivers, got 2"
        );
        assert!(err.is_unresolvable());

        let err = EstimateError::InvalidMeasurement("mixed source ids".to_string());
        assert!(!err.is_unresolvable());
    }
}
