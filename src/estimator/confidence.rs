//! Confidence scoring for position fixes.
//!
//! Three component scores, each in `[0, 1]`:
//!
//! - **fit**: `1 / (1 + (χ/3)²)` where `χ` is the weighted RMS residual in
//!   noise sigmas. Residuals within the expected noise barely move it.
//! - **geometry**: `min(1, GDOP₀ / GDOP)` where `GDOP₀ = 2/√3` is the GDOP
//!   of an equilateral three-receiver layout seen from its centre. Parallel
//!   lines of sight (collinear receivers) push it to zero, which caps the
//!   final confidence.
//! - **count**: `1 - 2^-(n-1)`, rising with diminishing returns.
//!
//! The components are combined by a [`ConfidenceModel`].

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// GDOP of three receivers at 120° spacing around the source.
const IDEAL_TRIANGLE_GDOP: f64 = 1.154_700_538_379_251_7; // 2 / sqrt(3)

/// Residual (in sigmas) at which the fit score halves.
const FIT_TOLERANCE_SIGMAS: f64 = 3.0;

/// Inputs to a confidence model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceInputs {
    /// Weighted RMS residual, in noise sigmas.
    pub normalized_residual: f64,
    pub gdop: f64,
    pub measurement_count: usize,
}

impl ConfidenceInputs {
    pub fn fit_score(&self) -> f64 {
        let ratio = self.normalized_residual / FIT_TOLERANCE_SIGMAS;
        1.0 / (1.0 + ratio * ratio)
    }

    pub fn geometry_score(&self) -> f64 {
        if !self.gdop.is_finite() || self.gdop <= 0.0 {
            return 0.0;
        }
        (IDEAL_TRIANGLE_GDOP / self.gdop).min(1.0)
    }

    pub fn count_score(&self) -> f64 {
        match self.measurement_count {
            0 => 0.0,
            n => 1.0 - 0.5f64.powi(n as i32 - 1),
        }
    }
}

/// How the component scores combine into one confidence value.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum ConfidenceModel {
    /// `fit · geometry · count`.
    #[default]
    Product,
    /// Weighted mean of the components, capped at the geometry score.
    Weighted { fit: f64, geometry: f64, count: f64 },
}

impl ConfidenceModel {
    /// Confidence in `[0, 1]`.
    pub fn score(&self, inputs: &ConfidenceInputs) -> f64 {
        let fit = inputs.fit_score();
        let geometry = inputs.geometry_score();
        let count = inputs.count_score();

        let raw = match *self {
            ConfidenceModel::Product => fit * geometry * count,
            ConfidenceModel::Weighted {
                fit: wf,
                geometry: wg,
                count: wc,
            } => {
                let total = wf + wg + wc;
                let mean = (wf * fit + wg * geometry + wc * count) / total;
                mean.min(geometry)
            }
        };

        if raw.is_finite() {
            raw.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let ConfidenceModel::Weighted {
            fit,
            geometry,
            count,
        } = *self
        {
            let weights = [fit, geometry, count];
            if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                bail!("confidence weights must be finite and non-negative");
            }
            if weights.iter().sum::<f64>() <= 0.0 {
                bail!("confidence weights must not all be zero");
            }
        }
        Ok(())
    }
}
