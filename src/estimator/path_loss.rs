//! Log-distance path-loss model.
//!
//! `distance = 10^((tx_power - rssi) / (10 * n))`, with the RSSI noise
//! propagated into a per-range standard deviation for weighting.

use crate::config::EstimatorConfig;
use std::f64::consts::LN_10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathLossModel {
    /// Received power at 1 m, in dBm.
    pub tx_power: f64,
    /// Path-loss exponent `n`.
    pub exponent: f64,
    /// Standard deviation of RSSI readings, in dB.
    pub noise_sigma: f64,
    pub min_range: f64,
    pub max_range: f64,
}

impl Default for PathLossModel {
    fn default() -> Self {
        Self::from(&EstimatorConfig::default())
    }
}

impl From<&EstimatorConfig> for PathLossModel {
    fn from(config: &EstimatorConfig) -> Self {
        Self {
            tx_power: config.tx_power,
            exponent: config.path_loss_exponent,
            noise_sigma: config.noise_variance.sqrt(),
            min_range: config.min_range,
            max_range: config.max_range,
        }
    }
}

impl PathLossModel {
    /// Implied distance in metres for a reading, clamped to the model's range.
    pub fn distance(&self, signal_strength: f64) -> f64 {
        let exponent = (self.tx_power - signal_strength) / (10.0 * self.exponent);
        10f64
            .powf(exponent)
            .clamp(self.min_range, self.max_range)
    }

    /// Standard deviation of the implied distance.
    ///
    /// First-order propagation of the RSSI noise through the exponential:
    /// `σ_d = d · ln(10) / (10 n) · σ_rssi`.
    pub fn range_sigma(&self, distance: f64) -> f64 {
        distance.max(self.min_range) * LN_10 / (10.0 * self.exponent) * self.noise_sigma
    }

    /// Least-squares weight for a residual at `distance`.
    pub fn weight(&self, distance: f64) -> f64 {
        let sigma = self.range_sigma(distance);
        1.0 / (sigma * sigma)
    }
}

#[cfg(test)]
impl PathLossModel {
    /// Expected reading at `distance` metres; the inverse of [`Self::distance`].
    pub fn signal_strength(&self, distance: f64) -> f64 {
        self.tx_power - 10.0 * self.exponent * distance.max(f64::MIN_POSITIVE).log10()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_space_distance() {
        let model = PathLossModel::default();
        // 0 dBm at 1 m, n = 2: -40 dBm is 100 m away.
        assert!((model.distance(-40.0) - 100.0).abs() < 1e-9);
        assert!((model.distance(-20.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_distance_is_clamped() {
        let model = PathLossModel::default();
        assert_eq!(model.distance(10.0), 1.0);
        assert_eq!(model.distance(-120.0), 1000.0);
    }

    #[test]
    fn test_signal_strength_inverts_distance() {
        let model = PathLossModel {
            tx_power: -40.0,
            exponent: 2.7,
            ..PathLossModel::default()
        };
        for d in [1.5, 7.07, 42.0, 640.0] {
            let rssi = model.signal_strength(d);
            assert!((model.distance(rssi) - d).abs() < 1e-9);
        }
    }

    #[test]
    fn test_weight_decreases_with_distance() {
        let model = PathLossModel::default();
        assert!(model.weight(5.0) > model.weight(50.0));
        assert!(model.weight(50.0) > model.weight(500.0));
    }
}
