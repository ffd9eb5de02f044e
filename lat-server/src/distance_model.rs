//! Error probability model shared by the PDF-grid engine (C6) and the
//! particle filter (C8): `p(e)` where `e = measured - true` distance.

/// A trait so both the histogram-based model and the degenerate "uniform"
/// model (used by the grid engine's additive combination mode) share a
/// contract with the particle filter's scoring step.
pub trait ErrorModel: Send + Sync {
    /// Probability density at error `e`.
    fn p(&self, e: f64) -> f64;
}

/// Linear interpolation over a 20-bin histogram of offline-observed errors,
/// normalized to integrate to 1, zero outside the observed range.
#[derive(Debug, Clone)]
pub struct HistogramDistanceModel {
    // Bin midpoints, ascending.
    midpoints: Vec<f64>,
    // Normalized density at each midpoint.
    densities: Vec<f64>,
}

const BIN_COUNT: usize = 20;

impl HistogramDistanceModel {
    /// Build from a sample of offline-observed errors (`measured - true`).
    pub fn from_errors(errors: &[f64]) -> Self {
        assert!(!errors.is_empty(), "need at least one error sample");

        let min = errors.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = errors.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let span = if max > min { max - min } else { 1.0 };
        let bin_width = span / BIN_COUNT as f64;

        let mut counts = vec![0u64; BIN_COUNT];
        for &e in errors {
            let mut bin = ((e - min) / bin_width) as usize;
            if bin >= BIN_COUNT {
                bin = BIN_COUNT - 1;
            }
            counts[bin] += 1;
        }

        let total = errors.len() as f64;
        // Normalize so the histogram integrates to 1 over its support
        // (matches numpy.histogram(..., density=True)): density = count / (total * bin_width).
        let densities: Vec<f64> = counts
            .iter()
            .map(|&c| c as f64 / (total * bin_width))
            .collect();
        let midpoints: Vec<f64> = (0..BIN_COUNT)
            .map(|i| min + bin_width * (i as f64 + 0.5))
            .collect();

        Self {
            midpoints,
            densities,
        }
    }
}

impl ErrorModel for HistogramDistanceModel {
    fn p(&self, e: f64) -> f64 {
        let n = self.midpoints.len();
        if e < self.midpoints[0] || e > self.midpoints[n - 1] {
            return 0.0;
        }
        // Find the bracketing pair of midpoints and interpolate linearly.
        for i in 0..n - 1 {
            let (x0, x1) = (self.midpoints[i], self.midpoints[i + 1]);
            if e >= x0 && e <= x1 {
                let (y0, y1) = (self.densities[i], self.densities[i + 1]);
                if x1 == x0 {
                    return y0;
                }
                let alpha = (e - x0) / (x1 - x0);
                return y0 + alpha * (y1 - y0);
            }
        }
        self.densities[n - 1]
    }
}

/// Degenerate model used by the grid engine's additive "uniform" combination
/// mode: 1 if the particle/cell is within the measured range (error > 0,
/// i.e. measured distance exceeds the true distance), else 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepDistanceModel;

impl ErrorModel for StepDistanceModel {
    fn p(&self, e: f64) -> f64 {
        if e > 0.0 {
            1.0
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_outside_histogram_range() {
        let model = HistogramDistanceModel::from_errors(&[-1.0, 0.0, 1.0]);
        assert_eq!(model.p(-100.0), 0.0);
        assert_eq!(model.p(100.0), 0.0);
    }

    #[test]
    fn density_is_nonnegative_within_range() {
        let model = HistogramDistanceModel::from_errors(&[-0.5, -0.2, 0.0, 0.1, 0.3, 0.5]);
        for i in 0..50 {
            let e = -0.5 + i as f64 * (1.0 / 50.0);
            assert!(model.p(e) >= 0.0);
        }
    }

    #[test]
    fn step_model_is_binary() {
        let model = StepDistanceModel;
        assert_eq!(model.p(0.1), 1.0);
        assert_eq!(model.p(-0.1), 0.0);
        assert_eq!(model.p(0.0), 0.0);
    }
}
