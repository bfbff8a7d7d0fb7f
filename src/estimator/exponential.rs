use super::{Baseline, DownloadMeta, EstimationResult, EstimatorKind, Sample, SpeedEstimator, Step};

/// Exponential moving average: `speed = alpha * instant + (1 - alpha) * speed`.
/// The first measured instant seeds the average.
#[derive(Debug)]
pub struct ExponentialSmoothingEstimator {
    baseline: Baseline,
    alpha: f64,
    speed: Option<f64>,
}

impl ExponentialSmoothingEstimator {
    pub fn new(alpha: f64) -> Self {
        Self {
            baseline: Baseline::default(),
            alpha: alpha.clamp(0.0, 1.0),
            speed: None,
        }
    }

    pub(crate) fn observe(&mut self, instant: f64) -> f64 {
        let next = match self.speed {
            None => instant,
            Some(previous) => self.alpha * instant + (1.0 - self.alpha) * previous,
        };
        self.speed = Some(next);
        next
    }
}

impl SpeedEstimator for ExponentialSmoothingEstimator {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::ExponentialSmoothing
    }

    fn calculate(&mut self, sample: Sample, meta: &DownloadMeta) -> EstimationResult {
        let speed = match self.baseline.advance(sample) {
            Step::Measured(instant) => self.observe(instant),
            Step::Rebased => self.speed.unwrap_or(0.0),
        };
        EstimationResult::new(self.kind(), speed, sample, meta)
    }

    fn mark_gap(&mut self) {
        self.baseline.mark_gap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoothing_step() {
        let mut estimator = ExponentialSmoothingEstimator::new(0.2);
        assert_eq!(estimator.observe(100.0), 100.0);
        let next = estimator.observe(200.0);
        assert!((next - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_first_sample_seeds_zero() {
        let meta = DownloadMeta {
            total_bytes: 10_000,
            start_time_ms: 0,
        };
        let mut estimator = ExponentialSmoothingEstimator::new(0.2);
        estimator.calculate(Sample::new(0, 0), &meta);
        let result = estimator.calculate(Sample::new(1_000, 1_000), &meta);
        assert!((result.speed_bytes_per_sec - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_gap_holds_average() {
        let meta = DownloadMeta {
            total_bytes: -1,
            start_time_ms: 0,
        };
        let mut estimator = ExponentialSmoothingEstimator::new(0.5);
        estimator.observe(800.0);
        estimator.mark_gap();
        let result = estimator.calculate(Sample::new(30_000, 50), &meta);
        assert_eq!(result.speed_bytes_per_sec, 800.0);
    }
}
