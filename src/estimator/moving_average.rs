use super::{Baseline, DownloadMeta, EstimationResult, EstimatorKind, Sample, SpeedEstimator, Step};
use std::collections::VecDeque;

/// Arithmetic mean over the last `window` instant speeds (FIFO eviction).
#[derive(Debug)]
pub struct MovingAverageEstimator {
    baseline: Baseline,
    window: usize,
    history: VecDeque<f64>,
}

impl MovingAverageEstimator {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            baseline: Baseline::default(),
            window,
            history: VecDeque::with_capacity(window + 1),
        }
    }

    pub(crate) fn observe(&mut self, instant: f64) -> f64 {
        self.history.push_back(instant);
        while self.history.len() > self.window {
            self.history.pop_front();
        }
        self.mean()
    }

    fn mean(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.history.iter().sum::<f64>() / self.history.len() as f64
    }
}

impl SpeedEstimator for MovingAverageEstimator {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::MovingAverage
    }

    fn calculate(&mut self, sample: Sample, meta: &DownloadMeta) -> EstimationResult {
        let speed = match self.baseline.advance(sample) {
            Step::Measured(instant) => self.observe(instant),
            Step::Rebased => self.mean(),
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

    const META: DownloadMeta = DownloadMeta {
        total_bytes: 100_000,
        start_time_ms: 0,
    };

    #[test]
    fn test_window_evicts_oldest() {
        let mut estimator = MovingAverageEstimator::new(5);
        let mut speed = 0.0;
        for instant in [100.0, 200.0, 300.0, 400.0, 500.0, 600.0] {
            speed = estimator.observe(instant);
        }
        assert_eq!(speed, 400.0);
        assert_eq!(estimator.history.len(), 5);
    }

    #[test]
    fn test_samples_feed_the_window() {
        let mut estimator = MovingAverageEstimator::new(5);
        // Warm-up sample contributes a zero, then gets evicted.
        let mut bytes = 0;
        let mut result = estimator.calculate(Sample::new(0, 0), &META);
        for (i, delta) in [100u64, 200, 300, 400, 500, 600].iter().enumerate() {
            bytes += delta;
            result = estimator.calculate(Sample::new((i as i64 + 1) * 1_000, bytes), &META);
        }
        assert_eq!(result.speed_bytes_per_sec, 400.0);
    }

    #[test]
    fn test_partial_window_uses_available_samples() {
        let mut estimator = MovingAverageEstimator::new(5);
        estimator.calculate(Sample::new(0, 0), &META);
        let result = estimator.calculate(Sample::new(1_000, 1_000), &META);
        assert_eq!(result.speed_bytes_per_sec, 500.0);
    }

    #[test]
    fn test_gap_does_not_push_a_sample() {
        let mut estimator = MovingAverageEstimator::new(5);
        estimator.observe(1_000.0);
        estimator.observe(3_000.0);
        estimator.mark_gap();
        let result = estimator.calculate(Sample::new(90_000, 10), &META);
        assert_eq!(result.speed_bytes_per_sec, 2_000.0);
        assert_eq!(estimator.history.len(), 2);
    }

    #[test]
    fn test_zero_window_is_clamped() {
        let mut estimator = MovingAverageEstimator::new(0);
        estimator.observe(10.0);
        assert_eq!(estimator.observe(20.0), 20.0);
    }
}
