use super::{Baseline, DownloadMeta, EstimationResult, EstimatorKind, Sample, SpeedEstimator, Step};

/// Speed over the last delta only. No smoothing.
#[derive(Debug, Default)]
pub struct InstantaneousEstimator {
    baseline: Baseline,
    speed: f64,
}

impl InstantaneousEstimator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SpeedEstimator for InstantaneousEstimator {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Instantaneous
    }

    fn calculate(&mut self, sample: Sample, meta: &DownloadMeta) -> EstimationResult {
        if let Step::Measured(instant) = self.baseline.advance(sample) {
            self.speed = instant;
        }
        EstimationResult::new(self.kind(), self.speed, sample, meta)
    }

    fn mark_gap(&mut self) {
        self.baseline.mark_gap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::Eta;

    const META: DownloadMeta = DownloadMeta {
        total_bytes: 11_000,
        start_time_ms: 0,
    };

    #[test]
    fn test_one_second_thousand_bytes() {
        let mut estimator = InstantaneousEstimator::new();
        estimator.calculate(Sample::new(0, 0), &META);
        let result = estimator.calculate(Sample::new(1_000, 1_000), &META);
        assert_eq!(result.speed_bytes_per_sec, 1_000.0);
        assert_eq!(result.remaining_seconds, Eta::Seconds(10.0));
    }

    #[test]
    fn test_only_last_delta_counts() {
        let mut estimator = InstantaneousEstimator::new();
        estimator.calculate(Sample::new(0, 0), &META);
        estimator.calculate(Sample::new(1_000, 8_000), &META);
        let result = estimator.calculate(Sample::new(3_000, 9_000), &META);
        assert_eq!(result.speed_bytes_per_sec, 500.0);
    }

    #[test]
    fn test_stalled_download_has_unknown_eta() {
        let mut estimator = InstantaneousEstimator::new();
        estimator.calculate(Sample::new(0, 100), &META);
        let result = estimator.calculate(Sample::new(1_000, 100), &META);
        assert_eq!(result.speed_bytes_per_sec, 0.0);
        assert_eq!(result.remaining_seconds, Eta::Unknown);
    }

    #[test]
    fn test_gap_keeps_pre_pause_speed() {
        let mut estimator = InstantaneousEstimator::new();
        estimator.calculate(Sample::new(0, 0), &META);
        estimator.calculate(Sample::new(1_000, 2_000), &META);
        estimator.mark_gap();
        let result = estimator.calculate(Sample::new(60_000, 2_100), &META);
        assert_eq!(result.speed_bytes_per_sec, 2_000.0);
        let result = estimator.calculate(Sample::new(61_000, 3_100), &META);
        assert_eq!(result.speed_bytes_per_sec, 1_000.0);
    }
}
