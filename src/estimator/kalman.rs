use super::{Baseline, DownloadMeta, EstimationResult, EstimatorKind, Sample, SpeedEstimator, Step};

const INITIAL_VARIANCE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct KalmanState {
    estimate: f64,
    variance: f64,
}

/// Scalar random-walk Kalman filter over instant speeds.
#[derive(Debug)]
pub struct KalmanEstimator {
    baseline: Baseline,
    process_noise: f64,
    measurement_noise: f64,
    state: Option<KalmanState>,
}

impl KalmanEstimator {
    pub fn new(process_noise: f64, measurement_noise: f64) -> Self {
        Self {
            baseline: Baseline::default(),
            process_noise,
            measurement_noise,
            state: None,
        }
    }

    pub(crate) fn observe(&mut self, instant: f64) -> f64 {
        let state = self.state.get_or_insert(KalmanState {
            estimate: instant,
            variance: INITIAL_VARIANCE,
        });

        // Predict
        state.variance += self.process_noise;

        // Update
        let gain = state.variance / (state.variance + self.measurement_noise);
        state.estimate += gain * (instant - state.estimate);
        state.variance *= 1.0 - gain;

        state.estimate
    }

    fn estimate(&self) -> f64 {
        self.state.map(|s| s.estimate).unwrap_or(0.0)
    }
}

impl SpeedEstimator for KalmanEstimator {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Kalman
    }

    fn calculate(&mut self, sample: Sample, meta: &DownloadMeta) -> EstimationResult {
        let speed = match self.baseline.advance(sample) {
            Step::Measured(instant) => self.observe(instant),
            Step::Rebased => self.estimate(),
        };
        EstimationResult::new(self.kind(), speed, sample, meta)
    }

    fn mark_gap(&mut self) {
        self.baseline.mark_gap();
    }
}
