use crate::estimator::{EstimatorKind, EstimatorParams, SpeedEstimator};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

pub const ROTATION_KEY: &str = "estimator_rotation";

/// Persisted rotation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationState {
    pub kind: EstimatorKind,
    pub last_rotation_time: i64,
}

/// Picks the estimator kind bound to newly created downloads and rotates it
/// at most once per `period`.
pub struct EstimatorRegistry {
    params: EstimatorParams,
    period: Duration,
    state: Option<RotationState>,
}

impl EstimatorRegistry {
    pub fn new(params: EstimatorParams, period: Duration, state: Option<RotationState>) -> Self {
        Self {
            params,
            period,
            state,
        }
    }

    pub fn state(&self) -> Option<RotationState> {
        self.state
    }

    /// Runs the rotation policy. Returns the current state and whether it was
    /// re-picked (and therefore needs persisting).
    pub fn check<R: Rng>(&mut self, now_ms: i64, rng: &mut R) -> (RotationState, bool) {
        let period_ms = i64::try_from(self.period.as_millis()).unwrap_or(i64::MAX);
        match self.state {
            Some(state) if now_ms.saturating_sub(state.last_rotation_time) <= period_ms => {
                (state, false)
            }
            previous => {
                let kind = EstimatorKind::ALL[rng.gen_range(0..EstimatorKind::ALL.len())];
                let state = RotationState {
                    kind,
                    last_rotation_time: now_ms,
                };
                match previous {
                    Some(old) => info!("Rotating estimator: {} -> {}", old.kind, kind),
                    None => info!("Selected initial estimator: {}", kind),
                }
                self.state = Some(state);
                (state, true)
            }
        }
    }

    /// Pure factory: a fresh, empty-state instance of `kind`.
    pub fn get_estimator(&self, kind: EstimatorKind) -> Box<dyn SpeedEstimator> {
        self.params.build(kind)
    }
}
