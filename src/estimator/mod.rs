//! Streaming speed/ETA estimators.
//!
//! Every estimator consumes one cumulative `(time, bytes)` sample per call and
//! returns a fresh [`EstimationResult`]. Speeds are always raw bytes per second;
//! unit conversion is a display concern.

mod exponential;
mod instantaneous;
mod kalman;
mod moving_average;

pub use exponential::ExponentialSmoothingEstimator;
pub use instantaneous::InstantaneousEstimator;
pub use kalman::KalmanEstimator;
pub use moving_average::MovingAverageEstimator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// One observation of cumulative bytes at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub timestamp_ms: i64,
    pub bytes_received: u64,
}

impl Sample {
    pub fn new(timestamp_ms: i64, bytes_received: u64) -> Self {
        Self {
            timestamp_ms,
            bytes_received,
        }
    }
}

/// What an estimator needs to know about the download besides the sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadMeta {
    /// Total size in bytes, `-1` when the host does not know it.
    pub total_bytes: i64,
    pub start_time_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EstimatorKind {
    Instantaneous,
    MovingAverage,
    ExponentialSmoothing,
    Kalman,
}

impl EstimatorKind {
    pub const ALL: [EstimatorKind; 4] = [
        EstimatorKind::Instantaneous,
        EstimatorKind::MovingAverage,
        EstimatorKind::ExponentialSmoothing,
        EstimatorKind::Kalman,
    ];

    pub fn label(self) -> &'static str {
        match self {
            EstimatorKind::Instantaneous => "instantaneous",
            EstimatorKind::MovingAverage => "movingAverage",
            EstimatorKind::ExponentialSmoothing => "exponentialSmoothing",
            EstimatorKind::Kalman => "kalman",
        }
    }
}

impl fmt::Display for EstimatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Remaining time. `Unknown` is a sentinel, never zero or negative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Eta {
    Seconds(f64),
    Unknown,
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eta::Seconds(s) => write!(f, "{:.2}", s),
            Eta::Unknown => f.write_str("Unknown"),
        }
    }
}

impl Serialize for Eta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Eta::Seconds(s) => serializer.serialize_f64(*s),
            Eta::Unknown => serializer.serialize_str("Unknown"),
        }
    }
}

impl<'de> Deserialize<'de> for Eta {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Seconds(f64),
            Label(String),
        }

        // Older snapshots stored the ETA as a formatted string ("12.50").
        let seconds = match Repr::deserialize(deserializer)? {
            Repr::Seconds(s) => Some(s),
            Repr::Label(label) => label.trim().parse::<f64>().ok(),
        };
        Ok(seconds
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map_or(Eta::Unknown, Eta::Seconds))
    }
}

/// Produced fresh on every `calculate` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimationResult {
    pub speed_bytes_per_sec: f64,
    pub remaining_seconds: Eta,
    pub estimator_kind: EstimatorKind,
    pub sample_start_time: DateTime<Utc>,
    pub sample_time: DateTime<Utc>,
}

impl EstimationResult {
    fn new(kind: EstimatorKind, speed: f64, sample: Sample, meta: &DownloadMeta) -> Self {
        let speed = if speed.is_finite() { speed.max(0.0) } else { 0.0 };
        Self {
            speed_bytes_per_sec: speed,
            remaining_seconds: remaining_time(meta.total_bytes, sample.bytes_received, speed),
            estimator_kind: kind,
            sample_start_time: timestamp(meta.start_time_ms),
            sample_time: timestamp(sample.timestamp_ms),
        }
    }
}

/// Converts a millisecond epoch timestamp, falling back to the epoch itself
/// for values chrono cannot represent.
pub fn timestamp(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

pub fn remaining_time(total_bytes: i64, bytes_received: u64, speed: f64) -> Eta {
    if total_bytes < 0 || speed <= 0.0 {
        return Eta::Unknown;
    }
    let remaining = (total_bytes as u64).saturating_sub(bytes_received);
    Eta::Seconds(remaining as f64 / speed)
}

/// Strategy interface shared by all estimator kinds.
///
/// Instances carry the recurrence state of exactly one download.
pub trait SpeedEstimator: Send + Sync {
    fn kind(&self) -> EstimatorKind;

    /// Feeds one sample. Timestamps must be non-decreasing per download.
    fn calculate(&mut self, sample: Sample, meta: &DownloadMeta) -> EstimationResult;

    /// Marks a pause gap: the next sample re-baselines instead of producing
    /// an instant speed that spans the pause.
    fn mark_gap(&mut self);
}

/// Tuning knobs for the smoothing estimators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorParams {
    pub moving_average_window: usize,
    pub smoothing_alpha: f64,
    pub kalman_process_noise: f64,
    pub kalman_measurement_noise: f64,
}

impl Default for EstimatorParams {
    fn default() -> Self {
        Self {
            moving_average_window: 5,
            smoothing_alpha: 0.2,
            kalman_process_noise: 0.01,
            kalman_measurement_noise: 0.1,
        }
    }
}

impl EstimatorParams {
    /// Constructs a fresh, empty-state estimator of the requested kind.
    pub fn build(&self, kind: EstimatorKind) -> Box<dyn SpeedEstimator> {
        match kind {
            EstimatorKind::Instantaneous => Box::new(InstantaneousEstimator::new()),
            EstimatorKind::MovingAverage => {
                Box::new(MovingAverageEstimator::new(self.moving_average_window))
            }
            EstimatorKind::ExponentialSmoothing => {
                Box::new(ExponentialSmoothingEstimator::new(self.smoothing_alpha))
            }
            EstimatorKind::Kalman => Box::new(KalmanEstimator::new(
                self.kalman_process_noise,
                self.kalman_measurement_noise,
            )),
        }
    }
}

/// Outcome of advancing the previous-sample baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Step {
    /// An instant speed to feed into the smoothing state.
    Measured(f64),
    /// First sample after a pause gap; nothing to feed.
    Rebased,
}

/// Previous-sample bookkeeping common to every estimator.
#[derive(Debug, Default)]
pub(crate) struct Baseline {
    previous: Option<Sample>,
    gap: bool,
}

impl Baseline {
    pub(crate) fn advance(&mut self, sample: Sample) -> Step {
        let previous = self.previous.replace(sample);
        if std::mem::take(&mut self.gap) {
            return Step::Rebased;
        }
        match previous {
            // Warm-up: the very first sample has no delta to measure.
            None => Step::Measured(0.0),
            Some(previous) => Step::Measured(instant_speed(previous, sample)),
        }
    }

    pub(crate) fn mark_gap(&mut self) {
        self.gap = true;
    }
}

/// Bytes per second between two samples. Zero for non-positive elapsed time;
/// a byte-count decrease is clamped to zero.
pub fn instant_speed(previous: Sample, current: Sample) -> f64 {
    let elapsed_ms = current.timestamp_ms - previous.timestamp_ms;
    if elapsed_ms <= 0 {
        return 0.0;
    }
    let bytes = current.bytes_received.saturating_sub(previous.bytes_received);
    bytes as f64 / (elapsed_ms as f64 / 1000.0)
}
