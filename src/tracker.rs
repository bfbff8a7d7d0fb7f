use crate::estimator::{
    DownloadMeta, EstimationResult, EstimatorKind, Eta, Sample, SpeedEstimator,
};
use crate::host::{DownloadItem, DownloadState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRecord {
    pub id: u64,
    /// Full path as reported by the host.
    pub filename: String,
    pub url: String,
    pub mime: String,
    /// `-1` when unknown.
    pub total_bytes: i64,
    pub bytes_received: u64,
    pub state: DownloadState,
    pub start_time_ms: i64,
}

impl DownloadRecord {
    pub fn from_item(item: &DownloadItem, now_ms: i64) -> Self {
        Self {
            id: item.id,
            filename: item.filename.clone(),
            url: item.url.clone(),
            mime: item.mime.clone().unwrap_or_else(|| "unknown".to_string()),
            total_bytes: item.known_total(),
            bytes_received: item.bytes_received,
            state: item.effective_state(),
            start_time_ms: item
                .start_time
                .map(|t| t.timestamp_millis())
                .unwrap_or(now_ms),
        }
    }

    /// Last path component of the filename.
    pub fn display_name(&self) -> &str {
        self.filename
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.filename)
    }

    pub fn percentage(&self) -> u32 {
        if self.total_bytes <= 0 {
            return 0;
        }
        let pct = (self.bytes_received as f64 / self.total_bytes as f64 * 100.0).round();
        pct.clamp(0.0, 100.0) as u32
    }

    fn meta(&self) -> DownloadMeta {
        DownloadMeta {
            total_bytes: self.total_bytes,
            start_time_ms: self.start_time_ms,
        }
    }
}

/// What the popup shows for one download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadView {
    pub id: u64,
    pub filename: String,
    pub progress: u32,
    pub state: DownloadState,
    pub bytes_received: u64,
    pub total_bytes: i64,
    pub speed: f64,
    pub remaining_time: Eta,
    pub estimator: EstimatorKind,
}

/// Live binding of one download to its estimator.
pub struct Tracker {
    pub record: DownloadRecord,
    estimator: Box<dyn SpeedEstimator>,
    last_sample: Option<Sample>,
    latest: Option<EstimationResult>,
}

impl Tracker {
    pub fn new(record: DownloadRecord, estimator: Box<dyn SpeedEstimator>) -> Self {
        Self {
            record,
            estimator,
            last_sample: None,
            latest: None,
        }
    }

    pub fn kind(&self) -> EstimatorKind {
        self.estimator.kind()
    }

    pub fn latest(&self) -> Option<&EstimationResult> {
        self.latest.as_ref()
    }

    /// Feeds the host-reported byte count. Returns `None` without touching the
    /// estimator when the count is unchanged since the last recorded sample.
    pub fn sample(
        &mut self,
        bytes_received: u64,
        total_bytes: i64,
        now_ms: i64,
    ) -> Option<EstimationResult> {
        self.record.bytes_received = bytes_received;
        self.record.total_bytes = total_bytes;

        if self
            .last_sample
            .is_some_and(|last| last.bytes_received == bytes_received)
        {
            return None;
        }

        let sample = Sample::new(now_ms, bytes_received);
        let result = self.estimator.calculate(sample, &self.record.meta());
        self.last_sample = Some(sample);
        self.latest = Some(result.clone());
        Some(result)
    }

    /// Returns whether the state actually changed. Entering `Paused` marks a
    /// gap on the estimator.
    pub fn set_state(&mut self, state: DownloadState) -> bool {
        if self.record.state == state {
            return false;
        }
        if state == DownloadState::Paused {
            self.estimator.mark_gap();
        }
        self.record.state = state;
        true
    }

    pub fn view(&self) -> DownloadView {
        let (speed, remaining_time) = match self.latest() {
            Some(result) => (result.speed_bytes_per_sec, result.remaining_seconds),
            None => (0.0, Eta::Unknown),
        };
        DownloadView {
            id: self.record.id,
            filename: self.record.display_name().to_string(),
            progress: self.record.percentage(),
            state: self.record.state,
            bytes_received: self.record.bytes_received,
            total_bytes: self.record.total_bytes,
            speed,
            remaining_time,
            estimator: self.kind(),
        }
    }
}

/// Owns every live tracker, keyed by host download id.
#[derive(Default)]
pub struct TrackerRegistry {
    entries: BTreeMap<u64, Tracker>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a tracker unless one already exists for that id.
    pub fn create(&mut self, tracker: Tracker) -> bool {
        let id = tracker.record.id;
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(id, tracker);
        true
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Tracker> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<Tracker> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn ids_in_state(&self, state: DownloadState) -> Vec<u64> {
        self.entries
            .values()
            .filter(|t| t.record.state == state)
            .map(|t| t.record.id)
            .collect()
    }

    pub fn views(&self) -> Vec<DownloadView> {
        self.entries.values().map(Tracker::view).collect()
    }
}
