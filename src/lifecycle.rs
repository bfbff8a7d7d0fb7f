//! Maps host lifecycle events and UI commands onto trackers, stats and
//! notifications.
//!
//! The [`Controller`] owns every piece of mutable core state and is driven by
//! one task at a time (see `tasks`), so nothing in here locks.

use crate::config::Settings;
use crate::error::Result;
use crate::estimator::{EstimatorKind, timestamp};
use crate::events::{Notification, Notifier};
use crate::history::{HISTORY_KEY, History, HistoryEntry, TerminalStatus};
use crate::host::{
    DownloadDelta, DownloadHost, DownloadItem, DownloadState, HostCommand, SearchQuery,
    USER_CANCELED,
};
use crate::rotation::{EstimatorRegistry, ROTATION_KEY, RotationState};
use crate::stats::{CsvExporter, ExportContext, StatsSink, StatsSnapshot};
use crate::store::{ACTIVE_DOWNLOADS_KEY, SESSION_ID_KEY, SPEED_LIMIT_KEY, Store};
use crate::tracker::{DownloadRecord, DownloadView, Tracker, TrackerRegistry};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Cause recorded when the host interrupted a download without saying why.
const UNKNOWN_CAUSE: &str = "UNKNOWN";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerInfo {
    pub session_id: String,
    pub estimator: Option<EstimatorKind>,
    pub active_count: usize,
}

pub struct Controller {
    host: Arc<dyn DownloadHost>,
    store: Store,
    registry: EstimatorRegistry,
    trackers: TrackerRegistry,
    stats: StatsSink,
    exporter: CsvExporter,
    context: ExportContext,
    history: History,
    notifier: Notifier,
    speed_limit: u64,
    rng: StdRng,
}

fn interrupted_status(cause: String) -> TerminalStatus {
    if cause == USER_CANCELED {
        TerminalStatus::Canceled
    } else {
        TerminalStatus::Failed(cause)
    }
}

/// Event handlers keep going when a write fails; the next write retries the
/// whole object anyway.
async fn persist<T: Serialize + ?Sized>(store: &mut Store, key: &str, value: &T) {
    if let Err(e) = store.set(key, value).await {
        warn!("Failed to persist {}: {}", key, e);
    }
}

impl Controller {
    pub async fn load(
        settings: &Settings,
        host: Arc<dyn DownloadHost>,
        mut store: Store,
        notifier: Notifier,
    ) -> Result<Self> {
        let session_id = match store.get::<String>(SESSION_ID_KEY) {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                store.set(SESSION_ID_KEY, &id).await?;
                info!("Created new session {}", id);
                id
            }
        };

        let rotation = store.get::<RotationState>(ROTATION_KEY);
        let history = History::new(
            settings.history_limit,
            store.get::<Vec<HistoryEntry>>(HISTORY_KEY).unwrap_or_default(),
        );
        let speed_limit = store.get::<u64>(SPEED_LIMIT_KEY).unwrap_or(0);

        info!(
            "Session {} loaded: {} history entries, estimator {}",
            session_id,
            history.len(),
            rotation.map_or("unset".to_string(), |r| r.kind.to_string())
        );

        Ok(Self {
            host,
            store,
            registry: EstimatorRegistry::new(
                settings.estimator_params(),
                settings.rotation_period(),
                rotation,
            ),
            trackers: TrackerRegistry::new(),
            stats: StatsSink::new(),
            exporter: CsvExporter::new(
                settings.stats_dir.clone(),
                settings.stats_upload_url.clone(),
            ),
            context: ExportContext {
                session_id,
                browser: settings.browser.clone(),
                platform: std::env::consts::OS.to_string(),
            },
            history,
            notifier,
            speed_limit,
            rng: StdRng::from_entropy(),
        })
    }

    pub fn host(&self) -> Arc<dyn DownloadHost> {
        self.host.clone()
    }

    pub fn tracked_count(&self) -> usize {
        self.trackers.len()
    }

    pub fn info(&self) -> ControllerInfo {
        ControllerInfo {
            session_id: self.context.session_id.clone(),
            estimator: self.registry.state().map(|s| s.kind),
            active_count: self.trackers.len(),
        }
    }

    /// Runs the rotation policy and returns the kind new downloads bind to.
    async fn current_kind(&mut self, now_ms: i64) -> EstimatorKind {
        let (state, rotated) = self.registry.check(now_ms, &mut self.rng);
        if rotated {
            persist(&mut self.store, ROTATION_KEY, &state).await;
        }
        state.kind
    }

    async fn persist_active(&mut self) {
        let snapshot = self.trackers.views();
        persist(&mut self.store, ACTIVE_DOWNLOADS_KEY, &snapshot).await;
    }

    pub async fn on_created(&mut self, item: DownloadItem, now_ms: i64) {
        let state = item.effective_state();
        if state.is_terminal() {
            debug!("Download #{} created as {:?}, not tracking", item.id, state);
            return;
        }
        if self.trackers.contains(item.id) {
            debug!("Download #{} is already tracked", item.id);
            return;
        }

        let kind = self.current_kind(now_ms).await;
        let tracker = Tracker::new(
            DownloadRecord::from_item(&item, now_ms),
            self.registry.get_estimator(kind),
        );
        info!(
            "Tracking download #{} ({}) with {} estimator",
            item.id,
            tracker.record.display_name(),
            kind
        );
        let view = tracker.view();
        self.trackers.create(tracker);
        self.notifier.publish(Notification::NewDownload(view));
        self.persist_active().await;
    }

    pub async fn on_changed(&mut self, delta: DownloadDelta, now_ms: i64) {
        let id = delta.id;
        let Some(tracker) = self.trackers.get_mut(id) else {
            debug!("Ignoring delta for untracked download #{}", id);
            return;
        };

        let mut touched = false;
        if let Some(filename) = &delta.filename {
            tracker.record.filename = filename.current.clone();
            touched = true;
        }
        if let Some(total) = &delta.total_bytes {
            tracker.record.total_bytes = if total.current > 0 { total.current } else { -1 };
            touched = true;
        }
        if let Some(bytes) = &delta.bytes_received {
            tracker.record.bytes_received = bytes.current;
            touched = true;
        }
        if touched {
            self.notifier
                .publish(Notification::DownloadProgressUpdate(tracker.view()));
        }

        match delta.state_change() {
            Some(DownloadState::Complete) => {
                self.finish(id, TerminalStatus::Completed, now_ms).await;
            }
            Some(DownloadState::Interrupted) => {
                let cause = match delta.error {
                    Some(error) => error.current,
                    None => self.lookup_error(id).await,
                };
                self.finish(id, interrupted_status(cause), now_ms).await;
            }
            Some(state) => self.transition(id, state).await,
            None => {}
        }
    }

    async fn lookup_error(&self, id: u64) -> String {
        match self.host.search(SearchQuery::by_id(id)).await {
            Ok(items) => items
                .into_iter()
                .find_map(|item| item.error)
                .unwrap_or_else(|| UNKNOWN_CAUSE.to_string()),
            Err(e) => {
                warn!("Could not look up interrupt cause for #{}: {}", id, e);
                UNKNOWN_CAUSE.to_string()
            }
        }
    }

    async fn transition(&mut self, id: u64, state: DownloadState) {
        let Some(tracker) = self.trackers.get_mut(id) else {
            return;
        };
        if !tracker.set_state(state) {
            return;
        }
        debug!("Download #{} is now {:?}", id, state);
        self.notifier
            .publish(Notification::DownloadStateChange { id, state });
        self.persist_active().await;
    }

    /// Tears down the tracker for `id`. Returns false if it was not tracked,
    /// which makes repeated terminal events harmless.
    pub async fn finish(&mut self, id: u64, status: TerminalStatus, now_ms: i64) -> bool {
        let Some(mut tracker) = self.trackers.remove(id) else {
            return false;
        };

        let samples = self.stats.len(id);
        match &status {
            TerminalStatus::Failed(cause) => {
                error!("Download #{} failed after {} samples: {}", id, samples, cause)
            }
            other => info!("Download #{} finished ({} samples): {}", id, samples, other),
        }

        if let Some(csv) = self.stats.take_csv(id, &self.context) {
            self.exporter.export(id, &self.context.session_id, csv);
        }

        let record = &tracker.record;
        self.history.push(HistoryEntry {
            id,
            filename: record.display_name().to_string(),
            url: record.url.clone(),
            start_time: timestamp(record.start_time_ms),
            end_time: timestamp(now_ms),
            file_size: record.bytes_received,
            total_size: record.total_bytes,
            mime_type: record.mime.clone(),
            status: status.clone(),
        });
        persist(&mut self.store, HISTORY_KEY, &self.history.entries()).await;

        let notification = match status {
            TerminalStatus::Completed => {
                tracker.set_state(DownloadState::Complete);
                Notification::DownloadCompleted(tracker.view())
            }
            TerminalStatus::Canceled => Notification::DownloadCanceled { id },
            TerminalStatus::Failed(error) => Notification::DownloadFailed {
                id,
                filename: tracker.record.display_name().to_string(),
                error,
            },
        };
        self.notifier.publish(notification);
        self.host.release(id);
        self.persist_active().await;
        true
    }

    /// One sampling pass over running downloads. Returns how many downloads
    /// are still tracked.
    pub async fn sample_tick(&mut self, now_ms: i64) -> usize {
        if self.trackers.ids_in_state(DownloadState::InProgress).is_empty() {
            return self.trackers.len();
        }

        let items = match self
            .host
            .search(SearchQuery::by_state(DownloadState::InProgress))
            .await
        {
            Ok(items) => items,
            Err(e) => {
                warn!("Sampling skipped, host search failed: {}", e);
                return self.trackers.len();
            }
        };

        for item in items {
            let Some(tracker) = self.trackers.get_mut(item.id) else {
                continue;
            };
            if tracker.record.state != DownloadState::InProgress {
                continue;
            }
            let Some(result) = tracker.sample(item.bytes_received, item.known_total(), now_ms)
            else {
                continue;
            };
            debug!(
                "Download #{}: {:.0} B/s, remaining {}",
                item.id, result.speed_bytes_per_sec, result.remaining_seconds
            );
            self.stats.append(StatsSnapshot::new(&tracker.record, &result));
            self.notifier
                .publish(Notification::DownloadProgressUpdate(tracker.view()));
        }

        self.trackers.len()
    }

    /// Applies the host's answer to `command`. Local state only changes once
    /// the host confirmed it.
    pub async fn apply_command(
        &mut self,
        command: HostCommand,
        id: u64,
        outcome: Result<()>,
        now_ms: i64,
    ) -> Result<()> {
        if let Err(e) = outcome {
            warn!("{} for download #{} failed: {}", command, id, e);
            return Err(e);
        }
        match command {
            HostCommand::Pause => self.transition(id, DownloadState::Paused).await,
            HostCommand::Resume => self.transition(id, DownloadState::InProgress).await,
            HostCommand::Cancel => {
                self.finish(id, TerminalStatus::Canceled, now_ms).await;
            }
            HostCommand::Open | HostCommand::Show => {}
        }
        Ok(())
    }

    /// Tracked downloads a batch `command` applies to. The host lists paused
    /// downloads as in progress, so cancel-all reaches both.
    pub fn batch_targets(&self, command: HostCommand) -> Vec<u64> {
        let mut ids = match command {
            HostCommand::Pause => self.trackers.ids_in_state(DownloadState::InProgress),
            HostCommand::Resume => self.trackers.ids_in_state(DownloadState::Paused),
            HostCommand::Cancel => {
                let mut ids = self.trackers.ids_in_state(DownloadState::InProgress);
                ids.extend(self.trackers.ids_in_state(DownloadState::Paused));
                ids
            }
            HostCommand::Open | HostCommand::Show => Vec::new(),
        };
        ids.sort_unstable();
        ids
    }

    /// Re-reads every host item: adopts running downloads we are not tracking
    /// and finishes tracked ones whose terminal event we missed.
    pub async fn refresh(&mut self, now_ms: i64) -> Result<Vec<DownloadView>> {
        let items = self.host.search(SearchQuery::all()).await?;

        for item in items {
            let state = item.effective_state();
            if !self.trackers.contains(item.id) {
                if state.is_terminal() {
                    self.host.release(item.id);
                } else {
                    self.on_created(item, now_ms).await;
                }
                continue;
            }

            match state {
                DownloadState::Complete => {
                    self.finish(item.id, TerminalStatus::Completed, now_ms).await;
                }
                DownloadState::Interrupted => {
                    let cause = item.error.unwrap_or_else(|| UNKNOWN_CAUSE.to_string());
                    self.finish(item.id, interrupted_status(cause), now_ms).await;
                }
                DownloadState::InProgress | DownloadState::Paused => {
                    if let Some(tracker) = self.trackers.get_mut(item.id) {
                        tracker.record.total_bytes = item.known_total();
                        tracker.record.bytes_received = item.bytes_received;
                        tracker.record.filename = item.filename;
                    }
                    self.transition(item.id, state).await;
                }
            }
        }

        self.persist_active().await;
        Ok(self.trackers.views())
    }

    pub fn active_downloads(&self) -> Vec<DownloadView> {
        self.trackers.views()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.entries()
    }

    pub async fn clear_history(&mut self) -> Result<()> {
        self.history.clear();
        self.store.set(HISTORY_KEY, &self.history.entries()).await?;
        info!("History cleared");
        Ok(())
    }

    pub fn speed_limit(&self) -> u64 {
        self.speed_limit
    }

    /// `0` means unlimited and removes the stored value.
    pub async fn set_speed_limit(&mut self, limit: u64) -> Result<()> {
        if limit == 0 {
            self.store.delete(SPEED_LIMIT_KEY).await?;
        } else {
            self.store.set(SPEED_LIMIT_KEY, &limit).await?;
        }
        self.speed_limit = limit;
        info!("Speed limit set to {} B/s", limit);
        Ok(())
    }
}
