//! The host download engine as seen by the companion.
//!
//! The engine itself lives in the browser. It reports items and deltas to us
//! and executes the commands we forward to it; [`BridgeHost`] is the in-process
//! side of that exchange.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// Interrupt reason the host reports for a user-initiated cancel.
pub const USER_CANCELED: &str = "USER_CANCELED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    InProgress,
    Paused,
    Interrupted,
    Complete,
}

impl DownloadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DownloadState::Interrupted | DownloadState::Complete)
    }
}

fn unknown_size() -> i64 {
    -1
}

fn in_progress() -> DownloadState {
    DownloadState::InProgress
}

/// A download as the host engine reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadItem {
    pub id: u64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(default = "unknown_size")]
    pub total_bytes: i64,
    #[serde(default = "in_progress")]
    pub state: DownloadState,
    /// Chrome keeps paused downloads `in_progress` and flags them here.
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl DownloadItem {
    pub fn effective_state(&self) -> DownloadState {
        if self.paused && self.state == DownloadState::InProgress {
            DownloadState::Paused
        } else {
            self.state
        }
    }

    /// Total size, or `-1` when unknown. Hosts report an unknown size as 0.
    pub fn known_total(&self) -> i64 {
        if self.total_bytes > 0 { self.total_bytes } else { -1 }
    }

    pub fn apply(&mut self, delta: &DownloadDelta) {
        if let Some(state) = &delta.state {
            self.state = state.current;
        }
        if let Some(paused) = &delta.paused {
            self.paused = paused.current;
        }
        if let Some(bytes) = &delta.bytes_received {
            self.bytes_received = bytes.current;
        }
        if let Some(total) = &delta.total_bytes {
            self.total_bytes = total.current;
        }
        if let Some(filename) = &delta.filename {
            self.filename = filename.current.clone();
        }
        if let Some(error) = &delta.error {
            self.error = Some(error.current.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change<T> {
    pub previous: Option<T>,
    pub current: T,
}

#[cfg(test)]
impl<T> Change<T> {
    pub fn to(current: T) -> Self {
        Self {
            previous: None,
            current,
        }
    }
}

/// One `onChanged` event. Every field is independent of the others.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadDelta {
    pub id: u64,
    #[serde(default)]
    pub state: Option<Change<DownloadState>>,
    #[serde(default)]
    pub paused: Option<Change<bool>>,
    #[serde(default)]
    pub bytes_received: Option<Change<u64>>,
    #[serde(default)]
    pub total_bytes: Option<Change<i64>>,
    #[serde(default)]
    pub filename: Option<Change<String>>,
    #[serde(default)]
    pub error: Option<Change<String>>,
}

impl DownloadDelta {
    /// The state transition carried by this delta, folding Chrome's `paused`
    /// flag into the state machine.
    pub fn state_change(&self) -> Option<DownloadState> {
        match (&self.state, &self.paused) {
            (Some(state), _) if state.current.is_terminal() => Some(state.current),
            (_, Some(paused)) if paused.current => Some(DownloadState::Paused),
            (_, Some(_)) => Some(DownloadState::InProgress),
            (Some(state), None) => Some(state.current),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub id: Option<u64>,
    pub state: Option<DownloadState>,
}

impl SearchQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: u64) -> Self {
        Self {
            id: Some(id),
            state: None,
        }
    }

    pub fn by_state(state: DownloadState) -> Self {
        Self {
            id: None,
            state: Some(state),
        }
    }

    pub fn matches(&self, item: &DownloadItem) -> bool {
        self.id.is_none_or(|id| id == item.id)
            && self.state.is_none_or(|state| state == item.effective_state())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostCommand {
    Pause,
    Resume,
    Cancel,
    Open,
    Show,
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostCommand::Pause => "pause",
            HostCommand::Resume => "resume",
            HostCommand::Cancel => "cancel",
            HostCommand::Open => "open",
            HostCommand::Show => "show",
        };
        f.write_str(name)
    }
}

/// Search and command primitives of the host engine. Every call may suspend.
pub trait DownloadHost: Send + Sync {
    fn search(&self, query: SearchQuery) -> BoxFuture<'_, Result<Vec<DownloadItem>>>;

    /// Resolves once the host confirmed the command.
    fn execute(&self, command: HostCommand, id: u64) -> BoxFuture<'_, Result<()>>;

    /// The download left tracking; the host may forget about it.
    fn release(&self, _id: u64) {}
}

/// A command forwarded to the extension.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRequest {
    pub request_id: Uuid,
    pub command: HostCommand,
    pub download_id: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAck {
    pub request_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mirrors the live items the extension reported and relays commands to it.
pub struct BridgeHost {
    items: Mutex<HashMap<u64, DownloadItem>>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<CommandAck>>>,
    requests: broadcast::Sender<HostRequest>,
    command_timeout: Duration,
}

impl BridgeHost {
    pub fn new(capacity: usize, command_timeout: Duration) -> Self {
        let (requests, _) = broadcast::channel(capacity.max(1));
        Self {
            items: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            requests,
            command_timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostRequest> {
        self.requests.subscribe()
    }

    /// Opens one extension connection on the command stream.
    pub fn connect(self: &Arc<Self>) -> CommandFeed {
        CommandFeed {
            bridge: self.clone(),
            rx: self.subscribe(),
        }
    }

    /// Drops every command still waiting for an acknowledgement; their
    /// callers see `HostUnavailable`.
    fn fail_pending(&self) {
        let dropped = lock(&self.pending).drain().count();
        if dropped > 0 {
            warn!("Extension disconnected with {} unanswered commands", dropped);
        }
    }

    pub fn record_created(&self, item: &DownloadItem) {
        if item.effective_state().is_terminal() {
            return;
        }
        lock(&self.items).insert(item.id, item.clone());
    }

    pub fn record_changed(&self, delta: &DownloadDelta) {
        match lock(&self.items).get_mut(&delta.id) {
            Some(item) => item.apply(delta),
            None => debug!("Delta for unknown host item #{}", delta.id),
        }
    }

    #[cfg(test)]
    pub fn mirrored(&self) -> usize {
        lock(&self.items).len()
    }

    /// Resolves a pending command. Returns false for unknown request ids.
    pub fn acknowledge(&self, ack: CommandAck) -> bool {
        match lock(&self.pending).remove(&ack.request_id) {
            Some(tx) => tx.send(ack).is_ok(),
            None => false,
        }
    }
}

impl DownloadHost for BridgeHost {
    fn search(&self, query: SearchQuery) -> BoxFuture<'_, Result<Vec<DownloadItem>>> {
        let mut items: Vec<DownloadItem> = lock(&self.items)
            .values()
            .filter(|item| query.matches(item))
            .cloned()
            .collect();
        items.sort_by_key(|item| item.id);
        future::ready(Ok(items)).boxed()
    }

    fn execute(&self, command: HostCommand, id: u64) -> BoxFuture<'_, Result<()>> {
        async move {
            let request_id = Uuid::new_v4();
            let (tx, rx) = oneshot::channel();
            lock(&self.pending).insert(request_id, tx);

            let request = HostRequest {
                request_id,
                command,
                download_id: id,
            };
            if self.requests.send(request).is_err() {
                lock(&self.pending).remove(&request_id);
                return Err(Error::HostUnavailable);
            }
            debug!("Forwarded {} for download #{} ({})", command, id, request_id);

            let ack = match tokio::time::timeout(self.command_timeout, rx).await {
                Ok(ack) => ack.map_err(|_| Error::HostUnavailable)?,
                Err(_) => {
                    lock(&self.pending).remove(&request_id);
                    warn!("No acknowledgement for {} of download #{}", command, id);
                    return Err(Error::HostTimeout { command, id });
                }
            };
            if ack.success {
                Ok(())
            } else {
                Err(Error::HostRejected {
                    command,
                    id,
                    reason: ack.error.unwrap_or_else(|| "unknown error".to_string()),
                })
            }
        }
        .boxed()
    }

    fn release(&self, id: u64) {
        lock(&self.items).remove(&id);
    }
}

/// A subscription to forwarded commands. When the last one goes away, the
/// commands it would have answered fail instead of waiting out the timeout.
pub struct CommandFeed {
    bridge: Arc<BridgeHost>,
    rx: broadcast::Receiver<HostRequest>,
}

impl CommandFeed {
    pub async fn next(&mut self) -> Option<HostRequest> {
        loop {
            match self.rx.recv().await {
                Ok(request) => return Some(request),
                // The skipped commands run into their timeout.
                Err(RecvError::Lagged(missed)) => {
                    warn!("Extension fell behind, {} commands skipped", missed)
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for CommandFeed {
    fn drop(&mut self) {
        // `self.rx` still counts here.
        if self.bridge.requests.receiver_count() <= 1 {
            self.bridge.fail_pending();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: u64, state: DownloadState) -> DownloadItem {
        DownloadItem {
            id,
            url: format!("https://example.com/{id}.bin"),
            filename: format!("/tmp/{id}.bin"),
            mime: None,
            bytes_received: 0,
            total_bytes: 1_000,
            state,
            paused: false,
            start_time: None,
            error: None,
        }
    }

    #[test]
    fn test_delta_deserializes_chrome_shape() {
        let delta: DownloadDelta = serde_json::from_str(
            r#"{"id": 4, "state": {"previous": "in_progress", "current": "interrupted"},
                "error": {"current": "USER_CANCELED"}}"#,
        )
        .unwrap();
        assert_eq!(delta.state_change(), Some(DownloadState::Interrupted));
        assert_eq!(delta.error.unwrap().current, USER_CANCELED);
        assert!(delta.bytes_received.is_none());

        let delta: DownloadDelta =
            serde_json::from_str(r#"{"id": 4, "state": {"current": "complete"}}"#).unwrap();
        assert_eq!(delta.state, Some(Change::to(DownloadState::Complete)));
    }

    #[test]
    fn test_paused_flag_folds_into_state() {
        let delta = DownloadDelta {
            id: 1,
            paused: Some(Change::to(true)),
            ..Default::default()
        };
        assert_eq!(delta.state_change(), Some(DownloadState::Paused));

        let delta = DownloadDelta {
            id: 1,
            paused: Some(Change::to(false)),
            ..Default::default()
        };
        assert_eq!(delta.state_change(), Some(DownloadState::InProgress));

        let delta = DownloadDelta {
            id: 1,
            state: Some(Change::to(DownloadState::Complete)),
            paused: Some(Change::to(false)),
            ..Default::default()
        };
        assert_eq!(delta.state_change(), Some(DownloadState::Complete));

        assert_eq!(DownloadDelta::default().state_change(), None);
    }

    #[test]
    fn test_item_defaults_and_known_total() {
        let item: DownloadItem = serde_json::from_str(r#"{"id": 9, "filename": "a.zip"}"#).unwrap();
        assert_eq!(item.total_bytes, -1);
        assert_eq!(item.state, DownloadState::InProgress);
        assert_eq!(item.known_total(), -1);

        let item: DownloadItem =
            serde_json::from_str(r#"{"id": 9, "totalBytes": 0, "paused": true}"#).unwrap();
        assert_eq!(item.known_total(), -1);
        assert_eq!(item.effective_state(), DownloadState::Paused);
    }

    #[tokio::test]
    async fn test_bridge_mirrors_items() {
        let bridge = BridgeHost::new(8, Duration::from_secs(2));
        bridge.record_created(&item(1, DownloadState::InProgress));
        bridge.record_created(&item(2, DownloadState::InProgress));
        bridge.record_changed(&DownloadDelta {
            id: 2,
            bytes_received: Some(Change::to(600)),
            paused: Some(Change::to(true)),
            ..Default::default()
        });

        let running = bridge.search(SearchQuery::by_state(DownloadState::InProgress)).await.unwrap();
        assert_eq!(running.iter().map(|i| i.id).collect::<Vec<_>>(), vec![1]);

        let second = bridge.search(SearchQuery::by_id(2)).await.unwrap();
        assert_eq!(second[0].bytes_received, 600);
        assert_eq!(second[0].effective_state(), DownloadState::Paused);

        assert_eq!(bridge.search(SearchQuery::all()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_command_without_extension_fails_fast() {
        let bridge = BridgeHost::new(8, Duration::from_secs(2));
        let result = bridge.execute(HostCommand::Pause, 1).await;
        assert!(matches!(result, Err(Error::HostUnavailable)));
        assert!(lock(&bridge.pending).is_empty());
    }

    #[tokio::test]
    async fn test_command_resolves_on_ack() {
        let bridge = Arc::new(BridgeHost::new(8, Duration::from_secs(2)));
        let mut rx = bridge.subscribe();

        let responder = bridge.clone();
        tokio::spawn(async move {
            while let Ok(request) = rx.recv().await {
                let success = request.command != HostCommand::Cancel;
                responder.acknowledge(CommandAck {
                    request_id: request.request_id,
                    success,
                    error: (!success).then(|| "not allowed".to_string()),
                });
            }
        });

        bridge.execute(HostCommand::Pause, 3).await.unwrap();
        let err = bridge.execute(HostCommand::Cancel, 3).await.unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_unanswered_command_times_out() {
        let bridge = BridgeHost::new(8, Duration::from_millis(50));
        let _rx = bridge.subscribe();
        let result = bridge.execute(HostCommand::Pause, 1).await;
        assert!(matches!(
            result,
            Err(Error::HostTimeout {
                command: HostCommand::Pause,
                id: 1
            })
        ));
        assert!(lock(&bridge.pending).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_commands() {
        let bridge = Arc::new(BridgeHost::new(8, Duration::from_secs(30)));
        let mut feed = bridge.connect();

        let caller = bridge.clone();
        let pending = tokio::spawn(async move { caller.execute(HostCommand::Cancel, 4).await });

        let request = feed.next().await.unwrap();
        assert_eq!(request.download_id, 4);
        drop(feed);

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::HostUnavailable)));
    }

    #[tokio::test]
    async fn test_mirror_holds_live_items_only() {
        let bridge = BridgeHost::new(8, Duration::from_secs(2));
        bridge.record_created(&item(1, DownloadState::InProgress));
        bridge.record_created(&item(2, DownloadState::Complete));
        assert_eq!(bridge.mirrored(), 1);

        bridge.record_changed(&DownloadDelta {
            id: 1,
            state: Some(Change::to(DownloadState::Complete)),
            ..Default::default()
        });
        // Still searchable until the controller is done with it.
        assert_eq!(bridge.search(SearchQuery::by_id(1)).await.unwrap().len(), 1);

        bridge.release(1);
        assert_eq!(bridge.mirrored(), 0);
    }

    #[test]
    fn test_unknown_ack_is_rejected() {
        let bridge = BridgeHost::new(8, Duration::from_secs(2));
        assert!(!bridge.acknowledge(CommandAck {
            request_id: Uuid::new_v4(),
            success: true,
            error: None,
        }));
    }
}
