use crate::host::DownloadState;
use crate::tracker::DownloadView;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Outbound notifications. Delivery is best-effort and at most once.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
    NewDownload(DownloadView),
    DownloadProgressUpdate(DownloadView),
    DownloadStateChange { id: u64, state: DownloadState },
    DownloadCompleted(DownloadView),
    DownloadCanceled { id: u64 },
    DownloadFailed { id: u64, filename: String, error: String },
}

impl Notification {
    pub fn download_id(&self) -> u64 {
        match self {
            Notification::NewDownload(view)
            | Notification::DownloadProgressUpdate(view)
            | Notification::DownloadCompleted(view) => view.id,
            Notification::DownloadStateChange { id, .. }
            | Notification::DownloadCanceled { id }
            | Notification::DownloadFailed { id, .. } => *id,
        }
    }
}

/// Publish side of the notification bus; subscribers are UI streams.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, notification: Notification) {
        trace!("Publishing notification for download #{}", notification.download_id());
        // No receiver is fine: the popup is usually closed.
        let _ = self.tx.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}
