use crate::config::Settings;
use crate::error::{Error, Result};
use crate::history::HistoryEntry;
use crate::host::{DownloadDelta, DownloadItem, HostCommand};
use crate::lifecycle::{Controller, ControllerInfo};
use crate::tracker::DownloadView;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

const REQUEST_CAPACITY: usize = 256;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Everything the controller task can be asked to do.
pub enum Request {
    Created(DownloadItem),
    Changed(DownloadDelta),
    Command {
        command: HostCommand,
        id: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    /// The host answered a command; applies it to local state.
    CommandDone {
        command: HostCommand,
        id: u64,
        outcome: Result<()>,
        reply: oneshot::Sender<Result<()>>,
    },
    CommandAll {
        command: HostCommand,
        reply: oneshot::Sender<usize>,
    },
    Refresh(oneshot::Sender<Result<Vec<DownloadView>>>),
    ActiveDownloads(oneshot::Sender<Vec<DownloadView>>),
    History(oneshot::Sender<Vec<HistoryEntry>>),
    ClearHistory(oneshot::Sender<Result<()>>),
    SpeedLimit(oneshot::Sender<u64>),
    SetSpeedLimit {
        limit: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    Info(oneshot::Sender<ControllerInfo>),
}

/// Cloneable front door to the controller task.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Request>,
}

impl ControllerHandle {
    async fn send(&self, request: Request) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| Error::ControllerClosed)
    }

    async fn call<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(request(reply)).await?;
        rx.await.map_err(|_| Error::ControllerClosed)
    }

    pub async fn created(&self, item: DownloadItem) -> Result<()> {
        self.send(Request::Created(item)).await
    }

    pub async fn changed(&self, delta: DownloadDelta) -> Result<()> {
        self.send(Request::Changed(delta)).await
    }

    pub async fn command(&self, command: HostCommand, id: u64) -> Result<()> {
        self.call(|reply| Request::Command { command, id, reply })
            .await?
    }

    pub async fn command_all(&self, command: HostCommand) -> Result<usize> {
        self.call(|reply| Request::CommandAll { command, reply })
            .await
    }

    pub async fn refresh(&self) -> Result<Vec<DownloadView>> {
        self.call(Request::Refresh).await?
    }

    pub async fn active_downloads(&self) -> Result<Vec<DownloadView>> {
        self.call(Request::ActiveDownloads).await
    }

    pub async fn history(&self) -> Result<Vec<HistoryEntry>> {
        self.call(Request::History).await
    }

    pub async fn clear_history(&self) -> Result<()> {
        self.call(Request::ClearHistory).await?
    }

    pub async fn speed_limit(&self) -> Result<u64> {
        self.call(Request::SpeedLimit).await
    }

    pub async fn set_speed_limit(&self, limit: u64) -> Result<()> {
        self.call(|reply| Request::SetSpeedLimit { limit, reply })
            .await?
    }

    pub async fn info(&self) -> Result<ControllerInfo> {
        self.call(Request::Info).await
    }
}

/// The periodic sampling timer. Runs only while downloads are tracked and
/// stops once the tracked count stayed at zero for the grace period.
pub struct Sampler {
    period: Duration,
    grace: Duration,
    interval: Option<Interval>,
    idle_since: Option<Instant>,
}

impl Sampler {
    pub fn new(period: Duration, grace: Duration) -> Self {
        Self {
            period,
            grace,
            interval: None,
            idle_since: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.interval.is_some()
    }

    pub fn arm(&mut self) {
        self.idle_since = None;
        if !self.is_armed() {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.interval = Some(interval);
            debug!("Sampling started");
        }
    }

    /// Completes on the next tick; never completes while disarmed.
    pub async fn tick(&mut self) {
        match &mut self.interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    pub fn observe(&mut self, active: usize, now: Instant) {
        if active > 0 {
            self.idle_since = None;
            return;
        }
        let since = *self.idle_since.get_or_insert(now);
        if now.duration_since(since) >= self.grace {
            self.interval = None;
            self.idle_since = None;
            debug!("Sampling stopped, no active downloads");
        }
    }
}

/// Host calls wait on the extension, so they run on their own task and come
/// back as `CommandDone`.
fn spawn_command(
    controller: &Controller,
    requests: &mpsc::WeakSender<Request>,
    command: HostCommand,
    id: u64,
    reply: oneshot::Sender<Result<()>>,
) {
    let Some(tx) = requests.upgrade() else {
        return;
    };
    let host = controller.host();
    tokio::spawn(async move {
        let outcome = host.execute(command, id).await;
        let done = Request::CommandDone {
            command,
            id,
            outcome,
            reply,
        };
        if tx.send(done).await.is_err() {
            debug!("Controller gone before {} of download #{} finished", command, id);
        }
    });
}

/// Runs a batch one command after another, each through the controller.
fn spawn_batch(
    controller: &Controller,
    requests: &mpsc::WeakSender<Request>,
    command: HostCommand,
    reply: oneshot::Sender<usize>,
) {
    let Some(tx) = requests.upgrade() else {
        return;
    };
    let ids = controller.batch_targets(command);
    let handle = ControllerHandle { tx };
    tokio::spawn(async move {
        let total = ids.len();
        let mut affected = 0;
        for id in ids {
            if handle.command(command, id).await.is_ok() {
                affected += 1;
            }
        }
        info!("Batch {}: {}/{} downloads", command, affected, total);
        let _ = reply.send(affected);
    });
}

async fn handle(
    controller: &mut Controller,
    requests: &mpsc::WeakSender<Request>,
    request: Request,
) {
    match request {
        Request::Created(item) => controller.on_created(item, now_ms()).await,
        Request::Changed(delta) => controller.on_changed(delta, now_ms()).await,
        Request::Command { command, id, reply } => {
            spawn_command(controller, requests, command, id, reply);
        }
        Request::CommandDone {
            command,
            id,
            outcome,
            reply,
        } => {
            let result = controller
                .apply_command(command, id, outcome, now_ms())
                .await;
            let _ = reply.send(result);
        }
        Request::CommandAll { command, reply } => {
            spawn_batch(controller, requests, command, reply);
        }
        Request::Refresh(reply) => {
            let _ = reply.send(controller.refresh(now_ms()).await);
        }
        Request::ActiveDownloads(reply) => {
            let _ = reply.send(controller.active_downloads());
        }
        Request::History(reply) => {
            let _ = reply.send(controller.history());
        }
        Request::ClearHistory(reply) => {
            let _ = reply.send(controller.clear_history().await);
        }
        Request::SpeedLimit(reply) => {
            let _ = reply.send(controller.speed_limit());
        }
        Request::SetSpeedLimit { limit, reply } => {
            let _ = reply.send(controller.set_speed_limit(limit).await);
        }
        Request::Info(reply) => {
            let _ = reply.send(controller.info());
        }
    }
}

/// Spawns the task that owns the controller. Requests and sampling ticks are
/// handled one at a time, each to completion. Nothing in here waits on the
/// extension.
pub fn start_background_tasks(controller: Controller, settings: &Settings) -> ControllerHandle {
    let (tx, mut rx) = mpsc::channel(REQUEST_CAPACITY);
    let requests = tx.downgrade();
    let mut sampler = Sampler::new(settings.sample_interval(), settings.idle_grace());
    let mut controller = controller;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                request = rx.recv() => {
                    let Some(request) = request else { break };
                    handle(&mut controller, &requests, request).await;
                    if controller.tracked_count() > 0 {
                        sampler.arm();
                    }
                }
                _ = sampler.tick() => {
                    let active = controller.sample_tick(now_ms()).await;
                    sampler.observe(active, Instant::now());
                }
            }
        }
        info!("Controller task stopped");
    });

    ControllerHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Notification, Notifier};
    use crate::host::{BridgeHost, Change, CommandAck, DownloadState};
    use crate::store::Store;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sampler_grace_period() {
        let grace = Duration::from_secs(5);
        let mut sampler = Sampler::new(Duration::from_secs(1), grace);
        assert!(!sampler.is_armed());

        sampler.arm();
        assert!(sampler.is_armed());

        let t0 = Instant::now();
        sampler.observe(0, t0);
        sampler.observe(0, t0 + Duration::from_secs(3));
        assert!(sampler.is_armed());

        // A blip of activity restarts the grace period.
        sampler.observe(1, t0 + Duration::from_secs(4));
        sampler.observe(0, t0 + Duration::from_secs(6));
        sampler.observe(0, t0 + Duration::from_secs(10));
        assert!(sampler.is_armed());

        sampler.observe(0, t0 + Duration::from_secs(11));
        assert!(!sampler.is_armed());
    }

    #[tokio::test]
    async fn test_disarmed_sampler_never_ticks() {
        let mut sampler = Sampler::new(Duration::from_millis(1), Duration::ZERO);
        let result = tokio::time::timeout(Duration::from_millis(30), sampler.tick()).await;
        assert!(result.is_err());

        sampler.arm();
        tokio::time::timeout(Duration::from_millis(100), sampler.tick())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_controller_reports_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = ControllerHandle { tx };
        assert!(matches!(
            handle.active_downloads().await,
            Err(Error::ControllerClosed)
        ));
    }

    #[tokio::test]
    async fn test_ticks_sample_running_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::for_tests(dir.path().to_path_buf());
        settings.sample_interval_ms = 10;

        let bridge = Arc::new(BridgeHost::new(8, settings.command_timeout()));
        let notifier = Notifier::new(64);
        let mut rx = notifier.subscribe();
        let controller = Controller::load(&settings, bridge.clone(), Store::in_memory(), notifier)
            .await
            .unwrap();
        let handle = start_background_tasks(controller, &settings);

        let item: DownloadItem =
            serde_json::from_str(r#"{"id": 1, "filename": "a.bin", "totalBytes": 1000}"#).unwrap();
        bridge.record_created(&item);
        handle.created(item).await.unwrap();
        bridge.record_changed(&DownloadDelta {
            id: 1,
            bytes_received: Some(Change::to(500)),
            ..Default::default()
        });

        let sampled = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(Notification::DownloadProgressUpdate(view)) = rx.recv().await
                    && view.bytes_received == 500
                {
                    return view;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(sampled.progress, 50);
        assert_eq!(sampled.state, DownloadState::InProgress);

        let active = handle.active_downloads().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(handle.info().await.unwrap().active_count, 1);
    }

    async fn started(
        settings: &Settings,
    ) -> (ControllerHandle, Arc<BridgeHost>, tokio::sync::broadcast::Receiver<Notification>) {
        let bridge = Arc::new(BridgeHost::new(8, settings.command_timeout()));
        let notifier = Notifier::new(64);
        let rx = notifier.subscribe();
        let controller = Controller::load(settings, bridge.clone(), Store::in_memory(), notifier)
            .await
            .unwrap();
        (start_background_tasks(controller, settings), bridge, rx)
    }

    async fn track(handle: &ControllerHandle, bridge: &BridgeHost, id: u64) {
        let item: DownloadItem =
            serde_json::from_value(serde_json::json!({"id": id, "totalBytes": 1000})).unwrap();
        bridge.record_created(&item);
        handle.created(item).await.unwrap();
    }

    #[tokio::test]
    async fn test_unanswered_command_does_not_block_other_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::for_tests(dir.path().to_path_buf());
        settings.sample_interval_ms = 10;
        settings.command_timeout_ms = 60_000;
        let (handle, bridge, mut rx) = started(&settings).await;
        track(&handle, &bridge, 1).await;
        track(&handle, &bridge, 2).await;

        // Connected, but never answers.
        let mut feed = bridge.connect();
        let pausing = handle.clone();
        let pause = tokio::spawn(async move { pausing.command(HostCommand::Pause, 1).await });
        assert_eq!(feed.next().await.unwrap().download_id, 1);

        let active = tokio::time::timeout(Duration::from_secs(2), handle.active_downloads())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|v| v.state == DownloadState::InProgress));

        // Sampling keeps running for the other download.
        bridge.record_changed(&DownloadDelta {
            id: 2,
            bytes_received: Some(Change::to(300)),
            ..Default::default()
        });
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(Notification::DownloadProgressUpdate(view)) = rx.recv().await
                    && view.id == 2
                    && view.bytes_received == 300
                {
                    return;
                }
            }
        })
        .await
        .unwrap();

        // The extension goes away mid-command.
        drop(feed);
        let result = tokio::time::timeout(Duration::from_secs(2), pause)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::HostUnavailable)));
        assert_eq!(handle.info().await.unwrap().active_count, 2);
    }

    #[tokio::test]
    async fn test_late_ack_applies_through_controller() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::for_tests(dir.path().to_path_buf());
        let (handle, bridge, _rx) = started(&settings).await;
        track(&handle, &bridge, 1).await;
        track(&handle, &bridge, 2).await;

        let mut feed = bridge.connect();
        let batch = handle.clone();
        let cancel_all = tokio::spawn(async move { batch.command_all(HostCommand::Cancel).await });

        let first = feed.next().await.unwrap();
        // Other requests are served while the batch waits.
        assert_eq!(handle.active_downloads().await.unwrap().len(), 2);
        bridge.acknowledge(CommandAck {
            request_id: first.request_id,
            success: true,
            error: None,
        });
        let second = feed.next().await.unwrap();
        bridge.acknowledge(CommandAck {
            request_id: second.request_id,
            success: false,
            error: Some("busy".to_string()),
        });

        assert_eq!(cancel_all.await.unwrap().unwrap(), 1);
        let active = handle.active_downloads().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.download_id);
        assert_eq!(bridge.mirrored(), 1);
    }
}
