//! Per-source feed worker
//!
//! One [`FeedWorker`] owns one source's cursor for its whole lifetime. The
//! worker runs an open/pump/recover loop: open a cursor at the cached
//! checkpoint, pump records into the sink, and on failure pick a recovery
//! strategy from the error class. Resume tokens are cached after every
//! dispatched record so a reopen continues where the cursor left off.

use crate::config::NotificationConfig;
use crate::error::FeedError;
use crate::event::{ChangeEvent, ChangeOp, Checkpoint};
use crate::feed::{CursorSpec, FilterStage, HydrationMode, SharedFeed};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Lifecycle state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerStatus {
    /// Created, first cursor not open yet
    Starting,
    /// Cursor open, pumping records
    Running,
    /// Cursor lost to an anticipated failure, reopening after backoff
    Reconnecting,
    /// Unexpected failure, reopening after backoff
    Error,
    /// Stopped; terminal
    Stopped,
}

impl WorkerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Reconnecting,
            3 => Self::Error,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a worker hands its decoded events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn dispatch(&self, event: ChangeEvent);
}

enum PumpEnd {
    Stopped,
    CursorClosed,
    Failed(FeedError),
}

/// Worker for a single source.
pub struct FeedWorker {
    source: String,
    feed: SharedFeed,
    mode: HydrationMode,
    stages: Vec<FilterStage>,
    status: AtomicU8,
    stopping: AtomicBool,
    stop_signal: Notify,
    checkpoint: Mutex<Option<Checkpoint>>,
    events_processed: AtomicU64,
    short_backoff: Duration,
    reconnect_backoff: Duration,
}

impl FeedWorker {
    pub fn new(
        source: impl Into<String>,
        feed: SharedFeed,
        mode: HydrationMode,
        stages: Vec<FilterStage>,
        resume_from: Option<Checkpoint>,
        config: &NotificationConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            source: source.into(),
            feed,
            mode,
            stages,
            status: AtomicU8::new(WorkerStatus::Starting as u8),
            stopping: AtomicBool::new(false),
            stop_signal: Notify::new(),
            checkpoint: Mutex::new(resume_from),
            events_processed: AtomicU64::new(0),
            short_backoff: config.short_backoff,
            reconnect_backoff: config.reconnect_backoff,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn mode(&self) -> HydrationMode {
        self.mode
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Records dispatched by this worker since it started.
    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    /// Last cached resume token; survives the worker for later restarts.
    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.checkpoint.lock().unwrap().clone()
    }

    /// Ask the worker to wind down. Interrupts backoff sleeps and cursor
    /// waits; safe to call more than once.
    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::Release);
        // notify_one stores a permit, so a stop requested while the worker
        // is between awaits is not lost.
        self.stop_signal.notify_one();
    }

    fn set_status(&self, status: WorkerStatus) {
        let prev = self.status.swap(status as u8, Ordering::AcqRel);
        if prev != status as u8 {
            debug!(source = %self.source, from = %WorkerStatus::from_u8(prev), to = %status, "worker state change");
        }
    }

    /// Main loop; runs until [`request_stop`](Self::request_stop).
    pub async fn run(self: Arc<Self>, sink: Arc<dyn EventSink>) {
        info!(source = %self.source, mode = ?self.mode, "worker starting");
        while !self.stopping.load(Ordering::Acquire) {
            let spec = CursorSpec {
                source: self.source.clone(),
                mode: self.mode,
                stages: self.stages.clone(),
                resume_from: self.checkpoint(),
            };
            let resuming = spec.resume_from.is_some();

            match self.feed.open_cursor(spec).await {
                Ok(mut cursor) => {
                    self.set_status(WorkerStatus::Running);
                    info!(source = %self.source, resuming, "cursor open");
                    match self.pump(cursor.as_mut(), &sink).await {
                        PumpEnd::Stopped => break,
                        PumpEnd::CursorClosed => {
                            warn!(source = %self.source, "cursor closed upstream");
                            self.set_status(WorkerStatus::Reconnecting);
                            if !self.backoff(self.reconnect_backoff).await {
                                break;
                            }
                        }
                        PumpEnd::Failed(FeedError::InvalidCheckpoint) => {
                            warn!(source = %self.source, "resume token rejected mid-stream, restarting from now");
                            self.checkpoint.lock().unwrap().take();
                            self.set_status(WorkerStatus::Reconnecting);
                            if !self.backoff(self.short_backoff).await {
                                break;
                            }
                        }
                        PumpEnd::Failed(err) => {
                            warn!(source = %self.source, %err, "cursor failed");
                            self.set_status(WorkerStatus::Reconnecting);
                            if !self.backoff(self.reconnect_backoff).await {
                                break;
                            }
                        }
                    }
                }
                Err(FeedError::InvalidCheckpoint) => {
                    warn!(source = %self.source, "resume token rejected, restarting from now");
                    self.checkpoint.lock().unwrap().take();
                    self.set_status(WorkerStatus::Reconnecting);
                    if !self.backoff(self.short_backoff).await {
                        break;
                    }
                }
                Err(FeedError::Transport(msg)) => {
                    warn!(source = %self.source, error = %msg, "feed unreachable, will retry");
                    self.set_status(WorkerStatus::Reconnecting);
                    if !self.backoff(self.reconnect_backoff).await {
                        break;
                    }
                }
                Err(err) => {
                    error!(source = %self.source, %err, "unexpected failure opening cursor");
                    self.set_status(WorkerStatus::Error);
                    if !self.backoff(self.reconnect_backoff).await {
                        break;
                    }
                }
            }
        }
        self.set_status(WorkerStatus::Stopped);
        info!(source = %self.source, events = self.events_processed(), "worker stopped");
    }

    /// Read one cursor until it ends, fails, or the worker is stopped.
    async fn pump(&self, cursor: &mut dyn crate::feed::ChangeCursor, sink: &Arc<dyn EventSink>) -> PumpEnd {
        loop {
            let next = tokio::select! {
                _ = self.stop_signal.notified() => return PumpEnd::Stopped,
                next = cursor.next() => next,
            };
            match next {
                Ok(Some(raw)) => {
                    let checkpoint = raw.checkpoint.clone();
                    if let Some(event) = self.decode(raw) {
                        sink.dispatch(event).await;
                        self.events_processed.fetch_add(1, Ordering::Relaxed);
                    }
                    // Advance past skipped records too, so they are not
                    // replayed on reconnect.
                    *self.checkpoint.lock().unwrap() = Some(checkpoint);
                }
                Ok(None) => return PumpEnd::CursorClosed,
                Err(err) if err.is_record_scoped() => {
                    warn!(source = %self.source, %err, "skipping undecodable record");
                }
                Err(err) => return PumpEnd::Failed(err),
            }
        }
    }

    /// Turn a raw record into a dispatchable event; `None` means skip.
    fn decode(&self, raw: crate::feed::RawChange) -> Option<ChangeEvent> {
        let op = match raw.op {
            None => {
                debug!(source = %self.source, "dropping unclassifiable record");
                return None;
            }
            Some(op) => op,
        };
        let delta = match op {
            ChangeOp::Update => Some(raw.delta.unwrap_or_default()),
            _ => None,
        };
        Some(ChangeEvent {
            op,
            source: self.source.clone(),
            entity: self.source.clone(),
            key: raw.key,
            post_image: raw.post_image,
            delta,
            timestamp_ms: raw.commit_ts_ms.unwrap_or_else(now_millis),
            checkpoint: raw.checkpoint,
        })
    }

    /// Sleep unless a stop comes in first; returns false on stop.
    async fn backoff(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stop_signal.notified() => false,
            _ = tokio::time::sleep(duration) => !self.stopping.load(Ordering::Acquire),
        }
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::UpdateDelta;
    use crate::memory::MemoryFeed;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct ChannelSink(mpsc::UnboundedSender<ChangeEvent>);

    #[async_trait]
    impl EventSink for ChannelSink {
        async fn dispatch(&self, event: ChangeEvent) {
            let _ = self.0.send(event);
        }
    }

    fn test_config() -> NotificationConfig {
        NotificationConfig::new()
            .with_short_backoff(Duration::from_millis(20))
            .with_reconnect_backoff(Duration::from_millis(40))
            .with_shutdown_grace(Duration::from_millis(250))
    }

    fn spawn_worker(
        feed: &MemoryFeed,
        source: &str,
        resume_from: Option<Checkpoint>,
    ) -> (
        Arc<FeedWorker>,
        tokio::task::JoinHandle<()>,
        mpsc::UnboundedReceiver<ChangeEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = FeedWorker::new(
            source,
            Arc::new(feed.clone()) as SharedFeed,
            HydrationMode::BestEffort,
            Vec::new(),
            resume_from,
            &test_config(),
        );
        let handle = tokio::spawn(worker.clone().run(Arc::new(ChannelSink(tx))));
        (worker, handle, rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>) -> ChangeEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    async fn wait_status(worker: &Arc<FeedWorker>, wanted: WorkerStatus) {
        timeout(Duration::from_secs(2), async {
            while worker.status() != wanted {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("worker never reached {wanted}, is {}", worker.status()));
    }

    #[tokio::test]
    async fn test_pumps_events_and_caches_checkpoint() {
        let feed = MemoryFeed::new();
        feed.register_source("orders");
        let (worker, handle, mut rx) = spawn_worker(&feed, "orders", None);
        wait_status(&worker, WorkerStatus::Running).await;

        feed.push_insert("orders", json!(1), json!({"id": 1}));
        let event = recv(&mut rx).await;
        assert_eq!(event.op, ChangeOp::Insert);
        assert_eq!(event.source, "orders");
        assert_eq!(worker.events_processed(), 1);
        assert_eq!(worker.checkpoint(), Some(Checkpoint::new("0")));

        worker.request_stop();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(worker.status(), WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_rejected_token_drops_checkpoint_and_recovers() {
        let feed = MemoryFeed::new();
        feed.register_source("orders");
        // No record with seq 99 exists, so the first open is rejected.
        let (worker, handle, mut rx) =
            spawn_worker(&feed, "orders", Some(Checkpoint::new("99")));

        wait_status(&worker, WorkerStatus::Running).await;
        let spec = feed.last_spec("orders").unwrap();
        assert!(spec.resume_from.is_none());

        feed.push_insert("orders", json!(1), json!({"id": 1}));
        recv(&mut rx).await;

        worker.request_stop();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_checkpoint() {
        let feed = MemoryFeed::new();
        feed.push_insert("orders", json!(1), json!({"id": 1}));
        feed.fail_next_open("orders", FeedError::transport("connection refused"));

        let (worker, handle, _rx) =
            spawn_worker(&feed, "orders", Some(Checkpoint::new("0")));

        wait_status(&worker, WorkerStatus::Running).await;
        // The retry still carried the original token.
        let spec = feed.last_spec("orders").unwrap();
        assert_eq!(spec.resume_from, Some(Checkpoint::new("0")));

        worker.request_stop();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_open_failure_enters_error_state() {
        let feed = MemoryFeed::new();
        feed.register_source("orders");
        feed.fail_next_open("orders", FeedError::decode("handshake garbage"));

        let (worker, handle, _rx) = spawn_worker(&feed, "orders", None);

        wait_status(&worker, WorkerStatus::Error).await;
        // Recovers on its own once the failure clears.
        wait_status(&worker, WorkerStatus::Running).await;

        worker.request_stop();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_record_skipped_stream_continues() {
        let feed = MemoryFeed::new();
        feed.register_source("orders");
        let (worker, handle, mut rx) = spawn_worker(&feed, "orders", None);
        wait_status(&worker, WorkerStatus::Running).await;

        feed.push_decode_error("orders", "corrupt");
        feed.push_insert("orders", json!(2), json!({"id": 2}));

        let event = recv(&mut rx).await;
        assert_eq!(event.key, Some(json!(2)));
        assert_eq!(worker.status(), WorkerStatus::Running);

        worker.request_stop();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unclassified_record_advances_checkpoint_without_dispatch() {
        let feed = MemoryFeed::new();
        feed.register_source("orders");
        let (worker, handle, mut rx) = spawn_worker(&feed, "orders", None);
        wait_status(&worker, WorkerStatus::Running).await;

        feed.push_unclassified("orders");
        feed.push_insert("orders", json!(3), json!({"id": 3}));

        let event = recv(&mut rx).await;
        assert_eq!(event.key, Some(json!(3)));
        assert_eq!(worker.events_processed(), 1);
        assert_eq!(worker.checkpoint(), Some(Checkpoint::new("1")));

        worker.request_stop();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_other_operations_are_dispatched() {
        let feed = MemoryFeed::new();
        feed.register_source("orders");
        let (worker, handle, mut rx) = spawn_worker(&feed, "orders", None);
        wait_status(&worker, WorkerStatus::Running).await;

        feed.push_raw(
            "orders",
            crate::feed::RawChange {
                op: Some(ChangeOp::Other),
                key: None,
                post_image: None,
                delta: None,
                commit_ts_ms: Some(1),
                checkpoint: Checkpoint::new(""),
            },
        );

        let event = recv(&mut rx).await;
        assert_eq!(event.op, ChangeOp::Other);
        assert!(event.delta.is_none());

        worker.request_stop();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_interrupts_idle_cursor_wait() {
        let feed = MemoryFeed::new();
        feed.register_source("orders");
        let (worker, handle, _rx) = spawn_worker(&feed, "orders", None);
        wait_status(&worker, WorkerStatus::Running).await;

        worker.request_stop();
        timeout(Duration::from_millis(500), handle)
            .await
            .expect("stop should not wait for a record")
            .unwrap();
        assert_eq!(worker.status(), WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_update_without_delta_gets_empty_delta() {
        let feed = MemoryFeed::new();
        feed.register_source("users");
        let (worker, handle, mut rx) = spawn_worker(&feed, "users", None);
        wait_status(&worker, WorkerStatus::Running).await;

        feed.push_raw(
            "users",
            crate::feed::RawChange {
                op: Some(ChangeOp::Update),
                key: Some(json!(1)),
                post_image: None,
                delta: None,
                commit_ts_ms: None,
                checkpoint: Checkpoint::new(""),
            },
        );

        let event = recv(&mut rx).await;
        assert_eq!(event.delta, Some(UpdateDelta::new()));
        assert!(event.timestamp_ms > 0);

        worker.request_stop();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
