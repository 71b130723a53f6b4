//! Notification manager
//!
//! Central coordinator: owns the listener registry, the watch table, the
//! checkpoint cache, and one [`FeedWorker`] per watched source. All shared
//! state lives behind a single `RwLock`; workers take it for reading on every
//! dispatch, administrative calls take it for writing.
//!
//! Lifecycle: `start` binds a feed and a hydration mode, `watch_*` spawns
//! workers, `stop` winds everything down and forgets all registrations.
//! Restarting with a different mode recycles the workers but keeps
//! listeners, watches, and cached checkpoints.

use crate::config::NotificationConfig;
use crate::error::{FanoutError, Result};
use crate::event::{ChangeEvent, Checkpoint};
use crate::feed::{FilterStage, HydrationMode, SharedFeed};
use crate::listener::{ChangeListener, ListenerRegistration};
use crate::worker::{EventSink, FeedWorker, WorkerStatus};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Sources whose names start with this prefix are skipped by `watch_all`.
const SYSTEM_SOURCE_PREFIX: &str = "system.";

#[derive(Clone)]
struct WatchSpec {
    stages: Vec<FilterStage>,
}

struct WorkerHandle {
    worker: Arc<FeedWorker>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    global: Vec<ListenerRegistration>,
    by_source: HashMap<String, Vec<ListenerRegistration>>,
    watches: HashMap<String, WatchSpec>,
    workers: HashMap<String, WorkerHandle>,
    checkpoints: HashMap<String, Checkpoint>,
    feed: Option<SharedFeed>,
    mode: HydrationMode,
}

pub(crate) struct ManagerInner {
    config: NotificationConfig,
    running: AtomicBool,
    total_events: AtomicU64,
    registry: RwLock<Registry>,
    /// Serializes start/stop so the drain-then-respawn window of one
    /// lifecycle call cannot interleave with another.
    lifecycle: Mutex<()>,
}

impl ManagerInner {
    /// Deliver one event to every matching listener, global first, then the
    /// event's source scope, in registration order. Panicking listeners are
    /// contained; a listener that blocks stalls its worker only.
    async fn dispatch(&self, event: ChangeEvent) {
        // Checked before taking the lock so workers draining during `stop`
        // never contend with the shutdown write lock.
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let registry = self.registry.read().await;
        self.total_events.fetch_add(1, Ordering::Relaxed);
        for registration in &registry.global {
            if registration.accepts(&event) {
                registration.deliver(&event);
            }
        }
        if let Some(scoped) = registry.by_source.get(&event.source) {
            for registration in scoped {
                if registration.accepts(&event) {
                    registration.deliver(&event);
                }
            }
        }
    }
}

/// Workers hold the manager weakly so a dropped manager tears down cleanly.
struct WeakSink(Weak<ManagerInner>);

#[async_trait]
impl EventSink for WeakSink {
    async fn dispatch(&self, event: ChangeEvent) {
        if let Some(inner) = self.0.upgrade() {
            inner.dispatch(event).await;
        }
    }
}

/// Change-notification fan-out manager.
///
/// Cheap to clone via the interior `Arc`; all methods take `&self`.
#[derive(Clone)]
pub struct NotificationManager {
    inner: Arc<ManagerInner>,
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationManager {
    /// Manager with default timings.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config: NotificationConfig::default(),
                running: AtomicBool::new(false),
                total_events: AtomicU64::new(0),
                registry: RwLock::new(Registry::default()),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    /// Manager with explicit timings.
    pub fn with_config(config: NotificationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                running: AtomicBool::new(false),
                total_events: AtomicU64::new(0),
                registry: RwLock::new(Registry::default()),
                lifecycle: Mutex::new(()),
            }),
        })
    }

    /// Bind a feed and start dispatching.
    ///
    /// Calling `start` on a running manager with the same hydration mode is
    /// a no-op. With a different mode, every worker is recycled so new
    /// cursors pick up the new mode; listeners, watches, and cached
    /// checkpoints all survive the restart.
    pub async fn start(&self, feed: SharedFeed, mode: HydrationMode) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let stopped = {
            let mut registry = self.inner.registry.write().await;
            if self.inner.running.load(Ordering::Acquire) {
                if registry.mode == mode {
                    warn!("manager already started, ignoring");
                    return Ok(());
                }
                info!(from = ?registry.mode, to = ?mode, "hydration mode change, recycling workers");
                // Dispatch pauses for the duration of the recycle.
                self.inner.running.store(false, Ordering::Release);
                drain_workers(&mut registry)
            } else {
                Vec::new()
            }
        };
        join_with_grace(stopped, self.inner.config.shutdown_grace).await;

        let mut registry = self.inner.registry.write().await;
        registry.feed = Some(feed);
        registry.mode = mode;
        // Sources with an explicit watch or at least one scoped listener all
        // get a worker.
        let mut watches: Vec<(String, Vec<FilterStage>)> = registry
            .watches
            .iter()
            .map(|(source, spec)| (source.clone(), spec.stages.clone()))
            .collect();
        for source in registry.by_source.keys() {
            if !registry.watches.contains_key(source) {
                watches.push((source.clone(), Vec::new()));
            }
        }
        for (source, stages) in watches {
            self.spawn_worker_locked(&mut registry, &source, stages)?;
        }
        self.inner.running.store(true, Ordering::Release);
        info!(mode = ?mode, watched = registry.watches.len(), "manager started");
        Ok(())
    }

    /// Stop dispatching and forget all listeners, watches, and checkpoints.
    ///
    /// Safe to call on a stopped manager.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        // Flipped before the write lock so in-flight dispatches bail out
        // instead of queueing behind the shutdown.
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            warn!("manager already stopped, ignoring");
            return;
        }
        let stopped = {
            let mut registry = self.inner.registry.write().await;
            let stopped = drain_workers(&mut registry);
            registry.global.clear();
            registry.by_source.clear();
            registry.watches.clear();
            registry.checkpoints.clear();
            registry.feed = None;
            registry.mode = HydrationMode::default();
            stopped
        };
        join_with_grace(stopped, self.inner.config.shutdown_grace).await;
        info!(
            events = self.inner.total_events.load(Ordering::Relaxed),
            "manager stopped"
        );
    }

    /// Watch a source with no upstream filtering.
    pub async fn watch_source(&self, source: &str) -> Result<()> {
        self.install_watch(source.to_string(), Vec::new()).await
    }

    /// Watch every source the feed reports, skipping system sources.
    pub async fn watch_all(&self) -> Result<()> {
        let feed = {
            let registry = self.inner.registry.read().await;
            if !self.inner.running.load(Ordering::Acquire) {
                return Err(FanoutError::invalid_state("manager not started"));
            }
            registry.feed.clone()
        };
        let feed = feed.ok_or_else(|| FanoutError::invalid_state("manager not started"))?;
        let sources = feed.list_sources().await?;
        for source in sources {
            if source.starts_with(SYSTEM_SOURCE_PREFIX) {
                debug!(%source, "skipping system source");
                continue;
            }
            self.install_watch(source, Vec::new()).await?;
        }
        Ok(())
    }

    /// Stop watching one source.
    ///
    /// The worker's resume token stays cached, so a later watch of the same
    /// source continues where this one stopped. Unknown sources are ignored.
    pub async fn unwatch_source(&self, source: &str) -> Result<()> {
        let stopped = {
            let mut registry = self.inner.registry.write().await;
            if registry.watches.remove(source).is_none() {
                warn!(%source, "not watching, ignoring unwatch");
                return Ok(());
            }
            match registry.workers.remove(source) {
                Some(handle) => {
                    if let Some(checkpoint) = handle.worker.checkpoint() {
                        registry.checkpoints.insert(source.to_string(), checkpoint);
                    }
                    handle.worker.request_stop();
                    vec![(source.to_string(), handle.task)]
                }
                None => Vec::new(),
            }
        };
        join_with_grace(stopped, self.inner.config.shutdown_grace).await;
        Ok(())
    }

    /// Stop watching everything; listeners and checkpoints stay registered.
    pub async fn unwatch_all(&self) -> Result<()> {
        let stopped = {
            let mut registry = self.inner.registry.write().await;
            registry.watches.clear();
            drain_workers(&mut registry)
        };
        join_with_grace(stopped, self.inner.config.shutdown_grace).await;
        Ok(())
    }

    /// Register a listener for events from every watched source.
    ///
    /// Registering the same handle twice is a no-op.
    pub async fn register_listener(&self, listener: ChangeListener) {
        let registration = ListenerRegistration::new(listener, None);
        let mut registry = self.inner.registry.write().await;
        if registry.global.contains(&registration) {
            warn!("listener already registered globally, ignoring");
            return;
        }
        registry.global.push(registration);
    }

    /// Register a listener scoped to the given sources.
    ///
    /// While the manager is running, a scoped source without a watch gets
    /// one implicitly. An empty source list is a configuration error, not
    /// an implicit global registration.
    pub async fn register_for_sources(
        &self,
        sources: &[&str],
        listener: ChangeListener,
    ) -> Result<()> {
        if sources.is_empty() {
            return Err(FanoutError::config("source scope must not be empty"));
        }
        let sources: Vec<String> = sources.iter().map(|s| s.to_string()).collect();
        self.register_registration(sources, ListenerRegistration::new(listener, None))
            .await
    }

    pub(crate) async fn register_registration(
        &self,
        sources: Vec<String>,
        registration: ListenerRegistration,
    ) -> Result<()> {
        if sources.iter().any(|s| s.is_empty()) {
            return Err(FanoutError::config("source name must not be empty"));
        }
        let mut registry = self.inner.registry.write().await;
        if sources.is_empty() {
            if registry.global.contains(&registration) {
                warn!("listener already registered globally, ignoring");
                return Ok(());
            }
            registry.global.push(registration);
            return Ok(());
        }
        for source in sources {
            let scoped = registry.by_source.entry(source.clone()).or_default();
            if scoped.contains(&registration) {
                warn!(%source, "listener already registered for source, ignoring");
                continue;
            }
            scoped.push(registration.clone());
            // Lazy watch: a running manager spins up a worker for any newly
            // scoped source.
            if self.inner.running.load(Ordering::Acquire)
                && !registry.watches.contains_key(&source)
            {
                self.spawn_worker_locked(&mut registry, &source, Vec::new())?;
            }
        }
        Ok(())
    }

    /// Remove a listener from the global scope and from every source scope.
    ///
    /// Returns true when at least one registration was removed.
    pub async fn unregister_listener(&self, listener: &ChangeListener) -> bool {
        let mut registry = self.inner.registry.write().await;
        let before = registry.global.len();
        registry.global.retain(|reg| !reg.wraps(listener));
        let mut removed = registry.global.len() != before;
        registry.by_source.retain(|_, scoped| {
            let len = scoped.len();
            scoped.retain(|reg| !reg.wraps(listener));
            removed |= scoped.len() != len;
            !scoped.is_empty()
        });
        if !removed {
            warn!("listener was not registered, ignoring unregister");
        }
        removed
    }

    /// Remove a listener from one source scope only.
    pub async fn unregister_listener_from(&self, source: &str, listener: &ChangeListener) -> bool {
        let mut registry = self.inner.registry.write().await;
        let Some(scoped) = registry.by_source.get_mut(source) else {
            return false;
        };
        let before = scoped.len();
        scoped.retain(|reg| !reg.wraps(listener));
        let removed = scoped.len() != before;
        if scoped.is_empty() {
            registry.by_source.remove(source);
        }
        removed
    }

    /// True between a successful `start` and the matching `stop`.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// True when the source is watched; before start this reports watch
    /// requests recorded for the next start.
    pub async fn is_watching(&self, source: &str) -> bool {
        self.inner.registry.read().await.watches.contains_key(source)
    }

    /// Names of all watched sources, sorted.
    pub async fn watched_sources(&self) -> Vec<String> {
        let registry = self.inner.registry.read().await;
        let mut sources: Vec<String> = registry.watches.keys().cloned().collect();
        sources.sort();
        sources
    }

    /// Current lifecycle state of every worker.
    pub async fn worker_statuses(&self) -> BTreeMap<String, WorkerStatus> {
        let registry = self.inner.registry.read().await;
        registry
            .workers
            .iter()
            .map(|(source, handle)| (source.clone(), handle.worker.status()))
            .collect()
    }

    /// The manager-wide hydration mode.
    pub async fn hydration_mode(&self) -> HydrationMode {
        self.inner.registry.read().await.mode
    }

    /// The hydration mode in effect for a source.
    ///
    /// The mode is manager-wide, so this is the same for every source; the
    /// parameter exists for callers that track sources individually.
    pub async fn effective_mode(&self, _source: &str) -> HydrationMode {
        self.hydration_mode().await
    }

    /// The hydration mode in effect for every watched source.
    pub async fn effective_modes(&self) -> BTreeMap<String, HydrationMode> {
        let registry = self.inner.registry.read().await;
        registry
            .watches
            .keys()
            .map(|source| (source.clone(), registry.mode))
            .collect()
    }

    /// Total events dispatched since the manager was created.
    pub fn total_events_processed(&self) -> u64 {
        self.inner.total_events.load(Ordering::Relaxed)
    }

    /// Number of listener registrations across all scopes.
    pub async fn listener_count(&self) -> usize {
        let registry = self.inner.registry.read().await;
        registry.global.len() + registry.by_source.values().map(Vec::len).sum::<usize>()
    }

    pub(crate) async fn install_watch(
        &self,
        source: String,
        stages: Vec<FilterStage>,
    ) -> Result<()> {
        if source.is_empty() {
            return Err(FanoutError::config("source name must not be empty"));
        }
        let mut registry = self.inner.registry.write().await;
        if registry.watches.contains_key(&source) {
            warn!(%source, "already watching, ignoring");
            return Ok(());
        }
        // Before start the watch is only recorded; its worker is spawned by
        // the next `start`.
        if !self.inner.running.load(Ordering::Acquire) {
            debug!(%source, "watch recorded for next start");
            registry.watches.insert(source, WatchSpec { stages });
            return Ok(());
        }
        self.spawn_worker_locked(&mut registry, &source, stages)?;
        Ok(())
    }

    fn spawn_worker_locked(
        &self,
        registry: &mut Registry,
        source: &str,
        stages: Vec<FilterStage>,
    ) -> Result<()> {
        let feed = registry
            .feed
            .clone()
            .ok_or_else(|| FanoutError::invalid_state("manager not started"))?;
        // One active worker per source: a stale handle is wound down before
        // its replacement goes in.
        if let Some(existing) = registry.workers.remove(source) {
            warn!(%source, "replacing existing worker");
            if let Some(checkpoint) = existing.worker.checkpoint() {
                registry.checkpoints.insert(source.to_string(), checkpoint);
            }
            existing.worker.request_stop();
        }
        let worker = FeedWorker::new(
            source,
            feed,
            registry.mode,
            stages.clone(),
            registry.checkpoints.get(source).cloned(),
            &self.inner.config,
        );
        let sink = Arc::new(WeakSink(Arc::downgrade(&self.inner)));
        let task = tokio::spawn(worker.clone().run(sink));
        registry
            .watches
            .insert(source.to_string(), WatchSpec { stages });
        registry
            .workers
            .insert(source.to_string(), WorkerHandle { worker, task });
        debug!(%source, "worker installed");
        Ok(())
    }
}

/// Stop every worker, persist its resume token, and hand back the tasks.
/// Watches are left alone; callers decide whether they survive.
fn drain_workers(registry: &mut Registry) -> Vec<(String, JoinHandle<()>)> {
    let workers: Vec<(String, WorkerHandle)> = registry.workers.drain().collect();
    let mut stopped = Vec::with_capacity(workers.len());
    for (source, handle) in workers {
        if let Some(checkpoint) = handle.worker.checkpoint() {
            registry.checkpoints.insert(source.clone(), checkpoint);
        }
        handle.worker.request_stop();
        stopped.push((source, handle.task));
    }
    stopped
}

/// Wait for stopped workers, aborting any that outlive the grace period.
async fn join_with_grace(tasks: Vec<(String, JoinHandle<()>)>, grace: Duration) {
    for (source, mut task) in tasks {
        match tokio::time::timeout(grace, &mut task).await {
            Ok(_) => debug!(%source, "worker joined"),
            Err(_) => {
                warn!(%source, "worker did not stop within grace period, aborting");
                task.abort();
            }
        }
    }
}
