//! In-memory change feed
//!
//! [`MemoryFeed`] is a complete [`ChangeFeed`] backed by per-source ordered
//! logs. It honors resume tokens, evaluates server-side filter stages, and
//! shapes post-images according to the requested hydration mode, so the whole
//! fan-out path can be exercised without an external store. Failure injection
//! hooks cover the worker's recovery paths.

use crate::error::FeedError;
use crate::event::{ChangeOp, Checkpoint, UpdateDelta};
use crate::feed::{ChangeCursor, ChangeFeed, CursorSpec, FilterStage, HydrationMode, RawChange};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

/// One log entry; decode failures are stored in-band so cursors replay them.
enum Entry {
    Change(RawChange),
    DecodeError(String),
}

struct SourceState {
    entries: Mutex<Vec<Entry>>,
    notify: Notify,
    fail_next_open: Mutex<Option<FeedError>>,
    fail_stream: Mutex<Option<FeedError>>,
}

impl SourceState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            notify: Notify::new(),
            fail_next_open: Mutex::new(None),
            fail_stream: Mutex::new(None),
        })
    }
}

struct FeedInner {
    sources: Mutex<HashMap<String, Arc<SourceState>>>,
    /// Last cursor spec seen per source, for tests asserting resume behavior.
    specs: Mutex<HashMap<String, CursorSpec>>,
}

/// In-memory [`ChangeFeed`] with controllable failure injection.
#[derive(Clone)]
pub struct MemoryFeed {
    inner: Arc<FeedInner>,
}

impl Default for MemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFeed {
    /// Create an empty feed.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FeedInner {
                sources: Mutex::new(HashMap::new()),
                specs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Ensure a source exists (idempotent).
    pub fn register_source(&self, name: impl Into<String>) {
        self.state_for(&name.into());
    }

    fn state_for(&self, name: &str) -> Arc<SourceState> {
        let mut sources = self.inner.sources.lock().unwrap();
        sources
            .entry(name.to_string())
            .or_insert_with(SourceState::new)
            .clone()
    }

    fn push_entry(&self, source: &str, build: impl FnOnce(Checkpoint) -> Entry) -> Checkpoint {
        let state = self.state_for(source);
        let mut entries = state.entries.lock().unwrap();
        let checkpoint = Checkpoint::new(entries.len().to_string());
        entries.push(build(checkpoint.clone()));
        drop(entries);
        state.notify.notify_waiters();
        checkpoint
    }

    /// Append a raw change as-is; its checkpoint token is overwritten with
    /// the log position.
    pub fn push_raw(&self, source: &str, mut raw: RawChange) -> Checkpoint {
        self.push_entry(source, |checkpoint| {
            raw.checkpoint = checkpoint;
            Entry::Change(raw)
        })
    }

    /// Append an insert record.
    pub fn push_insert(
        &self,
        source: &str,
        key: serde_json::Value,
        doc: serde_json::Value,
    ) -> Checkpoint {
        self.push_raw(
            source,
            RawChange {
                op: Some(ChangeOp::Insert),
                key: Some(key),
                post_image: Some(doc),
                delta: None,
                commit_ts_ms: Some(now_millis()),
                checkpoint: Checkpoint::new(""),
            },
        )
    }

    /// Append an update record with its field delta and looked-up post-image.
    pub fn push_update(
        &self,
        source: &str,
        key: serde_json::Value,
        post_image: Option<serde_json::Value>,
        delta: UpdateDelta,
    ) -> Checkpoint {
        self.push_raw(
            source,
            RawChange {
                op: Some(ChangeOp::Update),
                key: Some(key),
                post_image,
                delta: Some(delta),
                commit_ts_ms: Some(now_millis()),
                checkpoint: Checkpoint::new(""),
            },
        )
    }

    /// Append a replace record.
    pub fn push_replace(
        &self,
        source: &str,
        key: serde_json::Value,
        doc: serde_json::Value,
    ) -> Checkpoint {
        self.push_raw(
            source,
            RawChange {
                op: Some(ChangeOp::Replace),
                key: Some(key),
                post_image: Some(doc),
                delta: None,
                commit_ts_ms: Some(now_millis()),
                checkpoint: Checkpoint::new(""),
            },
        )
    }

    /// Append a delete record.
    pub fn push_delete(&self, source: &str, key: serde_json::Value) -> Checkpoint {
        self.push_raw(
            source,
            RawChange {
                op: Some(ChangeOp::Delete),
                key: Some(key),
                post_image: None,
                delta: None,
                commit_ts_ms: Some(now_millis()),
                checkpoint: Checkpoint::new(""),
            },
        )
    }

    /// Append a record whose operation kind cannot be classified.
    pub fn push_unclassified(&self, source: &str) -> Checkpoint {
        self.push_raw(
            source,
            RawChange {
                op: None,
                key: None,
                post_image: None,
                delta: None,
                commit_ts_ms: Some(now_millis()),
                checkpoint: Checkpoint::new(""),
            },
        )
    }

    /// Append a record that fails to decode when read.
    pub fn push_decode_error(&self, source: &str, msg: impl Into<String>) -> Checkpoint {
        let msg = msg.into();
        self.push_entry(source, |_| Entry::DecodeError(msg))
    }

    /// Make the next `open_cursor` on a source fail with the given error.
    pub fn fail_next_open(&self, source: &str, err: FeedError) {
        let state = self.state_for(source);
        *state.fail_next_open.lock().unwrap() = Some(err);
        // Wake a cursor blocked on this source so a stuck worker retries.
        state.notify.notify_waiters();
    }

    /// Fail the next read on any open cursor for a source, simulating a
    /// stream that dies mid-flight.
    pub fn break_stream(&self, source: &str, err: FeedError) {
        let state = self.state_for(source);
        *state.fail_stream.lock().unwrap() = Some(err);
        state.notify.notify_waiters();
    }

    /// The spec of the most recent `open_cursor` call for a source.
    pub fn last_spec(&self, source: &str) -> Option<CursorSpec> {
        self.inner.specs.lock().unwrap().get(source).cloned()
    }

    /// Number of records logged for a source.
    pub fn len(&self, source: &str) -> usize {
        self.state_for(source).entries.lock().unwrap().len()
    }

    /// True when no records were logged for a source.
    pub fn is_empty(&self, source: &str) -> bool {
        self.len(source) == 0
    }
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn open_cursor(
        &self,
        spec: CursorSpec,
    ) -> std::result::Result<Box<dyn ChangeCursor>, FeedError> {
        let state = self.state_for(&spec.source);
        self.inner
            .specs
            .lock()
            .unwrap()
            .insert(spec.source.clone(), spec.clone());

        if let Some(err) = state.fail_next_open.lock().unwrap().take() {
            debug!(source = %spec.source, %err, "injected open failure");
            return Err(err);
        }

        let pos = match &spec.resume_from {
            None => state.entries.lock().unwrap().len(),
            Some(checkpoint) => {
                let seq: usize = checkpoint
                    .token()
                    .parse()
                    .map_err(|_| FeedError::InvalidCheckpoint)?;
                if seq >= state.entries.lock().unwrap().len() {
                    return Err(FeedError::InvalidCheckpoint);
                }
                seq + 1
            }
        };

        Ok(Box::new(MemoryCursor {
            state,
            pos,
            mode: spec.mode,
            stages: spec.stages,
        }))
    }

    async fn list_sources(&self) -> std::result::Result<Vec<String>, FeedError> {
        let mut names: Vec<String> = self.inner.sources.lock().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

struct MemoryCursor {
    state: Arc<SourceState>,
    pos: usize,
    mode: HydrationMode,
    stages: Vec<FilterStage>,
}

impl MemoryCursor {
    /// Take the entry at the current position, if one was logged.
    fn try_take(&mut self) -> Option<std::result::Result<RawChange, FeedError>> {
        let entries = self.state.entries.lock().unwrap();
        match entries.get(self.pos) {
            None => None,
            Some(Entry::DecodeError(msg)) => {
                self.pos += 1;
                Some(Err(FeedError::decode(msg.clone())))
            }
            Some(Entry::Change(raw)) => {
                self.pos += 1;
                Some(Ok(raw.clone()))
            }
        }
    }

    fn passes_stages(&self, raw: &RawChange) -> bool {
        self.stages.iter().all(|stage| match stage {
            FilterStage::Operations { ops } => raw.op.map(|op| ops.contains(&op)).unwrap_or(true),
            FilterStage::FieldEquals { field, value } => raw
                .post_image
                .as_ref()
                .and_then(|doc| doc.get(field))
                .map(|v| v == value)
                .unwrap_or(false),
            FilterStage::FieldExists { field } => raw
                .post_image
                .as_ref()
                .map(|doc| doc.get(field).is_some())
                .unwrap_or(false),
            FilterStage::FieldUpdated { field } => {
                raw.op == Some(ChangeOp::Update)
                    && raw.delta.as_ref().map(|d| d.touches(field)).unwrap_or(false)
            }
        })
    }

    /// Strip the post-image according to the requested hydration mode.
    fn shape(&self, mut raw: RawChange) -> RawChange {
        let keep = match self.mode {
            HydrationMode::BestEffort => true,
            HydrationMode::FullLookup => !matches!(raw.op, Some(ChangeOp::Delete)),
            HydrationMode::Minimal => {
                matches!(raw.op, Some(ChangeOp::Insert) | Some(ChangeOp::Replace))
            }
        };
        if !keep {
            raw.post_image = None;
        }
        raw
    }
}

#[async_trait]
impl ChangeCursor for MemoryCursor {
    async fn next(&mut self) -> std::result::Result<Option<RawChange>, FeedError> {
        loop {
            // Register for wakeup before checking the log, so a push between
            // the check and the await is not missed. The future borrows a
            // clone of the state so the log check below can borrow self.
            let state = self.state.clone();
            let notified = state.notify.notified();
            if let Some(err) = state.fail_stream.lock().unwrap().take() {
                return Err(err);
            }
            match self.try_take() {
                Some(Err(err)) => return Err(err),
                Some(Ok(raw)) => {
                    if self.passes_stages(&raw) {
                        return Ok(Some(self.shape(raw)));
                    }
                }
                None => notified.await,
            }
        }
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
