//! Change-feed abstraction
//!
//! The seam between the fan-out subsystem and whatever actually produces
//! change records. An embedding application implements [`ChangeFeed`] for its
//! store; [`crate::MemoryFeed`] is the bundled in-memory implementation.

use crate::error::FeedError;
use crate::event::{ChangeOp, Checkpoint, UpdateDelta};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Policy controlling how much post-image content a cursor requests.
///
/// Exactly one mode is active for the whole running manager; changing it
/// requires a full stop/restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HydrationMode {
    /// Post-image on inserts only
    #[default]
    Minimal,
    /// Post-image on inserts and updates (upstream looks the record up)
    FullLookup,
    /// Post-image whenever the upstream happens to have one
    BestEffort,
}

/// One server-side filter stage.
///
/// Stages are handed verbatim to [`ChangeFeed::open_cursor`] and evaluated
/// upstream; the fan-out core never interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum FilterStage {
    /// Keep records whose operation kind is in the set
    Operations { ops: Vec<ChangeOp> },
    /// Keep records whose post-image field equals a value
    FieldEquals {
        field: String,
        value: serde_json::Value,
    },
    /// Keep records whose post-image contains a field
    FieldExists { field: String },
    /// Keep updates that set, modified, or removed a field
    FieldUpdated { field: String },
}

/// Everything needed to open one change-feed cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorSpec {
    /// Source (collection/table) name
    pub source: String,
    /// Requested hydration mode
    pub mode: HydrationMode,
    /// Ordered server-side filter stages (may be empty)
    pub stages: Vec<FilterStage>,
    /// Resume position; `None` starts from "now"
    pub resume_from: Option<Checkpoint>,
}

impl CursorSpec {
    /// Spec with no filtering and no resume position.
    pub fn new(source: impl Into<String>, mode: HydrationMode) -> Self {
        Self {
            source: source.into(),
            mode,
            stages: Vec::new(),
            resume_from: None,
        }
    }
}

/// One raw record as produced by the upstream feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    /// Operation kind; `None` means unclassifiable (the worker drops it)
    pub op: Option<ChangeOp>,
    /// Primary-key value, if known
    pub key: Option<serde_json::Value>,
    /// Post-image, subject to the hydration mode
    pub post_image: Option<serde_json::Value>,
    /// Per-field update description, for updates
    pub delta: Option<UpdateDelta>,
    /// Upstream commit time (epoch millis), if reported
    pub commit_ts_ms: Option<i64>,
    /// Token positioned just after this record
    pub checkpoint: Checkpoint,
}

/// A live cursor over one source's change feed.
///
/// `next` blocks until a record is available, the feed closes the cursor
/// (`Ok(None)`), or it fails. A [`FeedError::Decode`] only poisons the
/// current record; any other error ends the cursor.
#[async_trait]
pub trait ChangeCursor: Send {
    async fn next(&mut self) -> std::result::Result<Option<RawChange>, FeedError>;
}

/// A source of change-feed cursors.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a cursor against a named source.
    ///
    /// Returns [`FeedError::InvalidCheckpoint`] when `spec.resume_from` is
    /// rejected upstream, so the caller can retry without a token.
    async fn open_cursor(
        &self,
        spec: CursorSpec,
    ) -> std::result::Result<Box<dyn ChangeCursor>, FeedError>;

    /// Enumerate source names, including system sources.
    async fn list_sources(&self) -> std::result::Result<Vec<String>, FeedError>;
}

/// Shared handle to a change feed.
pub type SharedFeed = Arc<dyn ChangeFeed>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_mode_is_minimal() {
        assert_eq!(HydrationMode::default(), HydrationMode::Minimal);
    }

    #[test]
    fn test_cursor_spec_new() {
        let spec = CursorSpec::new("orders", HydrationMode::FullLookup);
        assert_eq!(spec.source, "orders");
        assert_eq!(spec.mode, HydrationMode::FullLookup);
        assert!(spec.stages.is_empty());
        assert!(spec.resume_from.is_none());
    }

    #[test]
    fn test_filter_stage_serde() {
        let stage = FilterStage::FieldEquals {
            field: "status".into(),
            value: json!("shipped"),
        };
        let encoded = serde_json::to_string(&stage).unwrap();
        assert!(encoded.contains("field_equals"));

        let back: FilterStage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back, stage);
    }
}
