//! Canonical change event
//!
//! Unified, decoded representation of one upstream change record. Workers
//! build one [`ChangeEvent`] per raw record and the manager shares it by
//! reference with every matching listener; nothing mutates it afterwards.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Operation kind of a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    /// Row/document inserted
    Insert,
    /// Row/document partially updated
    Update,
    /// Row/document fully replaced
    Replace,
    /// Row/document deleted
    Delete,
    /// Classified operation outside the CRUD set (DDL, invalidate, ...)
    Other,
}

/// Field-level description of an update.
///
/// Both sets are empty (never absent) for non-update operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDelta {
    /// Names of fields that were set or modified
    #[serde(default)]
    pub updated_fields: BTreeSet<String>,
    /// Names of fields that were removed
    #[serde(default)]
    pub removed_fields: BTreeSet<String>,
}

impl UpdateDelta {
    /// Create an empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a delta from field name lists.
    pub fn from_fields<I, J, S>(updated: I, removed: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            updated_fields: updated.into_iter().map(Into::into).collect(),
            removed_fields: removed.into_iter().map(Into::into).collect(),
        }
    }

    /// True if the update set or removed a given field.
    pub fn touches(&self, field: &str) -> bool {
        self.updated_fields.contains(field) || self.removed_fields.contains(field)
    }
}

/// Opaque resume token identifying a position in a source's change feed.
///
/// Round-tripped verbatim between the upstream feed and the manager's
/// checkpoint cache; the subsystem never inspects it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    token: String,
}

impl Checkpoint {
    /// Wrap an upstream token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// The raw token.
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

static EMPTY_FIELDS: BTreeSet<String> = BTreeSet::new();

/// A decoded change record, ready for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Operation kind
    pub op: ChangeOp,
    /// Name of the source the change occurred on
    pub source: String,
    /// Entity name (currently always the source name)
    pub entity: String,
    /// Primary-key value of the affected record, if known
    pub key: Option<serde_json::Value>,
    /// Post-image of the record; availability depends on the hydration mode
    pub post_image: Option<serde_json::Value>,
    /// Update description, present for update operations only
    pub delta: Option<UpdateDelta>,
    /// Commit time reported upstream, or receipt wall clock (epoch millis)
    pub timestamp_ms: i64,
    /// Resume token positioned just after this record
    pub checkpoint: Checkpoint,
}

impl ChangeEvent {
    /// True if this is an insert.
    pub fn is_insert(&self) -> bool {
        self.op == ChangeOp::Insert
    }

    /// True if this is an update.
    pub fn is_update(&self) -> bool {
        self.op == ChangeOp::Update
    }

    /// True if this is a replace.
    pub fn is_replace(&self) -> bool {
        self.op == ChangeOp::Replace
    }

    /// True if this is a delete.
    pub fn is_delete(&self) -> bool {
        self.op == ChangeOp::Delete
    }

    /// True if a post-image is attached.
    pub fn has_post_image(&self) -> bool {
        self.post_image.is_some()
    }

    /// Field names set or modified by an update; empty for other operations.
    pub fn updated_fields(&self) -> &BTreeSet<String> {
        self.delta
            .as_ref()
            .map(|d| &d.updated_fields)
            .unwrap_or(&EMPTY_FIELDS)
    }

    /// Field names removed by an update; empty for other operations.
    pub fn removed_fields(&self) -> &BTreeSet<String> {
        self.delta
            .as_ref()
            .map(|d| &d.removed_fields)
            .unwrap_or(&EMPTY_FIELDS)
    }

    /// Primary key decoded as `T`.
    ///
    /// Returns `None` when the key is absent or does not deserialize; never
    /// errors.
    pub fn key_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.key
            .as_ref()
            .and_then(|k| serde_json::from_value(k.clone()).ok())
    }

    /// Look up a field in the post-image, if one is attached.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.post_image.as_ref().and_then(|doc| doc.get(name))
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChangeEvent{{op={:?}, source={}, key={}, post_image={}}}",
            self.op,
            self.source,
            self.key
                .as_ref()
                .map(|k| k.to_string())
                .unwrap_or_else(|| "none".into()),
            self.has_post_image(),
        )
    }
}
