//! Fluent builders
//!
//! [`WatchBuilder`] assembles the upstream filter stages for one source
//! watch; [`ListenerBuilder`] assembles a listener registration with its
//! scope and client-side predicate. Both borrow the manager and commit on
//! their terminal call.

use crate::error::Result;
use crate::event::{ChangeEvent, ChangeOp};
use crate::feed::{FilterStage, HydrationMode};
use crate::listener::{ChangeListener, EventPredicate, ListenerRegistration};
use crate::manager::NotificationManager;
use std::sync::Arc;
use tracing::warn;

impl NotificationManager {
    /// Start building a watch for one source.
    pub fn watch(&self, source: impl Into<String>) -> WatchBuilder<'_> {
        WatchBuilder {
            manager: self,
            source: source.into(),
            stages: Vec::new(),
        }
    }

    /// Start building a listener registration.
    pub fn listener_builder(&self, listener: ChangeListener) -> ListenerBuilder<'_> {
        ListenerBuilder {
            manager: self,
            listener,
            sources: Vec::new(),
            predicate: None,
        }
    }
}

/// Builder for a filtered source watch.
pub struct WatchBuilder<'a> {
    manager: &'a NotificationManager,
    source: String,
    stages: Vec<FilterStage>,
}

impl WatchBuilder<'_> {
    /// Only deliver inserts.
    pub fn only_inserts(self) -> Self {
        self.on_operations(&[ChangeOp::Insert])
    }

    /// Only deliver updates.
    pub fn only_updates(self) -> Self {
        self.on_operations(&[ChangeOp::Update])
    }

    /// Only deliver deletes.
    pub fn only_deletes(self) -> Self {
        self.on_operations(&[ChangeOp::Delete])
    }

    /// Only deliver the given operation kinds.
    pub fn on_operations(mut self, ops: &[ChangeOp]) -> Self {
        self.stages.push(FilterStage::Operations { ops: ops.to_vec() });
        self
    }

    /// Only deliver records whose post-image field equals a value.
    pub fn where_field(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.stages.push(FilterStage::FieldEquals {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Only deliver records whose post-image contains a field.
    pub fn where_field_exists(mut self, field: impl Into<String>) -> Self {
        self.stages.push(FilterStage::FieldExists {
            field: field.into(),
        });
        self
    }

    /// Only deliver updates that touched a field.
    pub fn when_field_updated(mut self, field: impl Into<String>) -> Self {
        self.stages.push(FilterStage::FieldUpdated {
            field: field.into(),
        });
        self
    }

    /// Append a raw filter stage.
    pub fn filter(mut self, stage: FilterStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// The hydration mode is manager-wide; a per-watch request is ignored.
    pub fn hydration(self, mode: HydrationMode) -> Self {
        warn!(requested = ?mode, source = %self.source, "per-watch hydration mode is not supported, manager-wide mode applies");
        self
    }

    /// Install the watch and spawn its worker.
    pub async fn start(self) -> Result<()> {
        self.manager.install_watch(self.source, self.stages).await
    }
}

/// Builder for a listener registration.
pub struct ListenerBuilder<'a> {
    manager: &'a NotificationManager,
    listener: ChangeListener,
    sources: Vec<String>,
    predicate: Option<EventPredicate>,
}

impl ListenerBuilder<'_> {
    /// Scope the listener to a source; may be called repeatedly. With no
    /// scope the listener is global.
    pub fn for_source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }

    /// Scope the listener to several sources at once.
    pub fn for_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources.extend(sources.into_iter().map(Into::into));
        self
    }

    /// Only deliver events whose post-image field equals a value.
    pub fn filter_field(self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        let field = field.into();
        let value = value.into();
        self.filter(move |event: &ChangeEvent| event.field(&field) == Some(&value))
    }

    /// Only deliver events of one operation kind.
    pub fn filter_operation(self, op: ChangeOp) -> Self {
        self.filter(move |event: &ChangeEvent| event.op == op)
    }

    /// Only deliver events whose operation kind is in the set.
    pub fn filter_operations(self, ops: &[ChangeOp]) -> Self {
        let ops = ops.to_vec();
        self.filter(move |event: &ChangeEvent| ops.contains(&event.op))
    }

    /// Only deliver events from one source, without scoping the
    /// registration to it.
    pub fn filter_source(self, source: impl Into<String>) -> Self {
        let source = source.into();
        self.filter(move |event: &ChangeEvent| event.source == source)
    }

    /// Add a predicate; multiple predicates are ANDed together.
    pub fn filter(mut self, predicate: impl Fn(&ChangeEvent) -> bool + Send + Sync + 'static) -> Self {
        let next: EventPredicate = Arc::new(predicate);
        self.predicate = Some(match self.predicate.take() {
            None => next,
            Some(prev) => Arc::new(move |event| prev(event) && next(event)),
        });
        self
    }

    /// The hydration mode is manager-wide; a per-listener request is ignored.
    pub fn with_mode(self, mode: HydrationMode) -> Self {
        warn!(requested = ?mode, "per-listener hydration mode is not supported, manager-wide mode applies");
        self
    }

    /// Commit the registration.
    pub async fn register(self) -> Result<()> {
        let registration = ListenerRegistration::new(self.listener, self.predicate);
        self.manager
            .register_registration(self.sources, registration)
            .await
    }
}
