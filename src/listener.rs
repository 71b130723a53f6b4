//! Listener registrations
//!
//! A listener is a shared callback plus an optional client-side predicate.
//! Identity is pointer identity of the `Arc`s, which is what makes
//! register/unregister idempotent for the same handle.

use crate::event::ChangeEvent;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Callback invoked for each delivered change event.
pub type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Client-side filter evaluated just before delivery.
pub type EventPredicate = Arc<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;

/// One registered listener with its optional predicate.
#[derive(Clone)]
pub struct ListenerRegistration {
    listener: ChangeListener,
    predicate: Option<EventPredicate>,
}

impl ListenerRegistration {
    pub fn new(listener: ChangeListener, predicate: Option<EventPredicate>) -> Self {
        Self {
            listener,
            predicate,
        }
    }

    /// True when this registration wraps the given callback handle.
    pub fn wraps(&self, listener: &ChangeListener) -> bool {
        Arc::ptr_eq(&self.listener, listener)
    }

    /// Evaluate the predicate; registrations without one accept everything.
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(event),
            None => true,
        }
    }

    /// Invoke the callback, containing panics so one listener cannot break
    /// delivery to the others.
    pub fn deliver(&self, event: &ChangeEvent) {
        let listener = &self.listener;
        if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
            error!(source = %event.source, op = ?event.op, "listener panicked during delivery");
        }
    }
}

impl PartialEq for ListenerRegistration {
    fn eq(&self, other: &Self) -> bool {
        if !Arc::ptr_eq(&self.listener, &other.listener) {
            return false;
        }
        match (&self.predicate, &other.predicate) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}
