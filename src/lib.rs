//! # changefan - in-process change-data-capture fan-out
//!
//! Watches the change feeds of a data store and fans decoded change events
//! out to registered listeners. One worker per watched source keeps a cursor
//! open, survives feed failures with resume tokens, and hands every record to
//! the shared notification manager for dispatch.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌───────────┐
//! │ source A  │   │ source B  │   │ source C  │
//! │  cursor   │   │  cursor   │   │  cursor   │
//! └─────┬─────┘   └─────┬─────┘   └─────┬─────┘
//!       │               │               │
//!       ▼               ▼               ▼
//! ┌──────────────────────────────────────────┐
//! │        FeedWorker (one per source)       │
//! │   open / pump / reconnect / checkpoint   │
//! └────────────────────┬─────────────────────┘
//!                      ▼
//! ┌──────────────────────────────────────────┐
//! │           NotificationManager            │
//! │   global listeners + per-source scopes   │
//! └────────────────────┬─────────────────────┘
//!                      ▼
//!          listener callbacks (in order)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use changefan::{HydrationMode, MemoryFeed, NotificationManager};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let feed = MemoryFeed::new();
//! feed.register_source("orders");
//!
//! let manager = NotificationManager::new();
//! manager
//!     .start(Arc::new(feed.clone()), HydrationMode::Minimal)
//!     .await?;
//! manager.watch_source("orders").await?;
//!
//! manager
//!     .listener_builder(Arc::new(|event| {
//!         println!("{event}");
//!     }))
//!     .for_source("orders")
//!     .register()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! Delivery is at-least-once: after a reconnect the worker resumes from its
//! last cached checkpoint, so listeners must tolerate replays. Listener
//! callbacks run on the worker's task; keep them fast.

pub mod config;
pub mod error;
pub mod event;
pub mod feed;
pub mod listener;
pub mod manager;
pub mod memory;
pub mod watch;
pub mod worker;

// Core types: the manager and what listeners see.
pub use error::{FanoutError, FeedError, Result};
pub use event::{ChangeEvent, ChangeOp, Checkpoint, UpdateDelta};
pub use listener::{ChangeListener, EventPredicate};
pub use manager::NotificationManager;

// Feed integration: implement these to plug in a real store.
pub use feed::{
    ChangeCursor, ChangeFeed, CursorSpec, FilterStage, HydrationMode, RawChange, SharedFeed,
};
pub use memory::MemoryFeed;

// Tuning and observability.
pub use config::NotificationConfig;
pub use watch::{ListenerBuilder, WatchBuilder};
pub use worker::WorkerStatus;
