//! # thread-core
//!
//! Pure logic for threadsync (no I/O, instant tests).
//!
//! This crate implements thread reconstruction, snapshot reconciliation and
//! the view state machines without any network, timer or UI access.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. Time is passed in by the caller, scrolling goes
//! through the [`ScrollSurface`] trait, and state machines return the actions
//! the caller must perform.
//!
//! The actual I/O (REST, realtime channel, decryption) is performed by
//! `thread-client`, which interprets the actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod anchor;
pub mod chrono;
pub mod lifecycle;
pub mod link;
pub mod merge;
pub mod pagination;
pub mod playback;
pub mod snapshot;
pub mod suppressor;
pub mod tree;

#[cfg(test)]
mod fixtures;

pub use anchor::{ScrollAnchor, ScrollMetrics, ScrollSurface};
pub use chrono::ChronoIndex;
pub use lifecycle::{Activity, LifecycleAction, LifecycleEvent, SyncState};
pub use link::{LinkAction, LinkEvent, LinkPolicy, LinkState, LinkStatus};
pub use merge::{Delta, IgnoreReason, MergeOutcome};
pub use pagination::{page_has_more, PageMerge, PageSkip, PaginationController};
pub use playback::PlaybackController;
pub use snapshot::{Pagination, Snapshot, SnapshotStore};
pub use suppressor::{ActionKind, ActionSuppressor, LeaseToken};
pub use tree::{ThreadNode, ThreadTree};
