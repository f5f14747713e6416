//! Ledger event indexing
//!
//! [`CommitFeed`] pages through confirmed commits, [`ChainWatcher`] drives
//! it and hands each event to the shared [`Reconciler`].

mod feed;
mod reconciler;
mod watcher;

pub use feed::CommitFeed;
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use watcher::{ChainWatcher, WatcherConfig, WatcherStats};
