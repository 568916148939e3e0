// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ductile-storage: Durable single-writer store.
//!
//! Every mutation is a fact appended to a JSONL write-ahead log and applied
//! to the in-memory [`MaterializedState`]. Recovery loads the newest
//! snapshot and replays the WAL tail; a background checkpointer compacts
//! the log once a snapshot is durable.

mod checkpoint;
mod migration;
mod snapshot;
mod state;
mod store;
mod wal;

pub use checkpoint::{
    load_snapshot, CheckpointError, CheckpointHandle, CheckpointResult, Checkpointer,
};
pub use migration::{Migration, MigrationError, MigrationRegistry};
pub use snapshot::{Snapshot, SnapshotError, CURRENT_SNAPSHOT_VERSION};
pub use state::{JobRecord, MaterializedState, PluginStateRow};
pub use store::{
    Enqueued, OpenError, QueueError, RecoveredJob, RecoveryReport, Store, StorePaths,
};
pub use wal::{Wal, WalEntry, WalError};
