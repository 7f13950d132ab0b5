#![forbid(unsafe_code)]

//! Storage administration and maintenance utilities.
//!
//! This module provides administrative functions over an open
//! [`PageStorage`](crate::storage::PageStorage): checkpoint and shrink
//! reports, backups, restoring replicas from a backup, and statistics.

mod backup;
mod checkpoint;
mod stats;

/// Snapshots a storage into a backup file and seeds new replicas from one.
pub use backup::{backup, restore, BackupHeader, BackupReport, RestoreReport};

/// Checkpoint and log compaction with timing reports.
pub use checkpoint::{checkpoint, shrink, CheckpointReport, ShrinkReport};

/// Statistics collection and reporting.
pub use stats::{stats, FilesystemStats, StatsReport};
