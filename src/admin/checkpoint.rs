use std::time::Instant;

use serde::Serialize;

use crate::storage::PageStorage;
use crate::types::Result;

/// Report generated after executing a checkpoint operation.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointReport {
    /// Data pages written to the data file.
    pub pages_written: usize,
    /// Checkpoint pointer after the operation.
    pub checkpoint: u64,
    /// Duration of the checkpoint operation in milliseconds.
    pub duration_ms: f64,
}

/// Report generated after shrinking the log.
#[derive(Debug, Clone, Serialize)]
pub struct ShrinkReport {
    /// First log page before the shrink.
    pub old_start: u64,
    /// First log page after the shrink.
    pub new_start: u64,
    /// Next log page, unchanged by the shrink.
    pub next: u64,
    /// Duration of the shrink in milliseconds.
    pub duration_ms: f64,
}

/// Flushes the modify buffer and advances the checkpoint pointer.
///
/// # Errors
///
/// Returns an error if the storage is closed or the checkpoint fails.
pub fn checkpoint(storage: &PageStorage) -> Result<CheckpointReport> {
    let start = Instant::now();
    let pages_written = storage.checkpoint()?;
    let elapsed = start.elapsed();
    Ok(CheckpointReport {
        pages_written,
        checkpoint: storage.log_info()?.checkpoint,
        duration_ms: elapsed.as_secs_f64() * 1_000.0,
    })
}

/// Drops log history that every consumer has confirmed, keeping pages from
/// `start_page - 1` on.
///
/// # Errors
///
/// Returns [`crate::VellumError::WrongPageId`] when `start_page` lies outside
/// `[start, next]`.
pub fn shrink(storage: &PageStorage, start_page: u64) -> Result<ShrinkReport> {
    let start = Instant::now();
    let old_start = storage.log_info()?.start;
    let new_start = storage.shrink(start_page)?;
    let elapsed = start.elapsed();
    Ok(ShrinkReport {
        old_start,
        new_start,
        next: storage.log_info()?.next,
        duration_ms: elapsed.as_secs_f64() * 1_000.0,
    })
}
