//! Low-level primitives for building the storage engine.
//!
//! Includes positioned file I/O, page files, lock coordination, the
//! data-file cache and the write-ahead log.

/// Concurrency primitives and synchronization.
///
/// Lock manager used by the page storage and the bounded read-handle pool.
pub mod concurrency;

/// Data file cache.
///
/// Shared read cache plus the write-behind modify buffer.
pub mod data;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Write-ahead log with checkpoint, recovery and shrink.
pub mod log;

/// Page-addressed files, page streams and bulk transfer.
pub mod pagefile;
