use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::primitives::data::DataStats;
use crate::primitives::log::LogInfo;
use crate::storage::PageStorage;
use crate::types::Result;

/// Snapshot of an open storage for admin tooling.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    /// Log header snapshot.
    pub log: LogInfo,
    /// Data file cache counters.
    pub data: DataStats,
    /// Configured modify buffer capacity.
    pub modify_buffer_pages: usize,
    /// On-disk file sizes.
    pub filesystem: FilesystemStats,
}

/// Paths and sizes of the storage files.
#[derive(Debug, Clone, Serialize)]
pub struct FilesystemStats {
    /// Data file path.
    pub data_path: String,
    /// Data file size in bytes.
    pub data_size_bytes: u64,
    /// Log file path.
    pub log_path: String,
    /// Log file size in bytes.
    pub log_size_bytes: u64,
}

/// Collects log, cache and file statistics for an open storage.
pub fn stats(storage: &PageStorage) -> Result<StatsReport> {
    let log = storage.log_info()?;
    let data_path = storage.data_path();
    let log_path = storage.log_path();
    Ok(StatsReport {
        log,
        data: storage.data_stats(),
        modify_buffer_pages: storage.options().modify_buffer_pages,
        filesystem: FilesystemStats {
            data_path: data_path.display().to_string(),
            data_size_bytes: file_size(data_path)?,
            log_path: log_path.display().to_string(),
            log_size_bytes: file_size(log_path)?,
        },
    })
}

fn file_size(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path)?.len())
}
