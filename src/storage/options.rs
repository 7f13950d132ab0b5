use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::primitives::data::DataOptions;
use crate::primitives::log::{LogOptions, Synchronous};
use crate::types::page;

/// Configuration for a [`super::PageStorage`], built once and passed by
/// reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Page size in bytes; must match the files being opened.
    pub page_size: u32,
    /// Capacity of the shared read cache, in pages.
    pub read_cache_pages: usize,
    /// Capacity of the modify buffer, in distinct pages.
    pub modify_buffer_pages: usize,
    /// Pages a modify transaction buffers before flushing them to the log.
    pub log_window_pages: usize,
    /// Maximum number of read-only data file handles.
    pub read_pool_size: usize,
    /// Data-to-log translations kept in memory before spilling to disk.
    pub data2log_memory_entries: usize,
    /// Commit durability.
    pub synchronous: Synchronous,
    /// Acquire timeout for the modify and commit locks.
    pub lock_timeout_ms: u64,
    /// Pages moved per chunk by backup, restore, shrink and log shipping.
    pub transfer_chunk_pages: usize,
    /// Directory for spill files; the system temp directory when unset.
    pub temp_dir: Option<PathBuf>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            page_size: page::DEFAULT_PAGE_SIZE,
            read_cache_pages: 1024,
            modify_buffer_pages: 25_000,
            log_window_pages: 64,
            read_pool_size: 8,
            data2log_memory_entries: 100_000,
            synchronous: Synchronous::Full,
            lock_timeout_ms: 30_000,
            transfer_chunk_pages: 256,
            temp_dir: None,
        }
    }
}

impl StorageOptions {
    /// Lock acquire timeout.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub(crate) fn data_options(&self) -> DataOptions {
        DataOptions {
            page_size: self.page_size,
            read_cache_pages: self.read_cache_pages,
            modify_buffer_pages: self.modify_buffer_pages,
            read_pool_size: self.read_pool_size,
        }
    }

    pub(crate) fn log_options(&self) -> LogOptions {
        LogOptions {
            page_size: self.page_size,
            synchronous: self.synchronous,
            transfer_chunk_pages: self.transfer_chunk_pages,
        }
    }

    pub(crate) fn transfer_buffer(&self) -> Vec<u8> {
        vec![0u8; self.transfer_chunk_pages.max(1) * self.page_size as usize]
    }
}
