#![forbid(unsafe_code)]

//! Cached access to the data file.
//!
//! Lookups go modify buffer, then shared read cache, then file. Committed
//! pages land in the modify buffer and reach the file at the next
//! checkpoint. Mutations are serialized by a writer mutex; reads run
//! concurrently through a bounded pool of read-only handles.

mod modify_buffer;

use std::num::NonZeroUsize;
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use self::modify_buffer::ModifyBuffer;
use crate::primitives::concurrency::HandlePool;
use crate::primitives::pagefile::{
    check_block, get_u128, get_u32, seal_block, HeaderBlock, PageFile, PageSource,
    HEADER_BLOCK_LEN,
};
use crate::types::page::{self, check_page_size};
use crate::types::{LogId, PageId, Result, VellumError};

const DATA_MAGIC: [u8; 4] = *b"VLDT";
const DATA_FORMAT_VERSION: u16 = 1;
const DATA_LOG_ID: Range<usize> = 8..24;
const DATA_PAGE_SIZE: Range<usize> = 24..28;

/// Pages moved per file write or per source read while applying.
const IO_CHUNK_PAGES: usize = 64;

/// Header block of the data file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataHeader {
    /// Identity of the log this data file is paired with.
    pub log_id: LogId,
    /// Page size the file was created with.
    pub page_size: u32,
}

impl DataHeader {
    /// Encodes the header into a sealed block.
    pub fn encode(&self) -> HeaderBlock {
        let mut block = [0u8; HEADER_BLOCK_LEN];
        block[DATA_LOG_ID].copy_from_slice(&self.log_id.0.to_be_bytes());
        block[DATA_PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        seal_block(&mut block, DATA_MAGIC, DATA_FORMAT_VERSION);
        block
    }

    /// Validates and decodes a header block.
    pub fn decode(block: &HeaderBlock) -> Result<Self> {
        check_block(block, DATA_MAGIC, DATA_FORMAT_VERSION)?;
        Ok(Self {
            log_id: LogId(get_u128(block, DATA_LOG_ID)),
            page_size: get_u32(block, DATA_PAGE_SIZE),
        })
    }
}

/// Sizing for the data file cache.
#[derive(Clone, Debug)]
pub struct DataOptions {
    /// Page size in bytes.
    pub page_size: u32,
    /// Capacity of the shared LRU read cache, in pages.
    pub read_cache_pages: usize,
    /// Capacity of the modify buffer, in distinct pages.
    pub modify_buffer_pages: usize,
    /// Maximum number of read-only file handles.
    pub read_pool_size: usize,
}

/// Counters describing data file activity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DataStats {
    /// Reads answered by the modify buffer.
    pub buffer_hits: u64,
    /// Reads answered by the shared read cache.
    pub cache_hits: u64,
    /// Reads that went to the file.
    pub file_reads: u64,
    /// Checkpoints that wrote at least one page.
    pub checkpoints: u64,
    /// Pages written by checkpoints.
    pub pages_checkpointed: u64,
    /// Pages written through the direct path.
    pub direct_pages: u64,
}

#[derive(Default)]
struct Counters {
    buffer_hits: AtomicU64,
    cache_hits: AtomicU64,
    file_reads: AtomicU64,
    checkpoints: AtomicU64,
    pages_checkpointed: AtomicU64,
    direct_pages: AtomicU64,
}

struct ReadCache {
    pages: LruCache<PageId, Arc<[u8]>>,
    // Bumped whenever file contents may change under a page so that a read
    // started before the change cannot re-insert what it saw.
    epoch: u64,
}

impl ReadCache {
    fn invalidate(&mut self, ids: impl IntoIterator<Item = PageId>) {
        for id in ids {
            self.pages.pop(&id);
        }
        self.epoch += 1;
    }
}

/// The data file plus its read cache and modify buffer.
pub struct Data {
    file: PageFile,
    page_size: usize,
    writer: Mutex<()>,
    buffer: Mutex<ModifyBuffer>,
    cache: Mutex<ReadCache>,
    readers: HandlePool<PageFile>,
    counters: Counters,
}

impl Data {
    /// Creates a new data file bound to `log_id`.
    pub fn create(path: impl AsRef<Path>, log_id: LogId, options: &DataOptions) -> Result<Self> {
        check_page_size(options.page_size)?;
        let header = DataHeader {
            log_id,
            page_size: options.page_size,
        };
        let file = PageFile::create(path, options.page_size as usize, 0, &header.encode())?;
        Ok(Self::from_file(file, options))
    }

    /// Opens an existing data file and returns it with its decoded header.
    pub fn open(path: impl AsRef<Path>, options: &DataOptions) -> Result<(Self, DataHeader)> {
        check_page_size(options.page_size)?;
        let file = PageFile::open(path, options.page_size as usize)?;
        let header = DataHeader::decode(&file.read_header()?)?;
        if header.page_size != options.page_size {
            return Err(VellumError::Corruption("data file page size mismatch"));
        }
        Ok((Self::from_file(file, options), header))
    }

    fn from_file(file: PageFile, options: &DataOptions) -> Self {
        let cache_pages = NonZeroUsize::new(options.read_cache_pages).unwrap_or(NonZeroUsize::MIN);
        Self {
            page_size: options.page_size as usize,
            file,
            writer: Mutex::new(()),
            buffer: Mutex::new(ModifyBuffer::new(options.modify_buffer_pages)),
            cache: Mutex::new(ReadCache {
                pages: LruCache::new(cache_pages),
                epoch: 0,
            }),
            readers: HandlePool::new(options.read_pool_size),
            counters: Counters::default(),
        }
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Reads a page, populating the shared cache on a miss.
    pub fn read(&self, id: PageId, dst: &mut [u8]) -> Result<()> {
        self.read_page(id, dst, true)
    }

    /// Reads a page without disturbing the shared cache.
    pub fn read_admin(&self, id: PageId, dst: &mut [u8]) -> Result<()> {
        self.read_page(id, dst, false)
    }

    fn read_page(&self, id: PageId, dst: &mut [u8], populate: bool) -> Result<()> {
        if dst.len() != self.page_size {
            return Err(VellumError::Invalid("read buffer is not one page"));
        }
        let epoch = self.cache.lock().epoch;
        if let Some(page) = self.buffer.lock().get(id) {
            dst.copy_from_slice(&page);
            self.counters.buffer_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        {
            let mut cache = self.cache.lock();
            let hit = if populate {
                cache.pages.get(&id).cloned()
            } else {
                cache.pages.peek(&id).cloned()
            };
            if let Some(page) = hit {
                dst.copy_from_slice(&page);
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }
        {
            let handle = self.readers.acquire(|| self.file.open_read_only())?;
            handle.read_pages(id.0, dst)?;
        }
        self.counters.file_reads.fetch_add(1, Ordering::Relaxed);
        let header = page::verify(dst)?;
        if header.page_id != id {
            return Err(VellumError::Corruption("data page id mismatch"));
        }
        if populate {
            let mut cache = self.cache.lock();
            if cache.epoch == epoch {
                cache.pages.put(id, Arc::from(&*dst));
            }
        }
        Ok(())
    }

    /// Pulls `count` pages from `src` into the modify buffer.
    ///
    /// A page id seen more than once keeps only its last version. The caller
    /// guarantees the buffer has room, see [`Data::modify_buffer_remaining`].
    pub fn apply<S: PageSource + ?Sized>(&self, src: &mut S, count: u64) -> Result<()> {
        let _writer = self.writer.lock();
        let mut chunk = vec![0u8; IO_CHUNK_PAGES * self.page_size];
        let mut remaining = count;
        while remaining > 0 {
            let pages = remaining.min(IO_CHUNK_PAGES as u64) as usize;
            let bytes = &mut chunk[..pages * self.page_size];
            src.read_pages(bytes)?;
            let mut ids = Vec::with_capacity(pages);
            {
                let mut buffer = self.buffer.lock();
                for image in bytes.chunks_exact(self.page_size) {
                    let id = page::page_id_of(image);
                    buffer.put(id, image)?;
                    ids.push(id);
                }
            }
            self.cache.lock().invalidate(ids);
            remaining -= pages as u64;
        }
        debug!(pages = count, "data.apply.buffered");
        Ok(())
    }

    /// Writes `count` pages from `src` straight to the file and syncs it.
    ///
    /// Only legal while the modify buffer is empty, i.e. right after a
    /// checkpoint. The pages are durable on return, so a later checkpoint
    /// that finds the buffer empty may move the log past them.
    pub fn apply_direct<S: PageSource + ?Sized>(&self, src: &mut S, count: u64) -> Result<()> {
        let _writer = self.writer.lock();
        if !self.buffer.lock().is_empty() {
            return Err(VellumError::Invalid("direct apply with non-empty modify buffer"));
        }
        let mut chunk = vec![0u8; IO_CHUNK_PAGES * self.page_size];
        let mut remaining = count;
        while remaining > 0 {
            let pages = remaining.min(IO_CHUNK_PAGES as u64) as usize;
            let bytes = &mut chunk[..pages * self.page_size];
            src.read_pages(bytes)?;
            self.cache
                .lock()
                .invalidate(bytes.chunks_exact(self.page_size).map(page::page_id_of));
            for image in bytes.chunks_exact(self.page_size) {
                self.file.write_pages(page::page_id_of(image).0, image)?;
            }
            self.cache.lock().invalidate(std::iter::empty());
            remaining -= pages as u64;
        }
        self.file.sync()?;
        self.counters.direct_pages.fetch_add(count, Ordering::Relaxed);
        debug!(pages = count, "data.apply_direct.written");
        Ok(())
    }

    /// Flushes the modify buffer to the file.
    ///
    /// Returns the number of pages written; an empty buffer performs no I/O.
    pub fn checkpoint(&self) -> Result<usize> {
        let _writer = self.writer.lock();
        let pages = {
            let buffer = self.buffer.lock();
            if buffer.is_empty() {
                return Ok(0);
            }
            buffer.sorted()
        };
        {
            let mut cache = self.cache.lock();
            for (id, image) in &pages {
                cache.pages.put(*id, Arc::clone(image));
            }
            cache.epoch += 1;
        }
        let mut run = Vec::with_capacity(IO_CHUNK_PAGES * self.page_size);
        let mut run_start = 0u64;
        let mut run_len = 0usize;
        for (id, image) in &pages {
            if run_len > 0 && (id.0 != run_start + run_len as u64 || run_len == IO_CHUNK_PAGES) {
                self.file.write_pages(run_start, &run)?;
                run.clear();
                run_len = 0;
            }
            if run_len == 0 {
                run_start = id.0;
            }
            run.extend_from_slice(image);
            run_len += 1;
        }
        if run_len > 0 {
            self.file.write_pages(run_start, &run)?;
        }
        self.file.sync()?;
        self.buffer.lock().clear();
        self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.counters
            .pages_checkpointed
            .fetch_add(pages.len() as u64, Ordering::Relaxed);
        info!(pages = pages.len(), "data.checkpoint.applied");
        Ok(pages.len())
    }

    /// Room left in the modify buffer, in distinct pages.
    pub fn modify_buffer_remaining(&self) -> usize {
        self.buffer.lock().remaining()
    }

    /// Number of distinct pages currently buffered.
    pub fn modify_buffer_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Syncs the data file.
    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    /// Releases pooled read handles and refuses further file reads.
    pub fn shutdown(&self) {
        self.readers.close();
    }

    /// Snapshot of activity counters.
    pub fn stats(&self) -> DataStats {
        let c = &self.counters;
        DataStats {
            buffer_hits: c.buffer_hits.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            file_reads: c.file_reads.load(Ordering::Relaxed),
            checkpoints: c.checkpoints.load(Ordering::Relaxed),
            pages_checkpointed: c.pages_checkpointed.load(Ordering::Relaxed),
            direct_pages: c.direct_pages.load(Ordering::Relaxed),
        }
    }
}
