//! Page storage: the session coordinator binding the data file, the log and
//! a lock manager into the transaction API.
//!
//! Any I/O or corruption fault raised by the data file or the log shuts the
//! whole engine down; every later call, and every call already waiting on a
//! lock or a read handle, fails with [`VellumError::Closed`].

mod data2log;
mod log_buffer;
mod options;
mod trx;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

pub use self::options::StorageOptions;
pub use self::trx::{ModifyTransaction, ReadTransaction, Transaction};
pub use crate::primitives::log::Synchronous;

use self::log_buffer::ModifyLogBuffer;
use crate::primitives::concurrency::{LockManager, LockSnapshot, StorageLocks};
use crate::primitives::data::{Data, DataStats};
use crate::primitives::log::{Log, LogHeader, LogInfo, RecoveryOutcome};
use crate::primitives::pagefile::PageSource;
use crate::types::{LogId, PageId, Result, VellumError};

/// A data file and its log, open for transactions.
pub struct PageStorage {
    data: Arc<Data>,
    log: Log,
    locks: Arc<dyn LockManager>,
    options: StorageOptions,
    closed: AtomicBool,
}

impl PageStorage {
    /// Creates a new bound data/log pair and opens it.
    pub fn create(
        data_path: impl AsRef<Path>,
        log_path: impl AsRef<Path>,
        options: &StorageOptions,
    ) -> Result<Self> {
        let log_id = LogId::random();
        Self::create_with_header(
            data_path.as_ref(),
            log_path.as_ref(),
            LogHeader::fresh(log_id, options.page_size),
            options,
        )
    }

    pub(crate) fn create_with_header(
        data_path: &Path,
        log_path: &Path,
        header: LogHeader,
        options: &StorageOptions,
    ) -> Result<Self> {
        let data = Arc::new(Data::create(data_path, header.log_id, &options.data_options())?);
        let log = Log::create(log_path, header, Arc::clone(&data), options.log_options())?;
        let locks = Arc::new(StorageLocks::new(options.lock_timeout()));
        Ok(Self::assemble(data, log, locks, options))
    }

    /// Opens an existing pair, recovering the log if needed.
    pub fn open(
        data_path: impl AsRef<Path>,
        log_path: impl AsRef<Path>,
        options: &StorageOptions,
    ) -> Result<Self> {
        let locks = Arc::new(StorageLocks::new(options.lock_timeout()));
        Self::open_with_locks(data_path, log_path, options, locks)
    }

    /// Opens an existing pair coordinated by a caller-supplied lock manager.
    pub fn open_with_locks(
        data_path: impl AsRef<Path>,
        log_path: impl AsRef<Path>,
        options: &StorageOptions,
        locks: Arc<dyn LockManager>,
    ) -> Result<Self> {
        let (data, header) = Data::open(data_path, &options.data_options())?;
        let data = Arc::new(data);
        let log = Log::open(log_path, header.log_id, Arc::clone(&data), options.log_options())?;
        Ok(Self::assemble(data, log, locks, options))
    }

    fn assemble(
        data: Arc<Data>,
        log: Log,
        locks: Arc<dyn LockManager>,
        options: &StorageOptions,
    ) -> Self {
        Self {
            data,
            log,
            locks,
            options: options.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Options the storage was opened with.
    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.options.page_size as usize
    }

    /// Whether the engine has shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(VellumError::Closed);
        }
        Ok(())
    }

    /// Routes a data/log result through the fail-fast policy.
    fn guard<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Err(err) if err.is_fatal() => {
                self.shutdown(&err);
                Err(err)
            }
            other => other,
        }
    }

    fn shutdown(&self, cause: &VellumError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(error = %cause, "storage.shutdown");
        self.data.shutdown();
        self.locks.shutdown();
    }

    /// Snapshot of the log header.
    pub fn log_info(&self) -> Result<LogInfo> {
        self.ensure_open()?;
        Ok(self.log.start())
    }

    /// Logical data file length in pages.
    pub fn data_length(&self) -> u64 {
        self.log.start().data_length
    }

    /// Recovery performed when the storage was opened, if any.
    pub fn recovery(&self) -> Option<&RecoveryOutcome> {
        self.log.recovery()
    }

    /// Data file cache counters.
    pub fn data_stats(&self) -> DataStats {
        self.data.stats()
    }

    /// Current lock state.
    pub fn lock_snapshot(&self) -> LockSnapshot {
        self.locks.snapshot()
    }

    /// Starts a read transaction under the shared lock.
    pub fn start_read(&self) -> Result<ReadTransaction<'_>> {
        self.ensure_open()?;
        self.locks.lock_read()?;
        Ok(ReadTransaction::new(self))
    }

    pub(crate) fn rollback_read(&self) {
        self.locks.unlock_read();
    }

    /// Starts a modify transaction under the exclusive modify lock.
    pub fn start_modify(&self) -> Result<ModifyTransaction<'_>> {
        self.ensure_open()?;
        self.locks.lock_modify()?;
        let info = self.log.start();
        if info.slave {
            self.locks.unlock_modify();
            return Err(VellumError::Invalid("replica storage only accepts shipped log pages"));
        }
        let buffer = ModifyLogBuffer::new(
            info.next,
            self.page_size(),
            self.options.log_window_pages,
            self.options.data2log_memory_entries,
            self.options.temp_dir.clone(),
        );
        debug!(trx = %buffer.trx_id(), base = info.next, "storage.modify.start");
        Ok(ModifyTransaction::new(self, buffer, info.data_length))
    }

    /// Applies a transaction's log pages and releases its locks.
    ///
    /// The commit lock covers only the log sync and the apply; the modify
    /// lock is released once that step is over. A commit that fails without
    /// shutting the engine down has its pages cut from the log.
    pub(crate) fn commit_modify(&self, size: u64) -> Result<()> {
        let result = self.ensure_open().and_then(|()| {
            self.locks.lock_commit()?;
            let committed = self.log.commit(size);
            self.locks.unlock_commit();
            committed
        });
        let result = self.guard(result);
        if result.is_err() {
            self.discard_log_pages(size);
        }
        self.locks.unlock_modify();
        result
    }

    pub(crate) fn rollback_modify(&self, written: u64) {
        self.discard_log_pages(written);
        self.locks.unlock_modify();
    }

    fn discard_log_pages(&self, written: u64) {
        if written == 0 || self.is_closed() {
            return;
        }
        if let Err(err) = self.guard(self.log.rollback(written)) {
            warn!(error = %err, pages = written, "storage.modify.discard_failed");
        }
    }

    /// Reads a committed data page through the shared cache.
    pub(crate) fn read_page(&self, id: PageId, dst: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        let data_length = self.data_length();
        if id.0 >= data_length {
            return Err(VellumError::wrong_page(id.0, 0, data_length));
        }
        self.guard(self.data.read(id, dst))
    }

    pub(crate) fn append_log(&self, pos: u64, pages: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.guard(self.log.append(pos, pages))
    }

    pub(crate) fn read_uncommitted_log(&self, pos: u64, dst: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        self.guard(self.log.read_uncommitted(pos, dst))
    }

    fn with_modify_lock<T>(&self, op: impl FnOnce() -> Result<T>) -> Result<T> {
        self.ensure_open()?;
        self.locks.lock_modify()?;
        let result = op();
        self.locks.unlock_modify();
        self.guard(result)
    }

    /// Flushes buffered pages to the data file and truncates the log to
    /// `next`. Returns the number of data pages written.
    pub fn checkpoint(&self) -> Result<usize> {
        self.with_modify_lock(|| self.log.checkpoint())
    }

    /// Discards log history before `start_page - 1`; see [`Log::shrink`].
    pub fn shrink(&self, start_page: u64) -> Result<u64> {
        self.with_modify_lock(|| self.log.shrink(start_page))
    }

    /// Promotes a restored replica to an independent writable storage.
    pub fn clear_slave(&self) -> Result<()> {
        self.with_modify_lock(|| self.log.clear_slave())
    }

    /// Cache-bypassing read of data page `id`, outside the transaction locks.
    pub fn admin_data_read(&self, id: PageId, dst: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        let data_length = self.data_length();
        if id.0 >= data_length {
            return Err(VellumError::wrong_page(id.0, 0, data_length));
        }
        self.guard(self.data.read_admin(id, dst))
    }

    /// Reads committed log pages starting at `from`; the whole range must
    /// lie in `[start, next)`.
    pub fn admin_log_read(&self, from: u64, dst: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        self.guard(self.log.read_admin(from, dst))
    }

    /// Applies `count` log pages shipped from the master, starting at log
    /// page `from`. Returns the number of transactions committed.
    pub fn apply_log_pages<S: PageSource + ?Sized>(
        &self,
        from: u64,
        src: &mut S,
        count: u64,
    ) -> Result<u64> {
        self.with_modify_lock(|| self.log.apply_replicated(from, src, count))
    }

    /// Runs `op` with the modify lock held and the modify buffer flushed.
    ///
    /// `op` reads data pages through a source whose faults follow the
    /// fail-fast policy; its own errors (e.g. on a backup file) do not.
    pub(crate) fn with_checkpointed<T>(
        &self,
        op: impl FnOnce(&LogInfo, &mut DataPages<'_>) -> Result<T>,
    ) -> Result<T> {
        self.ensure_open()?;
        self.locks.lock_modify()?;
        let result = self.guard(self.log.checkpoint()).and_then(|_| {
            let info = self.log.start();
            let mut pages = DataPages {
                storage: self,
                next: PageId(0),
            };
            op(&info, &mut pages)
        });
        self.locks.unlock_modify();
        result
    }

    /// Writes `count` pages from `src` straight into the empty data file of
    /// a freshly created storage.
    pub(crate) fn load_data<S: PageSource + ?Sized>(&self, src: &mut S, count: u64) -> Result<()> {
        self.with_modify_lock(|| {
            self.data.apply_direct(src, count)?;
            self.data.sync()
        })
    }

    /// Path of the data file.
    pub fn data_path(&self) -> &Path {
        self.data.path()
    }

    /// Path of the log file.
    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    /// Waits for open read transactions, then checkpoints, records a clean
    /// stop and shuts the engine down.
    ///
    /// If readers are still active when the lock timeout expires the call
    /// fails with [`VellumError::LockTimeout`] and the storage stays open.
    pub fn close(&self) -> Result<()> {
        self.ensure_open()?;
        self.locks.lock_modify()?;
        if let Err(err) = self.locks.wait_readers_drained() {
            self.locks.unlock_modify();
            return Err(err);
        }
        let result = self.log.close();
        self.closed.store(true, Ordering::Release);
        self.data.shutdown();
        self.locks.shutdown();
        self.locks.unlock_modify();
        if result.is_ok() {
            info!("storage.close");
        }
        result
    }
}

/// Sequential cache-bypassing reader over committed data pages.
pub(crate) struct DataPages<'a> {
    storage: &'a PageStorage,
    next: PageId,
}

impl PageSource for DataPages<'_> {
    fn read_pages(&mut self, dst: &mut [u8]) -> Result<()> {
        for page in dst.chunks_exact_mut(self.storage.page_size()) {
            self.storage.admin_data_read(self.next, page)?;
            self.next = PageId(self.next.0 + 1);
        }
        Ok(())
    }
}
