#![forbid(unsafe_code)]

//! Write-ahead log.
//!
//! Log pages `[start, next)` hold committed transactions in commit order.
//! Each committed run is applied to [`Data`] as soon as it lands; the
//! checkpoint pointer marks how much of it has reached the data file. The
//! header block is rewritten at open, checkpoint, shrink and close, never
//! per commit, so after a crash the pages between `checkpoint` and the
//! physical end of the file are rescanned and replayed.

pub mod recovery;
pub mod shrink;

use std::ffi::OsString;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use self::recovery::{DataLengthCalculator, TrxReader};
use self::shrink::shrink_pages;
use crate::primitives::data::Data;
use crate::primitives::pagefile::{
    check_block, get_u128, get_u32, get_u64, seal_block, transfer, HeaderBlock, PageFile,
    PageSource, HEADER_BLOCK_LEN,
};
use crate::types::page::check_page_size;
use crate::types::{LogId, Result, VellumError};

const LOG_MAGIC: [u8; 4] = *b"VLLG";
const LOG_FORMAT_VERSION: u16 = 1;
const LOG_ID: Range<usize> = 8..24;
const LOG_START: Range<usize> = 24..32;
const LOG_CHECKPOINT: Range<usize> = 32..40;
const LOG_NEXT: Range<usize> = 40..48;
const LOG_DATA_LENGTH: Range<usize> = 48..56;
const LOG_SLAVE: usize = 56;
const LOG_MASTER_ID: Range<usize> = 57..73;
const LOG_SUCCESSFUL_STOP: usize = 73;
const LOG_PAGE_SIZE: Range<usize> = 74..78;

/// Durability mode for commits.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Synchronous {
    /// Sync the log before applying every commit.
    #[default]
    Full,
    /// Only sync at checkpoint, shrink and close.
    Off,
}

impl Synchronous {
    /// Returns the string representation of the synchronous mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Off => "off",
        }
    }
}

/// Options governing log behaviour.
#[derive(Clone, Debug)]
pub struct LogOptions {
    /// Page size in bytes.
    pub page_size: u32,
    /// Commit durability.
    pub synchronous: Synchronous,
    /// Pages moved per chunk by shrink and replica apply.
    pub transfer_chunk_pages: usize,
}

/// Decoded log header block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogHeader {
    /// Identity shared with the paired data file.
    pub log_id: LogId,
    /// First log page still present.
    pub start: u64,
    /// Log pages before this one are reflected in the data file.
    pub checkpoint: u64,
    /// Log page the next transaction will be written at.
    pub next: u64,
    /// Logical data file length in pages.
    pub data_length: u64,
    /// Whether this log is a replica fed by log shipping.
    pub slave: bool,
    /// Identity of the master log, [`LogId::NONE`] when independent.
    pub master_log_id: LogId,
    /// Whether the previous session closed cleanly.
    pub successful_stop: bool,
    /// Page size the log was created with.
    pub page_size: u32,
}

impl LogHeader {
    /// Header of a brand-new, empty, independent log.
    pub fn fresh(log_id: LogId, page_size: u32) -> Self {
        Self {
            log_id,
            start: 0,
            checkpoint: 0,
            next: 0,
            data_length: 0,
            slave: false,
            master_log_id: LogId::NONE,
            successful_stop: true,
            page_size,
        }
    }

    /// Encodes the header into a sealed block.
    pub fn encode(&self) -> HeaderBlock {
        let mut block = [0u8; HEADER_BLOCK_LEN];
        block[LOG_ID].copy_from_slice(&self.log_id.0.to_be_bytes());
        block[LOG_START].copy_from_slice(&self.start.to_be_bytes());
        block[LOG_CHECKPOINT].copy_from_slice(&self.checkpoint.to_be_bytes());
        block[LOG_NEXT].copy_from_slice(&self.next.to_be_bytes());
        block[LOG_DATA_LENGTH].copy_from_slice(&self.data_length.to_be_bytes());
        block[LOG_SLAVE] = u8::from(self.slave);
        block[LOG_MASTER_ID].copy_from_slice(&self.master_log_id.0.to_be_bytes());
        block[LOG_SUCCESSFUL_STOP] = u8::from(self.successful_stop);
        block[LOG_PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        seal_block(&mut block, LOG_MAGIC, LOG_FORMAT_VERSION);
        block
    }

    /// Validates and decodes a header block.
    pub fn decode(block: &HeaderBlock) -> Result<Self> {
        check_block(block, LOG_MAGIC, LOG_FORMAT_VERSION)?;
        let header = Self {
            log_id: LogId(get_u128(block, LOG_ID)),
            start: get_u64(block, LOG_START),
            checkpoint: get_u64(block, LOG_CHECKPOINT),
            next: get_u64(block, LOG_NEXT),
            data_length: get_u64(block, LOG_DATA_LENGTH),
            slave: block[LOG_SLAVE] != 0,
            master_log_id: LogId(get_u128(block, LOG_MASTER_ID)),
            successful_stop: block[LOG_SUCCESSFUL_STOP] != 0,
            page_size: get_u32(block, LOG_PAGE_SIZE),
        };
        if header.start > header.checkpoint || header.checkpoint > header.next {
            return Err(VellumError::Corruption("log header pointers out of order"));
        }
        Ok(header)
    }
}

/// Immutable snapshot of the log header handed to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogInfo {
    /// Identity of this log.
    pub log_id: LogId,
    /// First log page still present.
    pub start: u64,
    /// Checkpoint pointer.
    pub checkpoint: u64,
    /// Next log page to be written.
    pub next: u64,
    /// Logical data file length in pages.
    pub data_length: u64,
    /// Whether this log is a replica.
    pub slave: bool,
    /// Identity of the master log.
    pub master_log_id: LogId,
    /// Page size in bytes.
    pub page_size: u32,
}

impl From<&LogHeader> for LogInfo {
    fn from(header: &LogHeader) -> Self {
        Self {
            log_id: header.log_id,
            start: header.start,
            checkpoint: header.checkpoint,
            next: header.next,
            data_length: header.data_length,
            slave: header.slave,
            master_log_id: header.master_log_id,
            page_size: header.page_size,
        }
    }
}

/// What recovery found when the log was reopened after an unclean stop.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Transactions replayed into the data file.
    pub transactions: u64,
    /// Log pages replayed.
    pub pages: u64,
    /// Log pages discarded after the last complete transaction.
    pub discarded_pages: u64,
}

/// The write-ahead log bound to one [`Data`].
///
/// `header` is owned by the writer and may be held across data file I/O.
/// Readers only ever see `info`, republished once each change is applied.
pub struct Log {
    path: PathBuf,
    file: RwLock<PageFile>,
    header: Mutex<LogHeader>,
    info: RwLock<LogInfo>,
    data: Arc<Data>,
    options: LogOptions,
    recovery: Option<RecoveryOutcome>,
}

impl Log {
    /// Creates a log file from `header` and opens it for writing.
    pub fn create(
        path: impl AsRef<Path>,
        mut header: LogHeader,
        data: Arc<Data>,
        options: LogOptions,
    ) -> Result<Self> {
        check_page_size(options.page_size)?;
        header.page_size = options.page_size;
        header.successful_stop = false;
        let path = path.as_ref().to_path_buf();
        let file = PageFile::create(&path, options.page_size as usize, header.start, &header.encode())?;
        info!(log_id = %header.log_id, start = header.start, slave = header.slave, "log.create");
        Ok(Self {
            path,
            file: RwLock::new(file),
            info: RwLock::new(LogInfo::from(&header)),
            header: Mutex::new(header),
            data,
            options,
            recovery: None,
        })
    }

    /// Opens an existing log, recovering it if the last session did not
    /// stop cleanly.
    ///
    /// `data_log_id` is the identity recorded in the paired data file.
    pub fn open(
        path: impl AsRef<Path>,
        data_log_id: LogId,
        data: Arc<Data>,
        options: LogOptions,
    ) -> Result<Self> {
        check_page_size(options.page_size)?;
        let path = path.as_ref().to_path_buf();
        let mut file = PageFile::open(&path, options.page_size as usize)?;
        let mut header = LogHeader::decode(&file.read_header()?)?;
        if header.log_id != data_log_id {
            return Err(VellumError::Corruption("log and data file identities differ"));
        }
        if header.page_size != options.page_size {
            return Err(VellumError::Corruption("log file page size mismatch"));
        }
        file.set_base(header.start);
        if file.end_page()? < header.next {
            return Err(VellumError::Corruption("log file shorter than its next pointer"));
        }
        let mut log = Self {
            path,
            file: RwLock::new(file),
            header: Mutex::new(header.clone()),
            info: RwLock::new(LogInfo::from(&header)),
            data,
            options,
            recovery: None,
        };
        if !header.successful_stop {
            log.recovery = Some(log.recover(&mut header)?);
        }
        header.successful_stop = false;
        log.persist(&log.file(), &header)?;
        info!(
            log_id = %header.log_id,
            start = header.start,
            next = header.next,
            data_length = header.data_length,
            "log.open"
        );
        *log.header.get_mut() = header;
        Ok(log)
    }

    fn file(&self) -> PageFile {
        self.file.read().clone()
    }

    fn persist(&self, file: &PageFile, header: &LogHeader) -> Result<()> {
        file.write_header(&header.encode())?;
        self.publish(header);
        Ok(())
    }

    fn publish(&self, header: &LogHeader) {
        *self.info.write() = LogInfo::from(header);
    }

    fn page_size(&self) -> usize {
        self.options.page_size as usize
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recovery performed when this log was opened, if any.
    pub fn recovery(&self) -> Option<&RecoveryOutcome> {
        self.recovery.as_ref()
    }

    /// Latest published header snapshot.
    ///
    /// Never waits on a commit or checkpoint in progress; the snapshot
    /// changes only after the data it describes is readable.
    pub fn start(&self) -> LogInfo {
        self.info.read().clone()
    }

    /// Writes a run of transaction pages at log page `pos`.
    ///
    /// `pos` may not precede `next`: committed history is immutable.
    pub fn append(&self, pos: u64, pages: &[u8]) -> Result<()> {
        let next = self.info.read().next;
        if pos < next {
            return Err(VellumError::wrong_page(pos, next, u64::MAX));
        }
        self.file().write_pages(pos, pages)
    }

    /// Reads back pages previously appended at or after `next`.
    pub fn read_uncommitted(&self, pos: u64, dst: &mut [u8]) -> Result<()> {
        let next = self.info.read().next;
        if pos < next {
            return Err(VellumError::wrong_page(pos, next, u64::MAX));
        }
        self.file().read_pages(pos, dst)
    }

    /// Applies the `trx_size` pages appended at `next` and advances `next`.
    pub fn commit(&self, trx_size: u64) -> Result<()> {
        if trx_size == 0 {
            return Ok(());
        }
        let file = self.file();
        if self.options.synchronous == Synchronous::Full {
            file.sync()?;
        }
        let mut header = self.header.lock();
        self.apply_run(&file, &mut header, trx_size)?;
        debug!(pages = trx_size, next = header.next, "log.commit");
        Ok(())
    }

    fn apply_run(&self, file: &PageFile, header: &mut LogHeader, size: u64) -> Result<()> {
        let mut source =
            DataLengthCalculator::new(file.reader(header.next), self.page_size(), header.data_length);
        if size > self.data.modify_buffer_remaining() as u64 {
            file.sync()?;
            let flushed = self.data.checkpoint()?;
            header.checkpoint = header.next;
            self.persist(file, header)?;
            info!(pages = size, flushed, "log.commit.forced_checkpoint");
            self.data.apply_direct(&mut source, size)?;
        } else {
            self.data.apply(&mut source, size)?;
        }
        header.next += size;
        header.data_length = source.data_length();
        self.publish(header);
        Ok(())
    }

    /// Discards the `written` pages an aborted transaction appended at
    /// `next`.
    ///
    /// The file is cut back to `next` so a later, shorter transaction cannot
    /// leave the tail of this one looking like a complete run to recovery.
    pub fn rollback(&self, written: u64) -> Result<()> {
        if written == 0 {
            return Ok(());
        }
        let file = self.file();
        let header = self.header.lock();
        if file.end_page()? > header.next {
            file.truncate(header.next)?;
            if self.options.synchronous == Synchronous::Full {
                file.sync()?;
            }
        }
        debug!(pages = written, next = header.next, "log.rollback");
        Ok(())
    }

    /// Flushes the modify buffer and moves the checkpoint pointer to `next`.
    ///
    /// Returns the number of data pages written. When nothing is pending
    /// no file is touched.
    pub fn checkpoint(&self) -> Result<usize> {
        let file = self.file();
        let mut header = self.header.lock();
        if self.data.modify_buffer_len() == 0
            && header.checkpoint == header.next
            && file.end_page()? == header.next
        {
            return Ok(0);
        }
        let pages = self.checkpoint_locked(&file, &mut header)?;
        self.persist(&file, &header)?;
        info!(pages, checkpoint = header.checkpoint, "log.checkpoint");
        Ok(pages)
    }

    fn checkpoint_locked(&self, file: &PageFile, header: &mut LogHeader) -> Result<usize> {
        file.sync()?;
        let pages = self.data.checkpoint()?;
        header.checkpoint = header.next;
        file.truncate(header.next)?;
        Ok(pages)
    }

    /// Checkpoints and records a clean stop.
    pub fn close(&self) -> Result<()> {
        let file = self.file();
        let mut header = self.header.lock();
        self.checkpoint_locked(&file, &mut header)?;
        header.successful_stop = true;
        self.persist(&file, &header)?;
        self.data.sync()?;
        info!(next = header.next, data_length = header.data_length, "log.close");
        Ok(())
    }

    fn recover(&self, header: &mut LogHeader) -> Result<RecoveryOutcome> {
        let file = self.file();
        let end = file.end_page()?;
        header.next = header.checkpoint;
        info!(from = header.checkpoint, end, "log.recovery.start");
        let mut outcome = RecoveryOutcome::default();
        let mut reader = TrxReader::new(&file, header.checkpoint);
        loop {
            match reader.read_trx(end - reader.position()) {
                Ok(0) => break,
                Ok(len) => {
                    self.apply_run(&file, header, len)?;
                    outcome.transactions += 1;
                    outcome.pages += len;
                }
                Err(VellumError::TrxCorrupted(at)) => {
                    warn!(at, "log.recovery.discard_partial_transaction");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        outcome.discarded_pages = end - header.next;
        self.checkpoint_locked(&file, header)?;
        info!(
            transactions = outcome.transactions,
            pages = outcome.pages,
            discarded = outcome.discarded_pages,
            data_length = header.data_length,
            "log.recovery.complete"
        );
        Ok(outcome)
    }

    /// Drops log history before `start_page - 1`.
    ///
    /// `start_page` must lie in `[start, next]`. The log is checkpointed,
    /// the retained pages are copied into a sibling file and that file
    /// atomically replaces the log. Returns the new `start`.
    pub fn shrink(&self, start_page: u64) -> Result<u64> {
        let file = self.file();
        let mut header = self.header.lock();
        if start_page < header.start || start_page > header.next {
            return Err(VellumError::wrong_page(start_page, header.start, header.next + 1));
        }
        let new_start = start_page.saturating_sub(1).max(header.start);
        self.checkpoint_locked(&file, &mut header)?;
        if new_start == header.start {
            self.persist(&file, &header)?;
            return Ok(new_start);
        }

        let mut shrunk = header.clone();
        shrunk.start = new_start;
        let temp = append_suffix(&self.path, "-shrink");
        if temp.exists() {
            fs::remove_file(&temp)?;
        }
        let page_size = self.page_size();
        let dst = PageFile::create(&temp, page_size, new_start, &shrunk.encode())?;
        let mut scratch = vec![0u8; self.options.transfer_chunk_pages.max(1) * page_size];
        let copied = shrink_pages(&file, &dst, header.next, &mut scratch)?;
        drop(dst);
        fs::rename(&temp, &self.path)?;

        let mut reopened = PageFile::open(&self.path, page_size)?;
        reopened.set_base(new_start);
        *self.file.write() = reopened;
        let old_start = header.start;
        *header = shrunk;
        self.publish(&header);
        info!(old_start, new_start, retained = copied, "log.shrink");
        Ok(new_start)
    }

    /// Turns a replica into an independent writable log.
    pub fn clear_slave(&self) -> Result<()> {
        let file = self.file();
        let mut header = self.header.lock();
        header.slave = false;
        header.master_log_id = LogId::NONE;
        self.persist(&file, &header)?;
        info!(log_id = %header.log_id, "log.clear_slave");
        Ok(())
    }

    /// Reads committed log pages `[from, from + n)` into `dst`.
    pub fn read_admin(&self, from: u64, dst: &mut [u8]) -> Result<()> {
        let count = (dst.len() / self.page_size()) as u64;
        let file = self.file();
        let info = self.start();
        let end = from.checked_add(count).unwrap_or(u64::MAX);
        if from < info.start || end > info.next {
            return Err(VellumError::wrong_page(from, info.start, info.next));
        }
        file.read_pages(from, dst)
    }

    /// Appends `count` shipped pages at `from` on a replica and commits every
    /// complete transaction among them.
    ///
    /// `from` must equal `next`. Returns the number of transactions applied.
    /// A trailing incomplete transaction fails with
    /// [`VellumError::TrxCorrupted`] after the complete ones are applied.
    pub fn apply_replicated<S: PageSource + ?Sized>(
        &self,
        from: u64,
        src: &mut S,
        count: u64,
    ) -> Result<u64> {
        let file = self.file();
        let mut header = self.header.lock();
        if !header.slave {
            return Err(VellumError::Invalid("log is not a replica"));
        }
        if from != header.next {
            return Err(VellumError::wrong_page(from, header.next, header.next + 1));
        }
        let page_size = self.page_size();
        let mut scratch = vec![0u8; self.options.transfer_chunk_pages.max(1).min(count.max(1) as usize) * page_size];
        transfer(src, &mut file.writer(from), count, page_size, &mut scratch)?;
        if self.options.synchronous == Synchronous::Full {
            file.sync()?;
        }
        let end = from + count;
        let mut reader = TrxReader::new(&file, from);
        let mut applied = 0;
        while reader.position() < end {
            let len = reader.read_trx(end - reader.position())?;
            if len == 0 {
                return Err(VellumError::TrxCorrupted(reader.position()));
            }
            self.apply_run(&file, &mut header, len)?;
            applied += 1;
        }
        debug!(pages = count, transactions = applied, next = header.next, "log.apply_replicated");
        Ok(applied)
    }
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("vellum-log"));
    name.push(suffix);
    let mut new_path = path.to_path_buf();
    new_path.set_file_name(name);
    new_path
}
