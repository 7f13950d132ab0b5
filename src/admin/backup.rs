use std::ops::Range;
use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use tracing::info;

use crate::primitives::log::LogHeader;
use crate::primitives::pagefile::{
    check_block, get_u128, get_u32, get_u64, seal_block, transfer, HeaderBlock, PageFile,
    HEADER_BLOCK_LEN,
};
use crate::storage::{PageStorage, StorageOptions};
use crate::types::{LogId, Result, VellumError};

const BACKUP_MAGIC: [u8; 4] = *b"VLBK";
const BACKUP_FORMAT_VERSION: u16 = 1;
const BACKUP_START: Range<usize> = 8..16;
const BACKUP_MASTER_ID: Range<usize> = 16..32;
const BACKUP_LENGTH: Range<usize> = 32..40;
const BACKUP_PAGE_SIZE: Range<usize> = 40..44;

/// Header block of a backup file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupHeader {
    /// Log page a replica seeded from this backup continues at.
    pub start: u64,
    /// Identity of the log the backup was taken from.
    pub master_log_id: LogId,
    /// Number of data pages in the backup.
    pub backup_length: u64,
    /// Page size of the backed-up storage.
    pub page_size: u32,
}

impl BackupHeader {
    /// Encodes the header into a sealed block.
    pub fn encode(&self) -> HeaderBlock {
        let mut block = [0u8; HEADER_BLOCK_LEN];
        block[BACKUP_START].copy_from_slice(&self.start.to_be_bytes());
        block[BACKUP_MASTER_ID].copy_from_slice(&self.master_log_id.0.to_be_bytes());
        block[BACKUP_LENGTH].copy_from_slice(&self.backup_length.to_be_bytes());
        block[BACKUP_PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        seal_block(&mut block, BACKUP_MAGIC, BACKUP_FORMAT_VERSION);
        block
    }

    /// Validates and decodes a header block.
    pub fn decode(block: &HeaderBlock) -> Result<Self> {
        check_block(block, BACKUP_MAGIC, BACKUP_FORMAT_VERSION)?;
        Ok(Self {
            start: get_u64(block, BACKUP_START),
            master_log_id: LogId(get_u128(block, BACKUP_MASTER_ID)),
            backup_length: get_u64(block, BACKUP_LENGTH),
            page_size: get_u32(block, BACKUP_PAGE_SIZE),
        })
    }
}

/// Report generated after writing a backup.
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    /// Data pages copied.
    pub pages: u64,
    /// Log page the backup continues at.
    pub start: u64,
    /// Identity of the backed-up log.
    pub master_log_id: LogId,
    /// Duration of the backup in milliseconds.
    pub duration_ms: f64,
}

/// Report generated after seeding a storage from a backup.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    /// Data pages copied.
    pub pages: u64,
    /// Start, checkpoint and next of the new log.
    pub start: u64,
    /// Identity of the new log.
    pub log_id: LogId,
    /// Identity of the master the new storage replicates.
    pub master_log_id: LogId,
    /// Duration of the restore in milliseconds.
    pub duration_ms: f64,
}

/// Writes a self-describing snapshot of `storage` to a new file at `path`.
///
/// Holds the modify lock for the whole copy after forcing a checkpoint, so
/// the snapshot matches the log position recorded in its header.
///
/// # Errors
///
/// Fails if `path` already exists, or with any error the copy raises.
pub fn backup(storage: &PageStorage, path: impl AsRef<Path>) -> Result<BackupReport> {
    let path = path.as_ref();
    let began = Instant::now();
    let page_size = storage.page_size();
    let header = storage.with_checkpointed(|log, pages| {
        let header = BackupHeader {
            start: log.next,
            master_log_id: log.log_id,
            backup_length: log.data_length,
            page_size: log.page_size,
        };
        let file = PageFile::create(path, page_size, 0, &header.encode())?;
        let mut scratch = storage.options().transfer_buffer();
        transfer(pages, &mut file.writer(0), header.backup_length, page_size, &mut scratch)?;
        file.sync()?;
        Ok(header)
    })?;
    info!(
        path = %path.display(),
        pages = header.backup_length,
        start = header.start,
        "admin.backup"
    );
    Ok(BackupReport {
        pages: header.backup_length,
        start: header.start,
        master_log_id: header.master_log_id,
        duration_ms: began.elapsed().as_secs_f64() * 1_000.0,
    })
}

/// Creates a replica data/log pair from the backup at `backup_path`.
///
/// The new log starts empty at the backup's log position and is marked as a
/// slave of the backed-up log; feed it with
/// [`PageStorage::apply_log_pages`] or promote it with
/// [`PageStorage::clear_slave`].
pub fn restore(
    backup_path: impl AsRef<Path>,
    data_path: impl AsRef<Path>,
    log_path: impl AsRef<Path>,
    options: &StorageOptions,
) -> Result<(PageStorage, RestoreReport)> {
    let began = Instant::now();
    let file = PageFile::open(backup_path, options.page_size as usize)?;
    let backup = BackupHeader::decode(&file.read_header()?)?;
    if backup.page_size != options.page_size {
        return Err(VellumError::Corruption("backup page size mismatch"));
    }
    let mut header = LogHeader::fresh(LogId::random(), options.page_size);
    header.start = backup.start;
    header.checkpoint = backup.start;
    header.next = backup.start;
    header.data_length = backup.backup_length;
    header.slave = true;
    header.master_log_id = backup.master_log_id;
    let log_id = header.log_id;

    let storage =
        PageStorage::create_with_header(data_path.as_ref(), log_path.as_ref(), header, options)?;
    storage.load_data(&mut file.reader(0), backup.backup_length)?;
    info!(
        pages = backup.backup_length,
        start = backup.start,
        master = %backup.master_log_id,
        "admin.restore"
    );
    let report = RestoreReport {
        pages: backup.backup_length,
        start: backup.start,
        log_id,
        master_log_id: backup.master_log_id,
        duration_ms: began.elapsed().as_secs_f64() * 1_000.0,
    };
    Ok((storage, report))
}
