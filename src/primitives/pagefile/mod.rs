#![forbid(unsafe_code)]

//! Fixed-size page files with a versioned header block.
//!
//! Every file the engine owns (data, log, backup) has the same shape: a
//! [`HEADER_BLOCK_LEN`]-byte header block followed by pages. Page `id` lives
//! at `HEADER_BLOCK_LEN + (id - base) * page_size`, where `base` is zero for
//! data and backup files and the log's `start` for log files.

use std::convert::TryInto;
use std::io::ErrorKind;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{Checksum, Crc32Fast, Result, VellumError};

/// Size of the header block at the start of every page file.
pub const HEADER_BLOCK_LEN: usize = 512;

const BLOCK_MAGIC: Range<usize> = 0..4;
const BLOCK_VERSION: Range<usize> = 4..6;
const BLOCK_CRC32: Range<usize> = HEADER_BLOCK_LEN - 4..HEADER_BLOCK_LEN;

/// First byte available to typed header fields.
pub const BLOCK_FIELDS_START: usize = 8;

/// Raw header block contents.
pub type HeaderBlock = [u8; HEADER_BLOCK_LEN];

/// Stamps magic, version and checksum onto a header block whose typed
/// fields have already been written.
pub fn seal_block(block: &mut HeaderBlock, magic: [u8; 4], version: u16) {
    block[BLOCK_MAGIC].copy_from_slice(&magic);
    block[BLOCK_VERSION].copy_from_slice(&version.to_be_bytes());
    block[6..BLOCK_FIELDS_START].fill(0);
    block[BLOCK_CRC32].fill(0);
    let crc = block_crc32(block);
    block[BLOCK_CRC32].copy_from_slice(&crc.to_be_bytes());
}

/// Validates magic, version and checksum of a header block.
pub fn check_block(block: &HeaderBlock, magic: [u8; 4], version: u16) -> Result<()> {
    if block[BLOCK_MAGIC] != magic {
        return Err(VellumError::Corruption("header magic mismatch"));
    }
    let stored_version = u16::from_be_bytes(block[BLOCK_VERSION].try_into().unwrap());
    if stored_version != version {
        return Err(VellumError::Corruption("header format version mismatch"));
    }
    let stored_crc = u32::from_be_bytes(block[BLOCK_CRC32].try_into().unwrap());
    let mut scratch = *block;
    scratch[BLOCK_CRC32].fill(0);
    if block_crc32(&scratch) != stored_crc {
        return Err(VellumError::Corruption("header crc mismatch"));
    }
    Ok(())
}

fn block_crc32(block: &HeaderBlock) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(block);
    hasher.finalize()
}

pub(crate) fn get_u64(block: &HeaderBlock, range: Range<usize>) -> u64 {
    u64::from_be_bytes(block[range].try_into().unwrap())
}

pub(crate) fn get_u128(block: &HeaderBlock, range: Range<usize>) -> u128 {
    u128::from_be_bytes(block[range].try_into().unwrap())
}

pub(crate) fn get_u32(block: &HeaderBlock, range: Range<usize>) -> u32 {
    u32::from_be_bytes(block[range].try_into().unwrap())
}

/// A stream that produces whole pages.
pub trait PageSource {
    /// Fills `dst` with the next `dst.len() / page_size` pages of the stream.
    fn read_pages(&mut self, dst: &mut [u8]) -> Result<()>;
}

/// A stream that consumes whole pages.
pub trait PageDestination {
    /// Appends every page in `src` to the stream.
    fn write_pages(&mut self, src: &[u8]) -> Result<()>;
}

/// Copies `count` pages from `src` to `dst` through `scratch`.
///
/// `scratch` bounds memory use: pages move in chunks of
/// `scratch.len() / page_size`. Backup, restore, shrink and log shipping all
/// go through here.
pub fn transfer<S, D>(
    src: &mut S,
    dst: &mut D,
    count: u64,
    page_size: usize,
    scratch: &mut [u8],
) -> Result<u64>
where
    S: PageSource + ?Sized,
    D: PageDestination + ?Sized,
{
    let chunk_pages = (scratch.len() / page_size) as u64;
    if chunk_pages == 0 {
        return Err(VellumError::Invalid("transfer buffer smaller than one page"));
    }
    let mut remaining = count;
    while remaining > 0 {
        let pages = remaining.min(chunk_pages);
        let bytes = pages as usize * page_size;
        src.read_pages(&mut scratch[..bytes])?;
        dst.write_pages(&scratch[..bytes])?;
        remaining -= pages;
    }
    Ok(count)
}

/// Raw page-addressed file.
#[derive(Clone)]
pub struct PageFile {
    io: Arc<dyn FileIo>,
    path: PathBuf,
    page_size: usize,
    base: u64,
}

impl PageFile {
    /// Creates a new file at `path` and durably writes its header block.
    pub fn create(
        path: impl AsRef<Path>,
        page_size: usize,
        base: u64,
        header: &HeaderBlock,
    ) -> Result<Self> {
        let path = path.as_ref();
        let io = StdFileIo::create_new(path)?;
        let file = Self::with_io(Arc::new(io), path, page_size, base);
        file.write_header(header)?;
        Ok(file)
    }

    /// Opens an existing file read-write. The base starts at zero; log
    /// files set it once the header has been decoded.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let io = StdFileIo::open(path)?;
        Ok(Self::with_io(Arc::new(io), path, page_size, 0))
    }

    /// Opens another read-only handle onto the same file.
    pub fn open_read_only(&self) -> Result<Self> {
        let io = StdFileIo::open_read_only(&self.path)?;
        Ok(Self::with_io(Arc::new(io), &self.path, self.page_size, self.base))
    }

    /// Wraps an existing I/O handle.
    pub fn with_io(io: Arc<dyn FileIo>, path: &Path, page_size: usize, base: u64) -> Self {
        Self {
            io,
            path: path.to_path_buf(),
            page_size,
            base,
        }
    }

    /// Path the file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// First page id stored in this file.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Changes the first page id stored in this file.
    pub fn set_base(&mut self, base: u64) {
        self.base = base;
    }

    /// Reads the header block.
    pub fn read_header(&self) -> Result<HeaderBlock> {
        let mut block = [0u8; HEADER_BLOCK_LEN];
        match self.io.read_at(0, &mut block) {
            Ok(()) => Ok(block),
            Err(VellumError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                Err(VellumError::Corruption("header block truncated"))
            }
            Err(err) => Err(err),
        }
    }

    /// Writes the header block and syncs the file.
    pub fn write_header(&self, block: &HeaderBlock) -> Result<()> {
        self.io.write_at(0, block)?;
        self.io.sync_all()
    }

    fn offset(&self, id: u64) -> Result<u64> {
        if id < self.base {
            return Err(VellumError::wrong_page(id, self.base, u64::MAX));
        }
        (id - self.base)
            .checked_mul(self.page_size as u64)
            .and_then(|rel| rel.checked_add(HEADER_BLOCK_LEN as u64))
            .ok_or(VellumError::Invalid("page offset overflow"))
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len % self.page_size != 0 {
            return Err(VellumError::Invalid("buffer is not a whole number of pages"));
        }
        Ok(())
    }

    /// Reads `dst.len() / page_size` consecutive pages starting at `id`.
    pub fn read_pages(&self, id: u64, dst: &mut [u8]) -> Result<()> {
        self.check_len(dst.len())?;
        self.io.read_at(self.offset(id)?, dst)
    }

    /// Writes `src.len() / page_size` consecutive pages starting at `id`.
    pub fn write_pages(&self, id: u64, src: &[u8]) -> Result<()> {
        self.check_len(src.len())?;
        self.io.write_at(self.offset(id)?, src)
    }

    /// One past the last page id physically present in the file.
    pub fn end_page(&self) -> Result<u64> {
        let len = self.io.len()?;
        let body = len.saturating_sub(HEADER_BLOCK_LEN as u64);
        Ok(self.base + body / self.page_size as u64)
    }

    /// Shrinks the file so that `id` is the first page no longer present.
    pub fn truncate(&self, id: u64) -> Result<()> {
        self.io.truncate(self.offset(id)?)
    }

    /// Syncs page data and the header block to disk.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    /// Sequential page reader starting at `from`.
    pub fn reader(&self, from: u64) -> PageFileReader<'_> {
        PageFileReader {
            file: self,
            next: from,
        }
    }

    /// Sequential page writer starting at `from`.
    pub fn writer(&self, from: u64) -> PageFileWriter<'_> {
        PageFileWriter {
            file: self,
            next: from,
        }
    }
}

/// [`PageSource`] over consecutive pages of a [`PageFile`].
pub struct PageFileReader<'a> {
    file: &'a PageFile,
    next: u64,
}

impl PageSource for PageFileReader<'_> {
    fn read_pages(&mut self, dst: &mut [u8]) -> Result<()> {
        self.file.read_pages(self.next, dst)?;
        self.next += (dst.len() / self.file.page_size) as u64;
        Ok(())
    }
}

/// [`PageDestination`] writing consecutive pages of a [`PageFile`].
pub struct PageFileWriter<'a> {
    file: &'a PageFile,
    next: u64,
}

impl PageDestination for PageFileWriter<'_> {
    fn write_pages(&mut self, src: &[u8]) -> Result<()> {
        self.file.write_pages(self.next, src)?;
        self.next += (src.len() / self.file.page_size) as u64;
        Ok(())
    }
}

/// [`PageSource`] over an in-memory run of pages.
pub struct SliceSource<'a> {
    pages: &'a [u8],
}

impl<'a> SliceSource<'a> {
    /// Wraps a buffer holding whole pages.
    pub fn new(pages: &'a [u8]) -> Self {
        Self { pages }
    }
}

impl PageSource for SliceSource<'_> {
    fn read_pages(&mut self, dst: &mut [u8]) -> Result<()> {
        if dst.len() > self.pages.len() {
            return Err(VellumError::Invalid("page source exhausted"));
        }
        let (head, tail) = self.pages.split_at(dst.len());
        dst.copy_from_slice(head);
        self.pages = tail;
        Ok(())
    }
}

impl PageDestination for Vec<u8> {
    fn write_pages(&mut self, src: &[u8]) -> Result<()> {
        self.extend_from_slice(src);
        Ok(())
    }
}
