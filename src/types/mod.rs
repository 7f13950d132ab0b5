//! Shared identifiers, the crate-wide error type and on-disk page metadata.

use std::fmt;

use serde::Serialize;

mod checksum;
pub mod page;

pub use checksum::{page_crc32, Checksum, Crc32Fast};

/// Highest page id representable in the 63-bit page address space.
pub const MAX_PAGE_ID: u64 = (1 << 63) - 1;

/// Identifier of a page in the data file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct PageId(pub u64);

/// 128-bit identity binding a log file to its data file.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct LogId(pub u128);

/// Identifier stamped on every page written by one modify transaction.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct TrxId(pub u128);

impl LogId {
    /// Identity used for "no master" in replica bookkeeping.
    pub const NONE: LogId = LogId(0);

    /// Generates a fresh random identity.
    pub fn random() -> Self {
        LogId(random_u128())
    }

    /// Returns true when this is the empty identity.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl TrxId {
    /// Generates a fresh random transaction id. Never returns zero.
    pub fn random() -> Self {
        loop {
            let id = random_u128();
            if id != 0 {
                return TrxId(id);
            }
        }
    }
}

fn random_u128() -> u128 {
    use rand::{rngs::OsRng, RngCore};
    let mut rng = OsRng;
    (u128::from(rng.next_u64()) << 64) | u128::from(rng.next_u64())
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Display for TrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl From<u64> for PageId {
    fn from(value: u64) -> Self {
        PageId(value)
    }
}

impl From<PageId> for u64 {
    fn from(value: PageId) -> Self {
        value.0
    }
}

/// Errors raised by the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum VellumError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk bytes failed a magic, version, identity or checksum check.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The caller passed an argument the engine cannot act on.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A page id fell outside the range the request is allowed to touch.
    #[error("wrong page id {page}: valid range is [{start}, {end})")]
    WrongPageId {
        /// Requested page id.
        page: u64,
        /// First valid id.
        start: u64,
        /// One past the last valid id.
        end: u64,
    },
    /// A log run did not form a complete INTERMEDIATE..STOP transaction.
    #[error("transaction corrupted at log page {0}")]
    TrxCorrupted(u64),
    /// A lock could not be acquired within the configured timeout.
    #[error("lock timeout: {0}")]
    LockTimeout(&'static str),
    /// The engine has been shut down, cleanly or after a fatal fault.
    #[error("storage closed")]
    Closed,
}

impl VellumError {
    /// Returns true when the fault leaves on-disk state suspect and must
    /// bring the whole engine down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VellumError::Io(_) | VellumError::Corruption(_))
    }

    pub(crate) fn wrong_page(page: u64, start: u64, end: u64) -> Self {
        VellumError::WrongPageId { page, start, end }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VellumError>;
