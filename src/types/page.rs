//! Shared on-disk page layout used by the data file and the log.
//!
//! Every page starts with a fixed header followed by the caller's payload:
//!
//! ```text
//! 0..8    page id (data page id, also on log pages)
//! 8..24   owning transaction id
//! 24      page type (INTERMEDIATE / STOP)
//! 25..28  reserved, zero
//! 28..32  crc32 over the whole page with this field zeroed
//! ```

use core::convert::{TryFrom, TryInto};

use super::{page_crc32, PageId, Result, TrxId, VellumError};

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;
/// Smallest page size the engine accepts.
pub const MIN_PAGE_SIZE: u32 = 128;
/// Length of the fixed page header.
pub const PAGE_HDR_LEN: usize = 32;

pub mod header {
    //! Byte offsets for fixed header fields.
    use core::ops::Range;

    pub const PAGE_ID: Range<usize> = 0..8;
    pub const TRX_ID: Range<usize> = 8..24;
    pub const PAGE_TYPE: usize = 24;
    pub const RESERVED: Range<usize> = 25..28;
    pub const CRC32: Range<usize> = 28..32;
}

/// Position of a page within its transaction's log run.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum PageType {
    /// Any page of a transaction except the last one.
    #[default]
    Intermediate = 0,
    /// The last page of a transaction.
    Stop = 1,
}

impl PageType {
    /// Returns the on-disk tag byte.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PageType {
    type Error = VellumError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PageType::Intermediate),
            1 => Ok(PageType::Stop),
            _ => Err(VellumError::Corruption("unknown page type")),
        }
    }
}

/// Decoded page header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageHeader {
    /// Data page this image belongs to.
    pub page_id: PageId,
    /// Transaction that wrote the image.
    pub trx_id: TrxId,
    /// Position within the transaction's log run.
    pub page_type: PageType,
    /// Stored checksum.
    pub crc32: u32,
}

impl PageHeader {
    /// Builds a header with an unset checksum.
    pub fn new(page_id: PageId, trx_id: TrxId, page_type: PageType) -> Self {
        Self {
            page_id,
            trx_id,
            page_type,
            crc32: 0,
        }
    }

    /// Writes the header fields into the first [`PAGE_HDR_LEN`] bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < PAGE_HDR_LEN {
            return Err(VellumError::Invalid("page header buffer too small"));
        }
        dst[header::PAGE_ID].copy_from_slice(&self.page_id.0.to_be_bytes());
        dst[header::TRX_ID].copy_from_slice(&self.trx_id.0.to_be_bytes());
        dst[header::PAGE_TYPE] = self.page_type.as_u8();
        dst[header::RESERVED].fill(0);
        dst[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
        Ok(())
    }

    /// Parses the header fields without verifying the checksum.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < PAGE_HDR_LEN {
            return Err(VellumError::Corruption("page header truncated"));
        }
        if src[header::RESERVED] != [0, 0, 0] {
            return Err(VellumError::Corruption("page header reserved bytes not zero"));
        }
        let page_id = PageId(u64::from_be_bytes(src[header::PAGE_ID].try_into().unwrap()));
        let trx_id = TrxId(u128::from_be_bytes(src[header::TRX_ID].try_into().unwrap()));
        let page_type = PageType::try_from(src[header::PAGE_TYPE])?;
        let crc32 = u32::from_be_bytes(src[header::CRC32].try_into().unwrap());
        Ok(Self {
            page_id,
            trx_id,
            page_type,
            crc32,
        })
    }
}

/// Returns the data page id stored in a page image.
pub fn page_id_of(page: &[u8]) -> PageId {
    PageId(u64::from_be_bytes(page[header::PAGE_ID].try_into().unwrap()))
}

/// Overwrites the identity fields of a page image, leaving the payload alone.
pub fn stamp(page: &mut [u8], page_id: PageId, trx_id: TrxId, page_type: PageType) -> Result<()> {
    PageHeader::new(page_id, trx_id, page_type).encode(page)
}

/// Retags a page image without touching any other field.
pub fn set_page_type(page: &mut [u8], page_type: PageType) {
    page[header::PAGE_TYPE] = page_type.as_u8();
}

/// Computes and stores the page checksum.
pub fn seal(page: &mut [u8]) {
    let crc = page_crc32(page);
    page[header::CRC32].copy_from_slice(&crc.to_be_bytes());
}

/// Verifies the checksum and returns the decoded header.
pub fn verify(page: &[u8]) -> Result<PageHeader> {
    let header = PageHeader::decode(page)?;
    if page_crc32(page) != header.crc32 {
        return Err(VellumError::Corruption("page checksum mismatch"));
    }
    Ok(header)
}

/// Validates a configured page size.
pub fn check_page_size(page_size: u32) -> Result<()> {
    if page_size < MIN_PAGE_SIZE {
        return Err(VellumError::Invalid("page size below minimum"));
    }
    Ok(())
}
