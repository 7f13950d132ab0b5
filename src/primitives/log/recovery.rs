//! Transaction boundary detection over log pages.

use crate::primitives::pagefile::{PageFile, PageSource};
use crate::types::page::{self, PageType};
use crate::types::{Result, TrxId, VellumError};

/// Reads complete transaction runs from a log file.
///
/// A run is a maximal sequence of pages carrying one transaction id where
/// every page but the last is [`PageType::Intermediate`] and the last one is
/// [`PageType::Stop`].
pub struct TrxReader<'a> {
    file: &'a PageFile,
    next: u64,
    page: Vec<u8>,
}

impl<'a> TrxReader<'a> {
    /// Starts reading at log page `from`.
    pub fn new(file: &'a PageFile, from: u64) -> Self {
        Self {
            file,
            next: from,
            page: vec![0u8; file.page_size()],
        }
    }

    /// Log page id of the first page of the next run.
    pub fn position(&self) -> u64 {
        self.next
    }

    /// Reads one run of at most `remaining` pages and returns its length.
    ///
    /// Returns 0 when `remaining` is zero or the next page is blank. Fails
    /// with [`VellumError::TrxCorrupted`] carrying the run's first page when
    /// a page fails its checksum, the transaction id changes mid-run, or no
    /// STOP page appears within `remaining` pages. The position only moves
    /// past runs that were read completely.
    pub fn read_trx(&mut self, remaining: u64) -> Result<u64> {
        let first = self.next;
        let mut trx: Option<TrxId> = None;
        let mut len = 0u64;
        while len < remaining {
            let id = first + len;
            self.file.read_pages(id, &mut self.page)?;
            if len == 0 && self.page.iter().all(|&b| b == 0) {
                return Ok(0);
            }
            let header = page::verify(&self.page).map_err(|_| VellumError::TrxCorrupted(first))?;
            match trx {
                None => trx = Some(header.trx_id),
                Some(current) if current != header.trx_id => {
                    return Err(VellumError::TrxCorrupted(first))
                }
                Some(_) => {}
            }
            len += 1;
            if header.page_type == PageType::Stop {
                self.next = first + len;
                return Ok(len);
            }
        }
        if len == 0 {
            return Ok(0);
        }
        Err(VellumError::TrxCorrupted(first))
    }
}

/// Page source wrapper that tracks `max(page id) + 1` over every page
/// passing through it.
pub struct DataLengthCalculator<S> {
    inner: S,
    page_size: usize,
    data_length: u64,
}

impl<S: PageSource> DataLengthCalculator<S> {
    /// Wraps `inner`, starting from the currently known `data_length`.
    pub fn new(inner: S, page_size: usize, data_length: u64) -> Self {
        Self {
            inner,
            page_size,
            data_length,
        }
    }

    /// Data length implied by the pages seen so far.
    pub fn data_length(&self) -> u64 {
        self.data_length
    }
}

impl<S: PageSource> PageSource for DataLengthCalculator<S> {
    fn read_pages(&mut self, dst: &mut [u8]) -> Result<()> {
        self.inner.read_pages(dst)?;
        for image in dst.chunks_exact(self.page_size) {
            let id = page::page_id_of(image).0;
            self.data_length = self.data_length.max(id + 1);
        }
        Ok(())
    }
}
