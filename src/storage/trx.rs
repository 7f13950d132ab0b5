//! Page cursors handed out by [`PageStorage`].
//!
//! Callers see page payloads only; the page header is owned by the engine.

use tracing::debug;

use crate::storage::log_buffer::ModifyLogBuffer;
use crate::storage::PageStorage;
use crate::types::page::PAGE_HDR_LEN;
use crate::types::{PageId, Result, VellumError, MAX_PAGE_ID};

/// Common contract of read and modify transactions.
pub trait Transaction {
    /// Returns the payload of page `id`.
    fn get_page(&mut self, id: PageId) -> Result<&[u8]>;

    /// Returns the payload of page `id` for writing.
    ///
    /// Asking for the page at [`Transaction::data_length`] appends a new
    /// zeroed page.
    fn get_page_for_modify(&mut self, id: PageId) -> Result<&mut [u8]>;

    /// Number of pages visible to this transaction.
    fn data_length(&self) -> u64;

    /// Ends the transaction, making modifications durable.
    fn commit(self) -> Result<()>
    where
        Self: Sized;

    /// Ends the transaction, discarding modifications.
    fn rollback(self)
    where
        Self: Sized;
}

/// Shared-lock transaction with a one-page cache.
///
/// Each page is read at the moment it is first requested; there is no
/// snapshot across pages.
pub struct ReadTransaction<'s> {
    storage: &'s PageStorage,
    page: Vec<u8>,
    current: Option<PageId>,
    finished: bool,
}

impl<'s> ReadTransaction<'s> {
    pub(crate) fn new(storage: &'s PageStorage) -> Self {
        Self {
            page: vec![0u8; storage.page_size()],
            storage,
            current: None,
            finished: false,
        }
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.storage.rollback_read();
        }
    }
}

impl Transaction for ReadTransaction<'_> {
    fn get_page(&mut self, id: PageId) -> Result<&[u8]> {
        if self.current != Some(id) {
            self.current = None;
            self.storage.read_page(id, &mut self.page)?;
            self.current = Some(id);
        }
        Ok(&self.page[PAGE_HDR_LEN..])
    }

    fn get_page_for_modify(&mut self, _id: PageId) -> Result<&mut [u8]> {
        Err(VellumError::Invalid("read transaction cannot modify pages"))
    }

    fn data_length(&self) -> u64 {
        self.storage.data_length()
    }

    fn commit(mut self) -> Result<()> {
        self.finish();
        Ok(())
    }

    fn rollback(mut self) {
        self.finish();
    }
}

impl Drop for ReadTransaction<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Exclusive transaction that buffers writes until commit.
///
/// Holds one page in a scratch buffer; moving to another page writes the
/// scratch page to the transaction's log buffer first if it was modified.
/// Dropping an uncommitted transaction rolls it back.
pub struct ModifyTransaction<'s> {
    storage: &'s PageStorage,
    buffer: ModifyLogBuffer,
    page: Vec<u8>,
    current: Option<PageId>,
    dirty: bool,
    data_length: u64,
    finished: bool,
}

impl<'s> ModifyTransaction<'s> {
    pub(crate) fn new(storage: &'s PageStorage, buffer: ModifyLogBuffer, data_length: u64) -> Self {
        Self {
            page: vec![0u8; storage.page_size()],
            storage,
            buffer,
            current: None,
            dirty: false,
            data_length,
            finished: false,
        }
    }

    fn flush_current(&mut self) -> Result<()> {
        if let (true, Some(id)) = (self.dirty, self.current) {
            self.buffer.write_page(self.storage, id, &self.page)?;
            self.dirty = false;
        }
        Ok(())
    }

    fn load(&mut self, id: PageId) -> Result<()> {
        if self.current == Some(id) {
            return Ok(());
        }
        if id.0 > self.data_length || id.0 > MAX_PAGE_ID {
            return Err(VellumError::wrong_page(id.0, 0, self.data_length + 1));
        }
        self.flush_current()?;
        self.current = None;
        if id.0 == self.data_length {
            self.page.fill(0);
            self.data_length += 1;
            // A page that is never written would leave a hole below data_length.
            self.dirty = true;
        } else if !self.buffer.read_page(self.storage, id, &mut self.page)? {
            self.storage.read_page(id, &mut self.page)?;
        }
        self.current = Some(id);
        Ok(())
    }

    fn finish_rollback(&mut self) {
        if !self.finished {
            self.finished = true;
            let written = self.buffer.rollback();
            self.storage.rollback_modify(written);
        }
    }
}

impl Transaction for ModifyTransaction<'_> {
    fn get_page(&mut self, id: PageId) -> Result<&[u8]> {
        self.load(id)?;
        Ok(&self.page[PAGE_HDR_LEN..])
    }

    fn get_page_for_modify(&mut self, id: PageId) -> Result<&mut [u8]> {
        self.load(id)?;
        self.dirty = true;
        Ok(&mut self.page[PAGE_HDR_LEN..])
    }

    fn data_length(&self) -> u64 {
        self.data_length
    }

    fn commit(mut self) -> Result<()> {
        let size = match self
            .flush_current()
            .and_then(|()| self.buffer.commit(self.storage))
        {
            Ok(size) => size,
            Err(err) => {
                self.finish_rollback();
                return Err(err);
            }
        };
        self.finished = true;
        if size == 0 {
            debug!(trx = %self.buffer.trx_id(), "storage.modify.empty_commit");
            self.storage.rollback_modify(0);
            return Ok(());
        }
        self.storage.commit_modify(size)
    }

    fn rollback(mut self) {
        self.finish_rollback();
    }
}

impl Drop for ModifyTransaction<'_> {
    fn drop(&mut self) {
        self.finish_rollback();
    }
}
