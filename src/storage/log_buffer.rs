use std::path::PathBuf;

use crate::storage::data2log::Data2LogMap;
use crate::storage::PageStorage;
use crate::types::page::{self, PageType};
use crate::types::{PageId, Result, TrxId};

/// Write buffering for one modify transaction.
///
/// Pages are numbered from `base`, the log's `next` when the transaction
/// started. Slots `[buffer_start, next)` sit in the in-memory window; older
/// slots have already been written to the log past its committed end.
pub(crate) struct ModifyLogBuffer {
    trx_id: TrxId,
    base: u64,
    page_size: usize,
    window_pages: usize,
    window: Vec<u8>,
    buffer_start: u64,
    next: u64,
    map: Data2LogMap,
    scratch: Vec<u8>,
}

impl ModifyLogBuffer {
    pub(crate) fn new(
        base: u64,
        page_size: usize,
        window_pages: usize,
        map_memory_entries: usize,
        temp_dir: Option<PathBuf>,
    ) -> Self {
        let window_pages = window_pages.max(1);
        Self {
            trx_id: TrxId::random(),
            base,
            page_size,
            window_pages,
            window: vec![0u8; window_pages * page_size],
            buffer_start: 0,
            next: 0,
            map: Data2LogMap::new(map_memory_entries, temp_dir),
            scratch: vec![0u8; page_size],
        }
    }

    pub(crate) fn trx_id(&self) -> TrxId {
        self.trx_id
    }

    fn slot(&mut self, rel: u64) -> &mut [u8] {
        let at = (rel - self.buffer_start) as usize * self.page_size;
        &mut self.window[at..at + self.page_size]
    }

    /// Buffers a new version of data page `data_id`.
    ///
    /// A page already written by this transaction is overwritten where it
    /// currently lives, so the log ends up with a single entry per page.
    pub(crate) fn write_page(
        &mut self,
        storage: &PageStorage,
        data_id: PageId,
        image: &[u8],
    ) -> Result<()> {
        let trx_id = self.trx_id;
        if let Some(log_id) = self.map.get(data_id)? {
            let rel = log_id - self.base;
            if rel >= self.buffer_start {
                let slot = self.slot(rel);
                fill(slot, image, data_id, trx_id)?;
            } else {
                fill(&mut self.scratch, image, data_id, trx_id)?;
                storage.append_log(log_id, &self.scratch)?;
            }
            return Ok(());
        }
        if self.next - self.buffer_start == self.window_pages as u64 {
            self.flush(storage)?;
        }
        let rel = self.next;
        let slot = self.slot(rel);
        fill(slot, image, data_id, trx_id)?;
        self.map.insert(data_id, self.base + rel)?;
        self.next += 1;
        Ok(())
    }

    /// Copies this transaction's own version of `data_id` into `dst`.
    ///
    /// Returns false when the transaction has not written that page.
    pub(crate) fn read_page(
        &mut self,
        storage: &PageStorage,
        data_id: PageId,
        dst: &mut [u8],
    ) -> Result<bool> {
        let Some(log_id) = self.map.get(data_id)? else {
            return Ok(false);
        };
        let rel = log_id - self.base;
        if rel >= self.buffer_start {
            dst.copy_from_slice(self.slot(rel));
        } else {
            storage.read_uncommitted_log(log_id, dst)?;
        }
        Ok(true)
    }

    fn flush(&mut self, storage: &PageStorage) -> Result<()> {
        let pages = (self.next - self.buffer_start) as usize;
        if pages == 0 {
            return Ok(());
        }
        storage.append_log(
            self.base + self.buffer_start,
            &self.window[..pages * self.page_size],
        )?;
        self.buffer_start = self.next;
        Ok(())
    }

    /// Retags the last page as STOP and writes everything to the log.
    ///
    /// Returns the number of log pages the transaction occupies; zero means
    /// nothing was written and the caller should treat it as a rollback.
    pub(crate) fn commit(&mut self, storage: &PageStorage) -> Result<u64> {
        let result = self.seal_and_flush(storage);
        self.map.close();
        result
    }

    fn seal_and_flush(&mut self, storage: &PageStorage) -> Result<u64> {
        if self.next == 0 {
            return Ok(0);
        }
        // The window is only flushed to make room for a new slot, so the
        // last slot is always still in it.
        let last = self.next - 1;
        let slot = self.slot(last);
        page::set_page_type(slot, PageType::Stop);
        page::seal(slot);
        self.flush(storage)?;
        Ok(self.next)
    }

    /// Discards the translation table and returns how many log pages the
    /// caller must cut from the log.
    pub(crate) fn rollback(&mut self) -> u64 {
        self.map.close();
        self.next
    }
}

fn fill(slot: &mut [u8], image: &[u8], data_id: PageId, trx_id: TrxId) -> Result<()> {
    slot.copy_from_slice(image);
    page::stamp(slot, data_id, trx_id, PageType::Intermediate)?;
    page::seal(slot);
    Ok(())
}
