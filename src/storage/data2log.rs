use std::io::ErrorKind;
use std::path::PathBuf;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{PageId, Result, VellumError};

const SLOT_LEN: u64 = 8;

/// Data page id to log page id translation for one modify transaction.
///
/// Entries live in a hash map until `memory_limit` of them exist; after that
/// the table moves to an anonymous temporary file with one 8-byte slot per
/// data page id, addressed by `data_id * 8`. A slot stores `log_id + 1` so
/// that a zero (hole) reads back as absent.
pub(crate) struct Data2LogMap {
    memory: FxHashMap<PageId, u64>,
    memory_limit: usize,
    spill: Option<StdFileIo>,
    temp_dir: Option<PathBuf>,
    len: usize,
}

impl Data2LogMap {
    pub(crate) fn new(memory_limit: usize, temp_dir: Option<PathBuf>) -> Self {
        Self {
            memory: FxHashMap::default(),
            memory_limit,
            spill: None,
            temp_dir,
            len: 0,
        }
    }

    /// Number of translations recorded.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    pub(crate) fn get(&self, data_id: PageId) -> Result<Option<u64>> {
        let Some(spill) = &self.spill else {
            return Ok(self.memory.get(&data_id).copied());
        };
        let mut slot = [0u8; SLOT_LEN as usize];
        match spill.read_at(slot_offset(data_id)?, &mut slot) {
            Ok(()) => {}
            Err(VellumError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        }
        Ok(u64::from_be_bytes(slot).checked_sub(1))
    }

    /// Records a translation for a data id that has none yet.
    pub(crate) fn insert(&mut self, data_id: PageId, log_id: u64) -> Result<()> {
        if self.spill.is_none() && self.memory.len() >= self.memory_limit {
            self.spill_to_disk()?;
        }
        match &self.spill {
            Some(spill) => spill.write_at(slot_offset(data_id)?, &(log_id + 1).to_be_bytes())?,
            None => {
                self.memory.insert(data_id, log_id);
            }
        }
        self.len += 1;
        Ok(())
    }

    fn spill_to_disk(&mut self) -> Result<()> {
        let file = match &self.temp_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        let spill = StdFileIo::new(file);
        for (data_id, log_id) in self.memory.drain() {
            spill.write_at(slot_offset(data_id)?, &(log_id + 1).to_be_bytes())?;
        }
        debug!(entries = self.len, "data2log.spill");
        self.spill = Some(spill);
        Ok(())
    }

    /// Drops every translation and any spill file.
    pub(crate) fn close(&mut self) {
        self.memory = FxHashMap::default();
        self.spill = None;
        self.len = 0;
    }
}

fn slot_offset(data_id: PageId) -> Result<u64> {
    data_id
        .0
        .checked_mul(SLOT_LEN)
        .ok_or(VellumError::Invalid("data page id too large for translation table"))
}
