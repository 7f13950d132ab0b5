use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::types::{PageId, Result, VellumError};

/// Committed pages waiting for the next checkpoint.
///
/// Holds at most `capacity` distinct data pages; a second version of a page
/// replaces the first in place.
pub(crate) struct ModifyBuffer {
    capacity: usize,
    index: FxHashMap<PageId, usize>,
    slots: Vec<(PageId, Arc<[u8]>)>,
}

impl ModifyBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            index: FxHashMap::default(),
            slots: Vec::new(),
        }
    }

    pub(crate) fn get(&self, id: PageId) -> Option<Arc<[u8]>> {
        self.index.get(&id).map(|&slot| Arc::clone(&self.slots[slot].1))
    }

    pub(crate) fn put(&mut self, id: PageId, page: &[u8]) -> Result<()> {
        if let Some(&slot) = self.index.get(&id) {
            self.slots[slot].1 = Arc::from(page);
            return Ok(());
        }
        if self.slots.len() >= self.capacity {
            return Err(VellumError::Invalid("modify buffer full"));
        }
        self.index.insert(id, self.slots.len());
        self.slots.push((id, Arc::from(page)));
        Ok(())
    }

    pub(crate) fn remaining(&self) -> usize {
        self.capacity - self.slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Buffered pages ordered by page id.
    pub(crate) fn sorted(&self) -> Vec<(PageId, Arc<[u8]>)> {
        let mut pages = self.slots.clone();
        pages.sort_unstable_by_key(|(id, _)| *id);
        pages
    }

    pub(crate) fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
    }
}
