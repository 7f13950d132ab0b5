use crate::primitives::pagefile::{transfer, PageFile};
use crate::types::{Result, VellumError};

/// Copies log pages `[dst.base(), end)` from `src` into `dst` and syncs `dst`.
///
/// `dst` must already carry its header block. Returns the number of pages
/// copied.
pub fn shrink_pages(src: &PageFile, dst: &PageFile, end: u64, scratch: &mut [u8]) -> Result<u64> {
    let from = dst.base();
    if from < src.base() || from > end {
        return Err(VellumError::wrong_page(from, src.base(), end));
    }
    let copied = transfer(
        &mut src.reader(from),
        &mut dst.writer(from),
        end - from,
        src.page_size(),
        scratch,
    )?;
    dst.sync()?;
    Ok(copied)
}
