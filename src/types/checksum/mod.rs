#![forbid(unsafe_code)]

use super::page::header::CRC32;

/// Incremental checksum used for header blocks and pages.
pub trait Checksum {
    /// Clears all bytes fed so far.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed since the last reset.
    fn finalize(&self) -> u32;
}

/// CRC32 (IEEE) backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// CRC32 of a whole page image, skipping the checksum field itself.
pub fn page_crc32(page: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&page[..CRC32.start]);
    hasher.update(&[0u8; 4]);
    hasher.update(&page[CRC32.end..]);
    hasher.finalize()
}
