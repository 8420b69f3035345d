//! Cached block items shared between the FAT engine's LRU caches.

use alloc::vec::Vec;

use spin::Mutex;

/// One cached block (a data cluster or a FAT-table sector) with its dirty
/// byte range `[lo, hi)`.
pub struct BlockCacheItem {
    inner: Mutex<Inner>,
}

struct Inner {
    bytes: Vec<u8>,
    dirty: Option<(usize, usize)>,
}

impl BlockCacheItem {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            inner: Mutex::new(Inner { bytes, dirty: None }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().bytes.len()
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) {
        let inner = self.inner.lock();
        out.copy_from_slice(&inner.bytes[offset..offset + out.len()]);
    }

    /// Write `data` at `offset`, extending the dirty range to cover it.
    pub fn write(&self, offset: usize, data: &[u8]) {
        let mut inner = self.inner.lock();
        inner.bytes[offset..offset + data.len()].copy_from_slice(data);
        let span = (offset, offset + data.len());
        inner.dirty = Some(match inner.dirty {
            Some((lo, hi)) => (lo.min(span.0), hi.max(span.1)),
            None => span,
        });
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty.is_some()
    }

    pub fn dirty_range(&self) -> Option<(usize, usize)> {
        self.inner.lock().dirty
    }

    /// Clear the dirty range, returning it.
    pub fn take_dirty(&self) -> Option<(usize, usize)> {
        self.inner.lock().dirty.take()
    }

    /// Run `f` over the current content.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner.lock().bytes)
    }

    /// Clone the full content (for write-back).
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().bytes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_range_unions() {
        let item = BlockCacheItem::from_bytes(alloc::vec![0u8; 64]);
        assert!(!item.is_dirty());
        item.write(10, &[1, 2, 3]);
        assert_eq!(item.dirty_range(), Some((10, 13)));
        item.write(40, &[4]);
        assert_eq!(item.dirty_range(), Some((10, 41)));
        item.write(0, &[9]);
        assert_eq!(item.dirty_range(), Some((0, 41)));

        assert_eq!(item.take_dirty(), Some((0, 41)));
        assert!(!item.is_dirty());

        let mut out = [0u8; 3];
        item.read(10, &mut out);
        assert_eq!(out, [1, 2, 3]);
    }
}
