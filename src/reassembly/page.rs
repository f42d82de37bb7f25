//! Reusable out-of-order segment buffers.
//!
//! A [`Page`] holds the bytes of one buffered segment together with its
//! starting sequence number and capture metadata. Pages are handed out by a
//! shared [`PageCache`] and go back to its free list once delivered or
//! discarded, so steady-state reassembly does not allocate per segment.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use super::sequence::Sequence;
use crate::capture::CaptureInfo;

/// Default number of recycled buffers kept on the free list.
pub const DEFAULT_FREE_LIST_CAPACITY: usize = 1024;

/// Buffers larger than this are dropped instead of recycled.
const MAX_RECYCLED_CAPACITY: usize = 64 * 1024;

/// One buffered segment.
#[derive(Debug)]
pub struct Page {
    pub seq: Sequence,
    pub bytes: Vec<u8>,
    pub capture: CaptureInfo,
    /// Stream ends after these bytes (FIN).
    pub end: bool,
}

impl Page {
    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Sequence number one past the last byte.
    pub fn end_seq(&self) -> Sequence {
        self.seq.add(self.bytes.len())
    }
}

/// Snapshot of page cache activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageCacheStats {
    pub allocated: u64,
    pub reused: u64,
    pub released: u64,
    pub free: usize,
}

/// Arena of page buffers shared by every stream.
pub struct PageCache {
    free: Mutex<Vec<Vec<u8>>>,
    free_capacity: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
    released: AtomicU64,
}

impl PageCache {
    pub fn new(free_capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            free_capacity,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// Return an empty page able to hold at least `size` bytes, preferring a
    /// recycled buffer.
    pub fn acquire(&self, size: usize) -> Page {
        let recycled = {
            let mut free = self.free.lock();
            match free.iter().rposition(|b| b.capacity() >= size) {
                Some(idx) => Some(free.swap_remove(idx)),
                None => free.pop(),
            }
        };
        let bytes = match recycled {
            Some(mut buf) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf.reserve(size);
                buf
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(size)
            }
        };
        Page {
            seq: Sequence::default(),
            bytes,
            capture: CaptureInfo::default(),
            end: false,
        }
    }

    /// Acquire a page and fill it with a copy of `data`.
    pub fn acquire_with(&self, seq: Sequence, data: &[u8], capture: CaptureInfo) -> Page {
        let mut page = self.acquire(data.len());
        page.seq = seq;
        page.bytes.extend_from_slice(data);
        page.capture = capture;
        page
    }

    /// Give a page back. Its length is reset; the contents are not wiped.
    pub fn release(&self, page: Page) {
        self.released.fetch_add(1, Ordering::Relaxed);
        let mut buf = page.bytes;
        if buf.capacity() > MAX_RECYCLED_CAPACITY {
            return;
        }
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.free_capacity {
            free.push(buf);
        }
    }

    pub fn stats(&self) -> PageCacheStats {
        PageCacheStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            free: self.free.lock().len(),
        }
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new(DEFAULT_FREE_LIST_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_then_acquire_reuses_buffer() {
        let cache = PageCache::new(4);
        let page = cache.acquire_with(Sequence(10), b"hello", CaptureInfo::default());
        assert_eq!(page.end_seq(), Sequence(15));
        cache.release(page);

        let page = cache.acquire(3);
        assert!(page.bytes.is_empty(), "recycled page must come back empty");
        assert!(page.bytes.capacity() >= 5);

        let stats = cache.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.released, 1);
    }

    #[test]
    fn test_free_list_is_bounded() {
        let cache = PageCache::new(2);
        let pages: Vec<_> = (0..5).map(|_| cache.acquire(8)).collect();
        for p in pages {
            cache.release(p);
        }
        assert_eq!(cache.stats().free, 2);
    }
}
