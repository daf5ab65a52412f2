use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::Result;
use crate::vfs::RandomReadFile;

/// Bounded cache of open read handles, keyed by vlog file number.
///
/// Admission evicts the least-recently-used entry. Handles are shared as
/// `Arc`s, so eviction or explicit removal never invalidates a handle a
/// reader is still holding; the file closes when the last clone drops.
pub(crate) struct VLogFileCache {
    inner: Mutex<LruCache<u64, Arc<dyn RandomReadFile>>>,
}

impl VLogFileCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the shared handle for `number`, opening it with `open` on a
    /// miss. The open happens outside the lock; a racing opener's handle
    /// wins so concurrent readers of one file share a single descriptor.
    pub(crate) fn get(
        &self,
        number: u64,
        open: impl FnOnce() -> Result<Arc<dyn RandomReadFile>>,
    ) -> Result<Arc<dyn RandomReadFile>> {
        if let Some(handle) = self.inner.lock().get(&number) {
            return Ok(handle.clone());
        }

        let opened = open()?;
        let mut cache = self.inner.lock();
        if let Some(existing) = cache.get(&number) {
            return Ok(existing.clone());
        }
        cache.put(number, opened.clone());
        Ok(opened)
    }

    /// Drops the cached handle for a deleted file.
    pub(crate) fn evict(&self, number: u64) {
        self.inner.lock().pop(&number);
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, number: u64) -> bool {
        self.inner.lock().contains(&number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeFile;
    impl RandomReadFile for FakeFile {
        fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_hit_shares_one_open() {
        let cache = VLogFileCache::new(4);
        let opens = AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .get(7, || {
                    opens.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(FakeFile))
                })
                .unwrap();
        }
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lru_eviction_and_explicit_evict() {
        let cache = VLogFileCache::new(2);
        for number in 1..=3u64 {
            cache.get(number, || Ok(Arc::new(FakeFile))).unwrap();
        }
        // Capacity 2: the least recently used entry (1) is gone.
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
        assert!(cache.contains(3));

        cache.evict(3);
        assert!(!cache.contains(3));
    }

    #[test]
    fn test_evicted_handle_stays_usable() {
        let cache = VLogFileCache::new(1);
        let held = cache.get(1, || Ok(Arc::new(FakeFile))).unwrap();
        cache.get(2, || Ok(Arc::new(FakeFile))).unwrap();
        assert!(!cache.contains(1));
        let mut buf = [0u8; 1];
        assert!(held.read_at(0, &mut buf).is_ok());
    }
}
