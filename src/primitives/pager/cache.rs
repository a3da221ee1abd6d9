use std::fmt;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{
    lock_api::ArcRwLockReadGuard, Mutex, RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use rustc_hash::FxHashMap;

use super::frame::Frame;
use super::PageCodec;
use crate::primitives::io::PageStorage;
use crate::types::checksum::{seal_page, verify_page};
use crate::types::{PageId, Result, TreeError};

/// Snapshot of page cache counters.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Fixes served from a resident frame.
    pub hits: u64,
    /// Fixes that had to read and decode the page image.
    pub misses: u64,
    /// Unfixed frames dropped to stay within the configured capacity.
    pub evictions: u64,
    /// Page images written back to storage.
    pub writes: u64,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writes: AtomicU64,
}

struct CacheState<P> {
    frames: FxHashMap<PageId, Frame<P>>,
    lru: LruCache<PageId, ()>,
}

struct CacheInner<P> {
    storage: Arc<dyn PageStorage>,
    capacity: NonZeroUsize,
    verify_checksums: bool,
    state: Mutex<CacheState<P>>,
    active_fixes: AtomicUsize,
    counters: CacheCounters,
}

impl<P: PageCodec> CacheInner<P> {
    fn pin(&self, id: PageId) {
        let mut state = self.state.lock();
        let frame = state
            .frames
            .get_mut(&id)
            .unwrap_or_else(|| panic!("pinning page {id} that is not resident"));
        frame.pin_count += 1;
        self.active_fixes.fetch_add(1, Ordering::Relaxed);
    }

    fn unpin(&self, id: PageId) {
        let mut state = self.state.lock();
        let frame = state
            .frames
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unfixing page {id} that is not resident"));
        assert!(frame.pin_count > 0, "page {id} unfixed more often than fixed");
        frame.pin_count -= 1;
        self.active_fixes.fetch_sub(1, Ordering::Relaxed);
    }

    fn write_back(&self, frame: &Frame<P>) -> Result<()> {
        let mut buf = vec![0u8; self.storage.page_size()];
        let page = frame.page.read();
        let id = page.page_id();
        page.encode_page(&mut buf)?;
        drop(page);
        seal_page(id, &mut buf);
        self.storage.write_page(id, &buf)?;
        frame.dirty.store(false, Ordering::Release);
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn evict_if_needed(&self, state: &mut CacheState<P>) -> Result<()> {
        while state.frames.len() > self.capacity.get() {
            let victim = state
                .lru
                .iter()
                .rev()
                .map(|(id, _)| *id)
                .find(|id| state.frames.get(id).is_some_and(|f| f.pin_count == 0));
            let Some(id) = victim else {
                break;
            };
            if let Some(frame) = state.frames.get(&id) {
                // a failed write keeps the dirty frame resident
                if frame.dirty.load(Ordering::Acquire) {
                    self.write_back(frame)?;
                }
            }
            state.frames.remove(&id);
            state.lru.pop(&id);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(target: "mvtree::pager", page = id.0, "evicted frame");
        }
        Ok(())
    }
}

/// Cache of decoded pages of one type over a shared [`PageStorage`].
pub struct PageCache<P> {
    inner: Arc<CacheInner<P>>,
}

impl<P> Clone for PageCache<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: PageCodec> PageCache<P> {
    /// Creates a cache keeping at most `capacity` frames resident while unfixed.
    pub fn new(storage: Arc<dyn PageStorage>, capacity: usize, verify_checksums: bool) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(CacheInner {
                storage,
                capacity,
                verify_checksums,
                state: Mutex::new(CacheState {
                    frames: FxHashMap::default(),
                    lru: LruCache::unbounded(),
                }),
                active_fixes: AtomicUsize::new(0),
                counters: CacheCounters::default(),
            }),
        }
    }

    /// Storage the cache reads from and writes to.
    pub fn storage(&self) -> &Arc<dyn PageStorage> {
        &self.inner.storage
    }

    /// Page size of the underlying storage.
    pub fn page_size(&self) -> usize {
        self.inner.storage.page_size()
    }

    fn make_ref(&self, id: PageId, frame: &Frame<P>) -> PageRef<P> {
        PageRef {
            id,
            page: Arc::clone(&frame.page),
            dirty: Arc::clone(&frame.dirty),
            cache: Arc::clone(&self.inner),
        }
    }

    /// Fixes page `id`, reading it from storage if it is not resident.
    pub fn fix(&self, id: PageId) -> Result<PageRef<P>> {
        if id.is_null() {
            return Err(TreeError::Invalid("cannot fix the null page"));
        }
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if let Some(frame) = state.frames.get_mut(&id) {
            frame.pin_count += 1;
            inner.active_fixes.fetch_add(1, Ordering::Relaxed);
            inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            let page = self.make_ref(id, frame);
            state.lru.put(id, ());
            return Ok(page);
        }
        inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        let mut buf = vec![0u8; inner.storage.page_size()];
        inner.storage.read_page(id, &mut buf)?;
        if inner.verify_checksums {
            verify_page(id, &buf)?;
        }
        let decoded = P::decode_page(id, &buf)?;
        let mut frame = Frame::new(decoded, false);
        frame.pin_count = 1;
        inner.active_fixes.fetch_add(1, Ordering::Relaxed);
        let page = self.make_ref(id, &frame);
        state.frames.insert(id, frame);
        state.lru.put(id, ());
        inner.evict_if_needed(&mut state)?;
        Ok(page)
    }

    /// Allocates a page id and fixes a new page built by `build`.
    pub fn create_with(&self, build: impl FnOnce(PageId) -> P) -> Result<PageRef<P>> {
        let inner = &self.inner;
        let id = inner.storage.allocate()?;
        let mut frame = Frame::new(build(id), true);
        frame.pin_count = 1;
        inner.active_fixes.fetch_add(1, Ordering::Relaxed);
        let page = self.make_ref(id, &frame);
        let mut state = inner.state.lock();
        state.frames.insert(id, frame);
        state.lru.put(id, ());
        inner.evict_if_needed(&mut state)?;
        Ok(page)
    }

    /// Deletes the page behind `page`, consuming the caller's fix.
    ///
    /// Panics if any other fix on the page is outstanding.
    pub fn delete(&self, page: PageRef<P>) -> Result<()> {
        let id = page.id;
        drop(page);
        let mut state = self.inner.state.lock();
        if let Some(frame) = state.frames.get(&id) {
            assert_eq!(
                frame.pin_count, 0,
                "deleting page {id} while it is still fixed"
            );
        }
        state.frames.remove(&id);
        state.lru.pop(&id);
        drop(state);
        self.inner.storage.free(id)
    }

    /// Drops the cached frame of `id` without writing it back.
    pub fn clear(&self, id: PageId) {
        let mut state = self.inner.state.lock();
        if let Some(frame) = state.frames.get(&id) {
            assert_eq!(frame.pin_count, 0, "clearing page {id} while it is fixed");
        }
        state.frames.remove(&id);
        state.lru.pop(&id);
    }

    /// Reserves `id` in storage so that it is never allocated.
    pub fn reserve_page_id(&self, id: PageId) -> Result<()> {
        self.inner.storage.reserve(id)
    }

    /// Takes a shared latch on `page`; the latch and its fix are released together.
    pub fn read_latch(&self, page: &PageRef<P>) -> ReadLatch<P> {
        ReadLatch {
            guard: page.page.read_arc(),
            _fix: page.clone(),
        }
    }

    /// Total number of outstanding fixes across all pages.
    pub fn active_fixes(&self) -> usize {
        self.inner.active_fixes.load(Ordering::Relaxed)
    }

    /// Number of frames currently resident.
    pub fn resident_pages(&self) -> usize {
        self.inner.state.lock().frames.len()
    }

    /// Writes every dirty frame back and syncs the storage.
    pub fn flush(&self) -> Result<()> {
        let state = self.inner.state.lock();
        let mut written = 0usize;
        for frame in state.frames.values() {
            if frame.dirty.load(Ordering::Acquire) {
                self.inner.write_back(frame)?;
                written += 1;
            }
        }
        drop(state);
        self.inner.storage.sync()?;
        tracing::trace!(target: "mvtree::pager", written, "flushed page cache");
        Ok(())
    }

    /// Current counter values.
    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
        }
    }
}

/// A fixed page. Cloning takes another fix; dropping releases one.
pub struct PageRef<P: PageCodec> {
    id: PageId,
    page: Arc<RwLock<P>>,
    dirty: Arc<AtomicBool>,
    cache: Arc<CacheInner<P>>,
}

impl<P: PageCodec> PageRef<P> {
    /// Identifier of the fixed page.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Shared access to the decoded page.
    pub fn read(&self) -> RwLockReadGuard<'_, P> {
        self.page.read()
    }

    /// Exclusive access to the decoded page; marks the frame dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, P> {
        self.dirty.store(true, Ordering::Release);
        self.page.write()
    }
}

impl<P: PageCodec> Clone for PageRef<P> {
    fn clone(&self) -> Self {
        self.cache.pin(self.id);
        Self {
            id: self.id,
            page: Arc::clone(&self.page),
            dirty: Arc::clone(&self.dirty),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<P: PageCodec> Drop for PageRef<P> {
    fn drop(&mut self) {
        self.cache.unpin(self.id);
    }
}

impl<P: PageCodec> fmt::Debug for PageRef<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PageRef").field(&self.id.0).finish()
    }
}

/// A shared latch on a fixed page.
pub struct ReadLatch<P: PageCodec> {
    guard: ArcRwLockReadGuard<RawRwLock, P>,
    _fix: PageRef<P>,
}

impl<P: PageCodec> Deref for ReadLatch<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.guard
    }
}
