#![forbid(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::types::{page::MIN_PAGE_SIZE, PageId, Result, TreeError};

/// Durable storage of fixed-size pages keyed by [`PageId`].
///
/// Page id 0 is reserved as the null page and is never handed out.
pub trait PageStorage: Send + Sync + 'static {
    /// Size in bytes of every page.
    fn page_size(&self) -> usize;
    /// Allocates a fresh page id.
    fn allocate(&self) -> Result<PageId>;
    /// Marks `id` as allocated, so that [`PageStorage::allocate`] never returns it.
    fn reserve(&self, id: PageId) -> Result<()>;
    /// Reads the page image into `dst` (exactly `page_size` bytes).
    fn read_page(&self, id: PageId, dst: &mut [u8]) -> Result<()>;
    /// Writes a page image (exactly `page_size` bytes).
    fn write_page(&self, id: PageId, src: &[u8]) -> Result<()>;
    /// Returns `id` to the allocator.
    fn free(&self, id: PageId) -> Result<()>;
    /// Flushes written pages to durable media.
    fn sync(&self) -> Result<()>;
    /// Number of pages currently allocated.
    fn allocated_pages(&self) -> u64;
}

fn check_page_size(page_size: usize) -> Result<()> {
    if page_size < MIN_PAGE_SIZE {
        return Err(TreeError::Invalid("page size below minimum"));
    }
    Ok(())
}

fn check_len(page_size: usize, len: usize) -> Result<()> {
    if len != page_size {
        return Err(TreeError::Invalid("buffer length does not match page size"));
    }
    Ok(())
}

/// Heap-backed page storage used by tests and transient trees.
pub struct MemoryStorage {
    page_size: usize,
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    pages: FxHashMap<u64, Box<[u8]>>,
    allocated: FxHashSet<u64>,
    free: Vec<u64>,
    next: u64,
}

impl MemoryStorage {
    /// Creates an empty store with the given page size.
    pub fn new(page_size: usize) -> Result<Self> {
        check_page_size(page_size)?;
        Ok(Self {
            page_size,
            state: Mutex::new(MemoryState {
                next: 1,
                ..MemoryState::default()
            }),
        })
    }
}

impl PageStorage for MemoryStorage {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocate(&self) -> Result<PageId> {
        let mut state = self.state.lock();
        let id = match state.free.pop() {
            Some(id) => id,
            None => {
                let id = state.next;
                state.next += 1;
                id
            }
        };
        state.allocated.insert(id);
        Ok(PageId(id))
    }

    fn reserve(&self, id: PageId) -> Result<()> {
        if id.is_null() {
            return Err(TreeError::Invalid("cannot reserve the null page"));
        }
        let mut state = self.state.lock();
        state.free.retain(|free| *free != id.0);
        while state.next <= id.0 {
            let skipped = state.next;
            if skipped != id.0 {
                state.free.push(skipped);
            }
            state.next += 1;
        }
        state.allocated.insert(id.0);
        Ok(())
    }

    fn read_page(&self, id: PageId, dst: &mut [u8]) -> Result<()> {
        check_len(self.page_size, dst.len())?;
        let state = self.state.lock();
        if !state.allocated.contains(&id.0) {
            return Err(TreeError::Invalid("read of unallocated page"));
        }
        match state.pages.get(&id.0) {
            Some(image) => dst.copy_from_slice(image),
            None => dst.fill(0),
        }
        Ok(())
    }

    fn write_page(&self, id: PageId, src: &[u8]) -> Result<()> {
        check_len(self.page_size, src.len())?;
        let mut state = self.state.lock();
        if !state.allocated.contains(&id.0) {
            return Err(TreeError::Invalid("write of unallocated page"));
        }
        state.pages.insert(id.0, src.to_vec().into_boxed_slice());
        Ok(())
    }

    fn free(&self, id: PageId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.allocated.remove(&id.0) {
            return Err(TreeError::Invalid("free of unallocated page"));
        }
        state.pages.remove(&id.0);
        state.free.push(id.0);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn allocated_pages(&self) -> u64 {
        self.state.lock().allocated.len() as u64
    }
}

/// Single-file page storage; page `id` lives at byte offset `id * page_size`.
///
/// The free list is kept in memory only. After a reopen, pages freed before
/// the close are not reused and new pages are allocated past the end of file.
pub struct FileStorage {
    file: File,
    page_size: usize,
    next: AtomicU64,
    free: Mutex<Vec<u64>>,
    freed: AtomicU64,
}

impl FileStorage {
    /// Opens (or creates) the file at `path`.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        check_page_size(page_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        let pages = len.div_ceil(page_size as u64);
        tracing::debug!(
            target: "mvtree::pager",
            page_size,
            pages,
            "opened page file"
        );
        Ok(Self {
            file,
            page_size,
            next: AtomicU64::new(pages.max(1)),
            free: Mutex::new(Vec::new()),
            freed: AtomicU64::new(0),
        })
    }

    fn offset(&self, id: PageId) -> Result<u64> {
        if id.is_null() {
            return Err(TreeError::Invalid("null page has no offset"));
        }
        id.0.checked_mul(self.page_size as u64)
            .ok_or(TreeError::Invalid("page offset overflow"))
    }
}

impl PageStorage for FileStorage {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocate(&self) -> Result<PageId> {
        if let Some(id) = self.free.lock().pop() {
            self.freed.fetch_sub(1, Ordering::Relaxed);
            return Ok(PageId(id));
        }
        Ok(PageId(self.next.fetch_add(1, Ordering::Relaxed)))
    }

    fn reserve(&self, id: PageId) -> Result<()> {
        if id.is_null() {
            return Err(TreeError::Invalid("cannot reserve the null page"));
        }
        let mut free = self.free.lock();
        let before = free.len();
        free.retain(|free| *free != id.0);
        self.freed
            .fetch_sub((before - free.len()) as u64, Ordering::Relaxed);
        let mut next = self.next.load(Ordering::Relaxed);
        while next <= id.0 {
            if next != id.0 {
                free.push(next);
                self.freed.fetch_add(1, Ordering::Relaxed);
            }
            next += 1;
        }
        self.next.fetch_max(next, Ordering::Relaxed);
        Ok(())
    }

    fn read_page(&self, id: PageId, dst: &mut [u8]) -> Result<()> {
        check_len(self.page_size, dst.len())?;
        let off = self.offset(id)?;
        match read_exact(&self.file, off, dst) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                dst.fill(0);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn write_page(&self, id: PageId, src: &[u8]) -> Result<()> {
        check_len(self.page_size, src.len())?;
        let off = self.offset(id)?;
        write_all(&self.file, off, src)?;
        Ok(())
    }

    fn free(&self, id: PageId) -> Result<()> {
        self.offset(id)?;
        self.free.lock().push(id.0);
        self.freed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn allocated_pages(&self) -> u64 {
        let next = self.next.load(Ordering::Relaxed);
        (next - 1).saturating_sub(self.freed.load(Ordering::Relaxed))
    }
}

#[cfg(unix)]
fn read_exact(file: &File, off: u64, dst: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(dst, off)
}

#[cfg(unix)]
fn write_all(file: &File, off: u64, src: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(src, off)
}

#[cfg(windows)]
fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !dst.is_empty() {
        let read = file.seek_read(dst, off)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "seek_read reached EOF",
            ));
        }
        let (_, tail) = dst.split_at_mut(read);
        dst = tail;
        off += read as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !src.is_empty() {
        let written = file.seek_write(src, off)?;
        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "seek_write wrote zero bytes",
            ));
        }
        src = &src[written..];
        off += written as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_reuses_freed_ids() -> Result<()> {
        let storage = MemoryStorage::new(256)?;
        let a = storage.allocate()?;
        let b = storage.allocate()?;
        assert_eq!((a, b), (PageId(1), PageId(2)));
        storage.write_page(a, &vec![3u8; 256])?;
        storage.free(a)?;
        assert_eq!(storage.allocated_pages(), 1);
        assert_eq!(storage.allocate()?, a);
        let mut buf = vec![0xAAu8; 256];
        storage.read_page(a, &mut buf)?;
        assert!(buf.iter().all(|b| *b == 0));
        Ok(())
    }

    #[test]
    fn memory_storage_reserve_skips_ids() -> Result<()> {
        let storage = MemoryStorage::new(256)?;
        storage.reserve(PageId(3))?;
        let mut ids = vec![storage.allocate()?, storage.allocate()?, storage.allocate()?];
        ids.sort();
        assert_eq!(ids, vec![PageId(1), PageId(2), PageId(4)]);
        Ok(())
    }

    #[test]
    fn rejects_tiny_pages() {
        assert!(matches!(
            MemoryStorage::new(16),
            Err(TreeError::Invalid(_))
        ));
    }

    #[test]
    fn file_storage_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pages.db");
        {
            let storage = FileStorage::open(&path, 512)?;
            let id = storage.allocate()?;
            assert_eq!(id, PageId(1));
            storage.write_page(id, &vec![9u8; 512])?;
            storage.sync()?;
        }
        let storage = FileStorage::open(&path, 512)?;
        let mut buf = vec![0u8; 512];
        storage.read_page(PageId(1), &mut buf)?;
        assert!(buf.iter().all(|b| *b == 9));
        assert_eq!(storage.allocate()?, PageId(2));
        Ok(())
    }
}
