use std::ops::Range;

use crate::primitives::io::PageStorage;
use crate::types::checksum::{seal_page, verify_page};
use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{KeyCodec, KeyRange, PageId, Result, TreeError, Version};

const INFO_MAGIC: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 4;
const INFO_ROOT: usize = PAGE_HDR_LEN + 4;
const INFO_ACTIVE: usize = PAGE_HDR_LEN + 12;
const INFO_COMMITTED: usize = PAGE_HDR_LEN + 20;
const INFO_DIRECTORY: usize = PAGE_HDR_LEN + 28;
const INFO_HEIGHT: usize = PAGE_HDR_LEN + 36;
const INFO_KEY_RANGE: usize = PAGE_HDR_LEN + 40;

const MAGIC: [u8; 4] = *b"MVTI";

/// Persisted per-tree record: root, versions, key range and height.
///
/// Read once when a tree is opened and rewritten whenever a field changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeInfo<K> {
    /// Current root page, or [`PageId::NULL`] for an empty tree.
    pub root: PageId,
    /// Version the next write will produce.
    pub active_version: Version,
    /// Most recent finalized version.
    pub committed_version: Version,
    /// Key range covered by the tree.
    pub key_range: KeyRange<K>,
    /// Height of the current root (0 when empty).
    pub height: u32,
    /// Info page of the version directory, for multiversion trees.
    pub directory_root: PageId,
}

impl<K: KeyCodec> TreeInfo<K> {
    /// Info for a fresh, empty tree over the whole key space.
    pub fn empty(active_version: Version, committed_version: Version) -> Self {
        Self {
            root: PageId::NULL,
            active_version,
            committed_version,
            key_range: KeyRange::full(),
            height: 0,
            directory_root: PageId::NULL,
        }
    }

    fn encoded_len() -> usize {
        INFO_KEY_RANGE + KeyRange::<K>::encoded_len()
    }

    /// Reads the info record from page `id`.
    pub fn read(storage: &dyn PageStorage, id: PageId) -> Result<Self> {
        let mut buf = vec![0u8; storage.page_size()];
        storage.read_page(id, &mut buf)?;
        verify_page(id, &buf)?;
        let header = PageHeader::decode(&buf)?;
        if header.kind != PageKind::Info || buf[INFO_MAGIC] != MAGIC {
            return Err(TreeError::Corruption("not a tree info page"));
        }
        Ok(Self {
            root: PageId(page::read_u64(&buf, INFO_ROOT)),
            active_version: page::read_u64(&buf, INFO_ACTIVE),
            committed_version: page::read_u64(&buf, INFO_COMMITTED),
            directory_root: PageId(page::read_u64(&buf, INFO_DIRECTORY)),
            height: page::read_u32(&buf, INFO_HEIGHT),
            key_range: KeyRange::decode(&buf[INFO_KEY_RANGE..])?,
        })
    }

    /// Writes the info record to page `id`.
    pub fn write(&self, storage: &dyn PageStorage, id: PageId) -> Result<()> {
        let size = storage.page_size();
        if Self::encoded_len() > size {
            return Err(TreeError::Invalid("tree info does not fit in a page"));
        }
        let mut buf = vec![0u8; size];
        PageHeader {
            kind: PageKind::Info,
            flags: 0,
            height: 0,
            entry_count: 0,
            capacity: 0,
        }
        .encode(&mut buf)?;
        buf[INFO_MAGIC].copy_from_slice(&MAGIC);
        page::write_u64(&mut buf, INFO_ROOT, self.root.0);
        page::write_u64(&mut buf, INFO_ACTIVE, self.active_version);
        page::write_u64(&mut buf, INFO_COMMITTED, self.committed_version);
        page::write_u64(&mut buf, INFO_DIRECTORY, self.directory_root.0);
        page::write_u32(&mut buf, INFO_HEIGHT, self.height);
        self.key_range.encode(&mut buf[INFO_KEY_RANGE..]);
        seal_page(id, &mut buf);
        storage.write_page(id, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemoryStorage;

    #[test]
    fn info_roundtrip() -> Result<()> {
        let storage = MemoryStorage::new(256)?;
        let id = storage.allocate()?;
        let info = TreeInfo::<u64> {
            root: PageId(12),
            active_version: 7,
            committed_version: 6,
            key_range: KeyRange::new(0, 1_000),
            height: 3,
            directory_root: PageId(4),
        };
        info.write(&storage, id)?;
        assert_eq!(TreeInfo::<u64>::read(&storage, id)?, info);
        Ok(())
    }

    #[test]
    fn zeroed_page_is_rejected() -> Result<()> {
        let storage = MemoryStorage::new(256)?;
        let id = storage.allocate()?;
        assert!(TreeInfo::<u64>::read(&storage, id).is_err());
        Ok(())
    }
}
