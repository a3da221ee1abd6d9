//! Single-version page layout.
//!
//! ```text
//! [common header][range min K][range max K][entry 0]...[entry n-1]
//! leaf entry:  [key K][value V]
//! index entry: [router key K][child page id u64]
//! ```
//!
//! A router key is the lower bound of its child's key range; the child covers
//! keys up to the next router key (or the page's own upper bound).

use crate::primitives::pager::PageCodec;
use crate::storage::path::PathPage;
use crate::types::page::{
    self, entry_count_u16, height_u16, PageHeader, PageKind, FLAG_ROOT, PAGE_HDR_LEN,
};
use crate::types::{KeyCodec, KeyRange, PageId, Result, TreeError, ValCodec};

/// Entries of a single-version page.
#[derive(Clone, Debug, PartialEq)]
pub enum BTreeEntries<K, V> {
    /// Key/value pairs, strictly ascending by key.
    Leaf(Vec<(K, V)>),
    /// Routers `(lower bound, child)`, strictly ascending by key.
    Index(Vec<(K, PageId)>),
}

/// Decoded single-version page.
#[derive(Clone, Debug, PartialEq)]
pub struct BTreePage<K, V> {
    pub(crate) id: PageId,
    pub(crate) height: u32,
    pub(crate) root: bool,
    pub(crate) range: KeyRange<K>,
    pub(crate) capacity: usize,
    pub(crate) entries: BTreeEntries<K, V>,
}

/// Bytes preceding the first entry slot.
pub(crate) fn fixed_len<K: KeyCodec>() -> usize {
    PAGE_HDR_LEN + KeyRange::<K>::encoded_len()
}

pub(crate) fn leaf_entry_len<K: KeyCodec, V: ValCodec>() -> usize {
    K::ENCODED_LEN + V::ENCODED_LEN
}

pub(crate) fn index_entry_len<K: KeyCodec>() -> usize {
    K::ENCODED_LEN + 8
}

impl<K: KeyCodec, V: ValCodec> BTreePage<K, V> {
    pub(crate) fn new_leaf(id: PageId, range: KeyRange<K>, capacity: usize) -> Self {
        Self {
            id,
            height: 1,
            root: false,
            range,
            capacity,
            entries: BTreeEntries::Leaf(Vec::new()),
        }
    }

    pub(crate) fn new_index(id: PageId, height: u32, range: KeyRange<K>, capacity: usize) -> Self {
        Self {
            id,
            height,
            root: false,
            range,
            capacity,
            entries: BTreeEntries::Index(Vec::new()),
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        match &self.entries {
            BTreeEntries::Leaf(e) => e.len(),
            BTreeEntries::Index(e) => e.len(),
        }
    }

    /// Returns `true` if the page stores no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` for leaves.
    pub fn is_leaf(&self) -> bool {
        matches!(self.entries, BTreeEntries::Leaf(_))
    }

    /// Position of the router whose child covers `key`.
    pub(crate) fn child_slot(&self, key: &K) -> Option<usize> {
        let BTreeEntries::Index(routers) = &self.entries else {
            return None;
        };
        let pos = routers.partition_point(|(lo, _)| lo <= key);
        pos.checked_sub(1)
    }

    /// Child covering `key`.
    pub(crate) fn child_for(&self, key: &K) -> Option<PageId> {
        let slot = self.child_slot(key)?;
        match &self.entries {
            BTreeEntries::Index(routers) => Some(routers[slot].1),
            BTreeEntries::Leaf(_) => None,
        }
    }

    /// Key range covered by the router in `slot`.
    pub(crate) fn child_range(&self, slot: usize) -> Option<KeyRange<K>> {
        let BTreeEntries::Index(routers) = &self.entries else {
            return None;
        };
        let min = routers.get(slot)?.0.clone();
        let max = routers
            .get(slot + 1)
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| self.range.max.clone());
        Some(KeyRange::new(min, max))
    }

    /// Slot of the router pointing to `child`.
    pub(crate) fn slot_of(&self, child: PageId) -> Option<usize> {
        match &self.entries {
            BTreeEntries::Index(routers) => routers.iter().position(|(_, c)| *c == child),
            BTreeEntries::Leaf(_) => None,
        }
    }

    /// First key stored in the page.
    pub(crate) fn first_key(&self) -> Option<&K> {
        match &self.entries {
            BTreeEntries::Leaf(e) => e.first().map(|(k, _)| k),
            BTreeEntries::Index(e) => e.first().map(|(k, _)| k),
        }
    }

    /// Moves the entries from `at` onwards into a new list.
    pub(crate) fn split_off(&mut self, at: usize) -> BTreeEntries<K, V> {
        match &mut self.entries {
            BTreeEntries::Leaf(e) => BTreeEntries::Leaf(e.split_off(at)),
            BTreeEntries::Index(e) => BTreeEntries::Index(e.split_off(at)),
        }
    }

    /// Appends `other` after the existing entries.
    pub(crate) fn append(&mut self, other: BTreeEntries<K, V>) {
        match (&mut self.entries, other) {
            (BTreeEntries::Leaf(e), BTreeEntries::Leaf(mut o)) => e.append(&mut o),
            (BTreeEntries::Index(e), BTreeEntries::Index(mut o)) => e.append(&mut o),
            _ => panic!("appending entries of a different page kind"),
        }
    }
}

impl<K: KeyCodec, V: ValCodec> PathPage for BTreePage<K, V> {
    fn references(&self, child: PageId) -> bool {
        self.slot_of(child).is_some()
    }
}

impl<K: KeyCodec, V: ValCodec> PageCodec for BTreePage<K, V> {
    fn page_id(&self) -> PageId {
        self.id
    }

    fn encode_page(&self, buf: &mut [u8]) -> Result<()> {
        let (kind, entry_len) = match &self.entries {
            BTreeEntries::Leaf(_) => (PageKind::BTreeLeaf, leaf_entry_len::<K, V>()),
            BTreeEntries::Index(_) => (PageKind::BTreeIndex, index_entry_len::<K>()),
        };
        let start = fixed_len::<K>();
        if start + self.len() * entry_len > buf.len() {
            return Err(TreeError::Invalid("page entries exceed page size"));
        }
        PageHeader {
            kind,
            flags: if self.root { FLAG_ROOT } else { 0 },
            height: height_u16(self.height)?,
            entry_count: entry_count_u16(self.len())?,
            capacity: entry_count_u16(self.capacity)?,
        }
        .encode(buf)?;
        self.range.encode(&mut buf[PAGE_HDR_LEN..start]);
        let mut off = start;
        match &self.entries {
            BTreeEntries::Leaf(entries) => {
                for (key, value) in entries {
                    key.encode_key(&mut buf[off..off + K::ENCODED_LEN]);
                    value.encode_val(&mut buf[off + K::ENCODED_LEN..off + entry_len])?;
                    off += entry_len;
                }
            }
            BTreeEntries::Index(routers) => {
                for (key, child) in routers {
                    key.encode_key(&mut buf[off..off + K::ENCODED_LEN]);
                    page::write_u64(buf, off + K::ENCODED_LEN, child.0);
                    off += entry_len;
                }
            }
        }
        buf[off..].fill(0);
        Ok(())
    }

    fn decode_page(id: PageId, buf: &[u8]) -> Result<Self> {
        let header = PageHeader::decode(buf)?;
        let start = fixed_len::<K>();
        let count = header.entry_count as usize;
        let range = KeyRange::decode(&buf[PAGE_HDR_LEN..start])?;
        let entries = match header.kind {
            PageKind::BTreeLeaf => {
                let len = leaf_entry_len::<K, V>();
                if start + count * len > buf.len() {
                    return Err(TreeError::Corruption("leaf entry count exceeds page"));
                }
                let mut entries = Vec::with_capacity(count);
                for i in 0..count {
                    let off = start + i * len;
                    let key = K::decode_key(&buf[off..off + K::ENCODED_LEN])?;
                    let value = V::decode_val(&buf[off + K::ENCODED_LEN..off + len])?;
                    entries.push((key, value));
                }
                BTreeEntries::Leaf(entries)
            }
            PageKind::BTreeIndex => {
                let len = index_entry_len::<K>();
                if start + count * len > buf.len() {
                    return Err(TreeError::Corruption("index entry count exceeds page"));
                }
                let mut routers = Vec::with_capacity(count);
                for i in 0..count {
                    let off = start + i * len;
                    let key = K::decode_key(&buf[off..off + K::ENCODED_LEN])?;
                    routers.push((key, PageId(page::read_u64(buf, off + K::ENCODED_LEN))));
                }
                BTreeEntries::Index(routers)
            }
            _ => return Err(TreeError::Corruption("not a single-version tree page")),
        };
        Ok(Self {
            id,
            height: u32::from(header.height),
            root: header.is_root(),
            range,
            capacity: header.capacity as usize,
            entries,
        })
    }
}
