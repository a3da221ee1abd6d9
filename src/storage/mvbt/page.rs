//! Multiversion page layout.
//!
//! ```text
//! [common header][key min K][key max K][version start u64][version end u64][entries...]
//! leaf entry:  [key K][start u64][end u64][value V]
//! index entry: [key min K][key max K][start u64][end u64][child page id u64]
//! ```
//!
//! Leaf entries are ordered by `(key, start)` and routers by `(key min, start)`.

use crate::primitives::pager::PageCodec;
use crate::storage::path::PathPage;
use crate::types::page::{
    self, entry_count_u16, height_u16, PageHeader, PageKind, FLAG_ROOT, PAGE_HDR_LEN,
};
use crate::types::key::cmp_mv_ranges;
use crate::types::{
    KeyCodec, KeyRange, MvKeyRange, PageId, Result, TreeError, ValCodec, Version, VersionRange,
};

/// A versioned key/value pair.
#[derive(Clone, Debug, PartialEq)]
pub struct LeafEntry<K, V> {
    /// Key.
    pub key: K,
    /// Versions during which the value is visible.
    pub versions: VersionRange,
    /// Value.
    pub value: V,
}

/// A versioned pointer to a child page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Router<K> {
    /// Keys and versions the child answers for through this router.
    pub range: MvKeyRange<K>,
    /// Child page.
    pub child: PageId,
}

/// Entries of a multiversion page, also used as the live content moved by
/// structure modifications.
#[derive(Clone, Debug, PartialEq)]
pub enum MvbtEntries<K, V> {
    /// Leaf entries.
    Leaf(Vec<LeafEntry<K, V>>),
    /// Routers.
    Index(Vec<Router<K>>),
}

impl<K: KeyCodec, V: ValCodec> MvbtEntries<K, V> {
    /// Number of entries.
    pub fn len(&self) -> usize {
        match self {
            MvbtEntries::Leaf(e) => e.len(),
            MvbtEntries::Index(e) => e.len(),
        }
    }

    /// Returns `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` for leaf entries.
    pub fn is_leaf(&self) -> bool {
        matches!(self, MvbtEntries::Leaf(_))
    }

    pub(crate) fn empty_like(&self) -> Self {
        match self {
            MvbtEntries::Leaf(_) => MvbtEntries::Leaf(Vec::new()),
            MvbtEntries::Index(_) => MvbtEntries::Index(Vec::new()),
        }
    }

    /// Lower key bound of the entry at `idx`.
    pub(crate) fn key_at(&self, idx: usize) -> Option<K> {
        match self {
            MvbtEntries::Leaf(e) => e.get(idx).map(|e| e.key.clone()),
            MvbtEntries::Index(e) => e.get(idx).map(|r| r.range.keys.min.clone()),
        }
    }

    /// Appends `other` and restores the key order.
    pub(crate) fn merge_with(&mut self, other: MvbtEntries<K, V>) {
        match (self, other) {
            (MvbtEntries::Leaf(e), MvbtEntries::Leaf(mut o)) => {
                e.append(&mut o);
                e.sort_by(|a, b| a.key.cmp(&b.key).then(a.versions.start.cmp(&b.versions.start)));
            }
            (MvbtEntries::Index(e), MvbtEntries::Index(mut o)) => {
                e.append(&mut o);
                e.sort_by(|a, b| cmp_mv_ranges(&a.range, &b.range));
            }
            _ => panic!("merging entries of different page kinds"),
        }
    }

    /// Cuts the entries into consecutive parts of the given sizes.
    pub(crate) fn into_parts(self, counts: &[usize]) -> Vec<MvbtEntries<K, V>> {
        debug_assert_eq!(counts.iter().sum::<usize>(), self.len());
        fn cut<T>(mut items: Vec<T>, counts: &[usize]) -> Vec<Vec<T>> {
            let mut parts = Vec::with_capacity(counts.len());
            for count in counts.iter().rev() {
                let at = items.len() - count;
                parts.push(items.split_off(at));
            }
            parts.reverse();
            parts
        }
        match self {
            MvbtEntries::Leaf(e) => cut(e, counts).into_iter().map(MvbtEntries::Leaf).collect(),
            MvbtEntries::Index(e) => cut(e, counts).into_iter().map(MvbtEntries::Index).collect(),
        }
    }
}

/// Decoded multiversion page.
#[derive(Clone, Debug, PartialEq)]
pub struct MvbtPage<K, V> {
    pub(crate) id: PageId,
    pub(crate) height: u32,
    pub(crate) root: bool,
    pub(crate) range: MvKeyRange<K>,
    pub(crate) capacity: usize,
    pub(crate) entries: MvbtEntries<K, V>,
}

pub(crate) fn fixed_len<K: KeyCodec>() -> usize {
    PAGE_HDR_LEN + MvKeyRange::<K>::encoded_len()
}

pub(crate) fn leaf_entry_len<K: KeyCodec, V: ValCodec>() -> usize {
    K::ENCODED_LEN + VersionRange::ENCODED_LEN + V::ENCODED_LEN
}

pub(crate) fn index_entry_len<K: KeyCodec>() -> usize {
    MvKeyRange::<K>::encoded_len() + 8
}

impl<K: KeyCodec, V: ValCodec> MvbtPage<K, V> {
    /// Number of stored entries, dead or alive.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` for leaves.
    pub fn is_leaf(&self) -> bool {
        self.entries.is_leaf()
    }

    /// Returns `true` if the page was created in version `v`.
    pub fn is_active(&self, v: Version) -> bool {
        self.range.versions.start == v
    }

    /// Entries visible at version `v`.
    pub fn live_count(&self, v: Version) -> usize {
        match &self.entries {
            MvbtEntries::Leaf(e) => e.iter().filter(|e| e.versions.contains(v)).count(),
            MvbtEntries::Index(e) => e.iter().filter(|r| r.range.versions.contains(v)).count(),
        }
    }

    /// Copies of the entries alive at `v`, re-tagged to start at `v`.
    pub(crate) fn live_content(&self, v: Version) -> MvbtEntries<K, V> {
        match &self.entries {
            MvbtEntries::Leaf(e) => MvbtEntries::Leaf(
                e.iter()
                    .filter(|e| e.versions.contains(v))
                    .map(|e| LeafEntry {
                        key: e.key.clone(),
                        versions: VersionRange::open(v),
                        value: e.value.clone(),
                    })
                    .collect(),
            ),
            MvbtEntries::Index(e) => MvbtEntries::Index(
                e.iter()
                    .filter(|r| r.range.versions.contains(v))
                    .map(|r| Router {
                        range: MvKeyRange::open(r.range.keys.clone(), v),
                        child: r.child,
                    })
                    .collect(),
            ),
        }
    }

    /// Child answering for `key` at version `v`.
    pub(crate) fn child_for(&self, key: &K, v: Version) -> Option<PageId> {
        match &self.entries {
            MvbtEntries::Index(routers) => routers
                .iter()
                .find(|r| r.range.contains(key, v))
                .map(|r| r.child),
            MvbtEntries::Leaf(_) => None,
        }
    }

    /// Slot of the entry for `key` alive at `v`.
    pub(crate) fn find_live(&self, key: &K, v: Version) -> Option<usize> {
        match &self.entries {
            MvbtEntries::Leaf(entries) => entries
                .iter()
                .position(|e| &e.key == key && e.versions.contains(v)),
            MvbtEntries::Index(_) => None,
        }
    }

    /// Ends every live entry at `v`, dropping those created in `v`.
    pub(crate) fn end_live_entries(&mut self, v: Version) {
        match &mut self.entries {
            MvbtEntries::Leaf(entries) => {
                entries.retain(|e| e.versions.start != v || !e.versions.is_alive());
                for e in entries.iter_mut().filter(|e| e.versions.is_alive()) {
                    e.versions.end = v;
                }
            }
            MvbtEntries::Index(routers) => {
                routers.retain(|r| r.range.versions.start != v || !r.range.versions.is_alive());
                for r in routers.iter_mut().filter(|r| r.range.versions.is_alive()) {
                    r.range.versions.end = v;
                }
            }
        }
    }
}

impl<K: KeyCodec, V: ValCodec> PathPage for MvbtPage<K, V> {
    fn references(&self, child: PageId) -> bool {
        match &self.entries {
            MvbtEntries::Index(routers) => routers.iter().any(|r| r.child == child),
            MvbtEntries::Leaf(_) => false,
        }
    }
}

impl<K: KeyCodec, V: ValCodec> PageCodec for MvbtPage<K, V> {
    fn page_id(&self) -> PageId {
        self.id
    }

    fn encode_page(&self, buf: &mut [u8]) -> Result<()> {
        let (kind, entry_len) = match &self.entries {
            MvbtEntries::Leaf(_) => (PageKind::MvbtLeaf, leaf_entry_len::<K, V>()),
            MvbtEntries::Index(_) => (PageKind::MvbtIndex, index_entry_len::<K>()),
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
            MvbtEntries::Leaf(entries) => {
                let versions_at = K::ENCODED_LEN;
                let value_at = versions_at + VersionRange::ENCODED_LEN;
                for e in entries {
                    e.key.encode_key(&mut buf[off..off + versions_at]);
                    e.versions.encode(&mut buf[off + versions_at..off + value_at]);
                    e.value.encode_val(&mut buf[off + value_at..off + entry_len])?;
                    off += entry_len;
                }
            }
            MvbtEntries::Index(routers) => {
                let child_at = MvKeyRange::<K>::encoded_len();
                for r in routers {
                    r.range.encode(&mut buf[off..off + child_at]);
                    page::write_u64(buf, off + child_at, r.child.0);
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
        let range = MvKeyRange::decode(&buf[PAGE_HDR_LEN..start])?;
        let entries = match header.kind {
            PageKind::MvbtLeaf => {
                let len = leaf_entry_len::<K, V>();
                if start + count * len > buf.len() {
                    return Err(TreeError::Corruption("leaf entry count exceeds page"));
                }
                let versions_at = K::ENCODED_LEN;
                let value_at = versions_at + VersionRange::ENCODED_LEN;
                let mut entries = Vec::with_capacity(count);
                for i in 0..count {
                    let off = start + i * len;
                    entries.push(LeafEntry {
                        key: K::decode_key(&buf[off..off + versions_at])?,
                        versions: VersionRange::decode(&buf[off + versions_at..off + value_at])?,
                        value: V::decode_val(&buf[off + value_at..off + len])?,
                    });
                }
                MvbtEntries::Leaf(entries)
            }
            PageKind::MvbtIndex => {
                let len = index_entry_len::<K>();
                if start + count * len > buf.len() {
                    return Err(TreeError::Corruption("index entry count exceeds page"));
                }
                let child_at = MvKeyRange::<K>::encoded_len();
                let mut routers = Vec::with_capacity(count);
                for i in 0..count {
                    let off = start + i * len;
                    routers.push(Router {
                        range: MvKeyRange::decode(&buf[off..off + child_at])?,
                        child: PageId(page::read_u64(buf, off + child_at)),
                    });
                }
                MvbtEntries::Index(routers)
            }
            _ => return Err(TreeError::Corruption("not a multiversion tree page")),
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

/// Key ranges covering consecutive parts of `keys`, split at each part's first key.
pub(crate) fn part_ranges<K: KeyCodec, V: ValCodec>(
    keys: &KeyRange<K>,
    parts: &[MvbtEntries<K, V>],
) -> Vec<KeyRange<K>> {
    let mut ranges = Vec::with_capacity(parts.len());
    for i in 0..parts.len() {
        let min = if i == 0 {
            keys.min.clone()
        } else {
            parts[i].key_at(0).unwrap_or_else(|| keys.min.clone())
        };
        let max = match parts.get(i + 1).and_then(|p| p.key_at(0)) {
            Some(next) => next,
            None => keys.max.clone(),
        };
        ranges.push(KeyRange::new(min, max));
    }
    ranges
}
