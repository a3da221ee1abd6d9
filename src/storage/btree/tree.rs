use std::ops::ControlFlow;
use std::sync::Arc;

use super::page::{fixed_len, index_entry_len, leaf_entry_len, BTreeEntries, BTreePage};
use crate::primitives::io::{MemoryStorage, PageStorage};
use crate::primitives::pager::{CacheStats, PageCache, PageRef, TreeInfo};
use crate::storage::options::TreeOptions;
use crate::storage::path::PagePath;
use crate::storage::policy::SmoPolicy;
use crate::storage::smo::{SplitOps, UnderflowOps};
use crate::storage::stats::TreeStats;
use crate::types::{KeyCodec, KeyRange, PageId, Result, TreeError, ValCodec};

pub(super) type PageHandle<K, V> = PageRef<BTreePage<K, V>>;

/// Ordered single-version B-tree over fixed-size pages.
pub struct BTree<K: KeyCodec, V: ValCodec> {
    pub(super) cache: PageCache<BTreePage<K, V>>,
    pub(super) info_page: PageId,
    pub(super) info: TreeInfo<K>,
    pub(super) policy: Arc<dyn SmoPolicy>,
    pub(super) options: TreeOptions,
    pub(super) stats: Arc<TreeStats>,
    pub(super) root: Option<PageHandle<K, V>>,
    pub(super) leaf_capacity: usize,
    pub(super) index_capacity: usize,
}

impl<K: KeyCodec, V: ValCodec> BTree<K, V> {
    /// Creates an empty tree, allocating its info page in `storage`.
    pub fn create(storage: Arc<dyn PageStorage>, options: TreeOptions) -> Result<Self> {
        let info_page = storage.allocate()?;
        let info = TreeInfo::empty(0, 0);
        info.write(storage.as_ref(), info_page)?;
        Self::with_info(storage, info_page, info, options)
    }

    /// Reopens a tree from its info page.
    pub fn open(
        storage: Arc<dyn PageStorage>,
        info_page: PageId,
        options: TreeOptions,
    ) -> Result<Self> {
        let info = TreeInfo::read(storage.as_ref(), info_page)?;
        Self::with_info(storage, info_page, info, options)
    }

    /// Creates an empty tree over fresh in-memory storage.
    pub fn in_memory(options: TreeOptions) -> Result<Self> {
        let storage: Arc<dyn PageStorage> = Arc::new(MemoryStorage::new(options.page_size)?);
        Self::create(storage, options)
    }

    fn with_info(
        storage: Arc<dyn PageStorage>,
        info_page: PageId,
        info: TreeInfo<K>,
        options: TreeOptions,
    ) -> Result<Self> {
        options.check_page_size(storage.page_size())?;
        let policy = options.build_policy()?;
        let leaf_capacity = options.capacity_for(fixed_len::<K>(), leaf_entry_len::<K, V>())?;
        let index_capacity = options.capacity_for(fixed_len::<K>(), index_entry_len::<K>())?;
        policy.validate(leaf_capacity)?;
        policy.validate(index_capacity)?;
        let cache = PageCache::new(storage, options.cache_pages, options.checksum_verify_on_read);
        let root = if info.root.is_null() {
            None
        } else {
            Some(cache.fix(info.root)?)
        };
        Ok(Self {
            cache,
            info_page,
            info,
            policy,
            options,
            stats: Arc::new(TreeStats::default()),
            root,
            leaf_capacity,
            index_capacity,
        })
    }

    /// Info page identifying this tree in its storage.
    pub fn info_page(&self) -> PageId {
        self.info_page
    }

    /// Height of the tree; 0 when empty, 1 for a single leaf.
    pub fn height(&self) -> u32 {
        self.info.height
    }

    /// Returns `true` if the tree has no root.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Current root page, if any.
    pub fn root_id(&self) -> Option<PageId> {
        self.root.as_ref().map(|r| r.id())
    }

    /// Options the tree was opened with.
    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    /// Structure-modification counters.
    pub fn stats(&self) -> &Arc<TreeStats> {
        &self.stats
    }

    /// Page cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Outstanding page fixes, including the one held on the root.
    pub fn active_fixes(&self) -> usize {
        self.cache.active_fixes()
    }

    /// Entry capacities of leaf and index pages.
    pub fn capacities(&self) -> (usize, usize) {
        (self.leaf_capacity, self.index_capacity)
    }

    pub(super) fn held_fixes(&self) -> usize {
        self.cache.active_fixes() - usize::from(self.root.is_some())
    }

    pub(super) fn persist_info(&self) -> Result<()> {
        self.info.write(self.cache.storage().as_ref(), self.info_page)
    }

    /// Swaps the held root fix and records it in the info page.
    pub(super) fn set_root(&mut self, root: Option<PageHandle<K, V>>, height: u32) -> Result<()> {
        self.info.root = root.as_ref().map_or(PageId::NULL, |r| r.id());
        self.info.height = height;
        self.root = root;
        self.persist_info()
    }

    fn root_or_create(&mut self) -> Result<PageHandle<K, V>> {
        if let Some(root) = &self.root {
            return Ok(root.clone());
        }
        let range = self.info.key_range.clone();
        let capacity = self.leaf_capacity;
        let root = self.cache.create_with(|id| {
            let mut page = BTreePage::new_leaf(id, range, capacity);
            page.root = true;
            page
        })?;
        self.set_root(Some(root.clone()), 1)?;
        Ok(root)
    }

    pub(super) fn descend_to_leaf(
        &self,
        path: &mut PagePath<BTreePage<K, V>>,
        key: &K,
    ) -> Result<()> {
        loop {
            let child = {
                let page = path.top().read();
                if page.is_leaf() {
                    return Ok(());
                }
                page.child_for(key)
                    .ok_or(TreeError::Corruption("no router covers the key"))?
            };
            path.descend(self.cache.fix(child)?);
        }
    }

    fn check_key(&self, key: &K) -> Result<()> {
        if !self.info.key_range.contains(key) {
            return Err(TreeError::Invalid("key outside the tree key range"));
        }
        Ok(())
    }

    /// Inserts `key`. Returns the replaced value when overwriting is enabled,
    /// and fails with [`TreeError::DuplicateKey`] otherwise.
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>> {
        self.check_key(&key)?;
        value.validate()?;
        let baseline = self.held_fixes();
        let result = self.insert_inner(key, value);
        debug_assert_eq!(self.held_fixes(), baseline, "insert leaked page fixes");
        result
    }

    fn insert_inner(&mut self, key: K, value: V) -> Result<Option<V>> {
        let mut path = PagePath::full();
        path.attach_root(self.root_or_create()?);
        self.descend_to_leaf(&mut path, &key)?;
        let existing = {
            let page = path.top().read();
            match &page.entries {
                BTreeEntries::Leaf(entries) => entries.binary_search_by(|(k, _)| k.cmp(&key)).ok(),
                BTreeEntries::Index(_) => None,
            }
        };
        if let Some(pos) = existing {
            if !self.options.overwrite_duplicates {
                return Err(TreeError::DuplicateKey);
            }
            let mut page = path.top().write();
            if let BTreeEntries::Leaf(entries) = &mut page.entries {
                return Ok(Some(std::mem::replace(&mut entries[pos].1, value)));
            }
        }
        let about_to_overflow = {
            let fill = self.fill(&path.top().read());
            self.policy.is_about_to_overflow(&fill)
        };
        if about_to_overflow {
            self.split(&mut path, &key)?;
        }
        let mut page = path.top().write();
        if let BTreeEntries::Leaf(entries) = &mut page.entries {
            let pos = entries.partition_point(|(k, _)| k < &key);
            entries.insert(pos, (key, value));
        }
        Ok(None)
    }

    /// Removes `key`, returning its value if it was present.
    pub fn delete(&mut self, key: &K) -> Result<Option<V>> {
        let baseline = self.held_fixes();
        let result = self.delete_inner(key);
        debug_assert_eq!(self.held_fixes(), baseline, "delete leaked page fixes");
        result
    }

    fn delete_inner(&mut self, key: &K) -> Result<Option<V>> {
        let Some(root) = self.root.clone() else {
            return Ok(None);
        };
        let mut path = PagePath::full();
        path.attach_root(root);
        self.descend_to_leaf(&mut path, key)?;
        let about_to_underflow = {
            let fill = self.fill(&path.top().read());
            fill.root || self.policy.is_about_to_underflow(&fill)
        };
        let removed = {
            let mut page = path.top().write();
            match &mut page.entries {
                BTreeEntries::Leaf(entries) => entries
                    .binary_search_by(|(k, _)| k.cmp(key))
                    .ok()
                    .map(|pos| entries.remove(pos).1),
                BTreeEntries::Index(_) => None,
            }
        };
        if removed.is_some() && about_to_underflow {
            self.check_underflow(&mut path)?;
        }
        Ok(removed)
    }

    /// Looks up `key` with a latch-coupled descent.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let baseline = self.held_fixes();
        let result = self.get_inner(key);
        debug_assert_eq!(self.held_fixes(), baseline, "get leaked page fixes");
        result
    }

    fn get_inner(&self, key: &K) -> Result<Option<V>> {
        let Some(root) = self.root.clone() else {
            return Ok(None);
        };
        let mut path = PagePath::latch_coupled();
        path.attach_root(root);
        loop {
            let child = {
                let latch = self.cache.read_latch(path.top());
                match &latch.entries {
                    BTreeEntries::Leaf(entries) => {
                        return Ok(entries
                            .binary_search_by(|(k, _)| k.cmp(key))
                            .ok()
                            .map(|pos| entries[pos].1.clone()));
                    }
                    BTreeEntries::Index(_) => latch
                        .child_for(key)
                        .ok_or(TreeError::Corruption("no router covers the key"))?,
                }
            };
            path.descend(self.cache.fix(child)?);
        }
    }

    /// Returns `true` if `key` is stored.
    pub fn contains(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Greatest entry whose key is `<= key`.
    pub fn floor(&self, key: &K) -> Result<Option<(K, V)>> {
        match self.root.clone() {
            Some(root) => self.floor_in(root, key),
            None => Ok(None),
        }
    }

    fn floor_in(&self, page: PageHandle<K, V>, key: &K) -> Result<Option<(K, V)>> {
        let candidates = {
            let p = page.read();
            match &p.entries {
                BTreeEntries::Leaf(entries) => {
                    let pos = entries.partition_point(|(k, _)| k <= key);
                    return Ok(pos.checked_sub(1).map(|i| entries[i].clone()));
                }
                BTreeEntries::Index(routers) => {
                    let pos = routers.partition_point(|(lo, _)| lo <= key);
                    routers[..pos].iter().rev().map(|(_, c)| *c).collect::<Vec<_>>()
                }
            }
        };
        drop(page);
        for child in candidates {
            if let Some(hit) = self.floor_in(self.cache.fix(child)?, key)? {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    /// Visits entries with keys in `[min, max)` in ascending order until
    /// `visit` breaks.
    pub fn traverse<F>(&self, min: &K, max: &K, visit: F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&K, &V) -> ControlFlow<()>,
    {
        let baseline = self.held_fixes();
        let result = self.traverse_inner(min, max, visit);
        debug_assert_eq!(self.held_fixes(), baseline, "traverse leaked page fixes");
        result
    }

    fn traverse_inner<F>(&self, min: &K, max: &K, mut visit: F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&K, &V) -> ControlFlow<()>,
    {
        let Some(root) = self.root.clone() else {
            return Ok(ControlFlow::Continue(()));
        };
        let wanted = KeyRange::new(min.clone(), max.clone());
        let mut queue: Vec<PageHandle<K, V>> = vec![root];
        while let Some(page) = queue.pop() {
            let step = {
                let p = page.read();
                match &p.entries {
                    BTreeEntries::Leaf(entries) => Visit::Entries(
                        entries
                            .iter()
                            .filter(|(k, _)| wanted.contains(k))
                            .cloned()
                            .collect(),
                    ),
                    BTreeEntries::Index(routers) => Visit::Children(
                        (0..routers.len())
                            .filter(|slot| {
                                p.child_range(*slot)
                                    .is_some_and(|range| range.overlaps(&wanted))
                            })
                            .map(|slot| routers[slot].1)
                            .collect(),
                    ),
                }
            };
            drop(page);
            match step {
                Visit::Entries(hits) => {
                    for (k, v) in &hits {
                        if visit(k, v).is_break() {
                            // release the fixes of every queued page
                            queue.clear();
                            return Ok(ControlFlow::Break(()));
                        }
                    }
                }
                Visit::Children(children) => {
                    for child in children.into_iter().rev() {
                        queue.push(self.cache.fix(child)?);
                    }
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Entries with keys in `[min, max)`.
    pub fn range(&self, min: &K, max: &K) -> Result<Vec<(K, V)>> {
        let mut out = Vec::new();
        self.traverse(min, max, |k, v| {
            out.push((k.clone(), v.clone()));
            ControlFlow::Continue(())
        })?;
        Ok(out)
    }

    /// Every entry in key order.
    pub fn entries(&self) -> Result<Vec<(K, V)>> {
        self.range(&self.info.key_range.min.clone(), &self.info.key_range.max.clone())
    }

    /// Number of stored entries.
    pub fn len(&self) -> Result<usize> {
        let mut count = 0usize;
        let range = self.info.key_range.clone();
        self.traverse(&range.min, &range.max, |_, _| {
            count += 1;
            ControlFlow::Continue(())
        })?;
        Ok(count)
    }

    /// Deletes every page, leaving an empty tree.
    pub fn clear(&mut self) -> Result<()> {
        let Some(root) = self.root.clone() else {
            return Ok(());
        };
        self.set_root(None, 0)?;
        let mut pending = vec![root];
        while let Some(page) = pending.pop() {
            let children = match &page.read().entries {
                BTreeEntries::Index(routers) => routers.iter().map(|(_, c)| *c).collect(),
                BTreeEntries::Leaf(_) => Vec::new(),
            };
            self.cache.delete(page)?;
            for child in children {
                pending.push(self.cache.fix(child)?);
            }
        }
        Ok(())
    }

    /// Writes dirty pages and the info page to storage.
    pub fn flush(&self) -> Result<()> {
        self.persist_info()?;
        self.cache.flush()
    }

    /// Verifies ordering, key ranges, heights, and occupancy bounds of every page.
    pub fn check_consistency(&self) -> Result<usize> {
        let Some(root) = &self.root else {
            return Ok(0);
        };
        self.check_page(root.id(), &self.info.key_range, self.info.height, true)
    }

    fn check_page(
        &self,
        id: PageId,
        range: &KeyRange<K>,
        height: u32,
        root: bool,
    ) -> Result<usize> {
        let page = self.cache.fix(id)?;
        let step = {
            let p = page.read();
            if &p.range != range {
                return Err(TreeError::Corruption("page range differs from its router"));
            }
            if p.height != height || p.root != root {
                return Err(TreeError::Corruption("page height or root flag mismatch"));
            }
            if p.len() > p.capacity || (!root && self.underflows(&p)) {
                return Err(TreeError::Corruption("page occupancy outside policy bounds"));
            }
            match &p.entries {
                BTreeEntries::Leaf(entries) => {
                    let sorted = entries.windows(2).all(|w| w[0].0 < w[1].0);
                    if !sorted || entries.iter().any(|(k, _)| !range.contains(k)) {
                        return Err(TreeError::Corruption("leaf keys unordered or out of range"));
                    }
                    if height != 1 {
                        return Err(TreeError::Corruption("leaf above level 1"));
                    }
                    return Ok(entries.len());
                }
                BTreeEntries::Index(routers) => {
                    let sorted = routers.windows(2).all(|w| w[0].0 < w[1].0);
                    if !sorted || routers.first().map(|(k, _)| k) != Some(&range.min) {
                        return Err(TreeError::Corruption("routers unordered or misaligned"));
                    }
                    (0..routers.len())
                        .filter_map(|slot| Some((routers[slot].1, p.child_range(slot)?)))
                        .collect::<Vec<_>>()
                }
            }
        };
        drop(page);
        let mut total = 0;
        for (child, child_range) in step {
            total += self.check_page(child, &child_range, height - 1, false)?;
        }
        Ok(total)
    }
}

enum Visit<K, V> {
    Entries(Vec<(K, V)>),
    Children(Vec<PageId>),
}

impl<K: KeyCodec, V: ValCodec> std::fmt::Debug for BTree<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("info_page", &self.info_page)
            .field("root", &self.info.root)
            .field("height", &self.info.height)
            .field("policy", &self.policy.name())
            .finish()
    }
}
