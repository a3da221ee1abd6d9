use std::ops::ControlFlow;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use super::page::{fixed_len, index_entry_len, leaf_entry_len, MvbtEntries, MvbtPage};
use crate::primitives::io::{MemoryStorage, PageStorage};
use crate::primitives::pager::{CacheStats, PageCache, PageRef, TreeInfo};
use crate::storage::btree::BTree;
use crate::storage::options::TreeOptions;
use crate::storage::path::PagePath;
use crate::storage::policy::SmoPolicy;
use crate::storage::stats::TreeStats;
use crate::types::{
    KeyCodec, KeyRange, MvKeyRange, PageId, Result, TreeError, ValCodec, Version, VersionRange,
};

pub(super) type PageHandle<K, V> = PageRef<MvbtPage<K, V>>;

/// Multiversion B-tree.
///
/// Every committed version stays readable. Writes go to the active version,
/// which is one past the last committed version; [`MvbTree::insert`] and
/// [`MvbTree::delete`] commit it right away, while
/// [`TmvbTree`](super::TmvbTree) groups several writes into one version.
///
/// Roots of past versions are kept in a single-version directory tree keyed by
/// the version at which each root took over.
pub struct MvbTree<K: KeyCodec, V: ValCodec> {
    pub(super) cache: PageCache<MvbtPage<K, V>>,
    pub(super) info_page: PageId,
    pub(super) info: TreeInfo<K>,
    pub(super) directory: BTree<Version, PageId>,
    pub(super) policy: Arc<dyn SmoPolicy>,
    pub(super) options: TreeOptions,
    pub(super) stats: Arc<TreeStats>,
    pub(super) root: Option<PageHandle<K, V>>,
    pub(super) leaf_capacity: usize,
    pub(super) index_capacity: usize,
}

impl<K: KeyCodec, V: ValCodec> MvbTree<K, V> {
    /// Creates an empty tree and its root directory in `storage`.
    pub fn create(storage: Arc<dyn PageStorage>, options: TreeOptions) -> Result<Self> {
        let info_page = storage.allocate()?;
        let directory = BTree::create(
            Arc::clone(&storage),
            options.clone().overwrite_duplicates(true),
        )?;
        let mut info = TreeInfo::empty(1, 0);
        info.directory_root = directory.info_page();
        info.write(storage.as_ref(), info_page)?;
        Self::with_info(storage, info_page, info, directory, options)
    }

    /// Reopens a tree from its info page.
    pub fn open(
        storage: Arc<dyn PageStorage>,
        info_page: PageId,
        options: TreeOptions,
    ) -> Result<Self> {
        let info = TreeInfo::read(storage.as_ref(), info_page)?;
        if info.directory_root.is_null() {
            return Err(TreeError::Corruption("multiversion tree without a root directory"));
        }
        let directory = BTree::open(
            Arc::clone(&storage),
            info.directory_root,
            options.clone().overwrite_duplicates(true),
        )?;
        Self::with_info(storage, info_page, info, directory, options)
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
        directory: BTree<Version, PageId>,
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
        tracing::debug!(
            target: "mvtree::mvbt",
            info_page = info_page.0,
            active = info.active_version,
            committed = info.committed_version,
            policy = policy.name(),
            "opened multiversion tree"
        );
        Ok(Self {
            cache,
            info_page,
            info,
            directory,
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

    /// Version currently accepting writes.
    pub fn active_version(&self) -> Version {
        self.info.active_version
    }

    /// Latest committed version.
    pub fn committed_version(&self) -> Version {
        self.info.committed_version
    }

    /// Height of the current root; 0 when empty.
    pub fn height(&self) -> u32 {
        self.info.height
    }

    /// Structure-modification counters.
    pub fn stats(&self) -> &Arc<TreeStats> {
        &self.stats
    }

    /// Page cache counters of the data pages.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Outstanding fixes on data pages, including the one held on the root.
    pub fn active_fixes(&self) -> usize {
        self.cache.active_fixes()
    }

    /// Entry capacities of leaf and index pages.
    pub fn capacities(&self) -> (usize, usize) {
        (self.leaf_capacity, self.index_capacity)
    }

    /// Options the tree was opened with.
    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    pub(super) fn held_fixes(&self) -> usize {
        self.cache.active_fixes() - usize::from(self.root.is_some())
    }

    pub(super) fn persist_info(&self) -> Result<()> {
        self.info.write(self.cache.storage().as_ref(), self.info_page)
    }

    /// Swaps the current root and records it for the active version.
    pub(super) fn set_root(&mut self, root: Option<PageHandle<K, V>>, height: u32) -> Result<()> {
        let id = root.as_ref().map_or(PageId::NULL, |r| r.id());
        let version = self.info.active_version;
        self.info.root = id;
        self.info.height = height;
        self.root = root;
        self.directory.insert(version, id)?;
        tracing::trace!(target: "mvtree::mvbt", root = id.0, height, version, "root changed");
        self.persist_info()
    }

    /// Root page answering for version `v`.
    ///
    /// The active version reads the current root; committed versions go
    /// through the root directory.
    pub fn root_for(&self, v: Version) -> Result<Option<PageId>> {
        if v == self.info.active_version {
            return Ok(self.root.as_ref().map(|r| r.id()));
        }
        if v > self.info.committed_version {
            return Err(TreeError::VersionNotCommitted(v));
        }
        Ok(self
            .directory
            .floor(&v)?
            .map(|(_, id)| id)
            .filter(|id| !id.is_null()))
    }

    pub(super) fn check_key(&self, key: &K) -> Result<()> {
        if !self.info.key_range.contains(key) {
            return Err(TreeError::Invalid("key outside the tree key range"));
        }
        Ok(())
    }

    /// Fewest live entries a non-root page may hold. Index pages keep at
    /// least two routers so every live page has a live sibling.
    pub(super) fn weak_minimum(&self, page: &MvbtPage<K, V>) -> usize {
        let min = self.policy.thresholds(page.capacity).min_entries;
        if page.is_leaf() {
            min
        } else {
            min.max(2)
        }
    }

    /// Walks `path` down to the leaf whose live range covers `key`.
    pub(super) fn descend_live(&self, path: &mut PagePath<MvbtPage<K, V>>, key: &K) -> Result<()> {
        let v = self.info.active_version;
        loop {
            let child = {
                let page = path.top().read();
                if page.is_leaf() {
                    return Ok(());
                }
                page.child_for(key, v)
                    .ok_or(TreeError::Corruption("no live router covers the key"))?
            };
            path.descend(self.cache.fix(child)?);
        }
    }

    /// Inserts `key` and commits a new version.
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>> {
        let previous = self.insert_active(key, value)?;
        self.commit_version()?;
        Ok(previous)
    }

    /// Deletes `key` and commits a new version.
    pub fn delete(&mut self, key: &K) -> Result<Option<V>> {
        let removed = self.delete_active(key)?;
        self.commit_version()?;
        Ok(removed)
    }

    /// Closes the active version and opens the next one.
    pub fn commit_version(&mut self) -> Result<Version> {
        let version = self.info.active_version;
        self.info.committed_version = version;
        self.info.active_version = version + 1;
        self.persist_info()?;
        tracing::trace!(target: "mvtree::mvbt", version, "committed version");
        Ok(version)
    }

    /// Value of `key` at version `v`.
    pub fn get(&self, key: &K, v: Version) -> Result<Option<V>> {
        let baseline = self.held_fixes();
        let result = self.get_inner(key, v);
        debug_assert_eq!(self.held_fixes(), baseline, "get leaked page fixes");
        result
    }

    fn get_inner(&self, key: &K, v: Version) -> Result<Option<V>> {
        let Some(root) = self.root_for(v)? else {
            return Ok(None);
        };
        let mut path = PagePath::latch_coupled();
        path.attach_root(self.cache.fix(root)?);
        loop {
            let child = {
                let latch = self.cache.read_latch(path.top());
                match &latch.entries {
                    MvbtEntries::Leaf(entries) => {
                        return Ok(entries
                            .iter()
                            .find(|e| &e.key == key && e.versions.contains(v))
                            .map(|e| e.value.clone()));
                    }
                    MvbtEntries::Index(_) => latch
                        .child_for(key, v)
                        .ok_or(TreeError::Corruption("no router covers the key"))?,
                }
            };
            path.descend(self.cache.fix(child)?);
        }
    }

    /// Value of `key` at the latest committed version.
    pub fn get_latest(&self, key: &K) -> Result<Option<V>> {
        self.get(key, self.info.committed_version)
    }

    /// Visits entries alive at `v` with keys in `[min, max)` in key order
    /// until `visit` breaks.
    pub fn traverse<F>(&self, min: &K, max: &K, v: Version, visit: F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&K, &V) -> ControlFlow<()>,
    {
        let baseline = self.held_fixes();
        let result = self.traverse_inner(min, max, v, visit);
        debug_assert_eq!(self.held_fixes(), baseline, "traverse leaked page fixes");
        result
    }

    fn traverse_inner<F>(
        &self,
        min: &K,
        max: &K,
        v: Version,
        mut visit: F,
    ) -> Result<ControlFlow<()>>
    where
        F: FnMut(&K, &V) -> ControlFlow<()>,
    {
        let Some(root) = self.root_for(v)? else {
            return Ok(ControlFlow::Continue(()));
        };
        let wanted = KeyRange::new(min.clone(), max.clone());
        let mut queue: Vec<PageHandle<K, V>> = vec![self.cache.fix(root)?];
        while let Some(page) = queue.pop() {
            let step = {
                let p = page.read();
                match &p.entries {
                    MvbtEntries::Leaf(entries) => Visit::Entries(
                        entries
                            .iter()
                            .filter(|e| e.versions.contains(v) && wanted.contains(&e.key))
                            .map(|e| (e.key.clone(), e.value.clone()))
                            .collect(),
                    ),
                    MvbtEntries::Index(routers) => Visit::Children(
                        routers
                            .iter()
                            .filter(|r| r.range.versions.contains(v) && r.range.keys.overlaps(&wanted))
                            .map(|r| r.child)
                            .collect(),
                    ),
                }
            };
            drop(page);
            match step {
                Visit::Entries(hits) => {
                    for (k, val) in &hits {
                        if visit(k, val).is_break() {
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

    /// Entries alive at `v` with keys in `[min, max)`.
    pub fn range(&self, min: &K, max: &K, v: Version) -> Result<Vec<(K, V)>> {
        let mut out = Vec::new();
        self.traverse(min, max, v, |k, val| {
            out.push((k.clone(), val.clone()));
            ControlFlow::Continue(())
        })?;
        Ok(out)
    }

    /// Every entry alive at `v`.
    pub fn entries_at(&self, v: Version) -> Result<Vec<(K, V)>> {
        let range = self.info.key_range.clone();
        self.range(&range.min, &range.max, v)
    }

    /// Every value `key` has held, oldest first, with the versions it was
    /// visible in. Adjacent pieces holding the same value are merged.
    pub fn history(&self, key: &K) -> Result<Vec<(VersionRange, V)>> {
        let roots: Vec<PageId> = self
            .directory
            .entries()?
            .into_iter()
            .map(|(_, id)| id)
            .chain(self.root.as_ref().map(|r| r.id()))
            .collect();
        self.pieces(key, roots, |_| true)
    }

    /// Returns `true` if `key` was written or deleted by a version in
    /// `(after, upto]`.
    ///
    /// Only roots and pages whose lifespan overlaps the window are visited.
    pub fn changed_between(&self, key: &K, after: Version, upto: Version) -> Result<bool> {
        if upto <= after {
            return Ok(false);
        }
        let mut roots: Vec<PageId> = self
            .directory
            .floor(&after)?
            .map(|(_, id)| id)
            .into_iter()
            .collect();
        roots.extend(
            self.directory
                .range(&(after + 1), &upto.saturating_add(1))?
                .into_iter()
                .map(|(_, id)| id),
        );
        if upto >= self.info.active_version {
            roots.extend(self.root.as_ref().map(|r| r.id()));
        }
        let window = |versions: &VersionRange| versions.start <= upto && versions.end > after;
        let touched = |v: Version| v > after && v <= upto;
        Ok(self
            .pieces(key, roots, window)?
            .iter()
            .any(|(versions, _)| touched(versions.start) || touched(versions.end)))
    }

    /// Versioned values of `key` reachable from `roots` through routers and
    /// entries accepted by `keep`, merged where adjacent pieces agree.
    fn pieces<F>(&self, key: &K, roots: Vec<PageId>, keep: F) -> Result<Vec<(VersionRange, V)>>
    where
        F: Fn(&VersionRange) -> bool,
    {
        let mut pending: Vec<PageId> = roots.into_iter().filter(|id| !id.is_null()).collect();
        let mut visited = FxHashSet::default();
        let mut pieces: Vec<(VersionRange, V)> = Vec::new();
        while let Some(id) = pending.pop() {
            if !visited.insert(id) {
                continue;
            }
            let page = self.cache.fix(id)?;
            let p = page.read();
            match &p.entries {
                MvbtEntries::Leaf(entries) => pieces.extend(
                    entries
                        .iter()
                        .filter(|e| &e.key == key && !e.versions.is_empty() && keep(&e.versions))
                        .map(|e| (e.versions, e.value.clone())),
                ),
                MvbtEntries::Index(routers) => pending.extend(
                    routers
                        .iter()
                        .filter(|r| {
                            r.range.keys.contains(key)
                                && !r.range.versions.is_empty()
                                && keep(&r.range.versions)
                        })
                        .map(|r| r.child),
                ),
            }
        }
        pieces.sort_by_key(|(versions, _)| versions.start);
        let mut merged: Vec<(VersionRange, V)> = Vec::with_capacity(pieces.len());
        for (versions, value) in pieces {
            match merged.last_mut() {
                Some((last, last_value)) if last.end == versions.start && *last_value == value => {
                    last.end = versions.end;
                }
                _ => merged.push((versions, value)),
            }
        }
        Ok(merged)
    }

    /// Writes dirty pages, the root directory, and the info page to storage.
    pub fn flush(&self) -> Result<()> {
        self.directory.flush()?;
        self.persist_info()?;
        self.cache.flush()
    }

    /// Verifies the tree as seen at version `v`: page liveness, key
    /// partitioning, heights, and the weak version condition. Returns the
    /// number of entries alive at `v`.
    pub fn check_consistency(&self, v: Version) -> Result<usize> {
        let Some(root) = self.root_for(v)? else {
            return Ok(0);
        };
        let height = self.cache.fix(root)?.read().height;
        self.check_page(root, &self.info.key_range, height, true, v)
    }

    fn check_page(
        &self,
        id: PageId,
        keys: &KeyRange<K>,
        height: u32,
        root: bool,
        v: Version,
    ) -> Result<usize> {
        let page = self.cache.fix(id)?;
        let children = {
            let p = page.read();
            if !p.range.versions.contains(v) {
                return Err(TreeError::Corruption("page reached at a version it is not alive in"));
            }
            if &p.range.keys != keys || p.height != height {
                return Err(TreeError::Corruption("page range or height differs from its router"));
            }
            let live = p.live_count(v);
            if p.len() > p.capacity {
                return Err(TreeError::Corruption("page holds more entries than its capacity"));
            }
            if !root && live < self.weak_minimum(&p) {
                return Err(TreeError::Corruption("live entries below the weak version minimum"));
            }
            match &p.entries {
                MvbtEntries::Leaf(entries) => {
                    let alive: Vec<&K> = entries
                        .iter()
                        .filter(|e| e.versions.contains(v))
                        .map(|e| &e.key)
                        .collect();
                    let sorted = alive.windows(2).all(|w| w[0] < w[1]);
                    if !sorted || alive.iter().any(|k| !keys.contains(k)) || height != 1 {
                        return Err(TreeError::Corruption("live leaf keys unordered or out of range"));
                    }
                    return Ok(live);
                }
                MvbtEntries::Index(routers) => {
                    let alive: Vec<(KeyRange<K>, PageId)> = routers
                        .iter()
                        .filter(|r| r.range.versions.contains(v))
                        .map(|r| (r.range.keys.clone(), r.child))
                        .collect();
                    let tiled = alive.first().map(|(r, _)| &r.min) == Some(&keys.min)
                        && alive.last().map(|(r, _)| &r.max) == Some(&keys.max)
                        && alive.windows(2).all(|w| w[0].0.max == w[1].0.min);
                    if !tiled {
                        return Err(TreeError::Corruption("live routers do not tile the page range"));
                    }
                    alive
                }
            }
        };
        drop(page);
        let mut total = 0;
        for (child_keys, child) in children {
            total += self.check_page(child, &child_keys, height - 1, false, v)?;
        }
        Ok(total)
    }

    pub(super) fn page_capacity(&self, leaf: bool) -> usize {
        if leaf {
            self.leaf_capacity
        } else {
            self.index_capacity
        }
    }

    pub(super) fn root_or_create(&mut self) -> Result<PageHandle<K, V>> {
        if let Some(root) = &self.root {
            return Ok(root.clone());
        }
        let range = self.info.key_range.clone();
        let version = self.info.active_version;
        let capacity = self.leaf_capacity;
        let root = self.cache.create_with(|id| MvbtPage {
            id,
            height: 1,
            root: true,
            range: MvKeyRange::open(range, version),
            capacity,
            entries: MvbtEntries::Leaf(Vec::new()),
        })?;
        self.set_root(Some(root.clone()), 1)?;
        Ok(root)
    }
}

enum Visit<K, V> {
    Entries(Vec<(K, V)>),
    Children(Vec<PageId>),
}

impl<K: KeyCodec, V: ValCodec> std::fmt::Debug for MvbTree<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MvbTree")
            .field("info_page", &self.info_page)
            .field("root", &self.info.root)
            .field("height", &self.info.height)
            .field("active_version", &self.info.active_version)
            .field("committed_version", &self.info.committed_version)
            .field("policy", &self.policy.name())
            .finish()
    }
}
