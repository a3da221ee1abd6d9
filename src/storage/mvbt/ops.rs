//! Writes and structure modifications of the multiversion tree.
//!
//! A page that cannot absorb a change is restructured: its live content
//! (plus a live sibling's when the content is too small) is copied into
//! fresh pages valid from the active version on. Pages created in the active
//! version are reused or freed; older pages are retired by ending their
//! version range, which keeps them readable for the versions they served.

use super::page::{part_ranges, LeafEntry, MvbtEntries, MvbtPage, Router};
use super::tree::{MvbTree, PageHandle};
use crate::storage::path::PagePath;
use crate::storage::policy::{partition_counts, PageFill, SmoPolicy};
use crate::storage::smo::UnderflowOps;
use crate::types::{
    KeyCodec, KeyRange, MvKeyRange, PageId, Result, TreeError, ValCodec, VersionRange,
};

impl<K: KeyCodec, V: ValCodec> MvbTree<K, V> {
    /// Writes `key` in the active version without committing it.
    pub(crate) fn insert_active(&mut self, key: K, value: V) -> Result<Option<V>> {
        self.check_key(&key)?;
        value.validate()?;
        let baseline = self.held_fixes();
        let result = self.insert_inner(key, value);
        debug_assert_eq!(self.held_fixes(), baseline, "insert leaked page fixes");
        result
    }

    fn insert_inner(&mut self, key: K, value: V) -> Result<Option<V>> {
        let v = self.info.active_version;
        let mut path = PagePath::full();
        path.attach_root(self.root_or_create()?);
        self.descend_live(&mut path, &key)?;
        let (existing, fits) = {
            let page = path.top().read();
            (page.find_live(&key, v), page.len() < page.capacity)
        };
        let mut previous = None;
        if let Some(pos) = existing {
            if !self.options.overwrite_duplicates {
                return Err(TreeError::DuplicateKey);
            }
            let mut page = path.top().write();
            if let MvbtEntries::Leaf(entries) = &mut page.entries {
                if entries[pos].versions.start == v {
                    return Ok(Some(std::mem::replace(&mut entries[pos].value, value)));
                }
                previous = Some(entries[pos].value.clone());
            }
        }
        let entry = LeafEntry {
            key,
            versions: VersionRange::open(v),
            value,
        };
        if fits {
            let mut page = path.top().write();
            if let MvbtEntries::Leaf(entries) = &mut page.entries {
                if let Some(pos) = existing {
                    entries[pos].versions.end = v;
                }
                let pos = entries.partition_point(|e| {
                    (&e.key, e.versions.start) < (&entry.key, entry.versions.start)
                });
                entries.insert(pos, entry);
            }
            return Ok(previous);
        }
        let content = {
            let page = path.top().read();
            let mut content = page.live_content(v);
            if let MvbtEntries::Leaf(entries) = &mut content {
                entries.retain(|e| e.key != entry.key);
            }
            content.merge_with(MvbtEntries::Leaf(vec![entry]));
            content
        };
        self.restructure(&mut path, content)?;
        Ok(previous)
    }

    /// Deletes `key` in the active version without committing it.
    pub(crate) fn delete_active(&mut self, key: &K) -> Result<Option<V>> {
        let baseline = self.held_fixes();
        let result = self.delete_inner(key);
        debug_assert_eq!(self.held_fixes(), baseline, "delete leaked page fixes");
        result
    }

    fn delete_inner(&mut self, key: &K) -> Result<Option<V>> {
        let Some(root) = self.root.clone() else {
            return Ok(None);
        };
        let v = self.info.active_version;
        let mut path = PagePath::full();
        path.attach_root(root);
        self.descend_live(&mut path, key)?;
        let removed = {
            let mut page = path.top().write();
            let pos = page.find_live(key, v);
            match (&mut page.entries, pos) {
                (MvbtEntries::Leaf(entries), Some(pos)) if entries[pos].versions.start == v => {
                    Some(entries.remove(pos).value)
                }
                (MvbtEntries::Leaf(entries), Some(pos)) => {
                    entries[pos].versions.end = v;
                    Some(entries[pos].value.clone())
                }
                _ => None,
            }
        };
        if removed.is_some() {
            self.check_underflow(&mut path)?;
        }
        Ok(removed)
    }

    /// Replaces the current page of `path` by pages holding `content`, which
    /// must be the page's live content after the pending change.
    fn restructure(
        &mut self,
        path: &mut PagePath<MvbtPage<K, V>>,
        content: MvbtEntries<K, V>,
    ) -> Result<()> {
        let page = path.ascend();
        if path.is_empty() {
            return self.restructure_root(page, content);
        }
        let v = self.info.active_version;
        let (height, capacity) = {
            let p = page.read();
            (p.height, p.capacity)
        };
        let limits = self.policy.thresholds(capacity);
        let mut content = content;
        let mut replaced = vec![page];
        if content.len() < limits.min_after_smo {
            if let Some((sibling, on_left)) = self.live_sibling(path.top(), &replaced[0])? {
                let weak = content.len() < limits.min_entries;
                content.merge_with(sibling.read().live_content(v));
                tracing::trace!(
                    target: "mvtree::merge",
                    page = replaced[0].id().0,
                    sibling = sibling.id().0,
                    entries = content.len(),
                    weak,
                    "merged with live sibling"
                );
                if weak {
                    self.stats.inc_weak_merges();
                } else {
                    self.stats.inc_strong_merges();
                }
                if on_left {
                    replaced.insert(0, sibling);
                } else {
                    replaced.push(sibling);
                }
            }
        }
        let min = replaced[0].read().range.keys.min.clone();
        let max = replaced[replaced.len() - 1].read().range.keys.max.clone();
        let keys = KeyRange::new(min, max);
        let removed: Vec<PageId> = replaced.iter().map(|p| p.id()).collect();
        let counts = partition_counts(content.len(), limits.max_after_smo);
        if counts.len() > 1 {
            self.stats.inc_key_splits();
        }
        let targets = self.lay_out(&mut replaced, content, &counts, &keys, height)?;
        let added: Vec<Router<K>> = targets
            .iter()
            .map(|t| Router {
                range: t.read().range.clone(),
                child: t.id(),
            })
            .collect();
        drop(targets);
        tracing::trace!(
            target: "mvtree::split",
            replaced = removed.len(),
            created = added.len(),
            height,
            version = v,
            "restructured page"
        );
        self.dispose(replaced)?;
        self.update_parent(path, &removed, added)
    }

    /// Fills pages with consecutive parts of `content`, reusing pages of
    /// `replaced` created in the active version. Reused pages are taken out
    /// of `replaced`.
    fn lay_out(
        &mut self,
        replaced: &mut Vec<PageHandle<K, V>>,
        content: MvbtEntries<K, V>,
        counts: &[usize],
        keys: &KeyRange<K>,
        height: u32,
    ) -> Result<Vec<PageHandle<K, V>>> {
        let v = self.info.active_version;
        let capacity = self.page_capacity(content.is_leaf());
        let parts = content.into_parts(counts);
        let ranges = part_ranges(keys, &parts);
        let (mut reusable, retained): (Vec<_>, Vec<_>) =
            replaced.drain(..).partition(|p| p.read().is_active(v));
        *replaced = retained;
        reusable.reverse();
        let mut targets = Vec::with_capacity(parts.len());
        for (part, range) in parts.into_iter().zip(ranges) {
            let range = MvKeyRange::open(range, v);
            match reusable.pop() {
                Some(page) => {
                    {
                        let mut p = page.write();
                        p.entries = part;
                        p.range = range;
                        p.root = false;
                    }
                    targets.push(page);
                }
                None => targets.push(self.cache.create_with(|id| MvbtPage {
                    id,
                    height,
                    root: false,
                    range,
                    capacity,
                    entries: part,
                })?),
            }
        }
        replaced.extend(reusable);
        Ok(targets)
    }

    /// Frees pages created in the active version and retires the others.
    fn dispose(&mut self, pages: Vec<PageHandle<K, V>>) -> Result<()> {
        let v = self.info.active_version;
        for page in pages {
            if page.read().is_active(v) {
                self.cache.delete(page)?;
                continue;
            }
            {
                let mut p = page.write();
                p.range.versions.end = v;
                p.root = false;
                p.end_live_entries(v);
            }
            self.stats.inc_version_splits();
            tracing::trace!(target: "mvtree::split", page = page.id().0, version = v, "retired page");
        }
        Ok(())
    }

    /// Live sibling sharing a key boundary with `page`, and whether it lies
    /// to the left.
    fn live_sibling(
        &self,
        parent: &PageHandle<K, V>,
        page: &PageHandle<K, V>,
    ) -> Result<Option<(PageHandle<K, V>, bool)>> {
        let v = self.info.active_version;
        let keys = page.read().range.keys.clone();
        let found = {
            let p = parent.read();
            match &p.entries {
                MvbtEntries::Index(routers) => {
                    let live = || {
                        routers
                            .iter()
                            .filter(|r| r.range.versions.contains(v) && r.child != page.id())
                    };
                    live()
                        .find(|r| r.range.keys.min == keys.max)
                        .map(|r| (r.child, false))
                        .or_else(|| {
                            live()
                                .find(|r| r.range.keys.max == keys.min)
                                .map(|r| (r.child, true))
                        })
                }
                MvbtEntries::Leaf(_) => None,
            }
        };
        match found {
            Some((child, on_left)) => Ok(Some((self.cache.fix(child)?, on_left))),
            None => Ok(None),
        }
    }

    /// Swaps the routers of `removed` pages in the current page of `path` for
    /// `added`, restructuring the parent when they do not fit.
    fn update_parent(
        &mut self,
        path: &mut PagePath<MvbtPage<K, V>>,
        removed: &[PageId],
        added: Vec<Router<K>>,
    ) -> Result<()> {
        let v = self.info.active_version;
        let parent = path.top().clone();
        let replaced = |r: &Router<K>| removed.contains(&r.child) && r.range.versions.is_alive();
        let fits = {
            let p = parent.read();
            let freed = match &p.entries {
                MvbtEntries::Index(routers) => routers
                    .iter()
                    .filter(|r| replaced(*r) && r.range.versions.start == v)
                    .count(),
                MvbtEntries::Leaf(_) => panic!("leaf page {} used as a parent", p.id),
            };
            p.len() - freed + added.len() <= p.capacity
        };
        if fits {
            {
                let mut p = parent.write();
                if let MvbtEntries::Index(routers) = &mut p.entries {
                    routers.retain(|r| !(replaced(r) && r.range.versions.start == v));
                    for r in routers.iter_mut().filter(|r| replaced(&**r)) {
                        r.range.versions.end = v;
                    }
                }
                p.entries.merge_with(MvbtEntries::Index(added));
            }
            drop(parent);
            return self.check_underflow(path);
        }
        let content = {
            let p = parent.read();
            let mut content = p.live_content(v);
            if let MvbtEntries::Index(routers) = &mut content {
                routers.retain(|r| !removed.contains(&r.child));
            }
            content.merge_with(MvbtEntries::Index(added));
            content
        };
        drop(parent);
        self.restructure(path, content)
    }

    /// Restructures the root page with `content` as its new live content.
    fn restructure_root(
        &mut self,
        page: PageHandle<K, V>,
        content: MvbtEntries<K, V>,
    ) -> Result<()> {
        let v = self.info.active_version;
        let (height, capacity, keys) = {
            let p = page.read();
            (p.height, p.capacity, p.range.keys.clone())
        };
        if content.is_empty() {
            self.set_root(None, 0)?;
            self.dispose(vec![page])?;
            tracing::trace!(target: "mvtree::merge", version = v, "tree emptied");
            return Ok(());
        }
        if let MvbtEntries::Index(routers) = &content {
            if routers.len() == 1 {
                let child = self.cache.fix(routers[0].child)?;
                let child_height = {
                    let mut c = child.write();
                    c.root = true;
                    c.height
                };
                self.set_root(Some(child.clone()), child_height)?;
                self.dispose(vec![page])?;
                self.stats.inc_height_decreases();
                tracing::trace!(target: "mvtree::merge", root = child.id().0, height = child_height, "collapsed root");
                let mut path = PagePath::full();
                path.attach_root(child);
                return self.check_root_underflow(&mut path);
            }
        }
        let limits = self.policy.thresholds(capacity);
        let counts = partition_counts(content.len(), limits.max_after_smo);
        if counts.len() == 1 {
            if page.read().is_active(v) {
                page.write().entries = content;
                return Ok(());
            }
            let new_root = self.cache.create_with(|id| MvbtPage {
                id,
                height,
                root: true,
                range: MvKeyRange::open(keys, v),
                capacity,
                entries: content,
            })?;
            self.set_root(Some(new_root), height)?;
            return self.dispose(vec![page]);
        }
        self.stats.inc_key_splits();
        let mut replaced = vec![page];
        let targets = self.lay_out(&mut replaced, content, &counts, &keys, height)?;
        let routers: Vec<Router<K>> = targets
            .iter()
            .map(|t| Router {
                range: t.read().range.clone(),
                child: t.id(),
            })
            .collect();
        drop(targets);
        let index_capacity = self.index_capacity;
        let new_root = self.cache.create_with(|id| MvbtPage {
            id,
            height: height + 1,
            root: true,
            range: MvKeyRange::open(keys, v),
            capacity: index_capacity,
            entries: MvbtEntries::Index(routers),
        })?;
        let root_id = new_root.id();
        self.set_root(Some(new_root), height + 1)?;
        self.dispose(replaced)?;
        self.stats.inc_height_increases();
        tracing::trace!(target: "mvtree::split", root = root_id.0, height = height + 1, "increased tree height");
        Ok(())
    }
}

impl<K: KeyCodec, V: ValCodec> UnderflowOps for MvbTree<K, V> {
    type Page = MvbtPage<K, V>;

    fn policy(&self) -> &dyn SmoPolicy {
        self.policy.as_ref()
    }

    /// Counts entries alive in the active version.
    fn fill(&self, page: &MvbtPage<K, V>) -> PageFill {
        PageFill {
            entries: page.live_count(self.info.active_version),
            capacity: page.capacity,
            root: page.root,
        }
    }

    fn underflows(&self, page: &MvbtPage<K, V>) -> bool {
        !page.root && page.live_count(self.info.active_version) < self.weak_minimum(page)
    }

    fn merge(&mut self, path: &mut PagePath<MvbtPage<K, V>>) -> Result<()> {
        let content = path.top().read().live_content(self.info.active_version);
        self.restructure(path, content)
    }

    fn check_root_underflow(&mut self, path: &mut PagePath<MvbtPage<K, V>>) -> Result<()> {
        let single_router = {
            let p = path.top().read();
            !p.is_leaf() && p.live_count(self.info.active_version) == 1
        };
        if !single_router {
            return Ok(());
        }
        let page = path.ascend();
        let content = page.read().live_content(self.info.active_version);
        self.restructure_root(page, content)
    }

    fn delete_root(&mut self, path: &mut PagePath<MvbtPage<K, V>>) -> Result<()> {
        let page = path.ascend();
        let empty = page.read().entries.empty_like();
        self.restructure_root(page, empty)
    }
}
