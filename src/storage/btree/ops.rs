//! Split and merge hooks of the single-version tree.

use super::page::{BTreeEntries, BTreePage};
use super::tree::{BTree, PageHandle};
use crate::storage::path::PagePath;
use crate::storage::policy::{PageFill, SmoPolicy};
use crate::storage::smo::{SplitOps, UnderflowOps};
use crate::types::{KeyCodec, KeyRange, PageId, Result, ValCodec};

fn slot_in(parent: &BTreePage<impl KeyCodec, impl ValCodec>, child: PageId) -> usize {
    match parent.slot_of(child) {
        Some(slot) => slot,
        None => panic!("page {child} missing from its parent {}", parent.id),
    }
}

fn router_child<K: KeyCodec, V: ValCodec>(parent: &BTreePage<K, V>, slot: usize) -> PageId {
    match &parent.entries {
        BTreeEntries::Index(routers) => routers[slot].1,
        BTreeEntries::Leaf(_) => panic!("router lookup on leaf page {}", parent.id),
    }
}

impl<K: KeyCodec, V: ValCodec> UnderflowOps for BTree<K, V> {
    type Page = BTreePage<K, V>;

    fn policy(&self) -> &dyn SmoPolicy {
        self.policy.as_ref()
    }

    fn fill(&self, page: &BTreePage<K, V>) -> PageFill {
        PageFill {
            entries: page.len(),
            capacity: page.capacity,
            root: page.root,
        }
    }

    /// Non-root index pages keep at least two routers, so a page never has
    /// to absorb a sibling while empty.
    fn underflows(&self, page: &BTreePage<K, V>) -> bool {
        !page.root
            && (self.policy.is_underflow(&self.fill(page)) || (!page.is_leaf() && page.len() < 2))
    }

    fn merge(&mut self, path: &mut PagePath<BTreePage<K, V>>) -> Result<()> {
        let page = path.ascend();
        let (slot, siblings) = {
            let p = path.top().read();
            (slot_in(&p, page.id()), p.len())
        };
        if siblings < 2 {
            if !page.read().is_empty() {
                return Ok(());
            }
            if let BTreeEntries::Index(routers) = &mut path.top().write().entries {
                routers.remove(slot);
            }
            self.cache.delete(page)?;
            return self.check_underflow(path);
        }
        let (left, right, right_slot) = {
            let parent = path.top().read();
            if slot + 1 < siblings {
                let sibling = self.cache.fix(router_child(&parent, slot + 1))?;
                (page, sibling, slot + 1)
            } else {
                let sibling = self.cache.fix(router_child(&parent, slot - 1))?;
                (sibling, page, slot)
            }
        };
        let total = left.read().len() + right.read().len();
        let limits = self.policy.thresholds(left.read().capacity);
        if total <= limits.max_after_smo {
            let (moved, max) = {
                let mut r = right.write();
                (r.split_off(0), r.range.max.clone())
            };
            {
                let mut l = left.write();
                l.append(moved);
                l.range.max = max;
            }
            if let BTreeEntries::Index(routers) = &mut path.top().write().entries {
                routers.remove(right_slot);
            }
            tracing::trace!(
                target: "mvtree::merge",
                survivor = left.id().0,
                absorbed = right.id().0,
                entries = total,
                "merged siblings"
            );
            drop(left);
            self.cache.delete(right)?;
            self.stats.inc_merges();
            // the parent lost a router; no other handle may pin it while it is repaired
            return self.check_underflow(path);
        }
        let separator = {
            let mut l = left.write();
            let mut r = right.write();
            let tail = r.split_off(0);
            l.append(tail);
            let upper = l.split_off(total / 2);
            r.entries = upper;
            let separator = match r.first_key() {
                Some(key) => key.clone(),
                None => panic!("redistribution left page {} empty", r.id),
            };
            l.range.max = separator.clone();
            r.range.min = separator.clone();
            separator
        };
        if let BTreeEntries::Index(routers) = &mut path.top().write().entries {
            routers[right_slot].0 = separator;
        }
        tracing::trace!(
            target: "mvtree::merge",
            left = left.id().0,
            right = right.id().0,
            entries = total,
            "redistributed siblings"
        );
        self.stats.inc_redistributions();
        Ok(())
    }

    fn check_root_underflow(&mut self, path: &mut PagePath<BTreePage<K, V>>) -> Result<()> {
        loop {
            let only_child = match &path.top().read().entries {
                BTreeEntries::Index(routers) if routers.len() == 1 => routers[0].1,
                _ => return Ok(()),
            };
            let old_root = path.ascend();
            let child = self.cache.fix(only_child)?;
            let height = {
                let mut c = child.write();
                c.root = true;
                c.height
            };
            self.set_root(Some(child.clone()), height)?;
            self.cache.delete(old_root)?;
            self.stats.inc_height_decreases();
            tracing::trace!(target: "mvtree::merge", root = child.id().0, height, "collapsed root");
            path.attach_root(child);
        }
    }

    fn delete_root(&mut self, path: &mut PagePath<BTreePage<K, V>>) -> Result<()> {
        let old_root = path.ascend();
        self.set_root(None, 0)?;
        self.cache.delete(old_root)
    }
}

impl<K: KeyCodec, V: ValCodec> SplitOps for BTree<K, V> {
    type Key = K;

    fn increase_height(&mut self, path: &mut PagePath<BTreePage<K, V>>) -> Result<()> {
        let old_root = path.ascend();
        let (height, range) = {
            let mut p = old_root.write();
            p.root = false;
            (p.height, p.range.clone())
        };
        let capacity = self.index_capacity;
        let child = old_root.id();
        let new_root = self.cache.create_with(|id| {
            let mut page = BTreePage::new_index(id, height + 1, range.clone(), capacity);
            page.root = true;
            page.entries = BTreeEntries::Index(vec![(range.min.clone(), child)]);
            page
        })?;
        self.set_root(Some(new_root.clone()), height + 1)?;
        self.stats.inc_height_increases();
        tracing::trace!(
            target: "mvtree::split",
            root = new_root.id().0,
            height = height + 1,
            "increased tree height"
        );
        path.attach_root(new_root);
        path.descend(old_root);
        Ok(())
    }

    fn split_space_ensured(&mut self, path: &mut PagePath<BTreePage<K, V>>, key: &K) -> Result<()> {
        let page: PageHandle<K, V> = path.ascend();
        let (upper, separator, sibling_range, height, capacity) = {
            let mut p = page.write();
            let mid = p.len() / 2;
            let upper = p.split_off(mid);
            let separator = match &upper {
                BTreeEntries::Leaf(e) => e.first().map(|(k, _)| k.clone()),
                BTreeEntries::Index(e) => e.first().map(|(k, _)| k.clone()),
            };
            let Some(separator) = separator else {
                panic!("split of page {} with fewer than two entries", p.id);
            };
            let sibling_range = KeyRange::new(separator.clone(), p.range.max.clone());
            p.range.max = separator.clone();
            (upper, separator, sibling_range, p.height, p.capacity)
        };
        let sibling = self.cache.create_with(|id| BTreePage {
            id,
            height,
            root: false,
            range: sibling_range,
            capacity,
            entries: upper,
        })?;
        {
            let mut parent = path.top().write();
            let slot = slot_in(&parent, page.id());
            if let BTreeEntries::Index(routers) = &mut parent.entries {
                routers.insert(slot + 1, (separator.clone(), sibling.id()));
            }
        }
        self.stats.inc_splits();
        tracing::trace!(
            target: "mvtree::split",
            page = page.id().0,
            sibling = sibling.id().0,
            height,
            "split page"
        );
        if key >= &separator {
            path.descend(sibling);
        } else {
            path.descend(page);
        }
        Ok(())
    }
}
