use smallvec::SmallVec;

use crate::primitives::pager::{PageCodec, PageRef};
use crate::types::PageId;

/// Pages that can appear in a [`PagePath`].
pub trait PathPage: PageCodec {
    /// Returns `true` if this page holds a router to `child`.
    fn references(&self, child: PageId) -> bool;
}

/// Root-to-current stack of fixed pages used by one tree operation.
///
/// A full path keeps every page from the root down and is required for
/// mutations. A latch-coupled path keeps only the current page and its
/// parent, which is enough for reads. The path owns the fixes it holds;
/// ascending hands the popped fix back to the caller.
pub struct PagePath<P: PathPage> {
    pages: SmallVec<[PageRef<P>; 8]>,
    full_path: bool,
    released: usize,
}

impl<P: PathPage> PagePath<P> {
    /// An empty path retaining every page.
    pub fn full() -> Self {
        Self {
            pages: SmallVec::new(),
            full_path: true,
            released: 0,
        }
    }

    /// An empty path holding at most the current page and its parent.
    pub fn latch_coupled() -> Self {
        Self {
            full_path: false,
            ..Self::full()
        }
    }

    /// Attaches the root; panics if the path is not empty.
    pub fn attach_root(&mut self, root: PageRef<P>) {
        assert!(
            self.pages.is_empty() && self.released == 0,
            "attach_root on a non-empty path"
        );
        self.pages.push(root);
    }

    /// Moves down to `child`, which must be referenced by the current page.
    pub fn descend(&mut self, child: PageRef<P>) {
        let current = self.top();
        debug_assert!(
            current.read().references(child.id()),
            "page {} is not a child of {}",
            child.id(),
            current.id()
        );
        self.pages.push(child);
        if !self.full_path && self.pages.len() > 2 {
            self.pages.remove(0);
            self.released += 1;
        }
    }

    /// Pops the current page and returns its fix; panics on an empty path.
    ///
    /// The new current page is the popped page's parent.
    pub fn ascend(&mut self) -> PageRef<P> {
        match self.pages.pop() {
            Some(page) => page,
            None => panic!("ascend on an empty path"),
        }
    }

    /// The page the operation is positioned on.
    pub fn current(&self) -> Option<&PageRef<P>> {
        self.pages.last()
    }

    /// The current page; panics on an empty path.
    pub fn top(&self) -> &PageRef<P> {
        match self.pages.last() {
            Some(page) => page,
            None => panic!("no current page on an empty path"),
        }
    }

    /// Parent of the current page, if still held.
    pub fn parent(&self) -> Option<&PageRef<P>> {
        let len = self.pages.len();
        (len >= 2).then(|| &self.pages[len - 2])
    }

    /// The root, if still held.
    pub fn root(&self) -> Option<&PageRef<P>> {
        if self.released == 0 {
            self.pages.first()
        } else {
            None
        }
    }

    /// Returns `true` if the current page is the root of the path.
    pub fn at_root(&self) -> bool {
        self.released == 0 && self.pages.len() == 1
    }

    /// Number of pages currently held.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns `true` if no page is held.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Depth of the current page below the root (root is 0).
    pub fn depth(&self) -> usize {
        (self.released + self.pages.len()).saturating_sub(1)
    }

    /// Root-to-current pairs of `(page, parent)`.
    pub fn iter(&self) -> impl Iterator<Item = (&PageRef<P>, Option<&PageRef<P>>)> + '_ {
        self.pages
            .iter()
            .enumerate()
            .map(|(i, page)| (page, i.checked_sub(1).map(|p| &self.pages[p])))
    }

    /// Current-to-root pairs of `(page, parent)`.
    pub fn iter_rev(&self) -> impl Iterator<Item = (&PageRef<P>, Option<&PageRef<P>>)> + '_ {
        self.pages
            .iter()
            .enumerate()
            .rev()
            .map(|(i, page)| (page, i.checked_sub(1).map(|p| &self.pages[p])))
    }

    /// Releases every held fix.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.released = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::primitives::io::{MemoryStorage, PageStorage};
    use crate::primitives::pager::PageCache;
    use crate::types::Result;

    struct Node {
        id: PageId,
        children: Vec<PageId>,
    }

    impl PageCodec for Node {
        fn page_id(&self) -> PageId {
            self.id
        }

        fn encode_page(&self, _buf: &mut [u8]) -> Result<()> {
            Ok(())
        }

        fn decode_page(id: PageId, _buf: &[u8]) -> Result<Self> {
            Ok(Self {
                id,
                children: Vec::new(),
            })
        }
    }

    impl PathPage for Node {
        fn references(&self, child: PageId) -> bool {
            self.children.contains(&child)
        }
    }

    fn chain(cache: &PageCache<Node>, depth: usize) -> Result<Vec<PageRef<Node>>> {
        let mut pages: Vec<PageRef<Node>> = Vec::new();
        for _ in 0..depth {
            let page = cache.create_with(|id| Node {
                id,
                children: Vec::new(),
            })?;
            if let Some(parent) = pages.last() {
                parent.write().children.push(page.id());
            }
            pages.push(page);
        }
        Ok(pages)
    }

    fn cache() -> Result<PageCache<Node>> {
        let storage: Arc<dyn PageStorage> = Arc::new(MemoryStorage::new(128)?);
        Ok(PageCache::new(storage, 16, false))
    }

    #[test]
    fn full_path_keeps_every_page() -> Result<()> {
        let cache = cache()?;
        let pages = chain(&cache, 4)?;
        let ids: Vec<_> = pages.iter().map(|p| p.id()).collect();
        let mut path = PagePath::full();
        let mut iter = pages.into_iter();
        path.attach_root(iter.next().unwrap());
        for page in iter {
            path.descend(page);
        }
        assert_eq!(path.len(), 4);
        assert_eq!(path.root().map(|p| p.id()), Some(ids[0]));
        assert_eq!(path.parent().map(|p| p.id()), Some(ids[2]));
        let pairs: Vec<_> = path
            .iter_rev()
            .map(|(page, parent)| (page.id(), parent.map(|p| p.id())))
            .collect();
        assert_eq!(pairs[0], (ids[3], Some(ids[2])));
        assert_eq!(pairs[3], (ids[0], None));
        assert_eq!(path.ascend().id(), ids[3]);
        assert_eq!(path.current().map(|p| p.id()), Some(ids[2]));
        path.clear();
        assert_eq!(cache.active_fixes(), 0);
        Ok(())
    }

    #[test]
    fn latch_coupled_path_releases_ancestors() -> Result<()> {
        let cache = cache()?;
        let pages = chain(&cache, 5)?;
        let mut path = PagePath::latch_coupled();
        let mut iter = pages.into_iter();
        path.attach_root(iter.next().unwrap());
        for page in iter {
            path.descend(page);
            assert!(path.len() <= 2);
        }
        assert_eq!(path.depth(), 4);
        assert!(path.root().is_none());
        assert_eq!(cache.active_fixes(), 2);
        drop(path);
        assert_eq!(cache.active_fixes(), 0);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "non-empty path")]
    fn attach_root_twice_panics() {
        let cache = cache().unwrap();
        let pages = chain(&cache, 2).unwrap();
        let mut path = PagePath::full();
        for page in pages {
            path.attach_root(page);
        }
    }

    #[test]
    #[should_panic(expected = "empty path")]
    fn ascend_on_empty_path_panics() {
        let mut path = PagePath::<Node>::full();
        let _ = path.ascend();
    }
}
