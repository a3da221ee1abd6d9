//! Generic structure-modification driver.
//!
//! Trees plug their page-specific behaviour into [`UnderflowOps`] and
//! [`SplitOps`]; the provided methods walk the [`PagePath`] and decide when
//! those hooks run.

use super::path::{PagePath, PathPage};
use super::policy::{PageFill, SmoPolicy};
use crate::types::Result;

/// Underflow handling shared by single-version and multiversion trees.
pub trait UnderflowOps {
    /// Page type of the tree.
    type Page: PathPage;

    /// Policy deciding occupancy bounds.
    fn policy(&self) -> &dyn SmoPolicy;

    /// Occupancy of `page` as counted by this tree.
    fn fill(&self, page: &Self::Page) -> PageFill;

    /// Repairs the underflowing non-root current page of `path`.
    fn merge(&mut self, path: &mut PagePath<Self::Page>) -> Result<()>;

    /// Repairs a non-empty root, typically by collapsing a single-child index root.
    fn check_root_underflow(&mut self, path: &mut PagePath<Self::Page>) -> Result<()>;

    /// Removes an empty root, leaving the tree empty.
    fn delete_root(&mut self, path: &mut PagePath<Self::Page>) -> Result<()>;

    /// Whether the non-root `page` must be repaired.
    fn underflows(&self, page: &Self::Page) -> bool {
        self.policy().is_underflow(&self.fill(page))
    }

    /// Checks the current page of `path` after entries were removed from it.
    fn check_underflow(&mut self, path: &mut PagePath<Self::Page>) -> Result<()> {
        let Some(current) = path.current() else {
            return Ok(());
        };
        let (fill, underflow) = {
            let page = current.read();
            (self.fill(&page), self.underflows(&page))
        };
        if fill.root {
            if fill.entries == 0 {
                self.delete_root(path)
            } else {
                self.check_root_underflow(path)
            }
        } else if underflow {
            self.merge(path)
        } else {
            Ok(())
        }
    }
}

/// Split driver for trees whose height grows by promoting a new root.
pub trait SplitOps: UnderflowOps {
    /// Key type used to choose the half the walk continues in.
    type Key;

    /// Adds a level above the root; the path becomes `[new root, old root]`.
    fn increase_height(&mut self, path: &mut PagePath<Self::Page>) -> Result<()>;

    /// Splits the non-root current page whose parent has room for one router,
    /// leaving the path on whichever half covers `key`.
    fn split_space_ensured(&mut self, path: &mut PagePath<Self::Page>, key: &Self::Key)
        -> Result<()>;

    /// Splits the current page, first making room in its ancestors.
    fn split(&mut self, path: &mut PagePath<Self::Page>, key: &Self::Key) -> Result<()> {
        if path.at_root() {
            self.increase_height(path)?;
            return self.split(path, key);
        }
        let parent_full = match path.parent() {
            Some(parent) => {
                let fill = self.fill(&parent.read());
                self.policy().is_about_to_overflow(&fill)
            }
            None => panic!("split of a non-root page without its parent"),
        };
        if parent_full {
            let child = path.ascend();
            self.split(path, key)?;
            path.descend(child);
        }
        self.split_space_ensured(path, key)
    }
}
