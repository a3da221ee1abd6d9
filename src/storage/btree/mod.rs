#![forbid(unsafe_code)]

//! Single-version B-tree built on the generic split/merge driver.

/// Page layout and encoding.
pub mod page;

mod ops;
mod tree;

pub use page::{BTreeEntries, BTreePage};
pub use tree::BTree;

#[cfg(test)]
mod tests;
