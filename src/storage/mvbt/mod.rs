#![forbid(unsafe_code)]

//! Multiversion B-tree.

/// Page layout and encoding.
pub mod page;

mod ops;
mod tmvbt;
mod tree;

pub use page::{LeafEntry, MvbtEntries, MvbtPage, Router};
pub use tmvbt::TmvbTree;
pub use tree::MvbTree;
