//! Page-oriented B-trees and multiversion B-trees.
//!
//! The crate is layered bottom-up: [`types`] holds identifiers, codecs and the
//! error enum, [`primitives`] the page storage and page cache collaborators,
//! and [`storage`] the split/merge engine together with the single-version
//! [`storage::BTree`], the multiversion [`storage::MvbTree`] /
//! [`storage::TmvbTree`] and the concurrent [`storage::CmvbTree`].

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::{
    BTree, CmvbTree, MvbTree, PolicyKind, TmvbTree, Transaction, TreeOptions, TreeStats,
    TreeStatsSnapshot, TxnState,
};
pub use types::{PageId, Result, TreeError, Version};
