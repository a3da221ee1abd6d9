//! Tree structures and the machinery they share.
//!
//! The split/merge driver in [`smo`] is generic over the page type; the
//! single-version [`BTree`] and the multiversion [`MvbTree`] plug into it.
//! [`TmvbTree`] adds transactions on top of the multiversion tree and
//! [`CmvbTree`] pairs it with a transient log for concurrent writers.

/// Single-version B-tree.
pub mod btree;

/// Concurrent multiversion tree over a transient log and a stable tree.
pub mod cmvbt;

/// Multiversion B-tree and its transactional wrapper.
pub mod mvbt;

/// Tree configuration.
pub mod options;

/// Root-to-leaf page paths.
pub mod path;

/// Occupancy policies deciding when pages split and merge.
pub mod policy;

/// Generic split and merge driver.
pub mod smo;

/// Structure-modification counters.
pub mod stats;

/// Transactions and their identifiers.
pub mod txn;

pub use btree::BTree;
pub use cmvbt::CmvbTree;
pub use mvbt::{MvbTree, TmvbTree};
pub use options::{PolicyKind, TreeOptions};
pub use stats::{TreeStats, TreeStatsSnapshot};
pub use txn::{Transaction, TxnState};
