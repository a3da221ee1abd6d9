//! Concurrent multiversion tree: a transient marker log in front of a
//! transactional multiversion tree.

/// Marker keys and values of the transient log.
pub mod log;

mod tree;

pub use log::{Marker, TransientKey};
pub use tree::CmvbTree;

#[cfg(test)]
mod tests;
