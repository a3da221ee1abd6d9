//! Low-level collaborators of the tree engine.
//!
//! Includes the fixed-size page storage and the page cache that fixes,
//! latches and evicts decoded pages.

/// Page storage backends.
///
/// Durable (or in-memory) read/write of fixed-size byte blocks keyed by page id.
pub mod io;

/// Page cache and the persisted tree info page.
pub mod pager;
