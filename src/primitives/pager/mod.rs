#![forbid(unsafe_code)]

//! Page cache collaborator.
//!
//! Pages are decoded once into their in-memory form `P` and kept resident
//! while fixed. A fix is represented by a [`PageRef`]; dropping the ref
//! unfixes the page, so every fix is released exactly once.

mod cache;
mod frame;
mod meta;

pub use cache::{CacheStats, PageCache, PageRef, ReadLatch};
pub use meta::TreeInfo;

use crate::types::{PageId, Result};

/// Conversion between a decoded page and its fixed-size byte image.
pub trait PageCodec: Sized + Send + Sync + 'static {
    /// Identifier of the page.
    fn page_id(&self) -> PageId;
    /// Encodes the page into `buf`, which is exactly one page long.
    ///
    /// The checksum and page-number header fields are stamped by the cache.
    fn encode_page(&self, buf: &mut [u8]) -> Result<()>;
    /// Decodes a page image previously produced by [`PageCodec::encode_page`].
    fn decode_page(id: PageId, buf: &[u8]) -> Result<Self>;
}
