#![forbid(unsafe_code)]

//! Identifiers, error types, and on-disk page constants shared by every tree.

use std::fmt;

/// Page checksum helpers.
pub mod checksum;
/// Key and value codecs plus key/version ranges.
pub mod key;

pub use checksum::page_crc32;
pub use key::{KeyCodec, KeyRange, MvKeyRange, ValCodec, VersionRange};

/// Identifier of a fixed-size page in the page storage.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

impl PageId {
    /// The reserved "null" page. Never allocated; used to encode "no page".
    pub const NULL: PageId = PageId(0);

    /// Returns `true` for the null page.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version number of a committed (or in-flight) multiversion state.
pub type Version = u64;

/// Exclusive end version meaning "still alive".
pub const VERSION_MAX: Version = u64::MAX;

/// Errors surfaced by the tree engine.
///
/// Invariant violations inside the engine are not represented here; they
/// panic, because they indicate a defect rather than a caller mistake.
#[derive(thiserror::Error, Debug)]
pub enum TreeError {
    /// Underlying storage failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A page image failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// An argument or configuration value was rejected.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Configuration text could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),
    /// Insert of an existing key while overwriting is disabled.
    #[error("duplicate key")]
    DuplicateKey,
    /// The transaction was already committed or aborted.
    #[error("transaction already terminated")]
    TransactionClosed,
    /// A mutation was attempted through a read-only transaction.
    #[error("transaction is read-only")]
    ReadOnlyTransaction,
    /// A second writer was started on a single-writer tree.
    #[error("another write transaction is in flight")]
    ConcurrentWriter,
    /// The key was modified by a transaction the writer cannot see.
    #[error("write-write conflict")]
    WriteConflict,
    /// The requested version has not been committed yet.
    #[error("version {0} is not committed")]
    VersionNotCommitted(Version),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, TreeError>;

pub mod page {
    //! Common page header shared by every page kind.
    //!
    //! ```text
    //! [kind u8][flags u8][height u16][entry count u16][capacity u16][crc32 u32][page no u32]
    //! ```

    use core::convert::TryFrom;
    use core::ops::Range;

    use super::{Result, TreeError};

    /// Length of the common page header in bytes.
    pub const PAGE_HDR_LEN: usize = 16;
    /// Default page size in bytes.
    pub const DEFAULT_PAGE_SIZE: usize = 4096;
    /// Smallest page size accepted by the storage layer.
    pub const MIN_PAGE_SIZE: usize = 128;

    /// Flag bit: the page was the root when last written.
    pub const FLAG_ROOT: u8 = 0x01;

    pub const KIND: usize = 0;
    pub const FLAGS: usize = 1;
    pub const HEIGHT: Range<usize> = 2..4;
    pub const ENTRY_COUNT: Range<usize> = 4..6;
    pub const CAPACITY: Range<usize> = 6..8;
    pub const CRC32: Range<usize> = 8..12;
    pub const PAGE_NO: Range<usize> = 12..16;

    /// Type tag stored in the first header byte.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum PageKind {
        /// Tree info page.
        Info = 1,
        /// Single-version leaf.
        BTreeLeaf = 2,
        /// Single-version index page.
        BTreeIndex = 3,
        /// Multiversion leaf.
        MvbtLeaf = 4,
        /// Multiversion index page.
        MvbtIndex = 5,
    }

    impl PageKind {
        /// Returns the raw tag.
        pub const fn as_u8(self) -> u8 {
            self as u8
        }
    }

    impl TryFrom<u8> for PageKind {
        type Error = TreeError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                1 => Ok(PageKind::Info),
                2 => Ok(PageKind::BTreeLeaf),
                3 => Ok(PageKind::BTreeIndex),
                4 => Ok(PageKind::MvbtLeaf),
                5 => Ok(PageKind::MvbtIndex),
                _ => Err(TreeError::Corruption("unknown page kind")),
            }
        }
    }

    /// Decoded common header.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        /// Page type tag.
        pub kind: PageKind,
        /// Setting bits (see [`FLAG_ROOT`]).
        pub flags: u8,
        /// Height of the page; 1 is a leaf.
        pub height: u16,
        /// Number of occupied entry slots.
        pub entry_count: u16,
        /// Number of entry slots the page may use.
        pub capacity: u16,
    }

    impl PageHeader {
        /// Writes the header into the first [`PAGE_HDR_LEN`] bytes of `buf`.
        ///
        /// The checksum and page-number fields are filled in by the page cache.
        pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
            if buf.len() < PAGE_HDR_LEN {
                return Err(TreeError::Invalid("page buffer shorter than header"));
            }
            buf[KIND] = self.kind.as_u8();
            buf[FLAGS] = self.flags;
            buf[HEIGHT].copy_from_slice(&self.height.to_be_bytes());
            buf[ENTRY_COUNT].copy_from_slice(&self.entry_count.to_be_bytes());
            buf[CAPACITY].copy_from_slice(&self.capacity.to_be_bytes());
            Ok(())
        }

        /// Parses the header from `buf`.
        pub fn decode(buf: &[u8]) -> Result<Self> {
            if buf.len() < PAGE_HDR_LEN {
                return Err(TreeError::Corruption("page shorter than header"));
            }
            let kind = PageKind::try_from(buf[KIND])?;
            let height = u16::from_be_bytes([buf[HEIGHT.start], buf[HEIGHT.start + 1]]);
            let entry_count =
                u16::from_be_bytes([buf[ENTRY_COUNT.start], buf[ENTRY_COUNT.start + 1]]);
            let capacity = u16::from_be_bytes([buf[CAPACITY.start], buf[CAPACITY.start + 1]]);
            Ok(Self {
                kind,
                flags: buf[FLAGS],
                height,
                entry_count,
                capacity,
            })
        }

        /// Returns `true` when the root flag is set.
        pub fn is_root(&self) -> bool {
            self.flags & FLAG_ROOT != 0
        }
    }

    /// Converts an entry count to the on-disk width.
    pub fn entry_count_u16(count: usize) -> Result<u16> {
        u16::try_from(count).map_err(|_| TreeError::Invalid("entry count exceeds u16"))
    }

    /// Converts a height to the on-disk width.
    pub fn height_u16(height: u32) -> Result<u16> {
        u16::try_from(height).map_err(|_| TreeError::Invalid("tree height exceeds u16"))
    }

    /// Reads a big-endian `u64` at `off`.
    pub fn read_u64(buf: &[u8], off: usize) -> u64 {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&buf[off..off + 8]);
        u64::from_be_bytes(arr)
    }

    /// Writes a big-endian `u64` at `off`.
    pub fn write_u64(buf: &mut [u8], off: usize, value: u64) {
        buf[off..off + 8].copy_from_slice(&value.to_be_bytes());
    }

    /// Reads a big-endian `u32` at `off`.
    pub fn read_u32(buf: &[u8], off: usize) -> u32 {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(&buf[off..off + 4]);
        u32::from_be_bytes(arr)
    }

    /// Writes a big-endian `u32` at `off`.
    pub fn write_u32(buf: &mut [u8], off: usize, value: u32) {
        buf[off..off + 4].copy_from_slice(&value.to_be_bytes());
    }

}
