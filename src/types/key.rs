use std::cmp::Ordering;
use std::fmt;

use super::{page, PageId, Result, TreeError, Version, VERSION_MAX};

/// Trait implemented by key types stored in the trees.
///
/// Keys encode to a fixed number of bytes so that page capacity can be derived
/// from the page size alone. The maximum key is a sentinel bounding the top of
/// the key space; it can be used in ranges but cannot itself be stored.
pub trait KeyCodec: Ord + Clone + fmt::Debug + Send + Sync + 'static {
    /// Encoded width in bytes.
    const ENCODED_LEN: usize;

    /// Smallest key of the key space.
    fn min_key() -> Self;

    /// Upper sentinel of the key space.
    fn max_key() -> Self;

    /// Immediate successor, saturating at [`KeyCodec::max_key`].
    fn next_key(&self) -> Self;

    /// Immediate predecessor, saturating at [`KeyCodec::min_key`].
    fn prev_key(&self) -> Self;

    /// Writes exactly [`KeyCodec::ENCODED_LEN`] bytes into `out`.
    fn encode_key(&self, out: &mut [u8]);

    /// Decodes a key from exactly [`KeyCodec::ENCODED_LEN`] bytes.
    fn decode_key(src: &[u8]) -> Result<Self>;
}

/// Trait implemented by values stored in leaf pages.
pub trait ValCodec: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// Encoded width in bytes.
    const ENCODED_LEN: usize;

    /// Writes exactly [`ValCodec::ENCODED_LEN`] bytes into `out`.
    fn encode_val(&self, out: &mut [u8]) -> Result<()>;

    /// Decodes a value from exactly [`ValCodec::ENCODED_LEN`] bytes.
    fn decode_val(src: &[u8]) -> Result<Self>;

    /// Rejects values that cannot be encoded in a fixed slot.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

macro_rules! int_key_codec {
    ($ty:ty, $len:expr) => {
        impl KeyCodec for $ty {
            const ENCODED_LEN: usize = $len;

            fn min_key() -> Self {
                <$ty>::MIN
            }

            fn max_key() -> Self {
                <$ty>::MAX
            }

            fn next_key(&self) -> Self {
                self.saturating_add(1)
            }

            fn prev_key(&self) -> Self {
                self.saturating_sub(1)
            }

            fn encode_key(&self, out: &mut [u8]) {
                out[..$len].copy_from_slice(&self.to_be_bytes());
            }

            fn decode_key(src: &[u8]) -> Result<Self> {
                if src.len() < $len {
                    return Err(TreeError::Corruption("integer key truncated"));
                }
                let mut arr = [0u8; $len];
                arr.copy_from_slice(&src[..$len]);
                Ok(<$ty>::from_be_bytes(arr))
            }
        }

        impl ValCodec for $ty {
            const ENCODED_LEN: usize = $len;

            fn encode_val(&self, out: &mut [u8]) -> Result<()> {
                out[..$len].copy_from_slice(&self.to_be_bytes());
                Ok(())
            }

            fn decode_val(src: &[u8]) -> Result<Self> {
                if src.len() < $len {
                    return Err(TreeError::Corruption("integer value truncated"));
                }
                let mut arr = [0u8; $len];
                arr.copy_from_slice(&src[..$len]);
                Ok(<$ty>::from_be_bytes(arr))
            }
        }
    };
}

int_key_codec!(u32, 4);
int_key_codec!(u64, 8);
int_key_codec!(i64, 8);

/// Longest string value that fits in a slot.
pub const MAX_STRING_VALUE_LEN: usize = 62;

impl ValCodec for String {
    const ENCODED_LEN: usize = 2 + MAX_STRING_VALUE_LEN;

    fn encode_val(&self, out: &mut [u8]) -> Result<()> {
        self.validate()?;
        let bytes = self.as_bytes();
        out[..2].copy_from_slice(&(bytes.len() as u16).to_be_bytes());
        out[2..2 + bytes.len()].copy_from_slice(bytes);
        out[2 + bytes.len()..Self::ENCODED_LEN].fill(0);
        Ok(())
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        if src.len() < Self::ENCODED_LEN {
            return Err(TreeError::Corruption("string value truncated"));
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if len > MAX_STRING_VALUE_LEN {
            return Err(TreeError::Corruption("string value length out of range"));
        }
        String::from_utf8(src[2..2 + len].to_vec())
            .map_err(|_| TreeError::Corruption("string value is not utf-8"))
    }

    fn validate(&self) -> Result<()> {
        if self.len() > MAX_STRING_VALUE_LEN {
            return Err(TreeError::Invalid("string value exceeds slot size"));
        }
        Ok(())
    }
}

impl ValCodec for PageId {
    const ENCODED_LEN: usize = 8;

    fn encode_val(&self, out: &mut [u8]) -> Result<()> {
        page::write_u64(out, 0, self.0);
        Ok(())
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        if src.len() < 8 {
            return Err(TreeError::Corruption("page id truncated"));
        }
        Ok(PageId(page::read_u64(src, 0)))
    }
}

/// Half-open key interval `[min, max)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange<K> {
    /// Inclusive lower bound.
    pub min: K,
    /// Exclusive upper bound.
    pub max: K,
}

impl<K: KeyCodec> KeyRange<K> {
    /// Creates `[min, max)`.
    pub fn new(min: K, max: K) -> Self {
        debug_assert!(min <= max, "inverted key range");
        Self { min, max }
    }

    /// The whole key space.
    pub fn full() -> Self {
        Self::new(K::min_key(), K::max_key())
    }

    /// Returns `true` when `key` lies inside the range.
    pub fn contains(&self, key: &K) -> bool {
        &self.min <= key && key < &self.max
    }

    /// Returns `true` when the ranges share at least one key.
    pub fn overlaps(&self, other: &KeyRange<K>) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// Returns `true` when `other` starts exactly where `self` ends or vice versa.
    pub fn is_adjacent(&self, other: &KeyRange<K>) -> bool {
        self.max == other.min || other.max == self.min
    }

    /// Smallest range covering two adjacent ranges.
    pub fn union(&self, other: &KeyRange<K>) -> KeyRange<K> {
        let min = if self.min <= other.min {
            self.min.clone()
        } else {
            other.min.clone()
        };
        let max = if self.max >= other.max {
            self.max.clone()
        } else {
            other.max.clone()
        };
        KeyRange { min, max }
    }

    /// Splits at `separator`, returning `[min, sep)` and `[sep, max)`.
    pub fn split_at(&self, separator: &K) -> (KeyRange<K>, KeyRange<K>) {
        debug_assert!(self.contains(separator) || separator == &self.min);
        (
            KeyRange::new(self.min.clone(), separator.clone()),
            KeyRange::new(separator.clone(), self.max.clone()),
        )
    }

    /// Encoded width of a range.
    pub const fn encoded_len() -> usize {
        2 * K::ENCODED_LEN
    }

    /// Writes `min` then `max`.
    pub fn encode(&self, out: &mut [u8]) {
        self.min.encode_key(&mut out[..K::ENCODED_LEN]);
        self.max
            .encode_key(&mut out[K::ENCODED_LEN..2 * K::ENCODED_LEN]);
    }

    /// Reads a range written by [`KeyRange::encode`].
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < Self::encoded_len() {
            return Err(TreeError::Corruption("key range truncated"));
        }
        let min = K::decode_key(&src[..K::ENCODED_LEN])?;
        let max = K::decode_key(&src[K::ENCODED_LEN..2 * K::ENCODED_LEN])?;
        if min > max {
            return Err(TreeError::Corruption("inverted key range"));
        }
        Ok(Self { min, max })
    }
}

/// Half-open version interval `[start, end)`; `end == VERSION_MAX` means alive.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VersionRange {
    /// First version at which the item is visible.
    pub start: Version,
    /// First version at which the item is no longer visible.
    pub end: Version,
}

impl VersionRange {
    /// Encoded width.
    pub const ENCODED_LEN: usize = 16;

    /// `[start, ∞)`.
    pub const fn open(start: Version) -> Self {
        Self {
            start,
            end: VERSION_MAX,
        }
    }

    /// `[start, end)`.
    pub const fn new(start: Version, end: Version) -> Self {
        Self { start, end }
    }

    /// Returns `true` if `version` lies in the interval.
    pub fn contains(&self, version: Version) -> bool {
        self.start <= version && version < self.end
    }

    /// Returns `true` while no end version has been assigned.
    pub fn is_alive(&self) -> bool {
        self.end == VERSION_MAX
    }

    /// Returns `true` for a superseded-in-the-same-version interval.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Writes `start` then `end`.
    pub fn encode(&self, out: &mut [u8]) {
        page::write_u64(out, 0, self.start);
        page::write_u64(out, 8, self.end);
    }

    /// Reads an interval written by [`VersionRange::encode`].
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < Self::ENCODED_LEN {
            return Err(TreeError::Corruption("version range truncated"));
        }
        Ok(Self {
            start: page::read_u64(src, 0),
            end: page::read_u64(src, 8),
        })
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_alive() {
            write!(f, "[{}, ∞)", self.start)
        } else {
            write!(f, "[{}, {})", self.start, self.end)
        }
    }
}

/// Key range annotated with the version interval during which it is valid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MvKeyRange<K> {
    /// Covered keys.
    pub keys: KeyRange<K>,
    /// Validity interval.
    pub versions: VersionRange,
}

impl<K: KeyCodec> MvKeyRange<K> {
    /// Creates a range valid from `start` on.
    pub fn open(keys: KeyRange<K>, start: Version) -> Self {
        Self {
            keys,
            versions: VersionRange::open(start),
        }
    }

    /// Returns `true` if the range covers `key` at `version`.
    pub fn contains(&self, key: &K, version: Version) -> bool {
        self.keys.contains(key) && self.versions.contains(version)
    }

    /// Encoded width.
    pub const fn encoded_len() -> usize {
        KeyRange::<K>::encoded_len() + VersionRange::ENCODED_LEN
    }

    /// Writes the key range followed by the version range.
    pub fn encode(&self, out: &mut [u8]) {
        let split = KeyRange::<K>::encoded_len();
        self.keys.encode(&mut out[..split]);
        self.versions.encode(&mut out[split..split + VersionRange::ENCODED_LEN]);
    }

    /// Reads a range written by [`MvKeyRange::encode`].
    pub fn decode(src: &[u8]) -> Result<Self> {
        let split = KeyRange::<K>::encoded_len();
        if src.len() < Self::encoded_len() {
            return Err(TreeError::Corruption("versioned key range truncated"));
        }
        Ok(Self {
            keys: KeyRange::decode(&src[..split])?,
            versions: VersionRange::decode(&src[split..split + VersionRange::ENCODED_LEN])?,
        })
    }
}

/// Orders ranges by their lower key, then by start version.
pub fn cmp_mv_ranges<K: KeyCodec>(a: &MvKeyRange<K>, b: &MvKeyRange<K>) -> Ordering {
    a.keys
        .min
        .cmp(&b.keys.min)
        .then(a.versions.start.cmp(&b.versions.start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_range_split_and_union() {
        let range = KeyRange::new(0u64, 100);
        let (left, right) = range.split_at(&40);
        assert!(left.contains(&39));
        assert!(!left.contains(&40));
        assert!(right.contains(&40));
        assert!(left.is_adjacent(&right));
        assert_eq!(left.union(&right), range);
    }

    #[test]
    fn signed_keys_saturate() {
        assert_eq!(i64::MAX.next_key(), i64::MAX);
        assert_eq!(i64::MIN.prev_key(), i64::MIN);
        assert_eq!(5i64.next_key(), 6);
        let mut buf = [0u8; 8];
        (-3i64).encode_key(&mut buf);
        assert_eq!(i64::decode_key(&buf).unwrap(), -3);
    }

    #[test]
    fn version_range_membership() {
        let open = VersionRange::open(3);
        assert!(open.contains(3));
        assert!(open.contains(1_000));
        assert!(!open.contains(2));
        let closed = VersionRange::new(3, 5);
        assert!(closed.contains(4));
        assert!(!closed.contains(5));
        assert!(VersionRange::new(4, 4).is_empty());
    }

    #[test]
    fn string_values_reject_oversized_payloads() {
        let long = "x".repeat(MAX_STRING_VALUE_LEN + 1);
        assert!(matches!(long.validate(), Err(TreeError::Invalid(_))));
        let mut buf = vec![0u8; String::ENCODED_LEN];
        "hello".to_string().encode_val(&mut buf).unwrap();
        assert_eq!(String::decode_val(&buf).unwrap(), "hello");
    }
}
