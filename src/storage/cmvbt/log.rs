//! Entries of the transient log.
//!
//! Each pending write is stored under the written key paired with the id of
//! the transaction that wrote it, so all writes to one key sit next to each
//! other and a transaction holds at most one marker per key.

use crate::storage::txn::TxnId;
use crate::types::{KeyCodec, Result, TreeError, ValCodec};

/// Key of a marker: the user key followed by the writing transaction.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransientKey<K> {
    /// Written key.
    pub key: K,
    /// Writing transaction.
    pub txn: TxnId,
}

impl<K: KeyCodec> TransientKey<K> {
    /// Marker key of `txn` writing `key`.
    pub fn new(key: K, txn: TxnId) -> Self {
        Self { key, txn }
    }

    /// Smallest marker key for `key`.
    pub fn first_of(key: K) -> Self {
        Self { key, txn: 0 }
    }
}

impl<K: KeyCodec> KeyCodec for TransientKey<K> {
    const ENCODED_LEN: usize = K::ENCODED_LEN + 8;

    fn min_key() -> Self {
        Self::first_of(K::min_key())
    }

    fn max_key() -> Self {
        Self {
            key: K::max_key(),
            txn: TxnId::MAX,
        }
    }

    fn next_key(&self) -> Self {
        match self.txn.checked_add(1) {
            Some(txn) => Self {
                key: self.key.clone(),
                txn,
            },
            None if self.key == K::max_key() => self.clone(),
            None => Self::first_of(self.key.next_key()),
        }
    }

    fn prev_key(&self) -> Self {
        match self.txn.checked_sub(1) {
            Some(txn) => Self {
                key: self.key.clone(),
                txn,
            },
            None if self.key == K::min_key() => self.clone(),
            None => Self {
                key: self.key.prev_key(),
                txn: TxnId::MAX,
            },
        }
    }

    fn encode_key(&self, out: &mut [u8]) {
        self.key.encode_key(&mut out[..K::ENCODED_LEN]);
        out[K::ENCODED_LEN..K::ENCODED_LEN + 8].copy_from_slice(&self.txn.to_be_bytes());
    }

    fn decode_key(src: &[u8]) -> Result<Self> {
        if src.len() < Self::ENCODED_LEN {
            return Err(TreeError::Corruption("transient key truncated"));
        }
        let mut txn = [0u8; 8];
        txn.copy_from_slice(&src[K::ENCODED_LEN..K::ENCODED_LEN + 8]);
        Ok(Self {
            key: K::decode_key(&src[..K::ENCODED_LEN])?,
            txn: TxnId::from_be_bytes(txn),
        })
    }
}

const TAG_DELETE: u8 = 0;
const TAG_INSERT: u8 = 1;

/// Pending write of one transaction to one key.
#[derive(Clone, Debug, PartialEq)]
pub enum Marker<V> {
    /// The key takes this value.
    Insert(V),
    /// The key is removed.
    Delete,
}

impl<V> Marker<V> {
    /// Value the key holds after this write.
    pub fn value(&self) -> Option<&V> {
        match self {
            Marker::Insert(value) => Some(value),
            Marker::Delete => None,
        }
    }
}

impl<V: ValCodec> ValCodec for Marker<V> {
    const ENCODED_LEN: usize = 1 + V::ENCODED_LEN;

    fn encode_val(&self, out: &mut [u8]) -> Result<()> {
        match self {
            Marker::Insert(value) => {
                out[0] = TAG_INSERT;
                value.encode_val(&mut out[1..Self::ENCODED_LEN])
            }
            Marker::Delete => {
                out[..Self::ENCODED_LEN].fill(0);
                Ok(())
            }
        }
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        match src.first() {
            Some(&TAG_INSERT) => Ok(Marker::Insert(V::decode_val(&src[1..Self::ENCODED_LEN])?)),
            Some(&TAG_DELETE) => Ok(Marker::Delete),
            _ => Err(TreeError::Corruption("unknown marker tag")),
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Marker::Insert(value) => value.validate(),
            Marker::Delete => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_of_one_key_are_adjacent() {
        let a = TransientKey::new(5u64, 9);
        let b = TransientKey::new(6u64, 1);
        assert!(a < b);
        assert!(TransientKey::first_of(5u64) < a);
        assert_eq!(TransientKey::new(5u64, TxnId::MAX).next_key(), TransientKey::first_of(6));
        assert_eq!(TransientKey::first_of(6u64).prev_key(), TransientKey::new(5, TxnId::MAX));
    }

    #[test]
    fn key_codec_preserves_order() {
        let keys = [
            TransientKey::new(1u64, 7),
            TransientKey::new(1u64, 300),
            TransientKey::new(2u64, 0),
        ];
        let mut encoded: Vec<Vec<u8>> = keys
            .iter()
            .map(|k| {
                let mut buf = vec![0u8; TransientKey::<u64>::ENCODED_LEN];
                k.encode_key(&mut buf);
                buf
            })
            .collect();
        let sorted = encoded.clone();
        encoded.sort();
        assert_eq!(encoded, sorted);
        for (key, buf) in keys.iter().zip(&sorted) {
            assert_eq!(&TransientKey::<u64>::decode_key(buf).unwrap(), key);
        }
    }

    #[test]
    fn marker_codec() {
        let mut buf = vec![0u8; Marker::<String>::ENCODED_LEN];
        let insert = Marker::Insert("abc".to_string());
        insert.encode_val(&mut buf).unwrap();
        assert_eq!(Marker::<String>::decode_val(&buf).unwrap(), insert);
        Marker::<String>::Delete.encode_val(&mut buf).unwrap();
        assert_eq!(Marker::<String>::decode_val(&buf).unwrap(), Marker::Delete);
        buf[0] = 9;
        assert!(Marker::<String>::decode_val(&buf).is_err());
        assert!(Marker::Insert("x".repeat(100)).validate().is_err());
    }
}
