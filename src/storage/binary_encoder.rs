//! Fixed-width binary codec for the triple indices.
//!
//! Every index key is exactly 24 bytes: three big-endian [`TermId`]s in the
//! ordering of the keyspace, so lexicographic byte order matches numeric id
//! order and every triple pattern is a single prefix scan.

use crate::storage::error::{CorruptionError, StorageError};
use crate::storage::term_id::TermId;

pub const TRIPLE_KEY_SIZE: usize = 24;

/// A triple of term ids, in subject/predicate/object order.
#[derive(Eq, PartialEq, Ord, PartialOrd, Debug, Clone, Copy, Hash)]
pub struct EncodedTriple {
    pub subject: TermId,
    pub predicate: TermId,
    pub object: TermId,
}

impl EncodedTriple {
    pub fn new(subject: TermId, predicate: TermId, object: TermId) -> Self {
        Self {
            subject,
            predicate,
            object,
        }
    }
}

/// The component orderings of the three redundant indices.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum TripleEncoding {
    /// subject, predicate, object
    Spo,
    /// predicate, object, subject
    Pos,
    /// object, subject, predicate
    Osp,
}

impl TripleEncoding {
    pub fn encode(self, triple: &EncodedTriple) -> [u8; TRIPLE_KEY_SIZE] {
        let (first, second, third) = match self {
            Self::Spo => (triple.subject, triple.predicate, triple.object),
            Self::Pos => (triple.predicate, triple.object, triple.subject),
            Self::Osp => (triple.object, triple.subject, triple.predicate),
        };
        let mut key = [0; TRIPLE_KEY_SIZE];
        key[..8].copy_from_slice(&first.to_be_bytes());
        key[8..16].copy_from_slice(&second.to_be_bytes());
        key[16..].copy_from_slice(&third.to_be_bytes());
        key
    }

    pub fn decode(self, key: &[u8]) -> Result<EncodedTriple, StorageError> {
        if key.len() != TRIPLE_KEY_SIZE {
            return Err(
                CorruptionError::msg(format!("Invalid triple key length {}", key.len())).into(),
            );
        }
        let first = TermId::from_be_bytes(key[..8].try_into().unwrap());
        let second = TermId::from_be_bytes(key[8..16].try_into().unwrap());
        let third = TermId::from_be_bytes(key[16..].try_into().unwrap());
        Ok(match self {
            Self::Spo => EncodedTriple::new(first, second, third),
            Self::Pos => EncodedTriple::new(third, first, second),
            Self::Osp => EncodedTriple::new(second, third, first),
        })
    }
}

/// Builds a scan prefix out of the leading bound ids of an index ordering.
pub fn scan_prefix(ids: &[TermId]) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(ids.len() * 8);
    for id in ids {
        prefix.extend_from_slice(&id.to_be_bytes());
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::term_id::TermIdKind;

    #[test]
    fn all_encodings_round_trip() {
        let triple = EncodedTriple::new(
            TermId::from_sequence(TermIdKind::Iri, 1),
            TermId::from_sequence(TermIdKind::Iri, 2),
            TermId::from_sequence(TermIdKind::Literal, 3),
        );
        for encoding in [TripleEncoding::Spo, TripleEncoding::Pos, TripleEncoding::Osp] {
            let key = encoding.encode(&triple);
            assert_eq!(encoding.decode(&key).unwrap(), triple);
        }
    }
}
