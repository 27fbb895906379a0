//! Hashing utilities for minishard
//!
//! - BLAKE3 of a canonical value encoding for hashed shard-key fields
//! - Incremental BLAKE3 digests to compare a key range across shards

use crate::common::keys::KeyPart;
use blake3::Hasher;

/// Canonical byte encoding of a raw key value, tagged by type so that
/// `"1"` and `1` never collide.
fn canonical_bytes(part: &KeyPart) -> Vec<u8> {
    match part {
        KeyPart::MinKey => vec![0x00],
        KeyPart::Hashed(h) => {
            let mut out = vec![0x01];
            out.extend_from_slice(&h.to_be_bytes());
            out
        }
        KeyPart::Null => vec![0x02],
        KeyPart::Int(i) => {
            let mut out = vec![0x03];
            out.extend_from_slice(&i.to_be_bytes());
            out
        }
        KeyPart::Str(s) => {
            let mut out = vec![0x04];
            out.extend_from_slice(s.as_bytes());
            out
        }
        KeyPart::Bool(b) => vec![0x05, *b as u8],
        KeyPart::MaxKey => vec![0xff],
    }
}

/// Hash a raw shard-key value into the u64 hash space
pub fn hash_key_value(part: &KeyPart) -> u64 {
    let hash = blake3::hash(&canonical_bytes(part));
    let mut first = [0u8; 8];
    first.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(first)
}

/// Order-sensitive BLAKE3 digest of the documents in a key range.
///
/// Two shards holding the same documents under the same keys produce the
/// same hex string.
#[derive(Default)]
pub struct RangeDigest {
    hasher: Hasher,
    documents: u64,
}

impl RangeDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_document(&mut self, key: &str, id: &str, body: &[u8]) {
        for field in [key.as_bytes(), id.as_bytes(), body] {
            self.hasher.update(&(field.len() as u64).to_le_bytes());
            self.hasher.update(field);
        }
        self.documents += 1;
    }

    /// `<documents>:<hex>`
    pub fn finish(mut self) -> String {
        self.hasher.update(&self.documents.to_le_bytes());
        format!("{}:{}", self.documents, self.hasher.finalize())
    }
}
