//! Chunk versions
//!
//! A version is `(epoch, counter)`. The epoch is fixed when a namespace is
//! sharded; the counter is bumped by every split, merge and migration commit.
//! Versions from different epochs are never considered compatible.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub epoch: u64,
    pub counter: u64,
}

impl ChunkVersion {
    /// Version reported for a namespace a shard knows nothing about.
    pub const UNSHARDED: ChunkVersion = ChunkVersion {
        epoch: 0,
        counter: 0,
    };

    pub const fn new(epoch: u64, counter: u64) -> Self {
        Self { epoch, counter }
    }

    /// Next version within the same epoch
    pub fn bump(&self) -> Self {
        Self {
            epoch: self.epoch,
            counter: self.counter + 1,
        }
    }

    pub fn same_epoch(&self, other: &ChunkVersion) -> bool {
        self.epoch == other.epoch
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.epoch, self.counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_keeps_epoch() {
        let v = ChunkVersion::new(7, 3);
        let next = v.bump();
        assert_eq!(next, ChunkVersion::new(7, 4));
        assert!(next.same_epoch(&v));
        assert!(next > v);
    }

    #[test]
    fn test_display() {
        assert_eq!(ChunkVersion::new(12, 5).to_string(), "12|5");
    }
}
