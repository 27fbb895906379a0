//! Versioned chunk map
//!
//! One record per namespace in the metadata store holds the ordered chunk
//! list. Readers get an immutable [`ChunkMapSnapshot`] behind an `Arc`;
//! writers build a modified copy, validate the partition invariant and
//! publish it with a compare-and-swap.

use crate::common::keys::{KeyRange, ShardKey, ShardKeySpec};
use crate::common::{timestamp_now_millis, validate_namespace, ChunkVersion, Error, Result};
use crate::coordinator::metadata::{read_record, update_record, MetadataStore, SPACE_CHUNKS};
use crate::shard::ShardBackend;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub type ShardId = String;
pub type ChunkId = u64;

/// A contiguous key range owned by one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub namespace: String,
    pub id: ChunkId,
    pub range: KeyRange,
    pub shard: ShardId,
    pub version: ChunkVersion,
    pub jumbo: bool,
}

/// How a namespace is pre-split at creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitialChunks {
    /// Equal-width chunks over the hash space (leading hashed field)
    Count(u32),
    /// Explicit boundaries (ranged keys)
    SplitPoints(Vec<ShardKey>),
}

/// Immutable view of a namespace's chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMapSnapshot {
    pub namespace: String,
    pub key_spec: ShardKeySpec,
    pub chunks: Vec<Chunk>,
    pub version: ChunkVersion,
    /// Version at which each shard last gave a chunk away
    lost_at: BTreeMap<ShardId, ChunkVersion>,
    next_chunk_id: ChunkId,
}

impl ChunkMapSnapshot {
    /// Chunk owning `key` (binary search)
    pub fn find(&self, key: &ShardKey) -> Option<&Chunk> {
        let idx = self.chunks.partition_point(|c| c.range.max <= *key);
        self.chunks.get(idx).filter(|c| c.range.contains(key))
    }

    /// Chunks intersecting `[lo, hi]` (or `[lo, hi)` when `hi_inclusive` is false)
    pub fn chunks_between(&self, lo: &ShardKey, hi: &ShardKey, hi_inclusive: bool) -> &[Chunk] {
        let start = self.chunks.partition_point(|c| c.range.max <= *lo);
        let end = if hi_inclusive {
            self.chunks.partition_point(|c| c.range.min <= *hi)
        } else {
            self.chunks.partition_point(|c| c.range.min < *hi)
        };
        if start >= end {
            &[]
        } else {
            &self.chunks[start..end]
        }
    }

    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.id == id)
    }

    fn position(&self, id: ChunkId) -> Result<usize> {
        self.chunks
            .iter()
            .position(|c| c.id == id)
            .ok_or(Error::ChunkNotFound(id))
    }

    /// Every shard owning at least one chunk
    pub fn shards(&self) -> BTreeSet<ShardId> {
        self.chunks.iter().map(|c| c.shard.clone()).collect()
    }

    pub fn chunks_on<'a>(&'a self, shard: &'a str) -> impl Iterator<Item = &'a Chunk> + 'a {
        self.chunks.iter().filter(move |c| c.shard == shard)
    }

    pub fn counts_by_shard(&self) -> BTreeMap<ShardId, usize> {
        let mut counts = BTreeMap::new();
        for chunk in &self.chunks {
            *counts.entry(chunk.shard.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Version of `shard`'s ownership: the newest of its chunk versions
    /// and the last time it gave a chunk away
    pub fn shard_version(&self, shard: &str) -> ChunkVersion {
        self.chunks_on(shard)
            .map(|c| c.version)
            .chain(self.lost_at.get(shard).copied())
            .max()
            .unwrap_or(ChunkVersion::new(self.version.epoch, 0))
    }

    /// Ranges owned by `shard`, ascending
    pub fn owned_ranges(&self, shard: &str) -> Vec<KeyRange> {
        self.chunks_on(shard).map(|c| c.range.clone()).collect()
    }

    /// Check that the chunks exactly partition `[MinKey, MaxKey)`
    pub fn validate(&self) -> Result<()> {
        let corrupt = |msg: String| Err(Error::MetadataCorrupted(format!("{}: {}", self.namespace, msg)));

        let (Some(first), Some(last)) = (self.chunks.first(), self.chunks.last()) else {
            return corrupt("no chunks".into());
        };
        if first.range.min != self.key_spec.min_key() {
            return corrupt(format!("first chunk starts at {}", first.range.min));
        }
        if last.range.max != self.key_spec.max_key() {
            return corrupt(format!("last chunk ends at {}", last.range.max));
        }
        let mut ids = BTreeSet::new();
        for chunk in &self.chunks {
            if chunk.range.min >= chunk.range.max {
                return corrupt(format!("empty chunk {}", chunk.range));
            }
            if chunk.range.min.width() != self.key_spec.width()
                || chunk.range.max.width() != self.key_spec.width()
            {
                return corrupt(format!("chunk {} has wrong key width", chunk.id));
            }
            if !ids.insert(chunk.id) {
                return corrupt(format!("duplicate chunk id {}", chunk.id));
            }
        }
        for pair in self.chunks.windows(2) {
            if pair[0].range.max != pair[1].range.min {
                return corrupt(format!(
                    "gap or overlap between {} and {}",
                    pair[0].range, pair[1].range
                ));
            }
        }
        Ok(())
    }

    fn next_version(&mut self) -> ChunkVersion {
        self.version = self.version.bump();
        self.version
    }

    fn allocate_id(&mut self) -> ChunkId {
        let id = self.next_chunk_id;
        self.next_chunk_id += 1;
        id
    }
}

/// Service over the authoritative chunk maps
pub struct ChunkMap {
    store: Arc<dyn MetadataStore>,
}

impl ChunkMap {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Create the chunk map of a new namespace, all chunks on `seed_shard`
    pub fn initialize(
        &self,
        ns: &str,
        key_spec: ShardKeySpec,
        initial: InitialChunks,
        seed_shard: &str,
    ) -> Result<Arc<ChunkMapSnapshot>> {
        validate_namespace(ns)?;
        key_spec.validate()?;

        let points = match initial {
            InitialChunks::Count(n) => key_spec.uniform_split_points(n)?,
            InitialChunks::SplitPoints(points) => points,
        };
        let full = key_spec.full_range();
        check_split_points(&full, &points)?;

        let epoch = timestamp_now_millis().max(1);
        let mut bounds = Vec::with_capacity(points.len() + 2);
        bounds.push(full.min.clone());
        bounds.extend(points);
        bounds.push(full.max.clone());

        let chunks: Vec<Chunk> = bounds
            .windows(2)
            .enumerate()
            .map(|(i, w)| Chunk {
                namespace: ns.to_string(),
                id: i as ChunkId + 1,
                range: KeyRange {
                    min: w[0].clone(),
                    max: w[1].clone(),
                },
                shard: seed_shard.to_string(),
                version: ChunkVersion::new(epoch, i as u64 + 1),
                jumbo: false,
            })
            .collect();

        let snapshot = ChunkMapSnapshot {
            namespace: ns.to_string(),
            key_spec,
            version: ChunkVersion::new(epoch, chunks.len() as u64),
            lost_at: BTreeMap::new(),
            next_chunk_id: chunks.len() as ChunkId + 1,
            chunks,
        };
        snapshot.validate()?;

        let created = update_record(
            self.store.as_ref(),
            SPACE_CHUNKS,
            ns,
            |current: Option<ChunkMapSnapshot>| match current {
                Some(_) => Err(Error::AlreadySharded(ns.to_string())),
                None => Ok((Some(snapshot.clone()), snapshot.clone())),
            },
        )?;

        tracing::info!(
            "Sharded {} with {} chunk(s) on {} (version {})",
            ns,
            created.chunks.len(),
            seed_shard,
            created.version
        );
        Ok(Arc::new(created))
    }

    /// Current authoritative snapshot
    pub fn snapshot(&self, ns: &str) -> Result<Arc<ChunkMapSnapshot>> {
        read_record::<ChunkMapSnapshot>(self.store.as_ref(), SPACE_CHUNKS, ns)?
            .map(Arc::new)
            .ok_or_else(|| Error::NamespaceNotFound(ns.to_string()))
    }

    pub fn is_sharded(&self, ns: &str) -> Result<bool> {
        Ok(self.store.get(SPACE_CHUNKS, ns)?.is_some())
    }

    pub fn namespaces(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .list(SPACE_CHUNKS)?
            .into_iter()
            .map(|(ns, _)| ns)
            .collect())
    }

    /// Apply `f` to a copy of the map and publish it atomically
    fn mutate<F>(&self, ns: &str, mut f: F) -> Result<Arc<ChunkMapSnapshot>>
    where
        F: FnMut(&mut ChunkMapSnapshot) -> Result<()>,
    {
        let updated = update_record(
            self.store.as_ref(),
            SPACE_CHUNKS,
            ns,
            |current: Option<ChunkMapSnapshot>| {
                let mut map = current.ok_or_else(|| Error::NamespaceNotFound(ns.to_string()))?;
                f(&mut map)?;
                map.validate()?;
                Ok((Some(map.clone()), map))
            },
        )?;
        Ok(Arc::new(updated))
    }

    /// Replace one chunk by ordered sub-chunks on the same shard
    pub fn split(
        &self,
        ns: &str,
        chunk_id: ChunkId,
        split_points: &[ShardKey],
    ) -> Result<Arc<ChunkMapSnapshot>> {
        let updated = self.mutate(ns, |map| {
            let pos = map.position(chunk_id)?;
            let original = map.chunks[pos].clone();
            if original.jumbo {
                return Err(Error::JumboChunk {
                    namespace: ns.to_string(),
                    chunk_id,
                });
            }
            check_split_points(&original.range, split_points)?;

            let mut bounds = vec![original.range.min.clone()];
            bounds.extend(split_points.iter().cloned());
            bounds.push(original.range.max.clone());

            let mut pieces = Vec::with_capacity(bounds.len() - 1);
            for w in bounds.windows(2) {
                let id = map.allocate_id();
                let version = map.next_version();
                pieces.push(Chunk {
                    namespace: ns.to_string(),
                    id,
                    range: KeyRange {
                        min: w[0].clone(),
                        max: w[1].clone(),
                    },
                    shard: original.shard.clone(),
                    version,
                    jumbo: false,
                });
            }
            map.chunks.splice(pos..=pos, pieces);
            Ok(())
        })?;
        tracing::info!(
            "Split chunk {} of {} at {} point(s), version {}",
            chunk_id,
            ns,
            split_points.len(),
            updated.version
        );
        Ok(updated)
    }

    /// Split a chunk at the median key reported by its owning shard.
    ///
    /// If the shard finds no point (every document shares one key value)
    /// the chunk is flagged jumbo and `JumboChunk` is returned.
    pub fn split_at_data(
        &self,
        ns: &str,
        chunk_id: ChunkId,
        owner: &dyn ShardBackend,
    ) -> Result<Arc<ChunkMapSnapshot>> {
        let snapshot = self.snapshot(ns)?;
        let chunk = snapshot
            .chunk(chunk_id)
            .ok_or(Error::ChunkNotFound(chunk_id))?;
        if chunk.jumbo {
            return Err(Error::JumboChunk {
                namespace: ns.to_string(),
                chunk_id,
            });
        }
        match owner.split_point(ns, &chunk.range)? {
            Some(point) => self.split(ns, chunk_id, &[point]),
            None => {
                self.mark_jumbo(ns, chunk_id)?;
                Err(Error::JumboChunk {
                    namespace: ns.to_string(),
                    chunk_id,
                })
            }
        }
    }

    /// Flag a chunk as indivisible
    pub fn mark_jumbo(&self, ns: &str, chunk_id: ChunkId) -> Result<()> {
        self.mutate(ns, |map| {
            let pos = map.position(chunk_id)?;
            map.chunks[pos].jumbo = true;
            Ok(())
        })?;
        tracing::warn!("Chunk {} of {} flagged jumbo", chunk_id, ns);
        Ok(())
    }

    /// Clear the jumbo flag (after the key design changed)
    pub fn clear_jumbo(&self, ns: &str, chunk_id: ChunkId) -> Result<()> {
        self.mutate(ns, |map| {
            let pos = map.position(chunk_id)?;
            map.chunks[pos].jumbo = false;
            Ok(())
        })?;
        Ok(())
    }

    /// Merge contiguous chunks of one shard exactly covering `range`
    pub fn merge_chunks(&self, ns: &str, range: &KeyRange) -> Result<Arc<ChunkMapSnapshot>> {
        self.mutate(ns, |map| {
            let start = map
                .chunks
                .iter()
                .position(|c| c.range.min == range.min)
                .ok_or_else(|| Error::InvalidRange(format!("no chunk starts at {}", range.min)))?;
            let end = map
                .chunks
                .iter()
                .position(|c| c.range.max == range.max)
                .ok_or_else(|| Error::InvalidRange(format!("no chunk ends at {}", range.max)))?;
            if end <= start {
                return Err(Error::InvalidRange(format!(
                    "{} covers fewer than two chunks",
                    range
                )));
            }
            let shard = map.chunks[start].shard.clone();
            if map.chunks[start..=end].iter().any(|c| c.shard != shard) {
                return Err(Error::InvalidRange(format!(
                    "{} spans more than one shard",
                    range
                )));
            }
            let id = map.allocate_id();
            let version = map.next_version();
            let merged = Chunk {
                namespace: ns.to_string(),
                id,
                range: range.clone(),
                shard,
                version,
                jumbo: false,
            };
            map.chunks.splice(start..=end, std::iter::once(merged));
            Ok(())
        })
    }

    /// Reassign a chunk from `from` to `to`.
    ///
    /// Guarded by the chunk's version as seen when the migration was
    /// planned: if the chunk was split, merged or moved since, the commit
    /// fails with `StaleVersion`. Unrelated concurrent updates of the same
    /// namespace are re-read and re-validated, never overwritten.
    pub fn commit_migration(
        &self,
        ns: &str,
        chunk_id: ChunkId,
        from: &str,
        to: &str,
        expected: ChunkVersion,
    ) -> Result<Arc<ChunkMapSnapshot>> {
        if from == to {
            return Err(Error::InvalidConfig(format!(
                "chunk {} cannot migrate onto its own shard",
                chunk_id
            )));
        }
        let updated = self.mutate(ns, |map| {
            let stale = |have: ChunkVersion| Error::StaleVersion {
                namespace: ns.to_string(),
                wanted: expected,
                have,
            };
            let pos = match map.position(chunk_id) {
                Ok(pos) => pos,
                Err(_) => return Err(stale(map.version)),
            };
            let current = &map.chunks[pos];
            if current.version != expected || current.shard != from {
                return Err(stale(current.version));
            }
            let version = map.next_version();
            let chunk = &mut map.chunks[pos];
            chunk.shard = to.to_string();
            chunk.version = version;
            // The donor's shard version moves too, so a donor that missed
            // the routing push rejects routers on the new map.
            map.lost_at.insert(from.to_string(), version);
            Ok(())
        })?;
        tracing::info!(
            "Committed chunk {} of {}: {} -> {} (version {})",
            chunk_id,
            ns,
            from,
            to,
            updated.version
        );
        Ok(updated)
    }
}

/// Points must lie strictly inside `range` and be strictly increasing
fn check_split_points(range: &KeyRange, points: &[ShardKey]) -> Result<()> {
    let mut prev = &range.min;
    for point in points {
        if point.width() != range.min.width() {
            return Err(Error::InvalidSplitPoints(format!(
                "{} has the wrong number of fields",
                point
            )));
        }
        if point <= prev {
            return Err(Error::InvalidSplitPoints(format!(
                "{} is not above {}",
                point, prev
            )));
        }
        prev = point;
    }
    if !points.is_empty() && prev >= &range.max {
        return Err(Error::InvalidSplitPoints(format!(
            "{} is not below {}",
            prev, range.max
        )));
    }
    Ok(())
}
