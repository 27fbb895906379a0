//! Shard backends
//!
//! The coordinator talks to shards only through [`ShardBackend`]. A shard
//! stores documents, validates the routing version of every operation it
//! receives, and exposes the primitives the migration protocol is built
//! from: write capture, range snapshots, log replay, range freezing and
//! content digests.

pub mod memory;

pub use memory::{MemoryConnector, MemoryShard};

use crate::common::keys::{KeyRange, ShardKey};
use crate::common::{ChunkVersion, OpResult, Operation, Result};
use crate::coordinator::chunk_map::ChunkMapSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Handle of a write-capture session on a donor
pub type CaptureId = u64;

/// Size of a key range on one shard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeStats {
    pub documents: u64,
    pub bytes: u64,
}

/// A document with its encoded shard key
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub key: ShardKey,
    pub id: String,
    pub doc: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogOp {
    Upsert(Value),
    Delete,
}

/// One captured write, in donor order
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub seq: u64,
    pub key: ShardKey,
    pub id: String,
    pub op: LogOp,
}

pub trait ShardBackend: Send + Sync {
    /// Liveness probe
    fn ping(&self) -> Result<()>;

    /// Accept the identity assigned at registration
    fn join(&self, shard_id: &str) -> Result<()>;

    /// Learn the latest chunk map of a namespace; operations carrying an
    /// older version of this shard's ownership are rejected with
    /// `StaleVersion`
    fn install_routing(&self, snapshot: &ChunkMapSnapshot) -> Result<()>;

    /// Run an operation routed with `version`
    fn execute(&self, op: &Operation, version: ChunkVersion) -> Result<OpResult>;

    fn range_stats(&self, ns: &str, range: &KeyRange) -> Result<RangeStats>;

    /// Median key of the documents in `range`, `None` if they all share
    /// one key value
    fn split_point(&self, ns: &str, range: &KeyRange) -> Result<Option<ShardKey>>;

    /// Start recording writes to `range`
    fn start_capture(&self, ns: &str, range: &KeyRange) -> Result<CaptureId>;

    /// Take up to `max` captured writes, oldest first
    fn drain_capture(&self, capture: CaptureId, max: usize) -> Result<Vec<LogEntry>>;

    fn end_capture(&self, capture: CaptureId) -> Result<()>;

    fn snapshot_range(&self, ns: &str, range: &KeyRange) -> Result<Vec<StoredDocument>>;

    fn install_documents(&self, ns: &str, docs: &[StoredDocument]) -> Result<()>;

    fn apply_log(&self, ns: &str, entries: &[LogEntry]) -> Result<()>;

    /// Reject writes to `range` (reads continue)
    fn freeze_range(&self, ns: &str, range: &KeyRange) -> Result<()>;

    fn unfreeze_range(&self, ns: &str, range: &KeyRange) -> Result<()>;

    /// BLAKE3 digest over the documents of `range` in key order
    fn range_digest(&self, ns: &str, range: &KeyRange) -> Result<String>;

    /// Remove every document in `range`; returns how many were removed
    fn delete_range(&self, ns: &str, range: &KeyRange) -> Result<u64>;
}

/// Opens backends by endpoint
pub trait ShardConnector: Send + Sync {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn ShardBackend>>;
}
