//! # minishard
//!
//! Range and hash sharding for a document store:
//! - A versioned chunk map partitions each namespace's shard-key space
//! - A router sends every operation to the shards owning its keys
//! - Chunks migrate between shards while writes continue
//! - A background balancer evens out chunks and honours zone ranges
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              Coordinator                 │
//! │  chunk map · zones · balancer · router   │
//! │      (metadata in RocksDB, CAS)          │
//! └───────────┬──────────────────────────────┘
//!             │ ShardBackend
//!   ┌─────────┴──────────┬──────────────┐
//!   │                    │              │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌───▼────────┐
//! │ shard-0    │   │ shard-1    │   │ shard-2    │
//! │ chunks 1-4 │   │ chunks 5-8 │   │ chunks 9-12│
//! └────────────┘   └────────────┘   └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! minishard-coord serve --id coord-1 --bind 0.0.0.0:7000 --db ./coord-data
//!
//! curl -X POST localhost:7000/admin/shards -d '{"endpoint":"mem://a"}' -H 'content-type: application/json'
//! curl -X POST localhost:7000/admin/collections -H 'content-type: application/json' \
//!   -d '{"namespace":"db.users","key":[{"path":"user_id","mode":"hashed"}],"chunks":8}'
//! ```

pub mod common;
pub mod coordinator;
pub mod shard;

// Re-export commonly used types
pub use common::{ChunkVersion, Config, Error, KeyRange, Operation, Predicate, Result, ShardKey, ShardKeySpec};
pub use coordinator::{Cluster, Coordinator};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
