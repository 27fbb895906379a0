//! Coordinator: chunk metadata, routing, migrations and balancing
//!
//! The coordinator is responsible for:
//! - The versioned chunk map of every sharded namespace
//! - Routing operations to the shards owning their keys
//! - Moving chunks between shards without losing writes
//! - Keeping chunk counts even and zone ranges on their zones

pub mod admin;
pub mod balancer;
pub mod chunk_map;
pub mod cluster;
pub mod http;
pub mod metadata;
pub mod migration;
pub mod router;
pub mod server;
pub mod shards;
pub mod zones;

pub use admin::{Admin, ChunkDistribution, RemovalProgress};
pub use balancer::{Balancer, BalancerWindow, RoundOutcome, RoundReport};
pub use chunk_map::{Chunk, ChunkId, ChunkMap, ChunkMapSnapshot, InitialChunks, ShardId};
pub use cluster::Cluster;
pub use migration::{MigrationCoordinator, MigrationOutcome, MigrationState, MigrationTicket};
pub use router::{RoutePlan, Router};
pub use server::Coordinator;
