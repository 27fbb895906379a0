//! Common utilities and types shared across minishard

pub mod config;
pub mod error;
pub mod hash;
pub mod keys;
pub mod metrics;
pub mod query;
pub mod utils;
pub mod version;

pub use config::{BalancerConfig, Config, CoordinatorConfig, MigrationConfig};
pub use error::{Error, Result};
pub use hash::{hash_key_value, RangeDigest};
pub use keys::{KeyField, KeyMode, KeyPart, KeyRange, ShardKey, ShardKeySpec};
pub use metrics::{MetricsRegistry, METRICS};
pub use query::{FieldPredicate, OpResult, Operation, OperationKind, Predicate, RoutingMode};
pub use utils::{generate_ticket_id, timestamp_now, timestamp_now_millis, validate_namespace};
pub use version::ChunkVersion;
