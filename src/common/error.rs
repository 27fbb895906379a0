//! Error types for minishard

use crate::common::version::ChunkVersion;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Configuration Errors ===
    #[error("Invalid shard key spec: {0}")]
    InvalidKeySpec(String),

    #[error("Namespace already sharded: {0}")]
    AlreadySharded(String),

    #[error("Zone conflict: {0}")]
    ZoneConflict(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid key range: {0}")]
    InvalidRange(String),

    #[error("Invalid shard key value: {0}")]
    InvalidShardKey(String),

    #[error("Invalid split points: {0}")]
    InvalidSplitPoints(String),

    // === Coordination Errors ===
    #[error("Stale version for {namespace}: router has {wanted}, shard has {have}")]
    StaleVersion {
        namespace: String,
        wanted: ChunkVersion,
        have: ChunkVersion,
    },

    #[error("Metadata conflict on {0}: concurrent update")]
    CasConflict(String),

    #[error("Not the balancer leader: lease held by {0}")]
    NotLeader(String),

    #[error("Chunk {0} already has an active migration")]
    MigrationInProgress(u64),

    // === Data-shape Errors ===
    #[error("Jumbo chunk {chunk_id} in {namespace}: all documents share one key value")]
    JumboChunk { namespace: String, chunk_id: u64 },

    // === Lookup Errors ===
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Chunk not found: {0}")]
    ChunkNotFound(u64),

    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("Shard already registered: {0}")]
    DuplicateShard(String),

    // === Shard Errors ===
    #[error("Shard unreachable: {0}")]
    ShardUnreachable(String),

    #[error("Key range frozen for migration on {0}")]
    RangeFrozen(String),

    #[error("Shard {shard} rejected operation: {reason}")]
    ShardRejected { shard: String, reason: String },

    // === Migration Errors ===
    #[error("Migration aborted: {0}")]
    MigrationAborted(String),

    // === Metadata Errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ShardUnreachable(_)
                | Error::RangeFrozen(_)
                | Error::StaleVersion { .. }
                | Error::CasConflict(_)
                | Error::MigrationInProgress(_)
        )
    }

    /// Configuration errors are rejected at the admin boundary and never retried.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidKeySpec(_)
                | Error::AlreadySharded(_)
                | Error::ZoneConflict(_)
                | Error::InvalidConfig(_)
                | Error::InvalidRange(_)
                | Error::InvalidSplitPoints(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NamespaceNotFound(_) | Error::ChunkNotFound(_) | Error::ShardNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Error::AlreadySharded(_)
            | Error::ZoneConflict(_)
            | Error::DuplicateShard(_)
            | Error::MigrationInProgress(_)
            | Error::CasConflict(_)
            | Error::StaleVersion { .. } => StatusCode::CONFLICT,
            Error::InvalidKeySpec(_)
            | Error::InvalidConfig(_)
            | Error::InvalidRange(_)
            | Error::InvalidShardKey(_)
            | Error::InvalidSplitPoints(_) => StatusCode::BAD_REQUEST,
            Error::JumboChunk { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::ShardUnreachable(_) | Error::RangeFrozen(_) | Error::NotLeader(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::MetadataCorrupted(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("JSON error: {}", e))
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
