//! StreamKeep error types

use crate::storage::StorageStats;
use thiserror::Error;

/// StreamKeep error type
#[derive(Error, Debug)]
pub enum Error {
    /// Too many concurrently live streams
    #[error("Capacity error: {live} live streams, maximum is {max}")]
    Capacity {
        /// Streams currently live
        live: usize,
        /// Configured maximum
        max: usize,
    },

    /// Unknown key or stream, or resurrection unavailable
    #[error("Not found: {0}")]
    NotFound(String),

    /// Regenerate-type resurrection requested without an injected callback
    #[error("No regeneration callback registered for stream {stream_id}")]
    RegenerationUnavailable {
        /// Stream that needed regeneration
        stream_id: String,
    },

    /// Overflow with the `fail` policy
    #[error(
        "Storage full: cannot store {key} ({size_bytes} bytes) in scope {scope}, durable usage {}/{capacity_bytes}",
        .stats.durable.bytes
    )]
    StorageFull {
        /// Key that was being written
        key: String,
        /// Scope the write was charged to
        scope: String,
        /// Size of the rejected payload
        size_bytes: u64,
        /// Durable capacity of the scope
        capacity_bytes: u64,
        /// Scope statistics at the time of the failure
        stats: StorageStats,
    },

    /// Nothing evictable can free the required space
    #[error(
        "Eviction impossible: {key} needs {required_bytes} bytes in scope {scope}, only {freeable_bytes} evictable"
    )]
    EvictionImpossible {
        /// Key that was being written
        key: String,
        /// Scope the write was charged to
        scope: String,
        /// Bytes that had to be freed
        required_bytes: u64,
        /// Bytes held by eviction candidates
        freeable_bytes: u64,
        /// Scope statistics at the time of the failure
        stats: StorageStats,
    },

    /// Branch already attached to a reader
    #[error("Branch {index} of stream {stream_id} is already attached")]
    BranchInUse {
        /// Stream ID
        stream_id: String,
        /// Branch index
        index: usize,
    },

    /// Invalid caller-supplied argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error reports missing data rather than a broken store.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Whether retrying the same write with a different policy or tier
    /// hint could succeed.
    pub fn is_capacity_related(&self) -> bool {
        matches!(
            self,
            Error::Capacity { .. } | Error::StorageFull { .. } | Error::EvictionImpossible { .. }
        )
    }
}

/// Result type alias for StreamKeep operations
pub type Result<T> = std::result::Result<T, Error>;
