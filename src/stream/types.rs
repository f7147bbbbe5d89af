//! Stream checkpoint data types

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// One unit of a produced stream
pub type Chunk = serde_json::Value;

/// Store key prefix for persisted checkpoint records
pub const CHECKPOINT_META_PREFIX: &str = "stream-checkpoint-meta-";

/// Store key prefix for materialized chunk snapshots
pub const CHECKPOINT_DATA_PREFIX: &str = "stream-checkpoint-data-";

/// Store key of a stream's checkpoint record
pub fn meta_key(stream_id: &str) -> String {
    format!("{}{}", CHECKPOINT_META_PREFIX, stream_id)
}

/// Store key of a stream's chunk snapshot
pub fn data_key(stream_id: &str) -> String {
    format!("{}{}", CHECKPOINT_DATA_PREFIX, stream_id)
}

/// Item yielded by a branch
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A chunk of the original sequence
    Chunk(Chunk),
    /// Terminal marker of a partial replay: chunks before `offset` were not
    /// retained. The stream is incomplete, not failed.
    Truncated {
        /// Number of leading chunks that were dropped
        offset: u64,
    },
}

impl StreamEvent {
    /// The chunk, if this is one
    pub fn into_chunk(self) -> Option<Chunk> {
        match self {
            StreamEvent::Chunk(chunk) => Some(chunk),
            StreamEvent::Truncated { .. } => None,
        }
    }

    /// Whether this is the truncation marker
    pub fn is_truncated(&self) -> bool {
        matches!(self, StreamEvent::Truncated { .. })
    }
}

/// How a stream is captured for later resurrection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterializationType {
    /// Keep every chunk and replay them all
    Full,
    /// Keep the most recent window and replay it with a truncation marker
    Partial,
    /// Keep nothing; re-run the producer through the regeneration callback
    Regenerate,
}

/// What the producer needs to re-create a stream from scratch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegenerationDescriptor {
    /// Configuration of the producing node
    pub node_config: serde_json::Value,
    /// Inputs the node was run with
    pub inputs: serde_json::Value,
}

/// Materialization state carried by a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Materialization {
    /// Complete chunk sequence
    Full {
        /// Chunks in the latest snapshot
        chunk_count: u64,
    },
    /// Trailing window of the chunk sequence
    Partial {
        /// Chunks retained per snapshot
        window: usize,
        /// Chunks dropped before the retained window
        partial_offset: u64,
    },
    /// Descriptor captured at registration
    Regenerate {
        /// Regeneration inputs
        descriptor: RegenerationDescriptor,
    },
}

impl Materialization {
    /// The materialization type
    pub fn kind(&self) -> MaterializationType {
        match self {
            Materialization::Full { .. } => MaterializationType::Full,
            Materialization::Partial { .. } => MaterializationType::Partial,
            Materialization::Regenerate { .. } => MaterializationType::Regenerate,
        }
    }
}

/// Checkpoint lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// Live, nothing persisted yet
    Active,
    /// A snapshot (or descriptor) is persisted
    Checkpointed,
    /// Reconstructed at least once
    Resurrected,
    /// Terminal; no longer resurrectable
    Expired,
}

impl CheckpointStatus {
    /// Whether moving from `self` to `next` is allowed. Re-checkpointing and
    /// re-resurrecting are self-transitions; nothing moves backwards.
    pub fn can_transition_to(self, next: CheckpointStatus) -> bool {
        use CheckpointStatus::*;
        matches!(
            (self, next),
            (Active, Checkpointed)
                | (Active, Expired)
                | (Checkpointed, Checkpointed)
                | (Checkpointed, Resurrected)
                | (Checkpointed, Expired)
                | (Resurrected, Resurrected)
                | (Resurrected, Expired)
        )
    }

    /// Position in the lifecycle; never decreases for a given checkpoint
    pub fn rank(self) -> u8 {
        match self {
            CheckpointStatus::Active => 0,
            CheckpointStatus::Checkpointed => 1,
            CheckpointStatus::Resurrected => 2,
            CheckpointStatus::Expired => 3,
        }
    }
}

/// Persisted progress record of one registered stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamCheckpoint {
    /// Unique stream identifier
    pub stream_id: String,
    /// Producing node
    pub source_id: String,
    /// Producing execution
    pub execution_id: String,
    /// Storage scope snapshots are charged to
    pub scope_id: String,
    /// Number of branches
    pub consumer_count: usize,
    /// Registration timestamp
    pub created_at: DateTime<Utc>,
    /// Last chunk produced or read
    pub last_activity_at: DateTime<Utc>,
    /// Materialization state
    pub materialization: Materialization,
    /// Lifecycle status
    pub status: CheckpointStatus,
    /// Resurrection attempts so far
    pub resurrection_attempts: u32,
    /// Chunks reflected by the latest snapshot
    pub last_checkpoint_seq: u64,
}

impl StreamCheckpoint {
    /// Apply a status transition; illegal transitions are refused.
    pub fn advance(&mut self, next: CheckpointStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            tracing::warn!(
                stream_id = %self.stream_id,
                from = ?self.status,
                to = ?next,
                "Refusing checkpoint status transition"
            );
            false
        }
    }

    /// The materialization type
    pub fn materialization_type(&self) -> MaterializationType {
        self.materialization.kind()
    }

    /// Whether a snapshot or descriptor exists to resurrect from
    pub fn is_resurrectable(&self) -> bool {
        matches!(
            self.status,
            CheckpointStatus::Checkpointed | CheckpointStatus::Resurrected
        )
    }
}

/// Materialized chunks persisted for full and partial checkpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    /// Stream the chunks belong to
    pub stream_id: String,
    /// Total chunks produced when the snapshot was taken
    pub seq: u64,
    /// Chunks dropped before `chunks[0]`
    pub partial_offset: u64,
    /// Retained chunks in production order
    pub chunks: Vec<Chunk>,
}

/// Options for `StreamCheckpointEngine::register_stream`
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Storage scope (defaults to the execution id)
    pub scope_id: Option<String>,
    /// Node configuration, for regeneration
    pub node_config: Option<serde_json::Value>,
    /// Node inputs, for regeneration
    pub inputs: Option<serde_json::Value>,
}

impl RegisterOptions {
    /// Set the storage scope
    pub fn scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    /// Capture the regeneration descriptor
    pub fn regeneration(mut self, node_config: serde_json::Value, inputs: serde_json::Value) -> Self {
        self.node_config = Some(node_config);
        self.inputs = Some(inputs);
        self
    }
}

/// Why a live stream is being cleaned up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    /// The source ended and every reader let go
    Completed,
    /// Every reader let go before the source ended
    Released,
    /// No activity within the stream timeout
    Timeout,
    /// The producer or a reader failed
    Error,
    /// The caller asked for the stream to be forgotten
    Discarded,
}

impl CleanupReason {
    /// Whether cleanup takes a final checkpoint first
    pub fn takes_final_checkpoint(self) -> bool {
        matches!(
            self,
            CleanupReason::Completed | CleanupReason::Released | CleanupReason::Timeout
        )
    }
}

/// Engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Streams with a live producer
    pub live_streams: usize,
    /// Checkpoints by status
    pub active: usize,
    /// Checkpoints with a persisted snapshot
    pub checkpointed: usize,
    /// Checkpoints resurrected at least once
    pub resurrected: usize,
    /// Terminal checkpoints still tracked
    pub expired: usize,
}

/// Re-produces a stream from scratch for `regenerate` resurrection.
///
/// Supplied by the orchestration layer at engine construction.
#[async_trait]
pub trait RegenerationCallback: Send + Sync {
    /// Run the producing node again with its original configuration and inputs
    async fn regenerate(
        &self,
        source_id: &str,
        node_config: &serde_json::Value,
        inputs: &serde_json::Value,
    ) -> Result<BoxStream<'static, Chunk>>;
}
