//! Stream checkpointing and resurrection
//!
//! `StreamCheckpointEngine` tees producer streams into branches, snapshots
//! them into the artifact store, and rebuilds them on demand by replay,
//! truncated replay, or regeneration.

pub mod engine;
pub mod tee;
pub mod types;

pub use engine::{EngineTasks, StreamCheckpointEngine};
pub use tee::BranchStream;
pub use types::{
    CheckpointSnapshot, CheckpointStatus, Chunk, CleanupReason, EngineStats, Materialization,
    MaterializationType, RegenerationCallback, RegenerationDescriptor, RegisterOptions,
    StreamCheckpoint, StreamEvent,
};
