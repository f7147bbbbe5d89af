//! StreamKeep - Stream Checkpointing, Resurrection and Tiered Artifact Storage
//!
//! StreamKeep lets workflow producers hand a stream of chunks to several
//! consumers at once, keeps enough of that stream around to rebuild it for
//! consumers that come back late, and stores everything it keeps in a
//! budgeted, tiered artifact store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    StreamCheckpointEngine                         │
//! │                                                                   │
//! │  producer ──► pump ──┬──► branch 0 ──► consumer                   │
//! │                      ├──► branch 1 ──► consumer                   │
//! │                      └──► recorder (full / window / none)         │
//! │                                │                                  │
//! │  checkpoint sweep ─────────────┤     timeout sweep, release       │
//! │                                │     listener ──► cleanup         │
//! │  resurrect: replay | replay + truncation marker | regenerate      │
//! └────────────────────────────────┼──────────────────────────────────┘
//!                                  │ stream-checkpoint-meta-<id>
//!                                  │ stream-checkpoint-data-<id>
//! ┌────────────────────────────────▼──────────────────────────────────┐
//! │                         ArtifactStore                              │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────────────┐   │
//! │  │   Fast   │─►│ Durable  │  │ Session  │  │ External (blobs) │   │
//! │  └──────────┘  └────┬─────┘  └──────────┘  └────────┬─────────┘   │
//! │   per-scope budgets │ overflow: evict-lru, evict-oldest, fail,    │
//! │   (PolicyRegistry)  │ compress, external                          │
//! └─────────────────────┼─────────────────────────────────┼───────────┘
//!                       └──────── PersistenceBackend ─────┘
//!                              (file or memory)
//! ```
//!
//! ## Modules
//!
//! - [`stream`]: Stream fan-out, checkpointing and resurrection
//! - [`storage`]: Tiered artifact store, policies and persistence backends
//! - [`config`]: Configuration management
//! - [`error`]: Error types

pub mod config;
pub mod error;
pub mod storage;
pub mod stream;

pub use config::StreamKeepConfig;
pub use error::{Error, Result};
pub use storage::{ArtifactStore, PolicyRegistry, StoragePolicy, StoreHints};
pub use stream::{BranchStream, MaterializationType, StreamCheckpointEngine, StreamEvent};
