//! Tiered artifact storage
//!
//! Fast (in-process), durable (local backend), session (in-process, cleared
//! with the session) and external (content-addressed blobs) tiers, with
//! per-scope byte budgets and overflow policies from the `PolicyRegistry`.

pub mod backend;
pub mod compression;
pub mod policy;
pub mod store;
pub mod types;

pub use backend::{FileBackend, MemoryBackend, PersistenceBackend};
pub use policy::PolicyRegistry;
pub use store::{ArtifactStore, DEFAULT_FAST_ITEM_MAX_BYTES};
pub use types::{
    ArtifactMetadata, DataType, EvictionPreferences, OverflowPolicy, StorageStats, StoragePolicy,
    StoreHints, Tier, TierPreference, TierStats, DEFAULT_SCOPE,
};
