//! StreamKeep configuration management

use crate::error::{Error, Result};
use crate::storage::{
    ArtifactStore, FileBackend, MemoryBackend, PersistenceBackend, PolicyRegistry, StoragePolicy,
    DEFAULT_FAST_ITEM_MAX_BYTES,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Main StreamKeep configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamKeepConfig {
    /// Stream checkpoint engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Artifact storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
}

impl StreamKeepConfig {
    /// Load a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall the background sweeps or admit nothing
    pub fn validate(&self) -> Result<()> {
        let e = &self.engine;
        if e.max_concurrent_streams == 0 {
            return Err(Error::Config("engine.max_concurrent_streams must be > 0".to_string()));
        }
        if e.auto_checkpoint_interval_ms == 0 || e.timeout_sweep_interval_ms == 0 {
            return Err(Error::Config("engine sweep intervals must be > 0".to_string()));
        }
        if e.partial_window_chunks == 0 {
            return Err(Error::Config("engine.partial_window_chunks must be > 0".to_string()));
        }
        if e.branch_buffer_chunks == 0 {
            return Err(Error::Config("engine.branch_buffer_chunks must be > 0".to_string()));
        }
        for (scope, policy) in std::iter::once(("default", &self.storage.default_policy))
            .chain(self.storage.scopes.iter().map(|(k, v)| (k.as_str(), v)))
        {
            if policy.durable_capacity_bytes == 0 {
                return Err(Error::Config(format!(
                    "storage policy {} has zero durable capacity",
                    scope
                )));
            }
        }
        Ok(())
    }
}

/// Stream checkpoint engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum concurrently live streams
    pub max_concurrent_streams: usize,

    /// Idle time after which a live stream is force-cleaned
    pub stream_timeout_ms: u64,

    /// Checkpoint sweep interval
    pub auto_checkpoint_interval_ms: u64,

    /// Minimum stream age before the sweep checkpoints it
    pub checkpoint_threshold_age_ms: u64,

    /// Timeout sweep interval
    pub timeout_sweep_interval_ms: u64,

    /// Allow reconstructing streams from checkpoints
    pub enable_resurrection: bool,

    /// Hard cap on resurrection attempts per stream
    pub max_resurrection_attempts: u32,

    /// Chunks retained by partial materialization
    pub partial_window_chunks: usize,

    /// Per-branch channel capacity; a full branch applies backpressure
    pub branch_buffer_chunks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 100,
            stream_timeout_ms: 30 * 60 * 1000,
            auto_checkpoint_interval_ms: 30_000,
            checkpoint_threshold_age_ms: 60_000,
            timeout_sweep_interval_ms: 60_000,
            enable_resurrection: true,
            max_resurrection_attempts: 3,
            partial_window_chunks: 10,
            branch_buffer_chunks: 64,
        }
    }
}

impl EngineConfig {
    /// Checkpoint sweep interval
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.auto_checkpoint_interval_ms)
    }

    /// Timeout sweep interval
    pub fn timeout_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_sweep_interval_ms)
    }
}

/// Which persistence backend sits below the durable and external tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// JSON files under `base_dir`
    #[default]
    File,
    /// Process memory only
    Memory,
}

/// Artifact storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for the file backend
    pub base_dir: PathBuf,

    /// Persistence backend
    pub backend: BackendKind,

    /// Values up to this size try the fast tier first
    pub fast_item_max_bytes: u64,

    /// Expired-artifact cleanup interval (0 disables the background task)
    pub cleanup_interval_ms: u64,

    /// Policy for scopes without an explicit entry
    pub default_policy: StoragePolicy,

    /// Per-scope policies
    pub scopes: HashMap<String, StoragePolicy>,
}

impl StorageConfig {
    /// Default base directory (<data dir>/streamkeep)
    pub fn default_dir() -> PathBuf {
        dirs_next::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("streamkeep")
    }

    /// Open the artifact store described by this configuration
    pub async fn open_store(&self) -> Result<ArtifactStore> {
        let policies = PolicyRegistry::with_scopes(self.default_policy.clone(), self.scopes.clone())?;
        let backend: Arc<dyn PersistenceBackend> = match self.backend {
            BackendKind::File => Arc::new(FileBackend::new(self.base_dir.clone()).await?),
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
        };
        ArtifactStore::open(Arc::new(policies), backend, self.fast_item_max_bytes).await
    }

    /// Expired-artifact cleanup interval, if enabled
    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_ms > 0).then(|| Duration::from_millis(self.cleanup_interval_ms))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: Self::default_dir(),
            backend: BackendKind::File,
            fast_item_max_bytes: DEFAULT_FAST_ITEM_MAX_BYTES,
            cleanup_interval_ms: 5 * 60 * 1000,
            default_policy: StoragePolicy::default(),
            scopes: HashMap::new(),
        }
    }
}
