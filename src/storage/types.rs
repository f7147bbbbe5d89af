//! Artifact storage data types
//!
//! Tiers, overflow policies, per-scope storage policies, artifact metadata
//! and the statistics returned to callers deciding whether to change policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scope charged when a write carries no explicit scope.
pub const DEFAULT_SCOPE: &str = "global";

/// Entries younger than this are skipped by eviction when `protect_recent`.
pub const RECENCY_FLOOR_MS: i64 = 60_000;

/// Where an artifact's payload lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// In-process memory, capacity-budgeted per scope
    Fast,
    /// Local persistence backend, capacity-budgeted per scope
    Durable,
    /// In-process, outlives consumer restarts, cleared with the session
    Session,
    /// Content-addressed blob storage
    External,
}

impl Tier {
    /// All tiers in reporting order
    pub const ALL: [Tier; 4] = [Tier::Fast, Tier::Durable, Tier::Session, Tier::External];
}

/// Caller preference for tier placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierPreference {
    /// Size-based placement: small values try the fast tier first
    #[default]
    Auto,
    /// Try the fast tier regardless of the item size threshold
    Fast,
    /// Skip the fast tier
    Durable,
    /// Force the session tier
    Session,
    /// Force the external blob tier
    External,
}

/// Action taken when a durable write would exceed the scope's capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict least-recently-accessed entries
    #[default]
    EvictLru,
    /// Evict oldest-created entries
    EvictOldest,
    /// Reject the write with `StorageFull`
    Fail,
    /// Compress the payload, evicting only if it still does not fit
    Compress,
    /// Send the payload to the external blob tier
    External,
}

/// Which entries an eviction pass must leave alone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionPreferences {
    /// Skip entries younger than `RECENCY_FLOOR_MS`
    #[serde(default)]
    pub protect_recent: bool,
    /// Evict rarely accessed entries first
    #[serde(default)]
    pub protect_frequent: bool,
    /// Never evict pinned entries
    #[serde(default = "default_true")]
    pub protect_pinned: bool,
}

fn default_true() -> bool {
    true
}

impl Default for EvictionPreferences {
    fn default() -> Self {
        Self {
            protect_recent: false,
            protect_frequent: false,
            protect_pinned: true,
        }
    }
}

/// Capacity and eviction policy for one scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePolicy {
    /// Fast tier byte budget
    pub fast_capacity_bytes: u64,
    /// Durable tier byte budget
    pub durable_capacity_bytes: u64,
    /// Behavior when the durable budget is exceeded
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// Eviction protections
    #[serde(default)]
    pub eviction: EvictionPreferences,
    /// Age after which unpinned temporary entries are removed (0 = never)
    #[serde(default)]
    pub auto_cleanup_age_ms: u64,
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self {
            fast_capacity_bytes: 64 * 1024 * 1024,
            durable_capacity_bytes: 1024 * 1024 * 1024,
            overflow_policy: OverflowPolicy::EvictLru,
            eviction: EvictionPreferences::default(),
            auto_cleanup_age_ms: 24 * 60 * 60 * 1000,
        }
    }
}

/// Kind of value stored under a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Arbitrary JSON value
    #[default]
    Json,
    /// UTF-8 text
    Text,
    /// Opaque bytes
    Binary,
    /// Materialized chunks of a checkpointed stream
    StreamSnapshot,
    /// Persisted `StreamCheckpoint` record
    CheckpointMeta,
}

/// Metadata tracked for every stored key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Artifact key
    pub key: String,
    /// Bytes charged to the tier (after compression)
    pub size_bytes: u64,
    /// Serialized size before compression
    pub original_size_bytes: u64,
    /// Current tier
    pub tier: Tier,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last read timestamp
    pub last_accessed_at: DateTime<Utc>,
    /// Number of reads
    pub access_count: u64,
    /// Eligible for age-based cleanup
    pub temporary: bool,
    /// Excluded from eviction
    pub pinned: bool,
    /// Payload is deflate-compressed
    #[serde(default)]
    pub compressed: bool,
    /// SHA-256 of the stored payload (external tier)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Owning scope
    pub scope_id: Option<String>,
    /// Producing node
    pub source_id: Option<String>,
    /// Producing execution
    pub execution_id: Option<String>,
    /// Kind of value
    pub data_type: DataType,
}

impl ArtifactMetadata {
    /// Scope this entry is charged to.
    pub fn scope(&self) -> &str {
        self.scope_id.as_deref().unwrap_or(DEFAULT_SCOPE)
    }

    /// Record a read.
    pub fn record_access(&mut self) {
        self.access_count += 1;
        self.last_accessed_at = Utc::now();
    }

    /// Age in milliseconds relative to `now`.
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_milliseconds()
    }
}

/// Placement hints for `ArtifactStore::store`
#[derive(Debug, Clone, Default)]
pub struct StoreHints {
    /// Scope the bytes are charged to
    pub scope_id: Option<String>,
    /// Producing node
    pub source_id: Option<String>,
    /// Producing execution
    pub execution_id: Option<String>,
    /// Eligible for age-based cleanup
    pub temporary: bool,
    /// Excluded from eviction
    pub pinned: bool,
    /// Tier preference
    pub tier: TierPreference,
    /// Kind of value
    pub data_type: DataType,
}

impl StoreHints {
    /// Hints charged to the given scope.
    pub fn scoped(scope_id: impl Into<String>) -> Self {
        Self {
            scope_id: Some(scope_id.into()),
            ..Default::default()
        }
    }

    /// Set the tier preference
    pub fn tier(mut self, tier: TierPreference) -> Self {
        self.tier = tier;
        self
    }

    /// Mark the entry pinned
    pub fn pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }

    /// Mark the entry temporary
    pub fn temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    /// Set the data type
    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    /// Set source and execution ids
    pub fn origin(mut self, source_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self.execution_id = Some(execution_id.into());
        self
    }
}

/// Count and bytes for one tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStats {
    /// Number of entries
    pub count: u64,
    /// Bytes charged
    pub bytes: u64,
}

impl TierStats {
    pub(crate) fn add(&mut self, bytes: u64) {
        self.count += 1;
        self.bytes += bytes;
    }

    pub(crate) fn sub(&mut self, bytes: u64) {
        self.count = self.count.saturating_sub(1);
        self.bytes = self.bytes.saturating_sub(bytes);
    }
}

/// Storage statistics, global or for one scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    /// Scope filter, `None` for global stats
    pub scope_id: Option<String>,
    /// Fast tier
    pub fast: TierStats,
    /// Durable tier
    pub durable: TierStats,
    /// Session tier
    pub session: TierStats,
    /// External tier
    pub external: TierStats,
    /// Pinned entries across tiers
    pub pinned: u64,
}

impl StorageStats {
    /// Stats for one tier
    pub fn tier(&self, tier: Tier) -> &TierStats {
        match tier {
            Tier::Fast => &self.fast,
            Tier::Durable => &self.durable,
            Tier::Session => &self.session,
            Tier::External => &self.external,
        }
    }

    pub(crate) fn tier_mut(&mut self, tier: Tier) -> &mut TierStats {
        match tier {
            Tier::Fast => &mut self.fast,
            Tier::Durable => &mut self.durable,
            Tier::Session => &mut self.session,
            Tier::External => &mut self.external,
        }
    }

    /// Entries across all tiers
    pub fn total_count(&self) -> u64 {
        Tier::ALL.iter().map(|t| self.tier(*t).count).sum()
    }

    /// Bytes across all tiers
    pub fn total_bytes(&self) -> u64 {
        Tier::ALL.iter().map(|t| self.tier(*t).bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_policy_serde_names() {
        let json = serde_json::to_string(&OverflowPolicy::EvictLru).unwrap();
        assert_eq!(json, "\"evict-lru\"");
        let parsed: OverflowPolicy = serde_json::from_str("\"evict-oldest\"").unwrap();
        assert_eq!(parsed, OverflowPolicy::EvictOldest);
    }

    #[test]
    fn test_policy_defaults_from_partial_toml() {
        let policy: StoragePolicy = toml::from_str(
            r#"
            fast_capacity_bytes = 100
            durable_capacity_bytes = 1000
            "#,
        )
        .unwrap();
        assert_eq!(policy.overflow_policy, OverflowPolicy::EvictLru);
        assert!(policy.eviction.protect_pinned);
        assert!(!policy.eviction.protect_recent);
        assert_eq!(policy.auto_cleanup_age_ms, 0);
    }

    #[test]
    fn test_stats_totals() {
        let mut stats = StorageStats::default();
        stats.tier_mut(Tier::Fast).add(10);
        stats.tier_mut(Tier::Durable).add(30);
        stats.tier_mut(Tier::Durable).add(5);
        stats.tier_mut(Tier::Durable).sub(5);
        assert_eq!(stats.total_count(), 2);
        assert_eq!(stats.total_bytes(), 40);
    }

    #[test]
    fn test_metadata_scope_default() {
        let now = Utc::now();
        let meta = ArtifactMetadata {
            key: "k".to_string(),
            size_bytes: 1,
            original_size_bytes: 1,
            tier: Tier::Fast,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            temporary: false,
            pinned: false,
            compressed: false,
            content_hash: None,
            scope_id: None,
            source_id: None,
            execution_id: None,
            data_type: DataType::Json,
        };
        assert_eq!(meta.scope(), DEFAULT_SCOPE);
    }
}
