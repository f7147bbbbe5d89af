//! Tiered artifact store
//!
//! Places every key in one of four tiers and enforces per-scope byte budgets.
//! All metadata, the in-process payloads (fast and session tiers) and the
//! per-scope usage counters live in a single `StoreIndex` behind one
//! `tokio::sync::RwLock`, so counters always change in the same critical
//! section as the metadata they describe.
//!
//! Writes, removals, pin changes and eviction passes for a scope are
//! serialized by a per-scope admission lock. An eviction plan computed under
//! that lock therefore stays valid until it is committed. Backend I/O never
//! happens while the index lock is held.

use super::backend::{content_hash, BlobRef, PersistedArtifact, PersistenceBackend};
use super::compression;
use super::policy::PolicyRegistry;
use super::types::{
    ArtifactMetadata, OverflowPolicy, StorageStats, StoragePolicy, StoreHints, Tier,
    TierPreference, DEFAULT_SCOPE, RECENCY_FLOOR_MS,
};
use crate::error::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Default upper bound for values that try the fast tier
pub const DEFAULT_FAST_ITEM_MAX_BYTES: u64 = 1024 * 1024;

/// Metadata index plus in-process payloads and usage counters
#[derive(Default)]
struct StoreIndex {
    entries: HashMap<String, ArtifactMetadata>,
    /// Payloads of fast and session tier entries
    memory: HashMap<String, Bytes>,
    /// Per-scope usage counters
    usage: HashMap<String, StorageStats>,
}

impl StoreIndex {
    /// Insert an entry, detaching any previous entry under the same key.
    fn insert(
        &mut self,
        metadata: ArtifactMetadata,
        payload: Option<Bytes>,
    ) -> Option<ArtifactMetadata> {
        let old = self.detach(&metadata.key);

        let usage = self.usage.entry(metadata.scope().to_string()).or_default();
        usage.tier_mut(metadata.tier).add(metadata.size_bytes);
        if metadata.pinned {
            usage.pinned += 1;
        }
        if let Some(payload) = payload {
            self.memory.insert(metadata.key.clone(), payload);
        }
        self.entries.insert(metadata.key.clone(), metadata);
        old
    }

    /// Remove an entry and its in-process payload, releasing its usage.
    fn detach(&mut self, key: &str) -> Option<ArtifactMetadata> {
        let metadata = self.entries.remove(key)?;
        if let Some(usage) = self.usage.get_mut(metadata.scope()) {
            usage.tier_mut(metadata.tier).sub(metadata.size_bytes);
            if metadata.pinned {
                usage.pinned = usage.pinned.saturating_sub(1);
            }
        }
        self.memory.remove(key);
        Some(metadata)
    }

    fn usage(&self, scope: &str, tier: Tier) -> u64 {
        self.usage
            .get(scope)
            .map(|u| u.tier(tier).bytes)
            .unwrap_or(0)
    }

    /// Bytes the existing entry for `key` already holds in this scope and tier
    fn resident_bytes(&self, key: &str, scope: &str, tier: Tier) -> u64 {
        self.entries
            .get(key)
            .filter(|m| m.tier == tier && m.scope() == scope)
            .map(|m| m.size_bytes)
            .unwrap_or(0)
    }

    fn scope_stats(&self, scope: &str) -> StorageStats {
        let mut stats = self.usage.get(scope).cloned().unwrap_or_default();
        stats.scope_id = Some(scope.to_string());
        stats
    }

    fn hash_referenced(&self, hash: &str) -> bool {
        self.entries
            .values()
            .any(|m| m.content_hash.as_deref() == Some(hash))
    }
}

/// Result of planning an eviction pass
#[derive(Debug, PartialEq)]
enum EvictionPlan {
    /// Victims in eviction order with their sizes
    Evict(Vec<(String, u64)>),
    /// Candidates cannot free enough; carries what they could free
    Impossible { freeable: u64 },
}

/// Choose the entries to evict from `tier` of `scope` to free `needed` bytes.
fn plan_eviction<'a>(
    entries: impl Iterator<Item = &'a ArtifactMetadata>,
    scope: &str,
    tier: Tier,
    exclude_key: &str,
    needed: u64,
    policy: &StoragePolicy,
    now: DateTime<Utc>,
) -> EvictionPlan {
    let prefs = policy.eviction;
    let mut candidates: Vec<&ArtifactMetadata> = entries
        .filter(|m| m.tier == tier && m.scope() == scope && m.key != exclude_key)
        .filter(|m| !(prefs.protect_pinned && m.pinned))
        .filter(|m| !(prefs.protect_recent && m.age_ms(now) < RECENCY_FLOOR_MS))
        .collect();

    candidates.sort_by(|a, b| {
        let by_frequency = if prefs.protect_frequent {
            a.access_count.cmp(&b.access_count)
        } else {
            Ordering::Equal
        };
        by_frequency
            .then_with(|| match policy.overflow_policy {
                OverflowPolicy::EvictOldest => a.created_at.cmp(&b.created_at),
                _ => a.last_accessed_at.cmp(&b.last_accessed_at),
            })
            .then_with(|| a.key.cmp(&b.key))
    });

    let mut victims = Vec::new();
    let mut freed = 0u64;
    for candidate in candidates {
        if freed >= needed {
            break;
        }
        freed += candidate.size_bytes;
        victims.push((candidate.key.clone(), candidate.size_bytes));
    }

    if freed >= needed {
        EvictionPlan::Evict(victims)
    } else {
        EvictionPlan::Impossible { freeable: freed }
    }
}

/// Payload prepared for a write
struct Prepared {
    data: Vec<u8>,
    original_size: u64,
    compressed: bool,
}

/// Tiered artifact store with per-scope capacity and eviction policy
pub struct ArtifactStore {
    fast_item_max_bytes: u64,
    policies: Arc<PolicyRegistry>,
    backend: Arc<dyn PersistenceBackend>,
    index: RwLock<StoreIndex>,
    scope_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ArtifactStore {
    /// Open a store, rebuilding the index from the backend's durable and
    /// external records. Fast and session tier contents do not survive a
    /// process restart.
    pub async fn open(
        policies: Arc<PolicyRegistry>,
        backend: Arc<dyn PersistenceBackend>,
        fast_item_max_bytes: u64,
    ) -> Result<Self> {
        let mut index = StoreIndex::default();
        let loaded = backend.load_metadata().await?;
        let count = loaded.len();
        for metadata in loaded {
            index.insert(metadata, None);
        }
        if count > 0 {
            tracing::info!(entries = count, "Restored artifact index from backend");
        }

        Ok(Self {
            fast_item_max_bytes,
            policies,
            backend,
            index: RwLock::new(index),
            scope_locks: Mutex::new(HashMap::new()),
        })
    }

    /// The policy registry consulted on every write
    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.policies
    }

    async fn scope_lock(&self, scope: &str) -> Arc<Mutex<()>> {
        self.scope_locks
            .lock()
            .await
            .entry(scope.to_string())
            .or_default()
            .clone()
    }

    // =========================================================================
    // Store
    // =========================================================================

    /// Serialize `value` as JSON and store it under `key`
    pub async fn store<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        hints: StoreHints,
    ) -> Result<ArtifactMetadata> {
        let data = serde_json::to_vec(value)?;
        self.store_bytes(key, data, hints).await
    }

    /// Store raw bytes under `key`, returning the resulting metadata
    pub async fn store_bytes(
        &self,
        key: &str,
        data: Vec<u8>,
        hints: StoreHints,
    ) -> Result<ArtifactMetadata> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("artifact key must not be empty".to_string()));
        }
        let scope = hints
            .scope_id
            .clone()
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string());
        let policy = self.policies.policy_for(&scope).await;

        let lock = self.scope_lock(&scope).await;
        let _guard = lock.lock().await;

        let size = data.len() as u64;
        let prepared = Prepared {
            data,
            original_size: size,
            compressed: false,
        };

        match hints.tier {
            TierPreference::Session => self.commit_memory(key, prepared, Tier::Session, &hints).await,
            TierPreference::External => self.write_external(key, prepared, &hints).await,
            TierPreference::Durable => self.store_durable(key, prepared, &scope, &policy, &hints).await,
            TierPreference::Fast | TierPreference::Auto => {
                let wants_fast =
                    hints.tier == TierPreference::Fast || size <= self.fast_item_max_bytes;
                if wants_fast && self.admit_fast(key, size, &scope, &policy).await {
                    self.commit_memory(key, prepared, Tier::Fast, &hints).await
                } else {
                    self.store_durable(key, prepared, &scope, &policy, &hints).await
                }
            }
        }
    }

    /// Make room in the fast tier, demoting victims to the durable tier.
    /// Returns whether `size` bytes now fit.
    async fn admit_fast(&self, key: &str, size: u64, scope: &str, policy: &StoragePolicy) -> bool {
        let capacity = policy.fast_capacity_bytes;
        if size > capacity {
            return false;
        }

        let plan = {
            let index = self.index.read().await;
            let used = index.usage(scope, Tier::Fast) - index.resident_bytes(key, scope, Tier::Fast);
            if used + size <= capacity {
                return true;
            }
            let needed = used + size - capacity;
            plan_eviction(
                index.entries.values(),
                scope,
                Tier::Fast,
                key,
                needed,
                policy,
                Utc::now(),
            )
        };

        let victims = match plan {
            EvictionPlan::Evict(victims) => victims,
            EvictionPlan::Impossible { freeable } => {
                tracing::debug!(
                    scope = %scope,
                    key = %key,
                    size,
                    freeable,
                    "Fast tier admission failed, falling through to durable tier"
                );
                return false;
            }
        };

        for (victim, _) in victims {
            if let Err(e) = self.demote(&victim, scope, policy).await {
                tracing::debug!(
                    scope = %scope,
                    key = %victim,
                    "Demotion refused, falling through to durable tier: {}",
                    e
                );
                return false;
            }
        }

        let index = self.index.read().await;
        let used = index.usage(scope, Tier::Fast) - index.resident_bytes(key, scope, Tier::Fast);
        used + size <= capacity
    }

    /// Move a fast tier entry out of the fast tier without losing its payload.
    /// Demotion is a durable admission: it is charged to the durable budget
    /// and the scope's overflow policy decides what happens when that is full.
    async fn demote(&self, key: &str, scope: &str, policy: &StoragePolicy) -> Result<()> {
        let (metadata, payload) = {
            let index = self.index.read().await;
            let metadata = index
                .entries
                .get(key)
                .filter(|m| m.tier == Tier::Fast)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("fast tier artifact {}", key)))?;
            let payload = index
                .memory
                .get(key)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("fast tier payload missing for {}", key)))?;
            (metadata, payload)
        };

        let created_at = metadata.created_at;
        let mut demoted = metadata;
        demoted.tier = Tier::Durable;
        let mut data = payload.to_vec();

        let capacity = policy.durable_capacity_bytes;
        let used = self.index.read().await.usage(scope, Tier::Durable);
        let size = demoted.size_bytes;
        if used + size > capacity {
            match policy.overflow_policy {
                OverflowPolicy::Fail => {
                    return Err(Error::StorageFull {
                        key: key.to_string(),
                        scope: scope.to_string(),
                        size_bytes: size,
                        capacity_bytes: capacity,
                        stats: self.index.read().await.scope_stats(scope),
                    });
                }
                OverflowPolicy::EvictLru | OverflowPolicy::EvictOldest => {
                    self.evict_durable(key, scope, used + size - capacity, policy)
                        .await?;
                }
                OverflowPolicy::Compress => {
                    if !demoted.compressed {
                        data = compression::compress(&data)?;
                        demoted.compressed = true;
                        demoted.size_bytes = data.len() as u64;
                    }
                    if used + demoted.size_bytes > capacity {
                        self.evict_durable(key, scope, used + demoted.size_bytes - capacity, policy)
                            .await?;
                    }
                }
                OverflowPolicy::External => {
                    let hash = content_hash(&data);
                    self.backend.put_blob(&hash, &data).await?;
                    demoted.tier = Tier::External;
                    demoted.content_hash = Some(hash.clone());
                    self.backend
                        .put_blob_ref(&BlobRef {
                            metadata: demoted.clone(),
                            content_hash: hash,
                        })
                        .await?;
                }
            }
        }

        if demoted.tier == Tier::Durable {
            self.backend
                .put_artifact(&PersistedArtifact {
                    metadata: demoted.clone(),
                    payload: data,
                })
                .await?;
        }

        let mut index = self.index.write().await;
        let unchanged = index
            .entries
            .get(key)
            .is_some_and(|m| m.tier == Tier::Fast && m.created_at == created_at);
        if unchanged {
            tracing::debug!(
                key = %key,
                tier = ?demoted.tier,
                bytes = demoted.size_bytes,
                "Demoted artifact out of fast tier"
            );
            // The replaced fast entry holds no backend records
            index.insert(demoted, None);
        }
        Ok(())
    }

    /// Durable admission with overflow handling
    async fn store_durable(
        &self,
        key: &str,
        prepared: Prepared,
        scope: &str,
        policy: &StoragePolicy,
        hints: &StoreHints,
    ) -> Result<ArtifactMetadata> {
        let capacity = policy.durable_capacity_bytes;
        let used = {
            let index = self.index.read().await;
            index.usage(scope, Tier::Durable) - index.resident_bytes(key, scope, Tier::Durable)
        };
        let size = prepared.data.len() as u64;
        if used + size <= capacity {
            return self.write_durable(key, prepared, hints).await;
        }

        match policy.overflow_policy {
            OverflowPolicy::Fail => {
                let stats = self.index.read().await.scope_stats(scope);
                tracing::debug!(scope = %scope, key = %key, size, "Durable tier full, rejecting write");
                Err(Error::StorageFull {
                    key: key.to_string(),
                    scope: scope.to_string(),
                    size_bytes: size,
                    capacity_bytes: capacity,
                    stats,
                })
            }
            OverflowPolicy::EvictLru | OverflowPolicy::EvictOldest => {
                self.evict_durable(key, scope, used + size - capacity, policy)
                    .await?;
                self.write_durable(key, prepared, hints).await
            }
            OverflowPolicy::Compress => {
                let packed = compression::compress(&prepared.data)?;
                let packed_size = packed.len() as u64;
                tracing::debug!(
                    key = %key,
                    original = size,
                    compressed = packed_size,
                    "Compressed payload for durable tier"
                );
                let prepared = Prepared {
                    data: packed,
                    original_size: prepared.original_size,
                    compressed: true,
                };
                if used + packed_size > capacity {
                    self.evict_durable(key, scope, used + packed_size - capacity, policy)
                        .await?;
                }
                self.write_durable(key, prepared, hints).await
            }
            OverflowPolicy::External => self.write_external(key, prepared, hints).await,
        }
    }

    /// Evict durable entries of `scope` until `needed` bytes are free.
    /// Either the whole plan is committed or nothing changes.
    async fn evict_durable(
        &self,
        key: &str,
        scope: &str,
        needed: u64,
        policy: &StoragePolicy,
    ) -> Result<()> {
        let evicted = {
            let mut index = self.index.write().await;
            let plan = plan_eviction(
                index.entries.values(),
                scope,
                Tier::Durable,
                key,
                needed,
                policy,
                Utc::now(),
            );
            let victims = match plan {
                EvictionPlan::Evict(victims) => victims,
                EvictionPlan::Impossible { freeable } => {
                    return Err(Error::EvictionImpossible {
                        key: key.to_string(),
                        scope: scope.to_string(),
                        required_bytes: needed,
                        freeable_bytes: freeable,
                        stats: index.scope_stats(scope),
                    });
                }
            };
            victims
                .iter()
                .filter_map(|(victim, _)| index.detach(victim))
                .collect::<Vec<_>>()
        };

        for metadata in &evicted {
            tracing::info!(
                scope = %scope,
                key = %metadata.key,
                bytes = metadata.size_bytes,
                "Evicted artifact from durable tier"
            );
            self.release_backend(metadata, None).await;
        }
        Ok(())
    }

    async fn write_durable(
        &self,
        key: &str,
        prepared: Prepared,
        hints: &StoreHints,
    ) -> Result<ArtifactMetadata> {
        let metadata = new_metadata(key, hints, Tier::Durable, &prepared, None);
        let record = PersistedArtifact {
            metadata,
            payload: prepared.data,
        };
        self.backend.put_artifact(&record).await?;
        self.commit(record.metadata, None).await
    }

    async fn write_external(
        &self,
        key: &str,
        prepared: Prepared,
        hints: &StoreHints,
    ) -> Result<ArtifactMetadata> {
        let hash = content_hash(&prepared.data);
        self.backend.put_blob(&hash, &prepared.data).await?;
        let metadata = new_metadata(key, hints, Tier::External, &prepared, Some(hash.clone()));
        self.backend
            .put_blob_ref(&BlobRef {
                metadata: metadata.clone(),
                content_hash: hash,
            })
            .await?;
        tracing::debug!(key = %key, bytes = metadata.size_bytes, "Stored artifact in external tier");
        self.commit(metadata, None).await
    }

    async fn commit_memory(
        &self,
        key: &str,
        prepared: Prepared,
        tier: Tier,
        hints: &StoreHints,
    ) -> Result<ArtifactMetadata> {
        let metadata = new_metadata(key, hints, tier, &prepared, None);
        self.commit(metadata, Some(Bytes::from(prepared.data))).await
    }

    /// Publish new metadata and clean up whatever it replaced.
    async fn commit(
        &self,
        metadata: ArtifactMetadata,
        payload: Option<Bytes>,
    ) -> Result<ArtifactMetadata> {
        let replaced = self.index.write().await.insert(metadata.clone(), payload);
        if let Some(old) = replaced {
            self.release_backend(&old, Some(&metadata)).await;
        }
        Ok(metadata)
    }

    /// Delete the backend records of a detached entry unless its replacement
    /// reuses them. Failures are logged; accounting is already settled.
    async fn release_backend(&self, old: &ArtifactMetadata, replacement: Option<&ArtifactMetadata>) {
        let replaced_in = replacement.map(|m| m.tier);
        let result = match old.tier {
            Tier::Fast | Tier::Session => Ok(()),
            Tier::Durable if replaced_in == Some(Tier::Durable) => Ok(()),
            Tier::Durable => self.backend.delete_artifact(&old.key).await,
            Tier::External => {
                let mut result = Ok(());
                if replaced_in != Some(Tier::External) {
                    result = self.backend.delete_blob_ref(&old.key).await;
                }
                if let Some(hash) = old.content_hash.as_deref() {
                    let referenced = self.index.read().await.hash_referenced(hash);
                    if !referenced && result.is_ok() {
                        result = self.backend.delete_blob(hash).await;
                    }
                }
                result
            }
        };
        if let Err(e) = result {
            tracing::warn!(key = %old.key, tier = ?old.tier, "Failed to release backend record: {}", e);
        }
    }

    // =========================================================================
    // Retrieve
    // =========================================================================

    /// Retrieve and deserialize a JSON value
    pub async fn retrieve<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let data = self.retrieve_bytes(key).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Retrieve raw bytes, recording an access
    pub async fn retrieve_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let (metadata, resident) = {
            let mut index = self.index.write().await;
            let resident = index.memory.get(key).cloned();
            let metadata = index
                .entries
                .get_mut(key)
                .ok_or_else(|| Error::NotFound(format!("artifact {}", key)))?;
            metadata.record_access();
            (metadata.clone(), resident)
        };

        let stored = match metadata.tier {
            Tier::Fast | Tier::Session => resident
                .map(|b| b.to_vec())
                .ok_or_else(|| Error::Internal(format!("in-process payload missing for {}", key)))?,
            Tier::Durable => self
                .backend
                .get_artifact(key)
                .await?
                .map(|r| r.payload)
                .ok_or_else(|| Error::NotFound(format!("durable record for {}", key)))?,
            Tier::External => {
                let hash = metadata
                    .content_hash
                    .as_deref()
                    .ok_or_else(|| Error::Internal(format!("external artifact {} has no hash", key)))?;
                self.backend
                    .get_blob(hash)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("blob {} for {}", hash, key)))?
            }
        };

        if metadata.compressed {
            compression::decompress(&stored)
        } else {
            Ok(stored)
        }
    }

    /// Metadata for a key, without recording an access
    pub async fn metadata(&self, key: &str) -> Option<ArtifactMetadata> {
        self.index.read().await.entries.get(key).cloned()
    }

    /// Whether a key is stored
    pub async fn contains(&self, key: &str) -> bool {
        self.index.read().await.entries.contains_key(key)
    }

    /// Keys starting with `prefix`, sorted
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .index
            .read()
            .await
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    // =========================================================================
    // Pinning and removal
    // =========================================================================

    /// Exclude a key from eviction
    pub async fn pin(&self, key: &str) -> Result<()> {
        self.set_pinned(key, true).await
    }

    /// Make a key evictable again
    pub async fn unpin(&self, key: &str) -> Result<()> {
        self.set_pinned(key, false).await
    }

    async fn scope_of(&self, key: &str) -> Result<String> {
        self.index
            .read()
            .await
            .entries
            .get(key)
            .map(|m| m.scope().to_string())
            .ok_or_else(|| Error::NotFound(format!("artifact {}", key)))
    }

    async fn set_pinned(&self, key: &str, pinned: bool) -> Result<()> {
        let scope = self.scope_of(key).await?;
        let lock = self.scope_lock(&scope).await;
        let _guard = lock.lock().await;

        let updated = {
            let mut index = self.index.write().await;
            let metadata = index
                .entries
                .get_mut(key)
                .ok_or_else(|| Error::NotFound(format!("artifact {}", key)))?;
            if metadata.pinned == pinned {
                return Ok(());
            }
            metadata.pinned = pinned;
            let updated = metadata.clone();
            if let Some(usage) = index.usage.get_mut(updated.scope()) {
                if pinned {
                    usage.pinned += 1;
                } else {
                    usage.pinned = usage.pinned.saturating_sub(1);
                }
            }
            updated
        };

        self.persist_metadata(&updated).await;
        Ok(())
    }

    /// Rewrite the backend copy of an entry's metadata (best effort)
    async fn persist_metadata(&self, metadata: &ArtifactMetadata) {
        let result = match metadata.tier {
            Tier::Fast | Tier::Session => Ok(()),
            Tier::Durable => match self.backend.get_artifact(&metadata.key).await {
                Ok(Some(mut record)) => {
                    record.metadata = metadata.clone();
                    self.backend.put_artifact(&record).await
                }
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            },
            Tier::External => match metadata.content_hash.clone() {
                Some(content_hash) => {
                    self.backend
                        .put_blob_ref(&BlobRef {
                            metadata: metadata.clone(),
                            content_hash,
                        })
                        .await
                }
                None => Ok(()),
            },
        };
        if let Err(e) = result {
            tracing::warn!(key = %metadata.key, "Failed to persist artifact metadata: {}", e);
        }
    }

    /// Remove a key from whichever tier holds it
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let scope = match self.scope_of(key).await {
            Ok(scope) => scope,
            Err(Error::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let lock = self.scope_lock(&scope).await;
        let _guard = lock.lock().await;

        let detached = self.index.write().await.detach(key);
        match detached {
            Some(metadata) => {
                self.release_backend(&metadata, None).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove unpinned temporary entries older than their scope's
    /// `auto_cleanup_age_ms`. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let scopes: Vec<String> = self.index.read().await.usage.keys().cloned().collect();

        let mut removed = 0;
        for scope in scopes {
            let policy = self.policies.policy_for(&scope).await;
            if policy.auto_cleanup_age_ms == 0 {
                continue;
            }
            let max_age = policy.auto_cleanup_age_ms as i64;

            let lock = self.scope_lock(&scope).await;
            let _guard = lock.lock().await;

            let expired: Vec<ArtifactMetadata> = {
                let mut index = self.index.write().await;
                let keys: Vec<String> = index
                    .entries
                    .values()
                    .filter(|m| m.scope() == scope && m.temporary && !m.pinned)
                    .filter(|m| m.age_ms(now) > max_age)
                    .map(|m| m.key.clone())
                    .collect();
                keys.iter().filter_map(|k| index.detach(k)).collect()
            };

            for metadata in &expired {
                self.release_backend(metadata, None).await;
            }
            removed += expired.len();
        }

        if removed > 0 {
            tracing::info!("Cleaned up {} expired artifacts", removed);
        }
        Ok(removed)
    }

    /// Drop every session tier entry
    pub async fn clear_session(&self) -> usize {
        let mut index = self.index.write().await;
        let keys: Vec<String> = index
            .entries
            .values()
            .filter(|m| m.tier == Tier::Session)
            .map(|m| m.key.clone())
            .collect();
        for key in &keys {
            index.detach(key);
        }
        keys.len()
    }

    /// Spawn a background task running `cleanup_expired` periodically.
    pub fn spawn_auto_cleanup(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the first immediate tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.cleanup_expired().await {
                    tracing::warn!("Artifact cleanup failed: {}", e);
                }
            }
        })
    }

    // =========================================================================
    // Stats
    // =========================================================================

    /// Counts and bytes per tier, globally or for one scope
    pub async fn stats(&self, scope_id: Option<&str>) -> StorageStats {
        let index = self.index.read().await;
        match scope_id {
            Some(scope) => index.scope_stats(scope),
            None => {
                let mut total = StorageStats::default();
                for usage in index.usage.values() {
                    for tier in Tier::ALL {
                        let t = usage.tier(tier);
                        let acc = total.tier_mut(tier);
                        acc.count += t.count;
                        acc.bytes += t.bytes;
                    }
                    total.pinned += usage.pinned;
                }
                total
            }
        }
    }

    /// Recompute per-scope usage from metadata and compare with the tracked
    /// counters. Returns the scopes whose counters drifted.
    #[cfg(test)]
    pub(crate) async fn accounting_drift(&self) -> Vec<String> {
        let index = self.index.read().await;
        let mut recomputed: HashMap<String, StorageStats> = HashMap::new();
        for m in index.entries.values() {
            let stats = recomputed.entry(m.scope().to_string()).or_default();
            stats.tier_mut(m.tier).add(m.size_bytes);
            if m.pinned {
                stats.pinned += 1;
            }
        }
        let mut drifted = Vec::new();
        for (scope, tracked) in &index.usage {
            let expected = recomputed.remove(scope).unwrap_or_default();
            if Tier::ALL
                .iter()
                .any(|t| tracked.tier(*t) != expected.tier(*t))
                || tracked.pinned != expected.pinned
            {
                drifted.push(scope.clone());
            }
        }
        drifted.extend(recomputed.into_keys());
        drifted
    }
}

fn new_metadata(
    key: &str,
    hints: &StoreHints,
    tier: Tier,
    prepared: &Prepared,
    content_hash: Option<String>,
) -> ArtifactMetadata {
    let now = Utc::now();
    ArtifactMetadata {
        key: key.to_string(),
        size_bytes: prepared.data.len() as u64,
        original_size_bytes: prepared.original_size,
        tier,
        created_at: now,
        last_accessed_at: now,
        access_count: 0,
        temporary: hints.temporary,
        pinned: hints.pinned,
        compressed: prepared.compressed,
        content_hash,
        scope_id: Some(
            hints
                .scope_id
                .clone()
                .unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
        ),
        source_id: hints.source_id.clone(),
        execution_id: hints.execution_id.clone(),
        data_type: hints.data_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::{FileBackend, MemoryBackend};
    use crate::storage::types::{DataType, EvictionPreferences};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    const SCOPE: &str = "wf-1";

    fn policy(fast: u64, durable: u64, overflow: OverflowPolicy) -> StoragePolicy {
        StoragePolicy {
            fast_capacity_bytes: fast,
            durable_capacity_bytes: durable,
            overflow_policy: overflow,
            eviction: EvictionPreferences::default(),
            auto_cleanup_age_ms: 0,
        }
    }

    async fn make_store(p: StoragePolicy) -> (ArtifactStore, Arc<MemoryBackend>) {
        let registry = Arc::new(PolicyRegistry::default());
        registry.set_policy(SCOPE, p).await.unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let store = ArtifactStore::open(registry, backend.clone(), DEFAULT_FAST_ITEM_MAX_BYTES)
            .await
            .unwrap();
        (store, backend)
    }

    fn hints() -> StoreHints {
        StoreHints::scoped(SCOPE)
    }

    fn bytes(n: usize, fill: u8) -> Vec<u8> {
        vec![fill; n]
    }

    async fn tier_of(store: &ArtifactStore, key: &str) -> Option<Tier> {
        store.metadata(key).await.map(|m| m.tier)
    }

    #[tokio::test]
    async fn test_small_value_goes_fast_and_round_trips() {
        let (store, _) = make_store(StoragePolicy::default()).await;
        let value = serde_json::json!({"rows": [1, 2, 3]});
        let meta = store.store("k", &value, hints()).await.unwrap();
        assert_eq!(meta.tier, Tier::Fast);
        assert_eq!(meta.size_bytes, serde_json::to_vec(&value).unwrap().len() as u64);

        let back: serde_json::Value = store.retrieve("k").await.unwrap();
        assert_eq!(back, value);
        assert_eq!(store.metadata("k").await.unwrap().access_count, 1);
    }

    #[tokio::test]
    async fn test_large_value_skips_fast_tier() {
        let registry = Arc::new(PolicyRegistry::default());
        let store = ArtifactStore::open(registry, Arc::new(MemoryBackend::new()), 16)
            .await
            .unwrap();
        store.store_bytes("big", bytes(17, 1), StoreHints::default()).await.unwrap();
        store.store_bytes("small", bytes(16, 1), StoreHints::default()).await.unwrap();
        assert_eq!(tier_of(&store, "big").await, Some(Tier::Durable));
        assert_eq!(tier_of(&store, "small").await, Some(Tier::Fast));
        assert_eq!(store.retrieve_bytes("big").await.unwrap(), bytes(17, 1));
    }

    #[tokio::test]
    async fn test_fourth_artifact_evicts_least_recently_accessed() {
        // Three 40-byte artifacts fill the fast tier exactly
        let (store, _) = make_store(policy(120, 10_000, OverflowPolicy::EvictLru)).await;
        for key in ["a", "b", "c"] {
            store.store_bytes(key, bytes(40, 0), hints()).await.unwrap();
        }
        // Touch a and c so b is the least recently accessed
        store.retrieve_bytes("a").await.unwrap();
        store.retrieve_bytes("c").await.unwrap();

        let meta = store.store_bytes("d", bytes(40, 0), hints()).await.unwrap();
        assert_eq!(meta.tier, Tier::Fast);

        assert_eq!(tier_of(&store, "a").await, Some(Tier::Fast));
        assert_eq!(tier_of(&store, "b").await, Some(Tier::Durable));
        assert_eq!(tier_of(&store, "c").await, Some(Tier::Fast));
        // Demotion keeps the payload
        assert_eq!(store.retrieve_bytes("b").await.unwrap(), bytes(40, 0));

        let stats = store.stats(Some(SCOPE)).await;
        assert_eq!(stats.fast.bytes, 120);
        assert_eq!(stats.durable.bytes, 40);
        assert!(store.accounting_drift().await.is_empty());
    }

    #[tokio::test]
    async fn test_fast_capacity_100_demotes_one_per_overflowing_write() {
        let (store, _) = make_store(policy(100, 10_000, OverflowPolicy::EvictLru)).await;
        for key in ["a", "b", "c", "d"] {
            store.store_bytes(key, bytes(40, 0), hints()).await.unwrap();
        }
        assert_eq!(tier_of(&store, "a").await, Some(Tier::Durable));
        assert_eq!(tier_of(&store, "b").await, Some(Tier::Durable));
        assert_eq!(tier_of(&store, "c").await, Some(Tier::Fast));
        assert_eq!(tier_of(&store, "d").await, Some(Tier::Fast));
        assert_eq!(store.stats(Some(SCOPE)).await.fast.bytes, 80);
    }

    #[tokio::test]
    async fn test_fast_admission_falls_through_when_everything_pinned() {
        let (store, _) = make_store(policy(100, 10_000, OverflowPolicy::EvictLru)).await;
        store
            .store_bytes("p1", bytes(50, 0), hints().pinned(true))
            .await
            .unwrap();
        store
            .store_bytes("p2", bytes(50, 0), hints().pinned(true))
            .await
            .unwrap();
        let meta = store.store_bytes("x", bytes(10, 0), hints()).await.unwrap();
        assert_eq!(meta.tier, Tier::Durable);
        assert_eq!(tier_of(&store, "p1").await, Some(Tier::Fast));
        assert_eq!(tier_of(&store, "p2").await, Some(Tier::Fast));
    }

    #[tokio::test]
    async fn test_fast_churn_stays_within_durable_budget_under_fail() {
        let (store, _) = make_store(policy(100, 50, OverflowPolicy::Fail)).await;
        let mut stored = Vec::new();
        for i in 0..6 {
            let key = format!("k{}", i);
            match store.store_bytes(&key, bytes(40, i as u8), hints()).await {
                Ok(_) => stored.push((key, i as u8)),
                Err(e) => assert!(e.is_capacity_related(), "{e}"),
            }
        }

        let stats = store.stats(Some(SCOPE)).await;
        assert!(stats.durable.bytes <= 50, "durable holds {} bytes", stats.durable.bytes);
        assert!(stats.fast.bytes <= 100);
        assert!(store.accounting_drift().await.is_empty());
        // The first demotion fits, the second is refused and the write is rejected
        assert_eq!(tier_of(&store, "k0").await, Some(Tier::Durable));
        assert!(!store.contains("k3").await);
        for (key, fill) in stored {
            assert_eq!(store.retrieve_bytes(&key).await.unwrap(), bytes(40, fill));
        }
    }

    #[tokio::test]
    async fn test_demotion_evicts_durable_entries_under_lru() {
        let (store, _) = make_store(policy(100, 50, OverflowPolicy::EvictLru)).await;
        for i in 0..6 {
            store
                .store_bytes(&format!("k{}", i), bytes(40, i as u8), hints())
                .await
                .unwrap();
        }

        let stats = store.stats(Some(SCOPE)).await;
        assert_eq!(stats.durable.bytes, 40);
        assert_eq!(stats.fast.bytes, 80);
        assert_eq!(tier_of(&store, "k3").await, Some(Tier::Durable));
        assert_eq!(tier_of(&store, "k4").await, Some(Tier::Fast));
        assert_eq!(tier_of(&store, "k5").await, Some(Tier::Fast));
        assert!(!store.contains("k0").await);
        assert!(store.accounting_drift().await.is_empty());
    }

    #[tokio::test]
    async fn test_demotion_routes_to_external_when_durable_is_full() {
        let (store, backend) = make_store(policy(100, 50, OverflowPolicy::External)).await;
        for key in ["a", "b", "c", "d"] {
            store.store_bytes(key, bytes(40, 7), hints()).await.unwrap();
        }

        assert_eq!(tier_of(&store, "a").await, Some(Tier::Durable));
        assert_eq!(tier_of(&store, "b").await, Some(Tier::External));
        assert_eq!(store.retrieve_bytes("b").await.unwrap(), bytes(40, 7));
        assert_eq!(backend.blob_count().await, 1);

        let stats = store.stats(Some(SCOPE)).await;
        assert_eq!(stats.durable.bytes, 40);
        assert_eq!(stats.external.bytes, 40);
        assert!(store.accounting_drift().await.is_empty());
    }

    #[tokio::test]
    async fn test_demotion_compresses_when_durable_is_full() {
        let (store, _) = make_store(policy(100, 60, OverflowPolicy::Compress)).await;
        for key in ["a", "b", "c", "d"] {
            store.store_bytes(key, bytes(40, 0), hints()).await.unwrap();
        }

        let b = store.metadata("b").await.unwrap();
        assert_eq!(b.tier, Tier::Durable);
        assert!(b.compressed);
        assert!(b.size_bytes < 40);
        assert_eq!(b.original_size_bytes, 40);
        assert_eq!(store.retrieve_bytes("b").await.unwrap(), bytes(40, 0));
        assert!(store.stats(Some(SCOPE)).await.durable.bytes <= 60);
        assert!(store.accounting_drift().await.is_empty());
    }

    #[tokio::test]
    async fn test_fail_policy_reports_stats_and_changes_nothing() {
        let (store, backend) = make_store(policy(0, 100, OverflowPolicy::Fail)).await;
        store.store_bytes("a", bytes(60, 0), hints()).await.unwrap();
        store.store_bytes("b", bytes(40, 0), hints()).await.unwrap();
        let before = store.stats(Some(SCOPE)).await;
        let before_meta = store.metadata("a").await.unwrap();

        let err = store
            .store_bytes("c", bytes(1, 0), hints())
            .await
            .unwrap_err();
        match err {
            Error::StorageFull {
                key,
                scope,
                size_bytes,
                capacity_bytes,
                stats,
            } => {
                assert_eq!(key, "c");
                assert_eq!(scope, SCOPE);
                assert_eq!(size_bytes, 1);
                assert_eq!(capacity_bytes, 100);
                assert_eq!(stats.durable.bytes, 100);
                assert_eq!(stats.durable.count, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert_eq!(store.stats(Some(SCOPE)).await, before);
        assert_eq!(store.metadata("a").await.unwrap(), before_meta);
        assert!(!store.contains("c").await);
        assert!(backend.get_artifact("c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evict_oldest_ignores_access_recency() {
        let (store, _) = make_store(policy(0, 100, OverflowPolicy::EvictOldest)).await;
        store.store_bytes("old", bytes(50, 0), hints()).await.unwrap();
        store.store_bytes("new", bytes(50, 0), hints()).await.unwrap();
        // Reading "old" makes it most recently used, but it is still oldest
        store.retrieve_bytes("old").await.unwrap();

        store.store_bytes("x", bytes(50, 0), hints()).await.unwrap();
        assert!(!store.contains("old").await);
        assert!(store.contains("new").await);
    }

    #[tokio::test]
    async fn test_evict_lru_on_durable_deletes_backend_record() {
        let (store, backend) = make_store(policy(0, 100, OverflowPolicy::EvictLru)).await;
        store.store_bytes("a", bytes(50, 0), hints()).await.unwrap();
        store.store_bytes("b", bytes(50, 0), hints()).await.unwrap();
        store.retrieve_bytes("a").await.unwrap();

        store.store_bytes("c", bytes(50, 0), hints()).await.unwrap();
        assert!(store.contains("a").await);
        assert!(!store.contains("b").await);
        assert!(backend.get_artifact("b").await.unwrap().is_none());
        assert!(matches!(
            store.retrieve_bytes("b").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_eviction_impossible_is_atomic() {
        let (store, _) = make_store(policy(0, 100, OverflowPolicy::EvictLru)).await;
        store
            .store_bytes("pinned", bytes(70, 0), hints().pinned(true))
            .await
            .unwrap();
        store.store_bytes("loose", bytes(30, 0), hints()).await.unwrap();

        let err = store
            .store_bytes("x", bytes(60, 0), hints())
            .await
            .unwrap_err();
        match err {
            Error::EvictionImpossible {
                required_bytes,
                freeable_bytes,
                ..
            } => {
                assert_eq!(required_bytes, 60);
                assert_eq!(freeable_bytes, 30);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // The evictable entry survived the failed pass
        assert!(store.contains("loose").await);
        assert_eq!(store.stats(Some(SCOPE)).await.durable.bytes, 100);
    }

    #[tokio::test]
    async fn test_compress_policy_fits_without_eviction() {
        let (store, _) = make_store(policy(0, 100, OverflowPolicy::Compress)).await;
        store.store_bytes("a", bytes(60, 0), hints()).await.unwrap();

        let payload = "abcd".repeat(50).into_bytes();
        let meta = store.store_bytes("packed", payload.clone(), hints()).await.unwrap();
        assert!(meta.compressed);
        assert_eq!(meta.original_size_bytes, 200);
        assert!(meta.size_bytes < 40);
        assert!(store.contains("a").await);

        assert_eq!(store.retrieve_bytes("packed").await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_compress_policy_evicts_when_still_too_big() {
        let (store, _) = make_store(policy(0, 100, OverflowPolicy::Compress)).await;
        store.store_bytes("a", bytes(99, 7), hints()).await.unwrap();

        let payload = "xy".repeat(100).into_bytes();
        let meta = store.store_bytes("packed", payload.clone(), hints()).await.unwrap();
        assert!(meta.compressed);
        assert!(!store.contains("a").await);
        assert_eq!(store.retrieve_bytes("packed").await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_external_policy_routes_to_blob_tier() {
        let (store, backend) = make_store(policy(0, 50, OverflowPolicy::External)).await;
        store.store_bytes("a", bytes(50, 0), hints()).await.unwrap();
        let meta = store.store_bytes("b", bytes(80, 3), hints()).await.unwrap();
        assert_eq!(meta.tier, Tier::External);
        assert!(meta.content_hash.is_some());
        assert!(store.contains("a").await);
        assert_eq!(backend.blob_count().await, 1);
        assert_eq!(store.retrieve_bytes("b").await.unwrap(), bytes(80, 3));

        let stats = store.stats(Some(SCOPE)).await;
        assert_eq!(stats.external.bytes, 80);
        assert_eq!(stats.durable.bytes, 50);
    }

    #[tokio::test]
    async fn test_external_blob_shared_until_last_reference_removed() {
        let (store, backend) = make_store(StoragePolicy::default()).await;
        let h = hints().tier(TierPreference::External);
        store.store_bytes("a", bytes(10, 9), h.clone()).await.unwrap();
        store.store_bytes("b", bytes(10, 9), h).await.unwrap();
        assert_eq!(backend.blob_count().await, 1);

        assert!(store.remove("a").await.unwrap());
        assert_eq!(backend.blob_count().await, 1);
        assert_eq!(store.retrieve_bytes("b").await.unwrap(), bytes(10, 9));

        assert!(store.remove("b").await.unwrap());
        assert_eq!(backend.blob_count().await, 0);
    }

    #[tokio::test]
    async fn test_session_tier_and_clear() {
        let (store, _) = make_store(StoragePolicy::default()).await;
        store
            .store("state", &"critical", hints().tier(TierPreference::Session))
            .await
            .unwrap();
        assert_eq!(tier_of(&store, "state").await, Some(Tier::Session));
        let value: String = store.retrieve("state").await.unwrap();
        assert_eq!(value, "critical");

        assert_eq!(store.clear_session().await, 1);
        assert!(!store.contains("state").await);
        assert_eq!(store.stats(Some(SCOPE)).await.session.count, 0);
    }

    #[tokio::test]
    async fn test_retrieve_unknown_key() {
        let (store, _) = make_store(StoragePolicy::default()).await;
        assert!(matches!(
            store.retrieve_bytes("missing").await,
            Err(Error::NotFound(_))
        ));
        assert!(!store.remove("missing").await.unwrap());
        assert!(matches!(store.pin("missing").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_overwrite_moves_between_tiers_without_drift() {
        let (store, backend) = make_store(policy(100, 1000, OverflowPolicy::EvictLru)).await;
        store.store_bytes("k", bytes(10, 0), hints()).await.unwrap();
        store
            .store_bytes("k", bytes(20, 1), hints().tier(TierPreference::Durable))
            .await
            .unwrap();
        assert_eq!(tier_of(&store, "k").await, Some(Tier::Durable));
        let stats = store.stats(Some(SCOPE)).await;
        assert_eq!(stats.fast.bytes, 0);
        assert_eq!(stats.durable.bytes, 20);

        store.store_bytes("k", bytes(5, 2), hints()).await.unwrap();
        assert_eq!(tier_of(&store, "k").await, Some(Tier::Fast));
        assert!(backend.get_artifact("k").await.unwrap().is_none());
        assert_eq!(store.retrieve_bytes("k").await.unwrap(), bytes(5, 2));
        assert!(store.accounting_drift().await.is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_at_capacity_reuses_own_bytes() {
        let (store, _) = make_store(policy(0, 100, OverflowPolicy::Fail)).await;
        store.store_bytes("k", bytes(100, 0), hints()).await.unwrap();
        store.store_bytes("k", bytes(100, 1), hints()).await.unwrap();
        assert_eq!(store.retrieve_bytes("k").await.unwrap(), bytes(100, 1));
    }

    #[tokio::test]
    async fn test_pin_unpin_does_not_touch_accounting() {
        let (store, _) = make_store(policy(0, 100, OverflowPolicy::EvictLru)).await;
        store.store_bytes("a", bytes(50, 0), hints()).await.unwrap();
        store.store_bytes("b", bytes(50, 0), hints()).await.unwrap();
        let before = store.stats(Some(SCOPE)).await;

        store.pin("a").await.unwrap();
        let pinned = store.stats(Some(SCOPE)).await;
        assert_eq!(pinned.durable, before.durable);
        assert_eq!(pinned.pinned, 1);

        // a is LRU but pinned, so b goes
        store.store_bytes("c", bytes(50, 0), hints()).await.unwrap();
        assert!(store.contains("a").await);
        assert!(!store.contains("b").await);

        store.unpin("a").await.unwrap();
        assert_eq!(store.stats(Some(SCOPE)).await.pinned, 0);
        store.store_bytes("d", bytes(50, 0), hints()).await.unwrap();
        assert!(!store.contains("a").await);
    }

    #[tokio::test]
    async fn test_protect_frequent_evicts_rarely_read_first() {
        let mut p = policy(0, 100, OverflowPolicy::EvictLru);
        p.eviction.protect_frequent = true;
        let (store, _) = make_store(p).await;
        store.store_bytes("hot", bytes(50, 0), hints()).await.unwrap();
        store.store_bytes("cold", bytes(50, 0), hints()).await.unwrap();
        store.retrieve_bytes("hot").await.unwrap();
        store.retrieve_bytes("hot").await.unwrap();
        // cold is more recently created and never read, hot was read twice
        store.retrieve_bytes("cold").await.unwrap();

        store.store_bytes("x", bytes(50, 0), hints()).await.unwrap();
        assert!(store.contains("hot").await);
        assert!(!store.contains("cold").await);
    }

    #[tokio::test]
    async fn test_protect_recent_blocks_fresh_entries() {
        let mut p = policy(0, 100, OverflowPolicy::EvictLru);
        p.eviction.protect_recent = true;
        let (store, _) = make_store(p).await;
        store.store_bytes("a", bytes(100, 0), hints()).await.unwrap();
        assert!(matches!(
            store.store_bytes("b", bytes(10, 0), hints()).await,
            Err(Error::EvictionImpossible { .. })
        ));
    }

    #[tokio::test]
    async fn test_eviction_stays_within_scope() {
        let (store, _) = make_store(policy(0, 100, OverflowPolicy::EvictLru)).await;
        store
            .policies()
            .set_policy("other", policy(0, 1000, OverflowPolicy::EvictLru))
            .await
            .unwrap();
        store
            .store_bytes("foreign", bytes(50, 0), StoreHints::scoped("other"))
            .await
            .unwrap();
        store.store_bytes("a", bytes(100, 0), hints()).await.unwrap();
        store.store_bytes("b", bytes(100, 0), hints()).await.unwrap();
        assert!(store.contains("foreign").await);
        assert!(!store.contains("a").await);
    }

    #[tokio::test]
    async fn test_cleanup_expired_removes_old_temporary_entries() {
        let mut p = policy(1000, 1000, OverflowPolicy::EvictLru);
        p.auto_cleanup_age_ms = 1;
        let (store, _) = make_store(p).await;
        store
            .store_bytes("tmp", bytes(10, 0), hints().temporary(true))
            .await
            .unwrap();
        store
            .store_bytes("tmp-pinned", bytes(10, 0), hints().temporary(true).pinned(true))
            .await
            .unwrap();
        store.store_bytes("keep", bytes(10, 0), hints()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        assert!(!store.contains("tmp").await);
        assert!(store.contains("tmp-pinned").await);
        assert!(store.contains("keep").await);
    }

    #[tokio::test]
    async fn test_auto_cleanup_task_sweeps_in_background() {
        let mut p = policy(1000, 1000, OverflowPolicy::EvictLru);
        p.auto_cleanup_age_ms = 1;
        let (store, _) = make_store(p).await;
        let store = Arc::new(store);
        store
            .store_bytes("tmp", bytes(10, 0), hints().temporary(true))
            .await
            .unwrap();

        let handle = store.spawn_auto_cleanup(Duration::from_millis(10));
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.contains("tmp").await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.abort();
        assert_eq!(store.stats(Some(SCOPE)).await.total_count(), 0);
    }

    #[tokio::test]
    async fn test_global_stats_sum_scopes() {
        let (store, _) = make_store(StoragePolicy::default()).await;
        store.store_bytes("a", bytes(10, 0), hints()).await.unwrap();
        store
            .store_bytes("b", bytes(20, 0), StoreHints::scoped("other"))
            .await
            .unwrap();
        let global = store.stats(None).await;
        assert_eq!(global.scope_id, None);
        assert_eq!(global.fast.count, 2);
        assert_eq!(global.fast.bytes, 30);
        assert_eq!(store.stats(Some("other")).await.fast.bytes, 20);
    }

    #[tokio::test]
    async fn test_reopen_restores_durable_and_external_index() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(PolicyRegistry::default());
        {
            let backend = Arc::new(FileBackend::new(dir.path().to_path_buf()).await.unwrap());
            let store = ArtifactStore::open(registry.clone(), backend, DEFAULT_FAST_ITEM_MAX_BYTES)
                .await
                .unwrap();
            store
                .store("d", &"durable", hints().tier(TierPreference::Durable).data_type(DataType::Text))
                .await
                .unwrap();
            store
                .store("e", &"external", hints().tier(TierPreference::External))
                .await
                .unwrap();
            store.store("f", &"fast", hints()).await.unwrap();
            store.pin("d").await.unwrap();
        }

        let backend = Arc::new(FileBackend::new(dir.path().to_path_buf()).await.unwrap());
        let store = ArtifactStore::open(registry, backend, DEFAULT_FAST_ITEM_MAX_BYTES)
            .await
            .unwrap();
        let d: String = store.retrieve("d").await.unwrap();
        let e: String = store.retrieve("e").await.unwrap();
        assert_eq!(d, "durable");
        assert_eq!(e, "external");
        assert!(store.metadata("d").await.unwrap().pinned);
        assert_eq!(store.metadata("d").await.unwrap().data_type, DataType::Text);
        assert!(!store.contains("f").await);
        assert!(store.accounting_drift().await.is_empty());
    }

    #[test]
    fn test_plan_prefers_lru_and_skips_pinned() {
        let now = Utc::now();
        let mk = |key: &str, age_ms: i64, accessed_ms_ago: i64, pinned: bool| {
            ArtifactMetadata {
                key: key.to_string(),
                size_bytes: 10,
                original_size_bytes: 10,
                tier: Tier::Durable,
                created_at: now - chrono::Duration::milliseconds(age_ms),
                last_accessed_at: now - chrono::Duration::milliseconds(accessed_ms_ago),
                access_count: 0,
                temporary: false,
                pinned,
                compressed: false,
                content_hash: None,
                scope_id: Some(SCOPE.to_string()),
                source_id: None,
                execution_id: None,
                data_type: DataType::Json,
            }
        };
        let entries = vec![
            mk("oldest-but-fresh", 300, 1, false),
            mk("stale", 200, 150, false),
            mk("pinned-stalest", 400, 400, true),
        ];

        let lru = policy(0, 100, OverflowPolicy::EvictLru);
        let plan = plan_eviction(entries.iter(), SCOPE, Tier::Durable, "", 10, &lru, now);
        assert_eq!(plan, EvictionPlan::Evict(vec![("stale".to_string(), 10)]));

        let oldest = policy(0, 100, OverflowPolicy::EvictOldest);
        let plan = plan_eviction(entries.iter(), SCOPE, Tier::Durable, "", 10, &oldest, now);
        assert_eq!(plan, EvictionPlan::Evict(vec![("oldest-but-fresh".to_string(), 10)]));

        let plan = plan_eviction(entries.iter(), SCOPE, Tier::Durable, "", 25, &lru, now);
        assert_eq!(plan, EvictionPlan::Impossible { freeable: 20 });
    }

    /// Random store/retrieve/pin/remove sequences keep usage counters equal
    /// to the metadata sums, and pinned entries are never evicted.
    #[tokio::test]
    async fn test_randomized_operations_preserve_accounting() {
        let overflows = [
            OverflowPolicy::EvictLru,
            OverflowPolicy::EvictOldest,
            OverflowPolicy::Fail,
            OverflowPolicy::Compress,
            OverflowPolicy::External,
        ];
        for (seed, overflow) in overflows.iter().enumerate() {
            let mut rng = StdRng::seed_from_u64(seed as u64 + 7);
            let mut p = policy(200, 600, *overflow);
            p.eviction.protect_frequent = rng.gen_bool(0.5);
            let (store, _) = make_store(p).await;
            let mut pinned: std::collections::HashSet<String> = Default::default();

            for step in 0..300 {
                let key = format!("k{}", rng.gen_range(0..20));
                match rng.gen_range(0..10) {
                    0..=4 => {
                        let size = rng.gen_range(1..120);
                        let tier = match rng.gen_range(0..6) {
                            0 => TierPreference::Durable,
                            1 => TierPreference::Session,
                            _ => TierPreference::Auto,
                        };
                        let pin = rng.gen_bool(0.1);
                        let result = store
                            .store_bytes(&key, bytes(size, step as u8), hints().tier(tier).pinned(pin))
                            .await;
                        match result {
                            Ok(_) if pin => {
                                pinned.insert(key.clone());
                            }
                            Ok(_) => {
                                pinned.remove(&key);
                            }
                            Err(e) => assert!(e.is_capacity_related(), "{e}"),
                        }
                    }
                    5..=6 => {
                        let _ = store.retrieve_bytes(&key).await;
                    }
                    7 => {
                        if store.pin(&key).await.is_ok() {
                            pinned.insert(key.clone());
                        }
                    }
                    8 => {
                        if store.unpin(&key).await.is_ok() {
                            pinned.remove(&key);
                        }
                    }
                    _ => {
                        if store.remove(&key).await.unwrap() {
                            pinned.remove(&key);
                        }
                    }
                }

                assert!(
                    store.accounting_drift().await.is_empty(),
                    "counter drift after step {step} with {overflow:?}"
                );
                for key in &pinned {
                    assert!(store.contains(key).await, "pinned {key} was evicted");
                }
            }
        }
    }
}
