//! Per-scope storage policy registry
//!
//! Maps scope IDs to `StoragePolicy` values and falls back to a global
//! default. Lookups return owned snapshots, so a policy swapped mid-operation
//! never affects a write that already started.

use super::types::StoragePolicy;
use crate::error::{Error, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Registry of storage policies keyed by scope
pub struct PolicyRegistry {
    default_policy: RwLock<StoragePolicy>,
    scopes: RwLock<HashMap<String, StoragePolicy>>,
}

impl PolicyRegistry {
    /// Create a registry with the given global default
    pub fn new(default_policy: StoragePolicy) -> Result<Self> {
        Self::with_scopes(default_policy, HashMap::new())
    }

    /// Create a registry pre-populated with scope policies
    pub fn with_scopes(
        default_policy: StoragePolicy,
        scopes: HashMap<String, StoragePolicy>,
    ) -> Result<Self> {
        validate(&default_policy)?;
        for policy in scopes.values() {
            validate(policy)?;
        }
        Ok(Self {
            default_policy: RwLock::new(default_policy),
            scopes: RwLock::new(scopes),
        })
    }

    /// Snapshot of the policy in effect for a scope
    pub async fn policy_for(&self, scope_id: &str) -> StoragePolicy {
        if let Some(policy) = self.scopes.read().await.get(scope_id) {
            return policy.clone();
        }
        self.default_policy.read().await.clone()
    }

    /// Install or replace a scope's policy
    pub async fn set_policy(&self, scope_id: impl Into<String>, policy: StoragePolicy) -> Result<()> {
        validate(&policy)?;
        let scope_id = scope_id.into();
        tracing::debug!(scope = %scope_id, ?policy.overflow_policy, "Storage policy updated");
        self.scopes.write().await.insert(scope_id, policy);
        Ok(())
    }

    /// Drop a scope's policy, reverting it to the default
    pub async fn remove_policy(&self, scope_id: &str) -> Option<StoragePolicy> {
        self.scopes.write().await.remove(scope_id)
    }

    /// Replace the global default
    pub async fn set_default(&self, policy: StoragePolicy) -> Result<()> {
        validate(&policy)?;
        *self.default_policy.write().await = policy;
        Ok(())
    }

    /// Scopes with an explicit policy
    pub async fn scopes(&self) -> Vec<String> {
        self.scopes.read().await.keys().cloned().collect()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self {
            default_policy: RwLock::new(StoragePolicy::default()),
            scopes: RwLock::new(HashMap::new()),
        }
    }
}

fn validate(policy: &StoragePolicy) -> Result<()> {
    if policy.durable_capacity_bytes == 0 {
        return Err(Error::Config(
            "durable_capacity_bytes must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
