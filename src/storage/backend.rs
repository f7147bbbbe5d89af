//! Persistence backends for the durable and external tiers
//!
//! Directory layout of the file backend:
//! ```text
//! <base_dir>/
//! ├── artifacts/
//! │   ├── <b64(key)>.json      durable payload + metadata
//! │   └── ...
//! ├── blob_refs/
//! │   ├── <b64(key)>.json      external metadata + content hash
//! │   └── ...
//! └── blobs/
//!     ├── <sha256>.blob        content-addressed external payloads
//!     └── ...
//! ```

use super::types::ArtifactMetadata;
use crate::error::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Durable record: metadata plus the (possibly compressed) payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedArtifact {
    /// Artifact metadata at the time of the write
    pub metadata: ArtifactMetadata,
    /// Stored payload
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// External tier reference: metadata plus the blob it points at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobRef {
    /// Artifact metadata at the time of the write
    pub metadata: ArtifactMetadata,
    /// SHA-256 hex digest of the blob
    pub content_hash: String,
}

/// SHA-256 hex digest used to address external blobs
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Storage below the durable and external tiers
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Write a durable record, replacing any previous one for the key
    async fn put_artifact(&self, record: &PersistedArtifact) -> Result<()>;

    /// Read a durable record
    async fn get_artifact(&self, key: &str) -> Result<Option<PersistedArtifact>>;

    /// Delete a durable record (missing records are not an error)
    async fn delete_artifact(&self, key: &str) -> Result<()>;

    /// Write a content-addressed blob
    async fn put_blob(&self, hash: &str, data: &[u8]) -> Result<()>;

    /// Read a content-addressed blob
    async fn get_blob(&self, hash: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a content-addressed blob
    async fn delete_blob(&self, hash: &str) -> Result<()>;

    /// Write an external tier reference
    async fn put_blob_ref(&self, record: &BlobRef) -> Result<()>;

    /// Delete an external tier reference
    async fn delete_blob_ref(&self, key: &str) -> Result<()>;

    /// Metadata of every durable and external entry, for rebuilding the index
    async fn load_metadata(&self) -> Result<Vec<ArtifactMetadata>>;
}

// =============================================================================
// File backend
// =============================================================================

/// JSON-file backend rooted at a local directory
pub struct FileBackend {
    artifacts_dir: PathBuf,
    blob_refs_dir: PathBuf,
    blobs_dir: PathBuf,
}

impl FileBackend {
    /// Open (creating if needed) a backend at the given base directory
    pub async fn new(base_dir: PathBuf) -> Result<Self> {
        let artifacts_dir = base_dir.join("artifacts");
        let blob_refs_dir = base_dir.join("blob_refs");
        let blobs_dir = base_dir.join("blobs");

        tokio::fs::create_dir_all(&artifacts_dir).await?;
        tokio::fs::create_dir_all(&blob_refs_dir).await?;
        tokio::fs::create_dir_all(&blobs_dir).await?;

        Ok(Self {
            artifacts_dir,
            blob_refs_dir,
            blobs_dir,
        })
    }

    fn record_path(dir: &Path, key: &str) -> PathBuf {
        dir.join(format!("{}.json", URL_SAFE_NO_PAD.encode(key.as_bytes())))
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.blobs_dir.join(format!("{}.blob", hash))
    }

    /// Write through a temp file so readers never observe a torn record
    async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn remove_if_exists(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load all JSON records from a directory, skipping unreadable files
    async fn load_json_files<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(items),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(data) => match serde_json::from_slice(&data) {
                    Ok(item) => items.push(item),
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", path.display(), e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path.display(), e);
                }
            }
        }

        Ok(items)
    }
}

#[async_trait]
impl PersistenceBackend for FileBackend {
    async fn put_artifact(&self, record: &PersistedArtifact) -> Result<()> {
        let path = Self::record_path(&self.artifacts_dir, &record.metadata.key);
        let json = serde_json::to_vec(record)?;
        Self::write_atomic(&path, &json).await
    }

    async fn get_artifact(&self, key: &str) -> Result<Option<PersistedArtifact>> {
        let path = Self::record_path(&self.artifacts_dir, key);
        match Self::read_if_exists(&path).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    async fn delete_artifact(&self, key: &str) -> Result<()> {
        Self::remove_if_exists(&Self::record_path(&self.artifacts_dir, key)).await
    }

    async fn put_blob(&self, hash: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(hash);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        Self::write_atomic(&path, data).await
    }

    async fn get_blob(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        Self::read_if_exists(&self.blob_path(hash)).await
    }

    async fn delete_blob(&self, hash: &str) -> Result<()> {
        Self::remove_if_exists(&self.blob_path(hash)).await
    }

    async fn put_blob_ref(&self, record: &BlobRef) -> Result<()> {
        let path = Self::record_path(&self.blob_refs_dir, &record.metadata.key);
        let json = serde_json::to_vec_pretty(record)?;
        Self::write_atomic(&path, &json).await
    }

    async fn delete_blob_ref(&self, key: &str) -> Result<()> {
        Self::remove_if_exists(&Self::record_path(&self.blob_refs_dir, key)).await
    }

    async fn load_metadata(&self) -> Result<Vec<ArtifactMetadata>> {
        let artifacts = Self::load_json_files::<PersistedArtifact>(&self.artifacts_dir).await?;
        let refs = Self::load_json_files::<BlobRef>(&self.blob_refs_dir).await?;
        Ok(artifacts
            .into_iter()
            .map(|a| a.metadata)
            .chain(refs.into_iter().map(|r| r.metadata))
            .collect())
    }
}

// =============================================================================
// Memory backend
// =============================================================================

/// Process-local backend for tests and ephemeral deployments
#[derive(Default)]
pub struct MemoryBackend {
    artifacts: RwLock<HashMap<String, PersistedArtifact>>,
    blob_refs: RwLock<HashMap<String, BlobRef>>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub async fn blob_count(&self) -> usize {
        self.blobs.read().await.len()
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    async fn put_artifact(&self, record: &PersistedArtifact) -> Result<()> {
        self.artifacts
            .write()
            .await
            .insert(record.metadata.key.clone(), record.clone());
        Ok(())
    }

    async fn get_artifact(&self, key: &str) -> Result<Option<PersistedArtifact>> {
        Ok(self.artifacts.read().await.get(key).cloned())
    }

    async fn delete_artifact(&self, key: &str) -> Result<()> {
        self.artifacts.write().await.remove(key);
        Ok(())
    }

    async fn put_blob(&self, hash: &str, data: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .await
            .entry(hash.to_string())
            .or_insert_with(|| data.to_vec());
        Ok(())
    }

    async fn get_blob(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(hash).cloned())
    }

    async fn delete_blob(&self, hash: &str) -> Result<()> {
        self.blobs.write().await.remove(hash);
        Ok(())
    }

    async fn put_blob_ref(&self, record: &BlobRef) -> Result<()> {
        self.blob_refs
            .write()
            .await
            .insert(record.metadata.key.clone(), record.clone());
        Ok(())
    }

    async fn delete_blob_ref(&self, key: &str) -> Result<()> {
        self.blob_refs.write().await.remove(key);
        Ok(())
    }

    async fn load_metadata(&self) -> Result<Vec<ArtifactMetadata>> {
        let mut out: Vec<ArtifactMetadata> = self
            .artifacts
            .read()
            .await
            .values()
            .map(|a| a.metadata.clone())
            .collect();
        out.extend(self.blob_refs.read().await.values().map(|r| r.metadata.clone()));
        Ok(out)
    }
}

mod base64_bytes {
    use super::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
