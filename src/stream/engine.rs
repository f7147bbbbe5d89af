//! Stream checkpoint and resurrection engine
//!
//! Registers producer streams, fans them out to N branches, checkpoints
//! them in the background through the `ArtifactStore`, and reconstructs
//! them for consumers that come back after the live stream is gone.

use super::tee::{BranchStream, LiveStream, Recording};
use super::types::{
    data_key, meta_key, CheckpointSnapshot, CheckpointStatus, Chunk, CleanupReason, EngineStats,
    Materialization, MaterializationType, RegenerationCallback, RegenerationDescriptor,
    RegisterOptions, StreamCheckpoint, StreamEvent, CHECKPOINT_META_PREFIX,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::storage::{ArtifactStore, DataType, StoreHints, TierPreference};
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// One registered stream: its checkpoint record plus, while the producer is
/// attached, the live fan-out.
struct StreamEntry {
    checkpoint: StreamCheckpoint,
    live: Option<Arc<LiveStream>>,
    /// Orders writes of the checkpoint record to the store
    persist_lock: Arc<Mutex<()>>,
}

impl StreamEntry {
    fn new(checkpoint: StreamCheckpoint, live: Option<Arc<LiveStream>>) -> Self {
        Self {
            checkpoint,
            live,
            persist_lock: Arc::new(Mutex::new(())),
        }
    }
}

/// Handles of the background tasks started by `StreamCheckpointEngine::start`
#[derive(Debug)]
pub struct EngineTasks {
    handles: Vec<JoinHandle<()>>,
}

impl EngineTasks {
    /// Abort every background task
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

/// Stream checkpoint and resurrection engine
pub struct StreamCheckpointEngine {
    config: EngineConfig,
    store: Arc<ArtifactStore>,
    regeneration: Option<Arc<dyn RegenerationCallback>>,
    streams: RwLock<HashMap<String, StreamEntry>>,
    release_tx: mpsc::UnboundedSender<String>,
    release_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl StreamCheckpointEngine {
    /// Create an engine writing checkpoints to `store`. `regeneration` is
    /// required for resurrecting `Regenerate` streams.
    pub fn new(
        config: EngineConfig,
        store: Arc<ArtifactStore>,
        regeneration: Option<Arc<dyn RegenerationCallback>>,
    ) -> Self {
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        Self {
            config,
            store,
            regeneration,
            streams: RwLock::new(HashMap::new()),
            release_tx,
            release_rx: parking_lot::Mutex::new(Some(release_rx)),
        }
    }

    /// Engine configuration this instance was built with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // =========================================================================
    // Registration and branches
    // =========================================================================

    /// Register a producer stream and fan it out to `consumer_count` branches.
    ///
    /// Returns the new stream id. Fails with `Error::Capacity` when the
    /// number of live streams is already at the configured maximum.
    pub async fn register_stream(
        &self,
        source_id: &str,
        execution_id: &str,
        source: BoxStream<'static, Chunk>,
        consumer_count: usize,
        materialization: MaterializationType,
        options: RegisterOptions,
    ) -> Result<String> {
        if consumer_count == 0 {
            return Err(Error::InvalidArgument(
                "consumer_count must be at least 1".to_string(),
            ));
        }

        let stream_id = format!("stream-{}", Uuid::new_v4());
        let (materialization, recording) = match materialization {
            MaterializationType::Full => (Materialization::Full { chunk_count: 0 }, Recording::All),
            MaterializationType::Partial => {
                let window = self.config.partial_window_chunks;
                (
                    Materialization::Partial {
                        window,
                        partial_offset: 0,
                    },
                    Recording::Window(window),
                )
            }
            MaterializationType::Regenerate => (
                Materialization::Regenerate {
                    descriptor: RegenerationDescriptor {
                        node_config: options.node_config.unwrap_or_default(),
                        inputs: options.inputs.unwrap_or_default(),
                    },
                },
                Recording::Nothing,
            ),
        };

        {
            let mut streams = self.streams.write().await;
            let live_count = streams.values().filter(|e| e.live.is_some()).count();
            if live_count >= self.config.max_concurrent_streams {
                return Err(Error::Capacity {
                    live: live_count,
                    max: self.config.max_concurrent_streams,
                });
            }

            let live = LiveStream::spawn(
                stream_id.clone(),
                source,
                consumer_count,
                self.config.branch_buffer_chunks,
                recording,
            );
            let checkpoint = StreamCheckpoint {
                stream_id: stream_id.clone(),
                source_id: source_id.to_string(),
                execution_id: execution_id.to_string(),
                scope_id: options
                    .scope_id
                    .unwrap_or_else(|| execution_id.to_string()),
                consumer_count,
                created_at: live.created_at,
                last_activity_at: live.created_at,
                materialization,
                status: CheckpointStatus::Active,
                resurrection_attempts: 0,
                last_checkpoint_seq: 0,
            };
            streams.insert(stream_id.clone(), StreamEntry::new(checkpoint, Some(live)));
        }

        self.persist_checkpoint(&stream_id).await;
        tracing::info!(
            stream_id = %stream_id,
            source_id = %source_id,
            execution_id = %execution_id,
            consumers = consumer_count,
            "Stream registered"
        );
        Ok(stream_id)
    }

    /// Attach to branch `index` of a live stream, or resurrect the stream
    /// from its checkpoint when it is no longer live.
    pub async fn get_branch(&self, stream_id: &str, index: usize) -> Result<BranchStream> {
        let live = {
            let streams = self.streams.read().await;
            let entry = streams
                .get(stream_id)
                .ok_or_else(|| Error::NotFound(format!("stream {}", stream_id)))?;
            entry.live.clone()
        };

        match live {
            Some(live) if !live.cancel.is_cancelled() => {
                let rx = live.attach(index)?;
                live.touch();
                tracing::debug!(stream_id = %stream_id, index, "Branch attached");
                Ok(BranchStream::live(live, index, rx, self.release_tx.clone()))
            }
            _ => self.resurrect(stream_id, index).await,
        }
    }

    // =========================================================================
    // Resurrection
    // =========================================================================

    async fn resurrect(&self, stream_id: &str, index: usize) -> Result<BranchStream> {
        if !self.config.enable_resurrection {
            return Err(Error::NotFound(format!(
                "stream {} is not live and resurrection is disabled",
                stream_id
            )));
        }

        let max_attempts = self.config.max_resurrection_attempts;
        let checkpoint = {
            let mut streams = self.streams.write().await;
            let entry = streams
                .get_mut(stream_id)
                .ok_or_else(|| Error::NotFound(format!("stream {}", stream_id)))?;
            let cp = &mut entry.checkpoint;
            if index >= cp.consumer_count {
                return Err(Error::InvalidArgument(format!(
                    "branch index {} out of range for {} consumers",
                    index, cp.consumer_count
                )));
            }
            if !cp.is_resurrectable() {
                return Err(Error::NotFound(format!(
                    "stream {} has no resurrectable checkpoint (status {:?})",
                    stream_id, cp.status
                )));
            }
            if cp.resurrection_attempts >= max_attempts {
                return Err(Error::NotFound(format!(
                    "stream {} exhausted {} resurrection attempts",
                    stream_id, max_attempts
                )));
            }
            cp.resurrection_attempts += 1;
            cp.clone()
        };
        self.persist_checkpoint(stream_id).await;

        let attempt = checkpoint.resurrection_attempts;
        let result = match &checkpoint.materialization {
            Materialization::Full { .. } => self.replay(&checkpoint, false).await,
            Materialization::Partial { .. } => self.replay(&checkpoint, true).await,
            Materialization::Regenerate { descriptor } => {
                self.regenerate(&checkpoint, descriptor).await
            }
        };

        match result {
            Ok(inner) => {
                {
                    let mut streams = self.streams.write().await;
                    if let Some(entry) = streams.get_mut(stream_id) {
                        entry.checkpoint.advance(CheckpointStatus::Resurrected);
                        entry.checkpoint.last_activity_at = Utc::now();
                    }
                }
                self.persist_checkpoint(stream_id).await;
                tracing::info!(
                    stream_id = %stream_id,
                    attempt,
                    materialization = ?checkpoint.materialization_type(),
                    "Stream resurrected"
                );
                Ok(BranchStream::resurrected(stream_id.to_string(), index, inner))
            }
            Err(e) => {
                tracing::warn!(
                    stream_id = %stream_id,
                    attempt,
                    error = %e,
                    "Stream resurrection failed"
                );
                if attempt >= max_attempts {
                    self.expire(stream_id).await;
                }
                Err(e)
            }
        }
    }

    async fn replay(
        &self,
        checkpoint: &StreamCheckpoint,
        truncated: bool,
    ) -> Result<BoxStream<'static, StreamEvent>> {
        let key = data_key(&checkpoint.stream_id);
        let snapshot: CheckpointSnapshot = self.store.retrieve(&key).await.map_err(|e| {
            if e.is_not_found() {
                Error::NotFound(format!("snapshot for stream {}", checkpoint.stream_id))
            } else {
                e
            }
        })?;

        let stream = async_stream::stream! {
            for chunk in snapshot.chunks {
                yield StreamEvent::Chunk(chunk);
            }
            if truncated {
                yield StreamEvent::Truncated { offset: snapshot.partial_offset };
            }
        };
        Ok(stream.boxed())
    }

    async fn regenerate(
        &self,
        checkpoint: &StreamCheckpoint,
        descriptor: &RegenerationDescriptor,
    ) -> Result<BoxStream<'static, StreamEvent>> {
        let callback = self
            .regeneration
            .as_ref()
            .ok_or_else(|| Error::RegenerationUnavailable {
                stream_id: checkpoint.stream_id.clone(),
            })?;
        let source = callback
            .regenerate(
                &checkpoint.source_id,
                &descriptor.node_config,
                &descriptor.inputs,
            )
            .await?;
        Ok(source.map(StreamEvent::Chunk).boxed())
    }

    async fn expire(&self, stream_id: &str) {
        {
            let mut streams = self.streams.write().await;
            if let Some(entry) = streams.get_mut(stream_id) {
                if entry.checkpoint.status != CheckpointStatus::Expired {
                    entry.checkpoint.advance(CheckpointStatus::Expired);
                }
            }
        }
        self.persist_checkpoint(stream_id).await;
    }

    // =========================================================================
    // Checkpointing
    // =========================================================================

    /// Checkpoint one live stream now
    pub async fn checkpoint(&self, stream_id: &str) -> Result<StreamCheckpoint> {
        let live = {
            let streams = self.streams.read().await;
            streams.get(stream_id).and_then(|e| e.live.clone())
        };
        let live = live.ok_or_else(|| Error::NotFound(format!("live stream {}", stream_id)))?;
        self.checkpoint_live(&live).await?;
        self.get_checkpoint(stream_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("stream {}", stream_id)))
    }

    async fn checkpoint_live(&self, live: &LiveStream) -> Result<()> {
        let _guard = live.checkpoint_lock.lock().await;
        let recorded = live.recorded();

        let checkpoint = {
            let streams = self.streams.read().await;
            match streams.get(&live.stream_id) {
                Some(entry) => entry.checkpoint.clone(),
                None => return Ok(()),
            }
        };
        if checkpoint.status == CheckpointStatus::Expired
            || recorded.produced < checkpoint.last_checkpoint_seq
        {
            return Ok(());
        }
        if recorded.produced == checkpoint.last_checkpoint_seq
            && checkpoint.status != CheckpointStatus::Active
        {
            return Ok(());
        }

        if checkpoint.materialization_type() != MaterializationType::Regenerate {
            let snapshot = CheckpointSnapshot {
                stream_id: live.stream_id.clone(),
                seq: recorded.produced,
                partial_offset: recorded.dropped,
                chunks: recorded.chunks,
            };
            let hints = StoreHints::scoped(&checkpoint.scope_id)
                .tier(TierPreference::Durable)
                .data_type(DataType::StreamSnapshot)
                .temporary(true)
                .origin(&checkpoint.source_id, &checkpoint.execution_id);
            self.store
                .store(&data_key(&live.stream_id), &snapshot, hints)
                .await?;
        }

        {
            let mut streams = self.streams.write().await;
            let Some(entry) = streams.get_mut(&live.stream_id) else {
                return Ok(());
            };
            let cp = &mut entry.checkpoint;
            if cp.status == CheckpointStatus::Active {
                cp.advance(CheckpointStatus::Checkpointed);
            }
            cp.last_checkpoint_seq = recorded.produced;
            cp.last_activity_at = live.last_activity();
            match &mut cp.materialization {
                Materialization::Full { chunk_count } => *chunk_count = recorded.produced,
                Materialization::Partial { partial_offset, .. } => {
                    *partial_offset = recorded.dropped
                }
                Materialization::Regenerate { .. } => {}
            }
        }
        self.persist_checkpoint(&live.stream_id).await;

        tracing::debug!(
            stream_id = %live.stream_id,
            seq = recorded.produced,
            dropped = recorded.dropped,
            "Stream checkpointed"
        );
        Ok(())
    }

    /// Checkpoint every live stream older than the threshold age.
    /// Returns how many were checkpointed.
    pub async fn checkpoint_sweep(&self) -> usize {
        let threshold = chrono::Duration::milliseconds(
            i64::try_from(self.config.checkpoint_threshold_age_ms).unwrap_or(i64::MAX),
        );
        let now = Utc::now();
        let due: Vec<Arc<LiveStream>> = {
            let streams = self.streams.read().await;
            streams
                .values()
                .filter_map(|e| e.live.clone())
                .filter(|live| now - live.created_at >= threshold)
                .collect()
        };

        let mut checkpointed = 0;
        for live in due {
            match self.checkpoint_live(&live).await {
                Ok(()) => checkpointed += 1,
                Err(e) => {
                    tracing::warn!(
                        stream_id = %live.stream_id,
                        error = %e,
                        "Checkpoint failed"
                    );
                }
            }
        }
        checkpointed
    }

    /// Force-clean every live stream idle for longer than the stream timeout.
    /// Returns how many were cleaned.
    pub async fn timeout_sweep(&self) -> usize {
        let timeout = chrono::Duration::milliseconds(
            i64::try_from(self.config.stream_timeout_ms).unwrap_or(i64::MAX),
        );
        let now = Utc::now();
        let idle: Vec<String> = {
            let streams = self.streams.read().await;
            streams
                .values()
                .filter_map(|e| e.live.as_ref())
                .filter(|live| now - live.last_activity() > timeout)
                .map(|live| live.stream_id.clone())
                .collect()
        };

        for stream_id in &idle {
            tracing::info!(stream_id = %stream_id, "Stream timed out");
            self.cleanup(stream_id, CleanupReason::Timeout).await;
        }
        idle.len()
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Tear down a live stream. Takes a final checkpoint first for reasons a
    /// consumer may come back from. Cleaning a stream that is not live is a
    /// no-op.
    pub async fn cleanup(&self, stream_id: &str, reason: CleanupReason) {
        let live = {
            let streams = self.streams.read().await;
            streams.get(stream_id).and_then(|e| e.live.clone())
        };
        let Some(live) = live else {
            return;
        };

        if self.config.enable_resurrection && reason.takes_final_checkpoint() {
            if let Err(e) = self.checkpoint_live(&live).await {
                tracing::warn!(
                    stream_id = %stream_id,
                    error = %e,
                    "Final checkpoint failed"
                );
            }
        }
        live.shutdown();

        let status = {
            let mut streams = self.streams.write().await;
            let Some(entry) = streams.get_mut(stream_id) else {
                return;
            };
            if entry.live.take().is_none() {
                return;
            }
            let keep = self.config.enable_resurrection && entry.checkpoint.is_resurrectable();
            if !keep {
                entry.checkpoint.advance(CheckpointStatus::Expired);
            }
            entry.checkpoint.status
        };
        self.persist_checkpoint(stream_id).await;
        tracing::info!(
            stream_id = %stream_id,
            reason = ?reason,
            status = ?status,
            "Stream cleaned up"
        );
    }

    /// Clean up a stream and forget it, deleting its persisted records.
    /// Returns false for unknown streams.
    pub async fn discard(&self, stream_id: &str) -> Result<bool> {
        self.cleanup(stream_id, CleanupReason::Discarded).await;
        let Some(entry) = self.streams.write().await.remove(stream_id) else {
            return Ok(false);
        };

        let _persist = entry.persist_lock.lock().await;
        self.store.remove(&meta_key(stream_id)).await?;
        self.store.remove(&data_key(stream_id)).await?;
        tracing::info!(stream_id = %stream_id, "Stream discarded");
        Ok(true)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write the current checkpoint record. Writers for one stream queue on
    /// its persist lock and each writes the latest state, so the stored
    /// record never goes backwards.
    async fn persist_checkpoint(&self, stream_id: &str) {
        let lock = {
            let streams = self.streams.read().await;
            match streams.get(stream_id) {
                Some(entry) => entry.persist_lock.clone(),
                None => return,
            }
        };
        let _guard = lock.lock().await;

        let checkpoint = {
            let streams = self.streams.read().await;
            match streams.get(stream_id) {
                Some(entry) => entry.checkpoint.clone(),
                None => return,
            }
        };
        let hints = StoreHints::scoped(&checkpoint.scope_id)
            .tier(TierPreference::Durable)
            .data_type(DataType::CheckpointMeta)
            .pinned(true)
            .origin(&checkpoint.source_id, &checkpoint.execution_id);
        if let Err(e) = self
            .store
            .store(&meta_key(stream_id), &checkpoint, hints)
            .await
        {
            tracing::warn!(
                stream_id = %stream_id,
                error = %e,
                "Failed to persist checkpoint record"
            );
        }
    }

    /// Load checkpoint records left in the store by a previous process.
    ///
    /// Records still Active were never checkpointed; they become
    /// Checkpointed when the regeneration descriptor alone is enough, and
    /// Expired otherwise. Returns how many records were loaded.
    pub async fn restore_checkpoints_from_storage(&self) -> usize {
        let keys = self.store.keys_with_prefix(CHECKPOINT_META_PREFIX).await;
        let mut restored = 0;

        for key in keys {
            let stream_id = &key[CHECKPOINT_META_PREFIX.len()..];
            if self.streams.read().await.contains_key(stream_id) {
                continue;
            }
            let mut checkpoint: StreamCheckpoint = match self.store.retrieve(&key).await {
                Ok(cp) => cp,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unreadable checkpoint record");
                    continue;
                }
            };

            let orphaned = checkpoint.status == CheckpointStatus::Active;
            if orphaned {
                let next = match checkpoint.materialization_type() {
                    MaterializationType::Regenerate => CheckpointStatus::Checkpointed,
                    _ => CheckpointStatus::Expired,
                };
                checkpoint.advance(next);
            }

            {
                let mut streams = self.streams.write().await;
                if streams.contains_key(stream_id) {
                    continue;
                }
                streams.insert(stream_id.to_string(), StreamEntry::new(checkpoint, None));
            }
            if orphaned {
                self.persist_checkpoint(stream_id).await;
            }
            restored += 1;
        }

        if restored > 0 {
            tracing::info!(restored, "Restored stream checkpoints from storage");
        }
        restored
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Snapshot of one checkpoint record
    pub async fn get_checkpoint(&self, stream_id: &str) -> Option<StreamCheckpoint> {
        self.streams
            .read()
            .await
            .get(stream_id)
            .map(|e| e.checkpoint.clone())
    }

    /// Every known checkpoint record, oldest first
    pub async fn list_checkpoints(&self) -> Vec<StreamCheckpoint> {
        let mut all: Vec<StreamCheckpoint> = self
            .streams
            .read()
            .await
            .values()
            .map(|e| e.checkpoint.clone())
            .collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.stream_id.cmp(&b.stream_id))
        });
        all
    }

    /// Whether the stream's producer is still attached
    pub async fn is_live(&self, stream_id: &str) -> bool {
        self.streams
            .read()
            .await
            .get(stream_id)
            .is_some_and(|e| e.live.is_some())
    }

    /// Counts of live streams and checkpoint records by status
    pub async fn stats(&self) -> EngineStats {
        let streams = self.streams.read().await;
        let mut stats = EngineStats::default();
        for entry in streams.values() {
            if entry.live.is_some() {
                stats.live_streams += 1;
            }
            match entry.checkpoint.status {
                CheckpointStatus::Active => stats.active += 1,
                CheckpointStatus::Checkpointed => stats.checkpointed += 1,
                CheckpointStatus::Resurrected => stats.resurrected += 1,
                CheckpointStatus::Expired => stats.expired += 1,
            }
        }
        stats
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    /// Spawn the checkpoint sweep, the timeout sweep and the listener that
    /// cleans up streams whose branches have all been released.
    pub fn start(self: &Arc<Self>) -> EngineTasks {
        let mut handles = Vec::with_capacity(3);

        let engine = self.clone();
        let interval = self.config.checkpoint_interval();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the first immediate tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let count = engine.checkpoint_sweep().await;
                if count > 0 {
                    tracing::debug!(count, "Checkpoint sweep completed");
                }
            }
        }));

        let engine = self.clone();
        let interval = self.config.timeout_sweep_interval();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let count = engine.timeout_sweep().await;
                if count > 0 {
                    tracing::info!(count, "Timed out {} idle stream(s)", count);
                }
            }
        }));

        match self.release_rx.lock().take() {
            Some(mut rx) => {
                let engine = self.clone();
                handles.push(tokio::spawn(async move {
                    while let Some(stream_id) = rx.recv().await {
                        engine.on_released(&stream_id).await;
                    }
                }));
            }
            None => {
                tracing::warn!("Engine already started, release listener not respawned");
            }
        }

        tracing::info!(
            checkpoint_interval_ms = self.config.auto_checkpoint_interval_ms,
            timeout_sweep_interval_ms = self.config.timeout_sweep_interval_ms,
            "Stream checkpoint engine started"
        );
        EngineTasks { handles }
    }

    async fn on_released(&self, stream_id: &str) {
        let reason = {
            let streams = self.streams.read().await;
            streams
                .get(stream_id)
                .and_then(|e| e.live.as_ref())
                .map(|live| {
                    if live.is_finished() {
                        CleanupReason::Completed
                    } else {
                        CleanupReason::Released
                    }
                })
        };
        if let Some(reason) = reason {
            self.cleanup(stream_id, reason).await;
        }
    }
}
