//! Live stream fan-out
//!
//! A single pump task pulls the source once and forwards every chunk, in
//! order, to one bounded channel per branch. A slow branch holds the pump
//! back; nothing is dropped. A branch whose reader went away is skipped.
//! While pumping, each chunk is also fed to the recorder that checkpoints
//! snapshot from.

use super::types::{Chunk, StreamEvent};
use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// What the recorder keeps of the chunks it sees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recording {
    All,
    Window(usize),
    Nothing,
}

/// Point-in-time copy of the recorder
#[derive(Debug, Clone, Default)]
pub(crate) struct Recorded {
    pub chunks: Vec<Chunk>,
    /// Chunks no longer retained, counted from the start
    pub dropped: u64,
    /// Chunks pulled from the source so far
    pub produced: u64,
}

#[derive(Debug)]
struct ChunkRecorder {
    recording: Recording,
    chunks: VecDeque<Chunk>,
    dropped: u64,
    produced: u64,
}

impl ChunkRecorder {
    fn new(recording: Recording) -> Self {
        Self {
            recording,
            chunks: VecDeque::new(),
            dropped: 0,
            produced: 0,
        }
    }

    fn push(&mut self, chunk: &Chunk) {
        self.produced += 1;
        match self.recording {
            Recording::All => self.chunks.push_back(chunk.clone()),
            Recording::Window(window) => {
                self.chunks.push_back(chunk.clone());
                while self.chunks.len() > window {
                    self.chunks.pop_front();
                    self.dropped += 1;
                }
            }
            Recording::Nothing => {}
        }
    }

    fn snapshot(&self) -> Recorded {
        Recorded {
            chunks: self.chunks.iter().cloned().collect(),
            dropped: self.dropped,
            produced: self.produced,
        }
    }
}

#[derive(Debug, Default)]
struct BranchSlots {
    receivers: Vec<Option<mpsc::Receiver<Chunk>>>,
    consumers: usize,
    attached: HashSet<usize>,
    released: HashSet<usize>,
}

/// Runtime state of a registered stream whose producer is still attached
pub(crate) struct LiveStream {
    pub stream_id: String,
    pub created_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    /// Serializes checkpoint writes for this stream
    pub checkpoint_lock: tokio::sync::Mutex<()>,
    recorder: Mutex<ChunkRecorder>,
    slots: Mutex<BranchSlots>,
    last_activity_ms: AtomicI64,
    finished: AtomicBool,
}

impl LiveStream {
    /// Create the branch channels and start pumping `source` into them
    pub fn spawn(
        stream_id: String,
        source: BoxStream<'static, Chunk>,
        consumer_count: usize,
        buffer: usize,
        recording: Recording,
    ) -> Arc<Self> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..consumer_count)
            .map(|_| mpsc::channel(buffer.max(1)))
            .unzip();
        let now = Utc::now();
        let live = Arc::new(Self {
            stream_id,
            created_at: now,
            cancel: CancellationToken::new(),
            checkpoint_lock: tokio::sync::Mutex::new(()),
            recorder: Mutex::new(ChunkRecorder::new(recording)),
            slots: Mutex::new(BranchSlots {
                receivers: receivers.into_iter().map(Some).collect(),
                consumers: consumer_count,
                attached: HashSet::new(),
                released: HashSet::new(),
            }),
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            finished: AtomicBool::new(false),
        });
        tokio::spawn(pump(live.clone(), source, senders));
        live
    }

    /// Record activity now, postponing the idle timeout
    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    /// Time of the last chunk or attach
    pub fn last_activity(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_activity_ms.load(Ordering::SeqCst))
            .single()
            .unwrap_or(self.created_at)
    }

    /// Whether the source has ended
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Snapshot of the chunks retained so far
    pub fn recorded(&self) -> Recorded {
        self.recorder.lock().snapshot()
    }

    /// Hand out the receiver for `index`. Each branch is attached at most once.
    pub fn attach(&self, index: usize) -> Result<mpsc::Receiver<Chunk>> {
        let mut slots = self.slots.lock();
        let count = slots.receivers.len();
        let slot = slots.receivers.get_mut(index).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "branch index {} out of range for {} consumers",
                index, count
            ))
        })?;
        let rx = slot.take().ok_or_else(|| Error::BranchInUse {
            stream_id: self.stream_id.clone(),
            index,
        })?;
        slots.attached.insert(index);
        Ok(rx)
    }

    /// Returns true once every branch has been attached and released.
    /// Branches never attached keep the stream live until it times out.
    fn detach(&self, index: usize) -> bool {
        let mut slots = self.slots.lock();
        if !slots.attached.remove(&index) {
            return false;
        }
        slots.released.insert(index);
        slots.released.len() == slots.consumers
    }

    /// Stop the pump and drop receivers nobody attached
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.slots.lock().receivers.clear();
    }

    fn record(&self, chunk: &Chunk) {
        self.recorder.lock().push(chunk);
        self.touch();
    }
}

impl std::fmt::Debug for LiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStream")
            .field("stream_id", &self.stream_id)
            .field("created_at", &self.created_at)
            .field("finished", &self.is_finished())
            .finish()
    }
}

async fn pump(
    live: Arc<LiveStream>,
    mut source: BoxStream<'static, Chunk>,
    senders: Vec<mpsc::Sender<Chunk>>,
) {
    let mut senders: Vec<Option<mpsc::Sender<Chunk>>> = senders.into_iter().map(Some).collect();
    loop {
        let next = tokio::select! {
            biased;
            _ = live.cancel.cancelled() => return,
            next = source.next() => next,
        };
        let Some(chunk) = next else {
            live.finished.store(true, Ordering::SeqCst);
            tracing::debug!(stream_id = %live.stream_id, "Source stream ended");
            return;
        };
        live.record(&chunk);

        for slot in senders.iter_mut() {
            let Some(tx) = slot.as_ref() else { continue };
            let delivered = tokio::select! {
                biased;
                _ = live.cancel.cancelled() => return,
                sent = tx.send(chunk.clone()) => sent.is_ok(),
            };
            if !delivered {
                *slot = None;
            }
        }

        if senders.iter().all(Option::is_none) {
            tracing::debug!(stream_id = %live.stream_id, "Every branch closed, stopping pump");
            return;
        }
    }
}

/// Tells the engine once every branch of a live stream has been released
struct ReleaseGuard {
    live: Arc<LiveStream>,
    index: usize,
    release_tx: mpsc::UnboundedSender<String>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if self.live.detach(self.index) {
            let _ = self.release_tx.send(self.live.stream_id.clone());
        }
    }
}

/// One consumer's view of a stream: live, replayed or regenerated.
///
/// Dropping a live branch releases it; when the last one goes the engine
/// cleans the stream up.
pub struct BranchStream {
    stream_id: String,
    index: usize,
    resurrected: bool,
    inner: BoxStream<'static, StreamEvent>,
    _release: Option<ReleaseGuard>,
}

impl BranchStream {
    pub(crate) fn live(
        live: Arc<LiveStream>,
        index: usize,
        rx: mpsc::Receiver<Chunk>,
        release_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        let activity = live.clone();
        let inner = ReceiverStream::new(rx)
            .map(move |chunk| {
                activity.touch();
                StreamEvent::Chunk(chunk)
            })
            .boxed();
        Self {
            stream_id: live.stream_id.clone(),
            index,
            resurrected: false,
            inner,
            _release: Some(ReleaseGuard {
                live,
                index,
                release_tx,
            }),
        }
    }

    pub(crate) fn resurrected(
        stream_id: String,
        index: usize,
        inner: BoxStream<'static, StreamEvent>,
    ) -> Self {
        Self {
            stream_id,
            index,
            resurrected: true,
            inner,
            _release: None,
        }
    }

    /// Stream this branch belongs to
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Branch index the caller asked for
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether this branch was reconstructed from a checkpoint
    pub fn is_resurrected(&self) -> bool {
        self.resurrected
    }
}

impl Stream for BranchStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for BranchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchStream")
            .field("stream_id", &self.stream_id)
            .field("index", &self.index)
            .field("resurrected", &self.resurrected)
            .finish()
    }
}
