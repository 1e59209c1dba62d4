//! Segment queue and dual-path orchestration
//!
//! Every detected utterance is processed by two independent paths: the
//! text path uploads the audio and waits for the source transcript, the
//! voice path drives the remote response for translated text and speech.
//! This actor owns the state both paths report into:
//!
//! - a bounded FIFO of segments awaiting processing (capacity 16);
//! - per-segment path results, each transitioning pending → terminal
//!   exactly once;
//! - the upload barrier: the voice path may not issue its response
//!   request for segment N until the text path has committed segment N's
//!   audio on the wire;
//! - id-order release: completed segments reach the engine in segment-id
//!   order no matter which order their paths finish in.
//!
//! Workers pull jobs instead of owning inboxes, so a segment evicted
//! under back-pressure can never be half-processed.

use crate::error::SegmentError;
use crate::segment::Segment;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Default queue capacity in segments
pub const DEFAULT_CAPACITY: usize = 16;

/// Which processing path is reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Text,
    Voice,
}

/// Text-path payload: recognized source text
#[derive(Debug, Clone)]
pub struct TextOutcome {
    pub transcript: String,
    /// Detected from the transcript script; overrides any preset
    pub language: String,
}

/// Voice-path payload: translated text plus playback accounting
#[derive(Debug, Clone)]
pub struct VoiceOutcome {
    pub translated_text: String,
    /// Audio chunks handed to the playback queue
    pub audio_chunks: u32,
    /// Whether any translated audio was actually rendered
    pub audio_played: bool,
}

/// Terminal result of one path
pub type PathResult<T> = std::result::Result<T, SegmentError>;

/// A segment whose both paths reached a terminal state, released in id
/// order.
#[derive(Debug, Clone)]
pub struct CompletedSegment {
    pub id: u64,
    pub duration_ms: u64,
    pub text: PathResult<TextOutcome>,
    pub voice: PathResult<VoiceOutcome>,
}

/// `enqueue` outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Ok,
    /// Queue at capacity; caller may evict the oldest unstarted segment
    Full,
}

enum Command {
    Enqueue {
        segment: Arc<Segment>,
        reply: oneshot::Sender<EnqueueOutcome>,
    },
    DropOldestUnstarted {
        reply: oneshot::Sender<Option<u64>>,
    },
    NextJob {
        path: PathKind,
        reply: oneshot::Sender<Option<Arc<Segment>>>,
    },
    MarkUploaded {
        id: u64,
    },
    WaitUploaded {
        id: u64,
        reply: oneshot::Sender<PathResult<()>>,
    },
    MarkPathComplete {
        id: u64,
        result: PathCompletion,
    },
    Clear,
}

/// Path-tagged terminal result for `mark_path_complete`
#[derive(Debug)]
pub enum PathCompletion {
    Text(PathResult<TextOutcome>),
    Voice(PathResult<VoiceOutcome>),
}

impl PathCompletion {
    fn kind(&self) -> PathKind {
        match self {
            PathCompletion::Text(_) => PathKind::Text,
            PathCompletion::Voice(_) => PathKind::Voice,
        }
    }
}

/// Cloneable handle to the queue actor.
#[derive(Clone)]
pub struct SegmentQueueHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl SegmentQueueHandle {
    /// Enqueue a segment for dual-path processing.
    pub async fn enqueue(&self, segment: Arc<Segment>) -> EnqueueOutcome {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Enqueue {
                segment,
                reply: tx,
            })
            .await
            .is_err()
        {
            return EnqueueOutcome::Full;
        }
        rx.await.unwrap_or(EnqueueOutcome::Full)
    }

    /// Evict the oldest segment neither path has started; returns its id.
    pub async fn drop_oldest_unstarted(&self) -> Option<u64> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::DropOldestUnstarted { reply: tx })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Pull the next job for a path; `None` means the session is over.
    pub async fn next_job(&self, path: PathKind) -> Option<Arc<Segment>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::NextJob { path, reply: tx })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Text path: segment audio is fully committed on the wire.
    pub async fn mark_uploaded(&self, id: u64) {
        let _ = self.cmd_tx.send(Command::MarkUploaded { id }).await;
    }

    /// Voice path barrier: resolves once the segment's audio upload is
    /// committed, or with an error when the segment will never upload.
    pub async fn wait_uploaded(&self, id: u64) -> PathResult<()> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::WaitUploaded { id, reply: tx })
            .await
            .is_err()
        {
            return Err(SegmentError::Cancelled);
        }
        rx.await.unwrap_or(Err(SegmentError::Cancelled))
    }

    /// Report a path's terminal result. Idempotent per (id, path).
    pub async fn mark_path_complete(&self, id: u64, result: PathCompletion) {
        let _ = self
            .cmd_tx
            .send(Command::MarkPathComplete { id, result })
            .await;
    }

    /// Drop every queued segment and wake all waiters with `cancelled`.
    pub async fn clear(&self) {
        let _ = self.cmd_tx.send(Command::Clear).await;
    }
}

struct Entry {
    segment: Arc<Segment>,
    text_dispatched: bool,
    voice_dispatched: bool,
    audio_uploaded: bool,
    upload_waiters: Vec<oneshot::Sender<PathResult<()>>>,
    text: Option<PathResult<TextOutcome>>,
    voice: Option<PathResult<VoiceOutcome>>,
}

impl Entry {
    fn new(segment: Arc<Segment>) -> Self {
        Self {
            segment,
            text_dispatched: false,
            voice_dispatched: false,
            audio_uploaded: false,
            upload_waiters: Vec::new(),
            text: None,
            voice: None,
        }
    }

    fn is_complete(&self) -> bool {
        self.text.is_some() && self.voice.is_some()
    }

    fn is_unstarted(&self) -> bool {
        !self.text_dispatched && !self.voice_dispatched
    }
}

/// Spawn the queue actor; completed segments come out of the returned
/// receiver in id order.
pub fn spawn(capacity: usize) -> (SegmentQueueHandle, mpsc::Receiver<CompletedSegment>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (released_tx, released_rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(run(capacity, cmd_rx, released_tx));
    (SegmentQueueHandle { cmd_tx }, released_rx)
}

async fn run(
    capacity: usize,
    mut cmd_rx: mpsc::Receiver<Command>,
    released_tx: mpsc::Sender<CompletedSegment>,
) {
    let mut entries: BTreeMap<u64, Entry> = BTreeMap::new();
    // Parked worker waiting for its next job, one per path
    let mut text_waiter: Option<oneshot::Sender<Option<Arc<Segment>>>> = None;
    let mut voice_waiter: Option<oneshot::Sender<Option<Arc<Segment>>>> = None;
    let mut cleared = false;

    while let Some(command) = cmd_rx.recv().await {
        match command {
            Command::Enqueue { segment, reply } => {
                if cleared {
                    let _ = reply.send(EnqueueOutcome::Full);
                    continue;
                }
                if entries.len() >= capacity {
                    let _ = reply.send(EnqueueOutcome::Full);
                    continue;
                }
                let id = segment.id;
                debug!("Segment {} enqueued ({} ms)", id, segment.duration_ms());
                entries.insert(id, Entry::new(segment));
                let _ = reply.send(EnqueueOutcome::Ok);
                dispatch(&mut entries, &mut text_waiter, &mut voice_waiter);
            }

            Command::DropOldestUnstarted { reply } => {
                let victim = entries
                    .iter()
                    .find(|(_, e)| e.is_unstarted())
                    .map(|(&id, _)| id);
                if let Some(id) = victim {
                    warn!("Segment queue full: dropping unstarted segment {}", id);
                    if let Some(entry) = entries.remove(&id) {
                        for waiter in entry.upload_waiters {
                            let _ = waiter.send(Err(SegmentError::Cancelled));
                        }
                    }
                    release_ready(&mut entries, &released_tx).await;
                }
                let _ = reply.send(victim);
            }

            Command::NextJob { path, reply } => {
                if cleared {
                    let _ = reply.send(None);
                    continue;
                }
                match path {
                    PathKind::Text => text_waiter = Some(reply),
                    PathKind::Voice => voice_waiter = Some(reply),
                }
                dispatch(&mut entries, &mut text_waiter, &mut voice_waiter);
            }

            Command::MarkUploaded { id } => {
                if let Some(entry) = entries.get_mut(&id) {
                    if !entry.audio_uploaded {
                        entry.audio_uploaded = true;
                        debug!("Segment {} audio committed", id);
                        for waiter in entry.upload_waiters.drain(..) {
                            let _ = waiter.send(Ok(()));
                        }
                    }
                }
            }

            Command::WaitUploaded { id, reply } => match entries.get_mut(&id) {
                Some(entry) if entry.audio_uploaded => {
                    let _ = reply.send(Ok(()));
                }
                Some(entry) => {
                    // Upload already failed terminally: release the
                    // barrier with the same reason instead of parking
                    // forever.
                    if let Some(Err(e)) = entry.text.as_ref() {
                        let _ = reply.send(Err(e.clone()));
                    } else {
                        entry.upload_waiters.push(reply);
                    }
                }
                None => {
                    let _ = reply.send(Err(SegmentError::Cancelled));
                }
            },

            Command::MarkPathComplete { id, result } => {
                let Some(entry) = entries.get_mut(&id) else {
                    debug!("Path completion for unknown segment {}", id);
                    continue;
                };
                let kind = result.kind();
                match result {
                    PathCompletion::Text(outcome) => {
                        if entry.text.is_some() {
                            debug!("Duplicate text completion for segment {}, ignoring", id);
                            continue;
                        }
                        // A failed upload can never satisfy the barrier
                        if outcome.is_err() && !entry.audio_uploaded {
                            if let Err(e) = &outcome {
                                for waiter in entry.upload_waiters.drain(..) {
                                    let _ = waiter.send(Err(e.clone()));
                                }
                            }
                        }
                        entry.text = Some(outcome);
                    }
                    PathCompletion::Voice(outcome) => {
                        if entry.voice.is_some() {
                            debug!("Duplicate voice completion for segment {}, ignoring", id);
                            continue;
                        }
                        entry.voice = Some(outcome);
                    }
                }
                debug!("Segment {} {:?} path terminal", id, kind);
                release_ready(&mut entries, &released_tx).await;
            }

            Command::Clear => {
                info!("Segment queue cleared ({} segment(s) dropped)", entries.len());
                cleared = true;
                for (_, entry) in std::mem::take(&mut entries) {
                    for waiter in entry.upload_waiters {
                        let _ = waiter.send(Err(SegmentError::Cancelled));
                    }
                }
                if let Some(waiter) = text_waiter.take() {
                    let _ = waiter.send(None);
                }
                if let Some(waiter) = voice_waiter.take() {
                    let _ = waiter.send(None);
                }
            }
        }
    }

    // Handle dropped: wake any parked workers
    if let Some(waiter) = text_waiter.take() {
        let _ = waiter.send(None);
    }
    if let Some(waiter) = voice_waiter.take() {
        let _ = waiter.send(None);
    }
}

/// Hand the oldest undispatched segment to each parked worker.
fn dispatch(
    entries: &mut BTreeMap<u64, Entry>,
    text_waiter: &mut Option<oneshot::Sender<Option<Arc<Segment>>>>,
    voice_waiter: &mut Option<oneshot::Sender<Option<Arc<Segment>>>>,
) {
    if text_waiter.is_some() {
        if let Some(entry) = entries.values_mut().find(|e| !e.text_dispatched) {
            entry.text_dispatched = true;
            let waiter = text_waiter.take().expect("checked above");
            let _ = waiter.send(Some(Arc::clone(&entry.segment)));
        }
    }
    if voice_waiter.is_some() {
        if let Some(entry) = entries.values_mut().find(|e| !e.voice_dispatched) {
            entry.voice_dispatched = true;
            let waiter = voice_waiter.take().expect("checked above");
            let _ = waiter.send(Some(Arc::clone(&entry.segment)));
        }
    }
}

/// Pop completed segments off the front of the id order.
async fn release_ready(
    entries: &mut BTreeMap<u64, Entry>,
    released_tx: &mpsc::Sender<CompletedSegment>,
) {
    while let Some((&id, entry)) = entries.iter().next() {
        if !entry.is_complete() {
            break;
        }
        let entry = entries.remove(&id).expect("front entry");
        let completed = CompletedSegment {
            id,
            duration_ms: entry.segment.duration_ms(),
            text: entry.text.expect("complete"),
            voice: entry.voice.expect("complete"),
        };
        if released_tx.send(completed).await.is_err() {
            return;
        }
    }
}
