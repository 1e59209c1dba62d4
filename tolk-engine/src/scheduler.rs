//! Response scheduler
//!
//! The remote peer rejects overlapping response creations, so every
//! `response.create` in the session funnels through this actor. It owns
//! two invariants:
//!
//! 1. at most one request is in flight at any instant;
//! 2. once in flight, a request is never retransmitted on the same wire
//!    without first observing terminal completion of its predecessor.
//!
//! Producers get an immediate `Busy` rejection while a request is in
//! flight and wait on the idle watch before trying again; completed,
//! timed-out, cancelled and soft-rejected requests resolve through
//! per-request oneshot channels.

use crate::error::SegmentError;
use crate::link::protocol::{ClientEvent, ResponseParams, ServerEvent};
use crate::link::LinkHandle;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ========================================
// Response state machine
// ========================================

/// Lifecycle of one response request. Transitions are strict; anything
/// not listed in [`ResponsePhase::advance`] is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePhase {
    Idle,
    AudioBuffering,
    AudioCommitted,
    ResponsePending,
    ResponseActive,
    ResponseCompleting,
}

/// Rejected phase transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid response transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ResponsePhase,
    pub to: ResponsePhase,
}

impl ResponsePhase {
    /// Attempt a transition, returning the new phase or a rejection.
    ///
    /// The forward chain is Idle → AudioBuffering → AudioCommitted →
    /// ResponsePending → ResponseActive → ResponseCompleting → Idle.
    /// Two shortcuts exist: AudioBuffering → Idle (cancel before commit)
    /// and AudioCommitted → Idle (error recovery).
    pub fn advance(self, to: ResponsePhase) -> std::result::Result<ResponsePhase, InvalidTransition> {
        use ResponsePhase::*;
        let ok = matches!(
            (self, to),
            (Idle, AudioBuffering)
                | (AudioBuffering, AudioCommitted)
                | (AudioCommitted, ResponsePending)
                | (ResponsePending, ResponseActive)
                | (ResponseActive, ResponseCompleting)
                | (ResponseCompleting, Idle)
                | (AudioBuffering, Idle)
                | (AudioCommitted, Idle)
        );
        if ok {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    /// A new response may be created only before any is pending.
    pub fn can_create_response(&self) -> bool {
        matches!(self, ResponsePhase::Idle | ResponsePhase::AudioBuffering)
    }

    /// Whether a response is currently being produced remotely.
    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            ResponsePhase::ResponsePending
                | ResponsePhase::ResponseActive
                | ResponsePhase::ResponseCompleting
        )
    }
}

// ========================================
// Requests and completions
// ========================================

/// A remote-facing response instruction, created by the voice path once
/// the segment's audio is committed on the wire.
#[derive(Debug, Clone)]
pub struct ResponseRequest {
    /// Owning segment
    pub segment_id: u64,
    /// Requested modalities ("text", "audio")
    pub modalities: Vec<String>,
    /// Translation instructions
    pub instructions: String,
}

/// Successful completion of a request
#[derive(Debug, Clone)]
pub struct CompletedResponse {
    /// Server-assigned response id
    pub response_id: String,
}

/// Resolution delivered to the enqueuer
pub type Completion = oneshot::Receiver<std::result::Result<CompletedResponse, SegmentError>>;

/// Immediate enqueue rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// A request is in flight; wait for idle and try again
    #[error("scheduler busy")]
    Busy,
    /// Scheduler has shut down (link closed or session stopped)
    #[error("scheduler closed")]
    Closed,
}

/// Scheduler tunables; defaults match production behavior, tests shrink
/// the windows.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Per-attempt completion window
    pub request_timeout: Duration,
    /// Retries after the first timeout
    pub max_retries: u32,
    /// Backoff base; retry k waits base · 2^(k-1)
    pub backoff_base: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries: 2,
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// Cumulative scheduler counters, updated by the actor
#[derive(Debug, Default)]
struct SchedulerCounters {
    completed: AtomicU64,
    retries: AtomicU64,
    soft_conflicts: AtomicU64,
}

/// Snapshot of the scheduler's cumulative counters
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    /// Requests resolved by a matching `response.done`
    pub completed: u64,
    /// Timed-out attempts retransmitted with backoff
    pub retries: u64,
    /// Requests abandoned on the active-response soft failure
    pub soft_conflicts: u64,
}

// ========================================
// Handle
// ========================================

enum Command {
    Enqueue {
        request: ResponseRequest,
        reply: oneshot::Sender<std::result::Result<Completion, EnqueueError>>,
    },
    Clear,
}

/// Cloneable handle to the scheduler actor.
#[derive(Clone)]
pub struct SchedulerHandle {
    cmd_tx: mpsc::Sender<Command>,
    idle_rx: watch::Receiver<bool>,
    counters: Arc<SchedulerCounters>,
}

impl SchedulerHandle {
    /// Enqueue a request. Rejects immediately with [`EnqueueError::Busy`]
    /// while another request is in flight.
    pub async fn enqueue(
        &self,
        request: ResponseRequest,
    ) -> std::result::Result<Completion, EnqueueError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Enqueue {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EnqueueError::Closed)?;
        reply_rx.await.map_err(|_| EnqueueError::Closed)?
    }

    /// Wait until no request is pending or in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.idle_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Reject every pending and in-flight request with `cancelled`.
    pub async fn clear(&self) {
        let _ = self.cmd_tx.send(Command::Clear).await;
    }

    /// Cumulative counters since the scheduler started.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            soft_conflicts: self.counters.soft_conflicts.load(Ordering::Relaxed),
        }
    }
}

// ========================================
// Actor
// ========================================

struct InFlight {
    request: ResponseRequest,
    /// Taken when the request is resolved early (soft conflict) while the
    /// slot stays occupied until the peer's terminal event.
    completion: Option<oneshot::Sender<std::result::Result<CompletedResponse, SegmentError>>>,
    /// Server id, bound on `response.created`
    response_id: Option<String>,
    phase: ResponsePhase,
    deadline: Instant,
    attempt: u32,
}

struct PendingEntry {
    request: ResponseRequest,
    completion: oneshot::Sender<std::result::Result<CompletedResponse, SegmentError>>,
    /// Earliest transmit time (backoff for retries)
    not_before: Instant,
    attempt: u32,
}

/// Spawn the scheduler actor.
///
/// `responses` is the link route carrying `response.created`,
/// `response.done` and `error` events.
pub fn spawn(
    link: LinkHandle,
    responses: mpsc::Receiver<ServerEvent>,
    config: SchedulerConfig,
) -> SchedulerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (idle_tx, idle_rx) = watch::channel(true);
    let counters = Arc::new(SchedulerCounters::default());
    tokio::spawn(run(
        link,
        responses,
        config,
        cmd_rx,
        idle_tx,
        Arc::clone(&counters),
    ));
    SchedulerHandle {
        cmd_tx,
        idle_rx,
        counters,
    }
}

async fn run(
    link: LinkHandle,
    mut responses: mpsc::Receiver<ServerEvent>,
    config: SchedulerConfig,
    mut cmd_rx: mpsc::Receiver<Command>,
    idle_tx: watch::Sender<bool>,
    counters: Arc<SchedulerCounters>,
) {
    let mut pending: VecDeque<PendingEntry> = VecDeque::new();
    let mut in_flight: Option<InFlight> = None;

    loop {
        let _ = idle_tx.send(in_flight.is_none() && pending.is_empty());

        // Next wake-up: in-flight deadline, or a pending retry's backoff
        let wake = match (&in_flight, pending.front()) {
            (Some(inflight), _) => Some(inflight.deadline),
            (None, Some(entry)) => Some(entry.not_before),
            (None, None) => None,
        };
        let sleep = async {
            match wake {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(Command::Enqueue { request, reply }) => {
                    if in_flight.is_some() {
                        let _ = reply.send(Err(EnqueueError::Busy));
                    } else {
                        let (tx, rx) = oneshot::channel();
                        debug!("Scheduler accepted request for segment {}", request.segment_id);
                        pending.push_back(PendingEntry {
                            request,
                            completion: tx,
                            not_before: Instant::now(),
                            attempt: 0,
                        });
                        let _ = reply.send(Ok(rx));
                        consume(&link, &mut pending, &mut in_flight, &config).await;
                    }
                }
                Some(Command::Clear) => {
                    info!("Scheduler cleared: rejecting {} pending request(s)", pending.len());
                    for entry in pending.drain(..) {
                        let _ = entry.completion.send(Err(SegmentError::Cancelled));
                    }
                    if let Some(mut inflight) = in_flight.take() {
                        if let Some(tx) = inflight.completion.take() {
                            let _ = tx.send(Err(SegmentError::Cancelled));
                        }
                    }
                }
                None => break,
            },

            event = responses.recv() => match event {
                Some(ServerEvent::ResponseCreated { response }) => {
                    if let Some(inflight) = in_flight.as_mut() {
                        debug!("Response {} bound to segment {}", response.id, inflight.request.segment_id);
                        inflight.response_id = Some(response.id);
                        if let Ok(phase) = inflight.phase.advance(ResponsePhase::ResponseActive) {
                            inflight.phase = phase;
                        }
                    } else {
                        warn!("response.created with no request in flight");
                    }
                }
                Some(ServerEvent::ResponseDone { response }) => {
                    let matches = in_flight
                        .as_ref()
                        .map(|f| f.response_id.as_deref() == Some(response.id.as_str())
                            || f.response_id.is_none())
                        .unwrap_or(false);
                    if matches {
                        let mut inflight = in_flight.take().expect("in flight present");
                        // Completing is transitional; the slot frees in the
                        // same step.
                        if let Ok(phase) = inflight.phase.advance(ResponsePhase::ResponseCompleting) {
                            inflight.phase = phase;
                        }
                        if let Some(tx) = inflight.completion.take() {
                            counters.completed.fetch_add(1, Ordering::Relaxed);
                            let _ = tx.send(Ok(CompletedResponse {
                                response_id: response.id,
                            }));
                        }
                        consume(&link, &mut pending, &mut in_flight, &config).await;
                    } else {
                        debug!("response.done for unknown response {}", response.id);
                    }
                }
                Some(event @ ServerEvent::Error { .. }) => {
                    if event.is_active_response_conflict() {
                        // Soft failure: resolve the caller, keep the slot
                        // occupied until the prior response's terminal
                        // event re-drives the queue. Never retried.
                        warn!("Remote reports active response; abandoning current create");
                        if let Some(inflight) = in_flight.as_mut() {
                            if let Some(tx) = inflight.completion.take() {
                                counters.soft_conflicts.fetch_add(1, Ordering::Relaxed);
                                let _ = tx.send(Err(SegmentError::SoftConflict));
                            }
                        }
                    } else if let ServerEvent::Error { code, message } = &event {
                        warn!("Remote error (code {:?}): {}", code, message);
                    }
                }
                Some(_) => {}
                None => {
                    info!("Response route closed; failing outstanding requests");
                    fail_all(&mut pending, &mut in_flight, SegmentError::LinkClosed);
                    break;
                }
            },

            _ = sleep => {
                if let Some(mut inflight) = in_flight.take() {
                    handle_timeout(&mut pending, &mut inflight, &config, &counters);
                } else {
                    consume(&link, &mut pending, &mut in_flight, &config).await;
                }
            }
        }
    }

    let _ = idle_tx.send(true);
}

/// Move the queue head onto the wire when the slot is free and its
/// backoff window has passed.
async fn consume(
    link: &LinkHandle,
    pending: &mut VecDeque<PendingEntry>,
    in_flight: &mut Option<InFlight>,
    config: &SchedulerConfig,
) {
    if in_flight.is_some() {
        return;
    }
    let ready = pending
        .front()
        .map(|e| e.not_before <= Instant::now())
        .unwrap_or(false);
    if !ready {
        return;
    }
    let entry = pending.pop_front().expect("head checked");

    let frame = ClientEvent::ResponseCreate {
        response: ResponseParams {
            modalities: entry.request.modalities.clone(),
            instructions: entry.request.instructions.clone(),
        },
    };
    if link.send(frame).await.is_err() {
        warn!("Link gone while transmitting response.create");
        let _ = entry.completion.send(Err(SegmentError::LinkClosed));
        return;
    }

    debug!(
        "response.create on the wire for segment {} (attempt {})",
        entry.request.segment_id, entry.attempt
    );
    // Committed audio is the entry condition for the scheduler; the
    // transmit moves the request to ResponsePending.
    let phase = ResponsePhase::AudioCommitted
        .advance(ResponsePhase::ResponsePending)
        .expect("legal transition");
    *in_flight = Some(InFlight {
        request: entry.request,
        completion: Some(entry.completion),
        response_id: None,
        phase,
        deadline: Instant::now() + config.request_timeout,
        attempt: entry.attempt,
    });
}

/// Per-attempt timeout: reinsert at the queue head with backoff until
/// retries are exhausted.
fn handle_timeout(
    pending: &mut VecDeque<PendingEntry>,
    inflight: &mut InFlight,
    config: &SchedulerConfig,
    counters: &SchedulerCounters,
) {
    let Some(completion) = inflight.completion.take() else {
        // Already resolved (soft conflict); just free the slot.
        return;
    };

    if inflight.attempt < config.max_retries {
        let attempt = inflight.attempt + 1;
        let backoff = config.backoff_base * 2u32.pow(attempt - 1);
        counters.retries.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Request for segment {} timed out; retry {} in {:?}",
            inflight.request.segment_id, attempt, backoff
        );
        pending.push_front(PendingEntry {
            request: inflight.request.clone(),
            completion,
            not_before: Instant::now() + backoff,
            attempt,
        });
    } else {
        warn!(
            "Request for segment {} timed out after {} retries",
            inflight.request.segment_id, inflight.attempt
        );
        let _ = completion.send(Err(SegmentError::Timeout));
    }
}

fn fail_all(
    pending: &mut VecDeque<PendingEntry>,
    in_flight: &mut Option<InFlight>,
    error: SegmentError,
) {
    for entry in pending.drain(..) {
        let _ = entry.completion.send(Err(error.clone()));
    }
    if let Some(mut inflight) = in_flight.take() {
        if let Some(tx) = inflight.completion.take() {
            let _ = tx.send(Err(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ResponsePhase::*;

    #[test]
    fn test_forward_chain() {
        let phase = Idle
            .advance(AudioBuffering)
            .and_then(|p| p.advance(AudioCommitted))
            .and_then(|p| p.advance(ResponsePending))
            .and_then(|p| p.advance(ResponseActive))
            .and_then(|p| p.advance(ResponseCompleting))
            .and_then(|p| p.advance(Idle))
            .unwrap();
        assert_eq!(phase, Idle);
    }

    #[test]
    fn test_cancel_shortcuts() {
        assert!(AudioBuffering.advance(Idle).is_ok());
        assert!(AudioCommitted.advance(Idle).is_ok());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        assert!(Idle.advance(ResponsePending).is_err());
        assert!(ResponsePending.advance(Idle).is_err());
        assert!(ResponseActive.advance(ResponsePending).is_err());
        assert!(ResponseCompleting.advance(ResponseActive).is_err());
        assert!(Idle.advance(Idle).is_err());
        let err = ResponsePending.advance(AudioBuffering).unwrap_err();
        assert_eq!(err.from, ResponsePending);
        assert_eq!(err.to, AudioBuffering);
    }

    #[test]
    fn test_predicates() {
        assert!(Idle.can_create_response());
        assert!(AudioBuffering.can_create_response());
        assert!(!ResponsePending.can_create_response());
        assert!(!AudioCommitted.can_create_response());

        assert!(ResponsePending.is_processing());
        assert!(ResponseActive.is_processing());
        assert!(ResponseCompleting.is_processing());
        assert!(!Idle.is_processing());
        assert!(!AudioBuffering.is_processing());
    }
}
