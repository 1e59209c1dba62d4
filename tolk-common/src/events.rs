//! Event types for the interpretation engine
//!
//! The engine communicates with its host through a broadcast [`EventBus`]:
//! per-segment result envelopes in segment-id order, plus a single
//! session-ended notice. Internal pipeline traffic uses dedicated mpsc
//! channels and never goes through this bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Terminal outcome of one processing path (text or voice) of a segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum PathOutcome {
    /// Path produced its payload
    Ok,
    /// Path failed; the reason is a stable machine-readable token
    /// (`timeout`, `soft_conflict`, `link_closed`, `empty_result`, `cancelled`)
    Error(String),
}

/// Per-segment result envelope delivered to the UI adapter.
///
/// The two paths are independent: either text may be present while the
/// other path failed. `error` carries the first path failure, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentEnvelope {
    /// Monotonic segment id
    pub id: u64,
    /// Detected source language code (after transcript-based detection)
    pub source_lang: Option<String>,
    /// Recognized source-language text, when the text path succeeded
    pub source_text: Option<String>,
    /// Translated text, when the voice path succeeded
    pub translated_text: Option<String>,
    /// Whether translated audio was actually rendered to the device
    pub translated_audio_played: bool,
    /// First path error, if either path failed
    pub error: Option<String>,
}

/// Category attached to the session-ended notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndCategory {
    /// Normal stop requested by the host
    Stopped,
    /// Capture or output device failed
    Device,
    /// Socket closed or unreachable mid-session
    Link,
}

/// Engine event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InterpreterEvent {
    /// Session opened and the pipeline is running
    SessionStarted {
        session_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// An utterance was detected and queued
    SegmentDetected {
        segment_id: u64,
        duration_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Both paths of a segment reached a terminal state
    SegmentCompleted {
        envelope: SegmentEnvelope,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Session ended; no further events follow
    SessionEnded {
        session_id: Uuid,
        category: SessionEndCategory,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl InterpreterEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            InterpreterEvent::SessionStarted { .. } => "SessionStarted",
            InterpreterEvent::SegmentDetected { .. } => "SegmentDetected",
            InterpreterEvent::SegmentCompleted { .. } => "SegmentCompleted",
            InterpreterEvent::SessionEnded { .. } => "SessionEnded",
        }
    }
}

/// One-to-many broadcast bus for [`InterpreterEvent`]
pub struct EventBus {
    tx: broadcast::Sender<InterpreterEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new EventBus with the given channel capacity.
    ///
    /// Slow subscribers that fall more than `capacity` events behind see
    /// `RecvError::Lagged` and miss the overwritten events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<InterpreterEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Returns `Err` when no subscriber is listening.
    pub fn emit(
        &self,
        event: InterpreterEvent,
    ) -> std::result::Result<usize, broadcast::error::SendError<InterpreterEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the no-subscriber case.
    pub fn emit_lossy(&self, event: InterpreterEvent) {
        let _ = self.tx.send(event);
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
