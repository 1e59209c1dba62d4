//! Error types for the interpretation engine
//!
//! Errors are grouped by blast radius: session-fatal (configuration,
//! device, link) versus per-segment (timeout, soft protocol conflicts,
//! empty results). Each kind maps to a recovery strategy so callers never
//! guess whether to retry, skip, or tear the session down.

use thiserror::Error;

/// Main error type for the interpretation engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// IO errors from the host environment
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing or invalid configuration; fatal at session start
    #[error("Configuration error: {0}")]
    Config(String),

    /// Capture or output device failure; fatal to the session
    #[error("Device error: {0}")]
    Device(String),

    /// Socket closed or unreachable; fatal to the session
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Per-segment failures that never end the session
    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Generic errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Errors on the remote link
#[derive(Debug, Error)]
pub enum LinkError {
    /// Connection could not be established at session start
    #[error("Connection refused: {0}")]
    Refused(String),

    /// Socket closed mid-session
    #[error("Socket closed")]
    Closed,

    /// Outbound frame could not be serialized or sent
    #[error("Send failed: {0}")]
    Send(String),

    /// Inbound frame was not valid JSON or missing its type tag
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Per-segment, fault-isolated errors; one path failing never blocks
/// the other path or the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentError {
    /// No terminal event arrived within the per-request window, after retries
    #[error("Timed out waiting for remote response")]
    Timeout,

    /// Remote rejected the response because one was already active
    #[error("Remote already has an active response")]
    SoftConflict,

    /// Socket went away while the segment was in flight
    #[error("Link closed while segment in flight")]
    LinkClosed,

    /// Remote returned an empty transcript or zero-byte audio
    #[error("Empty result from remote")]
    EmptyResult,

    /// Session stopped while the segment was pending
    #[error("Cancelled")]
    Cancelled,
}

impl SegmentError {
    /// Stable machine-readable token carried in result envelopes
    pub fn reason(&self) -> &'static str {
        match self {
            SegmentError::Timeout => "timeout",
            SegmentError::SoftConflict => "soft_conflict",
            SegmentError::LinkClosed => "link_closed",
            SegmentError::EmptyResult => "empty_result",
            SegmentError::Cancelled => "cancelled",
        }
    }
}

/// Result type alias using the engine error type
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error recovery strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Retry the operation with backoff
    Retry,
    /// Fail only the affected segment and continue
    FailSegment,
    /// Log the error and continue
    LogAndContinue,
    /// Fatal error - end the session
    Fatal,
}

impl EngineError {
    /// Get the recommended recovery strategy for this error
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            EngineError::Config(_) => RecoveryStrategy::Fatal,
            EngineError::Device(_) => RecoveryStrategy::Fatal,
            EngineError::Link(_) => RecoveryStrategy::Fatal,
            EngineError::Segment(SegmentError::Timeout) => RecoveryStrategy::Retry,
            // The prior request's terminal event re-drives the queue;
            // retrying here would storm the remote.
            EngineError::Segment(SegmentError::SoftConflict) => RecoveryStrategy::LogAndContinue,
            EngineError::Segment(_) => RecoveryStrategy::FailSegment,
            EngineError::Io(_) => RecoveryStrategy::Fatal,
            EngineError::Other(_) => RecoveryStrategy::LogAndContinue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_conflict_never_retries() {
        let err = EngineError::Segment(SegmentError::SoftConflict);
        assert_eq!(err.recovery_strategy(), RecoveryStrategy::LogAndContinue);
    }

    #[test]
    fn test_timeout_retries() {
        let err = EngineError::Segment(SegmentError::Timeout);
        assert_eq!(err.recovery_strategy(), RecoveryStrategy::Retry);
    }

    #[test]
    fn test_session_fatal_kinds() {
        assert_eq!(
            EngineError::Config("missing".into()).recovery_strategy(),
            RecoveryStrategy::Fatal
        );
        assert_eq!(
            EngineError::Link(LinkError::Closed).recovery_strategy(),
            RecoveryStrategy::Fatal
        );
    }

    #[test]
    fn test_reason_tokens_stable() {
        assert_eq!(SegmentError::Timeout.reason(), "timeout");
        assert_eq!(SegmentError::SoftConflict.reason(), "soft_conflict");
        assert_eq!(SegmentError::LinkClosed.reason(), "link_closed");
        assert_eq!(SegmentError::Cancelled.reason(), "cancelled");
    }
}
