//! # Tolk Interpretation Engine
//!
//! Bidirectional real-time speech interpretation pipeline: conditioned
//! capture, voice-activity segmentation, dual-path processing against a
//! remote speech-to-speech service, and ordered playback of translated
//! audio.
//!
//! Library crate used by the `tolk-engine` binary and the integration
//! tests; all pipeline components are constructible without real audio
//! devices or sockets.

pub mod audio;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod link;
pub mod paths;
pub mod playback;
pub mod queue;
pub mod scheduler;
pub mod segment;
pub mod vad;

pub use engine::InterpreterEngine;
pub use error::{EngineError, Result};
