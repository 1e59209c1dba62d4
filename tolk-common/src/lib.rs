//! # Tolk Common Library
//!
//! Shared code for the tolk interpretation engine:
//! - Session configuration loading and validation
//! - Event types (InterpreterEvent enum) and the EventBus
//! - Shared error type
//! - Script-based language identification

pub mod config;
pub mod error;
pub mod events;
pub mod language;

pub use config::{AudioPreset, EngineSettings, SessionConfig, VadMode, VadSensitivity};
pub use error::{Error, Result};
pub use events::{EventBus, InterpreterEvent, PathOutcome, SegmentEnvelope, SessionEndCategory};
pub use language::detect_language;
