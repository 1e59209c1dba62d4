//! Per-segment processing paths
//!
//! Each segment is handled by two independent, fault-isolated workers:
//! the text path uploads the utterance audio and waits for the source
//! transcript; the voice path drives the remote response that produces
//! translated text and speech. One path failing never blocks the other.

pub mod text;
pub mod voice;

pub use text::run_text_path;
pub use voice::run_voice_path;
