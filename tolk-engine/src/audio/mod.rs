//! Audio I/O: frame types, capture sources, the playback reference ring,
//! and sample-rate conversion.

pub mod capture;
pub mod reference;
pub mod resampler;
pub mod types;

pub use capture::{CpalSource, FrameSource, ScriptedSource};
pub use reference::{ReferenceConsumer, ReferenceProducer, ReferenceRing};
pub use resampler::StreamResampler;
pub use types::{pcm16_from_f32, pcm16_to_f32, AudioFrame, FRAME_SAMPLES};
