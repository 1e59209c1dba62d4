//! Sample-accurate DSP blocks for the capture conditioner
//!
//! Every block consumes and produces frames of identical shape, is
//! single-threaded, and allocates nothing on the audio path. Per-sample
//! math is f32; long-running energy accumulators are f64 to avoid drift
//! over multi-hour sessions.

pub mod aec;
pub mod biquad;
pub mod chain;
pub mod compressor;

pub use aec::EchoCanceller;
pub use biquad::Biquad;
pub use chain::Conditioner;
pub use compressor::Compressor;
