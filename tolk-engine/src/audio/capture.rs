//! Audio capture sources
//!
//! Capture is a capability: anything that can produce [`AudioFrame`]s at a
//! fixed rate implements [`FrameSource`]. The engine selects an
//! implementation at session start (a cpal-backed microphone or system
//! loopback device in production, a scripted source in tests) and the
//! rest of the pipeline never knows the difference.

use crate::audio::types::{AudioFrame, FRAME_SAMPLES};
use crate::error::{EngineError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tolk_common::config::VadMode;
use tracing::{debug, info, warn};

/// Capability to produce capture frames at a fixed rate.
pub trait FrameSource: Send {
    /// Device sample rate the frames will carry
    fn sample_rate(&self) -> u32;

    /// Begin producing frames into `tx`.
    ///
    /// Returns a handle that stops capture when dropped or explicitly
    /// stopped. Frames that cannot be delivered because the channel is
    /// full are dropped and counted; audio loss is preferred over
    /// unbounded latency.
    fn start(self: Box<Self>, tx: mpsc::Sender<AudioFrame>) -> Result<CaptureHandle>;
}

/// Running capture; dropping it ends the stream.
pub struct CaptureHandle {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    join: Option<std::thread::JoinHandle<()>>,
    dropped_frames: Arc<AtomicU64>,
}

impl CaptureHandle {
    /// Stop capture and wait for the device thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    /// Frames dropped because the pipeline could not keep up
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Accumulates device callback samples into frame-sized sends.
struct FrameAssembler {
    scratch: Vec<f32>,
    session_start: Instant,
    tx: mpsc::Sender<AudioFrame>,
    dropped: Arc<AtomicU64>,
}

impl FrameAssembler {
    fn new(tx: mpsc::Sender<AudioFrame>, dropped: Arc<AtomicU64>) -> Self {
        Self {
            scratch: Vec::with_capacity(FRAME_SAMPLES),
            session_start: Instant::now(),
            tx,
            dropped,
        }
    }

    /// Push mono samples from the device callback; emits whole frames.
    fn push(&mut self, samples: &[f32]) {
        for &s in samples {
            self.scratch.push(s);
            if self.scratch.len() == FRAME_SAMPLES {
                let ts = self.session_start.elapsed().as_nanos() as u64;
                let frame = AudioFrame::from_slice(&self.scratch, ts);
                self.scratch.clear();

                if self.tx.try_send(frame).is_err() {
                    let count = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if count % 1000 == 0 {
                        warn!("Capture channel full, dropping frames (total: {})", count);
                    }
                }
            }
        }
    }
}

/// cpal-backed capture from the microphone or a system loopback device.
pub struct CpalSource {
    mode: VadMode,
    sample_rate: u32,
}

impl CpalSource {
    /// Probe the device for `mode` and record its native rate.
    pub fn new(mode: VadMode) -> Result<Self> {
        let device = Self::select_device(mode)?;
        let config = device
            .default_input_config()
            .map_err(|e| EngineError::Device(format!("no input config: {e}")))?;
        let sample_rate = config.sample_rate().0;
        info!(
            "Capture device: {:?} ({} Hz, mode {:?})",
            device.name().unwrap_or_else(|_| "unknown".into()),
            sample_rate,
            mode
        );
        Ok(Self { mode, sample_rate })
    }

    fn select_device(mode: VadMode) -> Result<cpal::Device> {
        let host = cpal::default_host();
        match mode {
            VadMode::Microphone => host
                .default_input_device()
                .ok_or_else(|| EngineError::Device("no input device available".into())),
            VadMode::System => {
                // Loopback capture shows up as an input device on every
                // platform we support (e.g. PulseAudio "monitor" sources);
                // fall back to the default input if none is found.
                let monitor = host.input_devices().ok().and_then(|mut devices| {
                    devices.find(|d| {
                        d.name()
                            .map(|n| n.to_ascii_lowercase().contains("monitor"))
                            .unwrap_or(false)
                    })
                });
                match monitor {
                    Some(device) => Ok(device),
                    None => {
                        warn!("No loopback device found, falling back to default input");
                        host.default_input_device()
                            .ok_or_else(|| EngineError::Device("no input device available".into()))
                    }
                }
            }
        }
    }
}

impl FrameSource for CpalSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(self: Box<Self>, tx: mpsc::Sender<AudioFrame>) -> Result<CaptureHandle> {
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let dropped = Arc::new(AtomicU64::new(0));
        let dropped_in_thread = Arc::clone(&dropped);
        let mode = self.mode;

        // The cpal stream is not Send, so it lives on its own thread for
        // the whole session.
        let join = std::thread::Builder::new()
            .name("tolk-capture".into())
            .spawn(move || {
                let run = || -> Result<cpal::Stream> {
                    let device = CpalSource::select_device(mode)?;
                    let config = device
                        .default_input_config()
                        .map_err(|e| EngineError::Device(format!("no input config: {e}")))?;
                    let channels = config.channels() as usize;
                    let mut assembler = FrameAssembler::new(tx, dropped_in_thread);

                    let stream = device
                        .build_input_stream(
                            &config.into(),
                            move |data: &[f32], _| {
                                if channels == 1 {
                                    assembler.push(data);
                                } else {
                                    // Average down to mono
                                    for chunk in data.chunks_exact(channels) {
                                        let mono =
                                            chunk.iter().sum::<f32>() / channels as f32;
                                        assembler.push(&[mono]);
                                    }
                                }
                            },
                            |e| warn!("Capture stream error: {}", e),
                            None,
                        )
                        .map_err(|e| EngineError::Device(format!("build stream: {e}")))?;
                    stream
                        .play()
                        .map_err(|e| EngineError::Device(format!("start stream: {e}")))?;
                    Ok(stream)
                };

                match run() {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        // Hold the stream until stop is requested
                        let _ = stop_rx.recv();
                        drop(stream);
                        debug!("Capture thread exiting");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| EngineError::Device(format!("capture thread: {e}")))?;

        // Surface device failures synchronously at session start
        ready_rx
            .recv()
            .map_err(|_| EngineError::Device("capture thread died".into()))??;

        Ok(CaptureHandle {
            stop_tx: Some(stop_tx),
            join: Some(join),
            dropped_frames: dropped,
        })
    }
}

/// Scripted capture source for tests and headless runs: plays a fixed
/// sample buffer through the pipeline, then goes silent until stopped.
pub struct ScriptedSource {
    sample_rate: u32,
    samples: Vec<f32>,
    /// When true, frames are delivered as fast as the channel accepts them
    /// instead of paced to real time.
    unpaced: bool,
}

impl ScriptedSource {
    pub fn new(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            samples,
            unpaced: true,
        }
    }

    /// Pace delivery to real time (frame duration sleeps between sends)
    pub fn paced(mut self) -> Self {
        self.unpaced = false;
        self
    }
}

impl FrameSource for ScriptedSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(self: Box<Self>, tx: mpsc::Sender<AudioFrame>) -> Result<CaptureHandle> {
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let dropped = Arc::new(AtomicU64::new(0));
        let rate = self.sample_rate;
        let unpaced = self.unpaced;
        let samples = self.samples;

        let join = std::thread::Builder::new()
            .name("tolk-capture-scripted".into())
            .spawn(move || {
                let frame_ns = FRAME_SAMPLES as u64 * 1_000_000_000 / rate as u64;
                let mut ts = 0u64;
                for chunk in samples.chunks(FRAME_SAMPLES) {
                    if stop_rx.try_recv().is_ok() {
                        return;
                    }
                    let mut frame = AudioFrame::silent(ts);
                    frame.samples[..chunk.len()].copy_from_slice(chunk);
                    ts += frame_ns;

                    if tx.blocking_send(frame).is_err() {
                        return;
                    }
                    if !unpaced {
                        std::thread::sleep(std::time::Duration::from_nanos(frame_ns));
                    }
                }
                // Feed silence so downstream hangover/debounce timers run out
                loop {
                    if stop_rx.try_recv().is_ok() {
                        return;
                    }
                    let frame = AudioFrame::silent(ts);
                    ts += frame_ns;
                    if tx.blocking_send(frame).is_err() {
                        return;
                    }
                    if !unpaced {
                        std::thread::sleep(std::time::Duration::from_nanos(frame_ns));
                    } else {
                        // Yield so the consumer can cancel us
                        std::thread::sleep(std::time::Duration::from_micros(50));
                    }
                }
            })
            .map_err(|e| EngineError::Device(format!("capture thread: {e}")))?;

        Ok(CaptureHandle {
            stop_tx: Some(stop_tx),
            join: Some(join),
            dropped_frames: dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_source_delivers_frames() {
        let samples: Vec<f32> = (0..FRAME_SAMPLES * 3).map(|i| i as f32 / 1000.0).collect();
        let source = Box::new(ScriptedSource::new(24_000, samples.clone()));
        let (tx, mut rx) = mpsc::channel(16);
        let handle = source.start(tx).unwrap();

        let f1 = rx.recv().await.unwrap();
        let f2 = rx.recv().await.unwrap();
        let f3 = rx.recv().await.unwrap();
        assert_eq!(f1.samples[0], 0.0);
        assert_eq!(f2.samples[0], samples[FRAME_SAMPLES]);
        assert_eq!(f3.samples[0], samples[FRAME_SAMPLES * 2]);
        // Timestamps advance by one frame each time
        assert!(f2.timestamp_ns > f1.timestamp_ns);
        assert_eq!(f3.timestamp_ns - f2.timestamp_ns, f2.timestamp_ns - f1.timestamp_ns);

        handle.stop();
    }

    #[tokio::test]
    async fn test_scripted_source_pads_with_silence() {
        let source = Box::new(ScriptedSource::new(24_000, vec![0.5; FRAME_SAMPLES]));
        let (tx, mut rx) = mpsc::channel(16);
        let handle = source.start(tx).unwrap();

        let speech = rx.recv().await.unwrap();
        assert_eq!(speech.samples[0], 0.5);
        let silence = rx.recv().await.unwrap();
        assert_eq!(silence.samples[0], 0.0);

        handle.stop();
    }
}
