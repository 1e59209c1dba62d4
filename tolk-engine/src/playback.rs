//! Playback of translated audio
//!
//! An unbounded FIFO of [`PlaybackChunk`]s drained by a single consumer
//! thread that decodes PCM16, applies the output volume, pushes the
//! rendered samples to an [`OutputSink`], and taps the very same samples
//! into the echo canceller's reference ring. Chunks from one response
//! render in sequence order; responses render in arrival order.
//!
//! With playback disabled the consumer still drains chunks (the voice
//! path keeps flowing) but discards them: nothing reaches the device and
//! nothing enters the reference ring.

use crate::audio::reference::ReferenceProducer;
use crate::audio::resampler::StreamResampler;
use crate::audio::types::pcm16_to_f32;
use crate::error::{EngineError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{traits::*, HeapRb};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Translated audio bytes bound to their response, ordered by sequence
/// number within it.
#[derive(Debug, Clone)]
pub struct PlaybackChunk {
    /// Server-assigned id of the owning response
    pub response_id: String,
    /// Position within the response
    pub sequence: u32,
    /// PCM16 little-endian, 24 kHz mono
    pub pcm: Vec<u8>,
}

/// Anything that can render 24 kHz mono f32 samples.
///
/// `write` completes only when the sink has accepted every sample, which
/// is the natural pacing for the consumer thread.
pub trait OutputSink: Send {
    fn write(&mut self, samples: &[f32]) -> Result<()>;
}

/// Discards everything; used when no output device exists.
pub struct NullSink;

impl OutputSink for NullSink {
    fn write(&mut self, _samples: &[f32]) -> Result<()> {
        Ok(())
    }
}

/// cpal-backed output: a lock-free ring feeds the device callback, and
/// `write` blocks (in 1 ms naps) while the ring is full.
pub struct CpalSink {
    producer: ringbuf::HeapProd<f32>,
    _stream: cpal::Stream,
    resampler: StreamResampler,
}

// cpal::Stream is !Send purely because of a cross-platform marker
// (`NotSendSyncAcrossAllPlatforms`) cpal adds unconditionally; on the ALSA
// backend the underlying stream has no thread affinity. `CpalSink` is built
// on one thread and then handed, whole, to the single playback consumer
// thread that owns it for the rest of its life, so no cross-thread aliasing
// of the stream ever occurs.
unsafe impl Send for CpalSink {}

impl CpalSink {
    /// Open the default output device.
    pub fn open() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| EngineError::Device("no output device available".into()))?;
        let config = device
            .default_output_config()
            .map_err(|e| EngineError::Device(format!("no output config: {e}")))?;
        let device_rate = config.sample_rate().0;
        let channels = config.channels() as usize;
        info!(
            "Output device: {:?} ({} Hz)",
            device.name().unwrap_or_else(|_| "unknown".into()),
            device_rate
        );

        // Half a second of device-rate audio between consumer and callback
        let ring = HeapRb::<f32>::new(device_rate as usize / 2);
        let (producer, mut consumer) = ring.split();
        let underruns = AtomicU64::new(0);

        let stream = device
            .build_output_stream(
                &config.into(),
                move |data: &mut [f32], _| {
                    for frame in data.chunks_mut(channels) {
                        let sample = consumer.try_pop().unwrap_or_else(|| {
                            let count = underruns.fetch_add(1, Ordering::Relaxed) + 1;
                            if count % 48_000 == 0 {
                                warn!("Output ring underrun (total: {})", count);
                            }
                            0.0
                        });
                        for slot in frame.iter_mut() {
                            *slot = sample;
                        }
                    }
                },
                |e| warn!("Output stream error: {}", e),
                None,
            )
            .map_err(|e| EngineError::Device(format!("build output stream: {e}")))?;
        stream
            .play()
            .map_err(|e| EngineError::Device(format!("start output stream: {e}")))?;

        Ok(Self {
            producer,
            _stream: stream,
            resampler: StreamResampler::new(
                tolk_common::config::PIPELINE_SAMPLE_RATE,
                device_rate,
            )?,
        })
    }
}

impl OutputSink for CpalSink {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        let device_samples = self.resampler.push(samples)?;
        let mut offset = 0;
        while offset < device_samples.len() {
            offset += self.producer.push_slice(&device_samples[offset..]);
            if offset < device_samples.len() {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
        Ok(())
    }
}

enum Command {
    Chunk(PlaybackChunk),
    /// Drop every queued chunk bound to this response; chunks already at
    /// the sink continue to completion.
    ClearResponse(String),
    Shutdown,
}

/// Cloneable handle to the playback consumer.
#[derive(Clone)]
pub struct PlaybackHandle {
    tx: mpsc::Sender<Command>,
    rendered: Arc<AtomicU64>,
    discarded: Arc<AtomicU64>,
}

impl PlaybackHandle {
    /// Queue a chunk for rendering (or draining, when playback is off).
    pub fn enqueue(&self, chunk: PlaybackChunk) {
        let _ = self.tx.send(Command::Chunk(chunk));
    }

    /// Drop queued chunks belonging to a cancelled response.
    pub fn clear_for_response(&self, response_id: &str) {
        let _ = self.tx.send(Command::ClearResponse(response_id.to_string()));
    }

    /// Chunks actually rendered to the sink
    pub fn rendered(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }

    /// Chunks drained without rendering (playback disabled or cleared)
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

/// Running playback consumer; `stop` renders what is queued and joins.
pub struct PlaybackQueue {
    handle: PlaybackHandle,
    join: Option<std::thread::JoinHandle<()>>,
}

impl PlaybackQueue {
    /// Spawn the consumer thread.
    ///
    /// `reference` receives exactly what was rendered (post-volume) so
    /// the echo canceller sees the true far-end signal. Pass `enabled =
    /// false` to drain without rendering.
    pub fn spawn(
        mut sink: Box<dyn OutputSink>,
        mut reference: Option<ReferenceProducer>,
        volume: f32,
        enabled: bool,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Command>();
        let rendered = Arc::new(AtomicU64::new(0));
        let discarded = Arc::new(AtomicU64::new(0));
        let rendered_in_thread = Arc::clone(&rendered);
        let discarded_in_thread = Arc::clone(&discarded);

        let join = std::thread::Builder::new()
            .name("tolk-playback".into())
            .spawn(move || {
                let mut queue: VecDeque<PlaybackChunk> = VecDeque::new();
                let mut shutting_down = false;
                loop {
                    // Block for work only when the local queue is dry
                    if queue.is_empty() {
                        if shutting_down {
                            break;
                        }
                        match rx.recv() {
                            Ok(command) => {
                                shutting_down |=
                                    handle_command(command, &mut queue, &discarded_in_thread);
                            }
                            Err(_) => break,
                        }
                    }
                    // Absorb whatever else is waiting before rendering
                    while let Ok(command) = rx.try_recv() {
                        shutting_down |= handle_command(command, &mut queue, &discarded_in_thread);
                    }

                    let Some(chunk) = queue.pop_front() else {
                        continue;
                    };
                    if !enabled {
                        discarded_in_thread.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    let mut samples = pcm16_to_f32(&chunk.pcm);
                    for s in &mut samples {
                        *s = (*s * volume).clamp(-1.0, 1.0);
                    }
                    if let Err(e) = sink.write(&samples) {
                        warn!("Playback sink write failed: {}", e);
                        discarded_in_thread.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    if let Some(reference) = reference.as_mut() {
                        reference.push_slice(&samples);
                    }
                    rendered_in_thread.fetch_add(1, Ordering::Relaxed);
                }
                debug!("Playback consumer exiting");
            })
            .map_err(|e| EngineError::Device(format!("playback thread: {e}")))?;

        Ok(Self {
            handle: PlaybackHandle {
                tx,
                rendered,
                discarded,
            },
            join: Some(join),
        })
    }

    pub fn handle(&self) -> PlaybackHandle {
        self.handle.clone()
    }

    /// Stop after rendering everything already queued.
    pub fn stop(mut self) {
        let _ = self.handle.tx.send(Command::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Returns true when the consumer should exit.
fn handle_command(
    command: Command,
    queue: &mut VecDeque<PlaybackChunk>,
    discarded: &Arc<AtomicU64>,
) -> bool {
    match command {
        Command::Chunk(chunk) => {
            queue.push_back(chunk);
            false
        }
        Command::ClearResponse(response_id) => {
            let before = queue.len();
            queue.retain(|c| c.response_id != response_id);
            let dropped = (before - queue.len()) as u64;
            if dropped > 0 {
                debug!("Cleared {} queued chunk(s) for response {}", dropped, response_id);
                discarded.fetch_add(dropped, Ordering::Relaxed);
            }
            false
        }
        Command::Shutdown => true,
    }
}
