//! Session engine
//!
//! Owns the session lifetime: wires capture, conditioning, detection,
//! segmentation, the dual processing paths, the scheduler and playback
//! together with bounded channels, then emits per-segment result
//! envelopes to the event bus in segment-id order.
//!
//! **Architecture:** every long-running component is its own task; the
//! engine holds only immutable config, the cancellation token, and the
//! event bus. Mutable state lives with the task that owns it.

use crate::audio::capture::FrameSource;
use crate::audio::reference::{ReferenceConsumer, ReferenceRing};
use crate::audio::resampler::StreamResampler;
use crate::audio::types::AudioFrame;
use crate::dsp::aec::AecParams;
use crate::dsp::chain::Conditioner;
use crate::error::Result;
use crate::link::protocol::{
    ClientEvent, ServerEvent, SessionParams, TranscriptionConfig, TurnDetection,
};
use crate::link::{LinkHandle, LinkRoutes};
use crate::paths::text::TRANSCRIPT_TIMEOUT;
use crate::paths::voice::VoicePathConfig;
use crate::playback::{OutputSink, PlaybackChunk, PlaybackHandle, PlaybackQueue};
use crate::queue::{self, CompletedSegment, EnqueueOutcome, SegmentQueueHandle};
use crate::scheduler::{self, SchedulerConfig};
use crate::segment::Segmenter;
use crate::vad::{VadConfig, VadEvent, VoiceDetector, VAD_FRAME_SAMPLES};
use base64::Engine as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tolk_common::config::{SessionConfig, PIPELINE_SAMPLE_RATE};
use tolk_common::events::{
    EventBus, InterpreterEvent, SegmentEnvelope, SessionEndCategory,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capture channel depth in frames (~170 ms at 48 kHz)
const CAPTURE_DEPTH: usize = 64;

/// Cumulative counters for one session, filled by the pipeline tasks and
/// reported once in the session-end log line.
#[derive(Debug, Default)]
struct SessionStats {
    frames_captured: AtomicU64,
    segments_detected: AtomicU64,
    /// Utterances under the preset minimum length
    segments_dropped_short: AtomicU64,
    /// Segments lost to a full segment queue (evictions included)
    segments_dropped_full: AtomicU64,
    responses_completed: AtomicU64,
    retries: AtomicU64,
    soft_conflicts: AtomicU64,
}

/// Top-level coordinator for one interpretation session.
pub struct InterpreterEngine {
    config: Arc<SessionConfig>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
}

impl InterpreterEngine {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config: Arc::new(config),
            events: Arc::new(EventBus::new(256)),
            cancel: CancellationToken::new(),
        }
    }

    /// The bus the UI adapter subscribes to.
    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    /// Session configuration snapshot.
    pub fn config(&self) -> Arc<SessionConfig> {
        Arc::clone(&self.config)
    }

    /// Request a cooperative session stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run a session over the given capture source, link and output
    /// sink. Returns when the session ends, reporting why.
    pub async fn run(
        &self,
        source: Box<dyn FrameSource>,
        link: LinkHandle,
        routes: LinkRoutes,
        sink: Box<dyn OutputSink>,
    ) -> Result<SessionEndCategory> {
        let config = Arc::clone(&self.config);
        let session_id = Uuid::new_v4();
        info!(
            "Session {} starting (preset {:?}, target {})",
            session_id, config.preset, config.target_lang
        );
        self.events.emit_lossy(InterpreterEvent::SessionStarted {
            session_id,
            timestamp: chrono::Utc::now(),
        });

        // Initial session configuration for the remote peer
        let turn_detection = if config.preset.client_vad_enabled() {
            None
        } else {
            Some(TurnDetection::server_vad())
        };
        link.send(ClientEvent::SessionUpdate {
            session: SessionParams {
                input_audio_format: "pcm16".to_string(),
                modalities: config.modalities(),
                instructions: config.instructions.clone(),
                turn_detection,
                input_audio_transcription: TranscriptionConfig {
                    model: config.chat_model.clone(),
                },
            },
        })
        .await?;

        // Reference tap: playback writes what it renders, the conditioner
        // reads it as the canceller's far-end signal.
        let (ref_producer, ref_consumer) = ReferenceRing::new(None).split();

        let playback = PlaybackQueue::spawn(
            sink,
            Some(ref_producer),
            config.output_volume,
            config.playback_enabled,
        )?;
        let playback_handle = playback.handle();

        let capture_rate = source.sample_rate();
        let (capture_tx, capture_rx) = mpsc::channel::<AudioFrame>(CAPTURE_DEPTH);
        let capture = source.start(capture_tx)?;
        let stats = Arc::new(SessionStats::default());

        let category = if config.preset.client_vad_enabled() {
            self.run_client_vad(
                capture_rate,
                capture_rx,
                ref_consumer,
                link.clone(),
                routes,
                playback_handle.clone(),
                Arc::clone(&stats),
            )
            .await
        } else {
            self.run_server_vad(
                capture_rate,
                capture_rx,
                ref_consumer,
                link.clone(),
                routes,
                playback_handle.clone(),
                Arc::clone(&stats),
            )
            .await
        };

        // Teardown: capture first, playback after the queues are gone.
        let dropped = capture.dropped_frames();
        capture.stop();
        playback.stop();
        info!(
            "Session {} ended ({:?}): {} frame(s) captured ({} dropped), \
             {} segment(s) detected ({} dropped short, {} dropped at full queue), \
             {} response(s) completed ({} retries, {} soft conflicts), \
             {} chunk(s) rendered, {} discarded",
            session_id,
            category,
            stats.frames_captured.load(Ordering::Relaxed),
            dropped,
            stats.segments_detected.load(Ordering::Relaxed),
            stats.segments_dropped_short.load(Ordering::Relaxed),
            stats.segments_dropped_full.load(Ordering::Relaxed),
            stats.responses_completed.load(Ordering::Relaxed),
            stats.retries.load(Ordering::Relaxed),
            stats.soft_conflicts.load(Ordering::Relaxed),
            playback_handle.rendered(),
            playback_handle.discarded()
        );
        self.events.emit_lossy(InterpreterEvent::SessionEnded {
            session_id,
            category,
            timestamp: chrono::Utc::now(),
        });
        Ok(category)
    }

    /// Client-side segmentation: VAD → segment queue → dual paths.
    #[allow(clippy::too_many_arguments)]
    async fn run_client_vad(
        &self,
        capture_rate: u32,
        capture_rx: mpsc::Receiver<AudioFrame>,
        ref_consumer: ReferenceConsumer,
        link: LinkHandle,
        routes: LinkRoutes,
        playback: PlaybackHandle,
        stats: Arc<SessionStats>,
    ) -> SessionEndCategory {
        let config = Arc::clone(&self.config);
        let cancel = self.cancel.clone();

        let (queue_handle, mut released_rx) = queue::spawn(queue::DEFAULT_CAPACITY);
        let sched = scheduler::spawn(link.clone(), routes.responses, SchedulerConfig::default());

        let text_worker = tokio::spawn(crate::paths::run_text_path(
            queue_handle.clone(),
            link.clone(),
            routes.transcripts,
            TRANSCRIPT_TIMEOUT,
            cancel.clone(),
        ));
        let voice_worker = tokio::spawn(crate::paths::run_voice_path(
            queue_handle.clone(),
            sched.clone(),
            routes.deltas,
            playback,
            VoicePathConfig {
                modalities: config.modalities(),
                instructions: config.instructions.clone(),
                playback_enabled: config.playback_enabled,
            },
            cancel.clone(),
        ));

        let pipeline = tokio::spawn(run_pipeline(
            Arc::clone(&config),
            capture_rate,
            capture_rx,
            ref_consumer,
            queue_handle.clone(),
            Arc::clone(&self.events),
            Arc::clone(&stats),
            cancel.clone(),
        ));

        // Emit envelopes in id order until the session ends
        let link_closed = link.closed();
        let category = loop {
            tokio::select! {
                completed = released_rx.recv() => match completed {
                    Some(done) => self.emit_envelope(done),
                    None => break SessionEndCategory::Stopped,
                },
                _ = link_closed.cancelled() => {
                    warn!("Remote link closed; ending session");
                    break SessionEndCategory::Link;
                }
                _ = cancel.cancelled() => break SessionEndCategory::Stopped,
            }
        };

        // Cooperative cancel: every task aborts at its next await
        cancel.cancel();
        sched.clear().await;
        queue_handle.clear().await;

        let sched_stats = sched.stats();
        stats
            .responses_completed
            .fetch_add(sched_stats.completed, Ordering::Relaxed);
        stats.retries.fetch_add(sched_stats.retries, Ordering::Relaxed);
        stats
            .soft_conflicts
            .fetch_add(sched_stats.soft_conflicts, Ordering::Relaxed);

        // Drain any envelopes that completed during teardown
        while let Ok(done) = released_rx.try_recv() {
            self.emit_envelope(done);
        }

        let _ = pipeline.await;
        let _ = text_worker.await;
        let _ = voice_worker.await;
        category
    }

    /// Server-side segmentation: the client streams conditioned audio
    /// continuously; utterance boundaries and responses are driven by
    /// the remote peer's turn detection. Each completed transcript and
    /// its following response form one synthesized envelope.
    #[allow(clippy::too_many_arguments)]
    async fn run_server_vad(
        &self,
        capture_rate: u32,
        mut capture_rx: mpsc::Receiver<AudioFrame>,
        mut ref_consumer: ReferenceConsumer,
        link: LinkHandle,
        mut routes: LinkRoutes,
        playback: PlaybackHandle,
        stats: Arc<SessionStats>,
    ) -> SessionEndCategory {
        let config = Arc::clone(&self.config);
        let cancel = self.cancel.clone();
        let link_closed = link.closed();

        let mut resampler = match StreamResampler::new(capture_rate, PIPELINE_SAMPLE_RATE) {
            Ok(rs) => rs,
            Err(e) => {
                warn!("Resampler init failed: {}", e);
                return SessionEndCategory::Device;
            }
        };
        let mut chain = Conditioner::new(PIPELINE_SAMPLE_RATE as f32, aec_params(&config));
        let mut upload_buffer: Vec<f32> = Vec::with_capacity(crate::paths::text::UPLOAD_CHUNK_SAMPLES);
        let mut reference_block = vec![0.0f32; VAD_FRAME_SAMPLES];

        // Turn assembly state
        let mut next_id: u64 = 1;
        let mut source_text: Option<String> = None;
        let mut translated = String::new();
        let mut chunk_count: u32 = 0;

        loop {
            tokio::select! {
                frame = capture_rx.recv() => {
                    let Some(frame) = frame else { break SessionEndCategory::Device };
                    stats.frames_captured.fetch_add(1, Ordering::Relaxed);
                    let resampled = match resampler.push(&frame.samples) {
                        Ok(samples) => samples,
                        Err(e) => {
                            warn!("Resampling failed: {}", e);
                            break SessionEndCategory::Device;
                        }
                    };
                    let mut offset = 0;
                    while offset < resampled.len() {
                        let n = (resampled.len() - offset).min(VAD_FRAME_SAMPLES);
                        let mut block = resampled[offset..offset + n].to_vec();
                        reference_block.resize(n, 0.0);
                        ref_consumer.pop_slice(&mut reference_block[..n]);
                        chain.process_frame(&mut block, &reference_block[..n]);
                        upload_buffer.extend_from_slice(&block);
                        offset += n;
                    }
                    while upload_buffer.len() >= crate::paths::text::UPLOAD_CHUNK_SAMPLES {
                        let chunk: Vec<f32> = upload_buffer
                            .drain(..crate::paths::text::UPLOAD_CHUNK_SAMPLES)
                            .collect();
                        let audio = base64::engine::general_purpose::STANDARD
                            .encode(crate::audio::types::pcm16_from_f32(&chunk));
                        if link.send(ClientEvent::InputAudioAppend { audio }).await.is_err() {
                            break;
                        }
                    }
                }
                event = routes.transcripts.recv() => match event {
                    Some(ServerEvent::TranscriptionCompleted { transcript }) => {
                        source_text = Some(transcript);
                    }
                    Some(_) => {}
                    None => break SessionEndCategory::Link,
                },
                event = routes.deltas.recv() => match event {
                    Some(ServerEvent::AudioTranscriptDelta { delta, .. }) => {
                        translated.push_str(&delta);
                    }
                    Some(ServerEvent::AudioTranscriptDone { transcript, .. }) => {
                        if let Some(full) = transcript {
                            translated = full;
                        }
                    }
                    Some(ServerEvent::AudioDelta { response_id, delta }) => {
                        if let Ok(pcm) =
                            base64::engine::general_purpose::STANDARD.decode(delta.as_bytes())
                        {
                            if !pcm.is_empty() {
                                playback.enqueue(PlaybackChunk {
                                    response_id: response_id.unwrap_or_default(),
                                    sequence: chunk_count,
                                    pcm,
                                });
                                chunk_count += 1;
                            }
                        }
                    }
                    Some(_) => {}
                    None => break SessionEndCategory::Link,
                },
                event = routes.responses.recv() => match event {
                    Some(ServerEvent::ResponseDone { .. }) => {
                        // One server-driven turn is complete
                        stats.segments_detected.fetch_add(1, Ordering::Relaxed);
                        stats.responses_completed.fetch_add(1, Ordering::Relaxed);
                        let id = next_id;
                        next_id += 1;
                        let source = source_text.take();
                        let text = std::mem::take(&mut translated);
                        let chunks = std::mem::replace(&mut chunk_count, 0);
                        self.events.emit_lossy(InterpreterEvent::SegmentCompleted {
                            envelope: SegmentEnvelope {
                                id,
                                source_lang: source
                                    .as_deref()
                                    .map(|t| tolk_common::detect_language(t).to_string()),
                                source_text: source,
                                translated_text: (!text.is_empty()).then_some(text),
                                translated_audio_played: config.playback_enabled && chunks > 0,
                                error: None,
                            },
                            timestamp: chrono::Utc::now(),
                        });
                    }
                    Some(event @ ServerEvent::Error { .. }) => {
                        if event.is_active_response_conflict() {
                            stats.soft_conflicts.fetch_add(1, Ordering::Relaxed);
                        }
                        if let ServerEvent::Error { code, message } = &event {
                            warn!("Remote error (code {:?}): {}", code, message);
                        }
                    }
                    Some(_) => {}
                    None => break SessionEndCategory::Link,
                },
                _ = link_closed.cancelled() => break SessionEndCategory::Link,
                _ = cancel.cancelled() => break SessionEndCategory::Stopped,
            }
        }
    }

    fn emit_envelope(&self, done: CompletedSegment) {
        let error = match (&done.text, &done.voice) {
            (Err(e), _) => Some(e.reason().to_string()),
            (_, Err(e)) => Some(e.reason().to_string()),
            _ => None,
        };
        let (source_text, source_lang) = match done.text {
            Ok(outcome) => (Some(outcome.transcript), Some(outcome.language)),
            Err(_) => (None, None),
        };
        let (translated_text, audio_played) = match done.voice {
            Ok(outcome) => (Some(outcome.translated_text), outcome.audio_played),
            Err(_) => (None, false),
        };
        self.events.emit_lossy(InterpreterEvent::SegmentCompleted {
            envelope: SegmentEnvelope {
                id: done.id,
                source_lang,
                source_text,
                translated_text,
                translated_audio_played: audio_played,
                error,
            },
            timestamp: chrono::Utc::now(),
        });
    }
}

fn aec_params(config: &SessionConfig) -> AecParams {
    AecParams {
        filter_len: config.aec_filter_len,
        step_size: config.aec_step_size,
        // 100 ms of path delay and a 100 ms re-estimation cadence at the
        // 24 kHz pipeline rate
        max_delay: PIPELINE_SAMPLE_RATE as usize / 10,
        initial_delay: 240,
        delay_refresh_interval: PIPELINE_SAMPLE_RATE as usize / 10,
        ..AecParams::default()
    }
}

/// Conditioner + VAD + segmenter task for client-side segmentation.
#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    config: Arc<SessionConfig>,
    capture_rate: u32,
    mut capture_rx: mpsc::Receiver<AudioFrame>,
    mut ref_consumer: ReferenceConsumer,
    queue: SegmentQueueHandle,
    events: Arc<EventBus>,
    stats: Arc<SessionStats>,
    cancel: CancellationToken,
) {
    let mut resampler = match StreamResampler::new(capture_rate, PIPELINE_SAMPLE_RATE) {
        Ok(rs) => rs,
        Err(e) => {
            warn!("Resampler init failed: {}", e);
            return;
        }
    };
    let mut chain = Conditioner::new(PIPELINE_SAMPLE_RATE as f32, aec_params(&config));
    let mut vad = VoiceDetector::new(VadConfig::from_preset(
        config.preset,
        config.vad_sensitivity,
        PIPELINE_SAMPLE_RATE,
    ));
    let mut segmenter = Segmenter::new(config.preset);

    let mut pending: Vec<f32> = Vec::with_capacity(VAD_FRAME_SAMPLES * 4);
    let mut block = [0.0f32; VAD_FRAME_SAMPLES];
    let mut reference = [0.0f32; VAD_FRAME_SAMPLES];
    let mut clock_samples: u64 = 0;

    loop {
        let frame = tokio::select! {
            frame = capture_rx.recv() => frame,
            _ = cancel.cancelled() => break,
        };
        let Some(frame) = frame else { break };
        stats.frames_captured.fetch_add(1, Ordering::Relaxed);

        let resampled = match resampler.push(&frame.samples) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Resampling failed: {}", e);
                break;
            }
        };
        pending.extend_from_slice(&resampled);

        while pending.len() >= VAD_FRAME_SAMPLES {
            block.copy_from_slice(&pending[..VAD_FRAME_SAMPLES]);
            pending.drain(..VAD_FRAME_SAMPLES);

            ref_consumer.pop_slice(&mut reference);
            chain.process_frame(&mut block, &reference);

            clock_samples += VAD_FRAME_SAMPLES as u64;
            let ts_ns = clock_samples * 1_000_000_000 / PIPELINE_SAMPLE_RATE as u64;

            match vad.process_frame(&block, ts_ns) {
                Some(VadEvent::SpeechStart { confidence, .. }) => {
                    debug!("Speech start (confidence {:.2})", confidence);
                    segmenter.on_speech_start(ts_ns);
                    segmenter.push_samples(&block);
                }
                Some(VadEvent::SpeechEnd { .. }) => {
                    segmenter.push_samples(&block);
                    if let Some(segment) = segmenter.on_speech_end(ts_ns) {
                        enqueue_segment(&queue, &events, &stats, segment).await;
                    }
                }
                None => segmenter.push_samples(&block),
            }
        }
    }

    // Session stop while speaking: flush the open utterance
    let ts_ns = clock_samples * 1_000_000_000 / PIPELINE_SAMPLE_RATE as u64;
    if vad.flush(ts_ns).is_some() {
        if let Some(segment) = segmenter.flush(ts_ns) {
            enqueue_segment(&queue, &events, &stats, segment).await;
        }
    }
    stats
        .segments_dropped_short
        .fetch_add(segmenter.dropped_short(), Ordering::Relaxed);
    debug!("Pipeline task exiting");
}

async fn enqueue_segment(
    queue: &SegmentQueueHandle,
    events: &EventBus,
    stats: &SessionStats,
    segment: crate::segment::Segment,
) {
    let duration_ms = segment.duration_ms();
    let id = segment.id;
    let segment = Arc::new(segment);

    let mut outcome = queue.enqueue(Arc::clone(&segment)).await;
    if outcome == EnqueueOutcome::Full {
        // Prefer losing the oldest unstarted utterance over the newest
        if queue.drop_oldest_unstarted().await.is_some() {
            stats.segments_dropped_full.fetch_add(1, Ordering::Relaxed);
            outcome = queue.enqueue(segment).await;
        }
    }
    match outcome {
        EnqueueOutcome::Ok => {
            stats.segments_detected.fetch_add(1, Ordering::Relaxed);
            events.emit_lossy(InterpreterEvent::SegmentDetected {
                segment_id: id,
                duration_ms,
                timestamp: chrono::Utc::now(),
            });
        }
        EnqueueOutcome::Full => {
            stats.segments_dropped_full.fetch_add(1, Ordering::Relaxed);
            warn!("Segment queue full; segment {} dropped", id);
        }
    }
}
