//! Utterance segmentation
//!
//! The segmenter sits behind the detector: it keeps a rolling pre-roll of
//! conditioned 24 kHz PCM16 so the first phonemes of an utterance are not
//! clipped, accumulates samples while speech is active, and finalizes a
//! [`Segment`] on speech-end when the utterance clears the preset's
//! minimum length. Segment ids are strictly increasing.

use std::collections::VecDeque;
use tolk_common::config::{AudioPreset, PIPELINE_SAMPLE_RATE};
use tracing::{debug, warn};

/// One detected utterance, owning its resampled PCM16 audio.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Strictly increasing id, assigned at finalization
    pub id: u64,
    /// Capture-clock timestamp of speech start (nanoseconds)
    pub start_ns: u64,
    /// Capture-clock timestamp of speech end (nanoseconds)
    pub end_ns: u64,
    /// 24 kHz mono PCM16 utterance audio
    pub samples: Vec<i16>,
    /// Source language; unknown until a transcript is analyzed
    pub source_lang: Option<String>,
}

impl Segment {
    /// Utterance length derived from the sample count
    pub fn duration_ms(&self) -> u64 {
        self.samples.len() as u64 * 1000 / PIPELINE_SAMPLE_RATE as u64
    }
}

/// Accumulates conditioned samples into segments between detector events.
pub struct Segmenter {
    /// Rolling context kept while silent, prepended on speech start
    pre_roll: VecDeque<i16>,
    pre_roll_cap: usize,
    /// Active utterance: start timestamp + samples so far
    current: Option<(u64, Vec<i16>)>,
    next_id: u64,
    min_speech_ms: u32,
    /// Utterances dropped for being shorter than the preset minimum
    dropped_short: u64,
}

impl Segmenter {
    pub fn new(preset: AudioPreset) -> Self {
        Self {
            pre_roll: VecDeque::with_capacity(preset.buffer_samples()),
            pre_roll_cap: preset.buffer_samples(),
            current: None,
            next_id: 1,
            min_speech_ms: preset.min_speech_ms(),
            dropped_short: 0,
        }
    }

    /// Feed conditioned 24 kHz samples (f32, converted to PCM16 here).
    pub fn push_samples(&mut self, samples: &[f32]) {
        match self.current.as_mut() {
            Some((_, buffer)) => {
                buffer.extend(samples.iter().map(|&s| to_pcm16(s)));
            }
            None => {
                for &s in samples {
                    if self.pre_roll.len() == self.pre_roll_cap {
                        self.pre_roll.pop_front();
                    }
                    self.pre_roll.push_back(to_pcm16(s));
                }
            }
        }
    }

    /// Detector reported voice onset: open an utterance seeded with the
    /// pre-roll context.
    pub fn on_speech_start(&mut self, timestamp_ns: u64) {
        if self.current.is_some() {
            warn!("Speech start while an utterance is open; ignoring");
            return;
        }
        let seed: Vec<i16> = self.pre_roll.drain(..).collect();
        self.current = Some((timestamp_ns, seed));
    }

    /// Detector confirmed end of speech: finalize if long enough.
    pub fn on_speech_end(&mut self, timestamp_ns: u64) -> Option<Segment> {
        let (start_ns, samples) = self.current.take()?;
        let duration_ms = samples.len() as u64 * 1000 / PIPELINE_SAMPLE_RATE as u64;
        if duration_ms < self.min_speech_ms as u64 {
            self.dropped_short += 1;
            debug!(
                "Dropping short utterance ({} ms < {} ms, total dropped: {})",
                duration_ms, self.min_speech_ms, self.dropped_short
            );
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        debug!("Segment {} finalized: {} ms", id, duration_ms);
        Some(Segment {
            id,
            start_ns,
            end_ns: timestamp_ns.max(start_ns + 1),
            samples,
            source_lang: None,
        })
    }

    /// Session stop: close any open utterance regardless of hangover state.
    pub fn flush(&mut self, timestamp_ns: u64) -> Option<Segment> {
        if self.current.is_some() {
            self.on_speech_end(timestamp_ns)
        } else {
            None
        }
    }

    /// Whether an utterance is currently open
    pub fn in_utterance(&self) -> bool {
        self.current.is_some()
    }

    /// Utterances dropped for falling under the minimum length
    pub fn dropped_short(&self) -> u64 {
        self.dropped_short
    }
}

#[inline]
fn to_pcm16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples_for_ms(ms: u64) -> Vec<f32> {
        vec![0.25; (ms * PIPELINE_SAMPLE_RATE as u64 / 1000) as usize]
    }

    #[test]
    fn test_segment_lifecycle() {
        let mut seg = Segmenter::new(AudioPreset::Balanced);
        assert!(!seg.in_utterance());

        seg.on_speech_start(1_000);
        assert!(seg.in_utterance());
        seg.push_samples(&samples_for_ms(800));

        let segment = seg.on_speech_end(900_000_000).expect("long enough");
        assert_eq!(segment.id, 1);
        assert_eq!(segment.start_ns, 1_000);
        assert!(segment.end_ns > segment.start_ns);
        assert!(segment.duration_ms() >= 800);
        assert!(segment.source_lang.is_none());
    }

    #[test]
    fn test_short_utterance_dropped() {
        let mut seg = Segmenter::new(AudioPreset::Balanced);
        seg.on_speech_start(0);
        seg.push_samples(&samples_for_ms(100)); // under the 500 ms minimum
        assert!(seg.on_speech_end(1).is_none());
        assert_eq!(seg.dropped_short(), 1);

        // Ids are not consumed by dropped utterances
        seg.on_speech_start(10);
        seg.push_samples(&samples_for_ms(600));
        assert_eq!(seg.on_speech_end(20).unwrap().id, 1);
    }

    #[test]
    fn test_ids_strictly_increasing() {
        let mut seg = Segmenter::new(AudioPreset::LowLatency);
        let mut last_id = 0;
        for i in 0..5 {
            seg.on_speech_start(i * 100);
            seg.push_samples(&samples_for_ms(500));
            let segment = seg.on_speech_end(i * 100 + 50).unwrap();
            assert!(segment.id > last_id);
            last_id = segment.id;
        }
    }

    #[test]
    fn test_pre_roll_included() {
        let mut seg = Segmenter::new(AudioPreset::Balanced);
        // Context before speech starts
        seg.push_samples(&[0.5; 1000]);
        seg.on_speech_start(0);
        seg.push_samples(&samples_for_ms(600));
        let segment = seg.on_speech_end(1).unwrap();

        let expected = 1000 + samples_for_ms(600).len();
        assert_eq!(segment.samples.len(), expected);
        // Pre-roll samples lead the utterance
        assert_eq!(segment.samples[0], to_pcm16(0.5));
    }

    #[test]
    fn test_pre_roll_bounded() {
        let preset = AudioPreset::LowLatency;
        let mut seg = Segmenter::new(preset);
        seg.push_samples(&vec![0.1; preset.buffer_samples() * 3]);
        seg.on_speech_start(0);
        seg.push_samples(&samples_for_ms(500));
        let segment = seg.on_speech_end(1).unwrap();
        assert!(segment.samples.len() <= preset.buffer_samples() + samples_for_ms(500).len());
    }

    #[test]
    fn test_flush_open_utterance() {
        let mut seg = Segmenter::new(AudioPreset::LowLatency);
        seg.on_speech_start(0);
        seg.push_samples(&samples_for_ms(450));
        let segment = seg.flush(42).expect("flush returns the open segment");
        assert_eq!(segment.id, 1);
        assert!(seg.flush(43).is_none());
    }
}
