//! Adaptive voice activity detection
//!
//! Energy + zero-crossing-rate classifier with a self-calibrating noise
//! floor. For the first K frames the detector only collects energy
//! statistics; it then sets its threshold from the measured noise floor
//! (mean + 3 sigma, clamped to a configured floor) and starts emitting
//! events.
//!
//! End-of-speech is two-stage: a hangover window bridges short
//! intra-speech silences, then a debounce window confirms the utterance
//! really ended. Voice returning during either window cancels the
//! pending end without emitting anything.

use tolk_common::config::{AudioPreset, VadSensitivity};
use tracing::{debug, info};

/// Analysis frame length in samples (at the 24 kHz pipeline rate)
pub const VAD_FRAME_SAMPLES: usize = 128;

/// Events emitted by the detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VadEvent {
    /// Voice onset
    SpeechStart {
        timestamp_ns: u64,
        /// 0.0–1.0, blended energy and zcr confidence
        confidence: f32,
    },
    /// Utterance end, confirmed after hangover + debounce
    SpeechEnd { timestamp_ns: u64 },
}

/// Detector tunables derived from the session preset
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Frames of energy statistics collected before any event
    pub calibration_frames: usize,
    /// Lower bound on the adaptive threshold
    pub threshold_floor: f32,
    /// Hangover duration in ms
    pub hangover_ms: u32,
    /// Debounce duration in ms
    pub debounce_ms: u32,
    /// Threshold multiplier from the sensitivity setting
    pub sensitivity_scale: f32,
    /// Pipeline sample rate the frame clock is derived from
    pub sample_rate: u32,
}

impl VadConfig {
    /// Build from the session preset and sensitivity.
    pub fn from_preset(preset: AudioPreset, sensitivity: VadSensitivity, sample_rate: u32) -> Self {
        Self {
            calibration_frames: 30,
            threshold_floor: 0.01,
            hangover_ms: 200,
            debounce_ms: preset.debounce_ms(),
            sensitivity_scale: sensitivity.threshold_scale(),
            sample_rate,
        }
    }

    fn ms_to_frames(&self, ms: u32) -> u32 {
        let frame_ms = VAD_FRAME_SAMPLES as f64 * 1000.0 / self.sample_rate as f64;
        (ms as f64 / frame_ms).ceil() as u32
    }
}

/// Silent ↔ Speaking with the two confirmation windows in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectorState {
    Silent,
    Speaking,
    /// Voice lost; waiting out the hangover window
    Hangover { frames_left: u32 },
    /// Hangover expired; waiting out the debounce window
    Debounce { frames_left: u32 },
}

/// Energy statistics gathered during calibration
#[derive(Debug, Default)]
struct Calibration {
    samples: Vec<f32>,
}

impl Calibration {
    fn threshold(&self, floor: f32) -> f32 {
        let n = self.samples.len() as f32;
        let mean = self.samples.iter().sum::<f32>() / n;
        let variance = self
            .samples
            .iter()
            .map(|e| (e - mean).powi(2))
            .sum::<f32>()
            / n;
        (mean + 3.0 * variance.sqrt()).max(floor)
    }
}

/// Adaptive voice activity detector
pub struct VoiceDetector {
    config: VadConfig,
    state: DetectorState,
    calibration: Option<Calibration>,
    /// Adaptive threshold θ, valid once calibrated
    threshold: f32,
    /// Last 20 frame energies for the moving average
    energy_window: [f32; 20],
    energy_pos: usize,
    energy_filled: usize,
    /// zcr of the most recent frame
    last_zcr: f32,
    hangover_frames: u32,
    debounce_frames: u32,
}

impl VoiceDetector {
    pub fn new(config: VadConfig) -> Self {
        let hangover_frames = config.ms_to_frames(config.hangover_ms);
        let debounce_frames = config.ms_to_frames(config.debounce_ms);
        debug!(
            "VAD: calibration={} frames, hangover={} frames, debounce={} frames",
            config.calibration_frames, hangover_frames, debounce_frames
        );
        Self {
            state: DetectorState::Silent,
            calibration: Some(Calibration::default()),
            threshold: config.threshold_floor,
            energy_window: [0.0; 20],
            energy_pos: 0,
            energy_filled: 0,
            last_zcr: 0.0,
            hangover_frames,
            debounce_frames,
            config,
        }
    }

    /// Whether the calibration window has completed
    pub fn is_calibrated(&self) -> bool {
        self.calibration.is_none()
    }

    /// The adaptive threshold θ (meaningful once calibrated)
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Whether the detector currently considers speech active (including
    /// the hangover/debounce confirmation windows)
    pub fn in_speech(&self) -> bool {
        !matches!(self.state, DetectorState::Silent)
    }

    /// Blended confidence of the current decision
    pub fn confidence(&self) -> f32 {
        let energy_part = (self.smoothed_energy() / (2.0 * self.threshold)).clamp(0.0, 1.0);
        let zcr_part = (self.last_zcr / 0.3).clamp(0.0, 1.0);
        (energy_part + zcr_part) / 2.0
    }

    /// Feed one analysis frame; returns an event on state transitions.
    pub fn process_frame(&mut self, samples: &[f32], timestamp_ns: u64) -> Option<VadEvent> {
        let energy = rms(samples);
        self.last_zcr = zero_crossing_rate(samples);
        self.push_energy(energy);

        // Calibration: collect statistics, emit nothing
        if let Some(cal) = self.calibration.as_mut() {
            cal.samples.push(energy);
            if cal.samples.len() >= self.config.calibration_frames {
                let cal = self.calibration.take().expect("calibration present");
                self.threshold =
                    cal.threshold(self.config.threshold_floor) * self.config.sensitivity_scale;
                info!(
                    "VAD calibrated: threshold={:.5} over {} frames",
                    self.threshold,
                    cal.samples.len()
                );
            }
            return None;
        }

        let smoothed = self.smoothed_energy();
        let energy_pass = smoothed > self.threshold;
        let zcr_band = self.last_zcr > 0.05 && self.last_zcr < 0.8;
        let is_voice = energy_pass || (smoothed > 0.5 * self.threshold && zcr_band);

        match self.state {
            DetectorState::Silent => {
                if is_voice {
                    self.state = DetectorState::Speaking;
                    return Some(VadEvent::SpeechStart {
                        timestamp_ns,
                        confidence: self.confidence(),
                    });
                }
            }
            DetectorState::Speaking => {
                if !is_voice {
                    self.state = DetectorState::Hangover {
                        frames_left: self.hangover_frames,
                    };
                }
            }
            DetectorState::Hangover { frames_left } => {
                if is_voice {
                    // Brief intra-speech silence; nothing happened
                    self.state = DetectorState::Speaking;
                } else if frames_left <= 1 {
                    self.state = DetectorState::Debounce {
                        frames_left: self.debounce_frames,
                    };
                    // Zero debounce (server-driven presets) ends immediately
                    if self.debounce_frames == 0 {
                        self.state = DetectorState::Silent;
                        return Some(VadEvent::SpeechEnd { timestamp_ns });
                    }
                } else {
                    self.state = DetectorState::Hangover {
                        frames_left: frames_left - 1,
                    };
                }
            }
            DetectorState::Debounce { frames_left } => {
                if is_voice {
                    self.state = DetectorState::Speaking;
                } else if frames_left <= 1 {
                    self.state = DetectorState::Silent;
                    return Some(VadEvent::SpeechEnd { timestamp_ns });
                } else {
                    self.state = DetectorState::Debounce {
                        frames_left: frames_left - 1,
                    };
                }
            }
        }
        None
    }

    /// Force a pending utterance closed (session stop while speaking).
    pub fn flush(&mut self, timestamp_ns: u64) -> Option<VadEvent> {
        if self.in_speech() {
            self.state = DetectorState::Silent;
            Some(VadEvent::SpeechEnd { timestamp_ns })
        } else {
            None
        }
    }

    fn push_energy(&mut self, energy: f32) {
        self.energy_window[self.energy_pos] = energy;
        self.energy_pos = (self.energy_pos + 1) % self.energy_window.len();
        self.energy_filled = (self.energy_filled + 1).min(self.energy_window.len());
    }

    fn smoothed_energy(&self) -> f32 {
        if self.energy_filled == 0 {
            return 0.0;
        }
        self.energy_window[..self.energy_filled].iter().sum::<f32>() / self.energy_filled as f32
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

fn zero_crossing_rate(samples: &[f32]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }
    let crossings = samples
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    crossings as f32 / (samples.len() - 1) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 24_000;

    fn config() -> VadConfig {
        VadConfig::from_preset(AudioPreset::Balanced, VadSensitivity::Medium, RATE)
    }

    fn next_rand(state: &mut u32) -> f32 {
        *state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        (*state as i32 as f32) / (i32::MAX as f32)
    }

    /// Uniform white noise scaled to a target RMS amplitude
    fn noise_frame(state: &mut u32, rms_target: f32) -> Vec<f32> {
        // Uniform ±1 has RMS 1/√3; scale up accordingly
        (0..VAD_FRAME_SAMPLES)
            .map(|_| next_rand(state) * rms_target * 3.0f32.sqrt())
            .collect()
    }

    fn speech_frame(n: usize, amplitude: f32) -> Vec<f32> {
        (0..VAD_FRAME_SAMPLES)
            .map(|i| {
                let t = (n * VAD_FRAME_SAMPLES + i) as f32 / RATE as f32;
                amplitude * (2.0 * std::f32::consts::PI * 220.0 * t).sin()
            })
            .collect()
    }

    fn calibrate(vad: &mut VoiceDetector, state: &mut u32, noise_rms: f32) {
        let mut n = 0;
        while !vad.is_calibrated() {
            let frame = noise_frame(state, noise_rms);
            assert!(
                vad.process_frame(&frame, n).is_none(),
                "no events during calibration"
            );
            n += 1;
        }
    }

    #[test]
    fn test_calibration_threshold_bounds() {
        let amplitude = 0.02f32;
        let mut vad = VoiceDetector::new(VadConfig {
            threshold_floor: 0.001,
            ..config()
        });
        let mut state = 11u32;
        calibrate(&mut vad, &mut state, amplitude);

        let theta = vad.threshold();
        assert!(
            theta > amplitude && theta < 10.0 * amplitude,
            "threshold {theta} outside ({amplitude}, {})",
            10.0 * amplitude
        );
    }

    #[test]
    fn test_speech_start_and_end() {
        let mut vad = VoiceDetector::new(config());
        let mut state = 5u32;
        calibrate(&mut vad, &mut state, 0.005);

        // Loud tone: expect exactly one SpeechStart
        let mut started = 0;
        for n in 0..60 {
            if let Some(VadEvent::SpeechStart { .. }) =
                vad.process_frame(&speech_frame(n, 0.5), n as u64)
            {
                started += 1;
            }
        }
        assert_eq!(started, 1);
        assert!(vad.in_speech());

        // Silence until hangover + debounce expire
        let mut ended = 0;
        for n in 0..300 {
            if let Some(VadEvent::SpeechEnd { .. }) =
                vad.process_frame(&vec![0.0; VAD_FRAME_SAMPLES], n)
            {
                ended += 1;
            }
        }
        assert_eq!(ended, 1);
        assert!(!vad.in_speech());
    }

    #[test]
    fn test_hangover_bridges_short_gap() {
        let mut vad = VoiceDetector::new(config());
        let mut state = 5u32;
        calibrate(&mut vad, &mut state, 0.005);

        let mut starts = 0;
        let mut ends = 0;
        let mut track = |event: Option<VadEvent>| match event {
            Some(VadEvent::SpeechStart { .. }) => starts += 1,
            Some(VadEvent::SpeechEnd { .. }) => ends += 1,
            None => {}
        };

        // Speech, then a gap shorter than the hangover, then speech again
        for n in 0..40 {
            track(vad.process_frame(&speech_frame(n, 0.5), n as u64));
        }
        let gap_frames = (vad.hangover_frames - 2) as usize;
        for n in 0..gap_frames {
            track(vad.process_frame(&vec![0.0; VAD_FRAME_SAMPLES], n as u64));
        }
        for n in 0..40 {
            track(vad.process_frame(&speech_frame(n, 0.5), n as u64));
        }
        // Full silence to close the utterance
        for n in 0..300u64 {
            track(vad.process_frame(&vec![0.0; VAD_FRAME_SAMPLES], n));
        }

        assert_eq!(starts, 1, "gap shorter than hangover must not split");
        assert_eq!(ends, 1);
    }

    #[test]
    fn test_zero_debounce_ends_after_hangover() {
        let mut vad = VoiceDetector::new(VadConfig {
            debounce_ms: 0,
            ..config()
        });
        let mut state = 9u32;
        calibrate(&mut vad, &mut state, 0.005);

        for n in 0..40 {
            vad.process_frame(&speech_frame(n, 0.5), n as u64);
        }
        let mut ended = false;
        for n in 0..(vad.hangover_frames as u64 + 25) {
            if let Some(VadEvent::SpeechEnd { .. }) =
                vad.process_frame(&vec![0.0; VAD_FRAME_SAMPLES], n)
            {
                ended = true;
            }
        }
        assert!(ended);
    }

    #[test]
    fn test_flush_closes_open_utterance() {
        let mut vad = VoiceDetector::new(config());
        let mut state = 9u32;
        calibrate(&mut vad, &mut state, 0.005);

        for n in 0..40 {
            vad.process_frame(&speech_frame(n, 0.5), n as u64);
        }
        assert!(vad.in_speech());
        assert!(matches!(vad.flush(99), Some(VadEvent::SpeechEnd { .. })));
        assert!(vad.flush(100).is_none());
    }

    #[test]
    fn test_confidence_range() {
        let mut vad = VoiceDetector::new(config());
        let mut state = 21u32;
        calibrate(&mut vad, &mut state, 0.005);
        for n in 0..40 {
            vad.process_frame(&speech_frame(n, 0.5), n as u64);
        }
        let c = vad.confidence();
        assert!((0.0..=1.0).contains(&c), "confidence {c}");
    }

    #[test]
    fn test_zcr() {
        // Alternating signal crosses on every sample
        let alt: Vec<f32> = (0..100).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert!(zero_crossing_rate(&alt) > 0.99);
        // Constant signal never crosses
        assert_eq!(zero_crossing_rate(&[1.0; 100]), 0.0);
    }
}
