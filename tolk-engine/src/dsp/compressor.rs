//! Dynamics compressor with envelope follower and gain computer

/// Converts linear amplitude to decibels.
#[inline]
fn linear_to_db(linear: f32) -> f32 {
    20.0 * linear.max(1e-6).log10()
}

/// Converts decibels to linear amplitude.
#[inline]
fn db_to_linear(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

/// Peak envelope follower with separate attack and release time constants.
#[derive(Debug, Clone)]
struct EnvelopeFollower {
    attack_coeff: f32,
    release_coeff: f32,
    envelope: f32,
}

impl EnvelopeFollower {
    fn new(sample_rate: f32, attack_ms: f32, release_ms: f32) -> Self {
        Self {
            attack_coeff: Self::coeff(sample_rate, attack_ms),
            release_coeff: Self::coeff(sample_rate, release_ms),
            envelope: 0.0,
        }
    }

    fn coeff(sample_rate: f32, time_ms: f32) -> f32 {
        (-1.0 / (sample_rate * time_ms.max(0.01) / 1000.0)).exp()
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let level = input.abs();
        let coeff = if level > self.envelope {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.envelope = level + coeff * (self.envelope - level);
        self.envelope
    }

    fn reset(&mut self) {
        self.envelope = 0.0;
    }
}

/// Gain computer for the compression curve (hard knee).
#[derive(Debug, Clone)]
struct GainComputer {
    threshold_db: f32,
    ratio: f32,
}

impl GainComputer {
    #[inline]
    fn compute_gain_db(&self, input_db: f32) -> f32 {
        let overshoot = input_db - self.threshold_db;
        if overshoot <= 0.0 {
            0.0
        } else {
            -overshoot * (1.0 - 1.0 / self.ratio)
        }
    }
}

/// Dynamics compressor tuned for speech leveling ahead of the detector.
#[derive(Debug, Clone)]
pub struct Compressor {
    envelope_follower: EnvelopeFollower,
    gain_computer: GainComputer,
}

impl Compressor {
    /// Create a compressor with the given curve and timing.
    pub fn new(
        sample_rate: f32,
        threshold_db: f32,
        ratio: f32,
        attack_ms: f32,
        release_ms: f32,
    ) -> Self {
        Self {
            envelope_follower: EnvelopeFollower::new(sample_rate, attack_ms, release_ms),
            gain_computer: GainComputer {
                threshold_db: threshold_db.clamp(-60.0, 0.0),
                ratio: ratio.clamp(1.0, 20.0),
            },
        }
    }

    /// Speech defaults: −24 dB threshold, 12:1 ratio, 3 ms attack,
    /// 250 ms release.
    pub fn speech_default(sample_rate: f32) -> Self {
        Self::new(sample_rate, -24.0, 12.0, 3.0, 250.0)
    }

    /// Process one sample.
    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let envelope = self.envelope_follower.process(input);
        let gain_db = self.gain_computer.compute_gain_db(linear_to_db(envelope));
        input * db_to_linear(gain_db)
    }

    /// Clear envelope state.
    pub fn reset(&mut self) {
        self.envelope_follower.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_below_threshold_is_unity() {
        let mut comp = Compressor::speech_default(48_000.0);
        // -40 dB signal, well under the -24 dB threshold
        let mut out = 0.0;
        for _ in 0..4800 {
            out = comp.process(0.01);
        }
        assert!((out - 0.01).abs() < 0.001, "expected unity gain, got {out}");
    }

    #[test]
    fn test_loud_signal_is_compressed() {
        let mut comp = Compressor::speech_default(48_000.0);
        let mut out = 0.0;
        for _ in 0..48_000 {
            out = comp.process(0.9);
        }
        // 0.9 is ~-0.9 dB: ~23 dB over threshold, reduced by ~21 dB
        assert!(out < 0.2, "expected strong compression, got {out}");
        assert!(out > 0.0);
    }

    #[test]
    fn test_release_recovers_gain() {
        let mut comp = Compressor::speech_default(48_000.0);
        for _ in 0..48_000 {
            comp.process(0.9);
        }
        // After half a second of quiet input, gain is back near unity
        let mut out = 0.0;
        for _ in 0..24_000 {
            out = comp.process(0.01);
        }
        assert!((out - 0.01).abs() < 0.002, "release did not recover: {out}");
    }

    #[test]
    fn test_output_always_finite() {
        let mut comp = Compressor::speech_default(48_000.0);
        for &x in &[0.0, 1.0, -1.0, 1e-9, 0.5] {
            assert!(comp.process(x).is_finite());
        }
    }
}
