//! NLMS acoustic echo canceller
//!
//! Normalized least-mean-squares adaptive filter with double-talk
//! detection and residual suppression. The far-end reference (what the
//! playback path rendered) is kept in a ring long enough to cover the
//! filter span plus the maximum estimable path delay; the filter models
//! the acoustic path from speaker to microphone and subtracts the echo
//! estimate from the capture signal.
//!
//! Per sample, with microphone m(n), reference r(n), coefficients w and
//! estimated delay d:
//!
//! ```text
//! ê(n)  = Σ w[k] · r(n − d − L + 1 + k)         (echo estimate)
//! y(n)  = m(n) − ê(n)                           (output)
//! freeze when Em / (Er + δ) > dtd_threshold     (double-talk)
//! P     = ε + Σ r² over the tap window
//! w[k] += (μ / P) · y(n) · r(n − d − L + 1 + k) (NLMS update)
//! y(n) *= 0.1 when |y(n)| < res_threshold       (residual suppression)
//! ```
//!
//! Em and Er are exponentially smoothed (α = 0.95) f64 energy estimates.

use tracing::debug;

/// Tunable parameters for the canceller
#[derive(Debug, Clone)]
pub struct AecParams {
    /// Filter length L in taps
    pub filter_len: usize,
    /// NLMS step size μ, 0–1
    pub step_size: f32,
    /// Regularization ε added to the tap-window power
    pub regularization: f32,
    /// Mic/reference energy ratio above which adaptation freezes
    pub dtd_threshold: f64,
    /// Output magnitude below which residual suppression engages
    pub res_threshold: f32,
    /// Maximum reference delay D in samples
    pub max_delay: usize,
    /// Initial (and fallback) path delay estimate in samples
    pub initial_delay: usize,
    /// Samples between delay re-estimation passes (100 ms @ 48 kHz)
    pub delay_refresh_interval: usize,
}

impl Default for AecParams {
    fn default() -> Self {
        Self {
            filter_len: 512,
            step_size: 0.5,
            regularization: 1e-3,
            dtd_threshold: 0.5,
            res_threshold: 0.01,
            max_delay: 2400,
            initial_delay: 240,
            delay_refresh_interval: 4800,
        }
    }
}

/// Window length used by the cross-correlation delay search
const XCORR_WINDOW: usize = 256;
/// Lag stride of the coarse delay search
const XCORR_STRIDE: usize = 16;
/// Normalized correlation needed before the delay estimate moves
const XCORR_MIN_PEAK: f64 = 0.5;

/// NLMS echo canceller with double-talk freeze and residual suppression.
///
/// All state is exclusively owned; the struct is driven from the
/// conditioner task only.
pub struct EchoCanceller {
    params: AecParams,
    /// Adaptive filter coefficients, length L
    weights: Vec<f32>,
    /// Reference ring, capacity L + D
    reference: Vec<f32>,
    /// Write position (one past the newest reference sample)
    ref_pos: usize,
    /// Recent microphone samples for the delay search
    mic_history: Vec<f32>,
    mic_pos: usize,
    /// Smoothed microphone energy (f64: hours-long sessions must not drift)
    mic_energy: f64,
    /// Smoothed reference energy
    ref_energy: f64,
    /// Current path delay estimate in samples
    delay: usize,
    /// Samples processed since the last delay search
    since_delay_search: usize,
}

impl EchoCanceller {
    pub fn new(params: AecParams) -> Self {
        let capacity = params.filter_len + params.max_delay;
        let delay = params.initial_delay.min(params.max_delay);
        Self {
            weights: vec![0.0; params.filter_len],
            reference: vec![0.0; capacity],
            ref_pos: 0,
            mic_history: vec![0.0; XCORR_WINDOW],
            mic_pos: 0,
            mic_energy: 0.0,
            ref_energy: 0.0,
            delay,
            since_delay_search: 0,
            params,
        }
    }

    /// Process one microphone sample against one reference sample.
    #[inline]
    pub fn process_sample(&mut self, mic: f32, reference: f32) -> f32 {
        let cap = self.reference.len();
        let l = self.params.filter_len;

        // Append reference to the ring
        self.reference[self.ref_pos] = reference;
        self.ref_pos = (self.ref_pos + 1) % cap;

        self.mic_history[self.mic_pos] = mic;
        self.mic_pos = (self.mic_pos + 1) % XCORR_WINDOW;

        // Echo estimate over the delayed tap window
        let base = self.ref_pos + cap - self.delay - l;
        let mut estimate = 0.0f32;
        let mut power = self.params.regularization;
        for k in 0..l {
            let r = self.reference[(base + k) % cap];
            estimate += self.weights[k] * r;
            power += r * r;
        }

        let mut y = mic - estimate;

        // Double-talk test on smoothed energies
        const ALPHA: f64 = 0.95;
        self.mic_energy = ALPHA * self.mic_energy + (1.0 - ALPHA) * (mic as f64 * mic as f64);
        self.ref_energy =
            ALPHA * self.ref_energy + (1.0 - ALPHA) * (reference as f64 * reference as f64);
        let double_talk = self.mic_energy / (self.ref_energy + 1e-10) > self.params.dtd_threshold;

        if !double_talk {
            let mu_e = (self.params.step_size / power) * y;
            for k in 0..l {
                let r = self.reference[(base + k) % cap];
                self.weights[k] += mu_e * r;
            }
        }

        // Residual suppression: squash what is left of the echo tail
        if y.abs() < self.params.res_threshold {
            y *= 0.1;
        }

        self.since_delay_search += 1;
        if self.since_delay_search >= self.params.delay_refresh_interval {
            self.since_delay_search = 0;
            self.refresh_delay();
        }

        y
    }

    /// Process a frame in place.
    ///
    /// `mic` and `reference` must be the same length.
    pub fn process_frame(&mut self, mic: &mut [f32], reference: &[f32]) {
        debug_assert_eq!(mic.len(), reference.len());
        for (m, &r) in mic.iter_mut().zip(reference.iter()) {
            *m = self.process_sample(*m, r);
        }
    }

    /// Re-estimate the path delay from a coarse cross-correlation peak
    /// search between recent microphone samples and the reference ring.
    /// Keeps the previous estimate when no clear peak exists (silent
    /// reference, or near-end speech drowning the echo).
    fn refresh_delay(&mut self) {
        if self.ref_energy < 1e-8 {
            return;
        }

        let cap = self.reference.len();
        let mut mic_window = [0.0f32; XCORR_WINDOW];
        for (i, slot) in mic_window.iter_mut().enumerate() {
            *slot = self.mic_history[(self.mic_pos + i) % XCORR_WINDOW];
        }
        let mic_norm: f64 = mic_window.iter().map(|&m| (m as f64).powi(2)).sum();
        if mic_norm < 1e-10 {
            return;
        }

        let mut best_lag = self.delay;
        let mut best_corr = 0.0f64;
        // Lags whose window would fall off the back of the ring are
        // unsearchable; the ring length bounds the estimable delay.
        let max_lag = self.params.max_delay.min(cap - XCORR_WINDOW);
        let mut lag = 0usize;
        while lag <= max_lag {
            // Oldest mic-window sample is m(n − W + 1); align the
            // reference window `lag` samples earlier than that.
            let start = self.ref_pos + 2 * cap - XCORR_WINDOW - lag;
            let mut corr = 0.0f64;
            let mut ref_norm = 0.0f64;
            for (i, &m) in mic_window.iter().enumerate() {
                let r = self.reference[(start + i) % cap] as f64;
                corr += m as f64 * r;
                ref_norm += r * r;
            }
            let denom = (mic_norm * ref_norm).sqrt();
            if denom > 1e-10 {
                let normalized = (corr / denom).abs();
                if normalized > best_corr {
                    best_corr = normalized;
                    best_lag = lag;
                }
            }
            lag += XCORR_STRIDE;
        }

        if best_corr >= XCORR_MIN_PEAK && best_lag != self.delay {
            debug!(
                "AEC delay estimate moved {} -> {} samples (corr {:.2})",
                self.delay, best_lag, best_corr
            );
            self.delay = best_lag;
        }
    }

    /// Current delay estimate in samples
    pub fn delay(&self) -> usize {
        self.delay
    }

    /// Current filter coefficients
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// Clear coefficients, reference history, and energy estimators.
    pub fn reset(&mut self) {
        self.weights.fill(0.0);
        self.reference.fill(0.0);
        self.mic_history.fill(0.0);
        self.ref_pos = 0;
        self.mic_pos = 0;
        self.mic_energy = 0.0;
        self.ref_energy = 0.0;
        self.delay = self.params.initial_delay.min(self.params.max_delay);
        self.since_delay_search = 0;
    }
}
