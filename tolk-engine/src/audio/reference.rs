//! Lock-free reference ring between playback and the echo canceller
//!
//! The playback consumer writes every sample it renders; the conditioner
//! reads the same stream as the far-end reference for echo estimation.
//! Single producer, single consumer, no locks on either side.
//!
//! The ring length bounds the maximum estimable echo path delay: samples
//! older than the capacity are gone by the time the canceller looks for
//! them.

use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default capacity: 200 ms at 24 kHz, comfortably above the canceller's
/// 50 ms maximum reference delay.
const DEFAULT_CAPACITY: usize = 4800;

/// Lock-free SPSC ring of rendered playback samples
pub struct ReferenceRing {
    buffer: HeapRb<f32>,
    overruns: Arc<AtomicU64>,
}

impl ReferenceRing {
    /// Create a ring with the given capacity in samples (default 4800)
    pub fn new(capacity: Option<usize>) -> Self {
        let capacity = capacity.unwrap_or(DEFAULT_CAPACITY);
        debug!("Creating reference ring with capacity {} samples", capacity);
        Self {
            buffer: HeapRb::new(capacity),
            overruns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Split into producer (playback side) and consumer (conditioner side)
    pub fn split(self) -> (ReferenceProducer, ReferenceConsumer) {
        let (prod, cons) = self.buffer.split();
        (
            ReferenceProducer {
                producer: prod,
                overruns: Arc::clone(&self.overruns),
            },
            ReferenceConsumer { consumer: cons },
        )
    }
}

/// Producer half, owned by the playback consumer task
pub struct ReferenceProducer {
    producer: ringbuf::HeapProd<f32>,
    overruns: Arc<AtomicU64>,
}

impl ReferenceProducer {
    /// Push rendered samples, overwriting nothing: samples that do not fit
    /// are dropped and counted. The canceller prefers a gap over stale
    /// alignment.
    pub fn push_slice(&mut self, samples: &[f32]) {
        let pushed = self.producer.push_slice(samples);
        if pushed < samples.len() {
            let dropped = (samples.len() - pushed) as u64;
            let total = self.overruns.fetch_add(dropped, Ordering::Relaxed) + dropped;
            if total % 48_000 < dropped {
                warn!("Reference ring overrun (total dropped: {})", total);
            }
        }
    }
}

/// Consumer half, owned by the conditioner task
pub struct ReferenceConsumer {
    consumer: ringbuf::HeapCons<f32>,
}

impl ReferenceConsumer {
    /// Pop one reference sample; silence when the ring is empty.
    ///
    /// An empty ring is the normal state whenever nothing is being
    /// played back (e.g. playback disabled), so no underrun is counted.
    pub fn pop(&mut self) -> f32 {
        self.consumer.try_pop().unwrap_or(0.0)
    }

    /// Fill `out` with reference samples, zero-padding past the available
    /// data. Returns how many real samples were read.
    pub fn pop_slice(&mut self, out: &mut [f32]) -> usize {
        let read = self.consumer.pop_slice(out);
        for sample in &mut out[read..] {
            *sample = 0.0;
        }
        read
    }

    /// Samples currently buffered
    pub fn occupied_len(&self) -> usize {
        self.consumer.occupied_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_order() {
        let (mut prod, mut cons) = ReferenceRing::new(Some(8)).split();
        prod.push_slice(&[0.1, 0.2, 0.3]);
        assert_eq!(cons.occupied_len(), 3);
        assert_eq!(cons.pop(), 0.1);
        assert_eq!(cons.pop(), 0.2);
        assert_eq!(cons.pop(), 0.3);
    }

    #[test]
    fn test_empty_ring_reads_silence() {
        let (_prod, mut cons) = ReferenceRing::new(Some(8)).split();
        assert_eq!(cons.pop(), 0.0);

        let mut out = [1.0f32; 4];
        assert_eq!(cons.pop_slice(&mut out), 0);
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn test_overrun_drops_excess() {
        let (mut prod, mut cons) = ReferenceRing::new(Some(4)).split();
        prod.push_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        // Oldest four survive, the rest were dropped
        let mut out = [0.0f32; 6];
        assert_eq!(cons.pop_slice(&mut out), 4);
        assert_eq!(&out[..4], &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_pop_slice_zero_pads() {
        let (mut prod, mut cons) = ReferenceRing::new(Some(8)).split();
        prod.push_slice(&[0.5, 0.6]);
        let mut out = [9.0f32; 4];
        assert_eq!(cons.pop_slice(&mut out), 2);
        assert_eq!(out, [0.5, 0.6, 0.0, 0.0]);
    }
}
