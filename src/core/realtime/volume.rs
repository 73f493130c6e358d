//! Output level metering over PCM16 frames.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Default)]
struct Accumulator {
    sum_squares: f64,
    samples: u64,
}

/// Accumulates sample energy between ticks and publishes an RMS level in
/// `0.0..=1.0` when sampled.
#[derive(Debug, Default)]
pub struct LevelMeter {
    pending: Mutex<Accumulator>,
    level: AtomicU32,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed little-endian 16-bit mono PCM. A trailing odd byte is ignored.
    pub fn feed(&self, pcm: &[u8]) {
        let mut sum = 0.0f64;
        let mut count = 0u64;
        for chunk in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f64 / 32768.0;
            sum += sample * sample;
            count += 1;
        }
        if count == 0 {
            return;
        }
        let mut pending = self.pending.lock();
        pending.sum_squares += sum;
        pending.samples += count;
    }

    /// Publish the RMS of everything fed since the last tick.
    ///
    /// Silence (no frames) publishes zero.
    pub fn tick(&self) -> f32 {
        let acc = std::mem::take(&mut *self.pending.lock());
        let rms = if acc.samples == 0 {
            0.0
        } else {
            ((acc.sum_squares / acc.samples as f64).sqrt() as f32).clamp(0.0, 1.0)
        };
        self.level.store(rms.to_bits(), Ordering::Relaxed);
        rms
    }

    pub fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        *self.pending.lock() = Accumulator::default();
        self.level.store(0f32.to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_silence_is_zero() {
        let meter = LevelMeter::new();
        meter.feed(&pcm(&[0, 0, 0, 0]));
        assert_eq!(meter.tick(), 0.0);
        assert_eq!(meter.tick(), 0.0);
    }

    #[test]
    fn test_square_wave_level() {
        let meter = LevelMeter::new();
        meter.feed(&pcm(&[16384, -16384, 16384, -16384]));
        let level = meter.tick();
        assert!((level - 0.5).abs() < 1e-6);
        assert_eq!(meter.level(), level);

        // next tick with nothing fed decays to zero
        assert_eq!(meter.tick(), 0.0);
    }

    #[test]
    fn test_reset() {
        let meter = LevelMeter::new();
        meter.feed(&pcm(&[i16::MAX; 8]));
        meter.tick();
        assert!(meter.level() > 0.9);
        meter.reset();
        assert_eq!(meter.level(), 0.0);
    }
}
