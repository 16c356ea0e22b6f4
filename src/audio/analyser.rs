//! # Spectrum Analyser
//!
//! Visualizer tap on the speaker path. Produces byte-scaled magnitude bins the
//! same way a browser `AnalyserNode` does for `getByteFrequencyData`:
//! Blackman window → FFT → |X|/N → temporal smoothing → dB → [min_db, max_db] ↦ 0..=255.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

/// Default FFT size (128 frequency bins).
pub const DEFAULT_FFT_SIZE: usize = 256;

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;
const SMOOTHING: f32 = 0.8;

pub struct SpectrumAnalyser {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
}

impl SpectrumAnalyser {
    /// Create an analyser. `fft_size` is rounded up to a power of two, minimum 32.
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(32).next_power_of_two();
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);

        Self {
            fft_size,
            fft,
            window: blackman_window(fft_size),
            smoothed: vec![0.0; fft_size / 2],
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Analyse the most recent `fft_size` samples (zero-padded if shorter).
    pub fn snapshot(&mut self, samples: &[f32]) -> Vec<u8> {
        let n = self.fft_size;
        let tail = &samples[samples.len().saturating_sub(n)..];

        let mut buffer = vec![Complex::new(0.0f32, 0.0); n];
        for (i, &s) in tail.iter().enumerate() {
            buffer[i] = Complex::new(s * self.window[i], 0.0);
        }
        self.fft.process(&mut buffer);

        let mut out = Vec::with_capacity(self.bin_count());
        for (bin, value) in buffer.iter().take(self.bin_count()).enumerate() {
            let magnitude = value.norm() / n as f32;
            let smoothed = SMOOTHING * self.smoothed[bin] + (1.0 - SMOOTHING) * magnitude;
            self.smoothed[bin] = smoothed;
            out.push(to_byte(smoothed));
        }
        out
    }

    /// Forget the smoothing history (after an interruption).
    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|v| *v = 0.0);
    }
}

impl Default for SpectrumAnalyser {
    fn default() -> Self {
        Self::new(DEFAULT_FFT_SIZE)
    }
}

fn to_byte(magnitude: f32) -> u8 {
    if magnitude <= 0.0 {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 * (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
    scaled.clamp(0.0, 255.0) as u8
}

fn blackman_window(n: usize) -> Vec<f32> {
    let alpha = 0.16;
    let a0 = 0.5 * (1.0 - alpha);
    let a1 = 0.5;
    let a2 = 0.5 * alpha;
    (0..n)
        .map(|i| {
            let x = i as f32 / n as f32;
            a0 - a1 * (2.0 * PI * x).cos() + a2 * (4.0 * PI * x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_is_zero() {
        let mut analyser = SpectrumAnalyser::default();
        let bins = analyser.snapshot(&[0.0; 256]);
        assert_eq!(bins.len(), 128);
        assert!(bins.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_tone_peaks_at_its_bin() {
        let mut analyser = SpectrumAnalyser::new(256);
        // 24 kHz, bin width 93.75 Hz; bin 16 = 1500 Hz. Quiet enough not to saturate.
        let tone: Vec<f32> = (0..256)
            .map(|i| 0.01 * (2.0 * PI * 16.0 * i as f32 / 256.0).sin())
            .collect();
        let mut bins = Vec::new();
        for _ in 0..10 {
            bins = analyser.snapshot(&tone);
        }
        let peak = bins
            .iter()
            .enumerate()
            .max_by_key(|&(_, v)| *v)
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 16);
        assert!(bins[16] > 100);
        assert!(bins[16] > bins[15] && bins[16] > bins[17]);
        assert!(bins[60] < bins[16]);
    }

    #[test]
    fn test_fft_size_rounding_and_reset() {
        let mut analyser = SpectrumAnalyser::new(200);
        assert_eq!(analyser.fft_size(), 256);
        analyser.snapshot(&[0.9; 10]);
        analyser.reset();
        assert!(analyser.snapshot(&[]).iter().all(|&b| b == 0));
    }
}
