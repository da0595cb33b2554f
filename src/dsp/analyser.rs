//! Analysis tap.
//!
//! Keeps the most recent `fft_size` samples passing through the master chain
//! and turns them into a log-spaced magnitude spectrum on demand. Bins cover
//! 20 Hz to Nyquist (capped at 20 kHz) and are normalised from a -100..0 dB
//! window into 0..=1 so callers can draw them directly.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

const MIN_DB: f32 = -100.0;
const MAX_DB: f32 = 0.0;

pub struct Analyser {
    /// Ring of recent samples, oldest at `write_pos`.
    history: Vec<f32>,
    write_pos: usize,
    /// Hann window coefficients
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex<f32>>,
    sample_rate: f32,
}

impl Analyser {
    pub fn new(fft_size: usize, sample_rate: f32) -> Self {
        let fft_size = fft_size.max(2);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);

        let denom = (fft_size - 1) as f32;
        let window = (0..fft_size)
            .map(|i| 0.5 * (1.0 - (std::f32::consts::TAU * i as f32 / denom).cos()))
            .collect();

        Self {
            history: vec![0.0; fft_size],
            write_pos: 0,
            window,
            fft,
            scratch: vec![Complex::new(0.0, 0.0); fft_size],
            sample_rate,
        }
    }

    pub fn capture(&mut self, block: &[f32]) {
        let len = self.history.len();
        for &sample in block {
            self.history[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % len;
        }
    }

    /// Recent samples in chronological order.
    pub fn time_domain(&self) -> Vec<f32> {
        let (newer, older) = self.history.split_at(self.write_pos);
        older.iter().chain(newer.iter()).copied().collect()
    }

    /// Root mean square of the captured window.
    pub fn rms(&self) -> f32 {
        let sum: f32 = self.history.iter().map(|s| s * s).sum();
        (sum / self.history.len() as f32).sqrt()
    }

    /// Log-spaced magnitude spectrum with `bins` entries in 0..=1.
    pub fn spectrum(&mut self, bins: usize) -> Vec<f32> {
        let len = self.history.len();
        let ordered = self.time_domain();
        for (i, sample) in ordered.iter().enumerate() {
            self.scratch[i] = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let half = (len / 2).max(1);
        let max_freq = (self.sample_rate / 2.0).min(20_000.0).max(21.0);
        let min_freq = 20.0f32;
        let ratio = max_freq / min_freq;
        // Hann window halves the coherent gain; scale so a full-scale sine reads ~0 dB
        let norm = 4.0 / len as f32;

        (0..bins)
            .map(|i| {
                let t = if bins > 1 {
                    i as f32 / (bins - 1) as f32
                } else {
                    0.0
                };
                let freq = min_freq * ratio.powf(t);
                let index = ((freq * len as f32 / self.sample_rate).round() as usize).min(half - 1);
                let bin = self.scratch[index];
                let magnitude = (bin.re * bin.re + bin.im * bin.im).sqrt() * norm;
                let db = 20.0 * magnitude.max(1e-9).log10();
                ((db - MIN_DB) / (MAX_DB - MIN_DB)).clamp(0.0, 1.0)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_reads_as_floor() {
        let mut analyser = Analyser::new(1024, 48_000.0);
        analyser.capture(&[0.0; 1024]);
        assert!(analyser.spectrum(32).iter().all(|&b| b == 0.0));
        assert_eq!(analyser.rms(), 0.0);
    }

    #[test]
    fn tone_lights_up_its_band() {
        let sample_rate = 48_000.0;
        let mut analyser = Analyser::new(2048, sample_rate);
        let tone: Vec<f32> = (0..2048)
            .map(|i| (std::f32::consts::TAU * 1000.0 * i as f32 / sample_rate).sin() * 0.5)
            .collect();
        analyser.capture(&tone);

        let spectrum = analyser.spectrum(64);
        let loudest = spectrum
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        // 1 kHz sits a bit past the middle of a 20 Hz..20 kHz log axis
        assert!((35..=42).contains(&loudest), "peak bin {loudest}");
        assert!(analyser.rms() > 0.3);
    }

    #[test]
    fn time_domain_is_chronological() {
        let mut analyser = Analyser::new(4, 48_000.0);
        analyser.capture(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(analyser.time_domain(), vec![3.0, 4.0, 5.0, 6.0]);
    }
}
