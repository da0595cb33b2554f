use std::f32::consts::TAU;

use serde::Deserialize;

/*
| mode              | passes          | rejects      |
| ----------------- | --------------- | ------------ |
| low-pass          | below cutoff    | above cutoff |
| high-pass         | above cutoff    | below cutoff |
| band-pass         | around cutoff   | outside      |
| notch / band-stop | outside         | around       |

Topology-preserving state variable filter (Simper). All four responses come
out of the same two integrators, so switching mode costs nothing and the
filter stays stable while its cutoff is being automated.
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    LowPass,
    HighPass,
    BandPass,
    Notch,
}

pub struct FilterOutputs {
    pub lowpass: f32,
    pub bandpass: f32,
    pub highpass: f32,
    pub notch: f32,
}

pub struct SVFilter {
    ic1eq: f32,
    ic2eq: f32,
    mode: FilterMode,
}

impl SVFilter {
    pub fn new(mode: FilterMode) -> Self {
        Self {
            ic1eq: 0.0,
            ic2eq: 0.0,
            mode,
        }
    }

    /// Integrator gain for a cutoff, pre-warped for the bilinear transform.
    /// The cutoff is kept below Nyquist so `tan` never blows up.
    #[inline]
    pub fn coefficient(cutoff_hz: f32, sample_rate: f32) -> f32 {
        let nyquist = sample_rate * 0.5;
        let cutoff = cutoff_hz.clamp(10.0, nyquist * 0.98);
        (TAU * cutoff / (2.0 * sample_rate)).tan()
    }

    /// Damping term from a Q value. Q of 0.707 is a maximally flat response.
    #[inline]
    pub fn damping(q: f32) -> f32 {
        1.0 / q.max(0.05)
    }

    #[inline]
    pub fn next_sample(&mut self, sample: f32, k: f32, g: f32) -> FilterOutputs {
        let h = 1.0 / (1.0 + g * (g + k));
        let v3 = sample - self.ic2eq;
        let v1 = h * (self.ic1eq + g * v3);
        let v2 = self.ic2eq + g * v1;

        self.ic1eq = 2.0 * v1 - self.ic1eq;
        self.ic2eq = 2.0 * v2 - self.ic2eq;

        FilterOutputs {
            lowpass: v2,
            bandpass: v1,
            highpass: sample - k * v1 - v2,
            notch: sample - k * v1,
        }
    }

    /// Filter a block in place with fixed coefficients.
    pub fn process(&mut self, buffer: &mut [f32], cutoff_hz: f32, q: f32, sample_rate: f32) {
        let g = Self::coefficient(cutoff_hz, sample_rate);
        let k = Self::damping(q);

        for sample in buffer.iter_mut() {
            let outputs = self.next_sample(*sample, k, g);
            *sample = match self.mode {
                FilterMode::LowPass => outputs.lowpass,
                FilterMode::HighPass => outputs.highpass,
                FilterMode::BandPass => outputs.bandpass,
                FilterMode::Notch => outputs.notch,
            };
        }
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn reset(&mut self) {
        self.ic1eq = 0.0;
        self.ic2eq = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RATE: f32 = 48_000.0;

    fn sine(freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (TAU * freq * i as f32 / SAMPLE_RATE).sin())
            .collect()
    }

    fn peak_after_transient(buffer: &[f32]) -> f32 {
        buffer[buffer.len() / 2..]
            .iter()
            .fold(0.0f32, |acc, &x| acc.max(x.abs()))
    }

    #[test]
    fn lowpass_passes_dc() {
        let mut filter = SVFilter::new(FilterMode::LowPass);
        let mut buffer = vec![1.0; 256];
        filter.process(&mut buffer, 500.0, 0.707, SAMPLE_RATE);
        assert!(buffer[255] > 0.99);
    }

    #[test]
    fn highpass_blocks_dc() {
        let mut filter = SVFilter::new(FilterMode::HighPass);
        let mut buffer = vec![1.0; 2048];
        filter.process(&mut buffer, 500.0, 0.707, SAMPLE_RATE);
        assert!(buffer[2047].abs() < 0.01);
    }

    #[test]
    fn lowpass_attenuates_above_cutoff() {
        let mut filter = SVFilter::new(FilterMode::LowPass);
        let mut buffer = sine(5_000.0, 1024);
        filter.process(&mut buffer, 500.0, 0.707, SAMPLE_RATE);
        let peak = peak_after_transient(&buffer);
        assert!(peak < 0.1, "expected attenuation, got peak {peak}");
    }

    #[test]
    fn notch_rejects_center() {
        let mut filter = SVFilter::new(FilterMode::Notch);
        let mut center = sine(1_000.0, 4096);
        filter.process(&mut center, 1_000.0, 2.0, SAMPLE_RATE);

        filter.reset();
        let mut off = sine(200.0, 4096);
        filter.process(&mut off, 1_000.0, 2.0, SAMPLE_RATE);

        assert!(peak_after_transient(&center) * 2.0 < peak_after_transient(&off));
    }

    #[test]
    fn cutoff_above_nyquist_stays_finite() {
        let mut filter = SVFilter::new(FilterMode::BandPass);
        let mut buffer = sine(440.0, 512);
        filter.process(&mut buffer, 100_000.0, 0.707, SAMPLE_RATE);
        assert!(buffer.iter().all(|s| s.is_finite()));
    }
}
