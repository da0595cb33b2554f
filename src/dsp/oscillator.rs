use std::f32::consts::TAU;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;

/*
Waveforms and their character
=============================

Sine      pure fundamental, no overtones        sub, bells, probes
Saw       every harmonic, falling as 1/n        pads, strings
Square    odd harmonics, falling as 1/n         hollow leads
Triangle  odd harmonics, falling as 1/n²        soft plucks

The oscillator only owns a phase accumulator. Frequency arrives per sample
from the renderer, so automation (pitch drops, detune drift) is sample
accurate without the oscillator knowing about it.
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    Sine,
    Saw,
    Square,
    Triangle,
}

pub struct Oscillator {
    waveform: Waveform,
    phase: f32,
}

impl Oscillator {
    pub fn new(waveform: Waveform) -> Self {
        Self { waveform, phase: 0.0 }
    }

    /// Advance one sample at `frequency` Hz and return the waveform value.
    #[inline]
    pub fn next_sample(&mut self, frequency: f32, sample_rate: f32) -> f32 {
        let value = match self.waveform {
            Waveform::Sine => (TAU * self.phase).sin(),
            Waveform::Saw => 2.0 * self.phase - 1.0,
            Waveform::Square => {
                if self.phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Triangle => 4.0 * (self.phase - 0.5).abs() - 1.0,
        };
        self.phase = (self.phase + frequency.max(0.0) / sample_rate).fract();
        value
    }

    pub fn waveform(&self) -> Waveform {
        self.waveform
    }
}

/// Cents to frequency ratio: 1200 cents is one octave.
#[inline]
pub fn cents_to_ratio(cents: f32) -> f32 {
    (cents / 1200.0).exp2()
}

/// MIDI note number to Hz, A4 = 69 = 440 Hz.
#[inline]
pub fn midi_to_freq(note: f32) -> f32 {
    440.0 * ((note - 69.0) / 12.0).exp2()
}

/// White noise source.
pub struct Noise {
    rng: StdRng,
}

impl Noise {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    #[inline]
    pub fn next_sample(&mut self) -> f32 {
        self.rng.gen_range(-1.0..1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_completes_one_cycle() {
        let mut osc = Oscillator::new(Waveform::Sine);
        let samples: Vec<f32> = (0..100).map(|_| osc.next_sample(480.0, 48_000.0)).collect();
        assert!(samples[0].abs() < 1e-6);
        assert!((samples[25] - 1.0).abs() < 1e-3);
        assert!((samples[75] + 1.0).abs() < 1e-3);
    }

    #[test]
    fn waveforms_stay_in_range() {
        for waveform in [Waveform::Sine, Waveform::Saw, Waveform::Square, Waveform::Triangle] {
            let mut osc = Oscillator::new(waveform);
            for _ in 0..1000 {
                let s = osc.next_sample(997.0, 48_000.0);
                assert!((-1.0..=1.0).contains(&s), "{waveform:?} produced {s}");
            }
        }
    }

    #[test]
    fn midi_reference_pitches() {
        assert!((midi_to_freq(69.0) - 440.0).abs() < 1e-3);
        assert!((midi_to_freq(57.0) - 220.0).abs() < 1e-3);
        assert!((cents_to_ratio(1200.0) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn noise_is_seeded() {
        let mut a = Noise::new(7);
        let mut b = Noise::new(7);
        for _ in 0..16 {
            assert_eq!(a.next_sample(), b.next_sample());
        }
    }
}
