//! Pad voice - sustained, atmospheric texture.
//!
//! Pads are the foundation of an ambient mix. They fill the space behind
//! everything else without asking for attention.
//!
//! # How It Works
//!
//! 1. Two sawtooth oscillators, detuned against each other, for width
//! 2. Slow attack (1.5s) so chords swell in rather than start
//! 3. High sustain keeps the chord alive for its whole step
//! 4. Long release (3s) lets it dissolve into the next chord
//! 5. Low-pass filter; intensity opens it up
//!
//! # Variations
//!
//! - More detune (20+ cents) = wider, more dramatic
//! - Less detune (3-5 cents) = subtle, cohesive
//! - `waveform = "triangle"` = softer, almost organ-like
//! - Chord intervals in the mood turn single notes into voicings

use crate::dsp::{filter::FilterMode, oscillator::Waveform};
use crate::error::RenderError;
use crate::modules::ModuleSettings;
use crate::render::NodeSpec;
use crate::synth::envelope::Envelope;
use crate::synth::factory::{NoteEvent, Timbre};
use crate::synth::voice::VoiceBuilder;

#[derive(Debug, Clone)]
pub struct Pad {
    waveform: Waveform,
    detune_cents: f32,
}

impl Default for Pad {
    fn default() -> Self {
        Self {
            waveform: Waveform::Saw,
            detune_cents: 8.0,
        }
    }
}

impl Timbre for Pad {
    fn name(&self) -> &'static str {
        "pad"
    }

    fn envelope(&self) -> Envelope {
        Envelope::adsr(1.5, 1.0, 0.8, 3.0)
    }

    fn level(&self) -> f32 {
        0.35
    }

    fn configure(&mut self, settings: &ModuleSettings) {
        self.waveform = settings.waveform.unwrap_or(Waveform::Saw);
        self.detune_cents = settings.detune_cents;
    }

    fn build(&self, voice: &mut VoiceBuilder<'_>, note: &NoteEvent) -> Result<(), RenderError> {
        // 600 Hz when dark, up to 4.2 kHz when bright
        let cutoff = 600.0 + 3600.0 * note.brightness;
        let filter = voice.add(NodeSpec::filter(FilterMode::LowPass, cutoff, 0.6))?;

        for detune in [-self.detune_cents / 2.0, self.detune_cents / 2.0] {
            let osc = voice.add(NodeSpec::Oscillator {
                waveform: self.waveform,
                frequency: note.frequency,
                detune_cents: detune,
            })?;
            voice.connect(osc, filter)?;
        }
        voice.to_output(filter)
    }
}
