//! Bell voice - inharmonic, slowly ringing partials.
//!
//! Bells mark moments: a single strike now and then over a pad.
//!
//! # How It Works
//!
//! 1. Three sine partials at 1x, 2.76x and 5.4x the fundamental; the
//!    non-integer ratios are what make it a bell and not an organ
//! 2. Upper partials are quieter and shrink further at low intensity
//! 3. Instant attack, long exponential decay, no sustain
//!
//! # Variations
//!
//! - Integer ratios (1, 2, 3) = glassy, more harmonic
//! - Longer release = temple bell

use crate::dsp::oscillator::Waveform;
use crate::error::RenderError;
use crate::render::NodeSpec;
use crate::synth::envelope::Envelope;
use crate::synth::factory::{NoteEvent, Timbre};
use crate::synth::voice::VoiceBuilder;

const PARTIALS: [(f32, f32); 3] = [(1.0, 1.0), (2.76, 0.5), (5.4, 0.25)];

#[derive(Debug, Clone, Default)]
pub struct Bell;

impl Timbre for Bell {
    fn name(&self) -> &'static str {
        "bell"
    }

    fn envelope(&self) -> Envelope {
        Envelope::adsr(0.001, 1.2, 0.0, 2.5)
    }

    fn level(&self) -> f32 {
        0.3
    }

    fn build(&self, voice: &mut VoiceBuilder<'_>, note: &NoteEvent) -> Result<(), RenderError> {
        for (ratio, level) in PARTIALS {
            let level = if ratio > 1.0 { level * note.brightness.max(0.1) } else { level };
            let osc = voice.add(NodeSpec::oscillator(Waveform::Sine, note.frequency * ratio))?;
            let gain = voice.add(NodeSpec::gain(level))?;
            voice.connect(osc, gain)?;
            voice.to_output(gain)?;
        }
        Ok(())
    }
}
