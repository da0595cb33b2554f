//! Hi-hat voice (closed).
//!
//! A tight, short burst of filtered noise. At low intensity it reads as
//! rain on a window more than as a drum.
//!
//! # How It Works
//!
//! 1. White noise provides the "metallic" character
//! 2. High-pass filter removes low frequencies; intensity raises it
//! 3. Very short envelope for that tight "tss" sound
//!
//! # Variations
//!
//! - Longer release = open hi-hat
//! - Lower filter = darker, jazzier hat

use crate::dsp::filter::FilterMode;
use crate::error::RenderError;
use crate::render::NodeSpec;
use crate::synth::envelope::Envelope;
use crate::synth::factory::{NoteEvent, Timbre};
use crate::synth::voice::VoiceBuilder;

#[derive(Debug, Clone)]
pub struct HiHat {
    seed: u64,
}

impl Default for HiHat {
    fn default() -> Self {
        Self { seed: 0x5eed }
    }
}

impl Timbre for HiHat {
    fn name(&self) -> &'static str {
        "hihat"
    }

    fn envelope(&self) -> Envelope {
        Envelope::adsr(0.001, 0.05, 0.0, 0.03)
    }

    fn level(&self) -> f32 {
        0.25
    }

    fn build(&self, voice: &mut VoiceBuilder<'_>, note: &NoteEvent) -> Result<(), RenderError> {
        let noise = voice.add(NodeSpec::Noise { seed: self.seed })?;
        let cutoff = 5000.0 + 4000.0 * note.brightness;
        let filter = voice.add(NodeSpec::filter(FilterMode::HighPass, cutoff, 0.9))?;
        voice.connect(noise, filter)?;
        voice.to_output(filter)
    }
}
