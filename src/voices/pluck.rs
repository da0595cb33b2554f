//! Pluck voice - percussive, quickly-decaying note.
//!
//! Plucks carry the melodic fragments of a mood: kalimba-like figures that
//! appear and fade without ever settling.
//!
//! # How It Works
//!
//! 1. Triangle wave for a soft, rounded tone
//! 2. Instant attack (2ms) for immediate response
//! 3. Medium decay (400ms) with a little sustain
//! 4. Release (600ms) so notes ring into the reverb
//! 5. Filter envelope: the cutoff jumps open and closes with the decay,
//!    which is what makes it sound plucked rather than gated
//!
//! # Variations
//!
//! - Shorter decay (50-80ms) = more percussive, staccato
//! - Longer decay = more bell-like, ringing
//! - `waveform = "sine"` = purer, more mellow
//! - `waveform = "square"` = more hollow, synthetic

use crate::dsp::{filter::FilterMode, oscillator::Waveform};
use crate::error::RenderError;
use crate::modules::ModuleSettings;
use crate::render::NodeSpec;
use crate::synth::envelope::{Envelope, FilterEnvelope};
use crate::synth::factory::{NoteEvent, Timbre};
use crate::synth::voice::VoiceBuilder;

#[derive(Debug, Clone)]
pub struct Pluck {
    waveform: Waveform,
}

impl Default for Pluck {
    fn default() -> Self {
        Self {
            waveform: Waveform::Triangle,
        }
    }
}

impl Timbre for Pluck {
    fn name(&self) -> &'static str {
        "pluck"
    }

    fn envelope(&self) -> Envelope {
        Envelope::adsr(0.002, 0.4, 0.15, 0.6)
    }

    fn configure(&mut self, settings: &ModuleSettings) {
        self.waveform = settings.waveform.unwrap_or(Waveform::Triangle);
    }

    fn build(&self, voice: &mut VoiceBuilder<'_>, note: &NoteEvent) -> Result<(), RenderError> {
        let osc = voice.add(NodeSpec::oscillator(self.waveform, note.frequency))?;
        let base = (note.frequency * 1.5).max(200.0);
        let filter = voice.add(NodeSpec::filter(FilterMode::LowPass, base, 1.2))?;
        voice.connect(osc, filter)?;
        voice.envelope_filter(
            filter,
            FilterEnvelope {
                base,
                peak: base + 6000.0 * note.brightness * note.velocity.max(0.2),
                shape: Envelope::adsr(0.002, 0.25, 0.0, 0.3),
            },
        );
        voice.to_output(filter)
    }
}
