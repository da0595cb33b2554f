//! Kick drum voice.
//!
//! A soft synthesized kick: a sine wave whose pitch starts high and falls to
//! the fundamental. In an ambient mix it works more as a heartbeat than as a
//! driving pulse.
//!
//! # How It Works
//!
//! 1. Sine oscillator provides the body (pure, deep tone)
//! 2. Pitch envelope: starts at 3x the body pitch, settles within ~40ms
//! 3. Amplitude envelope with instant attack, quick decay, no sustain
//! 4. Low-pass filter removes any harshness
//!
//! # Variations
//!
//! - Longer decay = boomy 808-style kick
//! - Higher start pitch = more "click" attack
//! - Pitched steps in the pattern retune the body

use crate::dsp::{filter::FilterMode, oscillator::Waveform};
use crate::error::RenderError;
use crate::render::{Automation, NodeSpec, Param};
use crate::synth::envelope::Envelope;
use crate::synth::factory::{NoteEvent, Timbre};
use crate::synth::voice::VoiceBuilder;

/// Body pitch for unpitched hits.
const BODY_HZ: f32 = 50.0;

#[derive(Debug, Clone, Default)]
pub struct Kick;

impl Timbre for Kick {
    fn name(&self) -> &'static str {
        "kick"
    }

    fn envelope(&self) -> Envelope {
        Envelope::adsr(0.001, 0.25, 0.0, 0.08)
    }

    fn level(&self) -> f32 {
        0.8
    }

    fn build(&self, voice: &mut VoiceBuilder<'_>, note: &NoteEvent) -> Result<(), RenderError> {
        let body = if note.frequency > 0.0 { note.frequency } else { BODY_HZ };

        let osc = voice.add(NodeSpec::oscillator(Waveform::Sine, body * 3.0))?;
        voice.automate(osc, Param::Frequency, Automation::SetValue { value: body * 3.0, at: note.onset })?;
        voice.automate(
            osc,
            Param::Frequency,
            Automation::SetTarget {
                target: body,
                start: note.onset,
                tau: 0.012,
            },
        )?;

        let filter = voice.add(NodeSpec::filter(FilterMode::LowPass, 200.0, 0.7))?;
        voice.connect(osc, filter)?;
        voice.to_output(filter)
    }
}
