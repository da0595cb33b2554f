use crate::error::RenderError;
use crate::modules::ModuleSettings;
use crate::synth::envelope::Envelope;
use crate::synth::voice::VoiceBuilder;

/// What one triggered step asks a timbre to play.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteEvent {
    /// MIDI note, `None` for unpitched hits
    pub note: Option<u8>,
    /// Hz; for unpitched hits this is the timbre's own tuning
    pub frequency: f32,
    /// 0..=1
    pub velocity: f32,
    /// 0..=1, from the mood's intensity
    pub brightness: f32,
    /// Effective onset on the renderer clock
    pub onset: f64,
    /// Note length in seconds
    pub duration: f64,
}

/// The synthesis recipe for one kind of voice.
///
/// This is the instrument design layer: a timbre only describes the graph of
/// a single voice. Scheduling, envelopes, and teardown are handled by the
/// module and the [`VoiceManager`](crate::synth::manager::VoiceManager).
pub trait Timbre: Send {
    fn name(&self) -> &'static str;

    /// Amplitude envelope used when the mood does not override it.
    fn envelope(&self) -> Envelope;

    /// Gain at full velocity.
    fn level(&self) -> f32 {
        0.5
    }

    /// Pick up module settings (waveform choice, detune, chord shape...).
    fn configure(&mut self, _settings: &ModuleSettings) {}

    /// Create this voice's nodes and route them into `voice.to_output`.
    fn build(&self, voice: &mut VoiceBuilder<'_>, note: &NoteEvent) -> Result<(), RenderError>;
}

impl<T: Timbre + ?Sized> Timbre for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn envelope(&self) -> Envelope {
        (**self).envelope()
    }

    fn level(&self) -> f32 {
        (**self).level()
    }

    fn configure(&mut self, settings: &ModuleSettings) {
        (**self).configure(settings)
    }

    fn build(&self, voice: &mut VoiceBuilder<'_>, note: &NoteEvent) -> Result<(), RenderError> {
        (**self).build(voice, note)
    }
}
