//! Generator modules.
//!
//! A module is one independent producer in the mix: a melodic line, a
//! percussion loop, a pad, a drone. The orchestrator only ever talks to it
//! through [`GeneratorModule`], and every call gets a [`ModuleContext`] that
//! carries the renderer and timers scoped to that module's instance.
//!
//! Pattern-driven modules all share one implementation, [`PatternModule`],
//! parameterised by a [`Timbre`](crate::synth::factory::Timbre). Textures that
//! have no pattern implement the trait directly, like [`DroneModule`].

pub mod drone;
pub mod pattern_module;

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::config::EngineConfig;
use crate::dsp::oscillator::Waveform;
use crate::engine::event_loop::{EventLoop, InstanceId, ModuleTask, TimerHandle, TimerKey};
use crate::error::{ModuleError, PatternError, RenderError};
use crate::render::{Automation, NodeId, NodeSpec, Param, Renderer};
use crate::sequencing::{Duration, Pattern};
use crate::synth::envelope::Envelope;
use crate::synth::voice::release_nodes;

pub use drone::DroneModule;
pub use pattern_module::PatternModule;

/// Free-form named parameters supplied by the host each update.
pub type ParamMap = BTreeMap<String, f32>;

/// Normalised mood controls, each 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MoodConfig {
    /// Output level relative to the mood's base volume
    pub volume: f32,
    /// Density: how likely each step is to sound
    pub occurrence: f32,
    /// Brightness, modulation depth and looseness
    pub intensity: f32,
}

impl MoodConfig {
    pub const fn new(volume: f32, occurrence: f32, intensity: f32) -> Self {
        Self {
            volume,
            occurrence,
            intensity,
        }
    }

    pub fn clamped(self) -> Self {
        Self {
            volume: self.volume.clamp(0.0, 100.0),
            occurrence: self.occurrence.clamp(0.0, 100.0),
            intensity: self.intensity.clamp(0.0, 100.0),
        }
    }

    /// Bus gain for a module whose full-volume level is `base`.
    pub fn gain(&self, base: f32) -> f32 {
        base * self.volume.clamp(0.0, 100.0) / 100.0
    }

    /// Chance that a step sounds.
    pub fn probability(&self) -> f32 {
        self.occurrence.clamp(0.0, 100.0) / 100.0
    }

    /// Intensity as 0..=1.
    pub fn intensity_unit(&self) -> f32 {
        self.intensity.clamp(0.0, 100.0) / 100.0
    }

    /// Brightness for a timbre whose base brightness is `base`. Intensity 50
    /// leaves it unchanged.
    pub fn brightness(&self, base: f32) -> f32 {
        (base * (0.5 + self.intensity_unit())).clamp(0.0, 1.0)
    }
}

impl Default for MoodConfig {
    fn default() -> Self {
        Self::new(100.0, 100.0, 50.0)
    }
}

/// Per-module settings as written in a mood. Every module kind reads the
/// fields it understands and ignores the rest.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModuleSettings {
    /// Bus level at volume 100
    pub volume: f32,
    /// Tempo in BPM; the mood's tempo when absent
    pub tempo: Option<f64>,
    /// Pattern variations in text form; one is picked at each loop
    pub patterns: Vec<String>,
    /// Length of one top-level pattern slot
    pub step: Duration,
    /// Transposition in semitones
    pub transpose: i32,
    /// Octave shifts to pick from at each loop
    pub octave_shifts: Vec<i32>,
    /// Always play the loudest step, even at occurrence 0
    pub minimum_presence: bool,
    /// Note length as a fraction of the step
    pub gate: f64,
    pub envelope: Option<Envelope>,
    /// 0..=1 at intensity 50
    pub brightness: f32,
    pub humanize_ms: Option<f64>,
    pub waveform: Option<Waveform>,
    pub detune_cents: f32,
    /// Chord intervals in semitones above each note
    pub chord: Vec<i32>,
    pub max_voices: usize,
    /// Drone root note name
    pub root: String,
    /// Drone layers at occurrence 100
    pub layers: usize,
    /// Seconds between drone filter drifts
    pub drift_seconds: f64,
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            volume: 0.5,
            tempo: None,
            patterns: Vec::new(),
            step: Duration::QUARTER,
            transpose: 0,
            octave_shifts: Vec::new(),
            minimum_presence: true,
            gate: 1.0,
            envelope: None,
            brightness: 0.5,
            humanize_ms: None,
            waveform: None,
            detune_cents: 8.0,
            chord: Vec::new(),
            max_voices: 16,
            root: "C3".into(),
            layers: 3,
            drift_seconds: 8.0,
        }
    }
}

impl ModuleSettings {
    pub fn parse_patterns(&self) -> Result<Vec<Pattern>, PatternError> {
        self.patterns
            .iter()
            .map(|text| Pattern::parse(text, self.step))
            .collect()
    }
}

/// Values the orchestrator derives each update.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DerivedParams {
    /// RMS of the analysis tap
    pub output_level: f32,
    /// Seconds since the last mood change
    pub since_mood_change: f64,
}

/// Arguments of one `update` call.
#[derive(Debug, Clone, Copy)]
pub struct UpdateFrame<'a> {
    /// Seconds since playback started
    pub elapsed: f64,
    pub mood: &'a str,
    pub external: &'a ParamMap,
    pub derived: &'a DerivedParams,
    /// Seconds since the previous update
    pub delta: f64,
}

/// What the orchestrator reports about a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModuleStatus {
    pub playing: bool,
    pub voices: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Ready,
    Playing,
    Stopped,
    Disposed,
}

impl Lifecycle {
    /// Error for calls that need an initialized, live module.
    pub fn require_live(self) -> Result<(), ModuleError> {
        match self {
            Lifecycle::Created => Err(ModuleError::NotInitialized),
            Lifecycle::Disposed => Err(ModuleError::Disposed),
            _ => Ok(()),
        }
    }
}

/// Everything a module call may touch: the renderer, its own timers, and the
/// engine timing constants.
pub struct ModuleContext<'a> {
    pub renderer: &'a mut dyn Renderer,
    timers: &'a mut EventLoop,
    instance: InstanceId,
    lookahead: f64,
    safety_margin: f64,
    default_tempo: f64,
    humanize_ms: f64,
}

impl<'a> ModuleContext<'a> {
    pub fn new(
        renderer: &'a mut dyn Renderer,
        timers: &'a mut EventLoop,
        instance: InstanceId,
        config: &EngineConfig,
    ) -> Self {
        Self {
            renderer,
            timers,
            instance,
            lookahead: config.lookahead(),
            safety_margin: config.voice_safety_margin,
            default_tempo: config.default_tempo,
            humanize_ms: config.humanize_ms,
        }
    }

    /// Renderer clock, in seconds.
    pub fn now(&self) -> f64 {
        self.renderer.current_time()
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn lookahead(&self) -> f64 {
        self.lookahead
    }

    pub fn safety_margin(&self) -> f64 {
        self.safety_margin
    }

    pub fn default_tempo(&self) -> f64 {
        self.default_tempo
    }

    pub fn humanize_ms(&self) -> f64 {
        self.humanize_ms
    }

    /// Wake this module `delay` seconds from now.
    pub fn arm(&mut self, delay: f64, task: ModuleTask) -> TimerHandle {
        self.timers.arm(
            delay * 1000.0,
            TimerKey::Module {
                instance: self.instance,
                task,
            },
        )
    }

    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.timers.cancel(handle)
    }
}

/// A module's output gain, connected into the orchestrator's mix point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleBus {
    node: NodeId,
}

impl ModuleBus {
    pub fn create(renderer: &mut dyn Renderer, output: NodeId, gain: f32) -> Result<Self, RenderError> {
        let node = renderer.create_node(NodeSpec::gain(gain))?;
        if let Err(err) = renderer.connect(node, output) {
            release_nodes(renderer, &[node]);
            return Err(err);
        }
        Ok(Self { node })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Move to `gain` starting at `at`, linearly over `time` seconds.
    pub fn ramp(&self, renderer: &mut dyn Renderer, gain: f32, at: f64, time: f64) -> Result<(), RenderError> {
        renderer.automate(self.node, Param::Gain, Automation::CancelAndHold { at })?;
        if time > 0.0 {
            renderer.automate(self.node, Param::Gain, Automation::LinearRamp { value: gain, end: at + time })
        } else {
            renderer.automate(self.node, Param::Gain, Automation::SetValue { value: gain, at })
        }
    }

    pub fn release(self, renderer: &mut dyn Renderer) {
        // a closed or replaced renderer already dropped the node
        release_nodes(renderer, &[self.node]);
    }
}

/// The contract between the orchestrator and a sound-producing module.
///
/// Times are seconds on the renderer clock. `stop` and `dispose` must be
/// idempotent, and `dispose` must leave no timers or nodes behind.
pub trait GeneratorModule: Send {
    fn kind(&self) -> &'static str;

    /// Build the module's graph into `output`.
    fn init(
        &mut self,
        ctx: &mut ModuleContext<'_>,
        output: NodeId,
        settings: &ModuleSettings,
        mood: &str,
        config: MoodConfig,
    ) -> Result<(), ModuleError>;

    fn update(&mut self, ctx: &mut ModuleContext<'_>, frame: &UpdateFrame<'_>) -> Result<(), ModuleError>;

    fn play(&mut self, ctx: &mut ModuleContext<'_>, start_time: f64) -> Result<(), ModuleError>;

    fn stop(&mut self, ctx: &mut ModuleContext<'_>, stop_time: f64, fade: f64) -> Result<(), ModuleError>;

    /// Move to new settings in place over `transition` seconds.
    fn change_mood(
        &mut self,
        ctx: &mut ModuleContext<'_>,
        mood: &str,
        settings: &ModuleSettings,
        transition: f64,
        config: MoodConfig,
    ) -> Result<(), ModuleError>;

    /// A timer this module armed is due.
    fn on_timer(&mut self, ctx: &mut ModuleContext<'_>, handle: TimerHandle, task: ModuleTask) -> Result<(), ModuleError>;

    fn dispose(&mut self, ctx: &mut ModuleContext<'_>);

    fn status(&self) -> ModuleStatus;
}
