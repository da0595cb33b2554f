//! The shared pattern-driven module.
//!
//! Melodic lines, percussion loops and pads all work the same way: a
//! [`LookaheadScheduler`] walks the mood's patterns, each sounding step may
//! trigger, and a triggered step becomes a voice through the
//! [`VoiceManager`]. Only the [`Timbre`] differs.
//!
//! Mood controls map onto the module like this:
//!
//! | control    | effect                                                    |
//! |------------|-----------------------------------------------------------|
//! | volume     | bus gain = base volume * volume / 100                      |
//! | occurrence | each step sounds with probability occurrence / 100; with  |
//! |            | `minimum_presence` the loudest step always sounds          |
//! | intensity  | timbre brightness and humanize depth                       |

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, trace};

use crate::dsp::oscillator::midi_to_freq;
use crate::engine::event_loop::{ModuleTask, TimerHandle};
use crate::engine::scheduler::{LookaheadScheduler, ScheduledStep};
use crate::error::ModuleError;
use crate::modules::{
    GeneratorModule, Lifecycle, ModuleBus, ModuleContext, ModuleSettings, ModuleStatus, MoodConfig, UpdateFrame,
};
use crate::render::NodeId;
use crate::sequencing::notes::transpose;
use crate::sequencing::Pattern;
use crate::synth::envelope::Envelope;
use crate::synth::factory::{NoteEvent, Timbre};
use crate::synth::manager::VoiceManager;

/// Fade used when `play` brings the bus back up.
const PLAY_FADE_IN: f64 = 0.05;

pub struct PatternModule<T: Timbre> {
    kind: &'static str,
    timbre: T,
    lifecycle: Lifecycle,
    settings: ModuleSettings,
    config: MoodConfig,
    mood: String,
    scheduler: LookaheadScheduler,
    voices: VoiceManager,
    bus: Option<ModuleBus>,
    /// Loudest step per pattern variation
    anchors: Vec<Option<usize>>,
    /// Host-supplied density multiplier, 0..=1
    density: f32,
    rng: StdRng,
    triggered: u64,
}

impl<T: Timbre> PatternModule<T> {
    pub fn new(kind: &'static str, timbre: T, seed: u64) -> Self {
        Self {
            kind,
            timbre,
            lifecycle: Lifecycle::Created,
            settings: ModuleSettings::default(),
            config: MoodConfig::default(),
            mood: String::new(),
            scheduler: LookaheadScheduler::new(Vec::new(), seed),
            voices: VoiceManager::default(),
            bus: None,
            anchors: Vec::new(),
            density: 1.0,
            rng: StdRng::seed_from_u64(seed ^ 0x9e37_79b9_7f4a_7c15),
            triggered: 0,
        }
    }

    /// Steps that actually produced a voice (or tried to).
    pub fn triggered(&self) -> u64 {
        self.triggered
    }

    /// Mood the module was last configured for.
    pub fn mood(&self) -> &str {
        &self.mood
    }

    pub fn scheduler(&self) -> &LookaheadScheduler {
        &self.scheduler
    }

    fn apply(&mut self, ctx: &ModuleContext<'_>, settings: &ModuleSettings, config: MoodConfig) -> Result<(), ModuleError> {
        let patterns = settings.parse_patterns()?;
        self.anchors = patterns.iter().map(Pattern::anchor_index).collect();
        self.scheduler.set_patterns(patterns);

        let fallback = ctx.default_tempo();
        self.scheduler.set_tempo(settings.tempo.unwrap_or(fallback), fallback);
        self.scheduler
            .set_shifts(settings.octave_shifts.iter().map(|o| o * 12).collect());

        let config = config.clamped();
        let humanize_ms = settings.humanize_ms.unwrap_or(ctx.humanize_ms());
        self.scheduler
            .set_humanize(humanize_ms / 1000.0 * config.intensity_unit() as f64);

        self.timbre.configure(settings);
        self.voices.set_max_voices(settings.max_voices);
        self.settings = settings.clone();
        self.config = config;
        Ok(())
    }

    fn wake(&mut self, ctx: &mut ModuleContext<'_>, handle: TimerHandle) -> Result<(), ModuleError> {
        if self.lifecycle != Lifecycle::Playing {
            return Ok(());
        }
        let Some(bus) = self.bus.map(|b| b.node()) else {
            return Err(ModuleError::NotInitialized);
        };

        let Self {
            scheduler,
            voices,
            timbre,
            settings,
            config,
            anchors,
            density,
            rng,
            triggered,
            ..
        } = self;
        let (timbre, settings, config, anchors) = (&*timbre, &*settings, &*config, &*anchors);
        let envelope = settings.envelope.unwrap_or_else(|| timbre.envelope());

        scheduler.tick(ctx, handle, |ctx, step| {
            let anchored = settings.minimum_presence && anchors.get(step.variation).copied().flatten() == Some(step.index);
            let probability = config.probability() * *density;
            let sounds = anchored || probability >= 1.0 || (probability > 0.0 && rng.gen::<f32>() < probability);
            if !sounds {
                trace!(index = step.index, "step skipped");
                return Ok(());
            }
            *triggered += 1;
            let note = note_event(step, settings, config);
            trigger(ctx, voices, bus, timbre, &envelope, note, &settings.chord)
        })
    }
}

fn note_event(step: &ScheduledStep, settings: &ModuleSettings, config: &MoodConfig) -> NoteEvent {
    let note = step
        .step
        .note
        .map(|n| transpose(n, settings.transpose + step.transpose));
    NoteEvent {
        note,
        frequency: note.map_or(0.0, |n| midi_to_freq(n as f32)),
        velocity: step.step.velocity,
        brightness: config.brightness(settings.brightness),
        onset: step.time,
        duration: step.duration * settings.gate.max(0.0),
    }
}

/// One voice per chord tone; a failing tone does not stop the others.
fn trigger(
    ctx: &mut ModuleContext<'_>,
    voices: &mut VoiceManager,
    bus: NodeId,
    timbre: &dyn Timbre,
    envelope: &Envelope,
    note: NoteEvent,
    chord: &[i32],
) -> Result<(), ModuleError> {
    let Some(root) = note.note.filter(|_| !chord.is_empty()) else {
        return voices.create_voice(ctx, bus, timbre, envelope, note).map(|_| ());
    };

    let scale = 1.0 / (chord.len() as f32 + 1.0).sqrt();
    let mut first_error = None;
    for interval in std::iter::once(0).chain(chord.iter().copied()) {
        let tone = transpose(root, interval);
        let event = NoteEvent {
            note: Some(tone),
            frequency: midi_to_freq(tone as f32),
            velocity: note.velocity * scale,
            ..note.clone()
        };
        if let Err(err) = voices.create_voice(ctx, bus, timbre, envelope, event) {
            first_error.get_or_insert(err);
        }
    }
    first_error.map_or(Ok(()), Err)
}

impl<T: Timbre> GeneratorModule for PatternModule<T> {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn init(
        &mut self,
        ctx: &mut ModuleContext<'_>,
        output: NodeId,
        settings: &ModuleSettings,
        mood: &str,
        config: MoodConfig,
    ) -> Result<(), ModuleError> {
        match self.lifecycle {
            Lifecycle::Disposed => return Err(ModuleError::Disposed),
            Lifecycle::Created => {}
            _ => return Err(ModuleError::Failed("already initialized".into())),
        }
        self.apply(ctx, settings, config)?;
        // silent until played
        self.bus = Some(ModuleBus::create(&mut *ctx.renderer, output, 0.0)?);
        self.mood = mood.to_string();
        self.lifecycle = Lifecycle::Ready;
        debug!(kind = self.kind, timbre = self.timbre.name(), mood, "module initialized");
        Ok(())
    }

    fn update(&mut self, _ctx: &mut ModuleContext<'_>, frame: &UpdateFrame<'_>) -> Result<(), ModuleError> {
        self.lifecycle.require_live()?;
        self.density = frame
            .external
            .get("density")
            .copied()
            .unwrap_or(1.0)
            .clamp(0.0, 1.0);
        Ok(())
    }

    fn play(&mut self, ctx: &mut ModuleContext<'_>, start_time: f64) -> Result<(), ModuleError> {
        self.lifecycle.require_live()?;
        if self.lifecycle == Lifecycle::Playing {
            return Ok(());
        }
        let bus = self.bus.ok_or(ModuleError::NotInitialized)?;
        let start = start_time.max(ctx.now());
        bus.ramp(&mut *ctx.renderer, self.config.gain(self.settings.volume), start, PLAY_FADE_IN)?;
        if !self.scheduler.start(ctx, start) {
            debug!(kind = self.kind, "nothing to schedule");
        }
        self.lifecycle = Lifecycle::Playing;
        Ok(())
    }

    fn stop(&mut self, ctx: &mut ModuleContext<'_>, stop_time: f64, fade: f64) -> Result<(), ModuleError> {
        if self.lifecycle != Lifecycle::Playing {
            return Ok(());
        }
        self.scheduler.stop(ctx);
        self.lifecycle = Lifecycle::Stopped;

        let at = stop_time.max(ctx.now());
        if fade > 0.0 {
            self.voices.release_all(ctx, at, Some(fade));
        } else {
            self.voices.teardown_all(ctx);
        }
        if let Some(bus) = self.bus {
            bus.ramp(&mut *ctx.renderer, 0.0, at, fade.max(0.0))?;
        }
        Ok(())
    }

    fn change_mood(
        &mut self,
        ctx: &mut ModuleContext<'_>,
        mood: &str,
        settings: &ModuleSettings,
        transition: f64,
        config: MoodConfig,
    ) -> Result<(), ModuleError> {
        self.lifecycle.require_live()?;
        self.apply(ctx, settings, config)?;
        self.mood = mood.to_string();
        if self.lifecycle == Lifecycle::Playing {
            if let Some(bus) = self.bus {
                let now = ctx.now();
                bus.ramp(&mut *ctx.renderer, self.config.gain(self.settings.volume), now, transition)?;
            }
        }
        Ok(())
    }

    fn on_timer(&mut self, ctx: &mut ModuleContext<'_>, handle: TimerHandle, task: ModuleTask) -> Result<(), ModuleError> {
        match task {
            ModuleTask::SchedulerWake => self.wake(ctx, handle),
            ModuleTask::VoiceCleanup(id) => {
                self.voices.on_cleanup(ctx, handle, id);
                Ok(())
            }
            ModuleTask::Drift | ModuleTask::SourceCleanup => Ok(()),
        }
    }

    fn dispose(&mut self, ctx: &mut ModuleContext<'_>) {
        if self.lifecycle == Lifecycle::Disposed {
            return;
        }
        self.scheduler.stop(ctx);
        self.voices.teardown_all(ctx);
        if let Some(bus) = self.bus.take() {
            bus.release(&mut *ctx.renderer);
        }
        self.lifecycle = Lifecycle::Disposed;
        debug!(kind = self.kind, "module disposed");
    }

    fn status(&self) -> ModuleStatus {
        ModuleStatus {
            playing: self.lifecycle == Lifecycle::Playing,
            voices: self.voices.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::event_loop::{EventLoop, InstanceId, TimerKey};
    use crate::render::{GraphRenderer, NodeSpec, Renderer};
    use crate::voices::Pluck;

    struct Rig {
        renderer: GraphRenderer,
        timers: EventLoop,
        config: EngineConfig,
        mix: NodeId,
    }

    impl Rig {
        fn new() -> Self {
            let mut renderer = GraphRenderer::new(8_000.0);
            let mix = renderer.create_node(NodeSpec::gain(1.0)).unwrap();
            renderer.connect(mix, renderer.destination()).unwrap();
            Self {
                renderer,
                timers: EventLoop::new().with_jitter(10.0, 4),
                config: EngineConfig::default(),
                mix,
            }
        }

        fn ctx(&mut self) -> ModuleContext<'_> {
            ModuleContext::new(&mut self.renderer, &mut self.timers, InstanceId(1), &self.config)
        }

        fn run(&mut self, module: &mut dyn GeneratorModule, seconds: f64) {
            let end = self.renderer.current_time() + seconds;
            while self.renderer.current_time() < end {
                self.renderer.advance(0.005);
                self.timers.advance_to(self.renderer.current_time() * 1000.0);
                while let Some((handle, key)) = self.timers.pop_due() {
                    if let TimerKey::Module { task, .. } = key {
                        let mut ctx = self.ctx();
                        module.on_timer(&mut ctx, handle, task).unwrap();
                    }
                }
            }
        }
    }

    fn settings(patterns: &[&str]) -> ModuleSettings {
        ModuleSettings {
            volume: 0.8,
            tempo: Some(120.0),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            step: crate::sequencing::Duration::EIGHTH,
            ..ModuleSettings::default()
        }
    }

    fn module() -> PatternModule<Pluck> {
        PatternModule::new("pluck", Pluck::default(), 21)
    }

    #[test]
    fn full_occurrence_plays_every_step() {
        let mut rig = Rig::new();
        let mut m = module();
        let mix = rig.mix;
        m.init(&mut rig.ctx(), mix, &settings(&["C4 E4 _ G4"]), "calm", MoodConfig::new(100.0, 100.0, 50.0))
            .unwrap();
        m.play(&mut rig.ctx(), 0.0).unwrap();
        // two loops of four eighths at 120 BPM, minus a hair so the next loop does not start
        rig.run(&mut m, 1.98);
        assert_eq!(m.triggered(), 6);
    }

    #[test]
    fn zero_occurrence_keeps_the_anchor() {
        let mut rig = Rig::new();
        let mut m = module();
        let mix = rig.mix;
        m.init(
            &mut rig.ctx(),
            mix,
            &settings(&["C4:0.5 E4:0.9 _ G4:0.9"]),
            "calm",
            MoodConfig::new(100.0, 0.0, 50.0),
        )
        .unwrap();
        m.play(&mut rig.ctx(), 0.0).unwrap();
        rig.run(&mut m, 1.98);
        assert_eq!(m.triggered(), 2, "only the loudest step of each loop");
    }

    #[test]
    fn zero_occurrence_without_presence_is_silent() {
        let mut rig = Rig::new();
        let mut m = module();
        let mix = rig.mix;
        let mut s = settings(&["C4 E4 G4 C5"]);
        s.minimum_presence = false;
        m.init(&mut rig.ctx(), mix, &s, "calm", MoodConfig::new(100.0, 0.0, 50.0))
            .unwrap();
        m.play(&mut rig.ctx(), 0.0).unwrap();
        rig.run(&mut m, 2.0);
        assert_eq!(m.triggered(), 0);
    }

    #[test]
    fn stop_releases_everything_and_is_idempotent() {
        let mut rig = Rig::new();
        let mut m = module();
        let mix = rig.mix;
        m.init(&mut rig.ctx(), mix, &settings(&["C4 E4 G4 C5"]), "calm", MoodConfig::default())
            .unwrap();
        m.play(&mut rig.ctx(), 0.0).unwrap();
        rig.run(&mut m, 1.0);
        assert!(m.status().voices > 0);

        let now = rig.renderer.current_time();
        m.stop(&mut rig.ctx(), now, 0.5).unwrap();
        m.stop(&mut rig.ctx(), now, 0.5).unwrap();
        assert!(!m.status().playing);

        rig.run(&mut m, 0.5 + 0.3);
        assert_eq!(m.status().voices, 0);
        assert_eq!(rig.timers.pending(), 0);
        // mix and module bus
        assert_eq!(rig.renderer.live_node_count(), 2);

        m.dispose(&mut rig.ctx());
        m.dispose(&mut rig.ctx());
        assert_eq!(rig.renderer.live_node_count(), 1);
    }

    #[test]
    fn dispose_while_playing_leaves_nothing() {
        let mut rig = Rig::new();
        let mut m = module();
        let mix = rig.mix;
        m.init(&mut rig.ctx(), mix, &settings(&["C4 E4 G4 C5"]), "calm", MoodConfig::default())
            .unwrap();
        m.play(&mut rig.ctx(), 0.0).unwrap();
        rig.run(&mut m, 0.7);

        m.dispose(&mut rig.ctx());
        assert_eq!(rig.timers.pending(), 0);
        assert_eq!(rig.renderer.live_node_count(), 1);
        assert_eq!(m.play(&mut rig.ctx(), 1.0), Err(ModuleError::Disposed));
    }

    #[test]
    fn calls_before_init_fail() {
        let mut rig = Rig::new();
        let mut m = module();
        assert_eq!(m.play(&mut rig.ctx(), 0.0), Err(ModuleError::NotInitialized));
        // stop on a module that never played is a no-op
        assert!(m.stop(&mut rig.ctx(), 0.0, 1.0).is_ok());
    }

    #[test]
    fn bad_pattern_fails_init_without_leaking() {
        let mut rig = Rig::new();
        let mut m = module();
        let mix = rig.mix;
        let result = m.init(&mut rig.ctx(), mix, &settings(&["C4 [E4"]), "calm", MoodConfig::default());
        assert!(matches!(result, Err(ModuleError::Pattern(_))));
        assert_eq!(rig.renderer.live_node_count(), 1);
    }

    #[test]
    fn chords_create_one_voice_per_tone() {
        let mut rig = Rig::new();
        let mut m = module();
        let mix = rig.mix;
        let mut s = settings(&["C4 _ _ _"]);
        s.chord = vec![4, 7];
        m.init(&mut rig.ctx(), mix, &s, "calm", MoodConfig::default()).unwrap();
        m.play(&mut rig.ctx(), 0.0).unwrap();
        rig.run(&mut m, 0.1);
        assert_eq!(m.status().voices, 3);
    }
}
