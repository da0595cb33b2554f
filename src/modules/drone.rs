//! Drone module - a continuous bed with no pattern.
//!
//! A stack of oscillators on the root, its fifth and its octaves runs
//! through one low-pass filter whose cutoff slowly wanders. Occurrence decides
//! how many layers sound, intensity how open the filter is.
//!
//! Layers are real sources that run until the module stops, so unlike pattern
//! voices they are started and stopped explicitly:
//!
//!   play ──→ layers start, bus fades in
//!   stop ──→ bus fades out, sources stop after the fade,
//!            nodes freed by a SourceCleanup timer
//!   change_mood ──→ old layers fade out and are queued for cleanup,
//!                   new layers fade in
//!
//! The drift timer re-targets the cutoff every `drift_seconds`.

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, trace, warn};

use crate::dsp::{
    filter::FilterMode,
    oscillator::{midi_to_freq, Waveform},
};
use crate::engine::event_loop::{ModuleTask, TimerHandle};
use crate::error::{ModuleError, RenderError};
use crate::modules::{
    GeneratorModule, Lifecycle, ModuleBus, ModuleContext, ModuleSettings, ModuleStatus, MoodConfig, UpdateFrame,
};
use crate::render::{Automation, NodeId, NodeSpec, Param, Renderer};
use crate::sequencing::notes::{parse_note, transpose};
use crate::synth::voice::release_nodes;

/// Semitones above the root, in the order layers are added.
const INTERVALS: [i32; 6] = [0, 7, 12, 19, 24, -12];

const FADE_IN: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layer {
    osc: NodeId,
    gain: NodeId,
}

/// What the current layers were built from; a change means rebuilding them.
#[derive(Debug, Clone, PartialEq)]
struct Voicing {
    root: u8,
    count: usize,
    waveform: Waveform,
    detune_cents: u32,
}

pub struct DroneModule {
    lifecycle: Lifecycle,
    settings: ModuleSettings,
    config: MoodConfig,
    bus: Option<ModuleBus>,
    filter: Option<NodeId>,
    layers: Vec<Layer>,
    voicing: Option<Voicing>,
    drift: Option<TimerHandle>,
    /// Nodes of stopped layers waiting for their sources to end.
    retired: Vec<NodeId>,
    cleanup: Option<(TimerHandle, f64)>,
    rng: StdRng,
}

impl DroneModule {
    pub fn new(seed: u64) -> Self {
        Self {
            lifecycle: Lifecycle::Created,
            settings: ModuleSettings::default(),
            config: MoodConfig::default(),
            bus: None,
            filter: None,
            layers: Vec::new(),
            voicing: None,
            drift: None,
            retired: Vec::new(),
            cleanup: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn voicing(&self) -> Result<Voicing, ModuleError> {
        let root = parse_note(&self.settings.root)
            .ok_or_else(|| ModuleError::Failed(format!("invalid drone root '{}'", self.settings.root)))?;
        let extra = self.settings.layers.saturating_sub(1) as f32 * self.config.probability();
        Ok(Voicing {
            root,
            count: (1 + extra.round() as usize).min(INTERVALS.len()),
            waveform: self.settings.waveform.unwrap_or(Waveform::Saw),
            detune_cents: self.settings.detune_cents.max(0.0).round() as u32,
        })
    }

    fn cutoff(&self) -> f32 {
        200.0 + 2800.0 * self.config.brightness(self.settings.brightness)
    }

    /// Build and start layers from `at`, fading each in over `fade`.
    fn start_layers(&mut self, renderer: &mut dyn Renderer, voicing: &Voicing, at: f64, fade: f64) -> Result<(), RenderError> {
        let filter = self
            .filter
            .ok_or_else(|| RenderError::Graph("drone filter missing".into()))?;
        let level = 1.0 / (voicing.count as f32).sqrt();

        for (i, &interval) in INTERVALS.iter().take(voicing.count).enumerate() {
            let note = transpose(voicing.root, interval);
            let sign = if i % 2 == 0 { 0.5 } else { -0.5 };
            let detune = sign * voicing.detune_cents as f32;
            // higher layers sit further back
            let target = level / (1.0 + 0.4 * i as f32);

            let osc = renderer.create_node(NodeSpec::Oscillator {
                waveform: voicing.waveform,
                frequency: midi_to_freq(note as f32),
                detune_cents: detune,
            })?;
            let gain = match renderer.create_node(NodeSpec::gain(0.0)) {
                Ok(gain) => gain,
                Err(err) => {
                    release_nodes(renderer, &[osc]);
                    return Err(err);
                }
            };
            // tracked from here on so a failure below is cleaned up by the caller
            self.layers.push(Layer { osc, gain });

            renderer.connect(osc, gain)?;
            renderer.connect(gain, filter)?;
            renderer.automate(gain, Param::Gain, Automation::SetValue { value: 0.0, at })?;
            renderer.automate(gain, Param::Gain, Automation::LinearRamp { value: target, end: at + fade.max(0.01) })?;
            renderer.start(osc, at)?;
        }
        Ok(())
    }

    /// Fade the current layers out from `at` and queue them for cleanup.
    fn retire_layers(&mut self, ctx: &mut ModuleContext<'_>, at: f64, fade: f64) {
        if self.layers.is_empty() {
            return;
        }
        let end = at + fade.max(0.0);
        let sources_end = end + ctx.safety_margin();
        for layer in std::mem::take(&mut self.layers) {
            let renderer = &mut *ctx.renderer;
            let faded = renderer
                .automate(layer.gain, Param::Gain, Automation::CancelAndHold { at })
                .and_then(|()| renderer.automate(layer.gain, Param::Gain, Automation::LinearRamp { value: 0.0, end }))
                .and_then(|()| renderer.stop(layer.osc, sources_end));
            if let Err(err) = faded {
                trace!(%err, "drone layer fade failed");
            }
            self.retired.extend([layer.osc, layer.gain]);
        }
        self.schedule_cleanup(ctx, sources_end);
    }

    fn schedule_cleanup(&mut self, ctx: &mut ModuleContext<'_>, sources_end: f64) {
        let due = sources_end + ctx.safety_margin();
        if let Some((handle, pending_due)) = self.cleanup {
            if pending_due >= due {
                return;
            }
            ctx.cancel(handle);
        }
        let handle = ctx.arm((due - ctx.now()).max(0.0), ModuleTask::SourceCleanup);
        self.cleanup = Some((handle, due));
    }

    fn arm_drift(&mut self, ctx: &mut ModuleContext<'_>) {
        if let Some(handle) = self.drift.take() {
            ctx.cancel(handle);
        }
        if self.settings.drift_seconds > 0.0 {
            self.drift = Some(ctx.arm(self.settings.drift_seconds, ModuleTask::Drift));
        }
    }

    fn wander(&mut self, ctx: &mut ModuleContext<'_>) -> Result<(), ModuleError> {
        let Some(filter) = self.filter else {
            return Ok(());
        };
        let spread = 0.2 + 0.3 * self.config.intensity_unit();
        let target = self.cutoff() * self.rng.gen_range(1.0 - spread..=1.0 + spread);
        let now = ctx.now();
        ctx.renderer.automate(filter, Param::Cutoff, Automation::CancelAndHold { at: now })?;
        ctx.renderer.automate(
            filter,
            Param::Cutoff,
            Automation::SetTarget {
                target,
                start: now,
                tau: self.settings.drift_seconds / 3.0,
            },
        )?;
        trace!(target, "drone drift");
        self.arm_drift(ctx);
        Ok(())
    }

    fn free_retired(&mut self, renderer: &mut dyn Renderer) {
        let retired = std::mem::take(&mut self.retired);
        release_nodes(renderer, &retired);
    }
}

impl GeneratorModule for DroneModule {
    fn kind(&self) -> &'static str {
        "drone"
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
        self.settings = settings.clone();
        self.config = config.clamped();
        // validate before touching the graph
        self.voicing()?;

        let bus = ModuleBus::create(&mut *ctx.renderer, output, 0.0)?;
        let filter = match ctx
            .renderer
            .create_node(NodeSpec::filter(FilterMode::LowPass, self.cutoff(), 0.5))
        {
            Ok(filter) => filter,
            Err(err) => {
                bus.release(&mut *ctx.renderer);
                return Err(err.into());
            }
        };
        if let Err(err) = ctx.renderer.connect(filter, bus.node()) {
            release_nodes(&mut *ctx.renderer, &[filter]);
            bus.release(&mut *ctx.renderer);
            return Err(err.into());
        }
        self.bus = Some(bus);
        self.filter = Some(filter);
        self.lifecycle = Lifecycle::Ready;
        debug!(mood, root = %self.settings.root, "drone initialized");
        Ok(())
    }

    fn update(&mut self, _ctx: &mut ModuleContext<'_>, _frame: &UpdateFrame<'_>) -> Result<(), ModuleError> {
        self.lifecycle.require_live()
    }

    fn play(&mut self, ctx: &mut ModuleContext<'_>, start_time: f64) -> Result<(), ModuleError> {
        self.lifecycle.require_live()?;
        if self.lifecycle == Lifecycle::Playing {
            return Ok(());
        }
        let bus = self.bus.ok_or(ModuleError::NotInitialized)?;
        let start = start_time.max(ctx.now());
        let voicing = self.voicing()?;

        if let Err(err) = self.start_layers(&mut *ctx.renderer, &voicing, start, FADE_IN) {
            self.retire_layers(ctx, start, 0.0);
            return Err(err.into());
        }
        bus.ramp(&mut *ctx.renderer, self.config.gain(self.settings.volume), start, FADE_IN)?;
        self.voicing = Some(voicing);
        self.arm_drift(ctx);
        self.lifecycle = Lifecycle::Playing;
        Ok(())
    }

    fn stop(&mut self, ctx: &mut ModuleContext<'_>, stop_time: f64, fade: f64) -> Result<(), ModuleError> {
        if self.lifecycle != Lifecycle::Playing {
            return Ok(());
        }
        self.lifecycle = Lifecycle::Stopped;
        if let Some(handle) = self.drift.take() {
            ctx.cancel(handle);
        }
        let at = stop_time.max(ctx.now());
        self.retire_layers(ctx, at, fade);
        self.voicing = None;
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
        let previous = (self.settings.clone(), self.config);
        self.settings = settings.clone();
        self.config = config.clamped();
        let voicing = match self.voicing() {
            Ok(voicing) => voicing,
            Err(err) => {
                (self.settings, self.config) = previous;
                return Err(err);
            }
        };
        debug!(mood, layers = voicing.count, "drone mood change");

        let now = ctx.now();
        if let Some(filter) = self.filter {
            ctx.renderer.automate(filter, Param::Cutoff, Automation::CancelAndHold { at: now })?;
            ctx.renderer.automate(
                filter,
                Param::Cutoff,
                Automation::LinearRamp {
                    value: self.cutoff(),
                    end: now + transition.max(0.0),
                },
            )?;
        }
        if self.lifecycle != Lifecycle::Playing {
            return Ok(());
        }
        if let Some(bus) = self.bus {
            bus.ramp(&mut *ctx.renderer, self.config.gain(self.settings.volume), now, transition)?;
        }
        if self.voicing.as_ref() != Some(&voicing) {
            self.retire_layers(ctx, now, transition);
            if let Err(err) = self.start_layers(&mut *ctx.renderer, &voicing, now, transition) {
                self.retire_layers(ctx, now, 0.0);
                self.voicing = None;
                return Err(err.into());
            }
            self.voicing = Some(voicing);
        }
        self.arm_drift(ctx);
        Ok(())
    }

    fn on_timer(&mut self, ctx: &mut ModuleContext<'_>, handle: TimerHandle, task: ModuleTask) -> Result<(), ModuleError> {
        match task {
            ModuleTask::Drift if self.drift == Some(handle) => {
                self.drift = None;
                if self.lifecycle == Lifecycle::Playing {
                    self.wander(ctx)?;
                }
            }
            ModuleTask::SourceCleanup if self.cleanup.map(|(h, _)| h) == Some(handle) => {
                self.cleanup = None;
                self.free_retired(&mut *ctx.renderer);
            }
            _ => trace!(?task, "stale drone timer"),
        }
        Ok(())
    }

    fn dispose(&mut self, ctx: &mut ModuleContext<'_>) {
        if self.lifecycle == Lifecycle::Disposed {
            return;
        }
        if let Some(handle) = self.drift.take() {
            ctx.cancel(handle);
        }
        if let Some((handle, _)) = self.cleanup.take() {
            ctx.cancel(handle);
        }
        let now = ctx.now();
        for layer in std::mem::take(&mut self.layers) {
            if let Err(err) = ctx.renderer.stop(layer.osc, now) {
                warn!(%err, "drone source stop failed");
            }
            self.retired.extend([layer.osc, layer.gain]);
        }
        self.free_retired(&mut *ctx.renderer);
        if let Some(filter) = self.filter.take() {
            release_nodes(&mut *ctx.renderer, &[filter]);
        }
        if let Some(bus) = self.bus.take() {
            bus.release(&mut *ctx.renderer);
        }
        self.voicing = None;
        self.lifecycle = Lifecycle::Disposed;
    }

    fn status(&self) -> ModuleStatus {
        ModuleStatus {
            playing: self.lifecycle == Lifecycle::Playing,
            voices: self.layers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::event_loop::{EventLoop, InstanceId, TimerKey};
    use crate::render::GraphRenderer;

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
                timers: EventLoop::new(),
                config: EngineConfig::default(),
                mix,
            }
        }

        fn ctx(&mut self) -> ModuleContext<'_> {
            ModuleContext::new(&mut self.renderer, &mut self.timers, InstanceId(9), &self.config)
        }

        fn run(&mut self, module: &mut DroneModule, seconds: f64) {
            let end = self.renderer.current_time() + seconds;
            while self.renderer.current_time() < end {
                self.renderer.advance(0.01);
                self.timers.advance_to(self.renderer.current_time() * 1000.0);
                while let Some((handle, TimerKey::Module { task, .. })) = self.timers.pop_due() {
                    let mut ctx = self.ctx();
                    module.on_timer(&mut ctx, handle, task).unwrap();
                }
            }
        }
    }

    fn settings() -> ModuleSettings {
        ModuleSettings {
            root: "D2".into(),
            layers: 5,
            drift_seconds: 1.0,
            ..ModuleSettings::default()
        }
    }

    fn started(config: MoodConfig) -> (Rig, DroneModule) {
        let mut rig = Rig::new();
        let mut drone = DroneModule::new(3);
        let mix = rig.mix;
        drone.init(&mut rig.ctx(), mix, &settings(), "night", config).unwrap();
        drone.play(&mut rig.ctx(), 0.0).unwrap();
        (rig, drone)
    }

    #[test]
    fn occurrence_sets_layer_count() {
        let (_, full) = started(MoodConfig::new(100.0, 100.0, 50.0));
        assert_eq!(full.status().voices, 5);
        let (_, sparse) = started(MoodConfig::new(100.0, 0.0, 50.0));
        assert_eq!(sparse.status().voices, 1);
        let (_, half) = started(MoodConfig::new(100.0, 50.0, 50.0));
        assert_eq!(half.status().voices, 3);
    }

    #[test]
    fn drift_keeps_rearming_while_playing() {
        let (mut rig, mut drone) = started(MoodConfig::default());
        rig.run(&mut drone, 3.5);
        assert_eq!(rig.timers.pending(), 1, "exactly one drift timer pending");
    }

    #[test]
    fn stop_frees_layers_after_the_fade() {
        let (mut rig, mut drone) = started(MoodConfig::default());
        rig.run(&mut drone, 1.0);
        // mix, bus, filter, 5 layers of 2 nodes
        assert_eq!(rig.renderer.live_node_count(), 13);

        let now = rig.renderer.current_time();
        drone.stop(&mut rig.ctx(), now, 1.0).unwrap();
        drone.stop(&mut rig.ctx(), now, 1.0).unwrap();
        assert_eq!(drone.status(), ModuleStatus { playing: false, voices: 0 });

        rig.run(&mut drone, 1.5);
        assert_eq!(rig.renderer.live_node_count(), 3);
        assert_eq!(rig.timers.pending(), 0);
    }

    #[test]
    fn mood_change_crossfades_to_a_new_voicing() {
        let (mut rig, mut drone) = started(MoodConfig::new(100.0, 100.0, 50.0));
        let mut next = settings();
        next.root = "A1".into();
        drone
            .change_mood(&mut rig.ctx(), "dawn", &next, 2.0, MoodConfig::new(100.0, 0.0, 50.0))
            .unwrap();
        assert_eq!(drone.status().voices, 1);

        rig.run(&mut drone, 2.5);
        // mix, bus, filter, one layer
        assert_eq!(rig.renderer.live_node_count(), 5);
    }

    #[test]
    fn bad_root_is_rejected_and_keeps_the_old_settings() {
        let (mut rig, mut drone) = started(MoodConfig::default());
        let mut bad = settings();
        bad.root = "H7".into();
        assert!(drone
            .change_mood(&mut rig.ctx(), "odd", &bad, 1.0, MoodConfig::default())
            .is_err());
        assert_eq!(drone.status().voices, 5);
    }

    #[test]
    fn dispose_is_complete_and_idempotent() {
        let (mut rig, mut drone) = started(MoodConfig::default());
        rig.run(&mut drone, 0.5);
        let now = rig.renderer.current_time();
        drone.stop(&mut rig.ctx(), now, 2.0).unwrap();

        drone.dispose(&mut rig.ctx());
        drone.dispose(&mut rig.ctx());
        assert_eq!(rig.renderer.live_node_count(), 1);
        assert_eq!(rig.timers.pending(), 0);
    }
}
