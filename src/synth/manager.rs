/*
Voice Lifecycle
===============

Every voice goes through the same life, and the manager owns all of it:

  create ──→ Active ──────────────(natural end)──────────────→ cleanup
                │                                                 ↑
                └──release_all──→ Releasing ──(release done)──────┘

  teardown_all: any state ──→ gone, synchronously

Creation
  The intended onset has usually just passed by the time the wake-up timer
  ran, so every stage is written relative to the effective onset:

      onset = max(intended + lookahead, now)

  The whole envelope, the source start, and the source stop are written as
  automation up front. Nothing has to happen on the control side at the
  moment the sound starts or ends.

Cleanup
  Sources stop at `release start + release + margin`. A cleanup timer fires
  one margin after that, measured from now, and frees the voice's nodes.
  Removal from the map is the single point that decides cleanup happens, so
  it runs exactly once whichever path gets there first.

Failure
  If wiring fails part way, the nodes created so far are freed and the voice
  never enters the map.
*/

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use crate::engine::event_loop::{ModuleTask, TimerHandle};
use crate::error::{ModuleError, RenderError};
use crate::modules::ModuleContext;
use crate::render::{NodeId, NodeSpec, Param};
use crate::synth::envelope::{Envelope, FLOOR};
use crate::synth::factory::{NoteEvent, Timbre};
use crate::synth::voice::{release_nodes, Voice, VoiceBuilder, VoiceId, VoiceState};

/// Release used when a voice is stolen to make room for a new one.
const STEAL_RELEASE: f64 = 0.05;

pub struct VoiceManager {
    voices: BTreeMap<VoiceId, Voice>,
    next_id: u64,
    max_voices: usize,
}

impl VoiceManager {
    pub fn new(max_voices: usize) -> Self {
        Self {
            voices: BTreeMap::new(),
            next_id: 0,
            max_voices: max_voices.max(1),
        }
    }

    pub fn set_max_voices(&mut self, max_voices: usize) {
        self.max_voices = max_voices.max(1);
    }

    /// Realize one voice of `timbre` into `bus`.
    ///
    /// `note.onset` is the intended onset; the voice starts at the effective
    /// onset described above.
    pub fn create_voice(
        &mut self,
        ctx: &mut ModuleContext<'_>,
        bus: NodeId,
        timbre: &dyn Timbre,
        envelope: &Envelope,
        mut note: NoteEvent,
    ) -> Result<VoiceId, ModuleError> {
        let now = ctx.now();
        note.onset = (note.onset + ctx.lookahead()).max(now);
        let margin = ctx.safety_margin();

        let peak = note.velocity.clamp(0.0, 1.0) * timbre.level();
        let release_start = envelope.release_start(note.onset, note.duration);
        let stop_at = release_start + envelope.release.max(0.0) + margin;

        let mut builder = VoiceBuilder::new(&mut *ctx.renderer);
        let wired = wire(&mut builder, bus, timbre, envelope, &note, peak, release_start, stop_at);
        let amp = match wired {
            Ok(amp) => amp,
            Err(err) => {
                let freed = builder.abort();
                debug!(timbre = timbre.name(), freed, %err, "voice construction failed");
                return Err(err.into());
            }
        };
        let filter = builder.filter();
        let (nodes, sources) = builder.finish();

        // only a voice that exists can displace a sounding one
        if self.active_count() >= self.max_voices {
            self.steal_oldest(ctx, note.onset);
        }

        let id = VoiceId(self.next_id);
        self.next_id += 1;

        let cleanup_delay = (stop_at - now).max(0.0) + margin;
        let cleanup = ctx.arm(cleanup_delay, ModuleTask::VoiceCleanup(id));

        self.voices.insert(
            id,
            Voice {
                nodes,
                sources,
                amp,
                filter,
                cleanup: Some(cleanup),
                state: VoiceState::Active,
                onset: note.onset,
                stop_at,
                release: envelope.release,
            },
        );
        trace!(?id, onset = note.onset, stop_at, "voice created");
        Ok(id)
    }

    /// Release every active voice from `at` (never earlier than now), over
    /// `release` seconds or each voice's own release time.
    pub fn release_all(&mut self, ctx: &mut ModuleContext<'_>, at: f64, release: Option<f64>) -> usize {
        let now = ctx.now();
        let at = at.max(now);
        let margin = ctx.safety_margin();
        let mut released = 0;

        for (&id, voice) in self.voices.iter_mut() {
            if voice.state != VoiceState::Active {
                continue;
            }
            voice.state = VoiceState::Releasing;
            released += 1;

            let release = release.unwrap_or(voice.release).max(0.0);
            let stop_at = (at + release + margin).min(voice.stop_at);
            release_voice(ctx, voice, at, release, stop_at);

            if let Some(handle) = voice.cleanup.take() {
                ctx.cancel(handle);
            }
            let delay = (stop_at - now).max(0.0) + margin;
            voice.cleanup = Some(ctx.arm(delay, ModuleTask::VoiceCleanup(id)));
        }
        released
    }

    /// Stop and free every voice right now. Returns how many were freed.
    pub fn teardown_all(&mut self, ctx: &mut ModuleContext<'_>) -> usize {
        let now = ctx.now();
        let voices = std::mem::take(&mut self.voices);
        let count = voices.len();
        for (id, mut voice) in voices {
            voice.state = VoiceState::Releasing;
            if let Some(handle) = voice.cleanup.take() {
                ctx.cancel(handle);
            }
            for &source in &voice.sources {
                if let Err(err) = ctx.renderer.stop(source, now) {
                    trace!(?id, %err, "source already gone");
                }
            }
            release_nodes(&mut *ctx.renderer, &voice.nodes);
        }
        if count > 0 {
            debug!(count, "voices torn down");
        }
        count
    }

    /// Cleanup timer for `id` fired. Returns false if the voice was already
    /// cleaned up or the timer is stale.
    pub fn on_cleanup(&mut self, ctx: &mut ModuleContext<'_>, handle: TimerHandle, id: VoiceId) -> bool {
        match self.voices.get(&id) {
            Some(voice) if voice.cleanup == Some(handle) => {}
            Some(_) => {
                trace!(?id, "stale cleanup timer");
                return false;
            }
            None => {
                trace!(?id, "voice already cleaned up");
                return false;
            }
        }
        if let Some(voice) = self.voices.remove(&id) {
            release_nodes(&mut *ctx.renderer, &voice.nodes);
            trace!(?id, "voice cleaned up");
        }
        true
    }

    fn steal_oldest(&mut self, ctx: &mut ModuleContext<'_>, at: f64) {
        let now = ctx.now();
        let margin = ctx.safety_margin();
        let oldest = self
            .voices
            .iter_mut()
            .find(|(_, v)| v.state == VoiceState::Active);
        if let Some((&id, voice)) = oldest {
            voice.state = VoiceState::Releasing;
            let stop_at = (at + STEAL_RELEASE + margin).min(voice.stop_at);
            release_voice(ctx, voice, at, STEAL_RELEASE, stop_at);
            if let Some(handle) = voice.cleanup.take() {
                ctx.cancel(handle);
            }
            let delay = (stop_at - now).max(0.0) + margin;
            voice.cleanup = Some(ctx.arm(delay, ModuleTask::VoiceCleanup(id)));
            trace!(?id, "voice stolen");
        }
    }

    /// Voices that have not been cleaned up yet, releasing ones included.
    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.voices
            .values()
            .filter(|v| v.state == VoiceState::Active)
            .count()
    }

    pub fn get(&self, id: VoiceId) -> Option<&Voice> {
        self.voices.get(&id)
    }
}

impl Default for VoiceManager {
    fn default() -> Self {
        Self::new(32)
    }
}

#[allow(clippy::too_many_arguments)]
fn wire(
    builder: &mut VoiceBuilder<'_>,
    bus: NodeId,
    timbre: &dyn Timbre,
    envelope: &Envelope,
    note: &NoteEvent,
    peak: f32,
    release_start: f64,
    stop_at: f64,
) -> Result<NodeId, RenderError> {
    let amp = builder.add(NodeSpec::gain(0.0))?;
    builder.set_output(amp);
    timbre.build(builder, note)?;
    builder.connect(amp, bus)?;

    envelope.schedule_onset(builder.renderer(), amp, Param::Gain, note.onset, FLOOR, peak)?;
    Envelope::schedule_release(builder.renderer(), amp, Param::Gain, release_start, envelope.release, FLOOR)?;

    if let Some((filter, sweep)) = builder.filter() {
        sweep.schedule(builder.renderer(), filter, note.onset, release_start)?;
    }

    let sources = builder.sources().to_vec();
    for source in sources {
        builder.renderer().start(source, note.onset)?;
        builder.renderer().stop(source, stop_at)?;
    }
    Ok(amp)
}

fn release_voice(ctx: &mut ModuleContext<'_>, voice: &mut Voice, at: f64, release: f64, stop_at: f64) {
    let renderer = &mut *ctx.renderer;
    if let Err(err) = Envelope::release_early(renderer, voice.amp, Param::Gain, at, release, FLOOR) {
        warn!(%err, "voice release failed");
    }
    if let Some((filter, sweep)) = voice.filter {
        if let Err(err) = Envelope::release_early(renderer, filter, Param::Cutoff, at, release, sweep.base) {
            trace!(%err, "filter release failed");
        }
    }
    for &source in &voice.sources {
        if let Err(err) = renderer.stop(source, stop_at) {
            trace!(%err, "source stop failed");
        }
    }
    voice.stop_at = stop_at;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::dsp::oscillator::Waveform;
    use crate::engine::event_loop::{EventLoop, InstanceId, TimerKey};
    use crate::render::{GraphRenderer, Renderer};

    struct Sine;

    impl Timbre for Sine {
        fn name(&self) -> &'static str {
            "sine"
        }

        fn envelope(&self) -> Envelope {
            Envelope::adsr(0.01, 0.1, 0.5, 0.2)
        }

        fn build(&self, voice: &mut VoiceBuilder<'_>, note: &NoteEvent) -> Result<(), RenderError> {
            let osc = voice.add(NodeSpec::oscillator(Waveform::Sine, note.frequency))?;
            voice.to_output(osc)
        }
    }

    /// Builds two nodes and then fails.
    struct Broken;

    impl Timbre for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn envelope(&self) -> Envelope {
            Envelope::default()
        }

        fn build(&self, voice: &mut VoiceBuilder<'_>, _note: &NoteEvent) -> Result<(), RenderError> {
            let osc = voice.add(NodeSpec::oscillator(Waveform::Saw, 100.0))?;
            let filter = voice.add(NodeSpec::filter(crate::dsp::filter::FilterMode::LowPass, 500.0, 0.7))?;
            voice.connect(osc, filter)?;
            Err(RenderError::Graph("wiring failed".into()))
        }
    }

    struct Rig {
        renderer: GraphRenderer,
        timers: EventLoop,
        config: EngineConfig,
        bus: NodeId,
    }

    impl Rig {
        fn new() -> Self {
            let mut renderer = GraphRenderer::new(8_000.0);
            let bus = renderer.create_node(NodeSpec::gain(1.0)).unwrap();
            renderer.connect(bus, renderer.destination()).unwrap();
            Self {
                renderer,
                timers: EventLoop::new(),
                config: EngineConfig::default(),
                bus,
            }
        }

        fn ctx(&mut self) -> ModuleContext<'_> {
            ModuleContext::new(&mut self.renderer, &mut self.timers, InstanceId(1), &self.config)
        }

        fn note(&self, onset: f64, duration: f64) -> NoteEvent {
            NoteEvent {
                note: Some(69),
                frequency: 440.0,
                velocity: 1.0,
                brightness: 0.5,
                onset,
                duration,
            }
        }

        /// Run the clock forward, dispatching cleanup timers.
        fn run(&mut self, manager: &mut VoiceManager, seconds: f64) {
            let end = self.renderer.current_time() + seconds;
            while self.renderer.current_time() < end {
                self.renderer.advance(0.005);
                self.timers.advance_to(self.renderer.current_time() * 1000.0);
                while let Some((handle, key)) = self.timers.pop_due() {
                    if let TimerKey::Module {
                        task: ModuleTask::VoiceCleanup(id),
                        ..
                    } = key
                    {
                        let mut ctx = self.ctx();
                        manager.on_cleanup(&mut ctx, handle, id);
                    }
                }
            }
        }
    }

    #[test]
    fn onset_is_intended_time_plus_lookahead() {
        let mut rig = Rig::new();
        let mut manager = VoiceManager::default();
        let note = rig.note(0.2, 0.5);
        let bus = rig.bus;
        let id = manager
            .create_voice(&mut rig.ctx(), bus, &Sine, &Sine.envelope(), note)
            .unwrap();
        let voice = manager.get(id).unwrap();
        assert!((voice.onset() - 0.25).abs() < 1e-12);
        // release starts at 0.75, lasts 0.2, plus the margin
        assert!((voice.stop_at() - (0.75 + 0.2 + 0.1)).abs() < 1e-12);
    }

    #[test]
    fn late_onset_is_clamped_to_now() {
        let mut rig = Rig::new();
        rig.renderer.advance(1.0);
        let mut manager = VoiceManager::default();
        let note = rig.note(0.5, 0.2);
        let bus = rig.bus;
        let id = manager
            .create_voice(&mut rig.ctx(), bus, &Sine, &Sine.envelope(), note)
            .unwrap();
        assert!((manager.get(id).unwrap().onset() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn voices_clean_up_after_their_envelope() {
        let mut rig = Rig::new();
        let mut manager = VoiceManager::default();
        for i in 0..4 {
            let note = rig.note(i as f64 * 0.1, 0.1);
            let bus = rig.bus;
            manager
                .create_voice(&mut rig.ctx(), bus, &Sine, &Sine.envelope(), note)
                .unwrap();
        }
        assert_eq!(manager.len(), 4);
        assert_eq!(rig.renderer.live_node_count(), 1 + 4 * 2);

        rig.run(&mut manager, 1.5);
        assert!(manager.is_empty());
        assert_eq!(rig.renderer.live_node_count(), 1, "only the bus should remain");
        assert_eq!(rig.timers.pending(), 0);
    }

    #[test]
    fn failed_construction_frees_partial_nodes() {
        let mut rig = Rig::new();
        let mut manager = VoiceManager::default();
        let note = rig.note(0.0, 0.5);
        let bus = rig.bus;
        let result = manager.create_voice(&mut rig.ctx(), bus, &Broken, &Broken.envelope(), note);
        assert!(matches!(result, Err(ModuleError::Render(RenderError::Graph(_)))));
        assert!(manager.is_empty());
        assert_eq!(rig.renderer.live_node_count(), 1);
        assert_eq!(rig.timers.pending(), 0);
    }

    #[test]
    fn release_all_shortens_long_notes() {
        let mut rig = Rig::new();
        let mut manager = VoiceManager::default();
        let note = rig.note(0.0, 30.0);
        let bus = rig.bus;
        manager
            .create_voice(&mut rig.ctx(), bus, &Sine, &Sine.envelope(), note)
            .unwrap();

        rig.run(&mut manager, 0.5);
        let now = rig.renderer.current_time();
        assert_eq!(manager.release_all(&mut rig.ctx(), now, Some(0.3)), 1);
        // releasing twice does nothing more
        assert_eq!(manager.release_all(&mut rig.ctx(), now, Some(0.3)), 0);
        assert_eq!(rig.timers.pending(), 1);

        rig.run(&mut manager, 0.3 + 2.0 * 0.1 + 0.02);
        assert!(manager.is_empty());
        assert_eq!(rig.renderer.live_node_count(), 1);
    }

    #[test]
    fn teardown_is_immediate_and_idempotent() {
        let mut rig = Rig::new();
        let mut manager = VoiceManager::default();
        for i in 0..3 {
            let note = rig.note(i as f64, 2.0);
            let bus = rig.bus;
            manager
                .create_voice(&mut rig.ctx(), bus, &Sine, &Sine.envelope(), note)
                .unwrap();
        }
        assert_eq!(manager.teardown_all(&mut rig.ctx()), 3);
        assert_eq!(manager.teardown_all(&mut rig.ctx()), 0);
        assert_eq!(rig.renderer.live_node_count(), 1);
        assert_eq!(rig.timers.pending(), 0);
    }

    #[test]
    fn cleanup_runs_exactly_once() {
        let mut rig = Rig::new();
        let mut manager = VoiceManager::default();
        let note = rig.note(0.0, 0.1);
        let bus = rig.bus;
        let id = manager
            .create_voice(&mut rig.ctx(), bus, &Sine, &Sine.envelope(), note)
            .unwrap();

        rig.timers.advance_to(10_000.0);
        let (handle, _) = rig.timers.pop_due().unwrap();
        assert!(manager.on_cleanup(&mut rig.ctx(), handle, id));
        assert!(!manager.on_cleanup(&mut rig.ctx(), handle, id));
        assert_eq!(rig.renderer.live_node_count(), 1);
    }

    #[test]
    fn oldest_voice_is_stolen_at_the_limit() {
        let mut rig = Rig::new();
        let mut manager = VoiceManager::new(2);
        for i in 0..3 {
            let note = rig.note(i as f64 * 0.01, 10.0);
            let bus = rig.bus;
            manager
                .create_voice(&mut rig.ctx(), bus, &Sine, &Sine.envelope(), note)
                .unwrap();
        }
        assert_eq!(manager.len(), 3);
        assert_eq!(manager.active_count(), 2);
        assert_eq!(manager.get(VoiceId(0)).unwrap().state(), VoiceState::Releasing);
    }

    #[test]
    fn failed_voice_at_the_limit_steals_nothing() {
        let mut rig = Rig::new();
        let mut manager = VoiceManager::new(2);
        for i in 0..2 {
            let note = rig.note(i as f64 * 0.01, 10.0);
            let bus = rig.bus;
            manager
                .create_voice(&mut rig.ctx(), bus, &Sine, &Sine.envelope(), note)
                .unwrap();
        }
        let pending = rig.timers.pending();

        let note = rig.note(0.05, 10.0);

        let bus = rig.bus;
        assert!(manager
            .create_voice(&mut rig.ctx(), bus, &Broken, &Broken.envelope(), note)
            .is_err());
        assert_eq!(manager.active_count(), 2);
        assert_eq!(manager.get(VoiceId(0)).unwrap().state(), VoiceState::Active);
        assert_eq!(rig.timers.pending(), pending);
    }
}
