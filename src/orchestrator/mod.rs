/*
Module Orchestrator
===================

The orchestrator owns everything shared: the renderer, the event loop, the
master chain, and the registry of live modules. Modules never see each other;
they see a ModuleContext scoped to their own instance.

Mood state machine

  Uninitialized ──change_mood(M, initial)──→ Ready(M)
  Ready(M) ──change_mood(M')──→ Transitioning(M→M') ──TransitionComplete──→ Ready(M')

  On change_mood(M'):
    in M only     stop with a fade, dispose when the DisposeRetired timer fires
    in M' only    create, init, and play if playing
    in both       change_mood in place, no restart
    master chain  ramps to M' over the same transition time
  The initial activation uses a transition time of zero.

Failure isolation

  Every call into a module goes through `contain`, which also catches panics.
  A failed call is recorded and counted by the module's circuit breaker; the
  breaker trips after more than `max_module_errors` consecutive failures, and
  the module is disposed and dropped from the registry. Nothing a module does
  escapes into the loop.

  Only update, play, stop and change_mood successes reset the count. Timer
  wake-ups add failures without ever clearing them, so a module whose wakes
  always fail while its updates succeed is never tripped; its failures show
  up in the error log instead.

Engine failures

  A renderer that cannot be created, or that closes underneath us, is a fatal
  source. Recreation is retried `recovery_attempts` times with a linearly
  growing delay, after which the engine is Failed. Master chain stages that
  cannot be built are fatal sources of their own ("master.reverb", ...).
  Reaching `fatal_source_limit` distinct sources force-stops playback.

  EngineStatus:  Idle ──initialize──→ Running ──renderer lost──→ Recovering
                                         ↑                          │
                                         └────────recreated─────────┤
                                                                    ↓
                                                     attempts exhausted: Failed
*/

pub mod errors;
pub mod health;
pub mod master;
pub mod registry;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::engine::event_loop::{EngineTask, EventLoop, InstanceId, TimerHandle, TimerKey};
use crate::error::ModuleError;
use crate::modules::{DerivedParams, GeneratorModule, ModuleContext, MoodConfig, ParamMap, UpdateFrame};
use crate::mood::{MasterSettings, Mood, MoodModule, MoodTable, ModuleSpec};
use crate::render::{Renderer, RendererFactory, RendererState};

pub use errors::{ErrorLog, ErrorRecord, Notice, NoticeLevel, NoticeQueue};
pub use health::{HealthAction, HealthMonitor, HealthVerdict};
pub use master::{MasterChain, StageFailure};
pub use registry::{CircuitBreaker, ModuleRegistration, Registry, Retired};

/// Upper bound on timers dispatched by one tick, for a loop that has fallen
/// far behind.
const MAX_DISPATCH: usize = 4096;

/// Ramp for live volume and per-module config changes.
const LIVE_RAMP: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoodState {
    Uninitialized,
    Ready,
    Transitioning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Idle,
    Running,
    Recovering,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModuleRow {
    pub id: String,
    pub kind: String,
    pub enabled: bool,
    pub playing: bool,
    pub errors: u32,
    pub voices: usize,
    pub config: MoodConfig,
}

/// Snapshot returned by [`Orchestrator::debug_state`].
#[derive(Debug, Clone, PartialEq)]
pub struct DebugState {
    pub state: MoodState,
    pub current_mood: Option<String>,
    pub target_mood: Option<String>,
    pub playing: bool,
    pub volume: f32,
    pub status: EngineStatus,
    pub modules: Vec<ModuleRow>,
    pub retiring: Vec<String>,
    pub pending_timers: usize,
    pub live_nodes: usize,
    pub recent_errors: Vec<ErrorRecord>,
    pub fatal_sources: Vec<String>,
    pub recovery_attempts: u32,
    pub health: HealthVerdict,
    pub bypassed_stages: Vec<&'static str>,
}

pub struct Orchestrator {
    config: EngineConfig,
    moods: MoodTable,
    factory: Box<dyn RendererFactory + Send>,
    renderer: Option<Box<dyn Renderer>>,
    timers: EventLoop,
    master: Option<MasterChain>,
    master_settings: MasterSettings,
    registry: Registry,
    retiring: Vec<Retired>,
    state: MoodState,
    status: EngineStatus,
    current_mood: Option<String>,
    target_mood: Option<String>,
    playing: bool,
    volume: f32,
    errors: ErrorLog,
    notices: NoticeQueue,
    health: HealthMonitor,
    recovery_attempts: u32,
    recovery_timer: Option<TimerHandle>,
    transition_timer: Option<TimerHandle>,
    health_timer: Option<TimerHandle>,
    probe_timer: Option<TimerHandle>,
    next_instance: u64,
    seed: u64,
    play_started_ms: f64,
    mood_changed_ms: f64,
    last_update_ms: Option<f64>,
    disposed: bool,
}

impl Orchestrator {
    pub fn new<F>(config: EngineConfig, moods: MoodTable, factory: F) -> Self
    where
        F: RendererFactory + Send + 'static,
    {
        Self {
            errors: ErrorLog::new(config.error_log_capacity),
            health: HealthMonitor::new(config.silent_checks_before_probe),
            config,
            moods,
            factory: Box::new(factory),
            renderer: None,
            timers: EventLoop::new(),
            master: None,
            master_settings: MasterSettings::default(),
            registry: Registry::default(),
            retiring: Vec::new(),
            state: MoodState::Uninitialized,
            status: EngineStatus::Idle,
            current_mood: None,
            target_mood: None,
            playing: false,
            volume: 1.0,
            notices: NoticeQueue::default(),
            recovery_attempts: 0,
            recovery_timer: None,
            transition_timer: None,
            health_timer: None,
            probe_timer: None,
            next_instance: 1,
            seed: 0x6d6f_6f64,
            play_started_ms: 0.0,
            mood_changed_ms: 0.0,
            last_update_ms: None,
            disposed: false,
        }
    }

    /// Seed for module randomness; modules get one derived per instance.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Make every timer fire up to `max_ms` late.
    pub fn with_timer_jitter(mut self, max_ms: f64, seed: u64) -> Self {
        self.timers.set_jitter(max_ms, seed);
        self
    }

    /// Create the renderer and the master chain. Safe to call again.
    pub fn initialize(&mut self) -> bool {
        if self.disposed || self.status == EngineStatus::Failed {
            return false;
        }
        if self.renderer.is_some() && self.master.is_some() {
            return true;
        }
        if self.status == EngineStatus::Recovering {
            return false;
        }
        match self.factory.create() {
            Ok(renderer) => {
                self.renderer = Some(renderer);
                self.build_master()
            }
            Err(err) => {
                self.engine_fatal("renderer", format!("renderer creation failed: {err}"));
                false
            }
        }
    }

    fn build_master(&mut self) -> bool {
        let Some(renderer) = self.renderer.as_deref_mut() else {
            return false;
        };
        match MasterChain::build(renderer, &self.master_settings, self.volume, self.config.fft_size) {
            Ok((chain, failures)) => {
                self.master = Some(chain);
                self.status = EngineStatus::Running;
                for failure in failures {
                    self.record_fatal(&failure.source(), failure.error.to_string());
                }
                self.status == EngineStatus::Running
            }
            Err(failure) => {
                self.engine_fatal(&failure.source(), failure.error.to_string());
                false
            }
        }
    }

    /// Start or stop playback. Starting with a mood key switches to it first;
    /// starting with none and no current mood picks the first mood.
    pub fn set_playing(&mut self, playing: bool, mood: Option<&str>) -> bool {
        if self.disposed {
            return false;
        }
        if !playing {
            return self.pause();
        }
        if self.status == EngineStatus::Failed {
            warn!("engine failed, refusing to play");
            return false;
        }

        let key = match mood {
            Some(key) => Some(key.to_string()),
            None if self.current_mood.is_none() => self.moods.first().map(|m| m.key.clone()),
            None => None,
        };
        if let Some(key) = key {
            let initial = self.state == MoodState::Uninitialized;
            if !self.change_mood(&key, initial) {
                return false;
            }
        }

        if self.status == EngineStatus::Recovering {
            // picked up once the renderer is back
            self.playing = true;
            return true;
        }
        if self.playing {
            return true;
        }
        let Some(renderer) = self.renderer.as_deref_mut() else {
            return false;
        };
        if let Err(err) = renderer.resume() {
            self.engine_fatal("renderer", format!("resume failed: {err}"));
            return false;
        }

        self.playing = true;
        self.play_started_ms = self.timers.now_ms();
        self.last_update_ms = None;
        self.start_modules();
        self.arm_health();
        info!(mood = ?self.current_mood, "playback started");
        true
    }

    fn pause(&mut self) -> bool {
        if !self.playing {
            return true;
        }
        self.playing = false;
        let fade = self.config.stop_fade;
        self.stop_modules(fade);
        self.cancel_health();
        info!(fade, "playback stopped");
        true
    }

    /// Switch to mood `key`. `initial` skips every fade.
    pub fn change_mood(&mut self, key: &str, initial: bool) -> bool {
        if self.disposed {
            return false;
        }
        let Some(mood) = self.moods.get(key).cloned() else {
            warn!(mood = key, "unknown mood");
            self.notices
                .push(NoticeLevel::Warning, &format!("mood:{key}"), format!("unknown mood `{key}`"));
            return false;
        };
        match self.status {
            EngineStatus::Failed => return false,
            EngineStatus::Recovering => {
                // activated once the renderer is back
                self.current_mood = Some(mood.key);
                self.master_settings = mood.master;
                return true;
            }
            EngineStatus::Idle | EngineStatus::Running => {}
        }
        if self.master.is_none() {
            // a failed initialize activates the mood during recovery
            self.current_mood = Some(mood.key.clone());
            self.master_settings = mood.master;
            if !self.initialize() {
                return self.status == EngineStatus::Recovering;
            }
            self.current_mood = None;
        }
        if !initial && self.state != MoodState::Uninitialized && self.current_mood.as_deref() == Some(key) {
            return true;
        }
        self.activate(&mood, initial);
        true
    }

    fn activate(&mut self, mood: &Mood, initial: bool) {
        if self.renderer.is_none() || self.master.is_none() {
            return;
        }
        let transition = if initial { 0.0 } else { self.config.transition_time.max(0.0) };
        let fade = if initial { 0.0 } else { self.config.stop_fade };
        info!(from = ?self.current_mood, to = %mood.key, transition, "mood change");

        self.state = MoodState::Transitioning;
        self.target_mood = Some(mood.key.clone());
        if let Some(handle) = self.transition_timer.take() {
            self.timers.cancel(handle);
        }

        for id in self.registry.ids() {
            let keep = mood
                .module(&id)
                .is_some_and(|entry| self.registry.get(&id).is_some_and(|r| r.kind == entry.kind));
            if !keep {
                self.retire(&id, fade);
            }
        }

        for entry in &mood.modules {
            if self.registry.get(&entry.id).is_some() {
                self.reconfigure(entry, &mood.key, transition);
            } else {
                self.create_module(entry, &mood.key);
            }
        }

        self.master_settings = mood.master;
        if let (Some(renderer), Some(master)) = (self.renderer.as_deref_mut(), &self.master) {
            let now = renderer.current_time();
            if let Err(err) = master.apply(renderer, &mood.master, self.volume, now, transition) {
                warn!(%err, "master chain update failed");
                self.errors
                    .record(self.timers.now_ms(), "master", format!("apply: {err}"), false);
            }
        }

        self.current_mood = Some(mood.key.clone());
        self.mood_changed_ms = self.timers.now_ms();
        if transition > 0.0 {
            self.transition_timer = Some(
                self.timers
                    .arm(transition * 1000.0, TimerKey::Engine(EngineTask::TransitionComplete)),
            );
        } else {
            self.finish_transition();
        }
        self.reap_disabled();
    }

    fn finish_transition(&mut self) {
        self.state = MoodState::Ready;
        self.target_mood = None;
        debug!(mood = ?self.current_mood, "transition complete");
    }

    fn create_module(&mut self, entry: &MoodModule, mood_key: &str) {
        let (Some(renderer), Some(master)) = (self.renderer.as_deref_mut(), &self.master) else {
            return;
        };
        let input = master.input();
        let instance = InstanceId(self.next_instance);
        self.next_instance += 1;
        let spec = ModuleSpec {
            id: &entry.id,
            kind: &entry.kind,
            seed: self.seed ^ instance.0.wrapping_mul(0x9e37_79b9_7f4a_7c15),
        };

        let module = match panic::catch_unwind(AssertUnwindSafe(|| (entry.factory)(&spec))) {
            Ok(module) => module,
            Err(payload) => {
                let message = format!("factory panicked: {}", panic_message(payload.as_ref()));
                self.construction_failed(&entry.id, instance, message);
                return;
            }
        };
        let mut registration = ModuleRegistration {
            id: entry.id.clone(),
            kind: entry.kind.clone(),
            instance,
            module,
            settings: entry.settings.clone(),
            config: entry.config,
            breaker: CircuitBreaker::new(self.config.max_module_errors),
            enabled: true,
            playing: false,
        };

        let mut ctx = ModuleContext::new(renderer, &mut self.timers, instance, &self.config);
        let (settings, config) = (&entry.settings, entry.config);
        let result = contain(registration.module.as_mut(), &mut ctx, |m, ctx| {
            m.init(ctx, input, settings, mood_key, config)
        });
        if let Err(err) = result {
            contain(registration.module.as_mut(), &mut ctx, |m, ctx| {
                m.dispose(ctx);
                Ok(())
            })
            .ok();
            self.construction_failed(&entry.id, instance, format!("init failed: {err}"));
            return;
        }

        if self.playing {
            let now = ctx.now();
            let result = contain(registration.module.as_mut(), &mut ctx, |m, ctx| m.play(ctx, now));
            let now_ms = self.timers.now_ms();
            registration.playing = settle(&mut registration, "play", result, now_ms, &mut self.errors, &mut self.notices);
        }
        debug!(module = %entry.id, kind = %entry.kind, ?instance, "module created");
        self.notices.forget(&entry.id);
        self.registry.insert(registration);
    }

    fn construction_failed(&mut self, id: &str, instance: InstanceId, message: String) {
        warn!(module = %id, %message, "module construction failed");
        self.timers.cancel_instance(instance);
        self.errors.record(self.timers.now_ms(), id, message.clone(), false);
        self.notices.push(NoticeLevel::Warning, id, format!("{id} could not start: {message}"));
    }

    /// A module kept across a mood change moves to its new settings in place.
    fn reconfigure(&mut self, entry: &MoodModule, mood_key: &str, transition: f64) {
        let Some(renderer) = self.renderer.as_deref_mut() else {
            return;
        };
        let Some(registration) = self.registry.get_mut(&entry.id) else {
            return;
        };
        let mut ctx = ModuleContext::new(renderer, &mut self.timers, registration.instance, &self.config);
        let (settings, config) = (&entry.settings, entry.config);
        let result = contain(registration.module.as_mut(), &mut ctx, |m, ctx| {
            m.change_mood(ctx, mood_key, settings, transition, config)
        });
        let now_ms = self.timers.now_ms();
        if settle(registration, "change_mood", result, now_ms, &mut self.errors, &mut self.notices) {
            registration.settings = entry.settings.clone();
            registration.config = entry.config;
        }
    }

    /// Fade a module out and dispose it when the fade is over.
    fn retire(&mut self, id: &str, fade: f64) {
        let Some(mut registration) = self.registry.remove(id) else {
            return;
        };
        let Some(renderer) = self.renderer.as_deref_mut() else {
            self.timers.cancel_instance(registration.instance);
            return;
        };
        let instance = registration.instance;
        let mut ctx = ModuleContext::new(renderer, &mut self.timers, instance, &self.config);
        let now = ctx.now();
        if let Err(err) = contain(registration.module.as_mut(), &mut ctx, |m, ctx| m.stop(ctx, now, fade)) {
            debug!(module = %id, %err, "stop failed while retiring");
        }

        if fade <= 0.0 {
            contain(registration.module.as_mut(), &mut ctx, |m, ctx| {
                m.dispose(ctx);
                Ok(())
            })
            .ok();
            self.timers.cancel_instance(instance);
            debug!(module = %id, "module disposed");
            return;
        }
        let delay_ms = (fade + self.config.voice_safety_margin) * 1000.0;
        self.timers
            .arm(delay_ms, TimerKey::Engine(EngineTask::DisposeRetired(instance)));
        debug!(module = %id, fade, "module retiring");
        self.retiring.push(Retired {
            id: registration.id,
            instance,
            module: registration.module,
        });
    }

    fn dispose_retired(&mut self, instance: InstanceId) {
        let Some(index) = self.retiring.iter().position(|r| r.instance == instance) else {
            return;
        };
        let mut retired = self.retiring.remove(index);
        if let Some(renderer) = self.renderer.as_deref_mut() {
            let mut ctx = ModuleContext::new(renderer, &mut self.timers, instance, &self.config);
            contain(retired.module.as_mut(), &mut ctx, |m, ctx| {
                m.dispose(ctx);
                Ok(())
            })
            .ok();
        }
        self.timers.cancel_instance(instance);
        debug!(module = %retired.id, "retired module disposed");
    }

    fn start_modules(&mut self) {
        let Self {
            renderer,
            timers,
            registry,
            config,
            errors,
            notices,
            ..
        } = self;
        let Some(renderer) = renderer.as_deref_mut() else {
            return;
        };
        let now = renderer.current_time();
        for registration in registry.iter_mut().filter(|r| r.enabled && !r.playing) {
            let mut ctx = ModuleContext::new(renderer, timers, registration.instance, config);
            let result = contain(registration.module.as_mut(), &mut ctx, |m, ctx| m.play(ctx, now));
            let now_ms = timers.now_ms();
            registration.playing = settle(registration, "play", result, now_ms, errors, notices);
        }
        self.reap_disabled();
    }

    fn stop_modules(&mut self, fade: f64) {
        let Self {
            renderer,
            timers,
            registry,
            config,
            errors,
            notices,
            ..
        } = self;
        let Some(renderer) = renderer.as_deref_mut() else {
            return;
        };
        let now = renderer.current_time();
        for registration in registry.iter_mut().filter(|r| r.enabled) {
            let mut ctx = ModuleContext::new(renderer, timers, registration.instance, config);
            let result = contain(registration.module.as_mut(), &mut ctx, |m, ctx| m.stop(ctx, now, fade));
            let now_ms = timers.now_ms();
            settle(registration, "stop", result, now_ms, errors, notices);
            registration.playing = false;
        }
        self.reap_disabled();
    }

    /// Dispose every module whose breaker tripped.
    fn reap_disabled(&mut self) {
        for mut registration in self.registry.drain_disabled() {
            if let Some(renderer) = self.renderer.as_deref_mut() {
                let mut ctx = ModuleContext::new(renderer, &mut self.timers, registration.instance, &self.config);
                contain(registration.module.as_mut(), &mut ctx, |m, ctx| {
                    m.dispose(ctx);
                    Ok(())
                })
                .ok();
            }
            self.timers.cancel_instance(registration.instance);
            info!(module = %registration.id, "disabled module removed");
        }
    }

    /// Set the user volume, 0..=1.
    pub fn set_volume(&mut self, volume: f32) -> bool {
        if self.disposed || !volume.is_finite() {
            return false;
        }
        self.volume = volume.clamp(0.0, 1.0);
        let (Some(renderer), Some(master)) = (self.renderer.as_deref_mut(), &self.master) else {
            // applied when the chain is built
            return true;
        };
        let now = renderer.current_time();
        match master.set_output_gain(renderer, self.master_settings.volume * self.volume, now, LIVE_RAMP) {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "volume change failed");
                self.errors
                    .record(self.timers.now_ms(), "master", format!("volume: {err}"), false);
                false
            }
        }
    }

    /// Adjust one module's mood controls live, through its `change_mood`.
    pub fn set_module_config(&mut self, id: &str, config: MoodConfig) -> bool {
        let Some(mood) = self.current_mood.clone() else {
            return false;
        };
        let Some(renderer) = self.renderer.as_deref_mut() else {
            return false;
        };
        let Some(registration) = self.registry.get_mut(id).filter(|r| r.enabled) else {
            return false;
        };
        let config = config.clamped();
        let settings = registration.settings.clone();
        let mut ctx = ModuleContext::new(renderer, &mut self.timers, registration.instance, &self.config);
        let result = contain(registration.module.as_mut(), &mut ctx, |m, ctx| {
            m.change_mood(ctx, &mood, &settings, LIVE_RAMP, config)
        });
        let now_ms = self.timers.now_ms();
        let ok = settle(registration, "change_mood", result, now_ms, &mut self.errors, &mut self.notices);
        if ok {
            registration.config = config;
        }
        self.reap_disabled();
        ok
    }

    /// Run everything due up to `now_ms` and give every module its update.
    pub fn tick(&mut self, now_ms: f64, external: &ParamMap) {
        if self.disposed {
            return;
        }
        self.timers.advance_to(now_ms);

        let closed = self
            .renderer
            .as_deref()
            .is_some_and(|r| r.state() == RendererState::Closed);
        if closed && self.status == EngineStatus::Running {
            self.engine_fatal("renderer", "renderer closed".to_string());
        }

        let mut dispatched = 0;
        while let Some((handle, key)) = self.timers.pop_due() {
            self.dispatch(handle, key);
            dispatched += 1;
            if dispatched >= MAX_DISPATCH {
                warn!(dispatched, "timer backlog, deferring the rest to the next tick");
                break;
            }
        }

        if self.playing && self.status == EngineStatus::Running {
            self.update_modules(now_ms, external);
        }
        self.reap_disabled();
    }

    fn dispatch(&mut self, handle: TimerHandle, key: TimerKey) {
        match key {
            TimerKey::Module { instance, task } => {
                let Self {
                    renderer,
                    timers,
                    registry,
                    retiring,
                    config,
                    errors,
                    notices,
                    ..
                } = self;
                let Some(renderer) = renderer.as_deref_mut() else {
                    return;
                };
                if let Some(registration) = registry.by_instance_mut(instance) {
                    if !registration.enabled {
                        return;
                    }
                    let mut ctx = ModuleContext::new(renderer, timers, instance, config);
                    let result = contain(registration.module.as_mut(), &mut ctx, |m, ctx| m.on_timer(ctx, handle, task));
                    // timer wake-ups count failures but never clear them
                    if result.is_err() {
                        let now_ms = timers.now_ms();
                        settle(registration, "timer", result, now_ms, errors, notices);
                    }
                } else if let Some(retired) = retiring.iter_mut().find(|r| r.instance == instance) {
                    let mut ctx = ModuleContext::new(renderer, timers, instance, config);
                    if let Err(err) = contain(retired.module.as_mut(), &mut ctx, |m, ctx| m.on_timer(ctx, handle, task)) {
                        debug!(module = %retired.id, %err, "retiring module timer failed");
                    }
                } else {
                    trace!(?instance, ?task, "timer for a gone module dropped");
                }
            }
            TimerKey::Engine(EngineTask::DisposeRetired(instance)) => self.dispose_retired(instance),
            TimerKey::Engine(EngineTask::TransitionComplete) => {
                if self.transition_timer == Some(handle) {
                    self.transition_timer = None;
                    self.finish_transition();
                }
            }
            TimerKey::Engine(EngineTask::RecreateRenderer) => {
                if self.recovery_timer == Some(handle) {
                    self.recovery_timer = None;
                    self.recreate_renderer();
                }
            }
            TimerKey::Engine(EngineTask::HealthCheck) => {
                if self.health_timer == Some(handle) {
                    self.health_timer = None;
                    self.health_check();
                }
            }
            TimerKey::Engine(EngineTask::ProbeCheck) => {
                if self.probe_timer == Some(handle) {
                    self.probe_timer = None;
                    self.probe_check();
                }
            }
        }
    }

    fn update_modules(&mut self, now_ms: f64, external: &ParamMap) {
        let delta = self
            .last_update_ms
            .map_or(0.0, |last| ((now_ms - last) / 1000.0).max(0.0));
        self.last_update_ms = Some(now_ms);
        let derived = DerivedParams {
            output_level: self.output_level(),
            since_mood_change: ((now_ms - self.mood_changed_ms) / 1000.0).max(0.0),
        };
        let elapsed = ((now_ms - self.play_started_ms) / 1000.0).max(0.0);
        let mood = self.current_mood.clone().unwrap_or_default();
        let frame = UpdateFrame {
            elapsed,
            mood: &mood,
            external,
            derived: &derived,
            delta,
        };

        let Self {
            renderer,
            timers,
            registry,
            config,
            errors,
            notices,
            ..
        } = self;
        let Some(renderer) = renderer.as_deref_mut() else {
            return;
        };
        for registration in registry.iter_mut().filter(|r| r.enabled) {
            let mut ctx = ModuleContext::new(renderer, timers, registration.instance, config);
            let result = contain(registration.module.as_mut(), &mut ctx, |m, ctx| m.update(ctx, &frame));
            settle(registration, "update", result, now_ms, errors, notices);
        }
    }

    /// RMS of the analysis tap, 0 when there is none.
    fn output_level(&mut self) -> f32 {
        let (Some(renderer), Some(tap)) = (self.renderer.as_deref_mut(), self.master.as_ref().and_then(MasterChain::tap)) else {
            return 0.0;
        };
        renderer
            .time_domain_data(tap)
            .map_or(0.0, |samples| health::rms(&samples))
    }

    // ----- engine failures -------------------------------------------------

    fn record_fatal(&mut self, source: &str, message: String) {
        let count = self.errors.record(self.timers.now_ms(), source, message.as_str(), true);
        error!(source, %message, fatal_sources = count, "fatal engine error");
        if count >= self.config.fatal_source_limit && self.status != EngineStatus::Failed {
            error!(fatal_sources = count, "too many fatal errors, forcing playback off");
            self.stop_modules(0.0);
            self.fail_engine("too many audio engine errors, playback stopped");
        }
    }

    fn engine_fatal(&mut self, source: &str, message: String) {
        self.record_fatal(source, message);
        if self.status != EngineStatus::Failed {
            self.begin_recovery();
        }
    }

    fn fail_engine(&mut self, message: &str) {
        self.status = EngineStatus::Failed;
        self.playing = false;
        self.cancel_health();
        if let Some(handle) = self.recovery_timer.take() {
            self.timers.cancel(handle);
        }
        self.notices.push(NoticeLevel::Error, "engine", message);
    }

    fn begin_recovery(&mut self) {
        if self.recovery_timer.is_some() {
            return;
        }
        self.teardown_graph();
        let attempt = self.recovery_attempts + 1;
        if attempt > self.config.recovery_attempts {
            error!(attempts = self.recovery_attempts, "renderer recovery exhausted");
            self.fail_engine("audio engine could not be restarted");
            return;
        }
        self.status = EngineStatus::Recovering;
        let delay_ms = self.config.recovery_delay_ms * attempt as f64;
        info!(attempt, delay_ms, "scheduling renderer recreation");
        self.recovery_timer = Some(self.timers.arm(delay_ms, TimerKey::Engine(EngineTask::RecreateRenderer)));
    }

    fn recreate_renderer(&mut self) {
        self.recovery_attempts += 1;
        info!(attempt = self.recovery_attempts, "recreating renderer");
        match self.factory.create() {
            Ok(renderer) => {
                self.renderer = Some(renderer);
                if !self.build_master() {
                    return;
                }
                info!(attempts = self.recovery_attempts, "renderer recovered");
                self.recovery_attempts = 0;
                self.notices.forget("renderer");
                self.notices
                    .push(NoticeLevel::Info, "renderer", "audio engine restarted");

                if let Some(mood) = self.current_mood.take().and_then(|key| self.moods.get(&key).cloned()) {
                    self.activate(&mood, true);
                }
                if self.playing {
                    self.play_started_ms = self.timers.now_ms();
                    self.last_update_ms = None;
                    self.start_modules();
                    self.arm_health();
                }
            }
            Err(err) => {
                warn!(attempt = self.recovery_attempts, %err, "renderer recreation failed");
                self.record_fatal("renderer", format!("recreation failed: {err}"));
                if self.status != EngineStatus::Failed {
                    self.begin_recovery();
                }
            }
        }
    }

    /// Drop every module, the master chain and the renderer. Modules are
    /// re-created from the current mood once a renderer is back.
    fn teardown_graph(&mut self) {
        self.cancel_health();
        if let Some(handle) = self.transition_timer.take() {
            self.timers.cancel(handle);
        }
        let mut modules: Vec<(InstanceId, Box<dyn GeneratorModule>)> = self
            .registry
            .drain()
            .into_iter()
            .map(|r| (r.instance, r.module))
            .collect();
        modules.extend(self.retiring.drain(..).map(|r| (r.instance, r.module)));

        for (instance, mut module) in modules {
            if let Some(renderer) = self.renderer.as_deref_mut() {
                let mut ctx = ModuleContext::new(renderer, &mut self.timers, instance, &self.config);
                contain(module.as_mut(), &mut ctx, |m, ctx| {
                    m.dispose(ctx);
                    Ok(())
                })
                .ok();
            }
            self.timers.cancel_instance(instance);
        }
        if let (Some(renderer), Some(master)) = (self.renderer.as_deref_mut(), self.master.take()) {
            master.release(renderer);
        }
        self.master = None;
        self.renderer = None;
        self.health.reset();
        if self.state != MoodState::Uninitialized {
            self.state = MoodState::Uninitialized;
            self.target_mood = None;
        }
    }

    // ----- diagnostics -----------------------------------------------------

    fn arm_health(&mut self) {
        if let Some(handle) = self.health_timer.take() {
            self.timers.cancel(handle);
        }
        self.health_timer = Some(
            self.timers
                .arm(self.config.health_interval_ms, TimerKey::Engine(EngineTask::HealthCheck)),
        );
    }

    fn cancel_health(&mut self) {
        for handle in [self.health_timer.take(), self.probe_timer.take()].into_iter().flatten() {
            self.timers.cancel(handle);
        }
        match self.renderer.as_deref_mut() {
            Some(renderer) => self.health.end_probe(renderer),
            None => self.health.reset(),
        }
    }

    fn health_check(&mut self) {
        if !self.playing || self.status != EngineStatus::Running {
            return;
        }
        let (Some(renderer), Some(master)) = (self.renderer.as_deref_mut(), self.master.as_mut()) else {
            return;
        };
        match master.tap() {
            Some(tap) => {
                let level = renderer
                    .time_domain_data(tap)
                    .map_or(0.0, |samples| health::rms(&samples));
                if self.health.observe(level) == HealthAction::StartProbe {
                    match self.health.start_probe(renderer, tap) {
                        Ok(()) => {
                            debug!("output silent, probing the analysis tap");
                            self.probe_timer = Some(
                                self.timers
                                    .arm(self.config.probe_window_ms, TimerKey::Engine(EngineTask::ProbeCheck)),
                            );
                        }
                        Err(err) => {
                            warn!(%err, "health probe could not be built");
                            self.errors
                                .record(self.timers.now_ms(), "health", format!("probe: {err}"), false);
                        }
                    }
                }
            }
            None => {
                warn!("analysis tap missing, rebuilding");
                if let Err(failure) = master.reconnect_tap(renderer) {
                    self.record_fatal(&failure.source(), failure.error.to_string());
                }
            }
        }
        if self.status == EngineStatus::Running {
            self.arm_health();
        }
    }

    fn probe_check(&mut self) {
        let (Some(renderer), Some(master)) = (self.renderer.as_deref_mut(), self.master.as_mut()) else {
            return;
        };
        let level = master
            .tap()
            .and_then(|tap| renderer.time_domain_data(tap).ok())
            .map_or(0.0, |samples| health::rms(&samples));
        match self.health.finish_probe(renderer, level) {
            HealthVerdict::TapBroken => {
                warn!("probe did not reach the analysis tap, reconnecting it");
                match master.reconnect_tap(renderer) {
                    Ok(()) => {
                        self.errors
                            .record(self.timers.now_ms(), "master.analyser", "tap reconnected", false);
                    }
                    Err(failure) => self.record_fatal(&failure.source(), failure.error.to_string()),
                }
            }
            verdict => info!(?verdict, "analysis tap healthy, modules are silent"),
        }
    }

    // ----- queries ---------------------------------------------------------

    /// Magnitude spectrum of the output, `analysis_bins` long.
    pub fn analysis_snapshot(&mut self) -> Vec<f32> {
        let bins = self.config.analysis_bins;
        let tap = self.master.as_ref().and_then(MasterChain::tap);
        let mut spectrum = match (self.renderer.as_deref_mut(), tap) {
            (Some(renderer), Some(tap)) => renderer.frequency_data(tap, bins).unwrap_or_default(),
            _ => Vec::new(),
        };
        spectrum.resize(bins, 0.0);
        spectrum
    }

    pub fn debug_state(&self) -> DebugState {
        DebugState {
            state: self.state,
            current_mood: self.current_mood.clone(),
            target_mood: self.target_mood.clone(),
            playing: self.playing,
            volume: self.volume,
            status: self.status,
            modules: self
                .registry
                .iter()
                .map(|r| ModuleRow {
                    id: r.id.clone(),
                    kind: r.kind.clone(),
                    enabled: r.enabled,
                    playing: r.playing,
                    errors: r.breaker.consecutive(),
                    voices: r.module.status().voices,
                    config: r.config,
                })
                .collect(),
            retiring: self.retiring.iter().map(|r| r.id.clone()).collect(),
            pending_timers: self.timers.pending(),
            live_nodes: self.renderer.as_deref().map_or(0, |r| r.live_node_count()),
            recent_errors: self.errors.recent(10),
            fatal_sources: self.errors.fatal_sources(),
            recovery_attempts: self.recovery_attempts,
            health: self.health.verdict(),
            bypassed_stages: self.master.as_ref().map(MasterChain::bypassed).unwrap_or_default(),
        }
    }

    /// Drain user-facing notifications.
    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.notices.take()
    }

    /// Tear everything down immediately. Returns false if already disposed.
    pub fn dispose(&mut self) -> bool {
        if self.disposed {
            return false;
        }
        info!("orchestrator disposing");
        self.playing = false;
        if let Some(handle) = self.recovery_timer.take() {
            self.timers.cancel(handle);
        }
        self.teardown_graph();
        self.timers.clear();
        self.status = EngineStatus::Idle;
        self.current_mood = None;
        self.disposed = true;
        true
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn mood_state(&self) -> MoodState {
        self.state
    }

    pub fn current_mood(&self) -> Option<&str> {
        self.current_mood.as_deref()
    }

    pub fn moods(&self) -> &MoodTable {
        &self.moods
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// The event loop's clock, in milliseconds.
    pub fn now_ms(&self) -> f64 {
        self.timers.now_ms()
    }
}

/// Run one module call with panics turned into errors.
fn contain<F>(module: &mut dyn GeneratorModule, ctx: &mut ModuleContext<'_>, call: F) -> Result<(), ModuleError>
where
    F: FnOnce(&mut dyn GeneratorModule, &mut ModuleContext<'_>) -> Result<(), ModuleError>,
{
    panic::catch_unwind(AssertUnwindSafe(|| call(module, ctx)))
        .unwrap_or_else(|payload| Err(ModuleError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Feed a call's outcome to the module's breaker. Returns true on success.
fn settle(
    registration: &mut ModuleRegistration,
    op: &str,
    result: Result<(), ModuleError>,
    now_ms: f64,
    errors: &mut ErrorLog,
    notices: &mut NoticeQueue,
) -> bool {
    let err = match result {
        Ok(()) => {
            registration.breaker.record_success();
            return true;
        }
        Err(err) => err,
    };
    errors.record(now_ms, &registration.id, format!("{op}: {err}"), false);
    if registration.breaker.record_failure() {
        registration.enabled = false;
        error!(
            module = %registration.id,
            failures = registration.breaker.consecutive(),
            "module disabled after repeated failures"
        );
        notices.push(
            NoticeLevel::Warning,
            &registration.id,
            format!("{} was disabled after repeated errors", registration.id),
        );
    } else {
        warn!(module = %registration.id, op, %err, "module call failed");
    }
    false
}
