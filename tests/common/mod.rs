//! Fixtures shared by the integration tests: a module that records every
//! call made to it, and a renderer with switchable faults.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use moodscape::dsp::oscillator::Waveform;
use moodscape::engine::event_loop::{ModuleTask, TimerHandle};
use moodscape::modules::{
    GeneratorModule, ModuleBus, ModuleContext, ModuleSettings, ModuleStatus, MoodConfig, UpdateFrame,
};
use moodscape::render::{
    Automation, GraphRenderer, NodeId, NodeSpec, Param, Renderer, RendererFactory, RendererState, SharedRenderer,
};
use moodscape::{
    EngineConfig, ModuleCatalog, ModuleError, MoodBook, OfflineSession, Orchestrator, RenderError,
};

pub const SAMPLE_RATE: f32 = 8_000.0;

/// Timing short enough that transitions and recovery fit in a few seconds.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        transition_time: 1.0,
        stop_fade: 0.5,
        recovery_delay_ms: 100.0,
        health_interval_ms: 200.0,
        probe_window_ms: 100.0,
        ..EngineConfig::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Always,
    /// Every other update
    Alternate,
    Panic,
    /// The next `n` updates, then healthy again
    Times(u32),
    /// Every timer wake-up, while updates succeed
    Timers,
}

/// Shared log and failure switches for every [`RecordingModule`] of a test.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
    failures: Arc<Mutex<HashMap<String, Failure>>>,
}

impl Recorder {
    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn saw(&self, call: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|c| c == call)
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn fail(&self, id: &str, failure: Failure) {
        self.failures.lock().unwrap().insert(id.to_string(), failure);
    }

    /// The failure mode for `id`'s next update; `Times` counts down and
    /// clears itself.
    fn failure(&self, id: &str) -> Option<Failure> {
        let mut failures = self.failures.lock().unwrap();
        let failure = failures.get(id).copied()?;
        if let Failure::Times(left) = failure {
            match left {
                0 => {
                    failures.remove(id);
                    return None;
                }
                1 => {
                    failures.remove(id);
                }
                n => {
                    failures.insert(id.to_string(), Failure::Times(n - 1));
                }
            }
        }
        Some(failure)
    }

    /// A catalog with the built-in kinds plus `recorder`.
    pub fn catalog(&self) -> ModuleCatalog {
        let recorder = self.clone();
        let mut catalog = ModuleCatalog::builtin();
        catalog.register("recorder", move |spec| Box::new(RecordingModule::new(spec.id, recorder.clone())));
        catalog
    }
}

/// A sine at 220 Hz through a bus, logging `call:id[:mood]` for every call.
pub struct RecordingModule {
    id: String,
    recorder: Recorder,
    bus: Option<ModuleBus>,
    osc: Option<NodeId>,
    stopped: Vec<NodeId>,
    timer: Option<TimerHandle>,
    updates: u32,
    base: f32,
    disposed: bool,
}

impl RecordingModule {
    pub fn new(id: &str, recorder: Recorder) -> Self {
        Self {
            id: id.to_string(),
            recorder,
            bus: None,
            osc: None,
            stopped: Vec::new(),
            timer: None,
            updates: 0,
            base: 0.5,
            disposed: false,
        }
    }
}

impl GeneratorModule for RecordingModule {
    fn kind(&self) -> &'static str {
        "recorder"
    }

    fn init(
        &mut self,
        ctx: &mut ModuleContext<'_>,
        output: NodeId,
        settings: &ModuleSettings,
        mood: &str,
        config: MoodConfig,
    ) -> Result<(), ModuleError> {
        self.recorder.log(format!("init:{}:{mood}", self.id));
        self.base = settings.volume;
        self.bus = Some(ModuleBus::create(ctx.renderer, output, config.gain(self.base))?);
        Ok(())
    }

    fn update(&mut self, _ctx: &mut ModuleContext<'_>, _frame: &UpdateFrame<'_>) -> Result<(), ModuleError> {
        self.updates += 1;
        self.recorder.log(format!("update:{}", self.id));
        match self.recorder.failure(&self.id) {
            Some(Failure::Always | Failure::Times(_)) => Err(ModuleError::Failed("injected".into())),
            Some(Failure::Alternate) if self.updates % 2 == 1 => Err(ModuleError::Failed("injected".into())),
            Some(Failure::Panic) => panic!("injected panic in {}", self.id),
            _ => Ok(()),
        }
    }

    fn play(&mut self, ctx: &mut ModuleContext<'_>, start_time: f64) -> Result<(), ModuleError> {
        let bus = self.bus.ok_or(ModuleError::NotInitialized)?;
        if self.osc.is_some() {
            return Ok(());
        }
        self.recorder.log(format!("play:{}", self.id));
        let osc = ctx.renderer.create_node(NodeSpec::oscillator(Waveform::Sine, 220.0))?;
        ctx.renderer.connect(osc, bus.node())?;
        ctx.renderer.start(osc, start_time)?;
        self.osc = Some(osc);
        self.timer = Some(ctx.arm(0.1, ModuleTask::SchedulerWake));
        Ok(())
    }

    fn stop(&mut self, ctx: &mut ModuleContext<'_>, stop_time: f64, fade: f64) -> Result<(), ModuleError> {
        if let Some(osc) = self.osc.take() {
            self.recorder.log(format!("stop:{}", self.id));
            self.stopped.push(osc);
            ctx.renderer.stop(osc, stop_time + fade.max(0.0))?;
        }
        if let Some(timer) = self.timer.take() {
            ctx.cancel(timer);
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
        self.recorder.log(format!("change_mood:{}:{mood}", self.id));
        self.base = settings.volume;
        if let Some(bus) = self.bus {
            let now = ctx.now();
            bus.ramp(ctx.renderer, config.gain(self.base), now, transition)?;
        }
        Ok(())
    }

    fn on_timer(&mut self, ctx: &mut ModuleContext<'_>, handle: TimerHandle, _task: ModuleTask) -> Result<(), ModuleError> {
        if self.timer != Some(handle) {
            return Ok(());
        }
        self.recorder.log(format!("timer:{}", self.id));
        self.timer = Some(ctx.arm(0.1, ModuleTask::SchedulerWake));
        if self.recorder.failure(&self.id) == Some(Failure::Timers) {
            return Err(ModuleError::Failed("injected wake failure".into()));
        }
        Ok(())
    }

    fn dispose(&mut self, ctx: &mut ModuleContext<'_>) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.recorder.log(format!("dispose:{}", self.id));
        if let Some(timer) = self.timer.take() {
            ctx.cancel(timer);
        }
        for node in self.osc.take().into_iter().chain(self.stopped.drain(..)) {
            let _ = ctx.renderer.disconnect(node);
        }
        if let Some(bus) = self.bus.take() {
            bus.release(ctx.renderer);
        }
    }

    fn status(&self) -> ModuleStatus {
        ModuleStatus {
            playing: self.osc.is_some(),
            voices: usize::from(self.osc.is_some()),
        }
    }
}

/// Switches shared by a [`FlakyFactory`] and every renderer it hands out.
#[derive(Clone, Default)]
pub struct Faults {
    /// Renderer creations that fail before one succeeds again
    pub failed_creates: Arc<AtomicU32>,
    /// `NodeSpec` kinds whose creation fails
    pub failing_nodes: Arc<Mutex<HashSet<&'static str>>>,
    /// Analysers read back as silence
    pub blind_analysers: Arc<AtomicBool>,
}

impl Faults {
    pub fn fail_creates(&self, count: u32) {
        self.failed_creates.store(count, Ordering::SeqCst);
    }

    pub fn fail_nodes(&self, kind: &'static str) {
        self.failing_nodes.lock().unwrap().insert(kind);
    }

    pub fn blind(&self) {
        self.blind_analysers.store(true, Ordering::SeqCst);
    }
}

fn spec_kind(spec: &NodeSpec) -> &'static str {
    match spec {
        NodeSpec::Oscillator { .. } => "oscillator",
        NodeSpec::Noise { .. } => "noise",
        NodeSpec::Gain { .. } => "gain",
        NodeSpec::Filter { .. } => "filter",
        NodeSpec::Reverb { .. } => "reverb",
        NodeSpec::Saturator { .. } => "saturator",
        NodeSpec::Analyser { .. } => "analyser",
    }
}

/// A [`SharedRenderer`] with faults injected on the control side.
pub struct FlakyRenderer {
    inner: SharedRenderer,
    faults: Faults,
}

impl Renderer for FlakyRenderer {
    fn current_time(&self) -> f64 {
        self.inner.current_time()
    }

    fn sample_rate(&self) -> f32 {
        self.inner.sample_rate()
    }

    fn state(&self) -> RendererState {
        self.inner.state()
    }

    fn resume(&mut self) -> Result<(), RenderError> {
        self.inner.resume()
    }

    fn suspend(&mut self) -> Result<(), RenderError> {
        self.inner.suspend()
    }

    fn destination(&self) -> NodeId {
        self.inner.destination()
    }

    fn create_node(&mut self, spec: NodeSpec) -> Result<NodeId, RenderError> {
        if self.faults.failing_nodes.lock().unwrap().contains(spec_kind(&spec)) {
            return Err(RenderError::Graph(format!("injected {} failure", spec_kind(&spec))));
        }
        self.inner.create_node(spec)
    }

    fn connect(&mut self, from: NodeId, to: NodeId) -> Result<(), RenderError> {
        self.inner.connect(from, to)
    }

    fn disconnect(&mut self, node: NodeId) -> Result<(), RenderError> {
        self.inner.disconnect(node)
    }

    fn disconnect_outputs(&mut self, node: NodeId) -> Result<(), RenderError> {
        self.inner.disconnect_outputs(node)
    }

    fn automate(&mut self, node: NodeId, param: Param, automation: Automation) -> Result<(), RenderError> {
        self.inner.automate(node, param, automation)
    }

    fn start(&mut self, node: NodeId, at: f64) -> Result<(), RenderError> {
        self.inner.start(node, at)
    }

    fn stop(&mut self, node: NodeId, at: f64) -> Result<(), RenderError> {
        self.inner.stop(node, at)
    }

    fn time_domain_data(&mut self, node: NodeId) -> Result<Vec<f32>, RenderError> {
        let data = self.inner.time_domain_data(node)?;
        if self.faults.blind_analysers.load(Ordering::SeqCst) {
            return Ok(vec![0.0; data.len()]);
        }
        Ok(data)
    }

    fn frequency_data(&mut self, node: NodeId, bins: usize) -> Result<Vec<f32>, RenderError> {
        self.inner.frequency_data(node, bins)
    }

    fn live_node_count(&self) -> usize {
        self.inner.live_node_count()
    }
}

pub struct FlakyFactory {
    shared: SharedRenderer,
    faults: Faults,
    created: bool,
}

impl RendererFactory for FlakyFactory {
    fn create(&mut self) -> Result<Box<dyn Renderer>, RenderError> {
        let pending = self.faults.failed_creates.load(Ordering::SeqCst);
        if pending > 0 {
            self.faults.failed_creates.store(pending - 1, Ordering::SeqCst);
            return Err(RenderError::ContextUnavailable("injected".into()));
        }
        if self.created {
            self.shared.replace(GraphRenderer::new(SAMPLE_RATE));
        }
        self.created = true;
        Ok(Box::new(FlakyRenderer {
            inner: self.shared.clone(),
            faults: self.faults.clone(),
        }))
    }
}

pub struct Rig {
    pub session: OfflineSession,
    pub shared: SharedRenderer,
    pub faults: Faults,
    pub recorder: Recorder,
}

impl Rig {
    pub fn new(book: &str, config: EngineConfig) -> Self {
        let recorder = Recorder::default();
        let moods = MoodBook::from_toml_str(book)
            .unwrap()
            .resolve(&recorder.catalog())
            .unwrap();
        let shared = SharedRenderer::new(GraphRenderer::new(SAMPLE_RATE));
        let faults = Faults::default();
        let factory = FlakyFactory {
            shared: shared.clone(),
            faults: faults.clone(),
            created: false,
        };
        let orchestrator = Orchestrator::new(config, moods, factory);
        Self {
            session: OfflineSession::from_parts(shared.clone(), orchestrator),
            shared,
            faults,
            recorder,
        }
    }

    pub fn orchestrator(&mut self) -> &mut Orchestrator {
        self.session.orchestrator_mut()
    }

    pub fn module_ids(&self) -> Vec<String> {
        self.session
            .orchestrator()
            .debug_state()
            .modules
            .into_iter()
            .map(|m| m.id)
            .collect()
    }
}

pub fn peak(audio: &[f32]) -> f32 {
    audio.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}
