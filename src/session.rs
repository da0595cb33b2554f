//! Offline rendering.
//!
//! [`OfflineSession`] plays the role the audio device and the host loop play
//! live: it renders one block, then ticks the orchestrator at the block's end
//! time. The session clock counts frames and never resets, so timers keep
//! working across a renderer that was closed and recreated.

use std::path::Path;

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::info;

use crate::config::EngineConfig;
use crate::error::{ExportError, RenderError};
use crate::modules::ParamMap;
use crate::mood::MoodTable;
use crate::orchestrator::Orchestrator;
use crate::render::{GraphRenderer, Renderer, SharedRenderer};

pub const DEFAULT_BLOCK: usize = 128;

/// A factory that hands out clones of `shared`, swapping in a fresh graph
/// every time after the first.
pub fn shared_factory(
    shared: &SharedRenderer,
    sample_rate: f32,
) -> impl FnMut() -> Result<Box<dyn Renderer>, RenderError> + Send + 'static {
    let shared = shared.clone();
    let mut created = false;
    move || {
        if created {
            shared.replace(GraphRenderer::new(sample_rate));
        }
        created = true;
        Ok(Box::new(shared.clone()) as Box<dyn Renderer>)
    }
}

pub struct OfflineSession {
    shared: SharedRenderer,
    orchestrator: Orchestrator,
    sample_rate: f32,
    block: usize,
    frames: u64,
    params: ParamMap,
}

impl OfflineSession {
    pub fn new(config: EngineConfig, moods: MoodTable, sample_rate: f32) -> Self {
        let shared = SharedRenderer::new(GraphRenderer::new(sample_rate));
        let orchestrator = Orchestrator::new(config, moods, shared_factory(&shared, sample_rate));
        Self::from_parts(shared, orchestrator)
    }

    /// Drive an orchestrator whose renderers all come from `shared`.
    pub fn from_parts(shared: SharedRenderer, orchestrator: Orchestrator) -> Self {
        Self {
            sample_rate: shared.sample_rate(),
            shared,
            orchestrator,
            block: DEFAULT_BLOCK,
            frames: 0,
            params: ParamMap::new(),
        }
    }

    pub fn with_block_size(mut self, frames: usize) -> Self {
        self.block = frames.clamp(1, crate::MAX_BLOCK_SIZE);
        self
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn orchestrator_mut(&mut self) -> &mut Orchestrator {
        &mut self.orchestrator
    }

    pub fn renderer(&self) -> &SharedRenderer {
        &self.shared
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Session time in milliseconds.
    pub fn now_ms(&self) -> f64 {
        self.frames as f64 * 1000.0 / self.sample_rate as f64
    }

    /// A host parameter passed to every module update.
    pub fn set_param(&mut self, name: &str, value: f32) {
        self.params.insert(name.to_string(), value);
    }

    /// Run for `seconds`, discarding the audio.
    pub fn advance(&mut self, seconds: f64) {
        self.run(seconds, |_| {});
    }

    /// Run for `seconds` and return the rendered audio.
    pub fn render(&mut self, seconds: f64) -> Vec<f32> {
        let mut audio = Vec::with_capacity(self.frames_for(seconds));
        self.run(seconds, |block| audio.extend_from_slice(block));
        audio
    }

    /// Render `seconds` straight into a 16-bit mono WAV file.
    pub fn bounce(&mut self, seconds: f64, path: impl AsRef<Path>) -> Result<usize, ExportError> {
        let audio = self.render(seconds);
        write_wav(&audio, self.sample_rate as u32, path.as_ref())?;
        info!(path = %path.as_ref().display(), frames = audio.len(), "bounce written");
        Ok(audio.len())
    }

    fn frames_for(&self, seconds: f64) -> usize {
        (seconds.max(0.0) * self.sample_rate as f64).round() as usize
    }

    fn run(&mut self, seconds: f64, mut sink: impl FnMut(&[f32])) {
        let mut remaining = self.frames_for(seconds);
        let mut block = vec![0.0; self.block];
        if self.frames == 0 {
            self.orchestrator.tick(0.0, &self.params);
        }
        while remaining > 0 {
            let len = remaining.min(self.block);
            self.shared.render(&mut block[..len]);
            sink(&block[..len]);
            self.frames += len as u64;
            remaining -= len;
            self.orchestrator.tick(self.now_ms(), &self.params);
        }
    }
}

/// Write mono samples as 16-bit PCM, clamped to -1..=1.
pub fn write_wav(samples: &[f32], sample_rate: u32, path: &Path) -> Result<(), ExportError> {
    if samples.is_empty() {
        return Err(ExportError::Empty);
    }
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}
