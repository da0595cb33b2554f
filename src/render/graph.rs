//! In-process renderer.
//!
//! Nodes live in a generational slot arena. Rendering is pull based: the
//! destination asks each of its inputs for a block, each input asks its own
//! inputs, and every node renders at most once per block. Sources are gated
//! per sample by their start/stop times and gain is evaluated per sample from
//! its automation lane, so onsets land on the exact sample the control side
//! asked for. Filter, reverb and drive parameters are evaluated once per block.

use crate::dsp::{
    analyser::Analyser,
    filter::SVFilter,
    oscillator::{cents_to_ratio, Noise, Oscillator},
    reverb::SchroederReverb,
    saturate::saturate_buffer,
};
use crate::error::RenderError;
use crate::render::{Automation, AutomationLane, NodeId, NodeSpec, Param, Renderer, RendererState};
use crate::MAX_BLOCK_SIZE;

/// Blocks between automation lane compactions.
const COMPACT_EVERY: u64 = 32;

enum NodeKind {
    Oscillator(Oscillator),
    Noise(Noise),
    Gain,
    Filter(SVFilter),
    Reverb(Box<SchroederReverb>),
    Saturator,
    Analyser(Box<Analyser>),
    Destination,
}

impl NodeKind {
    fn is_source(&self) -> bool {
        matches!(self, NodeKind::Oscillator(_) | NodeKind::Noise(_))
    }
}

struct NodeEntry {
    kind: NodeKind,
    inputs: Vec<NodeId>,
    lanes: Vec<(Param, AutomationLane)>,
    start: Option<f64>,
    stop: Option<f64>,
    output: Vec<f32>,
    rendered_block: u64,
}

impl NodeEntry {
    fn lane(&self, param: Param) -> Option<&AutomationLane> {
        self.lanes.iter().find(|(p, _)| *p == param).map(|(_, lane)| lane)
    }

    fn lane_mut(&mut self, param: Param) -> Option<&mut AutomationLane> {
        self.lanes
            .iter_mut()
            .find(|(p, _)| *p == param)
            .map(|(_, lane)| lane)
    }

    fn value(&self, param: Param, t: f64, fallback: f32) -> f32 {
        self.lane(param).map_or(fallback, |lane| lane.value_at(t))
    }

    #[inline]
    fn is_sounding(&self, t: f64) -> bool {
        self.start.is_some_and(|start| t >= start) && self.stop.map_or(true, |stop| t < stop)
    }

    /// Render one block from the mixed `input`.
    fn process(&mut self, input: &[f32], t0: f64, sample_rate: f32) {
        let len = input.len();
        let dt = 1.0 / sample_rate as f64;

        // Sources read their lanes per sample; take the oscillator out of
        // `kind` so the lanes can be borrowed alongside it.
        match &mut self.kind {
            NodeKind::Oscillator(_) | NodeKind::Noise(_) => {
                let mut kind = std::mem::replace(&mut self.kind, NodeKind::Gain);
                for i in 0..len {
                    let t = t0 + i as f64 * dt;
                    self.output[i] = if self.is_sounding(t) {
                        match &mut kind {
                            NodeKind::Oscillator(osc) => {
                                let freq = self.value(Param::Frequency, t, 440.0)
                                    * cents_to_ratio(self.value(Param::Detune, t, 0.0));
                                osc.next_sample(freq, sample_rate)
                            }
                            NodeKind::Noise(noise) => noise.next_sample(),
                            _ => 0.0,
                        }
                    } else {
                        0.0
                    };
                }
                self.kind = kind;
            }
            NodeKind::Gain => {
                for i in 0..len {
                    let t = t0 + i as f64 * dt;
                    self.output[i] = input[i] * self.value(Param::Gain, t, 1.0);
                }
            }
            NodeKind::Filter(_) => {
                let cutoff = self.value(Param::Cutoff, t0, 1000.0);
                let q = self.value(Param::Q, t0, 0.707);
                let out = &mut self.output[..len];
                out.copy_from_slice(input);
                if let NodeKind::Filter(filter) = &mut self.kind {
                    filter.process(out, cutoff, q, sample_rate);
                }
            }
            NodeKind::Reverb(_) => {
                let room = self.value(Param::Room, t0, 0.5);
                let damping = self.value(Param::Damping, t0, 0.5);
                let mix = self.value(Param::Mix, t0, 0.3).clamp(0.0, 1.0);
                if let NodeKind::Reverb(reverb) = &mut self.kind {
                    reverb.set_room(room);
                    reverb.set_damping(damping);
                    for (out, &dry) in self.output[..len].iter_mut().zip(input) {
                        let wet = reverb.process(dry);
                        *out = dry * (1.0 - mix) + wet * mix;
                    }
                }
            }
            NodeKind::Saturator => {
                let drive = self.value(Param::Drive, t0, 1.0);
                let out = &mut self.output[..len];
                out.copy_from_slice(input);
                saturate_buffer(out, drive);
            }
            NodeKind::Analyser(analyser) => {
                analyser.capture(input);
                self.output[..len].copy_from_slice(input);
            }
            NodeKind::Destination => {
                self.output[..len].copy_from_slice(input);
            }
        }
    }
}

struct Slot {
    generation: u32,
    entry: Option<NodeEntry>,
}

pub struct GraphRenderer {
    sample_rate: f32,
    /// Frames rendered so far; the clock is derived from this.
    frames: u64,
    blocks: u64,
    state: RendererState,
    slots: Vec<Slot>,
    free: Vec<u32>,
    destination: NodeId,
    live: usize,
    scratch_pool: Vec<Vec<f32>>,
    noise_seed: u64,
}

impl GraphRenderer {
    pub fn new(sample_rate: f32) -> Self {
        let destination = NodeEntry {
            kind: NodeKind::Destination,
            inputs: Vec::new(),
            lanes: Vec::new(),
            start: None,
            stop: None,
            output: vec![0.0; MAX_BLOCK_SIZE],
            rendered_block: u64::MAX,
        };
        Self {
            sample_rate,
            frames: 0,
            blocks: 0,
            state: RendererState::Running,
            slots: vec![Slot {
                generation: 0,
                entry: Some(destination),
            }],
            free: Vec::new(),
            destination: NodeId {
                index: 0,
                generation: 0,
            },
            live: 0,
            scratch_pool: Vec::new(),
            noise_seed: 0x5eed,
        }
    }

    /// Close the context; every later graph call fails with `Closed`.
    pub fn close(&mut self) {
        self.state = RendererState::Closed;
    }

    /// Render mono output. Advances the clock by `out.len()` frames while
    /// running; a suspended or closed renderer outputs silence and its clock
    /// stands still.
    pub fn render(&mut self, out: &mut [f32]) {
        if self.state != RendererState::Running {
            out.fill(0.0);
            return;
        }
        for chunk in out.chunks_mut(MAX_BLOCK_SIZE) {
            self.render_chunk(chunk);
        }
    }

    /// Advance the clock by `seconds`, discarding the audio.
    pub fn advance(&mut self, seconds: f64) {
        let mut remaining = (seconds * self.sample_rate as f64).round() as usize;
        let mut block = vec![0.0; MAX_BLOCK_SIZE];
        while remaining > 0 {
            let len = remaining.min(MAX_BLOCK_SIZE);
            self.render(&mut block[..len]);
            remaining -= len;
            if self.state != RendererState::Running {
                break;
            }
        }
    }

    fn render_chunk(&mut self, out: &mut [f32]) {
        let len = out.len();
        let t0 = self.current_time();
        self.blocks += 1;

        self.render_node(self.destination.index as usize, len, t0);
        if let Some(dest) = &self.slots[self.destination.index as usize].entry {
            out.copy_from_slice(&dest.output[..len]);
        }

        self.frames += len as u64;

        if self.blocks % COMPACT_EVERY == 0 {
            let now = self.current_time();
            for entry in self.slots.iter_mut().filter_map(|s| s.entry.as_mut()) {
                for (_, lane) in &mut entry.lanes {
                    lane.compact(now);
                }
            }
        }
    }

    fn render_node(&mut self, index: usize, len: usize, t0: f64) {
        // A taken entry means we are inside it already (a cycle); it reads as silence.
        let Some(mut entry) = self.slots[index].entry.take() else {
            return;
        };
        if entry.rendered_block == self.blocks {
            self.slots[index].entry = Some(entry);
            return;
        }

        let mut input = self.scratch_pool.pop().unwrap_or_else(|| vec![0.0; MAX_BLOCK_SIZE]);
        input[..len].fill(0.0);

        if !entry.kind.is_source() {
            for &source in &entry.inputs {
                if !self.is_valid(source) {
                    continue;
                }
                let source_index = source.index as usize;
                self.render_node(source_index, len, t0);
                if let Some(rendered) = &self.slots[source_index].entry {
                    for (acc, s) in input[..len].iter_mut().zip(&rendered.output[..len]) {
                        *acc += s;
                    }
                }
            }
        }

        entry.process(&input[..len], t0, self.sample_rate);
        entry.rendered_block = self.blocks;

        self.scratch_pool.push(input);
        self.slots[index].entry = Some(entry);
    }

    fn is_valid(&self, id: NodeId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.generation == id.generation && slot.entry.is_some())
    }

    fn entry_mut(&mut self, id: NodeId) -> Result<&mut NodeEntry, RenderError> {
        match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation => {
                slot.entry.as_mut().ok_or(RenderError::UnknownNode(id))
            }
            _ => Err(RenderError::UnknownNode(id)),
        }
    }

    fn ensure_open(&self) -> Result<(), RenderError> {
        if self.state == RendererState::Closed {
            Err(RenderError::Closed)
        } else {
            Ok(())
        }
    }

    fn build_entry(&mut self, spec: NodeSpec) -> NodeEntry {
        let now = self.current_time();
        let lane = |param: Param, value: f32| (param, AutomationLane::starting_at(value, now));

        let (kind, lanes) = match spec {
            NodeSpec::Oscillator {
                waveform,
                frequency,
                detune_cents,
            } => (
                NodeKind::Oscillator(Oscillator::new(waveform)),
                vec![lane(Param::Frequency, frequency), lane(Param::Detune, detune_cents)],
            ),
            NodeSpec::Noise { seed } => {
                self.noise_seed = self.noise_seed.wrapping_add(1);
                (NodeKind::Noise(Noise::new(seed ^ self.noise_seed)), Vec::new())
            }
            NodeSpec::Gain { gain } => (NodeKind::Gain, vec![lane(Param::Gain, gain)]),
            NodeSpec::Filter { mode, cutoff, q } => (
                NodeKind::Filter(SVFilter::new(mode)),
                vec![lane(Param::Cutoff, cutoff), lane(Param::Q, q)],
            ),
            NodeSpec::Reverb { room, damping, mix } => (
                NodeKind::Reverb(Box::new(SchroederReverb::new(self.sample_rate))),
                vec![
                    lane(Param::Room, room),
                    lane(Param::Damping, damping),
                    lane(Param::Mix, mix),
                ],
            ),
            NodeSpec::Saturator { drive } => (NodeKind::Saturator, vec![lane(Param::Drive, drive)]),
            NodeSpec::Analyser { fft_size } => (
                NodeKind::Analyser(Box::new(Analyser::new(fft_size, self.sample_rate))),
                Vec::new(),
            ),
        };

        NodeEntry {
            kind,
            inputs: Vec::new(),
            lanes,
            start: None,
            stop: None,
            output: vec![0.0; MAX_BLOCK_SIZE],
            rendered_block: u64::MAX,
        }
    }

    fn analyser_mut(&mut self, id: NodeId) -> Result<&mut Analyser, RenderError> {
        match &mut self.entry_mut(id)?.kind {
            NodeKind::Analyser(analyser) => Ok(analyser),
            _ => Err(RenderError::NotAnAnalyser(id)),
        }
    }
}

impl Renderer for GraphRenderer {
    fn current_time(&self) -> f64 {
        self.frames as f64 / self.sample_rate as f64
    }

    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn state(&self) -> RendererState {
        self.state
    }

    fn resume(&mut self) -> Result<(), RenderError> {
        self.ensure_open()?;
        self.state = RendererState::Running;
        Ok(())
    }

    fn suspend(&mut self) -> Result<(), RenderError> {
        self.ensure_open()?;
        self.state = RendererState::Suspended;
        Ok(())
    }

    fn destination(&self) -> NodeId {
        self.destination
    }

    fn create_node(&mut self, spec: NodeSpec) -> Result<NodeId, RenderError> {
        self.ensure_open()?;
        let entry = self.build_entry(spec);
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                NodeId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        self.live += 1;
        Ok(id)
    }

    fn connect(&mut self, from: NodeId, to: NodeId) -> Result<(), RenderError> {
        self.ensure_open()?;
        if !self.is_valid(from) {
            return Err(RenderError::UnknownNode(from));
        }
        let target = self.entry_mut(to)?;
        if target.kind.is_source() {
            return Err(RenderError::Graph(format!("source {to:?} has no inputs")));
        }
        if !target.inputs.contains(&from) {
            target.inputs.push(from);
        }
        Ok(())
    }

    fn disconnect(&mut self, node: NodeId) -> Result<(), RenderError> {
        if node == self.destination {
            return Err(RenderError::Graph("the destination cannot be released".into()));
        }
        self.disconnect_outputs(node)?;
        let slot = &mut self.slots[node.index as usize];
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(node.index);
        self.live -= 1;
        Ok(())
    }

    fn disconnect_outputs(&mut self, node: NodeId) -> Result<(), RenderError> {
        if !self.is_valid(node) {
            return Err(RenderError::UnknownNode(node));
        }
        for entry in self.slots.iter_mut().filter_map(|s| s.entry.as_mut()) {
            entry.inputs.retain(|&input| input != node);
        }
        Ok(())
    }

    fn automate(&mut self, node: NodeId, param: Param, automation: Automation) -> Result<(), RenderError> {
        self.ensure_open()?;
        let entry = self.entry_mut(node)?;
        let lane = entry.lane_mut(param).ok_or(RenderError::UnsupportedParam {
            node,
            param: param.name(),
        })?;
        lane.apply(automation);
        Ok(())
    }

    fn start(&mut self, node: NodeId, at: f64) -> Result<(), RenderError> {
        self.ensure_open()?;
        let entry = self.entry_mut(node)?;
        if !entry.kind.is_source() {
            return Err(RenderError::NotASource(node));
        }
        entry.start = Some(at);
        Ok(())
    }

    fn stop(&mut self, node: NodeId, at: f64) -> Result<(), RenderError> {
        self.ensure_open()?;
        let entry = self.entry_mut(node)?;
        if !entry.kind.is_source() {
            return Err(RenderError::NotASource(node));
        }
        entry.stop = Some(at);
        Ok(())
    }

    fn time_domain_data(&mut self, node: NodeId) -> Result<Vec<f32>, RenderError> {
        Ok(self.analyser_mut(node)?.time_domain())
    }

    fn frequency_data(&mut self, node: NodeId, bins: usize) -> Result<Vec<f32>, RenderError> {
        Ok(self.analyser_mut(node)?.spectrum(bins))
    }

    fn live_node_count(&self) -> usize {
        self.live
    }
}
