use std::fmt;

use tracing::trace;

use crate::engine::event_loop::TimerHandle;
use crate::error::RenderError;
use crate::render::{Automation, NodeId, NodeSpec, Param, Renderer};
use crate::synth::envelope::FilterEnvelope;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(pub u64);

impl fmt::Debug for VoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "voice#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Active,    // Scheduled or sounding, envelope not yet released early
    Releasing, // Released ahead of its natural end
}

/// A realized voice: the graph nodes it owns and its pending cleanup.
pub struct Voice {
    pub(crate) nodes: Vec<NodeId>,
    pub(crate) sources: Vec<NodeId>,
    /// Envelope gain every source of the voice ends up in
    pub(crate) amp: NodeId,
    pub(crate) filter: Option<(NodeId, FilterEnvelope)>,
    pub(crate) cleanup: Option<TimerHandle>,
    pub(crate) state: VoiceState,
    pub(crate) onset: f64,
    /// When the sources stop
    pub(crate) stop_at: f64,
    pub(crate) release: f64,
}

impl Voice {
    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn onset(&self) -> f64 {
        self.onset
    }

    pub fn stop_at(&self) -> f64 {
        self.stop_at
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Records every node created while a voice is wired up, so a failure part
/// way through can free exactly what exists.
pub struct VoiceBuilder<'r> {
    renderer: &'r mut dyn Renderer,
    created: Vec<NodeId>,
    sources: Vec<NodeId>,
    output: Option<NodeId>,
    filter: Option<(NodeId, FilterEnvelope)>,
}

impl<'r> VoiceBuilder<'r> {
    pub fn new(renderer: &'r mut dyn Renderer) -> Self {
        Self {
            renderer,
            created: Vec::new(),
            sources: Vec::new(),
            output: None,
            filter: None,
        }
    }

    pub fn add(&mut self, spec: NodeSpec) -> Result<NodeId, RenderError> {
        let is_source = spec.is_source();
        let node = self.renderer.create_node(spec)?;
        self.created.push(node);
        if is_source {
            self.sources.push(node);
        }
        Ok(node)
    }

    pub fn connect(&mut self, from: NodeId, to: NodeId) -> Result<(), RenderError> {
        self.renderer.connect(from, to)
    }

    /// Connect `from` into the voice's envelope gain.
    pub fn to_output(&mut self, from: NodeId) -> Result<(), RenderError> {
        let output = self
            .output
            .ok_or_else(|| RenderError::Graph("voice output not created yet".into()))?;
        self.renderer.connect(from, output)
    }

    pub fn automate(&mut self, node: NodeId, param: Param, automation: Automation) -> Result<(), RenderError> {
        self.renderer.automate(node, param, automation)
    }

    /// Sweep `node`'s cutoff with `envelope` for the life of the voice.
    pub fn envelope_filter(&mut self, node: NodeId, envelope: FilterEnvelope) {
        self.filter = Some((node, envelope));
    }

    pub(crate) fn set_output(&mut self, node: NodeId) {
        self.output = Some(node);
    }

    pub(crate) fn renderer(&mut self) -> &mut dyn Renderer {
        &mut *self.renderer
    }

    pub(crate) fn sources(&self) -> &[NodeId] {
        &self.sources
    }

    pub(crate) fn filter(&self) -> Option<(NodeId, FilterEnvelope)> {
        self.filter
    }

    /// Free every node created so far.
    pub(crate) fn abort(self) -> usize {
        let count = self.created.len();
        release_nodes(self.renderer, &self.created);
        count
    }

    pub(crate) fn finish(self) -> (Vec<NodeId>, Vec<NodeId>) {
        (self.created, self.sources)
    }
}

/// Free `nodes`, ignoring ones that are already gone.
pub(crate) fn release_nodes(renderer: &mut dyn Renderer, nodes: &[NodeId]) {
    for &node in nodes {
        if let Err(err) = renderer.disconnect(node) {
            trace!(?node, %err, "node already released");
        }
    }
}
