//! The rendering seam.
//!
//! The core never synthesises audio itself. It talks to a real-time renderer
//! through [`Renderer`]: a monotonic clock, a node graph it can build and tear
//! down, and parameter automation that the renderer applies with sample
//! accuracy. Everything about *when* a sound starts is expressed as automation
//! against the renderer's clock, never as "do it now" from a timer callback.
//!
//! [`GraphRenderer`] is the in-process implementation used for live playback
//! and offline bounces; [`SharedRenderer`] lets an audio thread own the render
//! loop while the control context builds the graph.

pub mod automation;
pub mod graph;
pub mod shared;

use std::fmt;

use crate::dsp::{filter::FilterMode, oscillator::Waveform};
use crate::error::RenderError;

pub use automation::{Automation, AutomationLane};
pub use graph::GraphRenderer;
pub use shared::SharedRenderer;

/// Handle to a node inside a renderer. The generation makes handles to freed
/// slots detectable after the slot is reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// What kind of node to create, with its initial parameter values.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeSpec {
    Oscillator {
        waveform: Waveform,
        frequency: f32,
        detune_cents: f32,
    },
    Noise {
        seed: u64,
    },
    Gain {
        gain: f32,
    },
    Filter {
        mode: FilterMode,
        cutoff: f32,
        q: f32,
    },
    Reverb {
        room: f32,
        damping: f32,
        mix: f32,
    },
    Saturator {
        drive: f32,
    },
    Analyser {
        fft_size: usize,
    },
}

impl NodeSpec {
    pub fn is_source(&self) -> bool {
        matches!(self, NodeSpec::Oscillator { .. } | NodeSpec::Noise { .. })
    }

    pub fn gain(gain: f32) -> Self {
        NodeSpec::Gain { gain }
    }

    pub fn oscillator(waveform: Waveform, frequency: f32) -> Self {
        NodeSpec::Oscillator {
            waveform,
            frequency,
            detune_cents: 0.0,
        }
    }

    pub fn filter(mode: FilterMode, cutoff: f32, q: f32) -> Self {
        NodeSpec::Filter { mode, cutoff, q }
    }
}

/// Automatable parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    Gain,
    Frequency,
    Detune,
    Cutoff,
    Q,
    Room,
    Damping,
    Mix,
    Drive,
}

impl Param {
    pub fn name(self) -> &'static str {
        match self {
            Param::Gain => "gain",
            Param::Frequency => "frequency",
            Param::Detune => "detune",
            Param::Cutoff => "cutoff",
            Param::Q => "q",
            Param::Room => "room",
            Param::Damping => "damping",
            Param::Mix => "mix",
            Param::Drive => "drive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererState {
    Running,
    Suspended,
    Closed,
}

/// A real-time audio renderer, seen from the control side.
///
/// All times are in seconds on the renderer's own clock.
pub trait Renderer: Send {
    /// Monotonic clock, advanced by the renderer as audio is produced.
    fn current_time(&self) -> f64;

    fn sample_rate(&self) -> f32;

    fn state(&self) -> RendererState;

    fn resume(&mut self) -> Result<(), RenderError>;

    fn suspend(&mut self) -> Result<(), RenderError>;

    /// The final output node; everything audible ends up here.
    fn destination(&self) -> NodeId;

    fn create_node(&mut self, spec: NodeSpec) -> Result<NodeId, RenderError>;

    fn connect(&mut self, from: NodeId, to: NodeId) -> Result<(), RenderError>;

    /// Detach `node` from every connection and free it.
    /// Freeing an already freed node is an error.
    fn disconnect(&mut self, node: NodeId) -> Result<(), RenderError>;

    /// Detach only the outgoing connections of `node`, keeping it alive.
    fn disconnect_outputs(&mut self, node: NodeId) -> Result<(), RenderError>;

    fn automate(&mut self, node: NodeId, param: Param, automation: Automation) -> Result<(), RenderError>;

    /// Start a source node at `at`.
    fn start(&mut self, node: NodeId, at: f64) -> Result<(), RenderError>;

    /// Stop a source node at `at`. A later call replaces an earlier stop time.
    fn stop(&mut self, node: NodeId, at: f64) -> Result<(), RenderError>;

    /// Recent output of an analyser node, oldest first.
    fn time_domain_data(&mut self, node: NodeId) -> Result<Vec<f32>, RenderError>;

    /// Log-spaced magnitude spectrum of an analyser node, each bin in 0..=1.
    fn frequency_data(&mut self, node: NodeId, bins: usize) -> Result<Vec<f32>, RenderError>;

    /// Nodes currently allocated, excluding the destination.
    fn live_node_count(&self) -> usize;
}

impl<R: Renderer + ?Sized> Renderer for Box<R> {
    fn current_time(&self) -> f64 {
        (**self).current_time()
    }

    fn sample_rate(&self) -> f32 {
        (**self).sample_rate()
    }

    fn state(&self) -> RendererState {
        (**self).state()
    }

    fn resume(&mut self) -> Result<(), RenderError> {
        (**self).resume()
    }

    fn suspend(&mut self) -> Result<(), RenderError> {
        (**self).suspend()
    }

    fn destination(&self) -> NodeId {
        (**self).destination()
    }

    fn create_node(&mut self, spec: NodeSpec) -> Result<NodeId, RenderError> {
        (**self).create_node(spec)
    }

    fn connect(&mut self, from: NodeId, to: NodeId) -> Result<(), RenderError> {
        (**self).connect(from, to)
    }

    fn disconnect(&mut self, node: NodeId) -> Result<(), RenderError> {
        (**self).disconnect(node)
    }

    fn disconnect_outputs(&mut self, node: NodeId) -> Result<(), RenderError> {
        (**self).disconnect_outputs(node)
    }

    fn automate(&mut self, node: NodeId, param: Param, automation: Automation) -> Result<(), RenderError> {
        (**self).automate(node, param, automation)
    }

    fn start(&mut self, node: NodeId, at: f64) -> Result<(), RenderError> {
        (**self).start(node, at)
    }

    fn stop(&mut self, node: NodeId, at: f64) -> Result<(), RenderError> {
        (**self).stop(node, at)
    }

    fn time_domain_data(&mut self, node: NodeId) -> Result<Vec<f32>, RenderError> {
        (**self).time_domain_data(node)
    }

    fn frequency_data(&mut self, node: NodeId, bins: usize) -> Result<Vec<f32>, RenderError> {
        (**self).frequency_data(node, bins)
    }

    fn live_node_count(&self) -> usize {
        (**self).live_node_count()
    }
}

/// Creates renderers. The orchestrator calls it again after a fatal renderer
/// failure, a bounded number of times.
pub trait RendererFactory {
    fn create(&mut self) -> Result<Box<dyn Renderer>, RenderError>;
}

impl<F> RendererFactory for F
where
    F: FnMut() -> Result<Box<dyn Renderer>, RenderError>,
{
    fn create(&mut self) -> Result<Box<dyn Renderer>, RenderError> {
        self()
    }
}
