//! A [`GraphRenderer`] shared between the audio callback and the control side.
//!
//! The audio thread calls [`SharedRenderer::render`] from its output callback;
//! the orchestrator holds another clone as its `Box<dyn Renderer>`. The lock is
//! held for one block at a time.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::RenderError;
use crate::render::{Automation, GraphRenderer, NodeId, NodeSpec, Param, Renderer, RendererState};

#[derive(Clone)]
pub struct SharedRenderer {
    inner: Arc<Mutex<GraphRenderer>>,
    destination: NodeId,
    sample_rate: f32,
}

impl SharedRenderer {
    pub fn new(renderer: GraphRenderer) -> Self {
        let destination = renderer.destination();
        let sample_rate = renderer.sample_rate();
        Self {
            inner: Arc::new(Mutex::new(renderer)),
            destination,
            sample_rate,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, GraphRenderer>, RenderError> {
        self.inner
            .lock()
            .map_err(|_| RenderError::ContextUnavailable("renderer lock poisoned".into()))
    }

    /// Fill `out` from the graph. A poisoned lock renders silence.
    pub fn render(&self, out: &mut [f32]) {
        match self.inner.lock() {
            Ok(mut renderer) => renderer.render(out),
            Err(_) => out.fill(0.0),
        }
    }

    /// Close the underlying renderer, as an audio device loss would.
    pub fn close(&self) {
        if let Ok(mut renderer) = self.inner.lock() {
            renderer.close();
        }
    }

    /// Swap in a fresh graph. Every clone, including the one the audio
    /// callback holds, renders from it from the next block on.
    pub fn replace(&self, renderer: GraphRenderer) {
        match self.inner.lock() {
            Ok(mut inner) => *inner = renderer,
            Err(poisoned) => {
                *poisoned.into_inner() = renderer;
                self.inner.clear_poison();
            }
        }
    }
}

impl Renderer for SharedRenderer {
    fn current_time(&self) -> f64 {
        self.lock().map_or(0.0, |r| r.current_time())
    }

    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn state(&self) -> RendererState {
        self.lock().map_or(RendererState::Closed, |r| r.state())
    }

    fn resume(&mut self) -> Result<(), RenderError> {
        self.lock()?.resume()
    }

    fn suspend(&mut self) -> Result<(), RenderError> {
        self.lock()?.suspend()
    }

    fn destination(&self) -> NodeId {
        self.destination
    }

    fn create_node(&mut self, spec: NodeSpec) -> Result<NodeId, RenderError> {
        self.lock()?.create_node(spec)
    }

    fn connect(&mut self, from: NodeId, to: NodeId) -> Result<(), RenderError> {
        self.lock()?.connect(from, to)
    }

    fn disconnect(&mut self, node: NodeId) -> Result<(), RenderError> {
        self.lock()?.disconnect(node)
    }

    fn disconnect_outputs(&mut self, node: NodeId) -> Result<(), RenderError> {
        self.lock()?.disconnect_outputs(node)
    }

    fn automate(&mut self, node: NodeId, param: Param, automation: Automation) -> Result<(), RenderError> {
        self.lock()?.automate(node, param, automation)
    }

    fn start(&mut self, node: NodeId, at: f64) -> Result<(), RenderError> {
        self.lock()?.start(node, at)
    }

    fn stop(&mut self, node: NodeId, at: f64) -> Result<(), RenderError> {
        self.lock()?.stop(node, at)
    }

    fn time_domain_data(&mut self, node: NodeId) -> Result<Vec<f32>, RenderError> {
        self.lock()?.time_domain_data(node)
    }

    fn frequency_data(&mut self, node: NodeId, bins: usize) -> Result<Vec<f32>, RenderError> {
        self.lock()?.frequency_data(node, bins)
    }

    fn live_node_count(&self) -> usize {
        self.lock().map_or(0, |r| r.live_node_count())
    }
}
