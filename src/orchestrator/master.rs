/*
Master Signal Chain
===================

Every module bus feeds one fixed chain:

  module buses ──→ input ──→ warmth ──→ reverb ──→ saturator ──→ output ──→ tap ──→ destination
                   (gain)    (lowpass)  (schroeder) (soft clip)   (gain)    (analyser)

`input` and `output` are essential: without them nothing reaches the
destination, so a failure there fails the whole chain. The stages between
them, and the tap, are built one at a time; a stage that cannot be built or
wired is left out and the chain closes around it. Each dropped stage is
reported separately so the orchestrator can record it as its own fatal
source.
*/

use tracing::{debug, trace, warn};

use crate::dsp::filter::FilterMode;
use crate::error::RenderError;
use crate::mood::MasterSettings;
use crate::render::{Automation, NodeId, NodeSpec, Param, Renderer};
use crate::synth::voice::release_nodes;

/// A stage that could not be built, named for the error log.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    pub stage: &'static str,
    pub error: RenderError,
}

impl StageFailure {
    /// `master.<stage>`
    pub fn source(&self) -> String {
        format!("master.{}", self.stage)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasterChain {
    input: NodeId,
    warmth: Option<NodeId>,
    reverb: Option<NodeId>,
    saturator: Option<NodeId>,
    output: NodeId,
    tap: Option<NodeId>,
    fft_size: usize,
}

impl MasterChain {
    /// Build the chain with `master` settings and output gain
    /// `master.volume * volume`. Bypassed stages come back as failures.
    pub fn build(
        renderer: &mut dyn Renderer,
        master: &MasterSettings,
        volume: f32,
        fft_size: usize,
    ) -> Result<(Self, Vec<StageFailure>), StageFailure> {
        let input = renderer
            .create_node(NodeSpec::gain(1.0))
            .map_err(|error| StageFailure { stage: "input", error })?;
        let output = match renderer.create_node(NodeSpec::gain(master.volume * volume)) {
            Ok(output) => output,
            Err(error) => {
                release_nodes(renderer, &[input]);
                return Err(StageFailure { stage: "output", error });
            }
        };

        let mut failures = Vec::new();
        let mut last = input;
        let mut stage = |renderer: &mut dyn Renderer, name: &'static str, spec: NodeSpec| {
            let built = renderer.create_node(spec).and_then(|node| match renderer.connect(last, node) {
                Ok(()) => Ok(node),
                Err(err) => {
                    release_nodes(renderer, &[node]);
                    Err(err)
                }
            });
            match built {
                Ok(node) => {
                    last = node;
                    Some(node)
                }
                Err(error) => {
                    warn!(stage = name, %error, "master stage bypassed");
                    failures.push(StageFailure { stage: name, error });
                    None
                }
            }
        };

        let warmth = stage(renderer, "warmth", NodeSpec::filter(FilterMode::LowPass, master.warmth, 0.5));
        let reverb = stage(
            renderer,
            "reverb",
            NodeSpec::Reverb {
                room: master.reverb.room,
                damping: master.reverb.damping,
                mix: master.reverb.mix,
            },
        );
        let saturator = stage(renderer, "saturator", NodeSpec::Saturator { drive: master.drive });

        let mut chain = Self {
            input,
            warmth,
            reverb,
            saturator,
            output,
            tap: None,
            fft_size,
        };
        if let Err(error) = renderer.connect(last, output) {
            chain.release(renderer);
            return Err(StageFailure { stage: "output", error });
        }
        if let Err(failure) = chain.attach_tap(renderer) {
            failures.push(failure);
            if let Err(error) = renderer.connect(output, renderer.destination()) {
                chain.release(renderer);
                return Err(StageFailure { stage: "output", error });
            }
        }
        debug!(bypassed = failures.len(), "master chain built");
        Ok((chain, failures))
    }

    fn attach_tap(&mut self, renderer: &mut dyn Renderer) -> Result<(), StageFailure> {
        let failed = |error| StageFailure { stage: "analyser", error };
        let tap = renderer
            .create_node(NodeSpec::Analyser { fft_size: self.fft_size })
            .map_err(failed)?;
        let wired = renderer
            .connect(self.output, tap)
            .and_then(|()| renderer.connect(tap, renderer.destination()));
        if let Err(error) = wired {
            release_nodes(renderer, &[tap]);
            // the output may already feed the half-wired tap
            if let Err(err) = renderer.disconnect_outputs(self.output) {
                trace!(%err, "master output already detached");
            }
            return Err(failed(error));
        }
        self.tap = Some(tap);
        Ok(())
    }

    /// Replace the analysis tap with a fresh one.
    pub fn reconnect_tap(&mut self, renderer: &mut dyn Renderer) -> Result<(), StageFailure> {
        if let Some(old) = self.tap.take() {
            release_nodes(renderer, &[old]);
        }
        if let Err(err) = renderer.disconnect_outputs(self.output) {
            trace!(%err, "master output already detached");
        }
        match self.attach_tap(renderer) {
            Ok(()) => Ok(()),
            Err(failure) => {
                // keep the mix audible without the tap
                renderer
                    .connect(self.output, renderer.destination())
                    .map_err(|error| StageFailure { stage: "output", error })?;
                Err(failure)
            }
        }
    }

    /// Where module buses connect.
    pub fn input(&self) -> NodeId {
        self.input
    }

    pub fn tap(&self) -> Option<NodeId> {
        self.tap
    }

    pub fn bypassed(&self) -> Vec<&'static str> {
        [("warmth", self.warmth), ("reverb", self.reverb), ("saturator", self.saturator), ("analyser", self.tap)]
            .into_iter()
            .filter(|(_, node)| node.is_none())
            .map(|(name, _)| name)
            .collect()
    }

    /// Move every stage to `master` over `time` seconds from `at`.
    pub fn apply(
        &self,
        renderer: &mut dyn Renderer,
        master: &MasterSettings,
        volume: f32,
        at: f64,
        time: f64,
    ) -> Result<(), RenderError> {
        if let Some(warmth) = self.warmth {
            ramp(renderer, warmth, Param::Cutoff, master.warmth, at, time)?;
        }
        if let Some(reverb) = self.reverb {
            ramp(renderer, reverb, Param::Room, master.reverb.room, at, time)?;
            ramp(renderer, reverb, Param::Damping, master.reverb.damping, at, time)?;
            ramp(renderer, reverb, Param::Mix, master.reverb.mix, at, time)?;
        }
        if let Some(saturator) = self.saturator {
            ramp(renderer, saturator, Param::Drive, master.drive, at, time)?;
        }
        self.set_output_gain(renderer, master.volume * volume, at, time)
    }

    pub fn set_output_gain(&self, renderer: &mut dyn Renderer, gain: f32, at: f64, time: f64) -> Result<(), RenderError> {
        ramp(renderer, self.output, Param::Gain, gain, at, time)
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes = vec![self.input];
        nodes.extend(self.warmth);
        nodes.extend(self.reverb);
        nodes.extend(self.saturator);
        nodes.push(self.output);
        nodes.extend(self.tap);
        nodes
    }

    pub fn release(&self, renderer: &mut dyn Renderer) {
        release_nodes(renderer, &self.nodes());
    }
}

/// Hold the current value at `at`, then move to `value` over `time` seconds.
pub(crate) fn ramp(
    renderer: &mut dyn Renderer,
    node: NodeId,
    param: Param,
    value: f32,
    at: f64,
    time: f64,
) -> Result<(), RenderError> {
    renderer.automate(node, param, Automation::CancelAndHold { at })?;
    if time > 0.0 {
        renderer.automate(node, param, Automation::LinearRamp { value, end: at + time })
    } else {
        renderer.automate(node, param, Automation::SetValue { value, at })
    }
}
