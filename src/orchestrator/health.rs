//! Analysis-tap health check.
//!
//! While playback should be audible the orchestrator reads the tap every few
//! seconds. A few silent reads in a row start a probe: a quiet sine wired
//! straight into the tap for a short window. If the probe shows up, the tap
//! works and the modules are simply silent. If it does not, the tap itself is
//! broken and gets rebuilt.

use tracing::debug;

use crate::dsp::oscillator::Waveform;
use crate::error::RenderError;
use crate::render::{NodeId, NodeSpec, Renderer};
use crate::synth::voice::release_nodes;

/// RMS below this counts as silence.
pub const SILENCE_RMS: f32 = 1e-4;

/// About -54 dBFS: inaudible under any mix, well above [`SILENCE_RMS`].
const PROBE_GAIN: f32 = 0.002;
const PROBE_HZ: f32 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    NotChecked,
    Healthy,
    /// Silent, not yet enough checks to probe
    Silent,
    Probing,
    /// The probe reached the tap; nothing is playing
    ModulesSilent,
    /// The probe never reached the tap; it was rebuilt
    TapBroken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    None,
    StartProbe,
}

pub struct HealthMonitor {
    silent_checks: u32,
    checks_before_probe: u32,
    probe: Option<[NodeId; 2]>,
    verdict: HealthVerdict,
}

impl HealthMonitor {
    pub fn new(checks_before_probe: u32) -> Self {
        Self {
            silent_checks: 0,
            checks_before_probe: checks_before_probe.max(1),
            probe: None,
            verdict: HealthVerdict::NotChecked,
        }
    }

    /// Record one periodic reading of the tap.
    pub fn observe(&mut self, rms: f32) -> HealthAction {
        if self.probe.is_some() {
            return HealthAction::None;
        }
        if rms > SILENCE_RMS {
            self.silent_checks = 0;
            self.verdict = HealthVerdict::Healthy;
            return HealthAction::None;
        }
        self.silent_checks += 1;
        self.verdict = HealthVerdict::Silent;
        if self.silent_checks >= self.checks_before_probe {
            HealthAction::StartProbe
        } else {
            HealthAction::None
        }
    }

    /// Wire the probe into `tap`.
    pub fn start_probe(&mut self, renderer: &mut dyn Renderer, tap: NodeId) -> Result<(), RenderError> {
        self.end_probe(renderer);
        let osc = renderer.create_node(NodeSpec::oscillator(Waveform::Sine, PROBE_HZ))?;
        let wired = renderer.create_node(NodeSpec::gain(PROBE_GAIN)).and_then(|gain| {
            let now = renderer.current_time();
            renderer
                .connect(osc, gain)
                .and_then(|()| renderer.connect(gain, tap))
                .and_then(|()| renderer.start(osc, now))
                .map(|()| gain)
                .inspect_err(|_| release_nodes(renderer, &[gain]))
        });
        match wired {
            Ok(gain) => {
                self.probe = Some([osc, gain]);
                self.verdict = HealthVerdict::Probing;
                debug!("health probe started");
                Ok(())
            }
            Err(err) => {
                release_nodes(renderer, &[osc]);
                Err(err)
            }
        }
    }

    /// Read the probe window's result and remove the probe.
    pub fn finish_probe(&mut self, renderer: &mut dyn Renderer, rms: f32) -> HealthVerdict {
        self.end_probe(renderer);
        self.silent_checks = 0;
        self.verdict = if rms > SILENCE_RMS {
            HealthVerdict::ModulesSilent
        } else {
            HealthVerdict::TapBroken
        };
        self.verdict
    }

    /// Drop any running probe, e.g. on stop.
    pub fn end_probe(&mut self, renderer: &mut dyn Renderer) {
        if let Some(nodes) = self.probe.take() {
            release_nodes(renderer, &nodes);
        }
    }

    /// Forget the probe without touching a renderer that no longer exists.
    pub fn reset(&mut self) {
        self.probe = None;
        self.silent_checks = 0;
        self.verdict = HealthVerdict::NotChecked;
    }

    pub fn is_probing(&self) -> bool {
        self.probe.is_some()
    }

    pub fn verdict(&self) -> HealthVerdict {
        self.verdict
    }
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}
