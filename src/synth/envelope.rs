/*
Envelopes as automation
=======================

An envelope here is not a per-sample state machine; it is a handful of
automation events written onto a parameter lane when a voice is created.

  level
   peak ┤    ╱╲
        │   ╱  ╲___________            sustain = peak * sustain
        │  ╱               ╲
  floor ┼─╱                 ╲___
        └─┬──┬─────────────┬────┬───→ time
        onset  onset+attack  release   release start + release
                             start

  attack   LinearRamp from `floor` at onset to `peak` at onset + attack
  decay    SetTarget toward the sustain level, tau = decay / 3
  release  SetTarget toward `floor`, tau = release / 3

After 3 tau an exponential approach is within 5% of its target, which is why
the stage time is divided by three. The release starts at the end of the
note, but never before the attack has finished.
*/

use serde::Deserialize;

use crate::error::RenderError;
use crate::render::{Automation, NodeId, Param, Renderer};

/// Near-silent level envelopes start from and return to.
pub const FLOOR: f32 = 1e-4;

/// Shortest stage time, one sample at 48 kHz.
pub(crate) const MIN_TIME: f64 = 1.0 / 48_000.0;

/// Attack/decay/sustain/release, times in seconds, sustain as a fraction of
/// the peak.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    pub attack: f64,
    pub decay: f64,
    pub sustain: f32,
    pub release: f64,
}

impl Envelope {
    pub const fn adsr(attack: f64, decay: f64, sustain: f32, release: f64) -> Self {
        Self {
            attack,
            decay,
            sustain,
            release,
        }
    }

    fn attack_time(&self) -> f64 {
        self.attack.max(MIN_TIME)
    }

    /// When the release stage begins for a note of `duration` seconds.
    pub fn release_start(&self, onset: f64, duration: f64) -> f64 {
        (onset + duration.max(0.0)).max(onset + self.attack_time())
    }

    /// Write the attack and decay stages, rising from `floor` to `peak`.
    pub fn schedule_onset(
        &self,
        renderer: &mut dyn Renderer,
        node: NodeId,
        param: Param,
        onset: f64,
        floor: f32,
        peak: f32,
    ) -> Result<(), RenderError> {
        let attack_end = onset + self.attack_time();
        let sustain = floor + (peak - floor) * self.sustain.clamp(0.0, 1.0);
        renderer.automate(node, param, Automation::SetValue { value: floor, at: onset })?;
        renderer.automate(node, param, Automation::LinearRamp { value: peak, end: attack_end })?;
        renderer.automate(
            node,
            param,
            Automation::SetTarget {
                target: sustain,
                start: attack_end,
                tau: self.decay.max(MIN_TIME) / 3.0,
            },
        )
    }

    /// Write the release stage starting at `start`.
    pub fn schedule_release(
        renderer: &mut dyn Renderer,
        node: NodeId,
        param: Param,
        start: f64,
        release: f64,
        floor: f32,
    ) -> Result<(), RenderError> {
        renderer.automate(
            node,
            param,
            Automation::SetTarget {
                target: floor,
                start,
                tau: release.max(MIN_TIME) / 3.0,
            },
        )
    }

    /// Cut whatever is scheduled from `at` on and release from the value held
    /// there.
    pub fn release_early(
        renderer: &mut dyn Renderer,
        node: NodeId,
        param: Param,
        at: f64,
        release: f64,
        floor: f32,
    ) -> Result<(), RenderError> {
        renderer.automate(node, param, Automation::CancelAndHold { at })?;
        Self::schedule_release(renderer, node, param, at, release, floor)
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::adsr(0.01, 0.2, 0.6, 0.5)
    }
}

/// Cutoff sweep applied to a voice's filter: from `base` up to `peak` Hz and
/// back down following `shape`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterEnvelope {
    pub base: f32,
    pub peak: f32,
    pub shape: Envelope,
}

impl FilterEnvelope {
    pub fn schedule(&self, renderer: &mut dyn Renderer, node: NodeId, onset: f64, release_start: f64) -> Result<(), RenderError> {
        self.shape
            .schedule_onset(renderer, node, Param::Cutoff, onset, self.base, self.peak)?;
        Envelope::schedule_release(renderer, node, Param::Cutoff, release_start, self.shape.release, self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{GraphRenderer, NodeSpec};

    #[test]
    fn release_never_starts_inside_the_attack() {
        let env = Envelope::adsr(0.5, 0.1, 0.5, 1.0);
        assert_eq!(env.release_start(2.0, 0.1), 2.5);
        assert_eq!(env.release_start(2.0, 1.0), 3.0);
    }

    #[test]
    fn amplitude_follows_adsr_shape() {
        let mut r = GraphRenderer::new(1_000.0);
        let amp = r.create_node(NodeSpec::gain(0.0)).unwrap();
        let env = Envelope::adsr(0.1, 0.3, 0.5, 0.3);

        env.schedule_onset(&mut r, amp, Param::Gain, 1.0, FLOOR, 0.8).unwrap();
        let release = env.release_start(1.0, 1.0);
        Envelope::schedule_release(&mut r, amp, Param::Gain, release, env.release, FLOOR).unwrap();

        // a zero-frequency square is a constant 1.0, so the output is the lane
        let dc = r.create_node(NodeSpec::oscillator(crate::dsp::oscillator::Waveform::Square, 0.0)).unwrap();
        r.connect(dc, amp).unwrap();
        r.connect(amp, r.destination()).unwrap();
        r.start(dc, 0.0).unwrap();

        let mut out = vec![0.0; 3_000];
        r.render(&mut out);

        assert!(out[999] <= FLOOR, "silent before onset");
        assert!((out[1_050] - 0.4).abs() < 0.01, "half way up the attack");
        assert!((out[1_100] - 0.8).abs() < 0.01, "peak at end of attack");
        assert!((out[1_900] - 0.4).abs() < 0.02, "settled on sustain");
        assert!(out[2_400] < 0.03, "released");
    }
}
