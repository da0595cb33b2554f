/*
Lookahead Scheduling
====================

Timers on the control side are coarse and late by an unknown amount. The
scheduler therefore never uses "the time the timer fired" as the time a sound
starts:

  renderer clock ──────┬──────────────┬──────────────┬────────→
                       t0             t1             t2        (grid)
  wake timers        ~~^~~          ~~~^~          ~^~~~       (jittery)
  onsets               t0+L           t1+L           t2+L      (exact)

1. Arm a one-shot timer for `next_event_time - now` (never negative).
2. When it fires, emit the step with the *stored* `next_event_time` as its
   intended time (plus an optional humanize offset). The consumer adds the
   fixed lookahead L and hands the onset to the renderer's automation queue,
   which is sample accurate.
3. Advance `next_event_time` by the step's grid length. Humanize never feeds
   back into the grid, so drift cannot accumulate.
4. Advance the step index; on wrap pick the next pattern variation and
   register shift.
5. Re-arm.

State machine:

  Idle ──start──→ Armed ──wake──→ Firing ──emit done──→ Armed
    ↑               │                                     │
    └─────stop──────┴─────────────────stop────────────────┘

A wake whose handle is not the one we are waiting for (already stopped, or
restarted since) is ignored, so a timer already in flight when `stop` was
called cannot fire a step.
*/

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, trace, warn};

use crate::engine::event_loop::{ModuleTask, TimerHandle};
use crate::error::ModuleError;
use crate::modules::ModuleContext;
use crate::sequencing::{Pattern, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Armed,
    Firing,
}

/// A step handed to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledStep {
    pub step: Step,
    /// Position within the current pattern
    pub index: usize,
    /// Which pattern variation the step came from
    pub variation: usize,
    /// Register shift in semitones for the current loop
    pub transpose: i32,
    /// Grid time of the step on the renderer clock
    pub grid_time: f64,
    /// Intended onset: grid time plus humanize offset
    pub time: f64,
    /// Step length in seconds at the current tempo
    pub duration: f64,
}

pub struct LookaheadScheduler {
    variations: Vec<Pattern>,
    current: usize,
    index: usize,
    next_event_time: f64,
    tempo: f64,
    /// Maximum humanize offset in seconds
    humanize: f64,
    /// Register shifts (semitones) to pick from at each wrap
    shifts: Vec<i32>,
    shift: i32,
    state: SchedulerState,
    pending: Option<TimerHandle>,
    rng: StdRng,
    fired: u64,
}

impl LookaheadScheduler {
    pub fn new(variations: Vec<Pattern>, seed: u64) -> Self {
        Self {
            variations,
            current: 0,
            index: 0,
            next_event_time: 0.0,
            tempo: 80.0,
            humanize: 0.0,
            shifts: Vec::new(),
            shift: 0,
            state: SchedulerState::Idle,
            pending: None,
            rng: StdRng::seed_from_u64(seed),
            fired: 0,
        }
    }

    /// Set the tempo in BPM. Non-positive or non-finite values fall back to
    /// `fallback`.
    pub fn set_tempo(&mut self, bpm: f64, fallback: f64) {
        self.tempo = if bpm > 0.0 && bpm.is_finite() {
            bpm
        } else {
            warn!(tempo = bpm, fallback, "invalid tempo, using fallback");
            fallback
        };
    }

    pub fn set_humanize(&mut self, seconds: f64) {
        self.humanize = seconds.max(0.0);
    }

    pub fn set_shifts(&mut self, shifts: Vec<i32>) {
        self.shifts = shifts;
    }

    /// Replace the pattern variations. The step index is kept where the new
    /// pattern is long enough, so a mood change does not restart the loop.
    pub fn set_patterns(&mut self, variations: Vec<Pattern>) {
        self.variations = variations;
        if self.current >= self.variations.len() {
            self.current = 0;
        }
        let len = self.variations.get(self.current).map_or(0, Pattern::len);
        if self.index >= len {
            self.index = 0;
        }
    }

    /// Begin scheduling with the first step at `from`. Returns false (and
    /// stays idle) when there is nothing to play.
    pub fn start(&mut self, ctx: &mut ModuleContext<'_>, from: f64) -> bool {
        self.stop(ctx);
        if self.variations.iter().all(Pattern::is_empty) {
            debug!(instance = ?ctx.instance(), "empty pattern, scheduler not started");
            return false;
        }
        if self.variations[self.current].is_empty() {
            self.current = self.variations.iter().position(|p| !p.is_empty()).unwrap_or(0);
        }
        self.index = 0;
        self.fired = 0;
        self.shift = self.shifts.first().copied().unwrap_or(0);
        self.next_event_time = from;
        self.arm(ctx);
        true
    }

    /// Cancel the pending wake. Safe to call when already idle.
    pub fn stop(&mut self, ctx: &mut ModuleContext<'_>) {
        if let Some(handle) = self.pending.take() {
            ctx.cancel(handle);
        }
        self.state = SchedulerState::Idle;
    }

    /// Handle a wake-up. Steps that should sound are passed to `emit`; an
    /// error from `emit` is returned after the scheduler has re-armed, so one
    /// failed voice does not stop the pattern.
    pub fn tick<F>(&mut self, ctx: &mut ModuleContext<'_>, handle: TimerHandle, mut emit: F) -> Result<(), ModuleError>
    where
        F: FnMut(&mut ModuleContext<'_>, &ScheduledStep) -> Result<(), ModuleError>,
    {
        if self.state != SchedulerState::Armed || self.pending != Some(handle) {
            trace!(?handle, "stale scheduler wake ignored");
            return Ok(());
        }
        self.pending = None;

        let Some(pattern) = self.variations.get(self.current) else {
            self.state = SchedulerState::Idle;
            return Ok(());
        };
        let Some(step) = pattern.get(self.index).cloned() else {
            debug!(instance = ?ctx.instance(), "pattern emptied, scheduler stopping");
            self.state = SchedulerState::Idle;
            return Ok(());
        };
        let len = pattern.len();

        self.state = SchedulerState::Firing;

        let duration = step.beats * 60.0 / self.tempo;
        let offset = if self.humanize > 0.0 && !step.is_rest {
            self.rng.gen_range(-self.humanize..=self.humanize)
        } else {
            0.0
        };
        let scheduled = ScheduledStep {
            index: self.index,
            variation: self.current,
            transpose: self.shift,
            grid_time: self.next_event_time,
            time: self.next_event_time + offset,
            duration,
            step,
        };

        let result = if scheduled.step.is_rest {
            Ok(())
        } else {
            trace!(index = scheduled.index, time = scheduled.time, "step");
            emit(ctx, &scheduled)
        };
        self.fired += 1;

        self.next_event_time += duration;
        self.index += 1;
        if self.index >= len {
            self.index = 0;
            self.wrap();
        }

        self.arm(ctx);
        result
    }

    fn wrap(&mut self) {
        if self.variations.len() > 1 {
            self.current = self.rng.gen_range(0..self.variations.len());
            if self.variations[self.current].is_empty() {
                self.current = self.variations.iter().position(|p| !p.is_empty()).unwrap_or(0);
            }
        }
        if !self.shifts.is_empty() {
            self.shift = self.shifts[self.rng.gen_range(0..self.shifts.len())];
        }
    }

    fn arm(&mut self, ctx: &mut ModuleContext<'_>) {
        let delay = (self.next_event_time - ctx.now()).max(0.0);
        self.pending = Some(ctx.arm(delay, ModuleTask::SchedulerWake));
        self.state = SchedulerState::Armed;
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state != SchedulerState::Idle
    }

    pub fn next_event_time(&self) -> f64 {
        self.next_event_time
    }

    pub fn pattern_index(&self) -> usize {
        self.index
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    /// Steps processed since the last start, rests included.
    pub fn fired(&self) -> u64 {
        self.fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::event_loop::{EventLoop, InstanceId, TimerKey};
    use crate::render::{GraphRenderer, Renderer};
    use crate::sequencing::Duration;

    struct Rig {
        renderer: GraphRenderer,
        timers: EventLoop,
        config: EngineConfig,
    }

    impl Rig {
        fn new(jitter_ms: f64) -> Self {
            Self {
                renderer: GraphRenderer::new(8_000.0),
                timers: EventLoop::new().with_jitter(jitter_ms, 11),
                config: EngineConfig::default(),
            }
        }

        fn ctx(&mut self) -> ModuleContext<'_> {
            ModuleContext::new(&mut self.renderer, &mut self.timers, InstanceId(1), &self.config)
        }

        /// Advance the renderer and the loop together, returning due wakes.
        fn run_until(&mut self, seconds: f64, scheduler: &mut LookaheadScheduler, fired: &mut Vec<ScheduledStep>) {
            while self.renderer.current_time() < seconds {
                self.renderer.advance(0.004);
                self.timers.advance_to(self.renderer.current_time() * 1000.0);
                while let Some((handle, key)) = self.timers.pop_due() {
                    assert!(matches!(key, TimerKey::Module { .. }));
                    let mut ctx = self.ctx();
                    scheduler
                        .tick(&mut ctx, handle, |_, step| {
                            fired.push(step.clone());
                            Ok(())
                        })
                        .unwrap();
                }
            }
        }
    }

    fn pattern(text: &str) -> Pattern {
        Pattern::parse(text, Duration::EIGHTH).unwrap()
    }

    #[test]
    fn grid_times_follow_tempo_despite_jitter() {
        let mut rig = Rig::new(20.0);
        let mut scheduler = LookaheadScheduler::new(vec![pattern("C4 E4 G4 [C5 E5]")], 3);
        scheduler.set_tempo(120.0, 80.0);
        scheduler.start(&mut rig.ctx(), 0.1);

        let mut fired = Vec::new();
        rig.run_until(3.0, &mut scheduler, &mut fired);

        assert!(fired.len() > 10);
        for pair in fired.windows(2) {
            let expected = pair[0].grid_time + pair[0].duration;
            assert!(pair[1].grid_time > pair[0].grid_time, "grid times not increasing");
            assert!(
                (pair[1].grid_time - expected).abs() < 1e-9,
                "step drifted: {} vs {}",
                pair[1].grid_time,
                expected
            );
        }
        // an eighth at 120 BPM
        assert!((fired[0].duration - 0.25).abs() < 1e-12);
    }

    #[test]
    fn humanize_does_not_move_the_grid() {
        let mut rig = Rig::new(5.0);
        let mut scheduler = LookaheadScheduler::new(vec![pattern("C4 C4 C4 C4")], 9);
        scheduler.set_tempo(90.0, 80.0);
        scheduler.set_humanize(0.01);
        scheduler.start(&mut rig.ctx(), 0.0);

        let mut fired = Vec::new();
        rig.run_until(2.0, &mut scheduler, &mut fired);

        let step = 0.5 * 60.0 / 90.0;
        for (i, s) in fired.iter().enumerate() {
            assert!((s.grid_time - i as f64 * step).abs() < 1e-9);
            assert!((s.time - s.grid_time).abs() <= 0.01 + 1e-12);
        }
        assert!(fired.iter().any(|s| s.time != s.grid_time));
    }

    #[test]
    fn rests_advance_time_without_emitting() {
        let mut rig = Rig::new(0.0);
        let mut scheduler = LookaheadScheduler::new(vec![pattern("C4 _ _ E4")], 1);
        scheduler.set_tempo(120.0, 80.0);
        scheduler.start(&mut rig.ctx(), 0.0);

        let mut fired = Vec::new();
        rig.run_until(1.05, &mut scheduler, &mut fired);

        let times: Vec<f64> = fired.iter().map(|s| s.grid_time).collect();
        assert_eq!(times, vec![0.0, 0.75, 1.0]);
        assert_eq!(fired[2].index, 0, "pattern should have wrapped");
    }

    #[test]
    fn invalid_tempo_falls_back() {
        let mut scheduler = LookaheadScheduler::new(vec![pattern("C4")], 1);
        scheduler.set_tempo(0.0, 80.0);
        assert_eq!(scheduler.tempo(), 80.0);
        scheduler.set_tempo(-10.0, 72.0);
        assert_eq!(scheduler.tempo(), 72.0);
        scheduler.set_tempo(f64::NAN, 80.0);
        assert_eq!(scheduler.tempo(), 80.0);
    }

    #[test]
    fn empty_pattern_never_starts() {
        let mut rig = Rig::new(0.0);
        let mut scheduler = LookaheadScheduler::new(vec![Pattern::default()], 1);
        assert!(!scheduler.start(&mut rig.ctx(), 0.0));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(rig.timers.pending(), 0);
    }

    #[test]
    fn stop_cancels_and_ignores_in_flight_wake() {
        let mut rig = Rig::new(0.0);
        let mut scheduler = LookaheadScheduler::new(vec![pattern("C4 E4")], 1);
        scheduler.set_tempo(120.0, 80.0);
        scheduler.start(&mut rig.ctx(), 0.0);

        rig.timers.advance_to(1.0);
        let (handle, _) = rig.timers.pop_due().unwrap();

        // stop arrives while the wake is already being dispatched
        scheduler.stop(&mut rig.ctx());
        scheduler.stop(&mut rig.ctx());

        let mut emitted = 0;
        scheduler
            .tick(&mut rig.ctx(), handle, |_, _| {
                emitted += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(emitted, 0);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(rig.timers.pending(), 0);
    }

    #[test]
    fn at_most_one_wake_outstanding() {
        let mut rig = Rig::new(0.0);
        let mut scheduler = LookaheadScheduler::new(vec![pattern("C4 E4 G4")], 1);
        scheduler.set_tempo(100.0, 80.0);
        scheduler.start(&mut rig.ctx(), 0.0);
        scheduler.start(&mut rig.ctx(), 0.5);
        assert_eq!(rig.timers.pending(), 1);

        let mut fired = Vec::new();
        rig.run_until(1.0, &mut scheduler, &mut fired);
        assert_eq!(rig.timers.pending(), 1);
        assert_eq!(fired[0].grid_time, 0.5);
    }

    #[test]
    fn emit_error_keeps_the_pattern_going() {
        let mut rig = Rig::new(0.0);
        let mut scheduler = LookaheadScheduler::new(vec![pattern("C4 E4")], 1);
        scheduler.set_tempo(120.0, 80.0);
        scheduler.start(&mut rig.ctx(), 0.0);

        rig.timers.advance_to(0.0);
        let (handle, _) = rig.timers.pop_due().unwrap();
        let result = scheduler.tick(&mut rig.ctx(), handle, |_, _| Err(ModuleError::Failed("boom".into())));
        assert!(result.is_err());
        assert_eq!(scheduler.state(), SchedulerState::Armed);
        assert_eq!(scheduler.pattern_index(), 1);
    }

    #[test]
    fn variations_and_shifts_are_picked_at_wrap() {
        let mut rig = Rig::new(0.0);
        let mut scheduler = LookaheadScheduler::new(vec![pattern("C4"), pattern("E4 G4")], 5);
        scheduler.set_tempo(240.0, 80.0);
        scheduler.set_shifts(vec![0, 12]);
        scheduler.start(&mut rig.ctx(), 0.0);

        let mut fired = Vec::new();
        rig.run_until(8.0, &mut scheduler, &mut fired);

        assert!(fired.iter().any(|s| s.variation == 1));
        assert!(fired.iter().any(|s| s.transpose == 12));
        // a variation only changes at index 0
        for pair in fired.windows(2) {
            if pair[1].variation != pair[0].variation || pair[1].transpose != pair[0].transpose {
                assert_eq!(pair[1].index, 0);
            }
        }
    }
}
