/*
Parameter Automation
====================

Every automatable parameter owns a lane: a time-ordered list of events that
together describe the parameter's value at any instant on the renderer clock.

  SetValue      jump to `value` at `at`
  LinearRamp    straight line from the previous event's value/time to
                `value`, arriving at `end`; after a SetTarget the line
                starts at the target's `start`, which the ramp replaces
  SetTarget     from `start`, approach `target` exponentially with time
                constant `tau`; after ~3*tau the value is within 5% of target
  CancelAndHold drop everything at or after `at` and freeze the value the lane
                had at that instant

  value
    1.0 ┐     ╱╲
        │    ╱  ╲__________
    s   │   ╱   decay      ╲  release
        │  ╱               │╲___
    0.0 └─╱────────────────┴────────→ time
        ramp  SetTarget    SetTarget

Because the renderer evaluates the lane per sample, a voice whose envelope is
written as lane events starts and stops exactly where the events say, no
matter how late the control-side timer that wrote them fired.

Lanes are compacted as time passes so long-running parameters (the master
reverb, module buses) do not grow without bound.
*/

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Automation {
    SetValue { value: f32, at: f64 },
    LinearRamp { value: f32, end: f64 },
    SetTarget { target: f32, start: f64, tau: f64 },
    CancelAndHold { at: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Event {
    Set { value: f32, at: f64 },
    Ramp { value: f32, end: f64 },
    Target { target: f32, start: f64, tau: f64 },
}

impl Event {
    fn time(&self) -> f64 {
        match *self {
            Event::Set { at, .. } => at,
            Event::Ramp { end, .. } => end,
            Event::Target { start, .. } => start,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutomationLane {
    /// Value before the first event.
    initial: f32,
    /// Time the initial value was established (start point for a leading ramp).
    initial_time: f64,
    events: Vec<Event>,
}

impl AutomationLane {
    pub fn new(value: f32) -> Self {
        Self::starting_at(value, 0.0)
    }

    /// A lane whose value is established at `time`, so a first ramp starts
    /// there rather than at the beginning of the clock.
    pub fn starting_at(value: f32, time: f64) -> Self {
        Self {
            initial: value,
            initial_time: time,
            events: Vec::new(),
        }
    }

    pub fn apply(&mut self, automation: Automation) {
        let event = match automation {
            Automation::SetValue { value, at } => Event::Set { value, at },
            Automation::LinearRamp { value, end } => Event::Ramp { value, end },
            Automation::SetTarget { target, start, tau } => Event::Target {
                target,
                start,
                tau: tau.max(1e-4),
            },
            Automation::CancelAndHold { at } => {
                self.cancel_and_hold(at);
                return;
            }
        };
        self.insert(event);
    }

    fn insert(&mut self, event: Event) {
        let time = event.time();
        // stable: events at equal times keep insertion order
        let index = self.events.partition_point(|e| e.time() <= time);
        self.events.insert(index, event);
    }

    fn cancel_and_hold(&mut self, at: f64) {
        let held = self.value_at(at);
        self.events.retain(|e| e.time() < at);
        self.events.push(Event::Set { value: held, at });
    }

    /// Value of the lane at time `t`.
    pub fn value_at(&self, t: f64) -> f32 {
        let mut value = self.initial;
        let mut last_time = self.initial_time;

        for (i, event) in self.events.iter().enumerate() {
            match *event {
                Event::Set { value: v, at } => {
                    if at > t {
                        break;
                    }
                    value = v;
                    last_time = at;
                }
                Event::Ramp { value: v, end } => {
                    if end <= t {
                        value = v;
                        last_time = end;
                        continue;
                    }
                    if t <= last_time {
                        break;
                    }
                    let span = end - last_time;
                    if span > 0.0 {
                        let progress = ((t - last_time) / span) as f32;
                        value += (v - value) * progress;
                    }
                    break;
                }
                Event::Target { target, start, tau } => {
                    if start > t {
                        break;
                    }
                    // a following ramp takes over from the target's start
                    if matches!(self.events.get(i + 1), Some(Event::Ramp { .. })) {
                        last_time = start;
                        continue;
                    }
                    let next_time = self.events.get(i + 1).map(Event::time);
                    let until = match next_time {
                        Some(next) if next <= t => next,
                        _ => t,
                    };
                    let decay = (-(until - start) / tau).exp() as f32;
                    value = target + (value - target) * decay;
                    last_time = until;
                    if until >= t {
                        break;
                    }
                }
            }
        }
        value
    }

    /// Fold events that can no longer influence values at or after `now` into
    /// the lane's initial value.
    pub fn compact(&mut self, now: f64) {
        // Keep the last event that started at or before `now` unless it is a
        // completed set/ramp, in which case its value alone is enough.
        let settled = self.events.partition_point(|e| e.time() <= now);
        if settled == 0 {
            return;
        }
        let last = self.events[settled - 1];
        match last {
            Event::Target { start, .. } => {
                if settled < 2 {
                    return;
                }
                self.initial = self.value_at(start);
                self.initial_time = start;
                self.events.drain(..settled - 1);
            }
            Event::Set { value, at } | Event::Ramp { value, end: at } => {
                self.initial = value;
                self.initial_time = at;
                self.events.drain(..settled);
            }
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// True when no event lies after `t`, so the value is constant from `t` on
    /// (ignoring a still-running SetTarget).
    pub fn is_static_after(&self, t: f64) -> bool {
        self.events.iter().all(|e| e.time() <= t)
            && !matches!(self.events.last(), Some(Event::Target { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn set_value_takes_effect_at_its_time() {
        let mut lane = AutomationLane::new(0.0);
        lane.apply(Automation::SetValue { value: 1.0, at: 2.0 });
        assert_eq!(lane.value_at(1.999), 0.0);
        assert_eq!(lane.value_at(2.0), 1.0);
    }

    #[test]
    fn linear_ramp_starts_from_previous_event() {
        let mut lane = AutomationLane::new(0.0);
        lane.apply(Automation::SetValue { value: 0.0, at: 1.0 });
        lane.apply(Automation::LinearRamp { value: 1.0, end: 2.0 });
        assert!(close(lane.value_at(1.0), 0.0));
        assert!(close(lane.value_at(1.5), 0.5));
        assert!(close(lane.value_at(2.0), 1.0));
        assert!(close(lane.value_at(5.0), 1.0));
    }

    #[test]
    fn set_target_approaches_exponentially() {
        let mut lane = AutomationLane::new(1.0);
        lane.apply(Automation::SetTarget { target: 0.0, start: 0.0, tau: 0.1 });
        assert!(close(lane.value_at(0.1), (-1.0f32).exp()));
        assert!(lane.value_at(0.3) < 0.05);
    }

    #[test]
    fn target_hands_over_to_following_event() {
        let mut lane = AutomationLane::new(1.0);
        lane.apply(Automation::SetTarget { target: 0.5, start: 0.0, tau: 0.05 });
        lane.apply(Automation::SetTarget { target: 0.0, start: 1.0, tau: 0.05 });
        // settled on 0.5 before the second target takes over
        assert!(close(lane.value_at(0.999), 0.5));
        assert!(lane.value_at(1.5) < 0.01);
    }

    #[test]
    fn ramp_after_target_runs_from_the_target_start() {
        let mut lane = AutomationLane::new(0.0);
        lane.apply(Automation::SetValue { value: 1.0, at: 0.0 });
        lane.apply(Automation::SetTarget { target: 0.0, start: 1.0, tau: 0.1 });
        lane.apply(Automation::LinearRamp { value: 0.5, end: 3.0 });
        assert!(close(lane.value_at(1.0), 1.0));
        assert!(close(lane.value_at(2.0), 0.75));
        assert!(close(lane.value_at(3.0), 0.5));
        assert!(close(lane.value_at(4.0), 0.5));

        lane.compact(1.5);
        assert!(close(lane.value_at(2.0), 0.75));
    }

    #[test]
    fn cancel_and_hold_freezes_current_value() {
        let mut lane = AutomationLane::new(0.0);
        lane.apply(Automation::SetValue { value: 0.0, at: 0.0 });
        lane.apply(Automation::LinearRamp { value: 1.0, end: 1.0 });
        lane.apply(Automation::SetValue { value: 0.2, at: 3.0 });
        lane.apply(Automation::CancelAndHold { at: 0.5 });
        assert!(close(lane.value_at(0.5), 0.5));
        assert!(close(lane.value_at(4.0), 0.5));
    }

    #[test]
    fn compact_preserves_values() {
        let mut lane = AutomationLane::new(0.0);
        lane.apply(Automation::SetValue { value: 0.0, at: 0.0 });
        lane.apply(Automation::LinearRamp { value: 1.0, end: 1.0 });
        lane.apply(Automation::SetTarget { target: 0.2, start: 1.0, tau: 0.3 });
        lane.apply(Automation::SetValue { value: 0.7, at: 5.0 });

        let before: Vec<f32> = [1.2, 2.0, 4.9, 5.1].iter().map(|&t| lane.value_at(t)).collect();
        lane.compact(1.1);
        let after: Vec<f32> = [1.2, 2.0, 4.9, 5.1].iter().map(|&t| lane.value_at(t)).collect();

        for (b, a) in before.iter().zip(&after) {
            assert!(close(*b, *a), "{b} != {a}");
        }
        assert!(lane.event_count() <= 2);

        lane.compact(6.0);
        assert_eq!(lane.event_count(), 0);
        assert!(close(lane.value_at(7.0), 0.7));
    }
}
