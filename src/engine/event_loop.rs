//! The single cooperative execution context.
//!
//! Everything on the control side runs from one loop. Timers here are coarse
//! macrotask-style wake-ups: they say *roughly* when to come back, never when a
//! sound starts. A timer is identified by a [`TimerHandle`] and carries a
//! [`TimerKey`] saying who it is for; the orchestrator routes each due key and
//! drops it if its owner no longer exists.
//!
//! Lateness jitter can be switched on to model a busy host; it is drawn from a
//! seeded RNG so runs are reproducible.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::synth::voice::VoiceId;

/// Identifies one instantiation of a module. A module dropped from a mood and
/// later re-added gets a fresh instance id, so timers of the old one can never
/// reach the new one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance#{}", self.0)
    }
}

/// Work a module asked to be woken up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleTask {
    SchedulerWake,
    VoiceCleanup(VoiceId),
    Drift,
    SourceCleanup,
}

/// Work the orchestrator asked to be woken up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineTask {
    DisposeRetired(InstanceId),
    TransitionComplete,
    RecreateRenderer,
    HealthCheck,
    ProbeCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Module { instance: InstanceId, task: ModuleTask },
    Engine(EngineTask),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

struct Pending {
    due_ms: f64,
    handle: TimerHandle,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // Reversed so the BinaryHeap pops the earliest timer; equal due times pop
    // in arming order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due_ms
            .total_cmp(&self.due_ms)
            .then_with(|| other.handle.cmp(&self.handle))
    }
}

pub struct EventLoop {
    now_ms: f64,
    queue: BinaryHeap<Pending>,
    /// Armed and not yet fired or cancelled.
    live: HashMap<TimerHandle, TimerKey>,
    next_handle: u64,
    jitter: Option<(StdRng, f64)>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            now_ms: 0.0,
            queue: BinaryHeap::new(),
            live: HashMap::new(),
            next_handle: 0,
            jitter: None,
        }
    }

    /// Make every timer fire up to `max_ms` late.
    pub fn with_jitter(mut self, max_ms: f64, seed: u64) -> Self {
        self.set_jitter(max_ms, seed);
        self
    }

    pub fn set_jitter(&mut self, max_ms: f64, seed: u64) {
        self.jitter = (max_ms > 0.0).then(|| (StdRng::seed_from_u64(seed), max_ms));
    }

    pub fn now_ms(&self) -> f64 {
        self.now_ms
    }

    /// Arm a one-shot timer `delay_ms` from now. Negative delays fire on the
    /// next dispatch.
    pub fn arm(&mut self, delay_ms: f64, key: TimerKey) -> TimerHandle {
        let late = match &mut self.jitter {
            Some((rng, max_ms)) => rng.gen_range(0.0..=*max_ms),
            None => 0.0,
        };
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.queue.push(Pending {
            due_ms: self.now_ms + delay_ms.max(0.0) + late,
            handle,
        });
        self.live.insert(handle, key);
        handle
    }

    /// Returns false if the timer already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.live.remove(&handle).is_some()
    }

    /// Cancel every timer belonging to `instance`. Returns how many were live.
    pub fn cancel_instance(&mut self, instance: InstanceId) -> usize {
        let before = self.live.len();
        self.live
            .retain(|_, key| !matches!(key, TimerKey::Module { instance: i, .. } if *i == instance));
        before - self.live.len()
    }

    /// Cancel everything.
    pub fn clear(&mut self) {
        self.live.clear();
        self.queue.clear();
    }

    /// Move the loop's clock forward. It never moves backwards.
    pub fn advance_to(&mut self, now_ms: f64) {
        if now_ms > self.now_ms {
            self.now_ms = now_ms;
        }
    }

    /// Next timer due at or before now, skipping cancelled ones.
    pub fn pop_due(&mut self) -> Option<(TimerHandle, TimerKey)> {
        while let Some(top) = self.queue.peek() {
            if top.due_ms > self.now_ms {
                return None;
            }
            let handle = top.handle;
            self.queue.pop();
            if let Some(key) = self.live.remove(&handle) {
                return Some((handle, key));
            }
        }
        None
    }

    /// Timers armed and not yet fired or cancelled.
    pub fn pending(&self) -> usize {
        self.live.len()
    }

    pub fn pending_for(&self, instance: InstanceId) -> usize {
        self.live
            .values()
            .filter(|key| matches!(key, TimerKey::Module { instance: i, .. } if *i == instance))
            .count()
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.live.contains_key(&handle)
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}
