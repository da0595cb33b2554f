//! Module registry and per-module circuit breaking.
//!
//! The registry is plain orchestrator-owned state: registrations in activation
//! order, looked up by module id (from moods) or by instance id (from timers).

use crate::engine::event_loop::InstanceId;
use crate::modules::{GeneratorModule, ModuleSettings, MoodConfig};

/// Counts consecutive failed calls. Any success resets the count; the breaker
/// trips once the count exceeds the threshold. The orchestrator records only
/// the failures of timer wake-ups, never their successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreaker {
    consecutive: u32,
    total: u32,
    threshold: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            total: 0,
            threshold,
        }
    }

    /// Returns true when this failure trips the breaker.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.total += 1;
        self.consecutive > self.threshold
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn total(&self) -> u32 {
        self.total
    }
}

/// A live module and everything the orchestrator tracks about it.
pub struct ModuleRegistration {
    pub(crate) id: String,
    pub(crate) kind: String,
    pub(crate) instance: InstanceId,
    pub(crate) module: Box<dyn GeneratorModule>,
    /// Settings from the active mood
    pub(crate) settings: ModuleSettings,
    pub(crate) config: MoodConfig,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) enabled: bool,
    pub(crate) playing: bool,
}

impl ModuleRegistration {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn config(&self) -> MoodConfig {
        self.config
    }

    pub fn settings(&self) -> &ModuleSettings {
        &self.settings
    }

    pub fn error_count(&self) -> u32 {
        self.breaker.consecutive()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }
}

/// A module dropped by a mood change, fading out until its disposal timer.
pub struct Retired {
    pub(crate) id: String,
    pub(crate) instance: InstanceId,
    pub(crate) module: Box<dyn GeneratorModule>,
}

#[derive(Default)]
pub struct Registry {
    entries: Vec<ModuleRegistration>,
}

impl Registry {
    pub fn insert(&mut self, registration: ModuleRegistration) {
        self.entries.push(registration);
    }

    pub fn get(&self, id: &str) -> Option<&ModuleRegistration> {
        self.entries.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ModuleRegistration> {
        self.entries.iter_mut().find(|r| r.id == id)
    }

    pub fn by_instance_mut(&mut self, instance: InstanceId) -> Option<&mut ModuleRegistration> {
        self.entries.iter_mut().find(|r| r.instance == instance)
    }

    pub fn remove(&mut self, id: &str) -> Option<ModuleRegistration> {
        let index = self.entries.iter().position(|r| r.id == id)?;
        Some(self.entries.remove(index))
    }

    /// Remove and return every disabled registration.
    pub fn drain_disabled(&mut self) -> Vec<ModuleRegistration> {
        let (disabled, kept) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|r| !r.enabled);
        self.entries = kept;
        disabled
    }

    pub fn drain(&mut self) -> Vec<ModuleRegistration> {
        std::mem::take(&mut self.entries)
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|r| r.id.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleRegistration> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ModuleRegistration> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_threshold_consecutive_failures() {
        let mut breaker = CircuitBreaker::new(10);
        for _ in 0..10 {
            assert!(!breaker.record_failure());
        }
        assert!(breaker.record_failure(), "the eleventh failure trips");
    }

    #[test]
    fn success_resets_the_count() {
        let mut breaker = CircuitBreaker::new(2);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert_eq!(breaker.total(), 4);
        assert!(breaker.record_failure());
    }
}
