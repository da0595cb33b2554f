//! Static table of module kinds.
//!
//! Moods refer to modules by a `kind` string. Every kind is registered here
//! with a factory up front, and a mood book is checked against the table when
//! it is loaded, so a typo is a load error rather than a silent gap in the
//! mix.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::modules::{DroneModule, GeneratorModule, PatternModule};
use crate::voices::{Bell, HiHat, Kick, Pad, Pluck};

/// What a factory is told about the module it creates.
#[derive(Debug, Clone, Copy)]
pub struct ModuleSpec<'a> {
    pub id: &'a str,
    pub kind: &'a str,
    /// Fresh per instance so re-created modules do not replay the same dice
    pub seed: u64,
}

pub type ModuleFactory = Arc<dyn Fn(&ModuleSpec<'_>) -> Box<dyn GeneratorModule> + Send + Sync>;

#[derive(Clone)]
pub struct ModuleCatalog {
    kinds: BTreeMap<String, ModuleFactory>,
}

impl ModuleCatalog {
    pub fn empty() -> Self {
        Self { kinds: BTreeMap::new() }
    }

    /// The built-in kinds: pad, pluck, bell, kick, hihat, drone.
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        catalog
            .register("pad", |spec| Box::new(PatternModule::new("pad", Pad::default(), spec.seed)))
            .register("pluck", |spec| Box::new(PatternModule::new("pluck", Pluck::default(), spec.seed)))
            .register("bell", |spec| Box::new(PatternModule::new("bell", Bell, spec.seed)))
            .register("kick", |spec| Box::new(PatternModule::new("kick", Kick, spec.seed)))
            .register("hihat", |spec| Box::new(PatternModule::new("hihat", HiHat::default(), spec.seed)))
            .register("drone", |spec| Box::new(DroneModule::new(spec.seed)));
        catalog
    }

    /// Add or replace a kind.
    pub fn register<F>(&mut self, kind: &str, factory: F) -> &mut Self
    where
        F: Fn(&ModuleSpec<'_>) -> Box<dyn GeneratorModule> + Send + Sync + 'static,
    {
        self.kinds.insert(kind.to_string(), Arc::new(factory));
        self
    }

    pub fn get(&self, kind: &str) -> Option<&ModuleFactory> {
        self.kinds.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }
}

impl Default for ModuleCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.kinds.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_kinds() {
        let catalog = ModuleCatalog::builtin();
        let kinds: Vec<&str> = catalog.kinds().collect();
        assert_eq!(kinds, vec!["bell", "drone", "hihat", "kick", "pad", "pluck"]);
    }

    #[test]
    fn factories_build_the_named_kind() {
        let catalog = ModuleCatalog::builtin();
        for kind in ["pad", "drone", "kick"] {
            let factory = catalog.get(kind).unwrap();
            let module = factory(&ModuleSpec { id: "x", kind, seed: 1 });
            assert_eq!(module.kind(), kind);
        }
    }

    #[test]
    fn register_replaces() {
        let mut catalog = ModuleCatalog::empty();
        catalog.register("texture", |spec| Box::new(DroneModule::new(spec.seed)));
        assert!(catalog.contains("texture"));
        assert!(!catalog.contains("pad"));
    }
}
