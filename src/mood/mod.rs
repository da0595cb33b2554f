//! Mood definitions.
//!
//! A [`MoodBook`] is the raw, deserialized form of a mood file. It is checked
//! once against a [`ModuleCatalog`] by [`MoodBook::resolve`], producing a
//! [`MoodTable`] the orchestrator can use without further validation: every
//! kind has a factory, every pattern parses, every control is in range.
//!
//! ```toml
//! [[moods]]
//! key = "calm"
//! tempo = 70
//! master = { volume = 0.8, warmth = 6000, reverb = { room = 0.8, mix = 0.4 } }
//!
//! [[moods.modules]]
//! id = "bed"
//! kind = "pad"
//! config = { volume = 80, occurrence = 100, intensity = 40 }
//! settings = { patterns = ["C3 _ A2 _"], step = "1/1", chord = [4, 7] }
//! ```

pub mod catalog;

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::modules::{ModuleSettings, MoodConfig};

pub use catalog::{ModuleCatalog, ModuleFactory, ModuleSpec};

const BUILTIN: &str = include_str!("../../assets/moods.toml");

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReverbSettings {
    pub room: f32,
    pub damping: f32,
    pub mix: f32,
}

impl Default for ReverbSettings {
    fn default() -> Self {
        Self {
            room: 0.7,
            damping: 0.5,
            mix: 0.3,
        }
    }
}

/// Parameters of the shared master chain for one mood.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MasterSettings {
    /// Master gain, 0..=1, before the user's volume
    pub volume: f32,
    pub reverb: ReverbSettings,
    /// Warmth low-pass cutoff in Hz
    pub warmth: f32,
    /// Saturator drive, 1.0 is nearly clean
    pub drive: f32,
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self {
            volume: 0.8,
            reverb: ReverbSettings::default(),
            warmth: 8000.0,
            drive: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleEntry {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub config: MoodConfig,
    #[serde(default)]
    pub settings: ModuleSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MoodDef {
    pub key: String,
    pub tempo: Option<f64>,
    #[serde(default)]
    pub master: MasterSettings,
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MoodBook {
    pub moods: Vec<MoodDef>,
}

impl MoodBook {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// The moods shipped with the crate.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_toml_str(BUILTIN)
    }

    /// Check every mood against `catalog` and bind module kinds to their
    /// factories.
    pub fn resolve(&self, catalog: &ModuleCatalog) -> Result<MoodTable, ConfigError> {
        if self.moods.is_empty() {
            return Err(ConfigError::Empty);
        }
        let mut seen = HashSet::new();
        let mut moods = Vec::with_capacity(self.moods.len());
        for def in &self.moods {
            if !seen.insert(def.key.as_str()) {
                return Err(ConfigError::DuplicateMood(def.key.clone()));
            }
            moods.push(resolve_mood(def, catalog)?);
        }
        Ok(MoodTable { moods })
    }
}

fn resolve_mood(def: &MoodDef, catalog: &ModuleCatalog) -> Result<Mood, ConfigError> {
    let key = &def.key;
    if let Some(tempo) = def.tempo {
        positive(&format!("{key}.tempo"), tempo)?;
    }
    let master = &def.master;
    unit(&format!("{key}.master.volume"), master.volume)?;
    unit(&format!("{key}.master.reverb.room"), master.reverb.room)?;
    unit(&format!("{key}.master.reverb.damping"), master.reverb.damping)?;
    unit(&format!("{key}.master.reverb.mix"), master.reverb.mix)?;
    positive(&format!("{key}.master.warmth"), master.warmth as f64)?;
    positive(&format!("{key}.master.drive"), master.drive as f64)?;

    let mut ids = HashSet::new();
    let mut modules = Vec::with_capacity(def.modules.len());
    for entry in &def.modules {
        if !ids.insert(entry.id.as_str()) {
            return Err(ConfigError::DuplicateModule {
                mood: key.clone(),
                module: entry.id.clone(),
            });
        }
        let factory = catalog.get(&entry.kind).ok_or_else(|| ConfigError::UnknownKind {
            mood: key.clone(),
            kind: entry.kind.clone(),
        })?;

        let field = |name: &str| format!("{key}.{}.{name}", entry.id);
        percent(&field("config.volume"), entry.config.volume)?;
        percent(&field("config.occurrence"), entry.config.occurrence)?;
        percent(&field("config.intensity"), entry.config.intensity)?;
        unit(&field("settings.brightness"), entry.settings.brightness)?;
        if let Some(tempo) = entry.settings.tempo {
            positive(&field("settings.tempo"), tempo)?;
        }
        entry
            .settings
            .parse_patterns()
            .map_err(|source| ConfigError::Pattern {
                mood: key.clone(),
                module: entry.id.clone(),
                source,
            })?;

        let mut settings = entry.settings.clone();
        settings.tempo = settings.tempo.or(def.tempo);
        modules.push(MoodModule {
            id: entry.id.clone(),
            kind: entry.kind.clone(),
            factory: factory.clone(),
            config: entry.config,
            settings,
        });
    }

    Ok(Mood {
        key: key.clone(),
        tempo: def.tempo,
        master: def.master,
        modules,
    })
}

fn percent(field: &str, value: f32) -> Result<(), ConfigError> {
    check(field, value as f64, (0.0..=100.0).contains(&value), "0..=100")
}

fn unit(field: &str, value: f32) -> Result<(), ConfigError> {
    check(field, value as f64, (0.0..=1.0).contains(&value), "0..=1")
}

fn positive(field: &str, value: f64) -> Result<(), ConfigError> {
    check(field, value, value > 0.0 && value.is_finite(), "> 0")
}

fn check(field: &str, value: f64, ok: bool, range: &'static str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field: field.to_string(),
            value,
            range,
        })
    }
}

/// One module of a resolved mood.
#[derive(Clone)]
pub struct MoodModule {
    pub id: String,
    pub kind: String,
    pub factory: ModuleFactory,
    pub config: MoodConfig,
    /// Settings with the mood's tempo filled in
    pub settings: ModuleSettings,
}

impl std::fmt::Debug for MoodModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoodModule")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Mood {
    pub key: String,
    pub tempo: Option<f64>,
    pub master: MasterSettings,
    /// In activation order
    pub modules: Vec<MoodModule>,
}

impl Mood {
    pub fn module(&self, id: &str) -> Option<&MoodModule> {
        self.modules.iter().find(|m| m.id == id)
    }
}

/// Validated moods, in the order they were defined.
#[derive(Debug, Clone)]
pub struct MoodTable {
    moods: Vec<Mood>,
}

impl MoodTable {
    /// The built-in mood book resolved against the built-in catalog.
    pub fn builtin() -> Result<Self, ConfigError> {
        MoodBook::builtin()?.resolve(&ModuleCatalog::builtin())
    }

    pub fn get(&self, key: &str) -> Option<&Mood> {
        self.moods.iter().find(|m| m.key == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.moods.iter().map(|m| m.key.as_str())
    }

    pub fn first(&self) -> Option<&Mood> {
        self.moods.first()
    }

    pub fn len(&self) -> usize {
        self.moods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moods.is_empty()
    }
}
