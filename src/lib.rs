//! Generative ambient soundscapes driven by moods.
//!
//! A mood names a set of generator modules and their settings. The
//! [`orchestrator::Orchestrator`] owns the master chain and the module
//! registry, moves between moods, and keeps failing modules from taking the
//! rest of the mix down with them. Modules share one scheduling and voice
//! framework ([`engine::scheduler`], [`synth::manager`]) and talk to audio only
//! through the [`render::Renderer`] seam.

pub mod config;
pub mod dsp;
pub mod engine; // Timer queue and lookahead scheduling
pub mod error;
pub mod modules; // Generator modules and the contract they implement
pub mod mood;
pub mod orchestrator;
pub mod render;
pub mod sequencing; // Patterns, steps and note names
pub mod session;
pub mod synth; // Voice lifecycle and envelopes
pub mod voices; // Timbres

pub use config::EngineConfig;
pub use error::{ConfigError, ExportError, ModuleError, PatternError, RenderError};
pub use mood::{MoodBook, MoodTable, ModuleCatalog};
pub use orchestrator::Orchestrator;
pub use session::OfflineSession;

/// Largest block the renderer processes in one pass.
pub const MAX_BLOCK_SIZE: usize = 2048;
