//! Built-in timbres.
//!
//! Each timbre is a small recipe for one voice's graph. Use these as starting
//! points for your own sounds, or study them to learn how different timbres
//! are built.
//!
//! # Example
//!
//! ```ignore
//! use moodscape::modules::PatternModule;
//! use moodscape::voices::{Bell, Pluck};
//!
//! let melody = PatternModule::new("pluck", Pluck::default(), 7);
//! let chimes = PatternModule::new("bell", Bell, 8);
//! ```

mod bell;
mod hihat;
mod kick;
mod pad;
mod pluck;

pub use bell::Bell;
pub use hihat::HiHat;
pub use kick::Kick;
pub use pad::Pad;
pub use pluck::Pluck;
