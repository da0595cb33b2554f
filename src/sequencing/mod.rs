pub mod duration;
pub mod notes;
pub mod pattern;

pub use duration::Duration;
pub use pattern::{Pattern, PatternSlot, Step};
