// Purpose: Voice lifecycle on top of the renderer's node graph
// A voice is a short-lived subgraph; this layer creates, releases and frees them

pub mod envelope;
pub mod factory;
pub mod manager;
pub mod voice;

pub use envelope::{Envelope, FilterEnvelope};
pub use factory::{NoteEvent, Timbre};
pub use manager::VoiceManager;
pub use voice::{VoiceBuilder, VoiceId, VoiceState};
