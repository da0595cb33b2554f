//! Error types shared across the engine.
//!
//! Errors are recovered at the lowest level that can handle them: a voice
//! that fails to build is dropped, a module that keeps failing is disabled,
//! and only renderer-level failures reach the user.

use thiserror::Error;

use crate::render::NodeId;

/// Failures reported by a [`Renderer`](crate::render::Renderer).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RenderError {
    #[error("renderer context could not be created: {0}")]
    ContextUnavailable(String),

    #[error("renderer is closed")]
    Closed,

    #[error("unknown or already released node {0:?}")]
    UnknownNode(NodeId),

    #[error("node {node:?} has no parameter {param}")]
    UnsupportedParam { node: NodeId, param: &'static str },

    #[error("node {0:?} is not a source and cannot be started or stopped")]
    NotASource(NodeId),

    #[error("node {0:?} is not an analyser")]
    NotAnAnalyser(NodeId),

    #[error("graph construction failed: {0}")]
    Graph(String),
}

/// Invalid pattern data.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PatternError {
    #[error("step {index} has non-positive duration {beats}")]
    NonPositiveDuration { index: usize, beats: f64 },

    #[error("step {index} has velocity {velocity} outside 0..=1")]
    VelocityOutOfRange { index: usize, velocity: f32 },

    #[error("cannot read `{token}` as a step: {reason}")]
    Token { token: String, reason: &'static str },

    #[error("unbalanced brackets in pattern")]
    UnbalancedBrackets,

    #[error("empty subdivision; use `_` for silence")]
    EmptySubdivision,

    #[error("cannot read `{0}` as a duration")]
    Duration(String),
}

/// A call into a generator module failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModuleError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error("module is not initialized")]
    NotInitialized,

    #[error("module was disposed")]
    Disposed,

    #[error("module panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Failed(String),
}

/// Problems found while loading engine configuration or mood definitions.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("mood `{mood}` references unknown module kind `{kind}`")]
    UnknownKind { mood: String, kind: String },

    #[error("mood `{0}` is defined more than once")]
    DuplicateMood(String),

    #[error("mood `{mood}` lists module `{module}` twice")]
    DuplicateModule { mood: String, module: String },

    #[error("module `{module}` in mood `{mood}`: {source}")]
    Pattern {
        mood: String,
        module: String,
        #[source]
        source: PatternError,
    },

    #[error("{field} = {value} is outside {range}")]
    OutOfRange {
        field: String,
        value: f64,
        range: &'static str,
    },

    #[error("mood book contains no moods")]
    Empty,
}

/// Writing rendered audio to disk failed.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write WAV: {0}")]
    Wav(#[from] hound::Error),

    #[error("nothing to write")]
    Empty,
}
