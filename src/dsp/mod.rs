//! Low-level DSP primitives used by the in-process renderer.
//!
//! These components only do the signal math; timing, gating and parameter
//! automation live in [`crate::render`].

/// Ring capture and log-spaced spectrum for analysis taps.
pub mod analyser;
/// State-variable filter implementation with multiple responses.
pub mod filter;
/// Oscillator waveforms and noise sources.
pub mod oscillator;
/// Schroeder reverb for the master chain.
pub mod reverb;
/// Soft saturation.
pub mod saturate;
