//! Engine-wide tuning knobs.
//!
//! Every field has a default, so a TOML file only needs to mention the values
//! it wants to change:
//!
//! ```toml
//! lookahead_ms = 60.0
//! max_module_errors = 5
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Offset added to every scheduled onset so the renderer's automation
    /// queue, not the wake-up timer, decides when a sound starts.
    pub lookahead_ms: f64,
    /// Extra time after a release ends before sources stop and nodes are freed.
    pub voice_safety_margin: f64,
    /// Tempo used when a pattern asks for a non-positive one.
    pub default_tempo: f64,
    /// Consecutive failed calls tolerated before a module is disabled.
    pub max_module_errors: u32,
    /// Distinct fatal sources that force playback off.
    pub fatal_source_limit: usize,
    /// How many times a failed renderer context is recreated.
    pub recovery_attempts: u32,
    /// Delay before the first recreation attempt; grows linearly per attempt.
    pub recovery_delay_ms: f64,
    /// Interval of the analysis-tap health check.
    pub health_interval_ms: f64,
    /// Silent health checks in a row before the probe signal is sent.
    pub silent_checks_before_probe: u32,
    /// How long the probe runs before its result is read.
    pub probe_window_ms: f64,
    /// Fade used by `set_playing(false)` and for retiring modules.
    pub stop_fade: f64,
    /// Ramp time for mood changes after the initial one.
    pub transition_time: f64,
    /// Capacity of the error ring buffer.
    pub error_log_capacity: usize,
    /// Number of bins returned by `analysis_snapshot`.
    pub analysis_bins: usize,
    /// FFT size of the analysis tap.
    pub fft_size: usize,
    /// Maximum humanization offset applied to step onsets, in milliseconds.
    pub humanize_ms: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lookahead_ms: 50.0,
            voice_safety_margin: 0.1,
            default_tempo: 80.0,
            max_module_errors: 10,
            fatal_source_limit: 3,
            recovery_attempts: 3,
            recovery_delay_ms: 1500.0,
            health_interval_ms: 5000.0,
            silent_checks_before_probe: 2,
            probe_window_ms: 300.0,
            stop_fade: 2.0,
            transition_time: 4.0,
            error_log_capacity: 50,
            analysis_bins: 64,
            fft_size: 2048,
            humanize_ms: 8.0,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Lookahead in seconds.
    pub fn lookahead(&self) -> f64 {
        self.lookahead_ms / 1000.0
    }

    fn validate(&self) -> Result<(), ConfigError> {
        fn non_negative(field: &str, value: f64) -> Result<(), ConfigError> {
            if value.is_finite() && value >= 0.0 {
                Ok(())
            } else {
                Err(ConfigError::OutOfRange {
                    field: field.to_string(),
                    value,
                    range: ">= 0",
                })
            }
        }

        non_negative("lookahead_ms", self.lookahead_ms)?;
        non_negative("voice_safety_margin", self.voice_safety_margin)?;
        non_negative("recovery_delay_ms", self.recovery_delay_ms)?;
        non_negative("stop_fade", self.stop_fade)?;
        non_negative("transition_time", self.transition_time)?;
        non_negative("humanize_ms", self.humanize_ms)?;

        if self.health_interval_ms <= 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "health_interval_ms".into(),
                value: self.health_interval_ms,
                range: "> 0",
            });
        }
        if !self.fft_size.is_power_of_two() || self.fft_size < 64 {
            return Err(ConfigError::OutOfRange {
                field: "fft_size".into(),
                value: self.fft_size as f64,
                range: "power of two >= 64",
            });
        }
        if self.analysis_bins == 0 {
            return Err(ConfigError::OutOfRange {
                field: "analysis_bins".into(),
                value: 0.0,
                range: ">= 1",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn overrides_single_field() {
        let config = EngineConfig::from_toml_str("lookahead_ms = 80.0\nmax_module_errors = 3").unwrap();
        assert_eq!(config.lookahead_ms, 80.0);
        assert_eq!(config.max_module_errors, 3);
        assert_eq!(config.fatal_source_limit, 3);
        assert!((config.lookahead() - 0.08).abs() < 1e-12);
    }

    #[test]
    fn rejects_unknown_field() {
        assert!(EngineConfig::from_toml_str("lookahed_ms = 1.0").is_err());
    }

    #[test]
    fn rejects_bad_fft_size() {
        let err = EngineConfig::from_toml_str("fft_size = 1000").unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));
    }
}
