//! Mix configuration for one mastering job.
//!
//! Every field has a default, so a JSON file only needs the values it changes:
//!
//! ```json
//! { "target_lufs": -16.0, "duck_depth_db": 4.0 }
//! ```

use serde::{Deserialize, Serialize};

use crate::dsp::envelope::DuckConfig;
use crate::dsp::gain::{DEFAULT_MAX_GAIN_DB, DEFAULT_MIN_GAIN_DB};
use crate::dsp::limiter::{LimiterConfig, MAX_LOOKAHEAD_MS};
use crate::dsp::loudness::{MeterConfig, MIN_SAMPLE_RATE};
use crate::error::{MasterError, Result};

pub const MIN_TARGET_LUFS: f32 = -50.0;
pub const MAX_TARGET_LUFS: f32 = -5.0;
pub const MIN_CEILING_DB: f32 = -20.0;
pub const MAX_DUCK_DEPTH_DB: f32 = 40.0;
pub const MAX_CORRECTIONS: u32 = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixSpec {
    pub target_lufs: f32,
    /// User trim on top of the planned vocal gain.
    pub vocal_gain_db: f32,
    pub beat_gain_db: f32,
    pub duck_depth_db: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    pub limiter_ceiling_db: f32,
    pub lookahead_ms: f32,
    pub limiter_release_ms: f32,
    pub control_rate_hz: f32,
    pub min_gain_db: f32,
    pub max_gain_db: f32,
    pub tolerance_lu: f32,
    pub max_corrections: u32,
    pub meter: MeterConfig,
    pub duck: DuckConfig,
}

impl Default for MixSpec {
    fn default() -> Self {
        Self {
            target_lufs: -14.0,
            vocal_gain_db: 0.0,
            beat_gain_db: 0.0,
            duck_depth_db: 6.0,
            attack_ms: 5.0,
            release_ms: 300.0,
            limiter_ceiling_db: -1.0,
            lookahead_ms: 5.0,
            limiter_release_ms: 60.0,
            control_rate_hz: 1000.0,
            min_gain_db: DEFAULT_MIN_GAIN_DB,
            max_gain_db: DEFAULT_MAX_GAIN_DB,
            tolerance_lu: 0.5,
            max_corrections: 2,
            meter: MeterConfig::default(),
            duck: DuckConfig::default(),
        }
    }
}

fn positive(name: &str, value: f32) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(MasterError::invalid(format!("{name} must be > 0, got {value}")))
    }
}

fn finite(name: &str, value: f32) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(MasterError::invalid(format!("{name} must be finite")))
    }
}

impl MixSpec {
    /// Parse a (partial) JSON override on top of the defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| MasterError::invalid(format!("mix spec: {e}")))
    }

    /// Check every range against the rate the job will run at.
    pub fn validate(&self, sample_rate: u32) -> Result<()> {
        if sample_rate < MIN_SAMPLE_RATE {
            return Err(MasterError::invalid(format!(
                "sample rate must be at least {MIN_SAMPLE_RATE} Hz, got {sample_rate}"
            )));
        }
        if !(MIN_TARGET_LUFS..=MAX_TARGET_LUFS).contains(&self.target_lufs) {
            return Err(MasterError::invalid(format!(
                "target loudness must be in [{MIN_TARGET_LUFS}, {MAX_TARGET_LUFS}] LUFS, got {}",
                self.target_lufs
            )));
        }
        finite("vocal gain", self.vocal_gain_db)?;
        finite("beat gain", self.beat_gain_db)?;
        positive("attack", self.attack_ms)?;
        positive("release", self.release_ms)?;
        positive("limiter release", self.limiter_release_ms)?;
        positive("look-ahead", self.lookahead_ms)?;
        if self.lookahead_ms > MAX_LOOKAHEAD_MS {
            return Err(MasterError::invalid(format!(
                "look-ahead must be <= {MAX_LOOKAHEAD_MS} ms, got {}",
                self.lookahead_ms
            )));
        }
        if !(self.limiter_ceiling_db > MIN_CEILING_DB && self.limiter_ceiling_db < 0.0) {
            return Err(MasterError::invalid(format!(
                "limiter ceiling must be in ({MIN_CEILING_DB}, 0) dBFS, got {}",
                self.limiter_ceiling_db
            )));
        }
        if !(0.0..=MAX_DUCK_DEPTH_DB).contains(&self.duck_depth_db) {
            return Err(MasterError::invalid(format!(
                "duck depth must be in [0, {MAX_DUCK_DEPTH_DB}] dB, got {}",
                self.duck_depth_db
            )));
        }
        positive("control rate", self.control_rate_hz)?;
        if self.control_rate_hz > sample_rate as f32 {
            return Err(MasterError::invalid(format!(
                "control rate {} Hz exceeds the sample rate {sample_rate} Hz",
                self.control_rate_hz
            )));
        }
        finite("min gain", self.min_gain_db)?;
        finite("max gain", self.max_gain_db)?;
        if self.min_gain_db > self.max_gain_db {
            return Err(MasterError::invalid(format!(
                "min gain {} dB is above max gain {} dB",
                self.min_gain_db, self.max_gain_db
            )));
        }
        positive("tolerance", self.tolerance_lu)?;
        if self.max_corrections > MAX_CORRECTIONS {
            return Err(MasterError::invalid(format!(
                "at most {MAX_CORRECTIONS} corrective passes, got {}",
                self.max_corrections
            )));
        }
        self.duck.validate()?;
        Ok(())
    }

    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            ceiling_db: self.limiter_ceiling_db,
            lookahead_ms: self.lookahead_ms,
            release_ms: self.limiter_release_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let spec = MixSpec::default();
        assert!(spec.validate(44100).is_ok());
        assert_eq!(spec.target_lufs, -14.0);
        assert_eq!(spec.max_corrections, 2);
        assert_eq!(spec.limiter_config(), LimiterConfig::default());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let spec = MixSpec::from_json(r#"{ "target_lufs": -16.0, "duck": { "window_ms": 20.0 } }"#)
            .unwrap();
        assert_eq!(spec.target_lufs, -16.0);
        assert_eq!(spec.duck.window_ms, 20.0);
        assert_eq!(spec.duck.silence_threshold_db, -50.0);
        assert_eq!(spec.release_ms, 300.0);
    }

    #[test]
    fn test_bad_json_is_invalid_config() {
        assert!(matches!(
            MixSpec::from_json("{ target_lufs: }"),
            Err(MasterError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let cases: Vec<fn(&mut MixSpec)> = vec![
            |s| s.target_lufs = -3.0,
            |s| s.target_lufs = -60.0,
            |s| s.limiter_ceiling_db = 0.0,
            |s| s.limiter_ceiling_db = -25.0,
            |s| s.lookahead_ms = 0.0,
            |s| s.lookahead_ms = 60.0,
            |s| s.attack_ms = -1.0,
            |s| s.release_ms = f32::NAN,
            |s| s.duck_depth_db = 41.0,
            |s| s.control_rate_hz = 96000.0,
            |s| s.min_gain_db = 20.0,
            |s| s.tolerance_lu = 0.0,
            |s| s.max_corrections = 9,
        ];
        for (i, mutate) in cases.into_iter().enumerate() {
            let mut spec = MixSpec::default();
            mutate(&mut spec);
            assert!(spec.validate(48000).is_err(), "case {i} accepted");
        }
    }

    #[test]
    fn test_low_sample_rate_rejected() {
        let spec = MixSpec::default();
        assert!(matches!(
            spec.validate(3000),
            Err(MasterError::InvalidConfig(_))
        ));
        assert!(spec.validate(MIN_SAMPLE_RATE).is_ok());
    }
}
