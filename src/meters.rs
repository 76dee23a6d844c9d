//! Lock-free live metering for a running mastering job.
//!
//! The job thread stores values as `f32` bits in atomics; a UI thread polls
//! them without locks. Every value comes from real block processing (stage
//! progress, measured momentary loudness, limiter gain reduction).

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::Stage;

const STAGES: [Stage; 6] = [
    Stage::Input,
    Stage::Measure,
    Stage::Gain,
    Stage::DuckCurve,
    Stage::Mix,
    Stage::Limit,
];

#[derive(Debug)]
pub struct LiveMeters {
    stage: AtomicU32,
    stage_progress: AtomicU32,
    momentary_lufs: AtomicU32,
    gain_reduction_db: AtomicU32,
    true_peak_db: AtomicU32,
}

impl Default for LiveMeters {
    fn default() -> Self {
        Self {
            stage: AtomicU32::new(0),
            stage_progress: AtomicU32::new(0.0f32.to_bits()),
            momentary_lufs: AtomicU32::new(f32::NEG_INFINITY.to_bits()),
            gain_reduction_db: AtomicU32::new(0.0f32.to_bits()),
            true_peak_db: AtomicU32::new(f32::NEG_INFINITY.to_bits()),
        }
    }
}

impl LiveMeters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stage_progress(&self, stage: Stage, fraction: f32) {
        let idx = STAGES.iter().position(|s| *s == stage).unwrap_or(0);
        self.stage.store(idx as u32, Ordering::Relaxed);
        self.stage_progress
            .store(fraction.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn set_momentary_lufs(&self, val: f32) {
        self.momentary_lufs.store(val.to_bits(), Ordering::Relaxed);
    }

    pub fn set_gain_reduction_db(&self, val: f32) {
        self.gain_reduction_db.store(val.to_bits(), Ordering::Relaxed);
    }

    pub fn set_true_peak_db(&self, val: f32) {
        self.true_peak_db.store(val.to_bits(), Ordering::Relaxed);
    }

    pub fn get_stage(&self) -> Stage {
        let idx = self.stage.load(Ordering::Relaxed) as usize;
        STAGES.get(idx).copied().unwrap_or(Stage::Input)
    }

    pub fn get_stage_progress(&self) -> f32 {
        f32::from_bits(self.stage_progress.load(Ordering::Relaxed))
    }

    pub fn get_momentary_lufs(&self) -> f32 {
        f32::from_bits(self.momentary_lufs.load(Ordering::Relaxed))
    }

    pub fn get_gain_reduction_db(&self) -> f32 {
        f32::from_bits(self.gain_reduction_db.load(Ordering::Relaxed))
    }

    pub fn get_true_peak_db(&self) -> f32 {
        f32::from_bits(self.true_peak_db.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_silent() {
        let m = LiveMeters::new();
        assert_eq!(m.get_momentary_lufs(), f32::NEG_INFINITY);
        assert_eq!(m.get_stage(), Stage::Input);
        assert_eq!(m.get_stage_progress(), 0.0);
    }

    #[test]
    fn test_stage_progress_clamped() {
        let m = LiveMeters::new();
        m.set_stage_progress(Stage::Limit, 1.7);
        assert_eq!(m.get_stage(), Stage::Limit);
        assert_eq!(m.get_stage_progress(), 1.0);
    }
}
