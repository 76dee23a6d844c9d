//! Serializable summary of a finished render.

use serde::Serialize;

use crate::dsp::loudness::PeakMode;
use crate::dsp::utils::{amplitude_to_db, format_db};
use crate::render::{RenderOutput, RenderWarning};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MasteringReport {
    pub achieved_lufs: Option<f32>,
    pub target_lufs: f32,
    pub true_peak_db: Option<f32>,
    pub peak_mode: PeakMode,
    /// Planned vocal gain, e.g. `+8.5 dB`.
    pub gain_adjustment: String,
    /// Deepest duck reduction applied to the beat, e.g. `-4.0 dB`.
    pub sidechain_level: String,
    pub corrections: u32,
    pub limiter_max_reduction_db: f32,
    pub limiter_guard_hits: usize,
    pub duration_secs: f64,
    pub sample_rate: u32,
    pub channels: usize,
    pub warnings: Vec<RenderWarning>,
    /// Per-block loudness for meter displays. Silent blocks are `null`.
    pub momentary: Vec<Option<f32>>,
}

/// JSON has no infinities; silence is reported as `null`.
fn finite(value: f32) -> Option<f32> {
    value.is_finite().then_some(value)
}

impl MasteringReport {
    pub fn from_output(out: &RenderOutput) -> Self {
        let m = &out.measurement;
        Self {
            achieved_lufs: finite(m.integrated_lufs),
            target_lufs: out.vocal_plan.target_lufs,
            true_peak_db: finite(m.true_peak_db),
            peak_mode: m.peak_mode,
            gain_adjustment: format_db(out.vocal_plan.static_gain_db),
            sidechain_level: format_db(amplitude_to_db(out.duck_floor)),
            corrections: out.corrections,
            limiter_max_reduction_db: out.limiter_stats.max_gain_reduction_db,
            limiter_guard_hits: out.limiter_stats.guard_hits,
            duration_secs: out.buffer.duration_secs(),
            sample_rate: out.buffer.sample_rate(),
            channels: out.buffer.channel_count(),
            warnings: out.warnings.clone(),
            momentary: m.momentary.iter().copied().map(finite).collect(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Download name for a mastered file: `Mastered_Loud_8.5dB_take.wav`.
pub fn mastered_file_name(gain_db: f32, name: &str) -> String {
    let gain = (gain_db * 10.0).round() / 10.0;
    let name = if name.is_empty() { "project" } else { name };
    format!("Mastered_Loud_{gain}dB_{name}")
}
