//! Static Gain Stage
//!
//! Plans a single broadband gain that moves a measured buffer toward a target
//! loudness, and applies it without touching the input buffer.
//!
//! The plan is clamped to `[min_db, max_db]` (default 0..+15 dB) however large
//! the measured deficit is, so near-silent or noise-floor input is never
//! amplified without bound. With the default `min_db = 0` this stage only ever
//! boosts; attenuation is opt-in by passing a negative `min_db`.

use log::debug;
use serde::Serialize;

use crate::buffer::AudioBuffer;
use crate::dsp::loudness::LoudnessMeasurement;
use crate::dsp::utils::db_to_lin;
use crate::error::{MasterError, Result, Stage, Track};
use crate::job::JobContext;

pub const DEFAULT_MIN_GAIN_DB: f32 = 0.0;
pub const DEFAULT_MAX_GAIN_DB: f32 = 15.0;

/// Frames between progress checkpoints while applying gain.
const APPLY_CHUNK: usize = 1 << 16;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GainPlan {
    pub static_gain_db: f32,
    pub target_lufs: f32,
    /// Measurement the plan was derived from.
    pub computed_at: LoudnessMeasurement,
}

impl GainPlan {
    /// Deficit before clamping. `+inf` for a silent measurement.
    pub fn requested_db(&self) -> f32 {
        self.target_lufs - self.computed_at.integrated_lufs
    }

    pub fn was_clamped(&self) -> bool {
        self.requested_db() != self.static_gain_db
    }
}

pub struct GainStage;

impl GainStage {
    pub fn plan(
        measurement: &LoudnessMeasurement,
        target_lufs: f32,
        min_db: f32,
        max_db: f32,
    ) -> Result<GainPlan> {
        if !target_lufs.is_finite() {
            return Err(MasterError::invalid("target loudness must be finite"));
        }
        if !(min_db.is_finite() && max_db.is_finite()) || min_db > max_db {
            return Err(MasterError::invalid(format!(
                "gain range [{min_db}, {max_db}] dB is not a valid interval"
            )));
        }

        // -inf input gives +inf here, which clamps to max_db
        let requested = target_lufs - measurement.integrated_lufs;
        let static_gain_db = requested.clamp(min_db, max_db);
        debug!(
            "gain plan: {:.2} LUFS -> {:.2} LUFS, requested {:+.2} dB, planned {:+.2} dB",
            measurement.integrated_lufs, target_lufs, requested, static_gain_db
        );

        Ok(GainPlan {
            static_gain_db,
            target_lufs,
            computed_at: measurement.clone(),
        })
    }

    /// Multiply every sample by `10^(gain_db/20)` into a new buffer.
    pub fn apply(buffer: &AudioBuffer, gain_db: f32) -> Result<AudioBuffer> {
        Self::apply_in(buffer, gain_db, &JobContext::detached())
    }

    pub fn apply_in(buffer: &AudioBuffer, gain_db: f32, ctx: &JobContext) -> Result<AudioBuffer> {
        if buffer.is_empty() {
            return Err(MasterError::EmptyInput {
                track: Track::Input,
            });
        }
        if !gain_db.is_finite() {
            return Err(MasterError::invalid("gain must be finite"));
        }
        let g = db_to_lin(gain_db);
        let frames = buffer.frames();
        let total = buffer.channel_count() * frames.div_ceil(APPLY_CHUNK);
        let mut step = 0;

        let mut channels = Vec::with_capacity(buffer.channel_count());
        for data in buffer.channels() {
            let mut out = Vec::with_capacity(frames);
            for chunk in data.chunks(APPLY_CHUNK) {
                out.extend(chunk.iter().map(|&s| s * g));
                step += 1;
                ctx.checkpoint(Stage::Gain, step, total)?;
            }
            channels.push(out);
        }
        let out = AudioBuffer::from_planar(channels, buffer.sample_rate())?;
        out.ensure_finite(Stage::Gain)?;
        Ok(out)
    }
}
