//! Sidechain Envelope Follower (Vocal → Beat Ducking)
//!
//! Turns the vocal's level over time into a gain curve for the beat. The beat
//! drops quickly when the vocal comes in and recovers slowly once it stops.
//!
//! # Perceptual Contract
//! - **Target Source**: the vocal track (any channel count, linked by max).
//! - **Intended Effect**: keep the vocal on top of the beat without the beat
//!   sounding switched on and off.
//! - **Failure Modes**:
//!   - Symmetric or instantaneous smoothing "breathes" audibly. Attack and
//!     release always use separate coefficients.
//!   - Thresholds set too low duck on breaths and room noise.
//!
//! # Design Notes
//! - Envelope: RMS over a short window ending at each control point, sampled
//!   at the control rate. Pure function of the input, no hidden state between
//!   calls.
//! - Level → reduction: 0 dB at/below the silence threshold, full depth
//!   at/above the activity threshold, linear in dB between.
//! - Smoothing: one-pole in the dB domain. `attack_ms` / `release_ms` are
//!   settle times (step within 0.1%), after which the state snaps to target.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::buffer::AudioBuffer;
use crate::dsp::utils::{amplitude_to_db, db_to_lin, settle_coeff};
use crate::error::{MasterError, Result, Stage, Track};
use crate::job::JobContext;

// =============================================================================
// Constants
// =============================================================================

/// Residual (dB) below which the smoothed reduction snaps to its target.
const SNAP_DB: f32 = 0.01;

/// Control points between progress checkpoints.
const POINTS_PER_CHECKPOINT: usize = 1024;

/// Frames between progress checkpoints while applying a curve.
const APPLY_CHUNK: usize = 1 << 16;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuckConfig {
    /// Vocal RMS at or below this causes no reduction.
    pub silence_threshold_db: f32,
    /// Vocal RMS at or above this causes the full duck depth.
    pub activity_threshold_db: f32,
    /// RMS window of the envelope detector.
    pub window_ms: f32,
}

impl Default for DuckConfig {
    fn default() -> Self {
        Self {
            silence_threshold_db: -50.0,
            activity_threshold_db: -30.0,
            window_ms: 10.0,
        }
    }
}

impl DuckConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.silence_threshold_db.is_finite() && self.activity_threshold_db.is_finite()) {
            return Err(MasterError::invalid("duck thresholds must be finite"));
        }
        if self.silence_threshold_db >= self.activity_threshold_db {
            return Err(MasterError::invalid(
                "silence threshold must be below the activity threshold",
            ));
        }
        if !(self.window_ms.is_finite() && self.window_ms > 0.0) {
            return Err(MasterError::invalid("envelope window must be > 0 ms"));
        }
        Ok(())
    }
}

// =============================================================================
// Duck Curve
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DuckPoint {
    pub sample_index: usize,
    /// 1.0 = no reduction.
    pub gain: f32,
}

/// Control-rate gain curve. Point `k` sits at sample `k * interval`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuckCurve {
    points: Vec<DuckPoint>,
    interval: usize,
    floor: f32,
}

impl DuckCurve {
    pub fn points(&self) -> &[DuckPoint] {
        &self.points
    }

    /// Samples between control points.
    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Gain at full reduction, `10^(-depth/20)`.
    pub fn floor(&self) -> f32 {
        self.floor
    }

    /// Sample index of the last control point.
    pub fn span(&self) -> usize {
        self.points.last().map(|p| p.sample_index).unwrap_or(0)
    }

    /// Smallest gain anywhere on the curve.
    pub fn min_gain(&self) -> f32 {
        self.points.iter().fold(1.0f32, |acc, p| acc.min(p.gain))
    }

    /// Linear interpolation between control points. Past the end the last
    /// value holds.
    #[inline]
    pub fn gain_at(&self, sample: usize) -> f32 {
        let k = sample / self.interval;
        let Some(p0) = self.points.get(k) else {
            return self.points.last().map(|p| p.gain).unwrap_or(1.0);
        };
        match self.points.get(k + 1) {
            Some(p1) => {
                let t = (sample - p0.sample_index) as f32 / self.interval as f32;
                p0.gain + (p1.gain - p0.gain) * t
            }
            None => p0.gain,
        }
    }

    /// Extend with unity points until the curve covers `frames`.
    pub fn pad_to(&self, frames: usize) -> DuckCurve {
        let mut points = self.points.clone();
        let mut next = self.span() + self.interval;
        while points.last().map(|p| p.sample_index + 1 < frames).unwrap_or(true) {
            points.push(DuckPoint {
                sample_index: next,
                gain: 1.0,
            });
            next += self.interval;
        }
        DuckCurve {
            points,
            interval: self.interval,
            floor: self.floor,
        }
    }

    /// Multiply `buffer` frame-by-frame by the interpolated curve.
    pub fn apply_in(&self, buffer: &AudioBuffer, ctx: &JobContext) -> Result<AudioBuffer> {
        let frames = buffer.frames();
        let total = buffer.channel_count() * frames.div_ceil(APPLY_CHUNK);
        let mut step = 0;
        let mut channels = Vec::with_capacity(buffer.channel_count());
        for data in buffer.channels() {
            let mut out = Vec::with_capacity(frames);
            for (c, chunk) in data.chunks(APPLY_CHUNK).enumerate() {
                let base = c * APPLY_CHUNK;
                out.extend(
                    chunk
                        .iter()
                        .enumerate()
                        .map(|(i, &s)| s * self.gain_at(base + i)),
                );
                step += 1;
                ctx.checkpoint(Stage::DuckCurve, step, total)?;
            }
            channels.push(out);
        }
        AudioBuffer::from_planar(channels, buffer.sample_rate())
    }
}

// =============================================================================
// Follower
// =============================================================================

pub struct SidechainFollower {
    interval: usize,
    window: usize,
    attack_coeff: f32,
    release_coeff: f32,
    depth_db: f32,
    silence_db: f32,
    activity_db: f32,

    // State
    reduction_db: f32,
}

impl SidechainFollower {
    pub fn new(
        sample_rate: u32,
        attack_ms: f32,
        release_ms: f32,
        duck_depth_db: f32,
        control_rate_hz: f32,
        config: &DuckConfig,
    ) -> Result<Self> {
        config.validate()?;
        if !(attack_ms.is_finite() && attack_ms > 0.0) {
            return Err(MasterError::invalid("attack must be > 0 ms"));
        }
        if !(release_ms.is_finite() && release_ms > 0.0) {
            return Err(MasterError::invalid("release must be > 0 ms"));
        }
        if !(duck_depth_db.is_finite() && duck_depth_db >= 0.0) {
            return Err(MasterError::invalid("duck depth must be >= 0 dB"));
        }
        let sr = sample_rate as f32;
        if !(control_rate_hz.is_finite() && control_rate_hz > 0.0 && control_rate_hz <= sr) {
            return Err(MasterError::invalid(format!(
                "control rate must be in (0, {sample_rate}] Hz"
            )));
        }

        let interval = (sr / control_rate_hz).round().max(1.0) as usize;
        // coefficients run once per control point
        let effective_rate = sr / interval as f32;
        Ok(Self {
            interval,
            window: ((config.window_ms * 0.001 * sr).round() as usize).max(1),
            attack_coeff: settle_coeff(attack_ms, effective_rate),
            release_coeff: settle_coeff(release_ms, effective_rate),
            depth_db: duck_depth_db,
            silence_db: config.silence_threshold_db,
            activity_db: config.activity_threshold_db,
            reduction_db: 0.0,
        })
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    #[inline]
    fn target_reduction(&self, level_db: f32) -> f32 {
        if level_db <= self.silence_db {
            0.0
        } else if level_db >= self.activity_db {
            self.depth_db
        } else {
            self.depth_db * (level_db - self.silence_db) / (self.activity_db - self.silence_db)
        }
    }

    /// Advance one control point and return the gain multiplier.
    #[inline]
    pub fn step(&mut self, level_db: f32) -> f32 {
        let target = self.target_reduction(level_db);
        let coeff = if target > self.reduction_db {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.reduction_db = target + coeff * (self.reduction_db - target);
        if (self.reduction_db - target).abs() < SNAP_DB {
            self.reduction_db = target;
        }
        db_to_lin(-self.reduction_db).clamp(db_to_lin(-self.depth_db), 1.0)
    }

    pub fn reset(&mut self) {
        self.reduction_db = 0.0;
    }

    /// Run over `vocal`, continuing over implicit silence until `span` frames
    /// are covered.
    pub fn derive(&mut self, vocal: &AudioBuffer, span: usize, ctx: &JobContext) -> Result<DuckCurve> {
        self.reset();
        let span = span.max(vocal.frames());
        let n_points = span.div_ceil(self.interval) + 1;
        let frames = vocal.frames();
        let n_ch = vocal.channel_count();

        // sliding sum of squares over [head - window, head) per channel
        let mut sums = vec![0.0f64; n_ch];
        let mut head = 0usize;
        let mut tail = 0usize;

        let mut points = Vec::with_capacity(n_points);
        for k in 0..n_points {
            let idx = k * self.interval;
            let end = idx.min(frames);
            while head < end {
                for (ch, sum) in sums.iter_mut().enumerate() {
                    let s = vocal.channel(ch)[head] as f64;
                    *sum += s * s;
                }
                head += 1;
            }
            let start = idx.saturating_sub(self.window).min(frames);
            while tail < start {
                for (ch, sum) in sums.iter_mut().enumerate() {
                    let s = vocal.channel(ch)[tail] as f64;
                    *sum -= s * s;
                }
                tail += 1;
            }

            let mean_sq = sums.iter().fold(0.0f64, |acc, &s| acc.max(s.max(0.0)))
                / self.window as f64;
            let level_db = amplitude_to_db(mean_sq.sqrt() as f32);
            points.push(DuckPoint {
                sample_index: idx,
                gain: self.step(level_db),
            });

            if (k + 1) % POINTS_PER_CHECKPOINT == 0 || k + 1 == n_points {
                ctx.checkpoint(Stage::DuckCurve, k + 1, n_points)?;
            }
        }

        let curve = DuckCurve {
            points,
            interval: self.interval,
            floor: db_to_lin(-self.depth_db),
        };
        debug!(
            "duck curve: {} points every {} samples, deepest {:.2} dB",
            curve.points.len(),
            curve.interval,
            amplitude_to_db(curve.min_gain())
        );
        Ok(curve)
    }
}

/// Duck curve covering exactly the vocal, with default thresholds.
pub fn derive_duck_curve(
    vocal: &AudioBuffer,
    attack_ms: f32,
    release_ms: f32,
    duck_depth_db: f32,
    control_rate_hz: f32,
) -> Result<DuckCurve> {
    derive_duck_curve_spanning(
        vocal,
        attack_ms,
        release_ms,
        duck_depth_db,
        control_rate_hz,
        vocal.frames(),
    )
}

/// Duck curve covering `span` frames; past the vocal the follower sees
/// silence and releases back to 1.0.
pub fn derive_duck_curve_spanning(
    vocal: &AudioBuffer,
    attack_ms: f32,
    release_ms: f32,
    duck_depth_db: f32,
    control_rate_hz: f32,
    span: usize,
) -> Result<DuckCurve> {
    if vocal.is_empty() {
        return Err(MasterError::EmptyInput {
            track: Track::Vocal,
        });
    }
    vocal.ensure_finite(Stage::DuckCurve)?;
    SidechainFollower::new(
        vocal.sample_rate(),
        attack_ms,
        release_ms,
        duck_depth_db,
        control_rate_hz,
        &DuckConfig::default(),
    )?
    .derive(vocal, span, &JobContext::detached())
}

// =============================================================================
// Tests
// =============================================================================
