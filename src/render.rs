//! Mixer / Renderer
//!
//! Composes the stages of one render:
//!
//! ```text
//! vocal ─► Meter ─► GainPlan ─► Gain ──────────────┐
//!   │                                               ├─► Sum ─► Limiter ─► Meter
//!   └────► DuckCurve ─► × ◄─ Gain(beat) ◄─ beat ───┘
//! ```
//!
//! After the first limiter pass the output is measured; while it is outside
//! the tolerance a corrective gain is applied to the pre-limiter mix and the
//! limiter runs again. The number of passes is bounded by
//! `MixSpec::max_corrections`; running out of passes is a warning, not an
//! error.

use log::{debug, warn};
use serde::Serialize;

use crate::buffer::AudioBuffer;
use crate::config::MixSpec;
use crate::dsp::envelope::SidechainFollower;
use crate::dsp::gain::{GainPlan, GainStage};
use crate::dsp::limiter::{LimiterStats, LookaheadLimiter};
use crate::dsp::loudness::{LoudnessMeasurement, LoudnessMeter};
use crate::error::{MasterError, Result, Stage, Track};
use crate::job::JobContext;

/// Frames between progress checkpoints while summing.
const MIX_CHUNK: usize = 1 << 16;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RenderWarning {
    /// All corrective passes were used and the output is still outside the
    /// tolerance. The output is the best effort.
    ConvergenceExceeded {
        target_lufs: f32,
        achieved_lufs: f32,
        corrections: u32,
    },
    /// The final measurement came from less than one gating block.
    LowConfidence,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderOutput {
    #[serde(skip)]
    pub buffer: AudioBuffer,
    /// Measurement of `buffer`.
    pub measurement: LoudnessMeasurement,
    pub vocal_plan: GainPlan,
    /// Corrective passes used.
    pub corrections: u32,
    pub limiter_stats: LimiterStats,
    /// Deepest gain of the duck curve applied to the beat.
    pub duck_floor: f32,
    pub warnings: Vec<RenderWarning>,
}

impl RenderOutput {
    pub fn converged(&self) -> bool {
        !self
            .warnings
            .iter()
            .any(|w| matches!(w, RenderWarning::ConvergenceExceeded { .. }))
    }
}

pub struct Renderer {
    spec: MixSpec,
}

impl Renderer {
    pub fn new(spec: MixSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &MixSpec {
        &self.spec
    }

    pub fn render(&self, vocal: &AudioBuffer, beat: &AudioBuffer) -> Result<RenderOutput> {
        self.render_in(vocal, beat, &JobContext::detached())
    }

    pub fn render_in(
        &self,
        vocal: &AudioBuffer,
        beat: &AudioBuffer,
        ctx: &JobContext,
    ) -> Result<RenderOutput> {
        let spec = &self.spec;
        let (vocal, beat) = prepare_inputs(vocal, beat)?;
        let sr = vocal.sample_rate();
        spec.validate(sr)?;
        ctx.checkpoint(Stage::Input, 1, 1)?;

        // Vocal level
        let meter = LoudnessMeter::new(spec.meter);
        let vocal_measurement = meter.measure_in(&vocal, ctx)?;
        let vocal_plan = GainStage::plan(
            &vocal_measurement,
            spec.target_lufs,
            spec.min_gain_db,
            spec.max_gain_db,
        )?;
        let vocal = GainStage::apply_in(&vocal, vocal_plan.static_gain_db + spec.vocal_gain_db, ctx)?;

        // Ducked beat. The follower listens to the vocal as it sits in the mix.
        let span = vocal.frames().max(beat.frames());
        let curve = SidechainFollower::new(
            sr,
            spec.attack_ms,
            spec.release_ms,
            spec.duck_depth_db,
            spec.control_rate_hz,
            &spec.duck,
        )?
        .derive(&vocal, span, ctx)?;
        let beat = GainStage::apply_in(&beat, spec.beat_gain_db, ctx)?;
        let beat = curve.apply_in(&beat, ctx)?;

        let mix = sum_tracks(&vocal, &beat, ctx)?;
        debug!(
            "mix: {} frames x {} channels, vocal {:+.2} dB, duck floor {:.3}",
            mix.frames(),
            mix.channel_count(),
            vocal_plan.static_gain_db + spec.vocal_gain_db,
            curve.min_gain()
        );

        // Limit, measure, correct
        let limiter = spec.limiter_config();
        let (mut buffer, mut limiter_stats) = LookaheadLimiter::limit_with(&mix, &limiter, ctx)?;
        let mut measurement = meter.measure_in(&buffer, ctx)?;
        let mut corrections = 0u32;
        let mut correction_db = 0.0f32;

        while !measurement.is_silent()
            && (spec.target_lufs - measurement.integrated_lufs).abs() > spec.tolerance_lu
            && corrections < spec.max_corrections
        {
            correction_db += spec.target_lufs - measurement.integrated_lufs;
            debug!(
                "correction {}: {:.2} LUFS, mix gain {:+.2} dB",
                corrections + 1,
                measurement.integrated_lufs,
                correction_db
            );
            let corrected = GainStage::apply_in(&mix, correction_db, ctx)?;
            (buffer, limiter_stats) = LookaheadLimiter::limit_with(&corrected, &limiter, ctx)?;
            measurement = meter.measure_in(&buffer, ctx)?;
            corrections += 1;
        }

        let mut warnings = Vec::new();
        if !measurement.is_silent()
            && (spec.target_lufs - measurement.integrated_lufs).abs() > spec.tolerance_lu
        {
            warn!(
                "loudness did not converge: {:.2} LUFS after {} correction(s), target {:.2} LUFS",
                measurement.integrated_lufs, corrections, spec.target_lufs
            );
            warnings.push(RenderWarning::ConvergenceExceeded {
                target_lufs: spec.target_lufs,
                achieved_lufs: measurement.integrated_lufs,
                corrections,
            });
        }
        if measurement.low_confidence {
            warn!("output is shorter than one gating block; loudness is low confidence");
            warnings.push(RenderWarning::LowConfidence);
        }
        if let Some(meters) = ctx.meters() {
            meters.set_true_peak_db(measurement.true_peak_db);
        }

        Ok(RenderOutput {
            buffer,
            measurement,
            vocal_plan,
            corrections,
            limiter_stats,
            duck_floor: curve.min_gain(),
            warnings,
        })
    }
}

/// Render with a fresh [`Renderer`] and no job observers.
pub fn render(vocal: &AudioBuffer, beat: &AudioBuffer, spec: &MixSpec) -> Result<RenderOutput> {
    Renderer::new(spec.clone()).render(vocal, beat)
}

/// Validate both tracks and bring them to a common channel layout.
fn prepare_inputs(vocal: &AudioBuffer, beat: &AudioBuffer) -> Result<(AudioBuffer, AudioBuffer)> {
    if vocal.is_empty() {
        return Err(MasterError::EmptyInput {
            track: Track::Vocal,
        });
    }
    if beat.is_empty() {
        return Err(MasterError::EmptyInput { track: Track::Beat });
    }
    vocal.ensure_finite(Stage::Input)?;
    beat.ensure_finite(Stage::Input)?;
    if vocal.sample_rate() != beat.sample_rate() {
        return Err(MasterError::invalid(format!(
            "sample rates differ: vocal {} Hz, beat {} Hz",
            vocal.sample_rate(),
            beat.sample_rate()
        )));
    }
    let channels = vocal.channel_count().max(beat.channel_count());
    Ok((vocal.upmix(channels)?, beat.upmix(channels)?))
}

/// Sample-wise sum; the shorter track is padded with silence.
fn sum_tracks(a: &AudioBuffer, b: &AudioBuffer, ctx: &JobContext) -> Result<AudioBuffer> {
    let frames = a.frames().max(b.frames());
    let n_ch = a.channel_count();
    let total = n_ch * frames.div_ceil(MIX_CHUNK);
    let mut step = 0;

    let mut channels = Vec::with_capacity(n_ch);
    for (x, y) in a.channels().zip(b.channels()) {
        let mut out = Vec::with_capacity(frames);
        for start in (0..frames).step_by(MIX_CHUNK) {
            let end = (start + MIX_CHUNK).min(frames);
            out.extend((start..end).map(|i| {
                x.get(i).copied().unwrap_or(0.0) + y.get(i).copied().unwrap_or(0.0)
            }));
            step += 1;
            ctx.checkpoint(Stage::Mix, step, total)?;
        }
        channels.push(out);
    }
    let mix = AudioBuffer::from_planar(channels, a.sample_rate())?;
    mix.ensure_finite(Stage::Mix)?;
    Ok(mix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::utils::db_to_lin;
    use crate::test_signals::{mono, noise, silence, sine, stereo};

    const SR: u32 = 48000;

    fn vocal(seconds: f32) -> AudioBuffer {
        stereo(sine(220.0, 0.1, seconds, SR), SR)
    }

    fn beat(seconds: f32) -> AudioBuffer {
        stereo(noise(21, 0.1, seconds, SR), SR)
    }

    #[test]
    fn test_reaches_target_within_tolerance() {
        let spec = MixSpec::default();
        let out = render(&vocal(5.0), &beat(5.0), &spec).unwrap();
        assert!(
            (out.measurement.integrated_lufs - spec.target_lufs).abs() <= spec.tolerance_lu,
            "{} LUFS",
            out.measurement.integrated_lufs
        );
        assert!(out.converged());
        assert!(out.corrections <= spec.max_corrections);
        assert!(out.vocal_plan.static_gain_db > 0.0);
        assert!(out.duck_floor < 1.0);
    }

    #[test]
    fn test_output_respects_ceiling() {
        let spec = MixSpec {
            beat_gain_db: 12.0,
            ..MixSpec::default()
        };
        let out = render(&vocal(3.0), &beat(3.0), &spec).unwrap();
        let ceiling = db_to_lin(spec.limiter_ceiling_db);
        assert!(out.buffer.sample_peak() <= ceiling);
    }

    #[test]
    fn test_render_is_deterministic() {
        let spec = MixSpec::default();
        let a = render(&vocal(2.0), &beat(2.5), &spec).unwrap();
        let b = render(&vocal(2.0), &beat(2.5), &spec).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_silent_inputs_give_silent_output() {
        let quiet = stereo(silence(2.0, SR), SR);
        let out = render(&quiet, &quiet, &MixSpec::default()).unwrap();
        assert_eq!(out.measurement.integrated_lufs, f32::NEG_INFINITY);
        assert_eq!(out.measurement.true_peak_db, f32::NEG_INFINITY);
        assert_eq!(out.corrections, 0);
        assert!(out.warnings.is_empty());
        assert!(out.buffer.channels().all(|c| c.iter().all(|&s| s == 0.0)));
    }

    #[test]
    fn test_beat_longer_than_vocal() {
        let out = render(&vocal(1.0), &beat(3.0), &MixSpec::default()).unwrap();
        assert_eq!(out.buffer.frames(), 3 * SR as usize);
        assert!(out.buffer.channels().all(|c| c.iter().all(|s| s.is_finite())));
    }

    #[test]
    fn test_vocal_longer_than_beat() {
        let out = render(&vocal(3.0), &beat(1.0), &MixSpec::default()).unwrap();
        assert_eq!(out.buffer.frames(), 3 * SR as usize);
    }

    #[test]
    fn test_mono_vocal_over_stereo_beat() {
        let v = mono(sine(220.0, 0.1, 2.0, SR), SR);
        let out = render(&v, &beat(2.0), &MixSpec::default()).unwrap();
        assert_eq!(out.buffer.channel_count(), 2);
    }

    #[test]
    fn test_unreachable_target_warns() {
        let spec = MixSpec {
            target_lufs: -5.0,
            limiter_ceiling_db: -15.0,
            ..MixSpec::default()
        };
        let out = render(&vocal(3.0), &beat(3.0), &spec).unwrap();
        assert_eq!(out.corrections, spec.max_corrections);
        assert!(!out.converged());
        assert!(out.buffer.sample_peak() <= db_to_lin(-15.0));
    }

    #[test]
    fn test_no_corrections_allowed() {
        let spec = MixSpec {
            max_corrections: 0,
            beat_gain_db: 20.0,
            ..MixSpec::default()
        };
        let out = render(&vocal(2.0), &beat(2.0), &spec).unwrap();
        assert_eq!(out.corrections, 0);
    }

    #[test]
    fn test_short_render_is_low_confidence() {
        let out = render(&vocal(0.2), &beat(0.2), &MixSpec::default()).unwrap();
        assert!(out.warnings.contains(&RenderWarning::LowConfidence));
    }

    #[test]
    fn test_input_errors() {
        let empty = AudioBuffer::from_planar(vec![vec![]], SR).unwrap();
        assert_eq!(
            render(&empty, &beat(1.0), &MixSpec::default()).unwrap_err(),
            MasterError::EmptyInput {
                track: Track::Vocal
            }
        );
        assert_eq!(
            render(&vocal(1.0), &empty, &MixSpec::default()).unwrap_err(),
            MasterError::EmptyInput { track: Track::Beat }
        );

        let other_rate = stereo(noise(1, 0.1, 1.0, 44100), 44100);
        assert!(matches!(
            render(&vocal(1.0), &other_rate, &MixSpec::default()),
            Err(MasterError::InvalidConfig(_))
        ));

        let surround = AudioBuffer::silence(6, SR as usize, SR).unwrap();
        assert!(matches!(
            render(&vocal(1.0), &surround, &MixSpec::default()),
            Err(MasterError::InvalidConfig(_))
        ));

        let mut bad = noise(2, 0.1, 1.0, SR);
        bad[123] = f32::INFINITY;
        assert_eq!(
            render(&vocal(1.0), &stereo(bad, SR), &MixSpec::default()).unwrap_err(),
            MasterError::NonFiniteSample {
                stage: Stage::Input,
                channel: 0,
                frame: 123
            }
        );

        let spec = MixSpec {
            limiter_ceiling_db: 0.5,
            ..MixSpec::default()
        };
        assert!(matches!(
            render(&vocal(1.0), &beat(1.0), &spec),
            Err(MasterError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_input_buffers_untouched() {
        let v = vocal(1.0);
        let b = beat(1.0);
        let (v0, b0) = (v.clone(), b.clone());
        render(&v, &b, &MixSpec::default()).unwrap();
        assert_eq!(v, v0);
        assert_eq!(b, b0);
    }
}
