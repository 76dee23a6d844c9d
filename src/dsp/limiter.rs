//! Look-ahead Output Limiter
//!
//! # Perceptual Contract
//! - **Target Source**: the summed mix, after all gain and ducking.
//! - **Intended Effect**: hold every output sample at or below the ceiling
//!   while ramping gain down ahead of each peak instead of on it.
//! - **Failure Modes**:
//!   - Audible pumping when driven hard (>6 dB gain reduction) with a short
//!     release.
//! - **Will Not Do**:
//!   - Intersample (true-peak) limiting. The ceiling is a sample ceiling.
//!   - Provide "glue" compression (this is purely for safety).
//!
//! # Gain Computer
//! Per frame the required gain is `min(1, ceiling / peak)` with `peak` linked
//! across channels. Over a window of `L = lookahead + 1` frames:
//! 1. sliding minimum of the required gain (monotonic deque),
//! 2. release one-pole that may only rise slowly and falls instantly,
//! 3. box average of length `L`.
//!
//! The audio is delayed by `L - 1` frames, so the averaged gain applied to a
//! sample never exceeds the gain that sample required. A final per-sample
//! guard catches float rounding.

use std::collections::VecDeque;

use log::debug;
use ringbuf::{Consumer, Producer, RingBuffer};
use serde::{Deserialize, Serialize};

use crate::buffer::AudioBuffer;
use crate::dsp::utils::{amplitude_to_db, db_to_lin, ms_to_samples, time_constant_coeff};
use crate::error::{MasterError, Result, Stage, Track};
use crate::job::JobContext;

/// Frames between progress checkpoints.
const BLOCK: usize = 4096;

/// Longest accepted look-ahead.
pub const MAX_LOOKAHEAD_MS: f32 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub ceiling_db: f32,
    pub lookahead_ms: f32,
    pub release_ms: f32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            ceiling_db: -1.0,
            lookahead_ms: 5.0,
            release_ms: 60.0,
        }
    }
}

impl LimiterConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.ceiling_db.is_finite() && self.ceiling_db < 0.0) {
            return Err(MasterError::invalid(format!(
                "limiter ceiling must be below 0 dBFS, got {}",
                self.ceiling_db
            )));
        }
        if !(self.lookahead_ms > 0.0 && self.lookahead_ms <= MAX_LOOKAHEAD_MS) {
            return Err(MasterError::invalid(format!(
                "look-ahead must be in (0, {MAX_LOOKAHEAD_MS}] ms"
            )));
        }
        if !(self.release_ms.is_finite() && self.release_ms > 0.0) {
            return Err(MasterError::invalid("limiter release must be > 0 ms"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LimiterStats {
    /// Deepest applied reduction, positive dB.
    pub max_gain_reduction_db: f32,
    /// Samples the final guard had to clamp.
    pub guard_hits: usize,
}

impl Default for LimiterStats {
    fn default() -> Self {
        Self {
            max_gain_reduction_db: 0.0,
            guard_hits: 0,
        }
    }
}

struct DelayLine {
    producer: Producer<f32>,
    consumer: Consumer<f32>,
}

impl DelayLine {
    fn new(delay: usize) -> Self {
        let (mut producer, consumer) = RingBuffer::<f32>::new(delay + 1).split();
        for _ in 0..delay {
            let _ = producer.push(0.0);
        }
        Self { producer, consumer }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let _ = self.producer.push(input);
        self.consumer.pop().unwrap_or(0.0)
    }
}

/// Streaming channel-linked limiter. Output lags input by
/// [`latency`](Self::latency) frames; [`process_in`](Self::process_in)
/// compensates for it.
pub struct LookaheadLimiter {
    ceiling: f32,
    window: usize,
    release_coeff: f32,
    delays: Vec<DelayLine>,

    // Gain computer state
    frame: usize,
    held: VecDeque<(usize, f32)>,
    env: f32,
    history: VecDeque<f32>,
    sum: f64,

    stats: LimiterStats,
}

impl LookaheadLimiter {
    pub fn new(config: &LimiterConfig, sample_rate: u32, channels: usize) -> Result<Self> {
        config.validate()?;
        if channels == 0 {
            return Err(MasterError::invalid("limiter needs at least one channel"));
        }
        let sr = sample_rate as f32;
        let window = ms_to_samples(config.lookahead_ms, sr) + 1;
        Ok(Self {
            ceiling: db_to_lin(config.ceiling_db),
            window,
            release_coeff: time_constant_coeff(config.release_ms, sr),
            delays: (0..channels).map(|_| DelayLine::new(window - 1)).collect(),
            frame: 0,
            held: VecDeque::with_capacity(window),
            env: 1.0,
            history: std::iter::repeat(1.0).take(window).collect(),
            sum: window as f64,
            stats: LimiterStats::default(),
        })
    }

    /// Frames of delay between input and output.
    pub fn latency(&self) -> usize {
        self.window - 1
    }

    pub fn stats(&self) -> LimiterStats {
        self.stats
    }

    #[inline]
    fn compute_gain(&mut self, peak: f32) -> f32 {
        let required = if peak > self.ceiling {
            self.ceiling / peak
        } else {
            1.0
        };

        // 1. sliding minimum over the last `window` frames
        while self.held.back().is_some_and(|&(_, g)| g >= required) {
            self.held.pop_back();
        }
        self.held.push_back((self.frame, required));
        while self
            .held
            .front()
            .is_some_and(|&(i, _)| i + self.window <= self.frame)
        {
            self.held.pop_front();
        }
        let held = self.held.front().map(|&(_, g)| g).unwrap_or(1.0);
        self.frame += 1;

        // 2. release: falls instantly, rises with the one-pole
        self.env = if held < self.env {
            held
        } else {
            held + self.release_coeff * (self.env - held)
        };

        // 3. box average
        let oldest = self.history.pop_front().unwrap_or(1.0);
        self.history.push_back(self.env);
        self.sum += self.env as f64 - oldest as f64;
        ((self.sum / self.window as f64) as f32).min(1.0)
    }

    /// Process one frame in place. Returns the gain applied to the delayed
    /// frame that was written out.
    #[inline]
    pub fn process_frame(&mut self, frame: &mut [f32]) -> f32 {
        let peak = frame.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        let gain = self.compute_gain(peak);

        for (sample, delay) in frame.iter_mut().zip(self.delays.iter_mut()) {
            let mut y = delay.process(*sample) * gain;
            if y.abs() > self.ceiling {
                y = self.ceiling.copysign(y);
                self.stats.guard_hits += 1;
            }
            *sample = y;
        }

        let reduction = -amplitude_to_db(gain);
        if reduction > self.stats.max_gain_reduction_db {
            self.stats.max_gain_reduction_db = reduction;
        }
        gain
    }

    /// Limit a whole buffer. Output has the input's length and alignment.
    pub fn process_in(&mut self, buffer: &AudioBuffer, ctx: &JobContext) -> Result<AudioBuffer> {
        if buffer.channel_count() != self.delays.len() {
            return Err(MasterError::invalid(format!(
                "limiter built for {} channels, got {}",
                self.delays.len(),
                buffer.channel_count()
            )));
        }
        let frames = buffer.frames();
        let n_ch = buffer.channel_count();
        let latency = self.latency();
        let total = (frames + latency).div_ceil(BLOCK);

        let mut out: Vec<Vec<f32>> = (0..n_ch).map(|_| Vec::with_capacity(frames)).collect();
        let mut scratch = vec![0.0f32; n_ch];
        let mut block_min = 1.0f32;

        for n in 0..frames + latency {
            for (ch, s) in scratch.iter_mut().enumerate() {
                *s = if n < frames { buffer.channel(ch)[n] } else { 0.0 };
            }
            let gain = self.process_frame(&mut scratch);
            if n >= latency {
                for (dst, &s) in out.iter_mut().zip(scratch.iter()) {
                    dst.push(s);
                }
            }

            block_min = block_min.min(gain);
            if (n + 1) % BLOCK == 0 || n + 1 == frames + latency {
                if let Some(meters) = ctx.meters() {
                    meters.set_gain_reduction_db(-amplitude_to_db(block_min));
                }
                block_min = 1.0;
                ctx.checkpoint(Stage::Limit, (n + 1).div_ceil(BLOCK), total)?;
            }
        }

        AudioBuffer::from_planar(out, buffer.sample_rate())
    }

    /// Configured one-shot form.
    pub fn limit_with(
        buffer: &AudioBuffer,
        config: &LimiterConfig,
        ctx: &JobContext,
    ) -> Result<(AudioBuffer, LimiterStats)> {
        if buffer.is_empty() {
            return Err(MasterError::EmptyInput {
                track: Track::Input,
            });
        }
        buffer.ensure_finite(Stage::Limit)?;
        let mut limiter = Self::new(config, buffer.sample_rate(), buffer.channel_count())?;
        let out = limiter.process_in(buffer, ctx)?;
        let stats = limiter.stats();
        debug!(
            "limiter: ceiling {:.2} dBFS, max reduction {:.2} dB, {} guard hit(s)",
            config.ceiling_db, stats.max_gain_reduction_db, stats.guard_hits
        );
        Ok((out, stats))
    }

    /// Limit `buffer` to `ceiling_db` with the default release.
    pub fn limit(buffer: &AudioBuffer, ceiling_db: f32, lookahead_ms: f32) -> Result<AudioBuffer> {
        let config = LimiterConfig {
            ceiling_db,
            lookahead_ms,
            ..LimiterConfig::default()
        };
        Self::limit_with(buffer, &config, &JobContext::detached()).map(|(out, _)| out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_signals::{concat, noise, silence, sine, stereo};

    const SR: u32 = 48000;

    fn assert_under_ceiling(buf: &AudioBuffer, ceiling_db: f32) {
        let c = db_to_lin(ceiling_db);
        for data in buf.channels() {
            for (i, s) in data.iter().enumerate() {
                assert!(s.abs() <= c, "sample {i} = {s} over ceiling {c}");
            }
        }
    }

    #[test]
    fn test_ceiling_never_exceeded_on_overdriven_input() {
        let hot = stereo(noise(11, 4.0, 2.0, SR), SR);
        let out = LookaheadLimiter::limit(&hot, -1.0, 5.0).unwrap();
        assert_under_ceiling(&out, -1.0);
    }

    #[test]
    fn test_clipped_square_input() {
        let square: Vec<f32> = sine(50.0, 1.0, 1.0, SR)
            .into_iter()
            .map(|s| if s >= 0.0 { 1.0 } else { -1.0 })
            .collect();
        let out = LookaheadLimiter::limit(&stereo(square, SR), -0.3, 2.0).unwrap();
        assert_under_ceiling(&out, -0.3);
    }

    #[test]
    fn test_single_spike_is_caught() {
        let mut x = silence(0.5, SR);
        x[1000] = 10.0;
        x[1001] = -10.0;
        let buf = stereo(x, SR);
        let (out, stats) =
            LookaheadLimiter::limit_with(&buf, &LimiterConfig::default(), &JobContext::detached())
                .unwrap();
        assert_under_ceiling(&out, -1.0);
        assert!(stats.max_gain_reduction_db > 20.0);
        // alignment: the spike is still at the same frame
        assert!(out.channel(0)[1000] > 0.8);
    }

    #[test]
    fn test_length_and_alignment_preserved() {
        let x = sine(440.0, 0.2, 0.73, SR);
        let buf = stereo(x.clone(), SR);
        let out = LookaheadLimiter::limit(&buf, -1.0, 5.0).unwrap();
        assert_eq!(out.frames(), buf.frames());
        assert_eq!(out.channel_count(), 2);
        // below the ceiling the limiter is transparent
        for (a, b) in out.channel(0).iter().zip(x.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_gain_ramps_before_peak() {
        let quiet = sine(200.0, 0.1, 0.5, SR);
        let loud = sine(200.0, 1.0, 0.5, SR);
        let x = concat(quiet, loud);
        let buf = stereo(x.clone(), SR);
        let out = LookaheadLimiter::limit(&buf, -6.0, 5.0).unwrap();
        let onset = SR as usize / 2;
        // within the look-ahead window before the loud part the gain is
        // already below unity
        let i = onset - 60;
        assert!(x[i].abs() > 0.01);
        assert!(out.channel(0)[i].abs() < x[i].abs());
        assert_under_ceiling(&out, -6.0);
    }

    #[test]
    fn test_release_recovers() {
        let x = concat(sine(200.0, 2.0, 0.2, SR), sine(200.0, 0.1, 1.0, SR));
        let out = LookaheadLimiter::limit(&stereo(x.clone(), SR), -1.0, 5.0).unwrap();
        let tail = x.len() - 100;
        assert!((out.channel(0)[tail] - x[tail]).abs() < 1e-3);
    }

    #[test]
    fn test_channels_are_linked() {
        let left = sine(300.0, 2.0, 0.3, SR);
        let right = sine(300.0, 0.2, 0.3, SR);
        let buf = AudioBuffer::from_planar(vec![left, right.clone()], SR).unwrap();
        let out = LookaheadLimiter::limit(&buf, -1.0, 5.0).unwrap();
        // quarter period past a zero crossing: both channels at their peak
        let i = SR as usize / 10 + 40;
        assert!(right[i] > 0.19);
        // right channel was under the ceiling yet follows the left's gain
        assert!(out.channel(1)[i].abs() < right[i] * 0.6);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let buf = stereo(sine(440.0, 0.2, 0.1, SR), SR);
        assert!(LookaheadLimiter::limit(&buf, 0.0, 5.0).is_err());
        assert!(LookaheadLimiter::limit(&buf, 1.0, 5.0).is_err());
        assert!(LookaheadLimiter::limit(&buf, -1.0, 0.0).is_err());
        assert!(LookaheadLimiter::limit(&buf, -1.0, 80.0).is_err());
        let bad_release = LimiterConfig {
            release_ms: 0.0,
            ..LimiterConfig::default()
        };
        assert!(bad_release.validate().is_err());
    }

    #[test]
    fn test_empty_and_non_finite_rejected() {
        let empty = AudioBuffer::from_planar(vec![vec![], vec![]], SR).unwrap();
        assert!(matches!(
            LookaheadLimiter::limit(&empty, -1.0, 5.0),
            Err(MasterError::EmptyInput { .. })
        ));
        let mut x = sine(440.0, 0.2, 0.1, SR);
        x[10] = f32::NAN;
        assert!(matches!(
            LookaheadLimiter::limit(&stereo(x, SR), -1.0, 5.0),
            Err(MasterError::NonFiniteSample { .. })
        ));
    }

    #[test]
    fn test_deterministic() {
        let buf = stereo(noise(3, 3.0, 1.0, SR), SR);
        let a = LookaheadLimiter::limit(&buf, -1.0, 5.0).unwrap();
        let b = LookaheadLimiter::limit(&buf, -1.0, 5.0).unwrap();
        assert_eq!(a, b);
    }
}
