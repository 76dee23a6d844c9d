//! Integrated Loudness Meter (EBU R128 / BS.1770)
//!
//! # Measurement Contract
//! - **Input**: any immutable [`AudioBuffer`] at [`MIN_SAMPLE_RATE`] or above.
//! - **Output**: gated integrated LUFS, peak, and the per-block loudness series.
//! - **Deterministic**: a fresh `ebur128` state per call, fed in a fixed order.
//!
//! K-weighting, 400 ms blocks every 100 ms and the two gates (-70 LUFS
//! absolute, -10 LU relative) come from `ebur128`. The meter is fed one 100 ms
//! hop at a time; the momentary loudness read after each complete block is the
//! block series.
//!
//! Buffers shorter than one block never form a gated block. Their single
//! partial block is zero-padded to 400 ms and the energy scaled back to the
//! real length, and the result is flagged low confidence.
//!
//! Silence never produces NaN: zero power maps to `f32::NEG_INFINITY`.

use ebur128::{EbuR128, Mode};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::buffer::AudioBuffer;
use crate::dsp::utils::{amplitude_to_db, lufs_to_power, power_to_lufs};
use crate::error::{MasterError, Result, Stage, Track};
use crate::job::JobContext;

/// Below this the K-weighting shelf sits too close to Nyquist to be meaningful.
pub const MIN_SAMPLE_RATE: u32 = 8_000;

/// At and above this rate the peak reading is a plain sample peak.
const TRUE_PEAK_MAX_RATE: u32 = 96_000;

/// 100 ms hops per 400 ms gating block.
const HOPS_PER_BLOCK: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    /// Use the 4x interpolator for the peak reading.
    pub oversample_true_peak: bool,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            oversample_true_peak: true,
        }
    }
}

/// How the peak value of a measurement was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeakMode {
    TruePeak4x,
    SamplePeak,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoudnessMeasurement {
    /// Gated integrated loudness. `-inf` for silence.
    pub integrated_lufs: f32,
    /// Peak in dBFS (dBTP when `peak_mode` is `TruePeak4x`). `-inf` for silence.
    pub true_peak_db: f32,
    /// Loudness of every gating block, in order.
    pub momentary: Vec<f32>,
    pub peak_mode: PeakMode,
    /// Buffer was shorter than one block; the value comes from one partial block.
    pub low_confidence: bool,
}

impl LoudnessMeasurement {
    pub fn is_silent(&self) -> bool {
        self.integrated_lufs == f32::NEG_INFINITY
    }
}

fn meter_error(e: ebur128::Error) -> MasterError {
    MasterError::invalid(format!("loudness meter: {e}"))
}

#[derive(Debug, Clone, Default)]
pub struct LoudnessMeter {
    config: MeterConfig,
}

impl LoudnessMeter {
    pub fn new(config: MeterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    pub fn measure(&self, buffer: &AudioBuffer) -> Result<LoudnessMeasurement> {
        self.measure_in(buffer, &JobContext::detached())
    }

    pub fn measure_in(&self, buffer: &AudioBuffer, ctx: &JobContext) -> Result<LoudnessMeasurement> {
        if buffer.is_empty() {
            return Err(MasterError::EmptyInput {
                track: Track::Input,
            });
        }
        buffer.ensure_finite(Stage::Measure)?;
        let rate = buffer.sample_rate();
        if rate < MIN_SAMPLE_RATE {
            return Err(MasterError::invalid(format!(
                "sample rate {rate} Hz is below the {MIN_SAMPLE_RATE} Hz loudness meter minimum"
            )));
        }

        let frames = buffer.frames();
        let n_ch = buffer.channel_count();
        let use_true_peak = self.config.oversample_true_peak && rate < TRUE_PEAK_MAX_RATE;
        let mode = if use_true_peak {
            Mode::I | Mode::TRUE_PEAK
        } else {
            Mode::I | Mode::SAMPLE_PEAK
        };
        let mut ebu = EbuR128::new(n_ch as u32, rate, mode).map_err(meter_error)?;

        // same rounding as ebur128's own 100 ms hop
        let hop = (rate as usize + 5) / 10;
        let block = hop * HOPS_PER_BLOCK;
        let low_confidence = frames < block;
        let n_hops = frames.div_ceil(hop);

        let mut momentary = Vec::with_capacity((frames / hop).saturating_sub(HOPS_PER_BLOCK - 1));
        for j in 0..n_hops {
            let start = j * hop;
            let end = (start + hop).min(frames);
            let slices: Vec<&[f32]> = buffer.channels().map(|c| &c[start..end]).collect();
            ebu.add_frames_planar_f32(&slices).map_err(meter_error)?;

            if end - start == hop && j + 1 >= HOPS_PER_BLOCK {
                let m = ebu.loudness_momentary().map_err(meter_error)? as f32;
                if let Some(meters) = ctx.meters() {
                    meters.set_momentary_lufs(m);
                }
                momentary.push(m);
            }
            ctx.checkpoint(Stage::Measure, j + 1, n_hops)?;
        }

        let integrated_lufs = if low_confidence {
            let pad = vec![0.0f32; block - frames];
            let slices: Vec<&[f32]> = (0..n_ch).map(|_| pad.as_slice()).collect();
            ebu.add_frames_planar_f32(&slices).map_err(meter_error)?;
            let padded = ebu.loudness_momentary().map_err(meter_error)?;
            let lufs = if padded == f64::NEG_INFINITY {
                f32::NEG_INFINITY
            } else {
                power_to_lufs(lufs_to_power(padded) * block as f64 / frames as f64)
            };
            momentary.push(lufs);
            lufs
        } else {
            ebu.loudness_global().map_err(meter_error)? as f32
        };
        if integrated_lufs.is_nan() {
            return Err(MasterError::invalid(format!(
                "loudness is undefined for this buffer at {rate} Hz"
            )));
        }

        let mut peak = 0.0f64;
        for ch in 0..n_ch as u32 {
            let p = if use_true_peak {
                ebu.true_peak(ch)
            } else {
                ebu.sample_peak(ch)
            };
            peak = peak.max(p.map_err(meter_error)?);
        }

        let measurement = LoudnessMeasurement {
            integrated_lufs,
            true_peak_db: amplitude_to_db(peak as f32),
            momentary,
            peak_mode: if use_true_peak {
                PeakMode::TruePeak4x
            } else {
                PeakMode::SamplePeak
            },
            low_confidence,
        };
        debug!(
            "measured {} frame(s) x {} ch: {:.2} LUFS, peak {:.2} dB ({:?}){}",
            frames,
            n_ch,
            measurement.integrated_lufs,
            measurement.true_peak_db,
            measurement.peak_mode,
            if low_confidence { ", low confidence" } else { "" }
        );
        Ok(measurement)
    }
}
