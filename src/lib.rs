//! Offline vocal-over-beat mastering.
//!
//! Given a vocal and a beat, produce one mastered buffer at a target
//! integrated loudness: the vocal is gained toward the target, the beat is
//! ducked under the vocal, and a look-ahead limiter holds the sample ceiling.
//!
//! ```no_run
//! use vxmaster::{render, AudioBuffer, MixSpec};
//!
//! # fn main() -> vxmaster::Result<()> {
//! let vocal = AudioBuffer::mono(vec![0.0; 48000], 48000)?;
//! let beat = AudioBuffer::from_planar(vec![vec![0.0; 48000]; 2], 48000)?;
//! let out = render(&vocal, &beat, &MixSpec::default())?;
//! println!("{:.2} LUFS", out.measurement.integrated_lufs);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod dsp;
pub mod error;
pub mod job;
pub mod meters;
pub mod presets;
pub mod render;
pub mod report;

#[cfg(test)]
mod test_signals;

pub use buffer::AudioBuffer;
pub use config::MixSpec;
pub use dsp::envelope::{derive_duck_curve, derive_duck_curve_spanning, DuckConfig, DuckCurve};
pub use dsp::gain::{GainPlan, GainStage};
pub use dsp::limiter::{LimiterConfig, LimiterStats, LookaheadLimiter};
pub use dsp::loudness::{LoudnessMeasurement, LoudnessMeter, MeterConfig, PeakMode};
pub use error::{MasterError, Result, Stage, Track};
pub use job::{render_batch, CancelToken, JobContext, JobHandle, MasteringJob, Progress};
pub use meters::LiveMeters;
pub use presets::{OutputPreset, PresetManager};
pub use render::{render, RenderOutput, RenderWarning, Renderer};
pub use report::{mastered_file_name, MasteringReport};
