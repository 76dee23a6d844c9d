//! Planar PCM buffer passed between pipeline stages.
//!
//! A buffer is immutable once built. Stages read it through slices and return
//! a new buffer, so a job never shares mutable sample memory between stages.

use crate::error::{MasterError, Result, Stage};

#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl AudioBuffer {
    /// Build from one `Vec` per channel. All channels must have equal length.
    pub fn from_planar(channels: Vec<Vec<f32>>, sample_rate: u32) -> Result<Self> {
        if channels.is_empty() {
            return Err(MasterError::invalid("buffer needs at least one channel"));
        }
        if sample_rate == 0 {
            return Err(MasterError::invalid("sample rate must be > 0"));
        }
        let frames = channels[0].len();
        if channels.iter().any(|c| c.len() != frames) {
            return Err(MasterError::invalid("channels have different lengths"));
        }
        Ok(Self {
            channels,
            sample_rate,
        })
    }

    /// Build from interleaved frames (L R L R ...).
    pub fn from_interleaved(samples: &[f32], channels: usize, sample_rate: u32) -> Result<Self> {
        if channels == 0 {
            return Err(MasterError::invalid("buffer needs at least one channel"));
        }
        if samples.len() % channels != 0 {
            return Err(MasterError::invalid(format!(
                "{} interleaved samples do not divide into {} channels",
                samples.len(),
                channels
            )));
        }
        let frames = samples.len() / channels;
        let mut planar = vec![Vec::with_capacity(frames); channels];
        for frame in samples.chunks_exact(channels) {
            for (ch, &s) in frame.iter().enumerate() {
                planar[ch].push(s);
            }
        }
        Self::from_planar(planar, sample_rate)
    }

    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Result<Self> {
        Self::from_planar(vec![samples], sample_rate)
    }

    /// Silent buffer of the given shape.
    pub fn silence(channels: usize, frames: usize, sample_rate: u32) -> Result<Self> {
        Self::from_planar(vec![vec![0.0; frames]; channels.max(1)], sample_rate)
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.channels[0].len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    #[inline]
    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channels(&self) -> impl Iterator<Item = &[f32]> {
        self.channels.iter().map(|c| c.as_slice())
    }

    pub fn to_interleaved(&self) -> Vec<f32> {
        let n = self.channel_count();
        let mut out = Vec::with_capacity(self.frames() * n);
        for i in 0..self.frames() {
            for ch in &self.channels {
                out.push(ch[i]);
            }
        }
        out
    }

    /// Largest absolute sample value across all channels.
    pub fn sample_peak(&self) -> f32 {
        self.channels
            .iter()
            .flat_map(|c| c.iter())
            .fold(0.0f32, |acc, s| acc.max(s.abs()))
    }

    /// Duplicate a mono buffer into `channels` identical channels.
    /// Buffers that already have the requested layout are cloned unchanged.
    pub fn upmix(&self, channels: usize) -> Result<Self> {
        if self.channel_count() == channels {
            return Ok(self.clone());
        }
        if self.channel_count() != 1 {
            return Err(MasterError::invalid(format!(
                "cannot map {} channels onto {}",
                self.channel_count(),
                channels
            )));
        }
        Self::from_planar(vec![self.channels[0].clone(); channels], self.sample_rate)
    }

    /// Fail on the first NaN or infinite sample.
    pub fn ensure_finite(&self, stage: Stage) -> Result<()> {
        for (channel, data) in self.channels.iter().enumerate() {
            if let Some(frame) = data.iter().position(|s| !s.is_finite()) {
                return Err(MasterError::NonFiniteSample {
                    stage,
                    channel,
                    frame,
                });
            }
        }
        Ok(())
    }
}
