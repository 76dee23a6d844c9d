//! Deterministic synthetic signals shared by unit tests.

use crate::buffer::AudioBuffer;

pub fn sine(freq: f32, amp: f32, seconds: f32, sr: u32) -> Vec<f32> {
    let n = (seconds * sr as f32) as usize;
    (0..n)
        .map(|i| {
            let t = i as f64 / sr as f64;
            (amp as f64 * (2.0 * std::f64::consts::PI * freq as f64 * t).sin()) as f32
        })
        .collect()
}

/// Uniform white noise from a fixed-seed LCG.
pub fn noise(seed: u32, amp: f32, seconds: f32, sr: u32) -> Vec<f32> {
    let n = (seconds * sr as f32) as usize;
    let mut state = seed.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let unit = (state >> 8) as f32 / (1u32 << 24) as f32;
            amp * (unit * 2.0 - 1.0)
        })
        .collect()
}

pub fn silence(seconds: f32, sr: u32) -> Vec<f32> {
    vec![0.0; (seconds * sr as f32) as usize]
}

pub fn stereo(samples: Vec<f32>, sr: u32) -> AudioBuffer {
    AudioBuffer::from_planar(vec![samples.clone(), samples], sr).unwrap()
}

pub fn mono(samples: Vec<f32>, sr: u32) -> AudioBuffer {
    AudioBuffer::mono(samples, sr).unwrap()
}

/// `a` followed by `b`.
pub fn concat(mut a: Vec<f32>, b: Vec<f32>) -> Vec<f32> {
    a.extend(b);
    a
}
