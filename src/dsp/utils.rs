/// `ln(1000)`: a one-pole driven by [`settle_coeff`] is within 0.1% of its
/// target after the given time.
const SETTLE_LN: f32 = 6.907_755;

/// Offset of the BS.1770 loudness formula.
const LUFS_OFFSET: f64 = -0.691;

#[inline]
pub fn db_to_lin(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

/// Linear amplitude to dB, with exact zero mapped to `-inf` instead of a floor.
#[inline]
pub fn amplitude_to_db(lin: f32) -> f32 {
    if lin > 0.0 {
        20.0 * lin.log10()
    } else {
        f32::NEG_INFINITY
    }
}

/// Weighted mean-square power to LUFS. Zero power is `-inf`, never NaN.
#[inline]
pub fn power_to_lufs(power: f64) -> f32 {
    if power > 0.0 {
        (LUFS_OFFSET + 10.0 * power.log10()) as f32
    } else {
        f32::NEG_INFINITY
    }
}

/// Inverse of [`power_to_lufs`].
#[inline]
pub fn lufs_to_power(lufs: f64) -> f64 {
    10.0f64.powf((lufs - LUFS_OFFSET) / 10.0)
}

/// One-pole coefficient whose time constant (1/e) is `ms`.
#[inline]
pub fn time_constant_coeff(ms: f32, rate: f32) -> f32 {
    let samples = (ms * 0.001 * rate).max(1e-6);
    (-1.0 / samples).exp()
}

/// One-pole coefficient that settles a step to 0.1% within `ms`.
#[inline]
pub fn settle_coeff(ms: f32, rate: f32) -> f32 {
    let samples = (ms * 0.001 * rate).max(1e-6);
    (-SETTLE_LN / samples).exp()
}

#[inline]
pub fn ms_to_samples(ms: f32, rate: f32) -> usize {
    (ms * 0.001 * rate).round().max(0.0) as usize
}

/// Signed dB string used in reports, e.g. `+8.5 dB`.
pub fn format_db(db: f32) -> String {
    if db.is_finite() {
        format!("{:+.1} dB", db)
    } else {
        "-inf dB".to_string()
    }
}
