//! Sample-rate conversion between the gateway (16 kHz) and cloud (24 kHz)
//! sides of the bridge.
//!
//! Upsampling is linear interpolation at the exact 3:2 ratio with TPDF
//! dither on the interpolated values. Downsampling first low-passes with a
//! 64-tap Blackman-windowed sinc FIR (cutoff 7.2 kHz, 0.6 × the target
//! Nyquist) to keep aliases out of the band, then decimates 3:2. Both
//! directions are stateless per buffer; edges see zero padding, which rolls
//! the filter off at buffer boundaries.

use once_cell::sync::Lazy;
use rand::Rng;

const FIR_TAPS: usize = 64;

/// Cutoff of the anti-alias filter, in cycles per 24 kHz sample.
const FIR_CUTOFF: f64 = 7_200.0 / 24_000.0;

static FIR_COEFFS: Lazy<[f64; FIR_TAPS]> = Lazy::new(|| {
    let mut coeffs = [0.0f64; FIR_TAPS];
    let center = (FIR_TAPS - 1) as f64 / 2.0;
    for (n, c) in coeffs.iter_mut().enumerate() {
        let x = n as f64 - center;
        let sinc = if x == 0.0 {
            2.0 * FIR_CUTOFF
        } else {
            (2.0 * std::f64::consts::PI * FIR_CUTOFF * x).sin() / (std::f64::consts::PI * x)
        };
        // Blackman window
        let w = 0.42
            - 0.5 * (2.0 * std::f64::consts::PI * n as f64 / (FIR_TAPS - 1) as f64).cos()
            + 0.08 * (4.0 * std::f64::consts::PI * n as f64 / (FIR_TAPS - 1) as f64).cos();
        *c = sinc * w;
    }
    // Unit DC gain
    let sum: f64 = coeffs.iter().sum();
    for c in coeffs.iter_mut() {
        *c /= sum;
    }
    coeffs
});

/// Upsample 16 kHz mono PCM to 24 kHz.
///
/// Output length is `len * 3 / 2`. Dither is triangular (sum of two
/// uniforms) scaled by half an LSB; results clamp to the int16 range.
pub fn upsample_16k_to_24k(input: &[i16]) -> Vec<i16> {
    if input.is_empty() {
        return Vec::new();
    }

    let out_len = input.len() * 3 / 2;
    let mut rng = rand::thread_rng();
    let mut out = Vec::with_capacity(out_len);

    for n in 0..out_len {
        // Source position at the exact 2/3 ratio.
        let pos = n as f64 * 2.0 / 3.0;
        let i = pos.floor() as usize;
        let frac = pos - i as f64;
        let a = input[i.min(input.len() - 1)] as f64;
        let b = input[(i + 1).min(input.len() - 1)] as f64;
        let sample = a + (b - a) * frac;

        let dither = (rng.gen::<f64>() - rng.gen::<f64>()) * 0.5;
        let dithered = (sample + dither).round();
        out.push(dithered.clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }

    out
}

/// Downsample 24 kHz mono PCM to 16 kHz.
///
/// Output length is `len * 2 / 3`.
pub fn downsample_24k_to_16k(input: &[i16]) -> Vec<i16> {
    if input.is_empty() {
        return Vec::new();
    }

    let filtered = fir_lowpass(input);
    let out_len = input.len() * 2 / 3;
    let mut out = Vec::with_capacity(out_len);

    for m in 0..out_len {
        // Every other output sample lands between two filtered inputs.
        let pos = m * 3;
        let sample = if pos % 2 == 0 {
            filtered[pos / 2]
        } else {
            let lo = filtered[pos / 2];
            let hi = filtered.get(pos / 2 + 1).copied().unwrap_or(0.0);
            (lo + hi) / 2.0
        };
        out.push(sample.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }

    out
}

fn fir_lowpass(input: &[i16]) -> Vec<f64> {
    let coeffs = &*FIR_COEFFS;
    let half = FIR_TAPS / 2;
    let mut out = Vec::with_capacity(input.len());

    for n in 0..input.len() {
        let mut acc = 0.0f64;
        for (k, c) in coeffs.iter().enumerate() {
            // Centered kernel; out-of-range taps read zero padding.
            let idx = n as isize + k as isize - half as isize;
            if idx >= 0 && (idx as usize) < input.len() {
                acc += c * input[idx as usize] as f64;
            }
        }
        out.push(acc);
    }

    out
}
