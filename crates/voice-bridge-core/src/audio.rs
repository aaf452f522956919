//! PCM frame constants and conversions.
//!
//! The gateway side of the bridge speaks 20 ms frames of 16-bit
//! little-endian mono PCM at 16 kHz; the cloud side speaks the same format
//! at 24 kHz. Everything that touches raw audio goes through the helpers
//! here so the byte/sample math lives in one place.

/// Frame duration on both sides of the bridge.
pub const FRAME_DURATION_MS: u64 = 20;

/// Gateway-side sample rate.
pub const SAMPLE_RATE_16K: u32 = 16_000;

/// Cloud-side sample rate.
pub const SAMPLE_RATE_24K: u32 = 24_000;

/// Samples per 20 ms frame at 16 kHz.
pub const FRAME_SAMPLES_16K: usize = (SAMPLE_RATE_16K as usize * FRAME_DURATION_MS as usize) / 1000;

/// Samples per 20 ms frame at 24 kHz.
pub const FRAME_SAMPLES_24K: usize = (SAMPLE_RATE_24K as usize * FRAME_DURATION_MS as usize) / 1000;

/// Bytes per 20 ms frame at 16 kHz (640).
pub const FRAME_BYTES_16K: usize = FRAME_SAMPLES_16K * 2;

/// Bytes per 20 ms frame at 24 kHz (960).
pub const FRAME_BYTES_24K: usize = FRAME_SAMPLES_24K * 2;

/// Decode 16-bit little-endian PCM bytes into samples.
///
/// A trailing odd byte is ignored rather than rejected; gateways
/// occasionally truncate the last frame of a call.
pub fn pcm_bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Encode samples as 16-bit little-endian PCM bytes.
pub fn samples_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// One second of silence at 24 kHz.
///
/// Substituted for a chunk whose synthesis failed so the turn completes
/// instead of stalling the ordered queue.
pub fn comfort_tone_24k() -> Vec<u8> {
    vec![0u8; SAMPLE_RATE_24K as usize * 2]
}
