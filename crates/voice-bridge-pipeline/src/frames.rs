//! Outbound frame assembly.
//!
//! Synthesis output and realtime audio deltas arrive as 24 kHz PCM of
//! arbitrary length; the gateway takes exactly 640-byte 16 kHz frames.
//! [`FrameAssembler`] carries the residual samples between pushes so frame
//! boundaries survive delta boundaries, and [`FrameSink`] is the seam the
//! server implements to put frames on the wire.

use async_trait::async_trait;

use voice_bridge_core::{pcm_bytes_to_samples, samples_to_pcm_bytes, Result, FRAME_SAMPLES_16K};

use crate::resample::downsample_24k_to_16k;

/// Where paced audio goes. The server implementation assigns sequence
/// numbers and speaks the wire protocol.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Send one 640-byte 16 kHz frame.
    async fn send_frame(&self, frame: Vec<u8>) -> Result<()>;

    /// Tell the gateway to drop whatever it has buffered (barge-in).
    async fn send_flush(&self) -> Result<()>;
}

/// Accumulates 24 kHz PCM and emits gateway frames.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    /// 16 kHz samples not yet filling a whole frame.
    residual: Vec<i16>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push raw 24 kHz PCM bytes; returns every complete frame now ready.
    pub fn push_pcm24(&mut self, pcm24: &[u8]) -> Vec<Vec<u8>> {
        let samples24 = pcm_bytes_to_samples(pcm24);
        let samples16 = downsample_24k_to_16k(&samples24);
        self.residual.extend_from_slice(&samples16);

        let mut frames = Vec::new();
        while self.residual.len() >= FRAME_SAMPLES_16K {
            let frame: Vec<i16> = self.residual.drain(..FRAME_SAMPLES_16K).collect();
            frames.push(samples_to_pcm_bytes(&frame));
        }
        frames
    }

    /// Emit the residual as a final zero-padded frame, if any.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.residual.is_empty() {
            return None;
        }
        self.residual.resize(FRAME_SAMPLES_16K, 0);
        let frame: Vec<i16> = self.residual.drain(..).collect();
        Some(samples_to_pcm_bytes(&frame))
    }

    /// Drop any buffered residual (barge-in).
    pub fn clear(&mut self) {
        self.residual.clear();
    }
}

/// Convert a complete 24 kHz synthesis buffer into gateway frames,
/// padding the tail to a full frame.
pub fn frames_from_pcm24(pcm24: &[u8]) -> Vec<Vec<u8>> {
    let mut assembler = FrameAssembler::new();
    let mut frames = assembler.push_pcm24(pcm24);
    if let Some(tail) = assembler.flush() {
        frames.push(tail);
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use voice_bridge_core::{FRAME_BYTES_16K, FRAME_BYTES_24K};

    #[test]
    fn one_cloud_frame_becomes_one_gateway_frame() {
        let frames = frames_from_pcm24(&vec![0u8; FRAME_BYTES_24K]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), FRAME_BYTES_16K);
    }

    #[test]
    fn tail_is_padded_to_full_frame() {
        // One and a half cloud frames of audio.
        let frames = frames_from_pcm24(&vec![0u8; FRAME_BYTES_24K + FRAME_BYTES_24K / 2]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == FRAME_BYTES_16K));
    }

    #[test]
    fn empty_buffer_produces_no_frames() {
        assert!(frames_from_pcm24(&[]).is_empty());
    }

    #[test]
    fn residual_survives_across_pushes() {
        let mut assembler = FrameAssembler::new();
        // Half a cloud frame per push; every second push completes a frame.
        let half = vec![0u8; FRAME_BYTES_24K / 2];
        let mut total = 0;
        for _ in 0..4 {
            total += assembler.push_pcm24(&half).len();
        }
        assert_eq!(total, 2);
        assert!(assembler.flush().is_none());
    }

    #[test]
    fn clear_drops_residual() {
        let mut assembler = FrameAssembler::new();
        assembler.push_pcm24(&vec![0u8; 100]);
        assembler.clear();
        assert!(assembler.flush().is_none());
    }
}
