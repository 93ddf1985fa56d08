//! PCM16/16 kHz audio frame handling.
//!
//! The wire unit is a 20 ms frame: 320 signed 16-bit little-endian mono
//! samples, 640 bytes, base64-encoded inside `audio_chunk` events.

use crate::error::{GatewayError, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::time::Instant;

/// Sample rate of all gateway audio.
pub const SAMPLE_RATE: u32 = 16_000;
/// Frame duration in milliseconds.
pub const FRAME_MS: u32 = 20;
/// Samples per frame (320 at 16 kHz / 20 ms).
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as usize / 1000) * FRAME_MS as usize;
/// Bytes per frame (two bytes per sample).
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// Inter-frame gap above which jitter is logged, in milliseconds.
pub const JITTER_WARN_MS: f64 = 200.0;

/// Decode and validate one base64 audio frame.
///
/// # Errors
///
/// Returns an error if the payload is not valid base64 or does not decode
/// to exactly one 20 ms frame.
pub fn decode_frame(audio_b64: &str) -> Result<Vec<u8>> {
    let bytes = BASE64
        .decode(audio_b64)
        .map_err(|e| GatewayError::Audio(format!("invalid base64 audio: {e}")))?;
    if bytes.len() != FRAME_BYTES {
        return Err(GatewayError::Audio(format!(
            "frame must be {FRAME_BYTES} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Encode one PCM16 frame for the wire.
pub fn encode_frame(pcm: &[u8]) -> String {
    BASE64.encode(pcm)
}

/// RMS energy of a PCM16 byte buffer, on the i16 sample scale.
pub fn rms_energy(pcm: &[u8]) -> f32 {
    let samples: Vec<i16> = pcm
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|&s| (f32::from(s)).powi(2)).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Split a PCM16 buffer into exact 20 ms frames, zero-padding the tail.
pub fn frames_from_pcm(pcm: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::with_capacity(pcm.len() / FRAME_BYTES + 1);
    for chunk in pcm.chunks(FRAME_BYTES) {
        if chunk.len() == FRAME_BYTES {
            frames.push(chunk.to_vec());
        } else if !chunk.is_empty() {
            let mut padded = chunk.to_vec();
            padded.resize(FRAME_BYTES, 0);
            frames.push(padded);
        }
    }
    frames
}

/// Tracks inter-frame arrival gaps on the inbound audio path.
#[derive(Debug, Default)]
pub struct JitterTracker {
    last_arrival: Option<Instant>,
}

impl JitterTracker {
    /// Create a fresh tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame arrival and return the gap to the previous one, in ms.
    pub fn observe(&mut self) -> Option<f64> {
        let now = Instant::now();
        let gap = self
            .last_arrival
            .map(|prev| now.duration_since(prev).as_secs_f64() * 1000.0);
        self.last_arrival = Some(now);
        gap
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn frame_constants_line_up() {
        assert_eq!(FRAME_SAMPLES, 320);
        assert_eq!(FRAME_BYTES, 640);
    }

    #[test]
    fn decode_round_trips_a_valid_frame() {
        let pcm = vec![0u8; FRAME_BYTES];
        let encoded = encode_frame(&pcm);
        let decoded = decode_frame(&encoded).unwrap();
        assert_eq!(decoded, pcm);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let short = BASE64.encode(vec![0u8; 100]);
        assert!(decode_frame(&short).is_err());
    }

    #[test]
    fn decode_rejects_bad_base64() {
        assert!(decode_frame("not base64!!!").is_err());
    }

    #[test]
    fn rms_of_silence_is_zero() {
        assert!(rms_energy(&vec![0u8; FRAME_BYTES]) < 1.0);
    }

    #[test]
    fn rms_of_square_wave_is_high() {
        let mut pcm = Vec::with_capacity(FRAME_BYTES);
        for i in 0..FRAME_SAMPLES {
            let sample: i16 = if i % 2 == 0 { 1000 } else { -1000 };
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        assert!(rms_energy(&pcm) > 900.0);
    }

    #[test]
    fn frames_pad_the_tail() {
        let pcm = vec![1u8; FRAME_BYTES + 10];
        let frames = frames_from_pcm(&pcm);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].len(), FRAME_BYTES);
        assert_eq!(frames[1][10], 0);
    }

    #[test]
    fn jitter_tracker_reports_gap_after_first_frame() {
        let mut tracker = JitterTracker::new();
        assert!(tracker.observe().is_none());
        assert!(tracker.observe().is_some());
    }
}
