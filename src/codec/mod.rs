//! Codec contract and its Opus implementation
//!
//! The bridge only needs two operations from a codec: turn one fixed-size
//! PCM frame into a variable-length payload, and turn a payload (or nothing,
//! for loss concealment) back into one full frame.

pub mod decoder;
pub mod encoder;

pub use decoder::OpusDecoder;
pub use encoder::OpusEncoder;

use bytes::Bytes;

use crate::error::CodecError;

/// Capture-side codec handle
pub trait FrameEncoder: Send {
    /// Samples per frame (all channels)
    fn frame_size(&self) -> usize;

    /// Encode exactly one frame. An empty payload means the frame was
    /// suppressed as silence and should not be transmitted.
    fn encode(&mut self, samples: &[f32]) -> Result<Bytes, CodecError>;
}

/// Playback-side codec handle
pub trait FrameDecoder: Send {
    /// Samples per frame (all channels)
    fn frame_size(&self) -> usize;

    /// Decode `payload` into `out`, or synthesize a concealment frame when
    /// `payload` is `None`. Returns the number of samples written.
    fn decode(&mut self, payload: Option<&[u8]>, out: &mut [f32]) -> Result<usize, CodecError>;
}

impl<T: FrameEncoder + ?Sized> FrameEncoder for Box<T> {
    fn frame_size(&self) -> usize {
        (**self).frame_size()
    }

    fn encode(&mut self, samples: &[f32]) -> Result<Bytes, CodecError> {
        (**self).encode(samples)
    }
}

impl<T: FrameDecoder + ?Sized> FrameDecoder for Box<T> {
    fn frame_size(&self) -> usize {
        (**self).frame_size()
    }

    fn decode(&mut self, payload: Option<&[u8]>, out: &mut [f32]) -> Result<usize, CodecError> {
        (**self).decode(payload, out)
    }
}

/// Level of a frame in dBFS, `-inf` for digital silence
pub fn frame_level_dbfs(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return f32::NEG_INFINITY;
    }
    let energy: f32 = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    10.0 * energy.log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_level() {
        assert_eq!(frame_level_dbfs(&[0.0; 480]), f32::NEG_INFINITY);
        assert!(frame_level_dbfs(&[1.0; 480]).abs() < 0.01);
        let half = frame_level_dbfs(&[0.5; 480]);
        assert!((half + 6.02).abs() < 0.05, "got {}", half);
    }
}
