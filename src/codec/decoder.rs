//! Opus decoder wrapper
//!
//! Provides Opus decoding with packet loss concealment and, optionally,
//! in-band FEC recovery of the frame lost before a packet.

use opus::{Channels, Decoder};
use tracing::debug;

use crate::codec::FrameDecoder;
use crate::error::CodecError;

/// Opus decoder wrapper
pub struct OpusDecoder {
    decoder: Decoder,
    sample_rate: u32,
    channels: u16,
    /// Samples per channel in one frame
    frame_size: usize,
    /// Use the in-band redundancy of the packet after a concealed frame
    fec: bool,
    /// Last call concealed, the next packet may carry the lost frame
    after_loss: bool,
    /// Target for recovered frames, never played
    scratch: Vec<f32>,
    frames_decoded: u64,
    /// Frames synthesized by concealment
    frames_concealed: u64,
    /// Lost frames rebuilt from FEC data
    frames_recovered: u64,
    samples_produced: u64,
}

impl OpusDecoder {
    /// Create a new Opus decoder
    pub fn new(sample_rate: u32, channels: u16, frame_size: usize) -> Result<Self, CodecError> {
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => return Err(CodecError::DecoderInit(
                format!("Unsupported channel count: {}", channels)
            )),
        };

        let decoder = Decoder::new(sample_rate, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            sample_rate,
            channels,
            frame_size,
            fec: false,
            after_loss: false,
            scratch: vec![0.0; frame_size * channels as usize],
            frames_decoded: 0,
            frames_concealed: 0,
            frames_recovered: 0,
            samples_produced: 0,
        })
    }

    /// Mono decoder for 10 ms frames
    pub fn voice(sample_rate: u32) -> Result<Self, CodecError> {
        Self::new(sample_rate, 1, sample_rate as usize / 100)
    }

    /// Enable FEC recovery; only useful when the peer encodes with in-band FEC
    pub fn with_fec(mut self, enabled: bool) -> Self {
        self.fec = enabled;
        self
    }

    /// Feed the decoder the lost frame rebuilt from `packet`'s redundancy, so
    /// it continues from recovered audio instead of its own extrapolation.
    /// The recovered samples arrive a period late and are discarded.
    fn recover(&mut self, packet: &[u8]) {
        match self.decoder.decode_float(packet, &mut self.scratch, true) {
            Ok(_) => self.frames_recovered += 1,
            Err(e) => debug!("FEC recovery failed: {}", e),
        }
    }

    /// Reset decoder state
    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.decoder.reset_state()
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;
        self.after_loss = false;
        Ok(())
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn stats(&self) -> DecoderStats {
        let total = self.frames_decoded + self.frames_concealed;
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_concealed: self.frames_concealed,
            frames_recovered: self.frames_recovered,
            samples_produced: self.samples_produced,
            loss_rate: if total > 0 {
                self.frames_concealed as f32 / total as f32
            } else {
                0.0
            },
        }
    }
}

impl FrameDecoder for OpusDecoder {
    fn frame_size(&self) -> usize {
        self.frame_size * self.channels as usize
    }

    fn decode(&mut self, payload: Option<&[u8]>, out: &mut [f32]) -> Result<usize, CodecError> {
        let expected = self.frame_size();
        if out.len() != expected {
            return Err(CodecError::InvalidFrameSize { expected, actual: out.len() });
        }

        if let Some(packet) = payload {
            if self.fec && self.after_loss {
                self.recover(packet);
            }
        }
        self.after_loss = payload.is_none();

        // An empty input makes libopus run its loss concealment
        let input = payload.unwrap_or(&[]);
        let per_channel = self.decoder
            .decode_float(input, out, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
        let written = per_channel * self.channels as usize;

        match payload {
            Some(_) => {
                if written != expected {
                    return Err(CodecError::ShortDecode { expected, actual: written });
                }
                self.frames_decoded += 1;
            }
            None => {
                out[written.min(expected)..].fill(0.0);
                self.frames_concealed += 1;
            }
        }

        self.samples_produced += written as u64;
        Ok(written)
    }
}

/// Decoder statistics
#[derive(Debug, Clone)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_concealed: u64,
    pub frames_recovered: u64,
    pub samples_produced: u64,
    pub loss_rate: f32,
}
