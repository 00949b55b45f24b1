//! Opus encoder wrapper
//!
//! Voice-optimized VBR encoding of fixed 10 ms frames, with silence
//! suppression: frames below the configured level are still run through the
//! encoder (its prediction state stays continuous) but their output is
//! withheld, except for a periodic keep-alive frame.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::codec::{frame_level_dbfs, FrameEncoder};
use crate::config::{OpusApplication, OpusConfig};
use crate::error::CodecError;

/// Largest payload a single Opus frame can produce
const MAX_PAYLOAD: usize = 4000;

/// Opus encoder wrapper with voice settings
pub struct OpusEncoder {
    encoder: Encoder,
    config: OpusConfig,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    /// Frames withheld since the last transmitted one
    frames_suppressed_run: u32,
    frames_encoded: u64,
    frames_suppressed: u64,
    bytes_produced: u64,
}

impl OpusEncoder {
    /// Create a new Opus encoder with the specified configuration
    pub fn new(config: OpusConfig) -> Result<Self, CodecError> {
        let channels = match config.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => return Err(CodecError::EncoderInit(
                format!("Unsupported channel count: {}", config.channels)
            )),
        };

        let application = match config.application {
            OpusApplication::Voip => Application::Voip,
            OpusApplication::Audio => Application::Audio,
            OpusApplication::LowDelay => Application::LowDelay,
        };

        let mut encoder = Encoder::new(config.sample_rate, channels, application)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        Self::configure_encoder(&mut encoder, &config)?;

        Ok(Self {
            encoder,
            config,
            encode_buffer: vec![0u8; MAX_PAYLOAD],
            frames_suppressed_run: 0,
            frames_encoded: 0,
            frames_suppressed: 0,
            bytes_produced: 0,
        })
    }

    /// Create encoder with the voice preset (10 ms frames)
    pub fn voice(sample_rate: u32, channels: u16) -> Result<Self, CodecError> {
        let mut config = OpusConfig::voice();
        config.sample_rate = sample_rate;
        config.channels = channels;
        config.frame_size = OpusConfig::frame_size_from_ms(sample_rate, 10.0);
        Self::new(config)
    }

    fn configure_encoder(encoder: &mut Encoder, config: &OpusConfig) -> Result<(), CodecError> {
        let bitrate = match config.bitrate {
            Some(bits) => opus::Bitrate::Bits(bits as i32),
            None => opus::Bitrate::Auto,
        };
        encoder.set_bitrate(bitrate)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder.set_vbr(config.vbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        if config.vbr && config.cvbr {
            encoder.set_vbr_constraint(true)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set CVBR: {}", e)))?;
        }

        encoder.set_inband_fec(config.fec)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

        if config.fec {
            encoder.set_packet_loss_perc(config.packet_loss_perc as i32)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set packet loss: {}", e)))?;
        }

        Ok(())
    }

    /// Whether this frame should be withheld as silence
    fn suppress(&mut self, samples: &[f32]) -> bool {
        if !self.config.dtx || frame_level_dbfs(samples) >= self.config.dtx_threshold_dbfs {
            self.frames_suppressed_run = 0;
            return false;
        }

        if self.frames_suppressed_run + 1 >= self.config.dtx_keepalive_frames.max(1) {
            self.frames_suppressed_run = 0;
            false
        } else {
            self.frames_suppressed_run += 1;
            true
        }
    }

    /// Update bitrate dynamically, `None` lets the codec choose
    pub fn set_bitrate(&mut self, bitrate: Option<u32>) -> Result<(), CodecError> {
        let value = match bitrate {
            Some(bits) => opus::Bitrate::Bits(bits as i32),
            None => opus::Bitrate::Auto,
        };
        self.encoder.set_bitrate(value)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
        self.config.bitrate = bitrate;
        Ok(())
    }

    pub fn config(&self) -> &OpusConfig {
        &self.config
    }

    /// Total samples per frame (including all channels)
    pub fn samples_per_frame(&self) -> usize {
        self.config.frame_size * self.config.channels as usize
    }

    pub fn frame_duration_ms(&self) -> f32 {
        self.config.frame_duration_ms()
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            frames_suppressed: self.frames_suppressed,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

impl FrameEncoder for OpusEncoder {
    fn frame_size(&self) -> usize {
        self.samples_per_frame()
    }

    fn encode(&mut self, samples: &[f32]) -> Result<Bytes, CodecError> {
        let expected = self.samples_per_frame();
        if samples.len() != expected {
            return Err(CodecError::InvalidFrameSize { expected, actual: samples.len() });
        }

        let size = self.encoder
            .encode_float(samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        if self.suppress(samples) {
            self.frames_suppressed += 1;
            return Ok(Bytes::new());
        }

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub frames_suppressed: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 / 48000.0 * 440.0 * 2.0 * std::f32::consts::PI).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_encoder_creation() {
        let encoder = OpusEncoder::voice(48000, 1).unwrap();
        assert_eq!(encoder.config().sample_rate, 48000);
        assert_eq!(encoder.frame_size(), 480);
        assert!((encoder.frame_duration_ms() - 10.0).abs() < 0.01);
    }

    #[test]
    fn test_encoding_voice() {
        let mut encoder = OpusEncoder::voice(48000, 1).unwrap();
        let encoded = encoder.encode(&tone(480)).unwrap();

        assert!(!encoded.is_empty());
        assert!(encoded.len() < 480 * 4);
        assert_eq!(encoder.stats().frames_encoded, 1);
    }

    #[test]
    fn test_rejects_wrong_frame_size() {
        let mut encoder = OpusEncoder::voice(48000, 1).unwrap();
        let err = encoder.encode(&[0.0; 960]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFrameSize { expected: 480, actual: 960 }));
    }

    #[test]
    fn test_silence_suppressed_with_keepalive() {
        let mut config = OpusConfig::voice();
        config.dtx_keepalive_frames = 4;
        let mut encoder = OpusEncoder::new(config).unwrap();
        let silence = vec![0.0f32; 480];

        let sent: Vec<bool> = (0..8)
            .map(|_| !encoder.encode(&silence).unwrap().is_empty())
            .collect();

        assert_eq!(sent, vec![false, false, false, true, false, false, false, true]);
        assert_eq!(encoder.stats().frames_suppressed, 6);

        // Speech resets the run
        assert!(!encoder.encode(&tone(480)).unwrap().is_empty());
    }

    #[test]
    fn test_dtx_disabled_sends_silence() {
        let mut config = OpusConfig::voice();
        config.dtx = false;
        let mut encoder = OpusEncoder::new(config).unwrap();
        assert!(!encoder.encode(&[0.0; 480]).unwrap().is_empty());
    }
}
