//! Bridge configuration
//!
//! Loaded from a TOML file; every section has defaults, so an empty file
//! (or no file at all) yields a working 48 kHz mono voice setup.
//!
//! ```toml
//! [audio]
//! output_device = "output:USB Headset"
//!
//! [jitter]
//! capacity = 30
//! overflow = "drop_newest"
//!
//! [network]
//! port = 9660
//! header = "sequence"
//! ```

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::audio::buffer::QueueConfig;
use crate::constants::*;
use crate::error::{Error, Result};
use crate::protocol::HeaderFormat;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Record every packet to this file for offline replay
    pub dump: Option<PathBuf>,
    pub audio: AudioConfig,
    pub opus: OpusConfig,
    pub jitter: QueueConfig,
    pub network: NetworkConfig,
}

/// Audio device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Input device id (`input:<name>`), default device when unset
    pub input_device: Option<String>,
    /// Output device id (`output:<name>`), default device when unset
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            input_device: None,
            output_device: None,
        }
    }
}

impl AudioConfig {
    /// Samples in one 10 ms period
    pub fn frame_size(&self) -> usize {
        self.sample_rate as usize / 100
    }
}

/// Opus application mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpusApplication {
    Voip,
    Audio,
    LowDelay,
}

/// Opus encoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel in one frame
    pub frame_size: usize,
    pub application: OpusApplication,
    /// Target bitrate in bits per second, `None` lets the codec choose
    pub bitrate: Option<u32>,
    pub vbr: bool,
    /// Constrained VBR
    pub cvbr: bool,
    /// In-band forward error correction
    pub fec: bool,
    pub packet_loss_perc: u8,
    /// Withhold frames below `dtx_threshold_dbfs`
    pub dtx: bool,
    pub dtx_threshold_dbfs: f32,
    /// Send one frame after this many withheld ones
    pub dtx_keepalive_frames: u32,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self::voice()
    }
}

impl OpusConfig {
    /// 48 kHz mono VoIP, automatic VBR bitrate, silence suppression
    pub fn voice() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            frame_size: Self::frame_size_from_ms(DEFAULT_SAMPLE_RATE, DEFAULT_FRAME_SIZE_MS),
            application: OpusApplication::Voip,
            bitrate: None,
            vbr: true,
            cvbr: false,
            fec: false,
            packet_loss_perc: 0,
            dtx: true,
            dtx_threshold_dbfs: DEFAULT_DTX_THRESHOLD_DBFS,
            dtx_keepalive_frames: DTX_KEEPALIVE_FRAMES,
        }
    }

    /// Samples per channel for a frame of `ms` milliseconds
    pub fn frame_size_from_ms(sample_rate: u32, ms: f32) -> usize {
        (sample_rate as f32 * ms / 1000.0) as usize
    }

    pub fn frame_duration_ms(&self) -> f32 {
        self.frame_size as f32 * 1000.0 / self.sample_rate as f32
    }
}

/// Transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub port: u16,
    /// Remote endpoint to call; listen for a caller when unset
    pub peer: Option<SocketAddr>,
    /// Must match on both ends
    pub header: HeaderFormat,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_UDP_PORT,
            peer: None,
            header: HeaderFormat::default(),
        }
    }
}

impl NetworkConfig {
    /// Local socket address to bind
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .or_else(|_| format!("[{}]:{}", self.bind_address, self.port).parse())
            .map_err(|e| Error::Config(format!("Invalid bind address {}: {}", self.bind_address, e)))
    }
}

impl BridgeConfig {
    /// Platform config file location
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("net", "voicebridge", "voicebridge")
            .map(|dirs| dirs.config_dir().join("voicebridge.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Load from `path`, falling back to defaults when the file is missing
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Reject settings the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        if !OPUS_SAMPLE_RATES.contains(&self.audio.sample_rate) {
            return Err(Error::Config(format!(
                "Sample rate {} is not supported by Opus",
                self.audio.sample_rate
            )));
        }
        if self.audio.channels != 1 || self.opus.channels != 1 {
            return Err(Error::Config("Voice bridge is mono only".to_string()));
        }
        if self.opus.sample_rate != self.audio.sample_rate {
            return Err(Error::Config(format!(
                "Codec rate {} differs from device rate {}",
                self.opus.sample_rate, self.audio.sample_rate
            )));
        }
        if self.opus.frame_size != self.audio.frame_size() {
            return Err(Error::Config(format!(
                "Codec frame of {} samples is not one 10 ms period ({} samples)",
                self.opus.frame_size,
                self.audio.frame_size()
            )));
        }
        if self.jitter.capacity == Some(0) {
            return Err(Error::Config("Jitter queue capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::OverflowPolicy;

    #[test]
    fn test_defaults_are_valid() {
        let config = BridgeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.audio.frame_size(), 480);
        assert_eq!(config.opus.frame_size, 480);
        assert_eq!(config.network.port, 9660);
    }

    #[test]
    fn test_parse_partial_file() {
        let config = BridgeConfig::from_toml(
            r#"
            [jitter]
            capacity = 30
            overflow = "drop_newest"

            [network]
            header = "sequence"
            peer = "192.168.1.67:9660"
            "#,
        )
        .unwrap();

        assert_eq!(config.jitter.capacity, Some(30));
        assert_eq!(config.jitter.overflow, OverflowPolicy::DropNewest);
        assert_eq!(config.network.header, HeaderFormat::Sequence);
        assert_eq!(config.network.peer, Some("192.168.1.67:9660".parse().unwrap()));
        assert_eq!(config.audio.sample_rate, 48000);
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(BridgeConfig::from_toml("[audio]\nsample_rate = 44100").is_err());
        assert!(BridgeConfig::from_toml("[audio]\nchannels = 2\n[opus]\nchannels = 2").is_err());
        assert!(BridgeConfig::from_toml("[opus]\nframe_size = 960").is_err());
        assert!(BridgeConfig::from_toml("[jitter]\ncapacity = 0").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir()
            .join(format!("voicebridge-config-{}", std::process::id()))
            .join("voicebridge.toml");

        let mut config = BridgeConfig::default();
        config.network.header = HeaderFormat::Timestamp;
        config.save(&path).unwrap();

        let loaded = BridgeConfig::load(&path).unwrap();
        assert_eq!(loaded.network.header, HeaderFormat::Timestamp);

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_bind_addr() {
        let mut network = NetworkConfig::default();
        assert_eq!(network.bind_addr().unwrap(), "0.0.0.0:9660".parse().unwrap());
        network.bind_address = "::".to_string();
        assert_eq!(network.bind_addr().unwrap(), "[::]:9660".parse().unwrap());
    }
}
