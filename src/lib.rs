//! # voicebridge
//!
//! Low-latency duplex voice between an audio device and a datagram stream.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │              AUDIO CALLBACK (audio::hardware, every 10 ms)            │
//! │                                                                      │
//! │  captured frame ──► Sender::push_frame ──► Opus encode (VBR, DTX)     │
//! │                                               │                      │
//! │                                               ▼                      │
//! │                               Strand::post(write_datagram) ──────────┼──┐
//! │                                                                      │  │
//! │  playback frame ◄── Receiver::pull_frame ◄── Opus decode / conceal   │  │
//! │                                               ▲                      │  │
//! └───────────────────────────────────────────────┼──────────────────────┘  │
//!                                                 │ pop_or_none             │
//!                                       ┌─────────┴─────────┐               │
//!                                       │    PacketQueue    │               │
//!                                       │  (audio::buffer)  │               │
//!                                       └─────────▲─────────┘               │
//!                                                 │ push                    │
//! ┌───────────────────────────────────────────────┼──────────────────────┐  │
//! │             NETWORK CONTEXT (tokio, network::*)                      │  │
//! │                                                                      │  │
//! │  DatagramStream ── ready-read ──► read_datagram ──┘                  │  │
//! │  (UdpStream / MemoryStream)                                          │  │
//! │        ▲                                                             │  │
//! │        └──────────── write_datagram(Unreliable) ◄────────────────────┼──┘
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod dump;
pub mod error;
pub mod network;
pub mod protocol;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Voice is mono
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// One period, one codec frame, one datagram
    pub const DEFAULT_FRAME_SIZE_MS: f32 = 10.0;

    /// Default UDP port for calls
    pub const DEFAULT_UDP_PORT: u16 = 9660;

    /// Jitter queue depth in packets (500 ms of audio)
    pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

    /// Frames quieter than this are withheld when DTX is on
    pub const DEFAULT_DTX_THRESHOLD_DBFS: f32 = -50.0;

    /// During silence, one frame is still sent every this many periods
    pub const DTX_KEEPALIVE_FRAMES: u32 = 40;

    /// Rates Opus encodes natively
    pub const OPUS_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

    /// Maximum packet size for UDP
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers

    /// Captured frames buffered between the input and output device callbacks
    pub const CAPTURE_RING_CAPACITY: usize = 8;
}
