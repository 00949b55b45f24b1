//! Capture side of a call
//!
//! [`Sender::push_frame`] runs in the audio callback: it encodes one frame
//! and posts the datagram write onto the transport's [`Strand`]. The
//! callback never waits on the network.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::codec::{FrameEncoder, OpusEncoder};
use crate::config::BridgeConfig;
use crate::dump::{Direction, PacketTap};
use crate::error::{CodecError, NetworkError, Result};
use crate::network::strand::Strand;
use crate::network::stream::{DatagramStream, Reliability, ShutdownMode};
use crate::protocol::{EncodedPacket, HeaderFormat, HeaderStamper};

/// What happened to a pushed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Sender disabled, nothing encoded
    Disabled,
    /// Encoded but withheld as silence
    Elided,
    /// Encoded, but there is no stream to send it on
    Unbound,
    /// Write queued on the strand
    Posted,
}

#[derive(Default)]
struct Counters {
    posted: AtomicU64,
    elided: AtomicU64,
    unbound: AtomicU64,
    encode_faults: AtomicU64,
    /// Writes the transport refused when the strand ran them
    write_errors: AtomicU64,
    bytes_posted: AtomicU64,
}

/// State shared between the audio callback, the strand and control
pub struct SendSide {
    enabled: AtomicBool,
    binding: Mutex<Option<Arc<dyn DatagramStream>>>,
    strand: Strand,
    tap: Mutex<Option<PacketTap>>,
    counters: Counters,
}

impl SendSide {
    /// Runs on the strand
    fn write(&self, stream: &dyn DatagramStream, packet: EncodedPacket) {
        if let Some(tap) = self.tap.lock().as_ref() {
            tap.record(Direction::Local, packet.as_bytes());
        }

        let len = packet.len();
        match stream.write_datagram(packet.into_bytes(), Reliability::Unreliable) {
            Ok(()) => trace!("Wrote {} byte datagram", len),
            Err(NetworkError::WriteShutdown) => {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                trace!("Datagram dropped, stream closed for writing");
            }
            Err(e) => {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                debug!("Datagram write failed: {}", e);
            }
        }
    }

    /// Close the write direction once everything already posted is written
    fn shutdown(&self) {
        let Some(stream) = self.binding.lock().take() else {
            return;
        };

        let pending = stream.clone();
        if !self.strand.post(move || pending.shutdown(ShutdownMode::Write)) {
            stream.shutdown(ShutdownMode::Write);
        }
        info!("Sender shut down the write direction");
    }
}

/// Snapshot of sender counters
#[derive(Debug, Clone, Default)]
pub struct SenderStats {
    pub posted: u64,
    pub elided: u64,
    pub unbound: u64,
    pub encode_faults: u64,
    pub write_errors: u64,
    pub bytes_posted: u64,
}

/// Control handle for a [`Sender`], usable from any thread
#[derive(Clone)]
pub struct SenderHandle {
    side: Arc<SendSide>,
}

impl SenderHandle {
    /// Send on `stream` from now on, replacing any previous stream
    pub fn bind(&self, stream: Arc<dyn DatagramStream>) {
        if self.side.binding.lock().replace(stream).is_some() {
            debug!("Sender switched streams");
        }
        info!("Sender bound to stream");
    }

    /// Stop sending without shutting the stream down
    pub fn unbind(&self) {
        self.side.binding.lock().take();
    }

    /// Shut down the write direction of the bound stream. Idempotent.
    ///
    /// The shutdown is posted behind any datagrams still queued on the strand.
    pub fn shutdown(&self) {
        self.side.shutdown();
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.side.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.side.enabled.load(Ordering::Acquire)
    }

    pub fn is_bound(&self) -> bool {
        self.side.binding.lock().is_some()
    }

    /// Record sent packets, `None` to stop
    pub fn set_tap(&self, tap: Option<PacketTap>) {
        *self.side.tap.lock() = tap;
    }

    pub fn strand(&self) -> &Strand {
        &self.side.strand
    }

    pub fn stats(&self) -> SenderStats {
        let counters = &self.side.counters;
        SenderStats {
            posted: counters.posted.load(Ordering::Relaxed),
            elided: counters.elided.load(Ordering::Relaxed),
            unbound: counters.unbound.load(Ordering::Relaxed),
            encode_faults: counters.encode_faults.load(Ordering::Relaxed),
            write_errors: counters.write_errors.load(Ordering::Relaxed),
            bytes_posted: counters.bytes_posted.load(Ordering::Relaxed),
        }
    }
}

/// Encode path, owned by the audio callback
pub struct Sender<E: FrameEncoder = OpusEncoder> {
    encoder: E,
    stamper: HeaderStamper,
    side: Arc<SendSide>,
}

impl Sender<OpusEncoder> {
    /// Opus sender with the configured encoder settings
    pub fn opus(config: &BridgeConfig, strand: Strand) -> Result<Self> {
        let encoder = OpusEncoder::new(config.opus.clone())?;
        Ok(Self::new(encoder, config.network.header, strand))
    }
}

impl<E: FrameEncoder> Sender<E> {
    pub fn new(encoder: E, header: HeaderFormat, strand: Strand) -> Self {
        Self {
            encoder,
            stamper: HeaderStamper::new(header),
            side: Arc::new(SendSide {
                enabled: AtomicBool::new(true),
                binding: Mutex::new(None),
                strand,
                tap: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    pub fn handle(&self) -> SenderHandle {
        SenderHandle { side: self.side.clone() }
    }

    pub fn frame_size(&self) -> usize {
        self.encoder.frame_size()
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Encode one captured frame and post it for sending.
    ///
    /// A failed encode loses this frame only; the next call starts fresh.
    pub fn push_frame(&mut self, input: &[f32]) -> Result<Dispatch> {
        let expected = self.encoder.frame_size();
        if input.len() != expected {
            return Err(CodecError::InvalidFrameSize { expected, actual: input.len() }.into());
        }

        let counters = &self.side.counters;

        if !self.side.enabled.load(Ordering::Acquire) {
            return Ok(Dispatch::Disabled);
        }

        let payload = match self.encoder.encode(input) {
            Ok(payload) => payload,
            Err(e) => {
                counters.encode_faults.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping captured frame: {}", e);
                return Err(e.into());
            }
        };

        if payload.is_empty() {
            counters.elided.fetch_add(1, Ordering::Relaxed);
            return Ok(Dispatch::Elided);
        }

        let Some(stream) = self.side.binding.lock().clone() else {
            counters.unbound.fetch_add(1, Ordering::Relaxed);
            return Ok(Dispatch::Unbound);
        };

        let packet = self.stamper.stamp(&payload);
        let len = packet.len() as u64;

        let side = self.side.clone();
        if !self.side.strand.post(move || side.write(stream.as_ref(), packet)) {
            return Err(NetworkError::SendFailed("Transport context is gone".to_string()).into());
        }

        counters.posted.fetch_add(1, Ordering::Relaxed);
        counters.bytes_posted.fetch_add(len, Ordering::Relaxed);
        Ok(Dispatch::Posted)
    }
}
