//! Playback side of a call
//!
//! Datagrams arrive on the network context and go straight into the
//! [`PacketQueue`]. Once per period the audio callback calls
//! [`Receiver::pull_frame`], which takes at most one packet and decodes it,
//! or conceals the gap when nothing has arrived.
//!
//! The [`Receiver`] itself (decoder included) lives in the audio callback;
//! everything the network context and the control code touch sits behind a
//! [`ReceiverHandle`].

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

use crate::audio::buffer::{PacketQueue, PushOutcome, QueueConfig, QueueStats};
use crate::codec::{FrameDecoder, OpusDecoder};
use crate::config::BridgeConfig;
use crate::dump::{Direction, PacketTap};
use crate::error::{CodecError, ProtocolError, Result};
use crate::network::stream::{DatagramStream, ShutdownMode, SubscriptionId};
use crate::protocol::{EncodedPacket, HeaderFormat, PacketHeader};

/// Where the samples of a pulled frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    /// Decoded from a received packet
    Decoded,
    /// Synthesized by loss concealment, nothing was queued
    Concealed,
    /// Receiver disabled, frame zeroed
    Silence,
}

/// Stream currently feeding the queue
struct Bound {
    stream: Arc<dyn DatagramStream>,
    subscription: SubscriptionId,
}

/// Playout counters
#[derive(Default)]
struct Counters {
    decoded: AtomicU64,
    concealed: AtomicU64,
    silenced: AtomicU64,
    faults: AtomicU64,
    /// Read and thrown away while disabled
    discarded: AtomicU64,
    sequence_gaps: AtomicU64,
}

/// State shared between the audio callback, the network context and control
pub struct ReceiveSide {
    queue: PacketQueue,
    enabled: AtomicBool,
    faulted: AtomicBool,
    /// Bumped on every bind, unbind and shutdown; stale callbacks compare against it
    generation: AtomicU64,
    binding: Mutex<Option<Bound>>,
    tap: Mutex<Option<PacketTap>>,
    counters: Counters,
}

impl ReceiveSide {
    fn new(queue: &QueueConfig) -> Self {
        Self {
            queue: PacketQueue::new(queue),
            enabled: AtomicBool::new(true),
            faulted: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            binding: Mutex::new(None),
            tap: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    /// One datagram is ready on `stream`
    fn on_ready_read(&self, stream: &dyn DatagramStream, generation: u64) {
        if self.generation.load(Ordering::Acquire) != generation {
            trace!("Ignoring datagram notification from an unbound stream");
            return;
        }

        let Some(datagram) = stream.read_datagram() else {
            return;
        };

        // `bind` and `set_enabled` clear the queue under this lock, so a
        // rebind or disable during the read cannot leave this datagram queued
        let outcome = {
            let _binding = self.binding.lock();
            if self.generation.load(Ordering::Acquire) != generation {
                trace!("Dropping datagram read across a rebind");
                return;
            }
            if !self.enabled.load(Ordering::Acquire) {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                return;
            }
            self.queue.push(EncodedPacket::new(datagram.clone()))
        };

        if let Some(tap) = self.tap.lock().as_ref() {
            tap.record(Direction::Remote, &datagram);
        }

        match outcome {
            PushOutcome::Queued => {}
            PushOutcome::Evicted(old) => trace!("Jitter queue full, evicted {} byte packet", old.len()),
            PushOutcome::Rejected(new) => trace!("Jitter queue full, rejected {} byte packet", new.len()),
        }
    }

    fn bind(self: &Arc<Self>, stream: Arc<dyn DatagramStream>) {
        let generation = {
            let mut binding = self.binding.lock();
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

            if let Some(previous) = binding.take() {
                previous.stream.disconnect(previous.subscription);
                debug!("Receiver detached from previous stream");
            }

            // Audio from an earlier stream must not leak into this one
            self.queue.clear();
            self.faulted.store(false, Ordering::Release);
            generation
        };

        // Registering may run the callback right away for datagrams already
        // waiting, and the callback takes the binding lock
        let side = Arc::downgrade(self);
        let weak_stream: Weak<dyn DatagramStream> = Arc::downgrade(&stream);
        let subscription = stream.on_ready_read_datagram(Arc::new(move || {
            if let (Some(side), Some(stream)) = (side.upgrade(), weak_stream.upgrade()) {
                side.on_ready_read(stream.as_ref(), generation);
            }
        }));

        let mut binding = self.binding.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            // Rebound or unbound meanwhile
            stream.disconnect(subscription);
            return;
        }
        *binding = Some(Bound { stream, subscription });
        info!("Receiver bound to stream");
    }

    fn unbind(&self) -> Option<Arc<dyn DatagramStream>> {
        let mut binding = self.binding.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        binding.take().map(|bound| {
            bound.stream.disconnect(bound.subscription);
            bound.stream
        })
    }

    /// Disabling drops whatever is queued, so re-enabling resumes with live audio
    fn set_enabled(&self, enabled: bool) {
        let _binding = self.binding.lock();
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            let dropped = self.queue.clear();
            if dropped > 0 {
                debug!("Receiver disabled, {} queued packets dropped", dropped);
            }
        }
    }

    /// Stop reading from the bound stream. Later calls do nothing.
    fn shutdown(&self) {
        if let Some(stream) = self.unbind() {
            stream.shutdown(ShutdownMode::Read);
            info!("Receiver shut down the read direction");
        }
    }

    /// Protocol fault: drop the connection's read side and everything queued
    fn abort(&self) {
        self.faulted.store(true, Ordering::Release);
        self.shutdown();
        let discarded = self.queue.clear();
        debug!("Read direction aborted, {} queued packets discarded", discarded);
    }
}

impl Drop for ReceiveSide {
    fn drop(&mut self) {
        if let Some(bound) = self.binding.get_mut().take() {
            bound.stream.disconnect(bound.subscription);
        }
    }
}

/// Snapshot of receiver counters
#[derive(Debug, Clone)]
pub struct ReceiverStats {
    pub decoded: u64,
    pub concealed: u64,
    pub silenced: u64,
    pub faults: u64,
    pub discarded: u64,
    pub sequence_gaps: u64,
    pub queue: QueueStats,
}

/// Control handle for a [`Receiver`], usable from any thread
#[derive(Clone)]
pub struct ReceiverHandle {
    side: Arc<ReceiveSide>,
}

impl ReceiverHandle {
    /// Feed the queue from `stream`, detaching from any previous stream
    pub fn bind(&self, stream: Arc<dyn DatagramStream>) {
        self.side.bind(stream);
    }

    /// Detach from the bound stream without shutting it down
    pub fn unbind(&self) {
        if self.side.unbind().is_some() {
            debug!("Receiver unbound");
        }
    }

    /// Shut down the read direction of the bound stream. Idempotent.
    pub fn shutdown(&self) {
        self.side.shutdown();
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.side.set_enabled(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.side.enabled.load(Ordering::Acquire)
    }

    pub fn is_bound(&self) -> bool {
        self.side.binding.lock().is_some()
    }

    /// Whether a protocol fault aborted the read direction since the last bind
    pub fn is_faulted(&self) -> bool {
        self.side.faulted.load(Ordering::Acquire)
    }

    /// Record received packets, `None` to stop
    pub fn set_tap(&self, tap: Option<PacketTap>) {
        *self.side.tap.lock() = tap;
    }

    pub fn queue_len(&self) -> usize {
        self.side.queue.len()
    }

    pub fn stats(&self) -> ReceiverStats {
        let counters = &self.side.counters;
        ReceiverStats {
            decoded: counters.decoded.load(Ordering::Relaxed),
            concealed: counters.concealed.load(Ordering::Relaxed),
            silenced: counters.silenced.load(Ordering::Relaxed),
            faults: counters.faults.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
            sequence_gaps: counters.sequence_gaps.load(Ordering::Relaxed),
            queue: self.side.queue.stats(),
        }
    }
}

/// Decode path, owned by the audio callback
pub struct Receiver<D: FrameDecoder = OpusDecoder> {
    decoder: D,
    header: HeaderFormat,
    last_sequence: Option<u32>,
    /// Bind generation `last_sequence` belongs to
    sequence_generation: u64,
    side: Arc<ReceiveSide>,
}

impl Receiver<OpusDecoder> {
    /// Opus receiver for the configured rate and queue
    pub fn opus(config: &BridgeConfig) -> Result<Self> {
        let decoder = OpusDecoder::new(config.opus.sample_rate, config.opus.channels, config.opus.frame_size)?
            .with_fec(config.opus.fec);
        Ok(Self::new(decoder, &config.jitter, config.network.header))
    }
}

impl<D: FrameDecoder> Receiver<D> {
    pub fn new(decoder: D, queue: &QueueConfig, header: HeaderFormat) -> Self {
        Self {
            decoder,
            header,
            last_sequence: None,
            sequence_generation: 0,
            side: Arc::new(ReceiveSide::new(queue)),
        }
    }

    pub fn handle(&self) -> ReceiverHandle {
        ReceiverHandle { side: self.side.clone() }
    }

    pub fn frame_size(&self) -> usize {
        self.decoder.frame_size()
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Fill `out` with the next frame of playback.
    ///
    /// `out` is always completely written, also on error. A packet that
    /// cannot be parsed or decoded aborts the read direction of the bound
    /// stream; later calls conceal until a new stream is bound.
    pub fn pull_frame(&mut self, out: &mut [f32]) -> Result<FrameSource> {
        let expected = self.decoder.frame_size();
        if out.len() != expected {
            out.fill(0.0);
            return Err(CodecError::InvalidFrameSize { expected, actual: out.len() }.into());
        }

        let counters = &self.side.counters;

        if !self.side.enabled.load(Ordering::Acquire) {
            out.fill(0.0);
            counters.silenced.fetch_add(1, Ordering::Relaxed);
            return Ok(FrameSource::Silence);
        }

        // The queue lock is released here, before any codec work
        let packet = self.side.queue.pop_or_none();

        match packet {
            Some(packet) => match self.decode_packet(&packet, out) {
                Ok(()) => {
                    self.side.counters.decoded.fetch_add(1, Ordering::Relaxed);
                    Ok(FrameSource::Decoded)
                }
                Err(e) => {
                    out.fill(0.0);
                    self.side.counters.faults.fetch_add(1, Ordering::Relaxed);
                    warn!("Dropping connection after bad packet: {}", e);
                    self.side.abort();
                    Err(e.into())
                }
            },
            None => {
                if let Err(e) = self.decoder.decode(None, out) {
                    out.fill(0.0);
                    return Err(e.into());
                }
                self.side.counters.concealed.fetch_add(1, Ordering::Relaxed);
                Ok(FrameSource::Concealed)
            }
        }
    }

    fn decode_packet(&mut self, packet: &EncodedPacket, out: &mut [f32]) -> std::result::Result<(), ProtocolError> {
        let (header, payload) = self.header.split(packet.as_bytes())?;
        if payload.is_empty() {
            return Err(ProtocolError::EmptyPayload);
        }

        if let PacketHeader::Sequence(sequence) = header {
            self.track_sequence(sequence);
        }

        self.decoder
            .decode(Some(payload), out)
            .map_err(ProtocolError::Undecodable)?;
        Ok(())
    }

    fn track_sequence(&mut self, sequence: u32) {
        // A new stream starts its own numbering
        let generation = self.side.generation.load(Ordering::Acquire);
        if generation != self.sequence_generation {
            self.sequence_generation = generation;
            self.last_sequence = None;
        }

        if let Some(last) = self.last_sequence {
            let expected = last.wrapping_add(1);
            if sequence != expected {
                debug!("Non-consecutive sequence numbers {} -> {}", last, sequence);
                self.side.counters.sequence_gaps.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.last_sequence = Some(sequence);
    }
}
