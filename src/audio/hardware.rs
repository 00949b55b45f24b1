//! Hardware bridge
//!
//! Owns the audio device lifecycle and wires its period callback to the two
//! call directions. Every period runs the encode path with the captured
//! frame first, then the decode path with the playback frame.
//!
//! Device failures never take the process down: they are logged and leave
//! the bridge [`HardwareState::Disabled`], where connection and start
//! requests are ignored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audio::device::{AudioDevice, PeriodCallback, StreamParams};
use crate::codec::{FrameDecoder, FrameEncoder, OpusDecoder, OpusEncoder};
use crate::error::FaultKind;
use crate::network::binding::StreamBinder;
use crate::network::receiver::Receiver;
use crate::network::sender::Sender;
use crate::network::stream::DatagramStream;

/// Lifecycle state of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareState {
    /// No usable device; requests are no-ops
    Disabled,
    /// Device open, not running
    Stopped,
    Running,
}

/// Directions the period callback stopped driving after a frame size fault
#[derive(Debug, Default)]
pub struct HaltedDirections {
    capture: AtomicBool,
    playback: AtomicBool,
}

impl HaltedDirections {
    pub fn capture(&self) -> bool {
        self.capture.load(Ordering::Acquire)
    }

    pub fn playback(&self) -> bool {
        self.playback.load(Ordering::Acquire)
    }
}

/// Per-period work, owned by the device callback
pub struct DuplexPeriod<E: FrameEncoder = OpusEncoder, D: FrameDecoder = OpusDecoder> {
    sender: Sender<E>,
    receiver: Receiver<D>,
    halted: Arc<HaltedDirections>,
}

impl<E, D> DuplexPeriod<E, D>
where
    E: FrameEncoder + 'static,
    D: FrameDecoder + 'static,
{
    pub fn new(sender: Sender<E>, receiver: Receiver<D>) -> Self {
        Self {
            sender,
            receiver,
            halted: Arc::new(HaltedDirections::default()),
        }
    }

    pub fn halted(&self) -> Arc<HaltedDirections> {
        self.halted.clone()
    }

    /// Run one period: capture first, then playback.
    ///
    /// Faults stay within their direction. A buffer of the wrong length halts
    /// that direction for good, since the device period never changes.
    pub fn run(&mut self, input: Option<&[f32]>, output: Option<&mut [f32]>) {
        if let Some(input) = input {
            if !self.halted.capture() {
                if let Err(e) = self.sender.push_frame(input) {
                    if e.fault_kind() == FaultKind::FrameSize {
                        warn!("Capture halted: {}", e);
                        self.halted.capture.store(true, Ordering::Release);
                    }
                }
            }
        }

        if let Some(output) = output {
            if self.halted.playback() {
                output.fill(0.0);
            } else if let Err(e) = self.receiver.pull_frame(output) {
                if e.fault_kind() == FaultKind::FrameSize {
                    warn!("Playback halted: {}", e);
                    self.halted.playback.store(true, Ordering::Release);
                }
            }
        }
    }

    pub fn into_callback(mut self) -> PeriodCallback {
        Box::new(move |input: Option<&[f32]>, output: Option<&mut [f32]>| self.run(input, output))
    }
}

/// Audio device bridged to one call
pub struct AudioHardware<Dev: AudioDevice = Box<dyn AudioDevice>> {
    device: Dev,
    state: HardwareState,
    binder: StreamBinder,
    halted: Arc<HaltedDirections>,
}

impl<Dev: AudioDevice> AudioHardware<Dev> {
    /// Open `device` with the period callback driving `sender` and `receiver`.
    ///
    /// An open failure is logged and yields a disabled bridge.
    pub fn open<E, D>(mut device: Dev, params: &StreamParams, sender: Sender<E>, receiver: Receiver<D>) -> Self
    where
        E: FrameEncoder + 'static,
        D: FrameDecoder + 'static,
    {
        let period_samples = params.period_samples();
        if sender.frame_size() != period_samples || receiver.frame_size() != period_samples {
            warn!(
                "Codec frames (capture {}, playback {}) do not match the {} sample device period",
                sender.frame_size(),
                receiver.frame_size(),
                period_samples
            );
        }

        let binder = StreamBinder::new(receiver.handle(), sender.handle());
        let period = DuplexPeriod::new(sender, receiver);
        let halted = period.halted();

        let state = match device.open(params, period.into_callback()) {
            Ok(()) => {
                info!("Audio hardware ready");
                HardwareState::Stopped
            }
            Err(e) => {
                warn!("Audio hardware disabled, device open failed: {}", e);
                HardwareState::Disabled
            }
        };

        Self {
            device,
            state,
            binder,
            halted,
        }
    }

    pub fn state(&self) -> HardwareState {
        self.state
    }

    pub fn is_disabled(&self) -> bool {
        self.state == HardwareState::Disabled
    }

    /// A peer connected: bind its stream and start the device
    pub fn new_connection(&mut self, stream: Arc<dyn DatagramStream>) {
        if self.is_disabled() {
            debug!("Ignoring new connection, hardware disabled");
            return;
        }
        self.binder.bind(stream);
        self.start();
    }

    /// Bind `stream` without starting the device
    pub fn streaming(&mut self, stream: Arc<dyn DatagramStream>) {
        if self.is_disabled() {
            debug!("Ignoring stream, hardware disabled");
            return;
        }
        self.binder.bind(stream);
    }

    /// The outgoing stream is usable: start the device
    pub fn out_stream_ready(&mut self) {
        self.start();
    }

    pub fn start(&mut self) {
        if self.state != HardwareState::Stopped {
            return;
        }
        match self.device.start() {
            Ok(()) => {
                self.state = HardwareState::Running;
                info!("Audio hardware started");
            }
            Err(e) => {
                warn!("Audio hardware disabled, device start failed: {}", e);
                self.disable();
            }
        }
    }

    pub fn stop(&mut self) {
        if self.state != HardwareState::Running {
            return;
        }
        match self.device.stop() {
            Ok(()) => {
                self.state = HardwareState::Stopped;
                info!("Audio hardware stopped");
            }
            Err(e) => {
                warn!("Audio hardware disabled, device stop failed: {}", e);
                self.disable();
            }
        }
    }

    /// Stop the device, shut the stream down in both directions and close
    /// the device. Calling it again does nothing.
    pub fn shutdown(&mut self) {
        self.stop();
        self.binder.shutdown();
        if self.device.is_open() {
            self.device.close();
            info!("Audio hardware closed");
        }
        self.state = HardwareState::Disabled;
    }

    fn disable(&mut self) {
        self.device.close();
        self.state = HardwareState::Disabled;
    }

    /// Gate both directions
    pub fn set_enabled(&self, enabled: bool) {
        self.binder.receiver().set_enabled(enabled);
        self.binder.sender().set_enabled(enabled);
    }

    pub fn binder(&self) -> &StreamBinder {
        &self.binder
    }

    pub fn halted(&self) -> &HaltedDirections {
        &self.halted
    }

    pub fn device(&self) -> &Dev {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Dev {
        &mut self.device
    }
}

impl<Dev: AudioDevice> Drop for AudioHardware<Dev> {
    fn drop(&mut self) {
        if self.device.is_open() {
            self.device.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::QueueConfig;
    use crate::audio::device::ManualDevice;
    use crate::config::AudioConfig;
    use crate::error::CodecError;
    use crate::network::memory;
    use crate::network::strand::Strand;
    use crate::protocol::HeaderFormat;
    use bytes::Bytes;
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    struct LoggingCodec {
        frame: usize,
        log: Log,
    }

    impl FrameEncoder for LoggingCodec {
        fn frame_size(&self) -> usize {
            self.frame
        }

        fn encode(&mut self, _samples: &[f32]) -> Result<Bytes, CodecError> {
            self.log.lock().push("encode");
            Ok(Bytes::from_static(&[1]))
        }
    }

    impl FrameDecoder for LoggingCodec {
        fn frame_size(&self) -> usize {
            self.frame
        }

        fn decode(&mut self, payload: Option<&[u8]>, out: &mut [f32]) -> Result<usize, CodecError> {
            self.log.lock().push(if payload.is_some() { "decode" } else { "conceal" });
            out.fill(0.5);
            Ok(out.len())
        }
    }

    fn params(period: usize) -> StreamParams {
        StreamParams {
            period,
            ..StreamParams::from_config(&AudioConfig::default())
        }
    }

    fn hardware(
        device: ManualDevice,
        period: usize,
        encoder_frame: usize,
        decoder_frame: usize,
        log: &Log,
    ) -> AudioHardware<ManualDevice> {
        let sender = Sender::new(
            LoggingCodec { frame: encoder_frame, log: log.clone() },
            HeaderFormat::Bare,
            Strand::current().unwrap(),
        );
        let receiver = Receiver::new(
            LoggingCodec { frame: decoder_frame, log: log.clone() },
            &QueueConfig::default(),
            HeaderFormat::Bare,
        );
        AudioHardware::open(device, &params(period), sender, receiver)
    }

    #[tokio::test]
    async fn test_open_failure_disables_hardware() {
        let driver = ManualDevice::new();
        driver.fail_open(true);
        let log = Log::default();
        let mut hw = hardware(driver.clone(), 4, 4, 4, &log);

        assert_eq!(hw.state(), HardwareState::Disabled);

        let (near, _far) = memory::pair();
        hw.new_connection(near.clone());
        hw.out_stream_ready();
        hw.start();

        assert_eq!(hw.state(), HardwareState::Disabled);
        assert!(!hw.binder().is_bound());
        assert_eq!(near.subscriber_count(), 0);
        assert!(!driver.tick(None, None));

        hw.shutdown();
        hw.shutdown();
    }

    #[tokio::test]
    async fn test_start_failure_disables_hardware() {
        let driver = ManualDevice::new();
        driver.fail_start(true);
        let log = Log::default();
        let mut hw = hardware(driver.clone(), 4, 4, 4, &log);
        assert_eq!(hw.state(), HardwareState::Stopped);

        hw.out_stream_ready();
        assert_eq!(hw.state(), HardwareState::Disabled);
        assert!(!hw.device().is_open());
    }

    #[tokio::test]
    async fn test_period_encodes_before_decoding() {
        let driver = ManualDevice::new();
        let log = Log::default();
        let mut hw = hardware(driver.clone(), 4, 4, 4, &log);

        let (near, _far) = memory::pair();
        hw.new_connection(near);
        assert_eq!(hw.state(), HardwareState::Running);

        assert_eq!(driver.tick_duplex(&[0.1; 4]).unwrap(), vec![0.5; 4]);
        driver.tick(Some(&[0.1; 4]), None);
        let mut out = [0.0f32; 4];
        driver.tick(None, Some(&mut out));

        assert_eq!(*log.lock(), vec!["encode", "conceal", "encode", "conceal"]);
    }

    #[tokio::test]
    async fn test_frame_size_fault_halts_one_direction() {
        let driver = ManualDevice::new();
        let log = Log::default();
        // Decoder frame does not match the device period
        let mut hw = hardware(driver.clone(), 4, 4, 3, &log);
        let (near, far) = memory::pair();
        hw.new_connection(near);

        let played = driver.tick_duplex(&[0.1; 4]).unwrap();
        assert_eq!(played, vec![0.0; 4]);
        assert!(hw.halted().playback());
        assert!(!hw.halted().capture());

        driver.tick_duplex(&[0.1; 4]).unwrap();
        hw.binder().sender().strand().flush().await;
        assert_eq!(far.pending(), 2);
        assert_eq!(*log.lock(), vec!["encode", "encode"]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_device_and_stream() {
        let driver = ManualDevice::new();
        let log = Log::default();
        let mut hw = hardware(driver.clone(), 4, 4, 4, &log);
        let (near, _far) = memory::pair();
        hw.streaming(near.clone());
        assert_eq!(hw.state(), HardwareState::Stopped);
        hw.start();
        assert!(driver.is_running());

        hw.shutdown();
        hw.binder().sender().strand().flush().await;
        assert!(!driver.is_open());
        assert!(near.is_read_shutdown());
        assert!(near.is_write_shutdown());
        assert_eq!(hw.state(), HardwareState::Disabled);

        hw.shutdown();
    }

    #[tokio::test]
    async fn test_set_enabled_gates_both_paths() {
        let driver = ManualDevice::new();
        let log = Log::default();
        let mut hw = hardware(driver.clone(), 4, 4, 4, &log);
        let (near, far) = memory::pair();
        hw.new_connection(near);

        hw.set_enabled(false);
        let played = driver.tick_duplex(&[0.1; 4]).unwrap();
        hw.binder().sender().strand().flush().await;

        assert_eq!(played, vec![0.0; 4]);
        assert_eq!(far.pending(), 0);
        assert!(log.lock().is_empty());
    }
}
