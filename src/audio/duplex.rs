//! cpal backend for [`AudioDevice`]
//!
//! cpal has no duplex stream, so capture and playback are two streams. The
//! input callback cuts captured audio into 10 ms mono frames and hands them
//! to the output callback through a lock-free queue of recycled buffers; the
//! output callback runs the period callback once per period of playback.
//! With only one side available that side's callback clocks the periods.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig, SupportedBufferSize, SupportedStreamConfig};
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::audio::device::{input_device, output_device, AudioDevice, PeriodCallback, StreamParams};
use crate::constants::CAPTURE_RING_CAPACITY;
use crate::error::AudioError;

/// Captured frames travelling from the input to the output callback
struct CaptureHandoff {
    filled: ArrayQueue<Vec<f32>>,
    free: ArrayQueue<Vec<f32>>,
}

impl CaptureHandoff {
    fn new(capacity: usize, period: usize) -> Self {
        // One spare buffer for the input side, one for the output side
        let buffers = capacity + 2;
        let free = ArrayQueue::new(buffers);
        for _ in 0..buffers {
            let _ = free.push(Vec::with_capacity(period));
        }
        Self {
            filled: ArrayQueue::new(capacity),
            free,
        }
    }

    /// Queue a captured frame, replacing the oldest one when full
    fn offer(&self, frame: &[f32], counters: &Counters) {
        let Some(mut buf) = self.free.pop() else {
            counters.capture_overruns.fetch_add(1, Ordering::Relaxed);
            return;
        };
        buf.clear();
        buf.extend_from_slice(frame);

        if let Err(buf) = self.filled.push(buf) {
            counters.capture_overruns.fetch_add(1, Ordering::Relaxed);
            if let Some(stale) = self.filled.pop() {
                let _ = self.free.push(stale);
            }
            if let Err(buf) = self.filled.push(buf) {
                let _ = self.free.push(buf);
            }
        }
    }

    fn recycle(&self, buf: Vec<f32>) {
        let _ = self.free.push(buf);
    }
}

/// Cuts interleaved input into mono frames of one period
struct FrameAssembler {
    frame: Vec<f32>,
    period: usize,
    channels: usize,
}

impl FrameAssembler {
    fn new(period: usize, channels: u16) -> Self {
        Self {
            frame: Vec::with_capacity(period),
            period,
            channels: channels.max(1) as usize,
        }
    }

    /// Feed interleaved samples, calling `emit` for every completed frame
    fn push(&mut self, data: &[f32], mut emit: impl FnMut(&[f32])) {
        for sample in data.chunks(self.channels) {
            // First channel only
            self.frame.push(sample[0]);
            if self.frame.len() == self.period {
                emit(&self.frame);
                self.frame.clear();
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    periods: AtomicU64,
    /// Captured frames lost because playback did not keep up
    capture_overruns: AtomicU64,
}

/// Counters of a running [`CpalDevice`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DuplexStats {
    pub periods: u64,
    pub capture_overruns: u64,
}

/// Default-host cpal device pair
pub struct CpalDevice {
    input: Option<cpal::Stream>,
    output: Option<cpal::Stream>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    error_rx: Option<Receiver<AudioError>>,
}

impl CpalDevice {
    pub fn new() -> Self {
        Self {
            input: None,
            output: None,
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            error_rx: None,
        }
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    pub fn stats(&self) -> DuplexStats {
        DuplexStats {
            periods: self.counters.periods.load(Ordering::Relaxed),
            capture_overruns: self.counters.capture_overruns.load(Ordering::Relaxed),
        }
    }

    /// Next stream error reported by cpal, if any
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }

    fn build_input(
        device: &cpal::Device,
        params: &StreamParams,
        mut on_frame: impl FnMut(&[f32]) + Send + 'static,
        running: Arc<AtomicBool>,
        error_tx: Sender<AudioError>,
    ) -> Result<cpal::Stream, AudioError> {
        let supported = device
            .default_input_config()
            .map_err(|e| AudioError::CpalError(e.to_string()))?;
        let config = stream_config(&supported, params);
        let mut assembler = FrameAssembler::new(params.period, config.channels);

        device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if running.load(Ordering::Relaxed) {
                        assembler.push(data, &mut on_frame);
                    }
                },
                move |err| {
                    let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                },
                None,
            )
            .map_err(|e| AudioError::UnsupportedFormat(format!("Input stream: {}", e)))
    }

    fn build_output(
        device: &cpal::Device,
        params: &StreamParams,
        mut callback: PeriodCallback,
        handoff: Option<Arc<CaptureHandoff>>,
        running: Arc<AtomicBool>,
        counters: Arc<Counters>,
        error_tx: Sender<AudioError>,
    ) -> Result<cpal::Stream, AudioError> {
        let supported = device
            .default_output_config()
            .map_err(|e| AudioError::CpalError(e.to_string()))?;
        let config = stream_config(&supported, params);
        let channels = config.channels.max(1) as usize;
        let period = params.period;

        let mut playout = vec![0.0f32; period];
        let mut cursor = period;

        device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if !running.load(Ordering::Relaxed) {
                        data.fill(0.0);
                        return;
                    }

                    for frame in data.chunks_mut(channels) {
                        if cursor == period {
                            let captured = handoff.as_ref().and_then(|h| h.filled.pop());
                            callback(captured.as_deref(), Some(playout.as_mut_slice()));
                            counters.periods.fetch_add(1, Ordering::Relaxed);
                            if let (Some(handoff), Some(buf)) = (handoff.as_ref(), captured) {
                                handoff.recycle(buf);
                            }
                            cursor = 0;
                        }
                        // Same sample on every output channel
                        frame.fill(playout[cursor]);
                        cursor += 1;
                    }
                },
                move |err| {
                    let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                },
                None,
            )
            .map_err(|e| AudioError::UnsupportedFormat(format!("Output stream: {}", e)))
    }
}

impl Default for CpalDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream config at the requested rate, with a fixed period when the device allows it
fn stream_config(supported: &SupportedStreamConfig, params: &StreamParams) -> StreamConfig {
    let period = params.period as u32;
    let buffer_size = match supported.buffer_size() {
        SupportedBufferSize::Range { min, max } if (*min..=*max).contains(&period) => BufferSize::Fixed(period),
        _ => BufferSize::Default,
    };

    StreamConfig {
        channels: supported.channels(),
        sample_rate: SampleRate(params.sample_rate),
        buffer_size,
    }
}

impl AudioDevice for CpalDevice {
    fn open(&mut self, params: &StreamParams, mut callback: PeriodCallback) -> Result<(), AudioError> {
        self.close();

        let input = input_device(params.input_device.as_deref())
            .map_err(|e| warn!("No capture device, playback only: {}", e))
            .ok();
        let output = output_device(params.output_device.as_deref())
            .map_err(|e| warn!("No playback device, capture only: {}", e))
            .ok();

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        self.error_rx = Some(error_rx);
        let running = self.running.clone();
        let counters = self.counters.clone();

        match (input, output) {
            (Some(input), Some(output)) => {
                let handoff = Arc::new(CaptureHandoff::new(CAPTURE_RING_CAPACITY, params.period));
                let producer = handoff.clone();
                let overruns = counters.clone();
                self.input = Some(Self::build_input(
                    &input,
                    params,
                    move |frame| producer.offer(frame, &overruns),
                    running.clone(),
                    error_tx.clone(),
                )?);
                self.output = Some(Self::build_output(
                    &output,
                    params,
                    callback,
                    Some(handoff),
                    running,
                    counters,
                    error_tx,
                )?);
            }
            (Some(input), None) => {
                self.input = Some(Self::build_input(
                    &input,
                    params,
                    move |frame| {
                        callback(Some(frame), None);
                        counters.periods.fetch_add(1, Ordering::Relaxed);
                    },
                    running,
                    error_tx,
                )?);
            }
            (None, Some(output)) => {
                self.output = Some(Self::build_output(&output, params, callback, None, running, counters, error_tx)?);
            }
            (None, None) => {
                return Err(AudioError::DeviceNotFound("No capture or playback device".to_string()));
            }
        }

        // Some hosts start streams on creation
        for stream in self.input.iter().chain(self.output.iter()) {
            let _ = stream.pause();
        }

        info!(
            "Audio device open at {} Hz, {} frame period (capture: {}, playback: {})",
            params.sample_rate,
            params.period,
            self.input.is_some(),
            self.output.is_some()
        );
        Ok(())
    }

    fn start(&mut self) -> Result<(), AudioError> {
        if !self.is_open() {
            return Err(AudioError::NotOpen);
        }
        self.running.store(true, Ordering::SeqCst);
        for stream in self.input.iter().chain(self.output.iter()) {
            stream.play().map_err(|e| AudioError::StreamError(e.to_string()))?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        if !self.is_open() {
            return Err(AudioError::NotOpen);
        }
        self.running.store(false, Ordering::SeqCst);
        for stream in self.input.iter().chain(self.output.iter()) {
            stream.pause().map_err(|e| AudioError::StreamError(e.to_string()))?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let was_open = self.is_open();
        self.input = None;
        self.output = None;
        if was_open {
            info!("Audio device closed");
        }
        self.error_rx = None;
    }

    fn is_open(&self) -> bool {
        self.input.is_some() || self.output.is_some()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_downmixes_and_splits() {
        let mut assembler = FrameAssembler::new(3, 2);
        let mut frames = Vec::new();

        // Left channel carries the index, right channel is noise
        let interleaved: Vec<f32> = (0..8).flat_map(|i| [i as f32, -9.0]).collect();
        assembler.push(&interleaved[..6], |f| frames.push(f.to_vec()));
        assembler.push(&interleaved[6..], |f| frames.push(f.to_vec()));

        assert_eq!(frames, vec![vec![0.0, 1.0, 2.0], vec![3.0, 4.0, 5.0]]);
    }

    #[test]
    fn test_handoff_drops_oldest_and_recycles() {
        let counters = Counters::default();
        let handoff = CaptureHandoff::new(2, 4);

        for i in 0..3 {
            handoff.offer(&[i as f32; 4], &counters);
        }
        assert_eq!(counters.capture_overruns.load(Ordering::Relaxed), 1);

        let first = handoff.filled.pop().unwrap();
        assert_eq!(first, vec![1.0; 4]);
        handoff.recycle(first);
        assert_eq!(handoff.filled.pop().unwrap(), vec![2.0; 4]);
        assert!(handoff.filled.pop().is_none());
    }
}
