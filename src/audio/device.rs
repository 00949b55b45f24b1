//! Audio device contract, enumeration and a manually clocked device

use cpal::traits::{DeviceTrait, HostTrait};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

use crate::config::AudioConfig;
use crate::error::AudioError;

/// Called once per period with the captured frame (if capturing) and the
/// frame to fill for playback (if playing). Runs on the device's real-time
/// thread.
pub type PeriodCallback = Box<dyn FnMut(Option<&[f32]>, Option<&mut [f32]>) + Send>;

/// Requested stream shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per period
    pub period: usize,
    /// `input:<name>`, default device when unset
    pub input_device: Option<String>,
    /// `output:<name>`, default device when unset
    pub output_device: Option<String>,
}

impl StreamParams {
    /// One 10 ms period at the configured rate
    pub fn from_config(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels,
            period: config.frame_size(),
            input_device: config.input_device.clone(),
            output_device: config.output_device.clone(),
        }
    }

    /// Samples in one period across all channels
    pub fn period_samples(&self) -> usize {
        self.period * self.channels as usize
    }
}

/// A duplex audio device driving a [`PeriodCallback`]
pub trait AudioDevice {
    /// Negotiate the stream and install `callback`. The device stays stopped.
    fn open(&mut self, params: &StreamParams, callback: PeriodCallback) -> Result<(), AudioError>;

    fn start(&mut self) -> Result<(), AudioError>;

    fn stop(&mut self) -> Result<(), AudioError>;

    /// Release the stream. Closing a closed device does nothing.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn is_running(&self) -> bool;
}

impl<T: AudioDevice + ?Sized> AudioDevice for Box<T> {
    fn open(&mut self, params: &StreamParams, callback: PeriodCallback) -> Result<(), AudioError> {
        (**self).open(params, callback)
    }

    fn start(&mut self) -> Result<(), AudioError> {
        (**self).start()
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        (**self).stop()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn is_running(&self) -> bool {
        (**self).is_running()
    }
}

/// Device listing entry
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// List all available audio devices
pub fn list_devices() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = device_capabilities(&device, true);
                devices.push(DeviceInfo {
                    id: format!("input:{}", name),
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = device_capabilities(&device, false);
                devices.push(DeviceInfo {
                    id: format!("output:{}", name),
                    is_default: default_output_name.as_ref() == Some(&name),
                    name,
                    is_input: false,
                    is_output: true,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    devices
}

/// Voice-relevant rates and channel counts a device supports
fn device_capabilities(device: &cpal::Device, is_input: bool) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = if is_input {
        device.supported_input_configs().map(|c| c.collect()).unwrap_or_default()
    } else {
        device.supported_output_configs().map(|c| c.collect()).unwrap_or_default()
    };

    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();
    for config in configs {
        for rate in crate::constants::OPUS_SAMPLE_RATES {
            let sample_rate = cpal::SampleRate(rate);
            if sample_rate >= config.min_sample_rate()
                && sample_rate <= config.max_sample_rate()
                && !sample_rates.contains(&rate)
            {
                sample_rates.push(rate);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }

    sample_rates.sort_unstable();
    channels.sort_unstable();
    (sample_rates, channels)
}

/// Find a device by its `input:<name>` / `output:<name>` id
pub fn get_device_by_id(id: &str) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let (is_input, name) = if let Some(name) = id.strip_prefix("input:") {
        (true, name)
    } else if let Some(name) = id.strip_prefix("output:") {
        (false, name)
    } else {
        return Err(AudioError::DeviceNotFound(format!("{} (expected input:<name> or output:<name>)", id)));
    };

    let devices = if is_input { host.input_devices() } else { host.output_devices() };
    let mut devices = devices.map_err(|e| AudioError::CpalError(e.to_string()))?;

    devices
        .find(|device| device.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| AudioError::DeviceNotFound(id.to_string()))
}

/// Resolve an optional input id, falling back to the default input
pub fn input_device(id: Option<&str>) -> Result<cpal::Device, AudioError> {
    match id {
        Some(id) => get_device_by_id(id),
        None => cpal::default_host()
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string())),
    }
}

/// Resolve an optional output id, falling back to the default output
pub fn output_device(id: Option<&str>) -> Result<cpal::Device, AudioError> {
    match id {
        Some(id) => get_device_by_id(id),
        None => cpal::default_host()
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string())),
    }
}

#[derive(Default)]
struct ManualState {
    callback: Option<PeriodCallback>,
    params: Option<StreamParams>,
    running: bool,
    fail_open: bool,
    fail_start: bool,
    periods: u64,
}

/// Device clocked by explicit [`tick`](ManualDevice::tick) calls.
///
/// Clones share one device, so a test can keep a clone to drive the periods
/// of a device it handed over.
#[derive(Clone, Default)]
pub struct ManualDevice {
    state: Arc<Mutex<ManualState>>,
}

impl ManualDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `open` fail, like a missing or busy device
    pub fn fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    pub fn fail_start(&self, fail: bool) {
        self.state.lock().fail_start = fail;
    }

    pub fn params(&self) -> Option<StreamParams> {
        self.state.lock().params.clone()
    }

    /// Periods delivered so far
    pub fn periods(&self) -> u64 {
        self.state.lock().periods
    }

    /// Run one period. Returns `false` when the device is not running.
    pub fn tick(&self, input: Option<&[f32]>, output: Option<&mut [f32]>) -> bool {
        let mut state = self.state.lock();
        if !state.running {
            return false;
        }
        state.periods += 1;
        match state.callback.as_mut() {
            Some(callback) => {
                callback(input, output);
                true
            }
            None => false,
        }
    }

    /// Run one duplex period with `input` and return the played frame
    pub fn tick_duplex(&self, input: &[f32]) -> Option<Vec<f32>> {
        let mut output = vec![0.0f32; input.len()];
        self.tick(Some(input), Some(&mut output)).then_some(output)
    }
}

impl AudioDevice for ManualDevice {
    fn open(&mut self, params: &StreamParams, callback: PeriodCallback) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        if state.fail_open {
            return Err(AudioError::StreamError("Manual device refused to open".to_string()));
        }
        state.params = Some(params.clone());
        state.callback = Some(callback);
        state.running = false;
        Ok(())
    }

    fn start(&mut self) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        if state.callback.is_none() {
            return Err(AudioError::NotOpen);
        }
        if state.fail_start {
            return Err(AudioError::StreamError("Manual device refused to start".to_string()));
        }
        state.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        if state.callback.is_none() {
            return Err(AudioError::NotOpen);
        }
        state.running = false;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.running = false;
        state.callback = None;
        state.params = None;
    }

    fn is_open(&self) -> bool {
        self.state.lock().callback.is_some()
    }

    fn is_running(&self) -> bool {
        self.state.lock().running
    }
}
