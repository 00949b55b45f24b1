//! Audio subsystem: jitter queue, device contract and the hardware bridge

pub mod buffer;
pub mod device;
pub mod duplex;
pub mod hardware;

pub use buffer::{OverflowPolicy, PacketQueue, PushOutcome, QueueConfig, QueueStats};
pub use device::{list_devices, get_device_by_id, AudioDevice, DeviceInfo, ManualDevice, PeriodCallback, StreamParams};
pub use duplex::CpalDevice;
pub use hardware::{AudioHardware, DuplexPeriod, HardwareState};
