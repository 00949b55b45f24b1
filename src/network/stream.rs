//! Logical datagram stream contract
//!
//! A stream delivers unordered, unreliable datagrams. Arrival is announced
//! through a "ready to read" notification; the listener then pulls exactly
//! one datagram. Each direction can be shut down on its own.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::NetworkError;

/// Delivery guarantee requested for a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Unreliable,
    Reliable,
}

/// Direction(s) to shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Read,
    Write,
    Both,
}

/// Handle of a registered ready-read callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Callback invoked when a datagram becomes readable
pub type ReadyCallback = Arc<dyn Fn() + Send + Sync>;

/// A logical stream carrying voice datagrams
pub trait DatagramStream: Send + Sync {
    /// Register `callback` to run whenever a datagram is ready to read
    fn on_ready_read_datagram(&self, callback: ReadyCallback) -> SubscriptionId;

    /// Remove a registration; unknown ids are ignored
    fn disconnect(&self, id: SubscriptionId);

    /// Take the next pending datagram, if any
    fn read_datagram(&self) -> Option<Bytes>;

    fn write_datagram(&self, data: Bytes, reliability: Reliability) -> Result<(), NetworkError>;

    /// Shut down one or both directions. Repeated calls have no effect.
    fn shutdown(&self, mode: ShutdownMode);

    fn is_read_shutdown(&self) -> bool;

    fn is_write_shutdown(&self) -> bool;
}

/// Subscriber list behind a ready-read notification
#[derive(Default)]
pub struct ReadySignal {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(SubscriptionId, ReadyCallback)>>,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, callback: ReadyCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.lock().push((id, callback));
        id
    }

    pub fn disconnect(&self, id: SubscriptionId) {
        self.callbacks.lock().retain(|(existing, _)| *existing != id);
    }

    pub fn disconnect_all(&self) {
        self.callbacks.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Run every callback, outside the subscriber lock
    pub fn emit(&self) {
        let callbacks: Vec<ReadyCallback> = self
            .callbacks
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();

        for callback in callbacks {
            callback();
        }
    }
}

/// Open/closed state of both directions
#[derive(Debug)]
pub struct Directions {
    read_open: AtomicBool,
    write_open: AtomicBool,
}

impl Default for Directions {
    fn default() -> Self {
        Self {
            read_open: AtomicBool::new(true),
            write_open: AtomicBool::new(true),
        }
    }
}

impl Directions {
    /// Close the given directions, returning which ones were open until now
    pub fn shutdown(&self, mode: ShutdownMode) -> (bool, bool) {
        let read = matches!(mode, ShutdownMode::Read | ShutdownMode::Both)
            && self.read_open.swap(false, Ordering::AcqRel);
        let write = matches!(mode, ShutdownMode::Write | ShutdownMode::Both)
            && self.write_open.swap(false, Ordering::AcqRel);
        (read, write)
    }

    pub fn is_read_open(&self) -> bool {
        self.read_open.load(Ordering::Acquire)
    }

    pub fn is_write_open(&self) -> bool {
        self.write_open.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_ready_signal_connect_disconnect() {
        let signal = ReadySignal::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let first = {
            let hits = hits.clone();
            signal.connect(Arc::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }))
        };
        let _second = {
            let hits = hits.clone();
            signal.connect(Arc::new(move || {
                hits.fetch_add(10, Ordering::SeqCst);
            }))
        };

        signal.emit();
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        signal.disconnect(first);
        signal.emit();
        assert_eq!(hits.load(Ordering::SeqCst), 21);
        assert_eq!(signal.subscriber_count(), 1);
    }

    #[test]
    fn test_directions_shutdown_once() {
        let directions = Directions::default();
        assert_eq!(directions.shutdown(ShutdownMode::Read), (true, false));
        assert_eq!(directions.shutdown(ShutdownMode::Read), (false, false));
        assert!(directions.is_write_open());
        assert_eq!(directions.shutdown(ShutdownMode::Both), (false, true));
        assert!(!directions.is_read_open());
    }
}
