//! In-process datagram stream pair
//!
//! Two linked endpoints: whatever one writes becomes readable on the other.
//! Used to run a call without a network, and by the test suite.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::error::NetworkError;
use crate::network::stream::{
    DatagramStream, Directions, ReadyCallback, ReadySignal, Reliability, ShutdownMode, SubscriptionId,
};

/// Receiving half of one endpoint
#[derive(Default)]
struct Inbox {
    datagrams: Mutex<VecDeque<Bytes>>,
    ready: ReadySignal,
    directions: Directions,
}

/// One endpoint of a [`pair`]
pub struct MemoryStream {
    inbox: Arc<Inbox>,
    peer: Arc<Inbox>,
    /// Writes to skip, for loss simulation
    drop_next: AtomicU64,
    written: AtomicU64,
}

/// Create two connected endpoints
pub fn pair() -> (Arc<MemoryStream>, Arc<MemoryStream>) {
    let a = Arc::new(Inbox::default());
    let b = Arc::new(Inbox::default());

    let left = Arc::new(MemoryStream::new(a.clone(), b.clone()));
    let right = Arc::new(MemoryStream::new(b, a));
    (left, right)
}

impl MemoryStream {
    fn new(inbox: Arc<Inbox>, peer: Arc<Inbox>) -> Self {
        Self {
            inbox,
            peer,
            drop_next: AtomicU64::new(0),
            written: AtomicU64::new(0),
        }
    }

    /// Silently lose the next `count` datagrams written by this endpoint
    pub fn drop_next(&self, count: u64) {
        self.drop_next.fetch_add(count, Ordering::SeqCst);
    }

    /// Datagrams waiting to be read on this endpoint
    pub fn pending(&self) -> usize {
        self.inbox.datagrams.lock().len()
    }

    /// Datagrams accepted by `write_datagram`, lost ones included
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    /// Number of ready-read registrations on this endpoint
    pub fn subscriber_count(&self) -> usize {
        self.inbox.ready.subscriber_count()
    }

    /// Deliver a datagram to this endpoint as if the peer had sent it
    pub fn inject(&self, data: Bytes) {
        Self::deliver(&self.inbox, data);
    }

    fn deliver(inbox: &Inbox, data: Bytes) {
        if !inbox.directions.is_read_open() {
            trace!("Dropping datagram for closed reader");
            return;
        }
        inbox.datagrams.lock().push_back(data);
        inbox.ready.emit();
    }

    fn take_drop(&self) -> bool {
        self.drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl DatagramStream for MemoryStream {
    fn on_ready_read_datagram(&self, callback: ReadyCallback) -> SubscriptionId {
        self.inbox.ready.connect(callback)
    }

    fn disconnect(&self, id: SubscriptionId) {
        self.inbox.ready.disconnect(id);
    }

    fn read_datagram(&self) -> Option<Bytes> {
        self.inbox.datagrams.lock().pop_front()
    }

    fn write_datagram(&self, data: Bytes, _reliability: Reliability) -> Result<(), NetworkError> {
        if !self.inbox.directions.is_write_open() {
            return Err(NetworkError::WriteShutdown);
        }
        self.written.fetch_add(1, Ordering::SeqCst);
        if self.take_drop() {
            trace!("Simulated loss of {} byte datagram", data.len());
            return Ok(());
        }
        Self::deliver(&self.peer, data);
        Ok(())
    }

    fn shutdown(&self, mode: ShutdownMode) {
        let (read_closed, _) = self.inbox.directions.shutdown(mode);
        if read_closed {
            self.inbox.datagrams.lock().clear();
        }
    }

    fn is_read_shutdown(&self) -> bool {
        !self.inbox.directions.is_read_open()
    }

    fn is_write_shutdown(&self) -> bool {
        !self.inbox.directions.is_write_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_write_reaches_peer() {
        let (a, b) = pair();
        let ready = Arc::new(AtomicUsize::new(0));
        {
            let ready = ready.clone();
            b.on_ready_read_datagram(Arc::new(move || {
                ready.fetch_add(1, Ordering::SeqCst);
            }));
        }

        a.write_datagram(Bytes::from_static(b"one"), Reliability::Unreliable).unwrap();
        a.write_datagram(Bytes::from_static(b"two"), Reliability::Unreliable).unwrap();

        assert_eq!(ready.load(Ordering::SeqCst), 2);
        assert_eq!(b.read_datagram().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(b.read_datagram().unwrap(), Bytes::from_static(b"two"));
        assert!(b.read_datagram().is_none());
        assert!(a.read_datagram().is_none());
    }

    #[test]
    fn test_simulated_loss() {
        let (a, b) = pair();
        a.drop_next(1);
        a.write_datagram(Bytes::from_static(b"lost"), Reliability::Unreliable).unwrap();
        a.write_datagram(Bytes::from_static(b"kept"), Reliability::Unreliable).unwrap();

        assert_eq!(a.written(), 2);
        assert_eq!(b.pending(), 1);
        assert_eq!(b.read_datagram().unwrap(), Bytes::from_static(b"kept"));
    }

    #[test]
    fn test_directional_shutdown() {
        let (a, b) = pair();

        b.shutdown(ShutdownMode::Read);
        b.shutdown(ShutdownMode::Read);
        assert!(b.is_read_shutdown());
        assert!(!b.is_write_shutdown());

        // Writes towards a closed reader vanish, the other direction still works
        a.write_datagram(Bytes::from_static(b"x"), Reliability::Unreliable).unwrap();
        assert_eq!(b.pending(), 0);
        b.write_datagram(Bytes::from_static(b"y"), Reliability::Unreliable).unwrap();
        assert_eq!(a.pending(), 1);

        a.shutdown(ShutdownMode::Write);
        assert!(matches!(
            a.write_datagram(Bytes::from_static(b"z"), Reliability::Unreliable),
            Err(NetworkError::WriteShutdown)
        ));
    }
}
