//! Packet queue between the network thread and the audio callback
//!
//! Single producer (datagram arrival) and single consumer (playback
//! callback). The mutex only ever guards a `VecDeque` push or pop, so the
//! audio thread waits at most for one pointer move, never for codec work.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::constants::DEFAULT_QUEUE_CAPACITY;
use crate::protocol::EncodedPacket;

/// What to discard when a bounded queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the packet at the head, keeping latency bounded
    #[default]
    DropOldest,
    /// Refuse the incoming packet
    DropNewest,
}

/// Queue sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued packets, `None` for unbounded
    pub capacity: Option<usize>,
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: Some(DEFAULT_QUEUE_CAPACITY),
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

impl QueueConfig {
    pub fn unbounded() -> Self {
        Self {
            capacity: None,
            overflow: OverflowPolicy::DropOldest,
        }
    }

    pub fn bounded(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            capacity: Some(capacity),
            overflow,
        }
    }
}

/// Result of [`PacketQueue::push`]
#[derive(Debug)]
pub enum PushOutcome {
    Queued,
    /// Queue was full, this head packet was evicted to make room
    Evicted(EncodedPacket),
    /// Queue was full, the pushed packet was refused
    Rejected(EncodedPacket),
}

/// Thread-safe FIFO of encoded packets
pub struct PacketQueue {
    packets: Mutex<VecDeque<EncodedPacket>>,
    capacity: Option<usize>,
    overflow: OverflowPolicy,
    pushed: AtomicU64,
    popped: AtomicU64,
    dropped: AtomicU64,
    underruns: AtomicU64,
}

impl PacketQueue {
    /// Create a queue with the given sizing. A zero capacity is raised to one.
    pub fn new(config: &QueueConfig) -> Self {
        let capacity = config.capacity.map(|c| c.max(1));
        let preallocated = capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);

        Self {
            packets: Mutex::new(VecDeque::with_capacity(preallocated)),
            capacity,
            overflow: config.overflow,
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
        }
    }

    /// Append a packet at the tail
    pub fn push(&self, packet: EncodedPacket) -> PushOutcome {
        let outcome = {
            let mut packets = self.packets.lock();
            match self.capacity {
                Some(capacity) if packets.len() >= capacity => match self.overflow {
                    OverflowPolicy::DropOldest => {
                        let evicted = packets.pop_front();
                        packets.push_back(packet);
                        match evicted {
                            Some(evicted) => PushOutcome::Evicted(evicted),
                            None => PushOutcome::Queued,
                        }
                    }
                    OverflowPolicy::DropNewest => PushOutcome::Rejected(packet),
                },
                _ => {
                    packets.push_back(packet);
                    PushOutcome::Queued
                }
            }
        };

        match outcome {
            PushOutcome::Queued => {
                self.pushed.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Evicted(_) => {
                self.pushed.fetch_add(1, Ordering::Relaxed);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Rejected(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        outcome
    }

    /// Remove the head packet, or `None` on underrun
    pub fn pop_or_none(&self) -> Option<EncodedPacket> {
        let packet = self.packets.lock().pop_front();

        match packet {
            Some(_) => self.popped.fetch_add(1, Ordering::Relaxed),
            None => self.underruns.fetch_add(1, Ordering::Relaxed),
        };

        packet
    }

    /// Discard everything queued, returning how many packets were dropped
    pub fn clear(&self) -> usize {
        let drained: VecDeque<EncodedPacket> = std::mem::take(&mut *self.packets.lock());
        self.dropped.fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }

    /// Configured capacity, `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            level: self.len(),
            capacity: self.capacity,
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.pushed.store(0, Ordering::Relaxed);
        self.popped.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.underruns.store(0, Ordering::Relaxed);
    }
}

/// Packet queue statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub level: usize,
    pub capacity: Option<usize>,
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
    pub underruns: u64,
}

impl QueueStats {
    /// Fraction of pulls that found the queue empty
    pub fn underrun_rate(&self) -> f32 {
        let pulls = self.popped + self.underruns;
        if pulls == 0 {
            0.0
        } else {
            self.underruns as f32 / pulls as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn packet(tag: u32) -> EncodedPacket {
        EncodedPacket::from(tag.to_be_bytes().to_vec())
    }

    fn tag(packet: &EncodedPacket) -> u32 {
        let b = packet.as_bytes();
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    #[test]
    fn test_fifo_order() {
        let queue = PacketQueue::new(&QueueConfig::unbounded());
        assert!(queue.pop_or_none().is_none());

        queue.push(packet(1));
        queue.push(packet(2));
        assert_eq!(queue.len(), 2);

        assert_eq!(tag(&queue.pop_or_none().unwrap()), 1);
        assert_eq!(tag(&queue.pop_or_none().unwrap()), 2);
        assert!(queue.is_empty());

        let stats = queue.stats();
        assert_eq!(stats.pushed, 2);
        assert_eq!(stats.popped, 2);
        assert_eq!(stats.underruns, 1);
    }

    #[test]
    fn test_drop_oldest() {
        let queue = PacketQueue::new(&QueueConfig::bounded(2, OverflowPolicy::DropOldest));
        queue.push(packet(1));
        queue.push(packet(2));

        match queue.push(packet(3)) {
            PushOutcome::Evicted(evicted) => assert_eq!(tag(&evicted), 1),
            other => panic!("expected eviction, got {:?}", other),
        }

        assert_eq!(tag(&queue.pop_or_none().unwrap()), 2);
        assert_eq!(tag(&queue.pop_or_none().unwrap()), 3);
        assert_eq!(queue.stats().dropped, 1);
    }

    #[test]
    fn test_drop_newest() {
        let queue = PacketQueue::new(&QueueConfig::bounded(2, OverflowPolicy::DropNewest));
        queue.push(packet(1));
        queue.push(packet(2));

        match queue.push(packet(3)) {
            PushOutcome::Rejected(rejected) => assert_eq!(tag(&rejected), 3),
            other => panic!("expected rejection, got {:?}", other),
        }

        assert_eq!(tag(&queue.pop_or_none().unwrap()), 1);
        assert_eq!(tag(&queue.pop_or_none().unwrap()), 2);
        assert!(queue.pop_or_none().is_none());
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let queue = PacketQueue::new(&QueueConfig::bounded(0, OverflowPolicy::DropNewest));
        assert_eq!(queue.capacity(), Some(1));
        assert!(matches!(queue.push(packet(1)), PushOutcome::Queued));
        assert!(matches!(queue.push(packet(2)), PushOutcome::Rejected(_)));
    }

    #[test]
    fn test_clear() {
        let queue = PacketQueue::new(&QueueConfig::default());
        queue.push(packet(1));
        queue.push(packet(2));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_push_pop_loses_nothing() {
        const COUNT: u32 = 20_000;
        let queue = Arc::new(PacketQueue::new(&QueueConfig::unbounded()));

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..COUNT {
                    queue.push(packet(i));
                }
            })
        };

        let mut received = Vec::with_capacity(COUNT as usize);
        while received.len() < COUNT as usize {
            match queue.pop_or_none() {
                Some(p) => {
                    assert_eq!(p.len(), 4);
                    received.push(tag(&p));
                }
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();

        let expected: Vec<u32> = (0..COUNT).collect();
        assert_eq!(received, expected);
        assert!(queue.pop_or_none().is_none());
    }

    proptest! {
        #[test]
        fn prop_matches_bounded_model(
            ops in proptest::collection::vec(any::<bool>(), 1..200),
            capacity in 1usize..8,
            drop_oldest in any::<bool>(),
        ) {
            let policy = if drop_oldest { OverflowPolicy::DropOldest } else { OverflowPolicy::DropNewest };
            let queue = PacketQueue::new(&QueueConfig::bounded(capacity, policy));
            let mut model: VecDeque<u32> = VecDeque::new();
            let mut next = 0u32;

            for push in ops {
                if push {
                    if model.len() >= capacity {
                        if drop_oldest {
                            model.pop_front();
                            model.push_back(next);
                        }
                    } else {
                        model.push_back(next);
                    }
                    queue.push(packet(next));
                    next += 1;
                } else {
                    let got = queue.pop_or_none().map(|p| tag(&p));
                    prop_assert_eq!(got, model.pop_front());
                }
                prop_assert!(queue.len() <= capacity);
            }
        }
    }
}
