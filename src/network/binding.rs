//! Attaching one stream to both directions of a call

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::network::receiver::ReceiverHandle;
use crate::network::sender::SenderHandle;
use crate::network::stream::DatagramStream;

/// The stream a call is currently using
#[derive(Clone)]
pub struct StreamBinding {
    stream: Arc<dyn DatagramStream>,
    /// Increments with every bind
    id: u64,
}

impl StreamBinding {
    pub fn stream(&self) -> &Arc<dyn DatagramStream> {
        &self.stream
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for StreamBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBinding").field("id", &self.id).finish()
    }
}

/// Binds streams to a receiver and sender pair, one stream at a time
pub struct StreamBinder {
    receiver: ReceiverHandle,
    sender: SenderHandle,
    current: Mutex<Option<StreamBinding>>,
    next_id: AtomicU64,
}

impl StreamBinder {
    pub fn new(receiver: ReceiverHandle, sender: SenderHandle) -> Self {
        Self {
            receiver,
            sender,
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Rebind both directions to `stream`.
    ///
    /// The receiver drops its registration on the previous stream before
    /// registering on the new one.
    pub fn bind(&self, stream: Arc<dyn DatagramStream>) -> StreamBinding {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.receiver.bind(stream.clone());
        self.sender.bind(stream.clone());

        let binding = StreamBinding { stream, id };
        *self.current.lock() = Some(binding.clone());
        info!("Stream binding {} active", id);
        binding
    }

    pub fn current(&self) -> Option<StreamBinding> {
        self.current.lock().clone()
    }

    pub fn is_bound(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Detach both directions, leaving the stream open
    pub fn unbind(&self) {
        self.receiver.unbind();
        self.sender.unbind();
        self.current.lock().take();
    }

    /// Shut down reading and writing independently. Idempotent.
    pub fn shutdown(&self) {
        self.receiver.shutdown();
        self.sender.shutdown();
        if let Some(binding) = self.current.lock().take() {
            info!("Stream binding {} shut down", binding.id);
        }
    }

    pub fn receiver(&self) -> &ReceiverHandle {
        &self.receiver
    }

    pub fn sender(&self) -> &SenderHandle {
        &self.sender
    }
}
