//! UDP datagram stream
//!
//! One connected UDP socket per call. A background task receives datagrams
//! into an inbox and raises the ready notification; writes are non-blocking
//! `try_send` calls, so they can run on a [`Strand`](super::strand::Strand)
//! without awaiting.

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::constants::MAX_PACKET_SIZE;
use crate::error::NetworkError;
use crate::network::stream::{
    DatagramStream, Directions, ReadyCallback, ReadySignal, Reliability, ShutdownMode, SubscriptionId,
};

/// Kernel socket buffer size, a few seconds of voice
const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

/// Datagrams held for the reader before the oldest are discarded
const INBOX_CAPACITY: usize = 256;

/// Pause after a receive error before polling the socket again
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// State shared with the receive task
struct Shared {
    inbox: Mutex<VecDeque<Bytes>>,
    ready: ReadySignal,
    directions: Directions,
    read_closed: Notify,
    received: AtomicU64,
    overflowed: AtomicU64,
}

impl Shared {
    fn deliver(&self, data: Bytes) {
        {
            let mut inbox = self.inbox.lock();
            if inbox.len() >= INBOX_CAPACITY {
                inbox.pop_front();
                self.overflowed.fetch_add(1, Ordering::Relaxed);
            }
            inbox.push_back(data);
        }
        self.received.fetch_add(1, Ordering::Relaxed);
        self.ready.emit();
    }
}

/// A connected UDP voice stream
pub struct UdpStream {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    peer: SocketAddr,
    shared: Arc<Shared>,
}

impl UdpStream {
    /// Calling side: bind locally and send to `peer`
    pub async fn connect(bind: SocketAddr, peer: SocketAddr) -> Result<Arc<Self>, NetworkError> {
        let socket = bind_socket(bind)?;
        socket
            .connect(peer)
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", peer, e)))?;

        let stream = Self::start(socket, peer)?;
        info!("UDP stream {} -> {}", stream.local, peer);
        Ok(stream)
    }

    /// Listening side: wait for the first datagram and call back its sender.
    ///
    /// The first datagram is kept and announced to the first subscriber.
    pub async fn accept(bind: SocketAddr) -> Result<Arc<Self>, NetworkError> {
        let socket = bind_socket(bind)?;
        info!(
            "Waiting for caller on {}",
            socket.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| bind.to_string())
        );

        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let (len, peer) = socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;
        socket
            .connect(peer)
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", peer, e)))?;

        let stream = Self::start(socket, peer)?;
        stream.shared.inbox.lock().push_back(Bytes::copy_from_slice(&buf[..len]));
        stream.shared.received.fetch_add(1, Ordering::Relaxed);
        info!("Accepted call from {} on {}", peer, stream.local);
        Ok(stream)
    }

    fn start(socket: UdpSocket, peer: SocketAddr) -> Result<Arc<Self>, NetworkError> {
        let local = socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        let socket = Arc::new(socket);
        let shared = Arc::new(Shared {
            inbox: Mutex::new(VecDeque::new()),
            ready: ReadySignal::new(),
            directions: Directions::default(),
            read_closed: Notify::new(),
            received: AtomicU64::new(0),
            overflowed: AtomicU64::new(0),
        });

        tokio::spawn(receive_loop(socket.clone(), shared.clone()));

        Ok(Arc::new(Self {
            socket,
            local,
            peer,
            shared,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Datagrams received so far
    pub fn received(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }

    /// Datagrams discarded because nobody read them in time
    pub fn overflowed(&self) -> u64 {
        self.shared.overflowed.load(Ordering::Relaxed)
    }
}

impl DatagramStream for UdpStream {
    fn on_ready_read_datagram(&self, callback: ReadyCallback) -> SubscriptionId {
        let id = self.shared.ready.connect(callback.clone());

        // Datagrams that arrived before anyone listened
        let waiting = self.shared.inbox.lock().len();
        for _ in 0..waiting {
            callback();
        }
        id
    }

    fn disconnect(&self, id: SubscriptionId) {
        self.shared.ready.disconnect(id);
    }

    fn read_datagram(&self) -> Option<Bytes> {
        self.shared.inbox.lock().pop_front()
    }

    fn write_datagram(&self, data: Bytes, reliability: Reliability) -> Result<(), NetworkError> {
        if reliability == Reliability::Reliable {
            return Err(NetworkError::ReliableUnsupported);
        }
        if !self.shared.directions.is_write_open() {
            return Err(NetworkError::WriteShutdown);
        }
        if data.len() > MAX_PACKET_SIZE {
            return Err(NetworkError::PacketTooLarge(data.len()));
        }

        let sent = self
            .socket
            .try_send(&data)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        trace!("Sent {} bytes to {}", sent, self.peer);
        Ok(())
    }

    fn shutdown(&self, mode: ShutdownMode) {
        let (read_closed, write_closed) = self.shared.directions.shutdown(mode);
        if read_closed {
            self.shared.read_closed.notify_one();
            self.shared.inbox.lock().clear();
            debug!("UDP stream {} closed for reading", self.local);
        }
        if write_closed {
            debug!("UDP stream {} closed for writing", self.local);
        }
    }

    fn is_read_shutdown(&self) -> bool {
        !self.shared.directions.is_read_open()
    }

    fn is_write_shutdown(&self) -> bool {
        !self.shared.directions.is_write_open()
    }
}

impl Drop for UdpStream {
    fn drop(&mut self) {
        // Stop the receive task, which holds its own socket reference
        self.shared.read_closed.notify_one();
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, shared: Arc<Shared>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        let received = tokio::select! {
            _ = shared.read_closed.notified() => break,
            result = socket.recv(&mut buf) => result,
        };

        if !shared.directions.is_read_open() {
            break;
        }

        match received {
            Ok(len) => {
                trace!("Received {} bytes", len);
                shared.deliver(Bytes::copy_from_slice(&buf[..len]));
            }
            Err(e) => {
                // ICMP port unreachable surfaces here while the peer is not up yet
                debug!("UDP receive error: {}", e);
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
            }
        }
    }

    debug!("UDP receive task stopped");
}

/// Create a non-blocking UDP socket with voice-sized kernel buffers
fn bind_socket(addr: SocketAddr) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(format!("Failed to create socket: {}", e)))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(format!("Failed to set SO_REUSEADDR: {}", e)))?;

    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!("Failed to set SO_RCVBUF: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!("Failed to set SO_SNDBUF: {}", e);
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(format!("Failed to set non-blocking: {}", e)))?;
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|e| NetworkError::BindFailed(e.to_string()))
}
