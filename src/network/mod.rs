//! Network side of the bridge: datagram streams and the two call directions

pub mod binding;
pub mod memory;
pub mod receiver;
pub mod sender;
pub mod strand;
pub mod stream;
pub mod udp;

pub use binding::{StreamBinder, StreamBinding};
pub use memory::MemoryStream;
pub use receiver::{FrameSource, Receiver, ReceiverHandle, ReceiverStats};
pub use sender::{Dispatch, Sender, SenderHandle, SenderStats};
pub use strand::Strand;
pub use stream::{DatagramStream, Reliability, ShutdownMode, SubscriptionId};
pub use udp::UdpStream;
