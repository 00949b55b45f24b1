//! Error types for the voice bridge
//!
//! Every error maps onto one [`FaultKind`], which decides how the bridge
//! reacts: protocol faults abort the read direction, device faults leave the
//! hardware disabled, encode faults drop one period of capture.

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Packet dump error: {0}")]
    Dump(#[from] DumpError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio device errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Device is not open")]
    NotOpen,

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: expected {expected} samples, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },

    #[error("Short decode: expected {expected} samples, decoded {actual}")]
    ShortDecode { expected: usize, actual: usize },
}

/// Transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Stream is shut down for writing")]
    WriteShutdown,

    #[error("Reliable delivery is not supported by this transport")]
    ReliableUnsupported,
}

/// Malformed or undecodable payloads
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Packet of {actual} bytes is shorter than its {expected}-byte header")]
    Truncated { expected: usize, actual: usize },

    #[error("Packet carries no codec payload")]
    EmptyPayload,

    #[error("Undecodable payload: {0}")]
    Undecodable(#[source] CodecError),
}

/// Packet dump recording and replay errors
#[derive(Error, Debug)]
pub enum DumpError {
    #[error("Dump writer thread panicked")]
    WriterPanicked,

    #[error("Failed to write dump record: {0}")]
    Encode(String),

    #[error("Corrupt dump record: {0}")]
    Corrupt(String),
}

/// Fault classes and the policy attached to each
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Malformed or short-decoded payload: abort the read direction
    Protocol,
    /// Device open/start/stop failure: log and leave hardware disabled
    Device,
    /// Encoder failure: drop this period's frame
    Encode,
    /// Buffer length differs from the negotiated frame size
    FrameSize,
    /// Transport failure on one datagram
    Transport,
    /// Bad configuration or I/O outside the audio path
    Config,
    /// Packet recording or replay failed; the call itself is unaffected
    Dump,
}

impl Error {
    /// Classify this error
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            Error::Audio(_) => FaultKind::Device,
            Error::Codec(CodecError::InvalidFrameSize { .. }) => FaultKind::FrameSize,
            Error::Codec(CodecError::DecodingFailed(_)) | Error::Codec(CodecError::ShortDecode { .. }) => {
                FaultKind::Protocol
            }
            Error::Codec(_) => FaultKind::Encode,
            Error::Network(_) => FaultKind::Transport,
            Error::Protocol(_) => FaultKind::Protocol,
            Error::Dump(_) => FaultKind::Dump,
            Error::Config(_) | Error::Io(_) => FaultKind::Config,
        }
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_kinds() {
        let err: Error = CodecError::InvalidFrameSize { expected: 480, actual: 479 }.into();
        assert_eq!(err.fault_kind(), FaultKind::FrameSize);

        let err: Error = CodecError::EncodingFailed("bad".into()).into();
        assert_eq!(err.fault_kind(), FaultKind::Encode);

        let err: Error = ProtocolError::Truncated { expected: 8, actual: 3 }.into();
        assert_eq!(err.fault_kind(), FaultKind::Protocol);

        let err: Error = AudioError::DeviceNotFound("none".into()).into();
        assert_eq!(err.fault_kind(), FaultKind::Device);

        let err: Error = DumpError::Corrupt("bad tag".into()).into();
        assert_eq!(err.fault_kind(), FaultKind::Dump);
    }
}
