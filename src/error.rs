//! Error types for the messaging engine.

use std::fmt;

/// Errno value reported in error completions for cancelled operations.
pub const ECANCELED: i32 = 125;
/// Errno value reported when a transient resource shortage occurs.
pub const EAGAIN: i32 = 11;
/// Errno value reported for protocol violations.
pub const EPROTO: i32 = 71;
/// Errno value reported when a message does not fit the posted buffer.
pub const EMSGSIZE: i32 = 90;
/// Errno value reported for fatal peer errors with no better code.
pub const EIO: i32 = 5;

/// Error type for engine operations.
#[derive(Debug)]
pub enum Error {
    /// Transient resource exhaustion; the caller should retry later.
    Again,
    /// The operation was cancelled before completion.
    Cancelled,
    /// Receiver-not-ready backpressure from the lower transport.
    /// Never surfaced to the application; handled by backoff.
    Rnr,
    /// A wire packet or slot id violated the protocol.
    Protocol(String),
    /// The peer failed fatally; its outstanding operations are drained.
    PeerFatal { addr: u64, errno: i32 },
    /// Invalid packet type byte on the wire.
    InvalidPacketType(u8),
    /// Wire protocol version mismatch.
    InvalidVersion { expected: u8, got: u8 },
    /// Buffer too small to hold a header or payload.
    BufferTooSmall { required: usize, available: usize },
    /// Message exceeds a configured limit.
    MessageTooLarge { size: usize, max: usize },
    /// Scatter-gather list exceeds the per-operation limit.
    IovLimitExceeded { count: usize, limit: usize },
    /// No registered region matches the given key.
    UnknownRegion(u64),
    /// Invalid configuration.
    InvalidConfig(String),
}

impl Error {
    /// Map the error to the errno reported in error completions.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Again => EAGAIN,
            Error::Cancelled => ECANCELED,
            Error::Rnr => EAGAIN,
            Error::Protocol(_)
            | Error::InvalidPacketType(_)
            | Error::InvalidVersion { .. } => EPROTO,
            Error::PeerFatal { errno, .. } => *errno,
            Error::BufferTooSmall { .. } | Error::MessageTooLarge { .. } => EMSGSIZE,
            Error::IovLimitExceeded { .. }
            | Error::UnknownRegion(_)
            | Error::InvalidConfig(_) => EIO,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Again => write!(f, "resource temporarily unavailable"),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Rnr => write!(f, "receiver not ready"),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::PeerFatal { addr, errno } => {
                write!(f, "fatal error on peer {}: errno {}", addr, errno)
            }
            Error::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Error::InvalidVersion { expected, got } => {
                write!(f, "protocol version mismatch: expected {}, got {}", expected, got)
            }
            Error::BufferTooSmall { required, available } => {
                write!(
                    f,
                    "buffer too small: required {} bytes, available {} bytes",
                    required, available
                )
            }
            Error::MessageTooLarge { size, max } => {
                write!(f, "message too large: {} bytes, max {} bytes", size, max)
            }
            Error::IovLimitExceeded { count, limit } => {
                write!(f, "iov count {} exceeds limit {}", count, limit)
            }
            Error::UnknownRegion(key) => write!(f, "no registered region for key {:#x}", key),
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
