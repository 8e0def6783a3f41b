//! Error types for simulated network conditions.
//!
//! Only recoverable, network-like failures are expressed as errors. Misusing
//! the harness (unknown handles, foreign-thread access) is a programming
//! error and panics instead.

use thiserror::Error;

/// Simulated network conditions reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    /// No listener or reservation matched an outbound connection request.
    #[error("connection refused: no reservation for {host}:{port}")]
    ConnectionRefused {
        /// Requested host.
        host: String,
        /// Requested port.
        port: u16,
    },
    /// No datagram reservation matched the requested address.
    #[error("address unavailable: no datagram reservation for port {port}")]
    AddressUnavailable {
        /// Requested port.
        port: u16,
    },
    /// The port is already reserved or bound within this multiplexer.
    #[error("port {port} is already bound")]
    AlreadyBound {
        /// The contested port.
        port: u16,
    },
    /// A datagram payload exceeded the endpoint's configured maximum.
    #[error("datagram of {size} bytes exceeds the maximum of {max}")]
    MessageTooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// Configured maximum datagram size.
        max: usize,
    },
}

/// A type alias for `Result<T, MuxError>`.
pub type MuxResult<T> = Result<T, MuxError>;
