//! # Transport Abstraction
//!
//! A minimal, async interface for moving call frames to an RPC server.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about frames, records or
//!   errno words. It moves opaque buffers.
//! - **Request-Response**: one request, one reply, per server in issue order.
//!   There is no retransmit and no mid-flight abort; the deadline is the
//!   only cancellation.

use std::fmt;
use std::time::Duration;

/// Addresses one RPC server session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerId {
    pub agent: String,
    pub server: String,
    pub sid: u32,
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.agent, self.server, self.sid)
    }
}

/// Errors that occur at the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The server is unreachable or went away mid-call.
    ConnectionLost(String),
    /// The deadline passed before a reply arrived.
    Timeout,
    /// The remote side rejected the payload size.
    PayloadTooLarge,
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Timeout => write!(f, "Request timed out"),
            Self::PayloadTooLarge => write!(f, "Payload too large for transport"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A mechanism to send a call frame to one server and receive its reply.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends `request` to `server` and waits at most `deadline` for the reply.
    ///
    /// # Invariants
    /// - Must return `Ok(vec)` with the raw reply bytes on success.
    /// - Must return `Err(Error::Timeout)` once the deadline has passed.
    /// - Should not interpret the payload content.
    async fn exchange(&self, server: &ServerId, request: &[u8], deadline: Duration) -> Result<Vec<u8>>;
}
