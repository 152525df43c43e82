//! # Transport Seam
//!
//! Abstracts how the link obtains and opens a byte-stream port so the
//! controller can run against real hardware ([`serial`]) or an in-memory
//! device in tests.
//!
//! ```text
//! PortProvider ──request_port()──► LinkPort ──open()──► (PortReader, PortWriter)
//! ```
//!
//! A provider hands out port handles; a port is opened at a baud rate and then
//! gives up its read and write halves exactly once. The controller owns the
//! handle and both halves for the lifetime of a connection.

pub mod serial;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Read half of an opened port.
pub type PortReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of an opened port.
pub type PortWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors reported by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial transport is not supported on this platform")]
    Unsupported,

    #[error("no serial port available: {0}")]
    NoPort(String),

    /// The port is held open by this or another process.
    #[error("port is already open or locked")]
    AlreadyOpen,

    #[error("port is not open")]
    NotOpen,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether an open attempt failing with this error is worth retrying.
    pub fn is_busy(&self) -> bool {
        matches!(self, TransportError::AlreadyOpen)
    }
}

/// Grants port handles, like a device picker.
#[async_trait]
pub trait PortProvider: Send + Sync {
    /// Whether this platform can provide serial ports at all.
    fn is_supported(&self) -> bool;

    /// Acquires a handle to the port the link should use.
    async fn request_port(&self) -> Result<Box<dyn LinkPort>, TransportError>;
}

/// A single port handle.
#[async_trait]
pub trait LinkPort: Send {
    fn name(&self) -> &str;

    /// Best-effort view of the handle's own bookkeeping.
    fn is_open(&self) -> bool;

    async fn open(&mut self, baud_rate: u32) -> Result<(), TransportError>;

    /// Closes the port. Closing a port that is not open succeeds.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Hands out the read and write halves of an open port. Fails with
    /// [`TransportError::NotOpen`] if the port is closed or already split.
    fn take_streams(&mut self) -> Result<(PortReader, PortWriter), TransportError>;
}
