//! Error types of the link.
//!
//! Only [`ConnectError`] ever reaches the consumer. Failures after a connection
//! is up surface as status transitions; [`LinkError`] stays internal to sends,
//! which are best-effort.

use crate::transport::TransportError;
use thiserror::Error;

/// Why `connect()` failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("serial transport is not supported on this platform")]
    Unsupported,

    #[error("port is busy after {attempts} open attempts; close any other program using it")]
    PortBusy { attempts: u32 },

    #[error("failed to acquire a serial port: {0}")]
    Acquire(#[source] TransportError),

    #[error("failed to open serial port: {0}")]
    Open(#[source] TransportError),

    #[error("connect was cancelled by disconnect")]
    Cancelled,

    #[error("connection dropped while waiting for the device to boot")]
    LostDuringBoot,
}

/// Failure of a single outbound write.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,

    #[error("write failed: {0}")]
    Write(#[from] std::io::Error),

    #[error("write timed out")]
    WriteTimeout,
}
