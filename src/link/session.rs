//! Port session with statum typestate for the open sequence.
//!
//! # State Machine
//!
//! ```text
//! Acquired ──open()──► Opened ──link()──► Linked ──close()
//!    │                   │
//!    └──── discard() ◄───┘   (any failure closes the handle)
//! ```
//!
//! Acquisition closes a handle that reports itself as already open and waits
//! for the platform to settle. Opening retries busy ports with a growing
//! backoff. Every delay observes the connect cancellation token so a
//! concurrent `disconnect()` can abort the sequence.

use super::error::ConnectError;
use crate::config::{LinkSettings, LinkTimings};
use crate::transport::{LinkPort, PortProvider, PortReader, PortWriter, TransportError};
use statum::{machine, state};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Acquired, // Handle granted, port closed
    Opened,   // Port open at the link baud rate
    Linked,   // Streams handed to the controller
}

#[machine]
pub struct PortSession<S: SessionState> {
    port: Box<dyn LinkPort>,
    baud_rate: u32,
    timings: LinkTimings,
}

impl<S: SessionState> PortSession<S> {
    pub fn port_name(&self) -> &str {
        self.port.name()
    }

    /// Closes the handle, swallowing errors.
    pub async fn discard(mut self) {
        if let Err(e) = self.port.close().await {
            debug!("Ignoring close error on {}: {}", self.port.name(), e);
        }
    }
}

impl PortSession<Acquired> {
    pub async fn acquire(
        provider: &dyn PortProvider,
        settings: &LinkSettings,
        cancel: &CancellationToken,
    ) -> Result<Self, ConnectError> {
        let mut port = provider
            .request_port()
            .await
            .map_err(ConnectError::Acquire)?;
        debug!("Acquired port handle {}", port.name());

        if port.is_open() {
            warn!(
                "Port {} appears to be open already, closing it first",
                port.name()
            );
            if let Err(e) = port.close().await {
                debug!("Ignoring close error on {}: {}", port.name(), e);
            }
            pause(settings.timings.open_settle(), cancel).await?;
        }

        Ok(Self::new(port, settings.baud_rate, settings.timings.clone()))
    }

    /// Opens the port, retrying while it reports busy.
    pub async fn open(
        mut self,
        cancel: &CancellationToken,
    ) -> Result<PortSession<Opened>, ConnectError> {
        let max_attempts = self.timings.max_open_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(
                "Opening {} at {} baud (attempt {}/{})",
                self.port.name(),
                self.baud_rate,
                attempt,
                max_attempts
            );

            let error = match self.port.open(self.baud_rate).await {
                Ok(()) => {
                    info!("Opened {} at {} baud", self.port.name(), self.baud_rate);
                    return Ok(self.transition());
                }
                Err(e) => e,
            };

            if !error.is_busy() {
                warn!("Failed to open {}: {}", self.port.name(), error);
                self.discard().await;
                return Err(ConnectError::Open(error));
            }

            if attempt >= max_attempts {
                warn!(
                    "Port {} still busy after {} attempts, giving up",
                    self.port.name(),
                    attempt
                );
                self.discard().await;
                return Err(ConnectError::PortBusy { attempts: attempt });
            }

            let backoff = self.timings.busy_backoff(attempt);
            warn!(
                "Port {} is busy (attempt {}/{}), retrying in {}ms",
                self.port.name(),
                attempt,
                max_attempts,
                backoff.as_millis()
            );

            if let Err(e) = self.wait_for_release(backoff, cancel).await {
                self.discard().await;
                return Err(e);
            }
        }
    }

    async fn wait_for_release(
        &mut self,
        backoff: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectError> {
        pause(backoff, cancel).await?;
        if let Err(e) = self.port.close().await {
            debug!("Close before retry failed on {}: {}", self.port.name(), e);
        }
        pause(self.timings.busy_close_wait(), cancel).await
    }
}

impl PortSession<Opened> {
    /// Takes the read and write halves and hands the session to the controller.
    pub async fn link(
        mut self,
    ) -> Result<(PortSession<Linked>, PortReader, PortWriter), ConnectError> {
        match self.port.take_streams() {
            Ok((reader, writer)) => Ok((self.transition(), reader, writer)),
            Err(e) => {
                warn!("Port {} gave no streams: {}", self.port.name(), e);
                self.discard().await;
                Err(ConnectError::Open(e))
            }
        }
    }
}

impl PortSession<Linked> {
    pub async fn close(mut self) -> Result<(), TransportError> {
        let result = self.port.close().await;
        match &result {
            Ok(()) => info!("Closed {}", self.port.name()),
            Err(e) => warn!("Failed to close {}: {}", self.port.name(), e),
        }
        result
    }
}

/// Sleeps unless the connect attempt is cancelled first.
pub(crate) async fn pause(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), ConnectError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ConnectError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
