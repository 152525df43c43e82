//! Serial hardware transport on top of `tokio-serial`.
//!
//! The cabinet controller enumerates as a USB CDC device. Framing is 8N1
//! without flow control; opening the port toggles DTR, which resets the board.

use super::{LinkPort, PortProvider, PortReader, PortWriter, TransportError};
use crate::config::LinkSettings;
use async_trait::async_trait;
use tokio_serial::{
    DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialPortType, SerialStream, StopBits,
};
use tracing::{debug, info, warn};

/// Provides the configured serial port, or discovers one.
#[derive(Clone, Debug, Default)]
pub struct SerialPortProvider {
    port_path: Option<String>,
}

impl SerialPortProvider {
    pub fn new(port_path: Option<String>) -> Self {
        Self { port_path }
    }

    pub fn from_settings(settings: &LinkSettings) -> Self {
        Self::new(settings.port_path.clone())
    }
}

#[async_trait]
impl PortProvider for SerialPortProvider {
    fn is_supported(&self) -> bool {
        cfg!(any(unix, windows))
    }

    async fn request_port(&self) -> Result<Box<dyn LinkPort>, TransportError> {
        if !self.is_supported() {
            return Err(TransportError::Unsupported);
        }

        let path = match &self.port_path {
            Some(path) => path.clone(),
            None => discover_port()?,
        };

        info!("Using serial port {}", path);
        Ok(Box::new(SerialLinkPort::new(path)))
    }
}

/// Picks the first USB serial port, falling back to any port.
fn discover_port() -> Result<String, TransportError> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| TransportError::NoPort(format!("port enumeration failed: {}", e)))?;

    debug!("Found {} serial ports", ports.len());
    for port in &ports {
        debug!("  {} ({:?})", port.port_name, port.port_type);
    }

    ports
        .iter()
        .find(|port| matches!(port.port_type, SerialPortType::UsbPort(_)))
        .or_else(|| ports.first())
        .map(|port| port.port_name.clone())
        .ok_or_else(|| TransportError::NoPort("no serial ports found".to_string()))
}

/// One serial device path.
pub struct SerialLinkPort {
    path: String,
    stream: Option<SerialStream>,
    open: bool,
}

impl SerialLinkPort {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            stream: None,
            open: false,
        }
    }
}

#[async_trait]
impl LinkPort for SerialLinkPort {
    fn name(&self) -> &str {
        &self.path
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self, baud_rate: u32) -> Result<(), TransportError> {
        if self.open {
            return Err(TransportError::AlreadyOpen);
        }

        debug!("Opening {} at {} baud", self.path, baud_rate);
        let stream = tokio_serial::new(&self.path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(map_open_error)?;

        self.stream = Some(stream);
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.stream.take().is_some() {
            debug!("Dropped unsplit stream for {}", self.path);
        }
        self.open = false;
        Ok(())
    }

    fn take_streams(&mut self) -> Result<(PortReader, PortWriter), TransportError> {
        let stream = self.stream.take().ok_or(TransportError::NotOpen)?;
        let (reader, writer) = tokio::io::split(stream);
        Ok((Box::new(reader), Box::new(writer)))
    }
}

fn map_open_error(error: tokio_serial::Error) -> TransportError {
    let tokio_serial::Error { kind, description } = error;
    match kind {
        tokio_serial::ErrorKind::NoDevice => TransportError::NoPort(description),
        _ if is_busy_description(&description) => {
            warn!("Serial port busy: {}", description);
            TransportError::AlreadyOpen
        }
        tokio_serial::ErrorKind::Io(io_kind) => {
            TransportError::Io(std::io::Error::new(io_kind, description))
        }
        _ => TransportError::Other(description),
    }
}

// EBUSY on Unix, ERROR_ACCESS_DENIED on Windows.
fn is_busy_description(description: &str) -> bool {
    let lower = description.to_ascii_lowercase();
    lower.contains("busy") || lower.contains("access is denied") || lower.contains("already open")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_errors_map_to_already_open() {
        let error = tokio_serial::Error::new(
            tokio_serial::ErrorKind::Io(std::io::ErrorKind::Other),
            "Device or resource busy",
        );
        assert!(map_open_error(error).is_busy());

        let error = tokio_serial::Error::new(tokio_serial::ErrorKind::Unknown, "Access is denied.");
        assert!(map_open_error(error).is_busy());
    }

    #[test]
    fn missing_device_is_not_busy() {
        let error = tokio_serial::Error::new(tokio_serial::ErrorKind::NoDevice, "No such file");
        let mapped = map_open_error(error);
        assert!(matches!(mapped, TransportError::NoPort(_)));
        assert!(!mapped.is_busy());
    }

    #[tokio::test]
    async fn fresh_port_is_closed_and_cannot_split() {
        let mut port = SerialLinkPort::new("/dev/ttyACM9");
        assert_eq!(port.name(), "/dev/ttyACM9");
        assert!(!port.is_open());
        assert!(matches!(port.take_streams(), Err(TransportError::NotOpen)));
        assert!(port.close().await.is_ok());
    }

    #[tokio::test]
    async fn configured_path_is_used_without_discovery() {
        let provider = SerialPortProvider::new(Some("/dev/ttyUSB3".to_string()));
        if provider.is_supported() {
            let port = provider.request_port().await.unwrap();
            assert_eq!(port.name(), "/dev/ttyUSB3");
            assert!(!port.is_open());
        }
    }
}
