//! In-memory device for driving the link in tests.
//!
//! Every successful open creates a fresh `tokio::io::duplex` pair: the host end
//! goes to the controller, the device end is parked in [`MockDevice`] until a
//! test takes it with [`MockDevice::take_peer`].

use super::{LinkPort, PortProvider, PortReader, PortWriter, TransportError};
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadBuf, ReadHalf,
    WriteHalf,
};
use tokio::time::Instant;

const DUPLEX_CAPACITY: usize = 4096;

#[derive(Default)]
struct DeviceState {
    open: bool,
    busy_opens: u32,
    open_failure: Option<String>,
    open_attempts: Vec<Instant>,
    close_calls: u32,
    duplex_capacity: Option<usize>,
    read_failure: bool,
    peer: Option<DuplexStream>,
}

/// Scriptable stand-in for the cabinet controller.
#[derive(Default)]
pub(crate) struct MockDevice {
    state: Mutex<DeviceState>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `count` opens fail as if the port were locked.
    pub fn busy_for(&self, count: u32) {
        self.state().busy_opens = count;
    }

    /// Every open fails with a non-retryable error.
    pub fn fail_open_with(&self, message: &str) {
        self.state().open_failure = Some(message.to_string());
    }

    /// Pretend a previous session left the port open.
    pub fn leave_open(&self) {
        self.state().open = true;
    }

    /// Host writes block once `bytes` are buffered and the peer is not reading.
    pub fn stall_writes_after(&self, bytes: usize) {
        self.state().duplex_capacity = Some(bytes);
    }

    /// The host read half fails the next time it is polled.
    pub fn fail_reads(&self) {
        self.state().read_failure = true;
    }

    pub fn is_open(&self) -> bool {
        self.state().open
    }

    pub fn open_attempts(&self) -> Vec<Instant> {
        self.state().open_attempts.clone()
    }

    pub fn close_calls(&self) -> u32 {
        self.state().close_calls
    }

    pub fn take_peer(&self) -> Option<MockPeer> {
        self.state().peer.take().map(MockPeer::new)
    }
}

pub(crate) struct MockProvider {
    device: Arc<MockDevice>,
    supported: bool,
}

impl MockProvider {
    pub fn new(device: Arc<MockDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            supported: true,
        })
    }

    pub fn unsupported() -> Arc<Self> {
        Arc::new(Self {
            device: MockDevice::new(),
            supported: false,
        })
    }
}

#[async_trait]
impl PortProvider for MockProvider {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn request_port(&self) -> Result<Box<dyn LinkPort>, TransportError> {
        Ok(Box::new(MockPort {
            device: self.device.clone(),
            host: None,
        }))
    }
}

struct MockPort {
    device: Arc<MockDevice>,
    host: Option<DuplexStream>,
}

#[async_trait]
impl LinkPort for MockPort {
    fn name(&self) -> &str {
        "mock0"
    }

    fn is_open(&self) -> bool {
        self.device.is_open()
    }

    async fn open(&mut self, _baud_rate: u32) -> Result<(), TransportError> {
        let mut state = self.device.state();
        state.open_attempts.push(Instant::now());

        if state.busy_opens > 0 {
            state.busy_opens -= 1;
            return Err(TransportError::AlreadyOpen);
        }
        if let Some(message) = &state.open_failure {
            return Err(TransportError::Other(message.clone()));
        }
        if state.open {
            return Err(TransportError::AlreadyOpen);
        }

        let capacity = state.duplex_capacity.unwrap_or(DUPLEX_CAPACITY);
        let (host, device) = tokio::io::duplex(capacity);
        self.host = Some(host);
        state.peer = Some(device);
        state.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.device.state();
        state.close_calls += 1;
        state.open = false;
        self.host = None;
        Ok(())
    }

    fn take_streams(&mut self) -> Result<(PortReader, PortWriter), TransportError> {
        let host = self.host.take().ok_or(TransportError::NotOpen)?;
        let (reader, writer) = tokio::io::split(host);
        let reader = MockReader {
            device: self.device.clone(),
            inner: reader,
        };
        Ok((Box::new(reader), Box::new(writer)))
    }
}

/// Host read half that can be made to fail on demand.
struct MockReader {
    device: Arc<MockDevice>,
    inner: ReadHalf<DuplexStream>,
}

impl AsyncRead for MockReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.device.state().read_failure {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "device unplugged",
            )));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Device end of the wire, speaking whole lines.
pub(crate) struct MockPeer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl MockPeer {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    pub async fn send(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn next_raw_line(&mut self) -> Option<String> {
        self.lines.next_line().await.unwrap()
    }

    /// Next line from the host, skipping keepalive pings.
    pub async fn next_line(&mut self) -> Option<String> {
        while let Some(line) = self.lines.next_line().await.unwrap() {
            if line != "PING" {
                return Some(line);
            }
        }
        None
    }
}
