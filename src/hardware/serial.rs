//! Serial transport shared by every instrument driver.
//!
//! Each transaction follows the same sequence:
//!
//! 1. take the lease for the physical port from [`PortLocks`],
//! 2. open the port fresh through a [`PortOpener`] (no connection reuse),
//! 3. drain stale input, write the request, read the response under the
//!    operation timeout,
//! 4. drop the port (close) and release the lease.
//!
//! Any `AsyncRead + AsyncWrite` stream can stand in for a port, which lets
//! tests drive drivers through `tokio::io::duplex`.

use crate::config::Timing;
use crate::error::ChannelError;
use crate::hardware::crc;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

// =============================================================================
// Port abstraction
// =============================================================================

/// Anything usable as a serial port.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Opens a physical port by name.
#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self, port: &str) -> Result<DynSerial, ChannelError>;
}

/// Opens real ports with tokio-serial, 8N1 without flow control.
#[cfg(feature = "serial")]
#[derive(Debug, Clone)]
pub struct TokioSerialOpener {
    baud_rate: u32,
}

#[cfg(feature = "serial")]
impl TokioSerialOpener {
    /// Opener for ports at `baud_rate`.
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl PortOpener for TokioSerialOpener {
    async fn open(&self, port: &str) -> Result<DynSerial, ChannelError> {
        use tokio::task::spawn_blocking;
        use tokio_serial::SerialPortBuilderExt;

        let path = port.to_string();
        let baud_rate = self.baud_rate;

        let stream = spawn_blocking(move || {
            tokio_serial::new(&path, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
        })
        .await
        .map_err(|e| ChannelError::transport(port, e))?
        .map_err(|e| ChannelError::transport(port, e))?;

        Ok(Box::new(stream))
    }
}

/// Read and discard whatever is already buffered on the port.
///
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin + ?Sized>(
    port: &mut R,
    window: Duration,
) -> usize {
    let mut discard = [0u8; 256];
    let deadline = Instant::now() + window;
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    total_discarded
}

// =============================================================================
// Port leases
// =============================================================================

/// How long to wait for a busy port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    /// Interval between lease attempts.
    pub poll: Duration,
    /// Attempts before the port is reported busy.
    pub wait_attempts: u32,
    /// A lease older than this is considered lost.
    pub lease_timeout: Duration,
}

impl LeasePolicy {
    /// Policy from the configured timing.
    pub fn from_timing(timing: &Timing) -> Self {
        Self {
            poll: timing.port_poll,
            wait_attempts: timing.port_wait_attempts,
            lease_timeout: timing.lease_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    id: u64,
    acquired: Instant,
}

/// One lease per physical port, shared by every link that uses it.
#[derive(Debug, Clone, Default)]
pub struct PortLocks {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
    next_id: Arc<AtomicU64>,
}

enum TryLease {
    Taken(u64),
    Held { age: Duration },
}

impl PortLocks {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the port to become free, taking over expired leases and
    /// force-releasing the port after the last poll.
    pub async fn acquire(&self, port: &str, policy: &LeasePolicy) -> PortGuard {
        for attempt in 0..=policy.wait_attempts {
            match self.try_take(port, policy.lease_timeout) {
                TryLease::Taken(id) => return self.guard(port, id),
                TryLease::Held { age } => {
                    if attempt == policy.wait_attempts {
                        warn!(port, held_for = ?age, "port still in use, forcing release");
                        break;
                    }
                    debug!(port, attempt, "port in use, waiting");
                    sleep(policy.poll).await;
                }
            }
        }

        let id = self.insert(port);
        self.guard(port, id)
    }

    /// Whether a lease is currently held on `port`.
    pub fn is_held(&self, port: &str) -> bool {
        self.lock().contains_key(port)
    }

    fn try_take(&self, port: &str, lease_timeout: Duration) -> TryLease {
        let mut leases = self.lock();
        if let Some(lease) = leases.get(port) {
            let age = lease.acquired.elapsed();
            if age < lease_timeout {
                return TryLease::Held { age };
            }
            warn!(port, held_for = ?age, "lease expired, taking over port");
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        leases.insert(
            port.to_string(),
            Lease {
                id,
                acquired: Instant::now(),
            },
        );
        TryLease::Taken(id)
    }

    fn insert(&self, port: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(
            port.to_string(),
            Lease {
                id,
                acquired: Instant::now(),
            },
        );
        id
    }

    fn guard(&self, port: &str, id: u64) -> PortGuard {
        PortGuard {
            locks: self.clone(),
            port: port.to_string(),
            id,
        }
    }

    fn release(&self, port: &str, id: u64) {
        let mut leases = self.lock();
        if leases.get(port).is_some_and(|lease| lease.id == id) {
            leases.remove(port);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Lease>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases its lease on drop, unless the lease was taken over meanwhile.
#[derive(Debug)]
pub struct PortGuard {
    locks: PortLocks,
    port: String,
    id: u64,
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        self.locks.release(&self.port, self.id);
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// Response framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Text terminated by `\n`.
    Line,
    /// MODBUS RTU reply to a write-coil request (0x05 / 0x0F) or an exception.
    Modbus,
}

const MAX_LINE: usize = 256;
const DRAIN_WINDOW: Duration = Duration::from_millis(10);

/// One logical instrument bound to one physical port.
#[derive(Clone)]
pub struct SerialLink {
    name: &'static str,
    port: String,
    opener: Arc<dyn PortOpener>,
    locks: PortLocks,
    policy: LeasePolicy,
    timeout: Duration,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("name", &self.name)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SerialLink {
    /// Link named `name` for log lines, with a per-transaction `timeout`.
    pub fn new(
        name: &'static str,
        port: impl Into<String>,
        opener: Arc<dyn PortOpener>,
        locks: PortLocks,
        policy: LeasePolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            name,
            port: port.into(),
            opener,
            locks,
            policy,
            timeout,
        }
    }

    /// Port name.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Reply timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open, write `request`, close. For commands that have no reply.
    pub async fn send(&self, request: &[u8]) -> Result<(), ChannelError> {
        let _lease = self.locks.acquire(&self.port, &self.policy).await;
        let port = self.open_and_write(request, ResponseKind::Line).await?;
        drop(port);
        Ok(())
    }

    /// Open, write `request`, read one response, close.
    pub async fn transact(
        &self,
        request: &[u8],
        kind: ResponseKind,
    ) -> Result<Vec<u8>, ChannelError> {
        let _lease = self.locks.acquire(&self.port, &self.policy).await;
        let mut port = self.open_and_write(request, kind).await?;

        let response = timeout(self.timeout, read_response(&mut port, kind))
            .await
            .map_err(|_| self.timed_out())?
            .map_err(|e| match e {
                ReadError::Io(e) => ChannelError::transport(&self.port, e),
                ReadError::Invalid(message) => ChannelError::Validation(message),
            })?;
        debug!(
            instrument = self.name,
            port = %self.port,
            response = %printable(&response, kind),
            "received"
        );

        drop(port);
        Ok(response)
    }

    async fn open_and_write(
        &self,
        request: &[u8],
        kind: ResponseKind,
    ) -> Result<DynSerial, ChannelError> {
        let mut port = timeout(self.timeout, self.opener.open(&self.port))
            .await
            .map_err(|_| self.timed_out())??;

        let stale = drain_serial_buffer(&mut port, DRAIN_WINDOW).await;
        if stale > 0 {
            debug!(port = %self.port, stale, "discarded stale input");
        }

        port.write_all(request)
            .await
            .map_err(|e| ChannelError::transport(&self.port, e))?;
        port.flush()
            .await
            .map_err(|e| ChannelError::transport(&self.port, e))?;
        debug!(
            instrument = self.name,
            port = %self.port,
            request = %printable(request, kind),
            "sent"
        );
        Ok(port)
    }

    fn timed_out(&self) -> ChannelError {
        ChannelError::Timeout {
            operation: self.name,
            after: self.timeout,
        }
    }
}

enum ReadError {
    Io(std::io::Error),
    Invalid(String),
}

impl From<std::io::Error> for ReadError {
    fn from(err: std::io::Error) -> Self {
        ReadError::Io(err)
    }
}

async fn read_response<R: AsyncRead + Unpin + ?Sized>(
    port: &mut R,
    kind: ResponseKind,
) -> Result<Vec<u8>, ReadError> {
    match kind {
        ResponseKind::Line => {
            let mut line = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                port.read_exact(&mut byte).await?;
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    return Ok(line);
                }
                if line.len() >= MAX_LINE {
                    return Err(ReadError::Invalid(format!(
                        "line exceeds {} bytes without terminator",
                        MAX_LINE
                    )));
                }
            }
        }
        ResponseKind::Modbus => {
            let mut frame = vec![0u8; 2];
            port.read_exact(&mut frame).await?;
            let function = frame[1];
            let total = if function & crc::EXCEPTION_FLAG != 0 {
                5
            } else if function == 0x05 || function == 0x0F {
                8
            } else {
                return Err(ReadError::Invalid(format!(
                    "unrecognized function code 0x{:02X}",
                    function
                )));
            };
            frame.resize(total, 0);
            port.read_exact(&mut frame[2..]).await?;
            Ok(frame)
        }
    }
}

fn printable(bytes: &[u8], kind: ResponseKind) -> String {
    match kind {
        ResponseKind::Line => String::from_utf8_lossy(bytes).trim_end().to_string(),
        ResponseKind::Modbus => crc::hex(bytes),
    }
}
