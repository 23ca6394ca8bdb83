//! Bus transport capability set
//!
//! The engine never opens sockets or serial lines itself. It drives whatever
//! implements [`BusTransport`]: four blocking-with-timeout primitives that move
//! bytes between the controller and one addressed instrument.
//!
//! - [`MockTransport`] - scriptable in-memory transport that records every call
//! - [`PrologixTransport`] - GPIB controller on a serial line (`instrument_serial`)

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod prologix;

pub use mock::{BusCall, MockHandle, MockReply, MockTransport};
#[cfg(feature = "instrument_serial")]
pub use prologix::{PrologixConfig, PrologixTransport};

/// Primitive bus operations for one instrument connection.
///
/// Every read takes an explicit timeout; running past it is reported as
/// [`TransportError::Timeout`], which callers treat as recoverable.
///
/// Implementations are driven exclusively by the holder of the
/// [`BusLock`](crate::bus::BusLock), so they need `Send` but not `Sync`.
#[async_trait]
pub trait BusTransport: Send {
    /// Write raw bytes. No response is expected.
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read until (and including) `terminator`.
    async fn read_until(
        &mut self,
        terminator: u8,
        timeout: Duration,
    ) -> Result<Bytes, TransportError>;

    /// Read exactly `n` bytes.
    async fn read_n(&mut self, n: usize, timeout: Duration) -> Result<Bytes, TransportError>;

    /// Serial-poll the instrument for its status byte.
    async fn serial_poll(&mut self, timeout: Duration) -> Result<u8, TransportError>;

    /// Read one newline-terminated line.
    async fn read_line(&mut self, timeout: Duration) -> Result<Bytes, TransportError> {
        self.read_until(b'\n', timeout).await
    }

    /// Short description for logs.
    fn describe(&self) -> String {
        "bus".to_string()
    }
}

#[async_trait]
impl<T: BusTransport + ?Sized> BusTransport for Box<T> {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write(data).await
    }

    async fn read_until(
        &mut self,
        terminator: u8,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        (**self).read_until(terminator, timeout).await
    }

    async fn read_n(&mut self, n: usize, timeout: Duration) -> Result<Bytes, TransportError> {
        (**self).read_n(n, timeout).await
    }

    async fn serial_poll(&mut self, timeout: Duration) -> Result<u8, TransportError> {
        (**self).serial_poll(timeout).await
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<Bytes, TransportError> {
        (**self).read_line(timeout).await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
