//! Prologix-style GPIB controller on a serial line.
//!
//! The controller multiplexes its own `++` commands and instrument traffic on
//! one byte stream:
//!
//! - Instrument data is sent with CR, LF, ESC and `+` escaped by a leading ESC,
//!   followed by an unescaped LF.
//! - `++read <char>` / `++read eoi` asks the controller to address the
//!   instrument to talk and forward its bytes.
//! - `++spoll` returns the serial-poll status byte as decimal text.
//!
//! The transport is generic over the stream so it can be exercised against an
//! in-memory duplex pipe.

use super::BusTransport;
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, trace};

const ESC: u8 = 0x1B;

/// Serial and bus settings for a Prologix controller.
#[derive(Clone, Debug)]
pub struct PrologixConfig {
    /// Serial device (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate of the controller's serial side
    pub baud_rate: u32,
    /// GPIB primary address of the instrument (0-30)
    pub address: u8,
}

/// [`BusTransport`] talking through a Prologix GPIB controller.
pub struct PrologixTransport<S = SerialStream> {
    stream: S,
    address: u8,
    buffer: Vec<u8>,
}

impl PrologixTransport<SerialStream> {
    /// Open the serial port and put the controller into controller mode
    /// addressed at `config.address`.
    pub async fn open(config: &PrologixConfig) -> Result<Self, TransportError> {
        let stream = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| TransportError::Io(e.into()))?;

        debug!(port = %config.port, address = config.address, "Opened Prologix controller");
        Self::with_stream(stream, config.address).await
    }
}

impl<S> PrologixTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already-open stream and configure the controller.
    pub async fn with_stream(stream: S, address: u8) -> Result<Self, TransportError> {
        if address > 30 {
            return Err(TransportError::Protocol(format!(
                "GPIB address {address} out of range (0-30)"
            )));
        }
        let mut transport = Self {
            stream,
            address,
            buffer: Vec::with_capacity(256),
        };
        for setup in ["++mode 1", "++auto 0", "++eoi 1", "++eos 3"] {
            transport.controller(setup).await?;
        }
        transport.controller(&format!("++addr {address}")).await?;
        Ok(transport)
    }

    /// GPIB address this transport talks to.
    pub fn address(&self) -> u8 {
        self.address
    }

    async fn controller(&mut self, command: &str) -> Result<(), TransportError> {
        trace!(command, "Prologix controller command");
        self.stream.write_all(command.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Pull bytes into the buffer until `done` accepts it or `timeout` expires.
    async fn fill_until<F>(&mut self, timeout: Duration, done: F) -> Result<usize, TransportError>
    where
        F: Fn(&[u8]) -> Option<usize>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut chunk = [0u8; 256];
        loop {
            if let Some(end) = done(&self.buffer) {
                return Ok(end);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(timeout));
            }
            match tokio::time::timeout(remaining, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(TransportError::Closed),
                Ok(Ok(n)) => self.buffer.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(TransportError::Io(e)),
                Err(_) => return Err(TransportError::Timeout(timeout)),
            }
        }
    }
}

/// Escape instrument data for the controller.
pub(crate) fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    for &byte in data {
        if matches!(byte, b'\r' | b'\n' | ESC | b'+') {
            out.push(ESC);
        }
        out.push(byte);
    }
    out.push(b'\n');
    out
}

#[async_trait]
impl<S> BusTransport for PrologixTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(&escape(data)).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_until(
        &mut self,
        terminator: u8,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        self.controller(&format!("++read {terminator}")).await?;
        let end = self
            .fill_until(timeout, |buf| buf.iter().position(|b| *b == terminator))
            .await?;
        Ok(self.buffer.drain(..=end).collect::<Vec<u8>>().into())
    }

    async fn read_n(&mut self, n: usize, timeout: Duration) -> Result<Bytes, TransportError> {
        if self.buffer.len() < n {
            self.controller("++read eoi").await?;
        }
        self.fill_until(timeout, |buf| (buf.len() >= n).then_some(n))
            .await?;
        Ok(self.buffer.drain(..n).collect::<Vec<u8>>().into())
    }

    async fn serial_poll(&mut self, timeout: Duration) -> Result<u8, TransportError> {
        self.controller("++spoll").await?;
        let end = self
            .fill_until(timeout, |buf| buf.iter().position(|b| *b == b'\n'))
            .await?;
        let line: Vec<u8> = self.buffer.drain(..=end).collect();
        let text = String::from_utf8_lossy(&line);
        text.trim()
            .parse::<u8>()
            .map_err(|_| TransportError::Protocol(format!("bad ++spoll reply '{}'", text.trim())))
    }

    fn describe(&self) -> String {
        format!("prologix@{}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_control_bytes() {
        assert_eq!(escape(b"FRQ 1 HZ\r\n"), b"FRQ 1 HZ\x1b\r\x1b\n\n".to_vec());
        assert_eq!(escape(b"+1"), b"\x1b+1\n".to_vec());
    }

    #[tokio::test]
    async fn test_spoll_and_line_read() {
        let (client, mut device) = tokio::io::duplex(1024);
        let mut transport = PrologixTransport::with_stream(client, 7).await.unwrap();

        device.write_all(b"36\r\n").await.unwrap();
        let status = transport
            .serial_poll(Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(status, 0x24);

        device.write_all(b"+1.000E+0\r\n").await.unwrap();
        let line = transport
            .read_line(Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(&line[..], b"+1.000E+0\r\n");

        let mut sent = vec![0u8; 512];
        let n = device.read(&mut sent).await.unwrap();
        let sent = String::from_utf8_lossy(&sent[..n]);
        assert!(sent.contains("++addr 7\n"));
        assert!(sent.contains("++spoll\n"));
    }

    #[tokio::test]
    async fn test_rejects_bad_address() {
        let (client, _device) = tokio::io::duplex(64);
        assert!(PrologixTransport::with_stream(client, 31).await.is_err());
    }
}
