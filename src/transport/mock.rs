//! Mock bus transport for testing without hardware.
//!
//! `MockTransport` keeps an inbound byte stream, a queue of status bytes and a
//! log of every primitive called on it. Tests script the instrument either by
//! pushing replies up front or by installing a responder closure that answers
//! each write, the way a real instrument would.
//!
//! # Example
//!
//! ```rust,ignore
//! let transport = MockTransport::new();
//! let handle = transport.handle();
//! handle.set_responder(|cmd| match cmd.trim() {
//!     "CST" => vec![MockReply::line(SETTINGS_LINE)],
//!     _ => vec![],
//! });
//! let instrument = Instrument::connect("fg", Box::new(transport), model, timeouts).await?;
//! assert_eq!(handle.writes()[0], "CST\r\n");
//! ```

use super::BusTransport;
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// One primitive call observed by the mock, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCall {
    /// Bytes written to the instrument
    Write(Vec<u8>),
    /// Read until the given terminator byte
    ReadUntil(u8),
    /// Read an exact byte count
    ReadN(usize),
    /// Serial poll
    SerialPoll,
}

/// Something the simulated instrument makes available to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Bytes appended to the inbound stream
    Data(Bytes),
    /// Status byte returned by the next serial poll
    Status(u8),
}

impl MockReply {
    /// A text line terminated with `\r\n`.
    pub fn line(text: &str) -> Self {
        MockReply::Data(Bytes::from(format!("{text}\r\n")))
    }

    /// Raw bytes, no terminator added.
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        MockReply::Data(data.into())
    }
}

type Responder = Box<dyn FnMut(&str) -> Vec<MockReply> + Send>;

#[derive(Default)]
struct MockState {
    calls: Vec<BusCall>,
    recorded: usize,
    inbound: VecDeque<u8>,
    status: VecDeque<u8>,
    idle_status: u8,
    failing_calls: HashSet<usize>,
    responder: Option<Responder>,
    latency: Duration,
}

impl MockState {
    /// Record a call and report whether it was scripted to fail.
    fn record(&mut self, call: BusCall) -> bool {
        let index = self.recorded;
        self.recorded += 1;
        self.calls.push(call);
        self.failing_calls.contains(&index)
    }

    fn accept(&mut self, replies: Vec<MockReply>) {
        for reply in replies {
            match reply {
                MockReply::Data(data) => self.inbound.extend(data.iter().copied()),
                MockReply::Status(byte) => self.status.push_back(byte),
            }
        }
    }
}

/// In-memory [`BusTransport`] with call recording and scripted replies.
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

/// Test-side handle sharing state with a [`MockTransport`] that has been moved
/// into an instrument.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create an idle mock with no scripted replies.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Handle for scripting and inspecting the mock after it is moved.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: self.state.clone(),
        }
    }

    async fn simulate_latency(&self) {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn injected_fault() -> TransportError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "injected bus fault",
    ))
}

#[async_trait]
impl BusTransport for MockTransport {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        if state.record(BusCall::Write(data.to_vec())) {
            return Err(injected_fault());
        }
        let text = String::from_utf8_lossy(data).into_owned();
        if let Some(mut responder) = state.responder.take() {
            let replies = responder(&text);
            state.responder = Some(responder);
            state.accept(replies);
        }
        Ok(())
    }

    async fn read_until(
        &mut self,
        terminator: u8,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        if state.record(BusCall::ReadUntil(terminator)) {
            return Err(injected_fault());
        }
        match state.inbound.iter().position(|b| *b == terminator) {
            Some(end) => Ok(state.inbound.drain(..=end).collect::<Vec<u8>>().into()),
            None => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn read_n(&mut self, n: usize, timeout: Duration) -> Result<Bytes, TransportError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        if state.record(BusCall::ReadN(n)) {
            return Err(injected_fault());
        }
        if state.inbound.len() < n {
            return Err(TransportError::Timeout(timeout));
        }
        Ok(state.inbound.drain(..n).collect::<Vec<u8>>().into())
    }

    async fn serial_poll(&mut self, _timeout: Duration) -> Result<u8, TransportError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        if state.record(BusCall::SerialPoll) {
            return Err(injected_fault());
        }
        let idle = state.idle_status;
        Ok(state.status.pop_front().unwrap_or(idle))
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

impl MockHandle {
    /// Answer every write through `responder`.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&str) -> Vec<MockReply> + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
    }

    /// Queue a reply without waiting for a write.
    pub fn push(&self, reply: MockReply) {
        self.state.lock().accept(vec![reply]);
    }

    /// Status byte returned when no status is queued.
    pub fn set_idle_status(&self, status: u8) {
        self.state.lock().idle_status = status;
    }

    /// Make the call with this zero-based index fail with an I/O error.
    /// Indices count every call since the mock was created.
    pub fn fail_call(&self, index: usize) {
        self.state.lock().failing_calls.insert(index);
    }

    /// Delay every primitive by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// All calls so far.
    pub fn calls(&self) -> Vec<BusCall> {
        self.state.lock().calls.clone()
    }

    /// Number of calls so far.
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Written payloads as text, in order.
    pub fn writes(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BusCall::Write(data) => Some(String::from_utf8_lossy(data).into_owned()),
                _ => None,
            })
            .collect()
    }

    /// Forget the call log (scripted faults keep their absolute indices).
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Bytes still waiting to be read.
    pub fn pending_bytes(&self) -> usize {
        self.state.lock().inbound.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_responder_feeds_reads() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        handle.set_responder(|cmd| {
            if cmd.starts_with("*IDN?") {
                vec![MockReply::line("HEWLETT-PACKARD,8116A")]
            } else {
                vec![]
            }
        });

        transport.write(b"*IDN?\r\n").await.unwrap();
        let line = transport.read_line(Duration::from_millis(10)).await.unwrap();
        assert_eq!(&line[..], b"HEWLETT-PACKARD,8116A\r\n");
        assert_eq!(
            handle.calls(),
            vec![BusCall::Write(b"*IDN?\r\n".to_vec()), BusCall::ReadUntil(b'\n')]
        );
    }

    #[tokio::test]
    async fn test_read_n_short_times_out() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        handle.push(MockReply::bytes(vec![1u8, 2, 3]));

        let err = transport
            .read_n(4, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(handle.pending_bytes(), 3);

        let got = transport.read_n(3, Duration::from_millis(5)).await.unwrap();
        assert_eq!(&got[..], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_serial_poll_queue_and_idle() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        handle.set_idle_status(0x10);
        handle.push(MockReply::Status(0x24));

        let timeout = Duration::from_millis(5);
        assert_eq!(transport.serial_poll(timeout).await.unwrap(), 0x24);
        assert_eq!(transport.serial_poll(timeout).await.unwrap(), 0x10);
    }

    #[tokio::test]
    async fn test_fail_call_injects_io_error() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        handle.fail_call(1);

        transport.write(b"A").await.unwrap();
        let err = transport.write(b"B").await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
        transport.write(b"C").await.unwrap();
        assert_eq!(handle.writes(), vec!["A", "B", "C"]);
    }
}
