//! Atomic Sequence Executor
//!
//! An [`AtomicSequence`] is an ordered list of bus operations executed as one
//! unit while the caller holds a [`BusGuard`]. Steps run strictly in order; the
//! first failing step aborts the rest and everything read so far is dropped,
//! so nothing can be decoded from a half-finished exchange.
//!
//! `Callback` steps run between bus operations. They see the results captured
//! by earlier steps and may reject them (bad preamble, wrong magic) or set the
//! byte count of a later read. That is how a self-describing binary block is
//! fetched in one exchange:
//!
//! ```text
//! 0: WriteAndReadN("TRA?;", 14)   -> 12-byte magic + u16 BE body length
//! 1: Callback                     -> check magic, set_length(2, len + 1)
//! 2: ReadN(len + 1)               -> body plus trailing terminator
//! ```

use crate::bus::BusGuard;
use crate::error::{BusError, BusResult, DecodeError};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Inspection/patching hook run between bus operations.
pub type StepCallback =
    Arc<dyn Fn(&mut SequenceCursor<'_>) -> Result<(), DecodeError> + Send + Sync>;

/// One operation in an [`AtomicSequence`].
#[derive(Clone)]
pub enum SequenceStep {
    /// Send bytes, no response expected
    Write(Bytes),
    /// Send bytes, then read one newline-terminated line
    WriteAndReadLine(Bytes),
    /// Send bytes, then read exactly `n` bytes
    WriteAndReadN(Bytes, usize),
    /// Read exactly `n` bytes
    ReadN(usize),
    /// Read one newline-terminated line
    ReadLine,
    /// Run a callback over the results so far
    Callback(StepCallback),
}

impl SequenceStep {
    fn set_length(&mut self, length: usize) -> bool {
        match self {
            SequenceStep::WriteAndReadN(_, n) | SequenceStep::ReadN(n) => {
                *n = length;
                true
            }
            _ => false,
        }
    }
}

impl fmt::Debug for SequenceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceStep::Write(b) => write!(f, "Write({:?})", String::from_utf8_lossy(b)),
            SequenceStep::WriteAndReadLine(b) => {
                write!(f, "WriteAndReadLine({:?})", String::from_utf8_lossy(b))
            }
            SequenceStep::WriteAndReadN(b, n) => {
                write!(f, "WriteAndReadN({:?}, {n})", String::from_utf8_lossy(b))
            }
            SequenceStep::ReadN(n) => write!(f, "ReadN({n})"),
            SequenceStep::ReadLine => write!(f, "ReadLine"),
            SequenceStep::Callback(_) => write!(f, "Callback"),
        }
    }
}

/// View handed to a callback step.
pub struct SequenceCursor<'a> {
    position: usize,
    results: &'a [Option<Bytes>],
    later: &'a mut [SequenceStep],
}

impl SequenceCursor<'_> {
    /// Index of the running callback step.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes captured by an earlier step.
    pub fn result(&self, step: usize) -> Option<&Bytes> {
        self.results.get(step).and_then(Option::as_ref)
    }

    /// Bytes captured by the nearest earlier read.
    pub fn last_result(&self) -> Option<&Bytes> {
        self.results.iter().rev().find_map(Option::as_ref)
    }

    /// Set the byte count of a later `ReadN` or `WriteAndReadN` step.
    pub fn set_length(&mut self, step: usize, length: usize) -> Result<(), DecodeError> {
        let offset = step
            .checked_sub(self.position + 1)
            .ok_or_else(|| DecodeError::BadBlock(format!("step {step} is not after the callback")))?;
        let target = self
            .later
            .get_mut(offset)
            .ok_or_else(|| DecodeError::BadBlock(format!("no step {step} in sequence")))?;
        if target.set_length(length) {
            Ok(())
        } else {
            Err(DecodeError::BadBlock(format!(
                "step {step} does not take a length"
            )))
        }
    }
}

/// Results of a fully executed sequence, one slot per step.
#[derive(Debug, Clone, Default)]
pub struct SequenceOutput {
    results: Vec<Option<Bytes>>,
}

impl SequenceOutput {
    /// Rebuild an output from captured step results, e.g. a recorded exchange.
    pub fn from_results(results: Vec<Option<Bytes>>) -> Self {
        Self { results }
    }

    /// Raw bytes captured by `step`, if it was a read.
    pub fn get(&self, step: usize) -> Option<&Bytes> {
        self.results.get(step).and_then(Option::as_ref)
    }

    /// Captured bytes of `step`, or a decode error if the step read nothing.
    pub fn bytes(&self, step: usize) -> Result<&Bytes, DecodeError> {
        self.get(step).ok_or(DecodeError::Length {
            expected: 1,
            actual: 0,
        })
    }

    /// Captured bytes of `step` as text with surrounding whitespace removed.
    pub fn line(&self, step: usize) -> Result<&str, DecodeError> {
        let bytes = self.bytes(step)?;
        std::str::from_utf8(bytes)
            .map(str::trim)
            .map_err(|_| DecodeError::NotText)
    }

    /// Captured results in step order, skipping steps that read nothing.
    pub fn reads(&self) -> impl Iterator<Item = &Bytes> {
        self.results.iter().filter_map(Option::as_ref)
    }

    /// Number of steps in the executed sequence.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// True for the output of an empty sequence.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Ordered, indivisible group of bus operations.
#[derive(Clone, Debug, Default)]
pub struct AtomicSequence {
    steps: Vec<SequenceStep>,
}

impl AtomicSequence {
    /// Empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    pub fn step(mut self, step: SequenceStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Append a `Write`.
    pub fn write(self, data: impl Into<Bytes>) -> Self {
        self.step(SequenceStep::Write(data.into()))
    }

    /// Append a `WriteAndReadLine`.
    pub fn query_line(self, data: impl Into<Bytes>) -> Self {
        self.step(SequenceStep::WriteAndReadLine(data.into()))
    }

    /// Append a `WriteAndReadN`.
    pub fn query_n(self, data: impl Into<Bytes>, n: usize) -> Self {
        self.step(SequenceStep::WriteAndReadN(data.into(), n))
    }

    /// Append a `ReadN`.
    pub fn read_n(self, n: usize) -> Self {
        self.step(SequenceStep::ReadN(n))
    }

    /// Append a `ReadLine`.
    pub fn read_line(self) -> Self {
        self.step(SequenceStep::ReadLine)
    }

    /// Append a callback step.
    pub fn callback<F>(self, callback: F) -> Self
    where
        F: Fn(&mut SequenceCursor<'_>) -> Result<(), DecodeError> + Send + Sync + 'static,
    {
        self.step(SequenceStep::Callback(Arc::new(callback)))
    }

    /// Append every step of `other`.
    pub fn then(mut self, other: AtomicSequence) -> Self {
        self.steps.extend(other.steps);
        self
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[SequenceStep] {
        &self.steps
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when there is nothing to execute.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Fetch a binary block whose fixed-size preamble declares the body length.
    ///
    /// The preamble is `magic` followed by a big-endian `u16` length. The body
    /// read also consumes `trailer` terminator bytes. Use
    /// [`block_body`] on the output to get the body alone.
    pub fn length_prefixed_block(query: impl Into<Bytes>, magic: &'static [u8], trailer: usize) -> Self {
        let preamble_len = magic.len() + 2;
        AtomicSequence::new()
            .query_n(query, preamble_len)
            .callback(move |cursor| {
                let preamble = cursor
                    .result(0)
                    .ok_or_else(|| DecodeError::BadBlock("missing preamble".into()))?;
                if preamble.len() != preamble_len || !preamble.starts_with(magic) {
                    return Err(DecodeError::BadBlock(format!(
                        "unexpected preamble {:?}",
                        String::from_utf8_lossy(preamble)
                    )));
                }
                let body_len =
                    u16::from_be_bytes([preamble[preamble_len - 2], preamble[preamble_len - 1]]);
                cursor.set_length(2, usize::from(body_len) + trailer)
            })
            .read_n(0)
    }

    /// Run every step in order while holding the bus.
    ///
    /// The first failing step aborts the sequence; no partial output is
    /// returned.
    pub async fn execute(self, guard: &mut BusGuard, io_timeout: Duration) -> BusResult<SequenceOutput> {
        let mut steps = self.steps;
        let mut results: Vec<Option<Bytes>> = Vec::with_capacity(steps.len());

        for index in 0..steps.len() {
            let (current, later) = steps[index..].split_at_mut(1);
            let step = &current[0];
            trace!(owner = guard.owner(), step = index, op = ?step, "Sequence step");

            let transport = guard.transport();
            let transport_err = |source| BusError::Transport { step: index, source };

            let captured = match step {
                SequenceStep::Write(data) => {
                    transport.write(data).await.map_err(transport_err)?;
                    None
                }
                SequenceStep::WriteAndReadLine(data) => {
                    transport.write(data).await.map_err(transport_err)?;
                    Some(transport.read_line(io_timeout).await.map_err(transport_err)?)
                }
                SequenceStep::WriteAndReadN(data, n) => {
                    transport.write(data).await.map_err(transport_err)?;
                    Some(transport.read_n(*n, io_timeout).await.map_err(transport_err)?)
                }
                SequenceStep::ReadN(n) => {
                    Some(transport.read_n(*n, io_timeout).await.map_err(transport_err)?)
                }
                SequenceStep::ReadLine => {
                    Some(transport.read_line(io_timeout).await.map_err(transport_err)?)
                }
                SequenceStep::Callback(callback) => {
                    let mut cursor = SequenceCursor {
                        position: index,
                        results: &results,
                        later,
                    };
                    callback(&mut cursor)?;
                    None
                }
            };
            results.push(captured);
        }

        Ok(SequenceOutput { results })
    }
}

/// Body of a block fetched with [`AtomicSequence::length_prefixed_block`],
/// without its trailing terminator bytes.
pub fn block_body(output: &SequenceOutput, trailer: usize) -> Result<&[u8], DecodeError> {
    let raw = output.bytes(2)?;
    let len = raw.len().checked_sub(trailer).ok_or(DecodeError::Length {
        expected: trailer,
        actual: raw.len(),
    })?;
    Ok(&raw[..len])
}
