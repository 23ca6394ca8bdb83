//! Command-and-status protocol engine for instruments on a shared,
//! half-duplex GPIB-style bus.
//!
//! One [`Instrument`] owns one [`BusTransport`] and one
//! [`InstrumentModel`]. Commands go through a FIFO dispatcher, status is
//! polled in the background, and every multi-step exchange runs as an
//! [`AtomicSequence`] under the [`BusLock`], so no other traffic can
//! interleave with it. Decoded state is published as immutable snapshots.
//!
//! ```no_run
//! use rust_gpib::{Command, CommandId, Instrument, InstrumentOptions, ModelKind, MockTransport};
//!
//! # async fn demo() -> rust_gpib::BusResult<()> {
//! let transport = MockTransport::new();
//! let fg = Instrument::connect(
//!     "fg",
//!     Box::new(transport),
//!     ModelKind::Hp8116a.create(),
//!     InstrumentOptions::default(),
//! )
//! .await?;
//! fg.execute(Command::new(CommandId::SetFrequency).with("hz", 1000.0)).await?;
//! println!("{:?}", fg.settings().value());
//! fg.shutdown().await
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod models;
pub mod transport;

pub use bus::{AtomicSequence, BusGuard, BusLock, SequenceOutput, SequenceStep};
pub use error::{BusError, BusResult, DecodeError, TransportError};
pub use instrument::{
    BusTimeouts, Command, CommandId, CommandOutcome, CommandTicket, FunctionGenerator, Instrument,
    InstrumentListener, InstrumentOptions, InstrumentSession, Multimeter, Snapshot,
    SpectrumAnalyzer,
};
pub use models::{InstrumentModel, ModelKind, Reading, Settings, Status, StatusFlag};
pub use transport::{BusTransport, MockTransport};
