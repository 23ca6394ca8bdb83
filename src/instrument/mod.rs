//! Instrument facade
//!
//! [`Instrument::connect`] wires one transport and one model into a running
//! engine:
//!
//! ```text
//!   callers ──submit──▶ [bounded FIFO] ──▶ dispatcher ─┐
//!   interval / SRQ ───────────────────▶ poller ───────┤──▶ BusLock ──▶ transport
//!                                                      │
//!                      InstrumentSession ◀──publish────┘──▶ listeners
//! ```
//!
//! The bus is first taken by `init`, which runs the model's init sequence and
//! publishes the initial settings; only then do the dispatcher and poller
//! start.

pub mod capabilities;
pub mod command;
mod dispatcher;
mod poller;
pub mod session;

pub use capabilities::{FunctionGenerator, Multimeter, SpectrumAnalyzer};
pub use command::{Command, CommandId, CommandOutcome, CommandTicket};
pub use session::{InstrumentListener, InstrumentSession, Snapshot};

use crate::bus::BusLock;
use crate::error::{BusError, BusResult};
use crate::models::{InstrumentModel, Reading, Settings, Status};
use crate::transport::BusTransport;
use dispatcher::QueuedCommand;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Timeouts applied to every bus interaction of one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusTimeouts {
    /// Waiting for the bus lock
    pub lock: Duration,
    /// One read primitive
    pub io: Duration,
    /// Default wait in [`Instrument::execute`]
    pub wait: Duration,
}

impl Default for BusTimeouts {
    fn default() -> Self {
        Self {
            lock: Duration::from_millis(5000),
            io: Duration::from_millis(2000),
            wait: Duration::from_millis(10_000),
        }
    }
}

/// Runtime options for [`Instrument::connect`].
#[derive(Debug, Clone)]
pub struct InstrumentOptions {
    pub timeouts: BusTimeouts,
    /// Capacity of the command queue
    pub queue_capacity: usize,
    /// Periodic status poll; `None` polls only on service requests
    pub poll_interval: Option<Duration>,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        Self {
            timeouts: BusTimeouts::default(),
            queue_capacity: 64,
            poll_interval: Some(Duration::from_millis(500)),
        }
    }
}

/// State shared by the dispatcher, the poller and the facade.
pub(crate) struct InstrumentCore {
    pub(crate) id: Arc<str>,
    pub(crate) model: Arc<dyn InstrumentModel>,
    pub(crate) bus: BusLock,
    pub(crate) session: Arc<InstrumentSession>,
    pub(crate) timeouts: BusTimeouts,
}

/// Bus owner name used during connection.
const INIT_OWNER: &str = "init";

/// One connected instrument.
pub struct Instrument {
    core: Arc<InstrumentCore>,
    commands: mpsc::Sender<QueuedCommand>,
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("id", &self.core.id)
            .field("model", &self.core.model.name())
            .field("bus", &self.core.bus.name())
            .finish()
    }
}

impl Instrument {
    /// Initialize the instrument and start its dispatcher and poller.
    ///
    /// Fails if the init sequence or the first settings query fails; nothing
    /// is left running in that case.
    pub async fn connect(
        id: &str,
        transport: Box<dyn BusTransport>,
        model: Arc<dyn InstrumentModel>,
        options: InstrumentOptions,
    ) -> BusResult<Self> {
        if options.queue_capacity == 0 {
            return Err(BusError::validation("command queue capacity must be > 0"));
        }
        let core = Arc::new(InstrumentCore {
            id: id.into(),
            model,
            bus: BusLock::new(transport),
            session: InstrumentSession::new(id),
            timeouts: options.timeouts,
        });

        {
            let mut guard = core.bus.acquire(INIT_OWNER, core.timeouts.lock).await?;
            core.model
                .init_sequence()
                .execute(&mut guard, core.timeouts.io)
                .await?;
            let settings = dispatcher::query_settings(&core, &mut guard).await?;
            core.session.publish_settings(settings);
        }
        info!(
            instrument = %core.id,
            model = core.model.name(),
            bus = core.bus.name(),
            "Instrument initialized"
        );

        let (commands, queue) = mpsc::channel(options.queue_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let wake = Arc::new(Notify::new());
        let tasks = vec![
            tokio::spawn(dispatcher::run_command_queue(core.clone(), queue)),
            poller::spawn_poller(core.clone(), options.poll_interval, wake.clone(), shutdown_rx),
        ];

        Ok(Self {
            core,
            commands,
            wake,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn model_name(&self) -> &'static str {
        self.core.model.name()
    }

    /// Queue a command and return without waiting for it.
    ///
    /// Commands run in the order their submissions complete. Validation
    /// errors and bus failures arrive through the ticket.
    pub async fn submit(&self, command: Command) -> BusResult<CommandTicket> {
        let (queued, ticket) = QueuedCommand::new(command);
        self.commands
            .send(queued)
            .await
            .map_err(|_| BusError::Closed)?;
        Ok(ticket)
    }

    /// Submit and wait up to the configured wait timeout.
    pub async fn execute(&self, command: Command) -> BusResult<Value> {
        self.execute_with_timeout(command, self.core.timeouts.wait)
            .await
    }

    /// Submit and wait up to `limit`. On timeout the command still runs.
    pub async fn execute_with_timeout(&self, command: Command, limit: Duration) -> BusResult<Value> {
        self.submit(command).await?.wait_timeout(limit).await
    }

    /// Like [`execute`](Self::execute), returning the typed outcome.
    pub async fn execute_outcome(&self, command: Command) -> BusResult<CommandOutcome> {
        self.submit(command)
            .await?
            .wait_outcome_timeout(self.core.timeouts.wait)
            .await
    }

    /// Poll status right now, outside the background poller.
    pub async fn poll_now(&self) -> BusResult<Status> {
        poller::poll_cycle(&self.core, "poll_now").await
    }

    /// Signal a service request: the poller runs a cycle as soon as it can.
    pub fn service_request(&self) {
        self.wake.notify_one();
    }

    pub fn settings(&self) -> Snapshot<Settings> {
        self.core.session.settings()
    }

    pub fn status(&self) -> Snapshot<Status> {
        self.core.session.status()
    }

    pub fn reading(&self) -> Snapshot<Reading> {
        self.core.session.reading()
    }

    pub fn subscribe_settings(&self) -> watch::Receiver<Snapshot<Settings>> {
        self.core.session.subscribe_settings()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Snapshot<Status>> {
        self.core.session.subscribe_status()
    }

    pub fn subscribe_reading(&self) -> watch::Receiver<Snapshot<Reading>> {
        self.core.session.subscribe_reading()
    }

    pub fn add_listener(&self, listener: Arc<dyn InstrumentListener>) {
        self.core.session.add_listener(listener);
    }

    pub fn session(&self) -> &Arc<InstrumentSession> {
        &self.core.session
    }

    /// Who holds the bus right now.
    pub fn bus_owner(&self) -> Option<String> {
        self.core.bus.current_owner()
    }

    /// Stop polling, finish queued commands, then run the model's goodbye
    /// sequence if it has one.
    pub async fn shutdown(self) -> BusResult<()> {
        let Self {
            core,
            commands,
            shutdown,
            tasks,
            ..
        } = self;

        let _ = shutdown.send(true);
        drop(commands);
        for task in tasks.into_inner() {
            if let Err(e) = task.await {
                warn!(instrument = %core.id, error = %e, "Instrument task ended abnormally");
            }
        }

        if let Some(goodbye) = core.model.shutdown_sequence() {
            let mut guard = core.bus.acquire("shutdown", core.timeouts.lock).await?;
            goodbye.execute(&mut guard, core.timeouts.io).await?;
        }
        core.session.flush_listeners().await;
        info!(instrument = %core.id, "Instrument shut down");
        Ok(())
    }
}
