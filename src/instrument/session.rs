//! Instrument Session
//!
//! Holds the current [`Settings`], [`Status`] and [`Reading`] of one
//! instrument, each as an immutable [`Snapshot`] behind a
//! `tokio::sync::watch` channel. Readers clone the snapshot's `Arc` and never
//! wait on the bus.
//!
//! Publishing swaps the snapshot and queues an event for the notifier task,
//! which calls listeners in registration order outside of any bus lock. A
//! listener that returns an error or panics is logged and skipped.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut settings = instrument.subscribe_settings();
//! tokio::spawn(async move {
//!     while settings.changed().await.is_ok() {
//!         let snapshot = settings.borrow().clone();
//!         println!("v{}: {:?}", snapshot.version(), snapshot.value());
//!     }
//! });
//! ```

use crate::models::{Reading, Settings, Status};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::fmt;
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Published value with its version and acquisition time.
///
/// Version 0 is the "unknown" placeholder present before the first publish.
#[derive(Debug)]
pub struct Snapshot<T> {
    version: u64,
    acquired_at: DateTime<Utc>,
    value: Arc<T>,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            acquired_at: self.acquired_at,
            value: self.value.clone(),
        }
    }
}

impl<T> Snapshot<T> {
    fn new(version: u64, value: T) -> Self {
        Self {
            version,
            acquired_at: Utc::now(),
            value: Arc::new(value),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    /// Nothing has been published yet.
    pub fn is_placeholder(&self) -> bool {
        self.version == 0
    }
}

impl<T> Deref for Snapshot<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Observer of one instrument's published values.
///
/// Every callback receives the full new snapshot. Callbacks run on the
/// session's notifier task, never while the bus is held, but a slow callback
/// delays delivery to the listeners after it.
pub trait InstrumentListener: Send + Sync + 'static {
    fn on_settings(&self, _settings: &Snapshot<Settings>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_status(&self, _status: &Snapshot<Status>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_reading(&self, _reading: &Snapshot<Reading>) -> anyhow::Result<()> {
        Ok(())
    }
}

enum SessionEvent {
    Settings(Snapshot<Settings>),
    Status(Snapshot<Status>),
    Reading(Snapshot<Reading>),
    /// Acknowledged once every earlier event has been delivered
    Flush(oneshot::Sender<()>),
}

impl SessionEvent {
    fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Settings(_) => "settings",
            SessionEvent::Status(_) => "status",
            SessionEvent::Reading(_) => "reading",
            SessionEvent::Flush(_) => "flush",
        }
    }
}

type Listeners = Arc<RwLock<Vec<Arc<dyn InstrumentListener>>>>;

/// Current state of one instrument.
pub struct InstrumentSession {
    id: Arc<str>,
    settings: watch::Sender<Snapshot<Settings>>,
    status: watch::Sender<Snapshot<Status>>,
    reading: watch::Sender<Snapshot<Reading>>,
    version: AtomicU64,
    listeners: Listeners,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl fmt::Debug for InstrumentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentSession")
            .field("id", &self.id)
            .field("version", &self.version.load(Ordering::Relaxed))
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl InstrumentSession {
    /// Create a session holding placeholders and start its notifier task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(id: &str) -> Arc<Self> {
        let id: Arc<str> = id.into();
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));
        let (events, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_notifier(id.clone(), listeners.clone(), rx));

        let (settings, _) = watch::channel(Snapshot::new(0, Settings::Unknown));
        let (status, _) = watch::channel(Snapshot::new(0, Status::unknown()));
        let (reading, _) = watch::channel(Snapshot::new(0, Reading::Unknown));

        Arc::new(Self {
            id,
            settings,
            status,
            reading,
            version: AtomicU64::new(0),
            listeners,
            events,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> Snapshot<Settings> {
        self.settings.borrow().clone()
    }

    pub fn status(&self) -> Snapshot<Status> {
        self.status.borrow().clone()
    }

    pub fn reading(&self) -> Snapshot<Reading> {
        self.reading.borrow().clone()
    }

    pub fn subscribe_settings(&self) -> watch::Receiver<Snapshot<Settings>> {
        self.settings.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Snapshot<Status>> {
        self.status.subscribe()
    }

    pub fn subscribe_reading(&self) -> watch::Receiver<Snapshot<Reading>> {
        self.reading.subscribe()
    }

    /// Register a listener. It sees every value published from now on.
    pub fn add_listener(&self, listener: Arc<dyn InstrumentListener>) {
        self.listeners.write().push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Wait until listeners have seen everything published so far.
    pub async fn flush_listeners(&self) {
        let (tx, rx) = oneshot::channel();
        if self.events.send(SessionEvent::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, event: SessionEvent) {
        debug!(instrument = %self.id, kind = event.kind(), "Published");
        // The notifier only stops once the session is gone.
        let _ = self.events.send(event);
    }

    pub(crate) fn publish_settings(&self, settings: Settings) -> Snapshot<Settings> {
        let snapshot = Snapshot::new(self.next_version(), settings);
        self.settings.send_replace(snapshot.clone());
        self.notify(SessionEvent::Settings(snapshot.clone()));
        snapshot
    }

    pub(crate) fn publish_status(&self, status: Status) -> Snapshot<Status> {
        let snapshot = Snapshot::new(self.next_version(), status);
        self.status.send_replace(snapshot.clone());
        self.notify(SessionEvent::Status(snapshot.clone()));
        snapshot
    }

    pub(crate) fn publish_reading(&self, reading: Reading) -> Snapshot<Reading> {
        let snapshot = Snapshot::new(self.next_version(), reading);
        self.reading.send_replace(snapshot.clone());
        self.notify(SessionEvent::Reading(snapshot.clone()));
        snapshot
    }
}

async fn run_notifier(
    id: Arc<str>,
    listeners: Listeners,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        if let SessionEvent::Flush(ack) = event {
            let _ = ack.send(());
            continue;
        }
        // Registrations made while delivering wait for the next event.
        let current: Vec<Arc<dyn InstrumentListener>> = listeners.read().clone();
        for (index, listener) in current.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| match &event {
                SessionEvent::Settings(s) => listener.on_settings(s),
                SessionEvent::Status(s) => listener.on_status(s),
                SessionEvent::Reading(r) => listener.on_reading(r),
                SessionEvent::Flush(_) => Ok(()),
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    instrument = %id,
                    listener = index,
                    kind = event.kind(),
                    error = %e,
                    "Listener failed"
                ),
                Err(_) => warn!(
                    instrument = %id,
                    listener = index,
                    kind = event.kind(),
                    "Listener panicked"
                ),
            }
        }
    }
    debug!(instrument = %id, "Notifier stopped");
}
