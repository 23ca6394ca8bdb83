//! Status Poller
//!
//! A poll is one serial-poll byte plus the follow-ups its bits ask for, all
//! under one bus acquisition:
//!
//! 1. error bit set: fetch the error text
//! 2. message bit set: fetch the message text
//! 3. the model's "reading ready" bit set: fetch and publish the reading
//!
//! A failed follow-up is logged and does not stop the decoded bits from
//! being published. Only a failed serial poll publishes nothing.
//!
//! The background task polls on a fixed interval and whenever a service
//! request wakes it. Code that already holds the bus calls [`poll_locked`].

use super::InstrumentCore;
use crate::bus::{AtomicSequence, BusGuard};
use crate::error::{BusError, BusResult};
use crate::models::{Status, StatusFlag};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// Bus owner name used by the background poller.
pub(crate) const OWNER: &str = "poller";

/// Acquire the bus and poll once.
pub(crate) async fn poll_cycle(core: &InstrumentCore, owner: &str) -> BusResult<Status> {
    let mut guard = core.bus.acquire(owner, core.timeouts.lock).await?;
    poll_locked(core, &mut guard).await
}

/// Poll once while the caller already holds the bus.
pub(crate) async fn poll_locked(core: &InstrumentCore, guard: &mut BusGuard) -> BusResult<Status> {
    let raw = guard
        .transport()
        .serial_poll(core.timeouts.io)
        .await
        .map_err(|source| BusError::Transport { step: 0, source })?;
    let mut status = Status::decode(raw, core.model.status_table());
    trace!(instrument = %core.id, raw = format_args!("{raw:#04x}"), flags = %status.flags(), "Serial poll");

    if status.is_set(StatusFlag::ErrorPresent) {
        if let Some(text) = follow_up(core, guard, core.model.error_query(), "error").await {
            warn!(instrument = %core.id, error = %text, "Instrument reports error");
            status = status.with_error_text(text);
        }
    }
    if status.is_set(StatusFlag::MessagePresent) {
        if let Some(text) = follow_up(core, guard, core.model.message_query(), "message").await {
            status = status.with_message_text(text);
        }
    }

    let previous = core.session.status();
    let text_changed = status.error_text() != previous.error_text()
        || status.message_text() != previous.message_text();
    if previous.is_placeholder() || *previous != status || text_changed {
        core.session.publish_status(status.clone());
    }

    let reading_ready = core
        .model
        .reading_trigger()
        .is_some_and(|flag| status.is_set(flag));
    if reading_ready {
        if let Err(e) = fetch_reading(core, guard).await {
            warn!(instrument = %core.id, error = %e, "Reading fetch failed");
        }
    }

    Ok(status)
}

async fn follow_up(
    core: &InstrumentCore,
    guard: &mut BusGuard,
    query: Option<AtomicSequence>,
    what: &str,
) -> Option<String> {
    let query = query?;
    let text = match query.execute(guard, core.timeouts.io).await {
        Ok(output) => core.model.decode_text(&output).map_err(BusError::from),
        Err(e) => Err(e),
    };
    match text {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(instrument = %core.id, what, error = %e, "Status follow-up failed");
            None
        }
    }
}

async fn fetch_reading(core: &InstrumentCore, guard: &mut BusGuard) -> BusResult<()> {
    let settings = core.session.settings().value().clone();
    let Some(query) = core.model.reading_query(&settings) else {
        return Ok(());
    };
    let output = query.execute(guard, core.timeouts.io).await?;
    let reading = core.model.decode_reading(&output, settings)?;
    core.session.publish_reading(reading);
    Ok(())
}

/// Start the background poller.
///
/// With `interval == None` it only runs when `wake` is notified.
pub(crate) fn spawn_poller(
    core: Arc<InstrumentCore>,
    interval: Option<Duration>,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval.map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        debug!(instrument = %core.id, ?interval, "Status poller started");

        loop {
            tokio::select! {
                _ = async {
                    match ticker.as_mut() {
                        Some(ticker) => {
                            ticker.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {}
                _ = wake.notified() => {
                    trace!(instrument = %core.id, "Service request");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match poll_cycle(&core, OWNER).await {
                Ok(_) => {}
                Err(e @ BusError::LockTimeout { .. }) => {
                    debug!(instrument = %core.id, error = %e, "Poll skipped, bus busy");
                }
                Err(e) => warn!(instrument = %core.id, error = %e, "Status poll failed"),
            }
        }

        debug!(instrument = %core.id, "Status poller stopped");
    })
}
