//! Command Dispatcher
//!
//! One worker task per instrument drains a bounded FIFO queue. Each command
//! is planned by the model (validation happens here, before the bus is
//! touched), then executed under one bus lock acquisition together with
//! whatever the plan requires afterwards: a settings re-query, and for some
//! models a status poll. Nothing is published unless every step succeeded.

use super::command::{Command, CommandOutcome, CommandTicket};
use super::poller::poll_locked;
use super::InstrumentCore;
use crate::bus::BusGuard;
use crate::error::BusResult;
use crate::models::{CommandEffect, Settings};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Bus owner name used by the dispatcher.
pub(crate) const OWNER: &str = "dispatcher";

/// A command waiting in the queue.
pub(crate) struct QueuedCommand {
    id: Uuid,
    command: Command,
    reply: oneshot::Sender<BusResult<CommandOutcome>>,
}

impl QueuedCommand {
    /// Wrap `command` and hand back the caller's ticket.
    pub(crate) fn new(command: Command) -> (Self, CommandTicket) {
        let (reply, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let ticket = CommandTicket {
            id,
            command: command.id(),
            reply: rx,
        };
        (Self { id, command, reply }, ticket)
    }
}

/// Worker loop. Ends when every sender is gone and the queue is drained.
pub(crate) async fn run_command_queue(
    core: Arc<InstrumentCore>,
    mut queue: mpsc::Receiver<QueuedCommand>,
) {
    debug!(instrument = %core.id, "Command queue started");

    while let Some(queued) = queue.recv().await {
        trace!(
            instrument = %core.id,
            ticket = %queued.id,
            command = %queued.command.id(),
            "Processing command"
        );
        let result = dispatch(&core, &queued.command).await;
        match &result {
            Ok(_) => debug!(
                instrument = %core.id,
                ticket = %queued.id,
                command = %queued.command.id(),
                "Command done"
            ),
            Err(e) => warn!(
                instrument = %core.id,
                ticket = %queued.id,
                command = %queued.command.id(),
                error = %e,
                "Command failed"
            ),
        }
        // The caller may have dropped its ticket.
        let _ = queued.reply.send(result);
    }

    debug!(instrument = %core.id, "Command queue ended");
}

/// Run one command to completion.
///
/// A reading the command fetched is returned as it was published, so the
/// caller never sees one a later poll put in the session.
pub(crate) async fn dispatch(core: &InstrumentCore, command: &Command) -> BusResult<CommandOutcome> {
    let current = core.session.settings();
    let plan = core.model.plan(command, current.value())?;
    if plan.is_nop() {
        return Ok(CommandOutcome::default());
    }

    let mut guard = core.bus.acquire(OWNER, core.timeouts.lock).await?;
    let output = plan.sequence.execute(&mut guard, core.timeouts.io).await?;
    let changes_state = plan.effect.changes_state();

    let outcome = match plan.effect {
        CommandEffect::None => CommandOutcome::default(),
        CommandEffect::RequerySettings => {
            let settings = query_settings(core, &mut guard).await?;
            publish_if_changed(core, settings);
            CommandOutcome::default()
        }
        CommandEffect::UpdateSettings(update) => {
            let settings = update(&output, core.session.settings().value())?;
            publish_if_changed(core, settings);
            CommandOutcome::default()
        }
        CommandEffect::ReturnSettings => {
            let settings = core.model.decode_settings(&output)?;
            let value = to_json(&core.id, &settings);
            publish_if_changed(core, settings);
            CommandOutcome::value(value)
        }
        CommandEffect::ReturnReading => {
            let settings = core.session.settings().value().clone();
            let reading = core.model.decode_reading(&output, settings)?;
            let value = to_json(&core.id, &reading);
            let snapshot = core.session.publish_reading(reading);
            CommandOutcome {
                value,
                reading: Some(snapshot),
            }
        }
        CommandEffect::ReturnValue(decode) => CommandOutcome::value(decode(&output)?),
    };

    if changes_state && core.model.status_after_command() {
        // Settings are already published and true; a failed status
        // re-query only leaves the previous status current.
        if let Err(e) = poll_locked(core, &mut guard).await {
            warn!(instrument = %core.id, error = %e, "Status re-query after command failed");
        }
    }

    Ok(outcome)
}

/// Read back and decode the full settings while holding the bus.
pub(crate) async fn query_settings(core: &InstrumentCore, guard: &mut BusGuard) -> BusResult<Settings> {
    let output = core
        .model
        .settings_query()
        .execute(guard, core.timeouts.io)
        .await?;
    Ok(core.model.decode_settings(&output)?)
}

fn publish_if_changed(core: &InstrumentCore, settings: Settings) {
    if *core.session.settings().value().as_ref() != settings {
        core.session.publish_settings(settings);
    } else {
        trace!(instrument = %core.id, "Settings unchanged");
    }
}

fn to_json<T: Serialize>(instrument: &str, value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        warn!(instrument = %instrument, error = %e, "Return value has no JSON form");
        Value::Null
    })
}
