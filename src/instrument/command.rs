//! Commands and their completion tickets.
//!
//! A [`Command`] is an identifier plus named JSON arguments. It is moved into
//! the dispatcher on submission and never touched by the caller again; the
//! result comes back through a [`CommandTicket`].

use super::session::Snapshot;
use crate::error::{BusError, BusResult};
use crate::models::Reading;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Every command the engine knows about. Which ones a given model accepts is
/// decided by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandId {
    Nop,
    Identify,
    Reset,
    QuerySettings,
    // function generator
    SetFrequency,
    SetAmplitude,
    SetOffset,
    SetWaveform,
    SetMode,
    SetDutyCycle,
    SetPulseWidth,
    SetOutputEnabled,
    // spectrum analyzer
    SetCenterFrequency,
    SetSpan,
    SetReferenceLevel,
    SetResolutionBandwidth,
    SingleSweep,
    FetchTrace,
    // multimeter
    SetFunction,
    SetRange,
    SetDigits,
    SetAutoZero,
    Measure,
}

const NAMES: &[(CommandId, &str)] = &[
    (CommandId::Nop, "nop"),
    (CommandId::Identify, "identify"),
    (CommandId::Reset, "reset"),
    (CommandId::QuerySettings, "query_settings"),
    (CommandId::SetFrequency, "set_frequency"),
    (CommandId::SetAmplitude, "set_amplitude"),
    (CommandId::SetOffset, "set_offset"),
    (CommandId::SetWaveform, "set_waveform"),
    (CommandId::SetMode, "set_mode"),
    (CommandId::SetDutyCycle, "set_duty_cycle"),
    (CommandId::SetPulseWidth, "set_pulse_width"),
    (CommandId::SetOutputEnabled, "set_output_enabled"),
    (CommandId::SetCenterFrequency, "set_center_frequency"),
    (CommandId::SetSpan, "set_span"),
    (CommandId::SetReferenceLevel, "set_reference_level"),
    (CommandId::SetResolutionBandwidth, "set_resolution_bandwidth"),
    (CommandId::SingleSweep, "single_sweep"),
    (CommandId::FetchTrace, "fetch_trace"),
    (CommandId::SetFunction, "set_function"),
    (CommandId::SetRange, "set_range"),
    (CommandId::SetDigits, "set_digits"),
    (CommandId::SetAutoZero, "set_auto_zero"),
    (CommandId::Measure, "measure"),
];

impl CommandId {
    pub fn as_str(self) -> &'static str {
        NAMES
            .iter()
            .find(|(id, _)| *id == self)
            .map(|(_, name)| *name)
            .unwrap_or("unknown")
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandId {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NAMES
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(id, _)| *id)
            .ok_or_else(|| BusError::validation(format!("unknown command '{s}'")))
    }
}

/// One request to an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    id: CommandId,
    #[serde(default)]
    args: Map<String, Value>,
}

impl Command {
    pub fn new(id: CommandId) -> Self {
        Self {
            id,
            args: Map::new(),
        }
    }

    /// Parse an identifier and a JSON object of arguments.
    pub fn parse(name: &str, args: Value) -> BusResult<Self> {
        let id = name.parse()?;
        let args = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(BusError::validation(format!(
                    "arguments for '{name}' must be an object, got {other}"
                )))
            }
        };
        Ok(Self { id, args })
    }

    /// Add an argument.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.args.insert(name.to_string(), value.into());
        self
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn args(&self) -> &Map<String, Value> {
        &self.args
    }

    fn arg(&self, name: &str) -> BusResult<&Value> {
        self.args.get(name).ok_or_else(|| {
            BusError::validation(format!("{} requires argument '{name}'", self.id))
        })
    }

    fn wrong_type(&self, name: &str, expected: &str) -> BusError {
        BusError::validation(format!(
            "argument '{name}' of {} must be {expected}",
            self.id
        ))
    }

    /// Required finite number.
    pub fn f64_arg(&self, name: &str) -> BusResult<f64> {
        self.arg(name)?
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| self.wrong_type(name, "a finite number"))
    }

    /// Required integer.
    pub fn i64_arg(&self, name: &str) -> BusResult<i64> {
        self.arg(name)?
            .as_i64()
            .ok_or_else(|| self.wrong_type(name, "an integer"))
    }

    /// Required boolean.
    pub fn bool_arg(&self, name: &str) -> BusResult<bool> {
        self.arg(name)?
            .as_bool()
            .ok_or_else(|| self.wrong_type(name, "a boolean"))
    }

    /// Required string.
    pub fn str_arg(&self, name: &str) -> BusResult<&str> {
        self.arg(name)?
            .as_str()
            .ok_or_else(|| self.wrong_type(name, "a string"))
    }

    /// Whether the argument is present at all.
    pub fn has_arg(&self, name: &str) -> bool {
        self.args.contains_key(name)
    }
}

/// What a successfully processed command produced.
#[derive(Debug, Clone, Default)]
pub struct CommandOutcome {
    /// Return value as JSON; `Null` for commands that only change state
    pub value: Value,
    /// The reading this command fetched, as it was published
    pub reading: Option<Snapshot<Reading>>,
}

impl CommandOutcome {
    pub(crate) fn value(value: Value) -> Self {
        Self {
            value,
            reading: None,
        }
    }
}

/// Handle to a submitted command's outcome.
///
/// Dropping the ticket does not cancel the command.
#[derive(Debug)]
pub struct CommandTicket {
    pub(crate) id: Uuid,
    pub(crate) command: CommandId,
    pub(crate) reply: oneshot::Receiver<BusResult<CommandOutcome>>,
}

impl CommandTicket {
    /// Correlation id, also present in the dispatcher's log lines.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn command(&self) -> CommandId {
        self.command
    }

    /// Wait until the command has been fully processed.
    pub async fn wait(self) -> BusResult<Value> {
        self.wait_outcome().await.map(|outcome| outcome.value)
    }

    /// Like [`wait`](Self::wait), keeping the typed reading if there is one.
    pub async fn wait_outcome(self) -> BusResult<CommandOutcome> {
        self.reply.await.map_err(|_| BusError::Closed)?
    }

    /// Like [`wait`](Self::wait), but give up after `limit`.
    ///
    /// The command itself keeps running; only the wait is abandoned.
    pub async fn wait_timeout(self, limit: Duration) -> BusResult<Value> {
        self.wait_outcome_timeout(limit)
            .await
            .map(|outcome| outcome.value)
    }

    /// [`wait_outcome`](Self::wait_outcome) with a limit.
    pub async fn wait_outcome_timeout(self, limit: Duration) -> BusResult<CommandOutcome> {
        match tokio::time::timeout(limit, self.reply).await {
            Ok(reply) => reply.map_err(|_| BusError::Closed)?,
            Err(_) => Err(BusError::WaitTimeout(limit)),
        }
    }
}
