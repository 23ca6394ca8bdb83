//! Instrument models
//!
//! A model knows one instrument's wire protocol: which sequences configure,
//! query and read it, how to decode what comes back, and what its status
//! byte means. Models are pure: they build [`AtomicSequence`]s and decode
//! [`SequenceOutput`]s but never touch the bus themselves.
//!
//! - [`Hp8116a`] - pulse/function generator, 20-field `CST` settings grammar
//! - [`Hp8560`] - spectrum analyzer, binary trace blocks
//! - [`Hp3478a`] - multimeter, 5-byte binary settings

/// Enum whose variants map to numeric wire codes and lowercase names.
macro_rules! coded_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $what:literal {
            $($(#[$vmeta:meta])* $variant:ident = $code:literal => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Numeric code on the wire.
            pub fn code(self) -> u8 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            /// Variant for a wire code.
            pub fn from_code(code: i64) -> Result<Self, $crate::error::DecodeError> {
                match code {
                    $($code => Ok($name::$variant),)+
                    other => Err($crate::error::DecodeError::OutOfRange {
                        what: $what,
                        value: other,
                    }),
                }
            }

            /// Variant for a name, ignoring case.
            pub fn from_name(name: &str) -> Option<Self> {
                match name.to_ascii_lowercase().as_str() {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }
    };
}

pub mod hp3478a;
pub mod hp8116a;
pub mod hp8560;
pub mod settings;
pub mod status;
pub mod units;

pub use hp3478a::Hp3478a;
pub use hp8116a::Hp8116a;
pub use hp8560::Hp8560;
pub use settings::{Reading, ScalarReading, Settings, Trace};
pub use status::{Status, StatusBit, StatusFlag, StatusFlags, StatusTable};

use crate::bus::{AtomicSequence, SequenceOutput};
use crate::error::{BusError, BusResult, DecodeError};
use crate::instrument::Command;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Turns the output of a command's sequence and the current settings into new
/// settings.
pub type SettingsUpdate =
    Box<dyn FnOnce(&SequenceOutput, &Settings) -> Result<Settings, DecodeError> + Send>;

/// Turns the output of a query command into its return value.
pub type ValueDecoder = Box<dyn FnOnce(&SequenceOutput) -> Result<Value, DecodeError> + Send>;

/// What the dispatcher does with a command's sequence output.
pub enum CommandEffect {
    /// Nothing to publish
    None,
    /// State changed; re-query and publish the full settings
    RequerySettings,
    /// State changed; the new settings follow from the output
    UpdateSettings(SettingsUpdate),
    /// The output is a settings query; publish and return it
    ReturnSettings,
    /// The output is a reading; publish and return it
    ReturnReading,
    /// Plain query with a return value
    ReturnValue(ValueDecoder),
}

impl CommandEffect {
    /// Whether the command changes instrument state.
    pub fn changes_state(&self) -> bool {
        matches!(
            self,
            CommandEffect::RequerySettings | CommandEffect::UpdateSettings(_)
        )
    }
}

impl fmt::Debug for CommandEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandEffect::None => "None",
            CommandEffect::RequerySettings => "RequerySettings",
            CommandEffect::UpdateSettings(_) => "UpdateSettings",
            CommandEffect::ReturnSettings => "ReturnSettings",
            CommandEffect::ReturnReading => "ReturnReading",
            CommandEffect::ReturnValue(_) => "ReturnValue",
        };
        f.write_str(name)
    }
}

/// A validated command, ready to run.
#[derive(Debug)]
pub struct CommandPlan {
    pub sequence: AtomicSequence,
    pub effect: CommandEffect,
}

impl CommandPlan {
    /// Nothing to send, nothing to publish.
    pub fn nop() -> Self {
        Self {
            sequence: AtomicSequence::new(),
            effect: CommandEffect::None,
        }
    }

    pub fn new(sequence: AtomicSequence, effect: CommandEffect) -> Self {
        Self { sequence, effect }
    }

    /// Short-circuits without touching the bus.
    pub fn is_nop(&self) -> bool {
        self.sequence.is_empty() && matches!(self.effect, CommandEffect::None)
    }
}

/// Wire protocol of one instrument model.
pub trait InstrumentModel: Send + Sync + 'static {
    /// Short model name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Serial-poll bit assignment.
    fn status_table(&self) -> StatusTable;

    /// Sent once under the `init` owner before anything else.
    fn init_sequence(&self) -> AtomicSequence {
        AtomicSequence::new()
    }

    /// Sent once on shutdown, if the model has one.
    fn shutdown_sequence(&self) -> Option<AtomicSequence> {
        None
    }

    /// Sequence that reads back the full settings.
    fn settings_query(&self) -> AtomicSequence;

    /// Decode the output of [`settings_query`](Self::settings_query).
    fn decode_settings(&self, output: &SequenceOutput) -> Result<Settings, DecodeError>;

    /// Validate `command` and build its sequence. Must not touch the bus.
    fn plan(&self, command: &Command, current: &Settings) -> BusResult<CommandPlan>;

    /// Follow a state-changing command with a status poll under the same lock.
    fn status_after_command(&self) -> bool {
        false
    }

    /// Sequence fetching the error text when the error bit is set.
    fn error_query(&self) -> Option<AtomicSequence> {
        None
    }

    /// Sequence fetching the message text when the message bit is set.
    fn message_query(&self) -> Option<AtomicSequence> {
        None
    }

    /// Turn an error/message query's output into text.
    fn decode_text(&self, output: &SequenceOutput) -> Result<String, DecodeError> {
        let last = output.len().checked_sub(1).ok_or(DecodeError::Length {
            expected: 1,
            actual: 0,
        })?;
        output.line(last).map(str::to_string)
    }

    /// Status flag that means a new reading is ready.
    fn reading_trigger(&self) -> Option<StatusFlag> {
        None
    }

    /// Sequence fetching the reading announced by the trigger flag.
    fn reading_query(&self, _settings: &Settings) -> Option<AtomicSequence> {
        None
    }

    /// Decode a reading fetched with [`reading_query`](Self::reading_query)
    /// or by a reading command.
    fn decode_reading(
        &self,
        _output: &SequenceOutput,
        _settings: Arc<Settings>,
    ) -> Result<Reading, DecodeError> {
        Err(DecodeError::BadBlock(format!(
            "{} produces no readings",
            self.name()
        )))
    }

    /// Shorthand for rejecting a command this model does not implement.
    fn unsupported(&self, command: &Command) -> BusError {
        BusError::unsupported(self.name(), command.id().as_str())
    }
}

/// Selectable model, as named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Hp8116a,
    Hp8560,
    Hp3478a,
}

impl ModelKind {
    /// Instantiate the model.
    pub fn create(self) -> Arc<dyn InstrumentModel> {
        match self {
            ModelKind::Hp8116a => Arc::new(Hp8116a),
            ModelKind::Hp8560 => Arc::new(Hp8560::default()),
            ModelKind::Hp3478a => Arc::new(Hp3478a),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelKind::Hp8116a => "hp8116a",
            ModelKind::Hp8560 => "hp8560",
            ModelKind::Hp3478a => "hp3478a",
        };
        f.write_str(name)
    }
}

/// Reject `value` outside `min..=max` before anything is sent.
pub(crate) fn check_range(what: &str, value: f64, min: f64, max: f64) -> BusResult<f64> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(BusError::validation(format!(
            "{what} {value} outside {min}..={max}"
        )))
    }
}

/// Shared helper: numeric text line to `f64`.
pub(crate) fn parse_number(field: &str, text: &str) -> Result<f64, DecodeError> {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| DecodeError::NotNumeric {
            field: field.to_string(),
            value: text.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::CommandId;

    #[test]
    fn test_factory_names() {
        for kind in [ModelKind::Hp8116a, ModelKind::Hp8560, ModelKind::Hp3478a] {
            assert_eq!(kind.create().name(), kind.to_string());
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, Value::String(kind.to_string()));
        }
    }

    #[test]
    fn test_nop_plan_for_every_model() {
        for kind in [ModelKind::Hp8116a, ModelKind::Hp8560, ModelKind::Hp3478a] {
            let plan = kind
                .create()
                .plan(&Command::new(CommandId::Nop), &Settings::Unknown)
                .unwrap();
            assert!(plan.is_nop());
        }
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("CF", "+2.50000000E+08\r\n").unwrap(), 2.5e8);
        assert!(parse_number("CF", "NaN").is_err());
        assert!(parse_number("CF", "").is_err());
    }
}
