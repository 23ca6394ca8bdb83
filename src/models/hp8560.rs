//! HP 8560 spectrum analyzer
//!
//! Commands end in `;`. Settings are read back one parameter at a time
//! (`CF?;SP?;RL?;RB?;VB?;ST?;`), each answered with a plain number in base
//! units. Setting center, span or reference level re-queries just that
//! parameter and patches it into the current settings; resolution bandwidth
//! is coupled to sweep time, so it re-queries everything.
//!
//! Traces are fetched as a self-describing binary block:
//!
//! ```text
//! "#TRACE-BLOCK" <u16 BE length> <length bytes of i16 BE, 0.01 dBm> <terminator>
//! ```

use super::units::format_engineering;
use super::{
    check_range, parse_number, CommandEffect, CommandPlan, InstrumentModel, Reading, Settings,
    StatusBit, StatusFlag, StatusTable, Trace,
};
use crate::bus::{block_body, AtomicSequence, SequenceOutput};
use crate::error::{BusResult, DecodeError};
use crate::instrument::{Command, CommandId};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Preamble tag of a trace block.
pub const TRACE_MAGIC: &[u8] = b"#TRACE-BLOCK";
/// Terminator byte following the trace body.
const TRACE_TRAILER: usize = 1;
/// Raw trace counts per dBm (one count is 0.01 dBm).
const COUNTS_PER_DBM: f64 = 100.0;
/// Points per trace on this model.
pub const DEFAULT_TRACE_POINTS: usize = 601;

const FREQUENCY_SCALES: &[(&str, f64)] = &[("GZ", 1e9), ("MZ", 1e6), ("KZ", 1e3), ("HZ", 1.0)];
const MAX_FREQUENCY_HZ: f64 = 2.9e9;

const STATUS_TABLE: StatusTable = &[
    StatusBit { mask: 0x40, flag: StatusFlag::ServiceRequest },
    StatusBit { mask: 0x20, flag: StatusFlag::ErrorPresent },
    StatusBit { mask: 0x10, flag: StatusFlag::CommandComplete },
    StatusBit { mask: 0x04, flag: StatusFlag::EndOfSweep },
    StatusBit { mask: 0x02, flag: StatusFlag::MessagePresent },
    StatusBit { mask: 0x01, flag: StatusFlag::TriggerArmed },
];

/// Sweep configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzerSettings {
    pub center_hz: f64,
    pub span_hz: f64,
    pub reference_level_dbm: f64,
    pub resolution_bandwidth_hz: f64,
    pub video_bandwidth_hz: f64,
    pub sweep_time_s: f64,
    pub trace_points: usize,
}

/// Sparse update for [`AnalyzerSettings::patch`].
#[derive(Debug, Clone, Default)]
pub struct AnalyzerPatch {
    pub center_hz: Option<f64>,
    pub span_hz: Option<f64>,
    pub reference_level_dbm: Option<f64>,
    pub resolution_bandwidth_hz: Option<f64>,
    pub video_bandwidth_hz: Option<f64>,
    pub sweep_time_s: Option<f64>,
}

impl AnalyzerSettings {
    pub fn start_hz(&self) -> f64 {
        self.center_hz - self.span_hz / 2.0
    }

    pub fn stop_hz(&self) -> f64 {
        self.center_hz + self.span_hz / 2.0
    }

    /// Copy with the fields set in `patch` replaced.
    pub fn patch(&self, patch: AnalyzerPatch) -> Self {
        Self {
            center_hz: patch.center_hz.unwrap_or(self.center_hz),
            span_hz: patch.span_hz.unwrap_or(self.span_hz),
            reference_level_dbm: patch.reference_level_dbm.unwrap_or(self.reference_level_dbm),
            resolution_bandwidth_hz: patch
                .resolution_bandwidth_hz
                .unwrap_or(self.resolution_bandwidth_hz),
            video_bandwidth_hz: patch.video_bandwidth_hz.unwrap_or(self.video_bandwidth_hz),
            sweep_time_s: patch.sweep_time_s.unwrap_or(self.sweep_time_s),
            trace_points: self.trace_points,
        }
    }
}

/// HP 8560 protocol.
#[derive(Debug, Clone, Copy)]
pub struct Hp8560 {
    trace_points: usize,
}

impl Default for Hp8560 {
    fn default() -> Self {
        Self {
            trace_points: DEFAULT_TRACE_POINTS,
        }
    }
}

/// Which parameter a single-field setter touches.
#[derive(Clone, Copy)]
enum Parameter {
    Center,
    Span,
    ReferenceLevel,
}

impl Parameter {
    fn query(self) -> &'static str {
        match self {
            Parameter::Center => "CF?;",
            Parameter::Span => "SP?;",
            Parameter::ReferenceLevel => "RL?;",
        }
    }

    fn patch(self, value: f64) -> AnalyzerPatch {
        match self {
            Parameter::Center => AnalyzerPatch {
                center_hz: Some(value),
                ..Default::default()
            },
            Parameter::Span => AnalyzerPatch {
                span_hz: Some(value),
                ..Default::default()
            },
            Parameter::ReferenceLevel => AnalyzerPatch {
                reference_level_dbm: Some(value),
                ..Default::default()
            },
        }
    }
}

impl Hp8560 {
    /// Model with a non-default trace length.
    pub fn with_trace_points(trace_points: usize) -> Self {
        Self { trace_points }
    }

    fn trace_sequence() -> AtomicSequence {
        AtomicSequence::length_prefixed_block("TRA?;", TRACE_MAGIC, TRACE_TRAILER)
    }

    /// Send `set`, read the parameter back and patch it in.
    fn set_and_patch(set: String, parameter: Parameter, current: &Settings) -> CommandPlan {
        let Some(base) = current.as_analyzer().cloned() else {
            return CommandPlan::new(
                AtomicSequence::new().write(set),
                CommandEffect::RequerySettings,
            );
        };
        let sequence = AtomicSequence::new()
            .write(set)
            .query_line(parameter.query());
        let update = move |output: &SequenceOutput,
                           current: &Settings|
              -> Result<Settings, DecodeError> {
            let value = parse_number(parameter.query(), output.line(1)?)?;
            let settings = current.as_analyzer().unwrap_or(&base);
            Ok(Settings::SpectrumAnalyzer(
                settings.patch(parameter.patch(value)),
            ))
        };
        CommandPlan::new(sequence, CommandEffect::UpdateSettings(Box::new(update)))
    }
}

/// Decode the six settings replies.
fn decode_settings_lines(
    output: &SequenceOutput,
    trace_points: usize,
) -> Result<AnalyzerSettings, DecodeError> {
    let number = |step: usize, field: &str| parse_number(field, output.line(step)?);
    Ok(AnalyzerSettings {
        center_hz: number(0, "CF")?,
        span_hz: number(1, "SP")?,
        reference_level_dbm: number(2, "RL")?,
        resolution_bandwidth_hz: number(3, "RB")?,
        video_bandwidth_hz: number(4, "VB")?,
        sweep_time_s: number(5, "ST")?,
        trace_points,
    })
}

/// Decode a trace body of `points` big-endian i16 samples.
pub fn decode_trace_body(body: &[u8], points: usize) -> Result<Vec<f64>, DecodeError> {
    let expected = points
        .checked_mul(2)
        .ok_or_else(|| DecodeError::BadBlock(format!("trace of {points} points is too long")))?;
    if body.len() != expected {
        return Err(DecodeError::Length {
            expected,
            actual: body.len(),
        });
    }
    Ok(body
        .chunks_exact(2)
        .map(|pair| f64::from(i16::from_be_bytes([pair[0], pair[1]])) / COUNTS_PER_DBM)
        .collect())
}

impl InstrumentModel for Hp8560 {
    fn name(&self) -> &'static str {
        "hp8560"
    }

    fn status_table(&self) -> StatusTable {
        STATUS_TABLE
    }

    fn init_sequence(&self) -> AtomicSequence {
        AtomicSequence::new().write("TDF B;")
    }

    fn shutdown_sequence(&self) -> Option<AtomicSequence> {
        Some(AtomicSequence::new().write("CONTS;"))
    }

    fn settings_query(&self) -> AtomicSequence {
        ["CF?;", "SP?;", "RL?;", "RB?;", "VB?;", "ST?;"]
            .into_iter()
            .fold(AtomicSequence::new(), AtomicSequence::query_line)
    }

    fn decode_settings(&self, output: &SequenceOutput) -> Result<Settings, DecodeError> {
        decode_settings_lines(output, self.trace_points).map(Settings::SpectrumAnalyzer)
    }

    fn plan(&self, command: &Command, current: &Settings) -> BusResult<CommandPlan> {
        let plan = match command.id() {
            CommandId::Nop => CommandPlan::nop(),
            CommandId::QuerySettings => {
                CommandPlan::new(self.settings_query(), CommandEffect::ReturnSettings)
            }
            CommandId::Identify => CommandPlan::new(
                AtomicSequence::new().query_line("ID?;"),
                CommandEffect::ReturnValue(Box::new(
                    |output: &SequenceOutput| -> Result<Value, DecodeError> {
                        Ok(Value::String(output.line(0)?.to_string()))
                    },
                )),
            ),
            // IP; also resets the trace data format
            CommandId::Reset => CommandPlan::new(
                AtomicSequence::new().write("IP;").write("TDF B;"),
                CommandEffect::RequerySettings,
            ),
            CommandId::SetCenterFrequency => {
                let hz = check_range("center frequency", command.f64_arg("hz")?, 0.0, MAX_FREQUENCY_HZ)?;
                Self::set_and_patch(
                    format!("CF {};", format_engineering(hz, FREQUENCY_SCALES)),
                    Parameter::Center,
                    current,
                )
            }
            CommandId::SetSpan => {
                let hz = check_range("span", command.f64_arg("hz")?, 0.0, MAX_FREQUENCY_HZ)?;
                Self::set_and_patch(
                    format!("SP {};", format_engineering(hz, FREQUENCY_SCALES)),
                    Parameter::Span,
                    current,
                )
            }
            CommandId::SetReferenceLevel => {
                let dbm = check_range("reference level", command.f64_arg("dbm")?, -120.0, 30.0)?;
                Self::set_and_patch(
                    format!("RL {} DM;", super::units::trim_number(dbm)),
                    Parameter::ReferenceLevel,
                    current,
                )
            }
            CommandId::SetResolutionBandwidth => {
                let hz = check_range("resolution bandwidth", command.f64_arg("hz")?, 300.0, 1e6)?;
                CommandPlan::new(
                    AtomicSequence::new()
                        .write(format!("RB {};", format_engineering(hz, FREQUENCY_SCALES))),
                    CommandEffect::RequerySettings,
                )
            }
            CommandId::SingleSweep => CommandPlan::new(
                AtomicSequence::new().write("SNGLS;TS;"),
                CommandEffect::None,
            ),
            CommandId::FetchTrace => {
                CommandPlan::new(Self::trace_sequence(), CommandEffect::ReturnReading)
            }
            _ => return Err(self.unsupported(command)),
        };
        Ok(plan)
    }

    fn error_query(&self) -> Option<AtomicSequence> {
        Some(AtomicSequence::new().query_line("ERR?;"))
    }

    fn message_query(&self) -> Option<AtomicSequence> {
        Some(AtomicSequence::new().query_line("MSG?;"))
    }

    fn reading_trigger(&self) -> Option<StatusFlag> {
        Some(StatusFlag::EndOfSweep)
    }

    fn reading_query(&self, _settings: &Settings) -> Option<AtomicSequence> {
        Some(Self::trace_sequence())
    }

    fn decode_reading(
        &self,
        output: &SequenceOutput,
        settings: Arc<Settings>,
    ) -> Result<Reading, DecodeError> {
        let analyzer = settings
            .as_analyzer()
            .ok_or_else(|| DecodeError::BadBlock("trace without sweep settings".into()))?;
        let samples = decode_trace_body(block_body(output, TRACE_TRAILER)?, analyzer.trace_points)?;
        Ok(Reading::Trace(Trace {
            samples,
            unit: "dBm",
            start_hz: analyzer.start_hz(),
            stop_hz: analyzer.stop_hz(),
            settings: settings.clone(),
        }))
    }
}
