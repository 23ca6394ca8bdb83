//! HP 8116A pulse/function generator
//!
//! Commands end in `\r\n`. `CST` reports the whole front panel as 20
//! comma-separated positional fields, each `<code><value>[<unit>]`:
//!
//! ```text
//! M1,CT0,T0,W1,H0,A0,L0,C0,D0,BUR1#,RPT0NS,STA0HZ,STP0HZ,SWT0S,MRK0HZ,
//! FRQ1000HZ,DTY50%,WID0NS,AMP2V,OFS0V
//! ```
//!
//! Some firmware revisions report the output as `HIL`/`LOL` (high and low
//! level) instead of `AMP`/`OFS`. Amplitude and offset are then derived as
//! peak-to-peak and midpoint. That derivation has not been checked against
//! every waveform/modulation combination, so such settings report
//! `levels_provisional() == true`.

use super::units::{self, format_base, format_engineering, Quantity};
use super::{
    check_range, CommandEffect, CommandPlan, InstrumentModel, Settings, StatusBit, StatusFlag,
    StatusTable,
};
use crate::bus::{AtomicSequence, SequenceOutput};
use crate::error::{BusError, BusResult, DecodeError};
use crate::instrument::{Command, CommandId};
use serde::Serialize;

coded_enum! {
    /// Operating mode (`M` field).
    Mode, "mode" {
        Normal = 1 => "normal",
        Triggered = 2 => "triggered",
        Gate = 3 => "gate",
        ExternalWidth = 4 => "external_width",
        InternalSweep = 5 => "internal_sweep",
        ExternalSweep = 6 => "external_sweep",
        InternalBurst = 7 => "internal_burst",
        ExternalBurst = 8 => "external_burst",
    }
}

coded_enum! {
    /// Modulation control input (`CT` field).
    Control, "control" {
        Off = 0 => "off",
        Fm = 1 => "fm",
        Am = 2 => "am",
        Pwm = 3 => "pwm",
        Vco = 4 => "vco",
    }
}

coded_enum! {
    /// Trigger slope (`T` field).
    TriggerSlope, "trigger slope" {
        Off = 0 => "off",
        Positive = 1 => "positive",
        Negative = 2 => "negative",
    }
}

coded_enum! {
    /// Output waveform (`W` field).
    Waveform, "waveform" {
        Dc = 0 => "dc",
        Sine = 1 => "sine",
        Triangle = 2 => "triangle",
        Square = 3 => "square",
        Pulse = 4 => "pulse",
    }
}

/// Output level pair, in the form the instrument reported it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "reported", rename_all = "snake_case")]
pub enum OutputLevels {
    AmplitudeOffset { amplitude_v: f64, offset_v: f64 },
    HighLow { high_v: f64, low_v: f64 },
}

impl OutputLevels {
    pub fn amplitude_v(self) -> f64 {
        match self {
            OutputLevels::AmplitudeOffset { amplitude_v, .. } => amplitude_v,
            OutputLevels::HighLow { high_v, low_v } => high_v - low_v,
        }
    }

    pub fn offset_v(self) -> f64 {
        match self {
            OutputLevels::AmplitudeOffset { offset_v, .. } => offset_v,
            OutputLevels::HighLow { high_v, low_v } => (high_v + low_v) / 2.0,
        }
    }

    /// Amplitude/offset were derived rather than reported.
    pub fn is_provisional(self) -> bool {
        matches!(self, OutputLevels::HighLow { .. })
    }
}

/// Decoded `CST` response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratorSettings {
    pub mode: Mode,
    pub control: Control,
    pub trigger_slope: TriggerSlope,
    pub waveform: Waveform,
    pub haversine: bool,
    pub autovernier: bool,
    pub limit: bool,
    pub complement: bool,
    pub output_disabled: bool,
    pub burst_count: u32,
    pub repetition_s: f64,
    pub sweep_start_hz: f64,
    pub sweep_stop_hz: f64,
    pub sweep_time_s: f64,
    pub marker_hz: f64,
    pub frequency_hz: f64,
    pub duty_cycle_pct: f64,
    pub width_s: f64,
    pub levels: OutputLevels,
}

/// Sparse update for [`GeneratorSettings::patch`].
#[derive(Debug, Clone, Default)]
pub struct GeneratorPatch {
    pub mode: Option<Mode>,
    pub waveform: Option<Waveform>,
    pub output_disabled: Option<bool>,
    pub frequency_hz: Option<f64>,
    pub duty_cycle_pct: Option<f64>,
    pub width_s: Option<f64>,
    pub levels: Option<OutputLevels>,
}

impl GeneratorSettings {
    pub fn amplitude_v(&self) -> f64 {
        self.levels.amplitude_v()
    }

    pub fn offset_v(&self) -> f64 {
        self.levels.offset_v()
    }

    pub fn levels_provisional(&self) -> bool {
        self.levels.is_provisional()
    }

    /// Copy with the fields set in `patch` replaced.
    pub fn patch(&self, patch: GeneratorPatch) -> Self {
        Self {
            mode: patch.mode.unwrap_or(self.mode),
            waveform: patch.waveform.unwrap_or(self.waveform),
            output_disabled: patch.output_disabled.unwrap_or(self.output_disabled),
            frequency_hz: patch.frequency_hz.unwrap_or(self.frequency_hz),
            duty_cycle_pct: patch.duty_cycle_pct.unwrap_or(self.duty_cycle_pct),
            width_s: patch.width_s.unwrap_or(self.width_s),
            levels: patch.levels.unwrap_or(self.levels),
            ..self.clone()
        }
    }
}

#[derive(Clone, Copy)]
enum FieldKind {
    Code,
    Flag,
    Number(Quantity),
}

struct FieldSpec {
    code: &'static str,
    /// Code some firmware reports in place of `code`
    alt: Option<&'static str>,
    kind: FieldKind,
}

const fn field(code: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        code,
        alt: None,
        kind,
    }
}

const fn level(code: &'static str, alt: &'static str) -> FieldSpec {
    FieldSpec {
        code,
        alt: Some(alt),
        kind: FieldKind::Number(Quantity::Voltage),
    }
}

const FIELDS: [FieldSpec; 20] = [
    field("M", FieldKind::Code),
    field("CT", FieldKind::Code),
    field("T", FieldKind::Code),
    field("W", FieldKind::Code),
    field("H", FieldKind::Flag),
    field("A", FieldKind::Flag),
    field("L", FieldKind::Flag),
    field("C", FieldKind::Flag),
    field("D", FieldKind::Flag),
    field("BUR", FieldKind::Number(Quantity::Count)),
    field("RPT", FieldKind::Number(Quantity::Time)),
    field("STA", FieldKind::Number(Quantity::Frequency)),
    field("STP", FieldKind::Number(Quantity::Frequency)),
    field("SWT", FieldKind::Number(Quantity::Time)),
    field("MRK", FieldKind::Number(Quantity::Frequency)),
    field("FRQ", FieldKind::Number(Quantity::Frequency)),
    field("DTY", FieldKind::Number(Quantity::Percent)),
    field("WID", FieldKind::Number(Quantity::Time)),
    level("AMP", "HIL"),
    level("OFS", "LOL"),
];

const AMP: usize = 18;
const OFS: usize = 19;

#[derive(Clone, Copy)]
enum FieldValue {
    Int(i64),
    Real(f64),
}

/// Raw field values, indexed like [`FIELDS`].
struct Fields {
    values: Vec<FieldValue>,
    alternate: Vec<bool>,
}

impl Fields {
    fn int(&self, index: usize) -> i64 {
        match self.values[index] {
            FieldValue::Int(v) => v,
            FieldValue::Real(v) => v as i64,
        }
    }

    fn flag(&self, index: usize) -> bool {
        self.int(index) != 0
    }

    fn real(&self, index: usize) -> f64 {
        match self.values[index] {
            FieldValue::Real(v) => v,
            FieldValue::Int(v) => v as f64,
        }
    }
}

fn split_fields(line: &str) -> Result<Fields, DecodeError> {
    let texts: Vec<&str> = line.trim().split(',').map(str::trim).collect();
    if texts.len() != FIELDS.len() {
        return Err(DecodeError::FieldCount {
            expected: FIELDS.len(),
            actual: texts.len(),
        });
    }

    let mut values = Vec::with_capacity(FIELDS.len());
    let mut alternate = Vec::with_capacity(FIELDS.len());
    for (text, spec) in texts.iter().zip(FIELDS.iter()) {
        let (code, rest, alt) = if let Some(rest) = text.strip_prefix(spec.code) {
            (spec.code, rest, false)
        } else if let Some((alt, rest)) = spec
            .alt
            .and_then(|alt| text.strip_prefix(alt).map(|rest| (alt, rest)))
        {
            (alt, rest, true)
        } else {
            return Err(DecodeError::UnknownCode(text.to_string()));
        };

        let value = match spec.kind {
            FieldKind::Code | FieldKind::Flag => {
                let v: i64 = rest.parse().map_err(|_| DecodeError::NotNumeric {
                    field: code.to_string(),
                    value: text.to_string(),
                })?;
                if matches!(spec.kind, FieldKind::Flag) && !(0..=1).contains(&v) {
                    return Err(DecodeError::OutOfRange { what: "flag", value: v });
                }
                FieldValue::Int(v)
            }
            FieldKind::Number(quantity) => {
                FieldValue::Real(units::parse_quantity(code, rest, quantity)?)
            }
        };
        values.push(value);
        alternate.push(alt);
    }

    // HIL without LOL (or the reverse) is not a grammar any firmware sends
    if alternate[AMP] != alternate[OFS] {
        return Err(DecodeError::UnknownCode(texts[OFS].to_string()));
    }
    Ok(Fields { values, alternate })
}

fn burst_count(value: f64) -> Result<u32, DecodeError> {
    if value.fract() == 0.0 && (0.0..=f64::from(u32::MAX)).contains(&value) {
        Ok(value as u32)
    } else {
        Err(DecodeError::OutOfRange {
            what: "burst count",
            value: value as i64,
        })
    }
}

/// Decode one `CST` line.
pub fn decode_cst(line: &str) -> Result<GeneratorSettings, DecodeError> {
    let f = split_fields(line)?;
    let levels = if f.alternate[AMP] {
        OutputLevels::HighLow {
            high_v: f.real(AMP),
            low_v: f.real(OFS),
        }
    } else {
        OutputLevels::AmplitudeOffset {
            amplitude_v: f.real(AMP),
            offset_v: f.real(OFS),
        }
    };

    Ok(GeneratorSettings {
        mode: Mode::from_code(f.int(0))?,
        control: Control::from_code(f.int(1))?,
        trigger_slope: TriggerSlope::from_code(f.int(2))?,
        waveform: Waveform::from_code(f.int(3))?,
        haversine: f.flag(4),
        autovernier: f.flag(5),
        limit: f.flag(6),
        complement: f.flag(7),
        output_disabled: f.flag(8),
        burst_count: burst_count(f.real(9))?,
        repetition_s: f.real(10),
        sweep_start_hz: f.real(11),
        sweep_stop_hz: f.real(12),
        sweep_time_s: f.real(13),
        marker_hz: f.real(14),
        frequency_hz: f.real(15),
        duty_cycle_pct: f.real(16),
        width_s: f.real(17),
        levels,
    })
}

/// Write settings back out in `CST` grammar, numbers in base units.
pub fn encode_cst(s: &GeneratorSettings) -> String {
    let flag = |b: bool| u8::from(b);
    let (amp, ofs) = match s.levels {
        OutputLevels::AmplitudeOffset {
            amplitude_v,
            offset_v,
        } => (
            format!("AMP{}", format_base(amplitude_v, Quantity::Voltage)),
            format!("OFS{}", format_base(offset_v, Quantity::Voltage)),
        ),
        OutputLevels::HighLow { high_v, low_v } => (
            format!("HIL{}", format_base(high_v, Quantity::Voltage)),
            format!("LOL{}", format_base(low_v, Quantity::Voltage)),
        ),
    };
    [
        format!("M{}", s.mode.code()),
        format!("CT{}", s.control.code()),
        format!("T{}", s.trigger_slope.code()),
        format!("W{}", s.waveform.code()),
        format!("H{}", flag(s.haversine)),
        format!("A{}", flag(s.autovernier)),
        format!("L{}", flag(s.limit)),
        format!("C{}", flag(s.complement)),
        format!("D{}", flag(s.output_disabled)),
        format!("BUR{}#", s.burst_count),
        format!("RPT{}", format_base(s.repetition_s, Quantity::Time)),
        format!("STA{}", format_base(s.sweep_start_hz, Quantity::Frequency)),
        format!("STP{}", format_base(s.sweep_stop_hz, Quantity::Frequency)),
        format!("SWT{}", format_base(s.sweep_time_s, Quantity::Time)),
        format!("MRK{}", format_base(s.marker_hz, Quantity::Frequency)),
        format!("FRQ{}", format_base(s.frequency_hz, Quantity::Frequency)),
        format!("DTY{}", format_base(s.duty_cycle_pct, Quantity::Percent)),
        format!("WID{}", format_base(s.width_s, Quantity::Time)),
        amp,
        ofs,
    ]
    .join(",")
}

const FREQUENCY_SCALES: &[(&str, f64)] = &[("MHZ", 1e6), ("KHZ", 1e3), ("HZ", 1.0)];
const TIME_SCALES: &[(&str, f64)] = &[("S", 1.0), ("MS", 1e-3), ("US", 1e-6), ("NS", 1e-9)];
const VOLTAGE_SCALES: &[(&str, f64)] = &[("V", 1.0), ("MV", 1e-3)];

const STATUS_TABLE: StatusTable = &[
    StatusBit { mask: 0x40, flag: StatusFlag::ServiceRequest },
    StatusBit { mask: 0x20, flag: StatusFlag::ErrorPresent },
    StatusBit { mask: 0x10, flag: StatusFlag::CommandComplete },
];

/// HP 8116A protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hp8116a;

impl Hp8116a {
    fn set(text: String) -> CommandPlan {
        CommandPlan::new(
            AtomicSequence::new().write(format!("{text}\r\n")),
            CommandEffect::RequerySettings,
        )
    }
}

impl InstrumentModel for Hp8116a {
    fn name(&self) -> &'static str {
        "hp8116a"
    }

    fn status_table(&self) -> StatusTable {
        STATUS_TABLE
    }

    fn settings_query(&self) -> AtomicSequence {
        AtomicSequence::new().query_line("CST\r\n")
    }

    fn decode_settings(&self, output: &SequenceOutput) -> Result<Settings, DecodeError> {
        decode_cst(output.line(0)?).map(Settings::FunctionGenerator)
    }

    fn plan(&self, command: &Command, _current: &Settings) -> BusResult<CommandPlan> {
        let plan = match command.id() {
            CommandId::Nop => CommandPlan::nop(),
            CommandId::QuerySettings => {
                CommandPlan::new(self.settings_query(), CommandEffect::ReturnSettings)
            }
            CommandId::Reset => Self::set("CLR".to_string()),
            CommandId::SetFrequency => {
                let hz = check_range("frequency", command.f64_arg("hz")?, 1e-3, 50e6)?;
                Self::set(format!("FRQ {}", format_engineering(hz, FREQUENCY_SCALES)))
            }
            CommandId::SetAmplitude => {
                let v = check_range("amplitude", command.f64_arg("volts")?, 0.01, 16.0)?;
                Self::set(format!("AMP {}", format_engineering(v, VOLTAGE_SCALES)))
            }
            CommandId::SetOffset => {
                let v = check_range("offset", command.f64_arg("volts")?, -7.95, 7.95)?;
                Self::set(format!("OFS {}", format_engineering(v, VOLTAGE_SCALES)))
            }
            CommandId::SetDutyCycle => {
                let pct = check_range("duty cycle", command.f64_arg("percent")?, 10.0, 90.0)?;
                Self::set(format!("DTY {} %", units::trim_number(pct)))
            }
            CommandId::SetPulseWidth => {
                let s = check_range("pulse width", command.f64_arg("seconds")?, 8e-9, 0.95)?;
                Self::set(format!("WID {}", format_engineering(s, TIME_SCALES)))
            }
            CommandId::SetWaveform => {
                let name = command.str_arg("waveform")?;
                let waveform = Waveform::from_name(name)
                    .ok_or_else(|| BusError::validation(format!("unknown waveform '{name}'")))?;
                Self::set(format!("W{}", waveform.code()))
            }
            CommandId::SetMode => {
                let name = command.str_arg("mode")?;
                let mode = Mode::from_name(name)
                    .ok_or_else(|| BusError::validation(format!("unknown mode '{name}'")))?;
                Self::set(format!("M{}", mode.code()))
            }
            CommandId::SetOutputEnabled => {
                let enabled = command.bool_arg("enabled")?;
                Self::set(if enabled { "D0" } else { "D1" }.to_string())
            }
            _ => return Err(self.unsupported(command)),
        };
        Ok(plan)
    }

    fn status_after_command(&self) -> bool {
        true
    }

    fn error_query(&self) -> Option<AtomicSequence> {
        Some(AtomicSequence::new().query_line("IERR\r\n"))
    }
}
