//! HP 3478A digital multimeter
//!
//! Commands end in `\r\n`. The `B` command answers with five raw status
//! bytes rather than text:
//!
//! | byte | contents                                                   |
//! |------|------------------------------------------------------------|
//! | 0    | function (bits 7-5), range (bits 4-2), digits (bits 1-0)   |
//! | 1    | trigger/autorange/autozero/50 Hz/front/cal/ext-trigger bits |
//! | 2    | SRQ mask                                                   |
//! | 3    | error register                                             |
//! | 4    | DAC value                                                  |
//!
//! Readings are plain text lines such as `+1.23456E+0`; an overloaded input
//! reads `+9.99999E+9`.

use super::{
    check_range, CommandEffect, CommandPlan, InstrumentModel, Reading, ScalarReading, Settings,
    StatusBit, StatusFlag, StatusTable,
};
use crate::bus::{AtomicSequence, SequenceOutput};
use crate::error::{BusError, BusResult, DecodeError};
use crate::instrument::{Command, CommandId};
use serde::Serialize;
use std::sync::Arc;

coded_enum! {
    /// Measurement function.
    Function, "function" {
        DcVolts = 1 => "dcv",
        AcVolts = 2 => "acv",
        TwoWireOhms = 3 => "ohm2",
        FourWireOhms = 4 => "ohm4",
        DcCurrent = 5 => "dci",
        AcCurrent = 6 => "aci",
        ExtendedOhms = 7 => "ohmx",
    }
}

coded_enum! {
    /// Display resolution.
    Digits, "digits" {
        FiveHalf = 1 => "5.5",
        FourHalf = 2 => "4.5",
        ThreeHalf = 3 => "3.5",
    }
}

impl Digits {
    /// Whole digits, as used by the `N` command.
    pub fn whole(self) -> u8 {
        match self {
            Digits::FiveHalf => 5,
            Digits::FourHalf => 4,
            Digits::ThreeHalf => 3,
        }
    }
}

impl Function {
    pub fn unit(self) -> &'static str {
        match self {
            Function::DcVolts | Function::AcVolts => "V",
            Function::DcCurrent | Function::AcCurrent => "A",
            Function::TwoWireOhms | Function::FourWireOhms | Function::ExtendedOhms => "Ohm",
        }
    }

    /// Full-scale values of ranges 1.., and the `R` exponent of range 1.
    fn ranges(self) -> (&'static [f64], i8) {
        match self {
            Function::DcVolts => (&[0.03, 0.3, 3.0, 30.0, 300.0], -2),
            Function::AcVolts => (&[0.3, 3.0, 30.0, 300.0], -1),
            Function::TwoWireOhms | Function::FourWireOhms | Function::ExtendedOhms => {
                (&[30.0, 300.0, 3e3, 3e4, 3e5, 3e6, 3e7], 1)
            }
            Function::DcCurrent | Function::AcCurrent => (&[0.3, 3.0], -1),
        }
    }

    /// Full scale of range `code` (1-based), if the function has it.
    pub fn full_scale(self, code: u8) -> Option<f64> {
        let (table, _) = self.ranges();
        table.get(usize::from(code).checked_sub(1)?).copied()
    }

    /// `R` command argument selecting `full_scale`.
    fn range_exponent(self, full_scale: f64) -> Option<i8> {
        let (table, first) = self.ranges();
        table
            .iter()
            .position(|v| ((v - full_scale) / v).abs() < 1e-9)
            .and_then(|index| i8::try_from(index).ok())
            .map(|index| first + index)
    }
}

/// Decoded `B` response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultimeterSettings {
    pub function: Function,
    /// 1-based range index within the function
    pub range_code: u8,
    pub digits: Digits,
    pub internal_trigger: bool,
    pub autorange: bool,
    pub autozero: bool,
    pub line_50hz: bool,
    pub front_terminals: bool,
    pub calibration_enabled: bool,
    pub external_trigger: bool,
    pub srq_mask: u8,
    pub error_register: u8,
    pub dac: u8,
}

/// Sparse update for [`MultimeterSettings::patch`].
#[derive(Debug, Clone, Default)]
pub struct MultimeterPatch {
    pub function: Option<Function>,
    pub range_code: Option<u8>,
    pub digits: Option<Digits>,
    pub autorange: Option<bool>,
    pub autozero: Option<bool>,
}

impl MultimeterSettings {
    /// Full scale of the selected range.
    pub fn full_scale(&self) -> Option<f64> {
        self.function.full_scale(self.range_code)
    }

    /// Copy with the fields set in `patch` replaced.
    pub fn patch(&self, patch: MultimeterPatch) -> Self {
        Self {
            function: patch.function.unwrap_or(self.function),
            range_code: patch.range_code.unwrap_or(self.range_code),
            digits: patch.digits.unwrap_or(self.digits),
            autorange: patch.autorange.unwrap_or(self.autorange),
            autozero: patch.autozero.unwrap_or(self.autozero),
            ..self.clone()
        }
    }
}

const FLAG_BITS: u8 = 7;

/// Decode the five `B` bytes.
pub fn decode_status_bytes(bytes: &[u8]) -> Result<MultimeterSettings, DecodeError> {
    let [b0, b1, srq_mask, error_register, dac] = <[u8; 5]>::try_from(bytes).map_err(|_| {
        DecodeError::Length {
            expected: 5,
            actual: bytes.len(),
        }
    })?;
    if b1 >> FLAG_BITS != 0 {
        return Err(DecodeError::OutOfRange {
            what: "flag byte",
            value: i64::from(b1),
        });
    }

    let function = Function::from_code(i64::from(b0 >> 5))?;
    let range_code = (b0 >> 2) & 0b111;
    if function.full_scale(range_code).is_none() {
        return Err(DecodeError::OutOfRange {
            what: "range",
            value: i64::from(range_code),
        });
    }
    let bit = |n: u8| b1 & (1 << n) != 0;

    Ok(MultimeterSettings {
        function,
        range_code,
        digits: Digits::from_code(i64::from(b0 & 0b11))?,
        internal_trigger: bit(0),
        autorange: bit(1),
        autozero: bit(2),
        line_50hz: bit(3),
        front_terminals: bit(4),
        calibration_enabled: bit(5),
        external_trigger: bit(6),
        srq_mask,
        error_register,
        dac,
    })
}

/// Inverse of [`decode_status_bytes`].
pub fn encode_status_bytes(s: &MultimeterSettings) -> [u8; 5] {
    let flags = [
        s.internal_trigger,
        s.autorange,
        s.autozero,
        s.line_50hz,
        s.front_terminals,
        s.calibration_enabled,
        s.external_trigger,
    ]
    .iter()
    .enumerate()
    .fold(0u8, |acc, (n, set)| acc | (u8::from(*set) << n));
    [
        (s.function.code() << 5) | ((s.range_code & 0b111) << 2) | s.digits.code(),
        flags,
        s.srq_mask,
        s.error_register,
        s.dac,
    ]
}

const ERROR_BITS: [(u8, &str); 6] = [
    (0x01, "calibration checksum"),
    (0x02, "RAM failure"),
    (0x04, "ROM failure"),
    (0x08, "A/D slope error"),
    (0x10, "A/D self-test failed"),
    (0x20, "A/D link failure"),
];

/// Readings at or above this magnitude mean "overload".
const OVERLOAD: f64 = 9.99999e9;

const STATUS_TABLE: StatusTable = &[
    StatusBit { mask: 0x40, flag: StatusFlag::ServiceRequest },
    StatusBit { mask: 0x08, flag: StatusFlag::ErrorPresent },
    StatusBit { mask: 0x04, flag: StatusFlag::ErrorPresent },
    StatusBit { mask: 0x01, flag: StatusFlag::MeasurementComplete },
];

/// HP 3478A protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hp3478a;

impl Hp3478a {
    fn set(text: String) -> CommandPlan {
        CommandPlan::new(
            AtomicSequence::new().write(format!("{text}\r\n")),
            CommandEffect::RequerySettings,
        )
    }

    fn range_command(command: &Command, current: &Settings) -> BusResult<String> {
        if command.has_arg("auto") && command.bool_arg("auto")? {
            return Ok("RA".to_string());
        }
        let full_scale = command.f64_arg("full_scale")?;
        let function = current
            .as_multimeter()
            .map(|s| s.function)
            .ok_or_else(|| BusError::validation("range needs the current function"))?;
        function
            .range_exponent(full_scale)
            .map(|exp| format!("R{exp}"))
            .ok_or_else(|| {
                BusError::validation(format!(
                    "{} has no {full_scale} {} range",
                    function.as_str(),
                    function.unit()
                ))
            })
    }
}

impl InstrumentModel for Hp3478a {
    fn name(&self) -> &'static str {
        "hp3478a"
    }

    fn status_table(&self) -> StatusTable {
        STATUS_TABLE
    }

    fn init_sequence(&self) -> AtomicSequence {
        // SRQ on data ready
        AtomicSequence::new().write("M01\r\n")
    }

    fn settings_query(&self) -> AtomicSequence {
        AtomicSequence::new().query_n("B\r\n", 5)
    }

    fn decode_settings(&self, output: &SequenceOutput) -> Result<Settings, DecodeError> {
        decode_status_bytes(output.bytes(0)?).map(Settings::Multimeter)
    }

    fn plan(&self, command: &Command, current: &Settings) -> BusResult<CommandPlan> {
        let plan = match command.id() {
            CommandId::Nop => CommandPlan::nop(),
            CommandId::QuerySettings => {
                CommandPlan::new(self.settings_query(), CommandEffect::ReturnSettings)
            }
            CommandId::Reset => Self::set("H0".to_string()),
            CommandId::SetFunction => {
                let name = command.str_arg("function")?;
                let function = Function::from_name(name)
                    .ok_or_else(|| BusError::validation(format!("unknown function '{name}'")))?;
                Self::set(format!("F{}", function.code()))
            }
            CommandId::SetRange => Self::set(Self::range_command(command, current)?),
            CommandId::SetDigits => {
                let digits = check_range("digits", command.i64_arg("digits")? as f64, 3.0, 5.0)?;
                Self::set(format!("N{digits}"))
            }
            CommandId::SetAutoZero => {
                let enabled = command.bool_arg("enabled")?;
                Self::set(format!("Z{}", u8::from(enabled)))
            }
            CommandId::Measure => CommandPlan::new(
                AtomicSequence::new().write("T3\r\n").read_line(),
                CommandEffect::ReturnReading,
            ),
            _ => return Err(self.unsupported(command)),
        };
        Ok(plan)
    }

    fn error_query(&self) -> Option<AtomicSequence> {
        Some(AtomicSequence::new().query_line("E\r\n"))
    }

    fn decode_text(&self, output: &SequenceOutput) -> Result<String, DecodeError> {
        let text = output.line(0)?;
        let register = u8::from_str_radix(text, 8).map_err(|_| DecodeError::NotNumeric {
            field: "E".to_string(),
            value: text.to_string(),
        })?;
        let causes: Vec<&str> = ERROR_BITS
            .iter()
            .filter(|(mask, _)| register & mask != 0)
            .map(|(_, name)| *name)
            .collect();
        if causes.is_empty() {
            Ok(format!("error register {register:#05o}: none"))
        } else {
            Ok(format!("error register {register:#05o}: {}", causes.join(", ")))
        }
    }

    fn reading_trigger(&self) -> Option<StatusFlag> {
        Some(StatusFlag::MeasurementComplete)
    }

    fn reading_query(&self, _settings: &Settings) -> Option<AtomicSequence> {
        Some(AtomicSequence::new().read_line())
    }

    fn decode_reading(
        &self,
        output: &SequenceOutput,
        settings: Arc<Settings>,
    ) -> Result<Reading, DecodeError> {
        let raw = output.reads().last().ok_or(DecodeError::Length {
            expected: 1,
            actual: 0,
        })?;
        let text = std::str::from_utf8(raw)
            .map_err(|_| DecodeError::NotText)?
            .trim();
        let value = super::parse_number("reading", text)?;
        let unit = settings
            .as_multimeter()
            .map(|s| s.function.unit())
            .unwrap_or("");
        Ok(Reading::Scalar(ScalarReading {
            value,
            unit,
            overload: value.abs() >= OVERLOAD,
            settings,
        }))
    }
}
