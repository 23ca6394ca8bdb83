//! Capability traits
//!
//! Typed front ends over [`Instrument::execute`]. Every method builds a
//! [`Command`] and goes through the dispatcher, so calling a capability the
//! connected model lacks fails with [`BusError::Unsupported`] before anything
//! is sent.

use super::{Command, CommandId, Instrument, Snapshot};
use crate::error::{BusError, BusResult};
use crate::models::hp3478a::{Function, MultimeterSettings};
use crate::models::hp8116a::{GeneratorSettings, Waveform};
use crate::models::hp8560::AnalyzerSettings;
use crate::models::{Reading, ScalarReading, Trace};
use async_trait::async_trait;

/// Signal sources.
#[async_trait]
pub trait FunctionGenerator: Send + Sync {
    async fn set_frequency(&self, hz: f64) -> BusResult<()>;
    async fn set_amplitude(&self, volts: f64) -> BusResult<()>;
    async fn set_offset(&self, volts: f64) -> BusResult<()>;
    async fn set_waveform(&self, waveform: Waveform) -> BusResult<()>;
    async fn set_output_enabled(&self, enabled: bool) -> BusResult<()>;
    fn generator_settings(&self) -> BusResult<GeneratorSettings>;
}

/// Swept frequency-domain analyzers.
#[async_trait]
pub trait SpectrumAnalyzer: Send + Sync {
    async fn set_center_frequency(&self, hz: f64) -> BusResult<()>;
    async fn set_span(&self, hz: f64) -> BusResult<()>;
    async fn set_reference_level(&self, dbm: f64) -> BusResult<()>;
    async fn single_sweep(&self) -> BusResult<()>;
    async fn fetch_trace(&self) -> BusResult<Trace>;
    fn analyzer_settings(&self) -> BusResult<AnalyzerSettings>;
}

/// Digital multimeters.
#[async_trait]
pub trait Multimeter: Send + Sync {
    async fn set_function(&self, function: Function) -> BusResult<()>;
    /// `None` selects autorange.
    async fn set_range(&self, full_scale: Option<f64>) -> BusResult<()>;
    async fn set_digits(&self, digits: u8) -> BusResult<()>;
    async fn set_auto_zero(&self, enabled: bool) -> BusResult<()>;
    async fn measure(&self) -> BusResult<ScalarReading>;
    fn multimeter_settings(&self) -> BusResult<MultimeterSettings>;
}

impl Instrument {
    async fn run(&self, command: Command) -> BusResult<()> {
        self.execute(command).await.map(|_| ())
    }

    /// Run a reading command and return the reading it fetched itself.
    async fn fetch(&self, command: Command) -> BusResult<Snapshot<Reading>> {
        let operation = command.id();
        self.execute_outcome(command)
            .await?
            .reading
            .ok_or_else(|| self.unsupported(operation.as_str()))
    }

    fn unsupported(&self, operation: &str) -> BusError {
        BusError::unsupported(self.model_name(), operation)
    }
}

#[async_trait]
impl FunctionGenerator for Instrument {
    async fn set_frequency(&self, hz: f64) -> BusResult<()> {
        self.run(Command::new(CommandId::SetFrequency).with("hz", hz))
            .await
    }

    async fn set_amplitude(&self, volts: f64) -> BusResult<()> {
        self.run(Command::new(CommandId::SetAmplitude).with("volts", volts))
            .await
    }

    async fn set_offset(&self, volts: f64) -> BusResult<()> {
        self.run(Command::new(CommandId::SetOffset).with("volts", volts))
            .await
    }

    async fn set_waveform(&self, waveform: Waveform) -> BusResult<()> {
        self.run(Command::new(CommandId::SetWaveform).with("waveform", waveform.as_str()))
            .await
    }

    async fn set_output_enabled(&self, enabled: bool) -> BusResult<()> {
        self.run(Command::new(CommandId::SetOutputEnabled).with("enabled", enabled))
            .await
    }

    fn generator_settings(&self) -> BusResult<GeneratorSettings> {
        self.settings()
            .as_generator()
            .cloned()
            .ok_or_else(|| self.unsupported("generator_settings"))
    }
}

#[async_trait]
impl SpectrumAnalyzer for Instrument {
    async fn set_center_frequency(&self, hz: f64) -> BusResult<()> {
        self.run(Command::new(CommandId::SetCenterFrequency).with("hz", hz))
            .await
    }

    async fn set_span(&self, hz: f64) -> BusResult<()> {
        self.run(Command::new(CommandId::SetSpan).with("hz", hz))
            .await
    }

    async fn set_reference_level(&self, dbm: f64) -> BusResult<()> {
        self.run(Command::new(CommandId::SetReferenceLevel).with("dbm", dbm))
            .await
    }

    async fn single_sweep(&self) -> BusResult<()> {
        self.run(Command::new(CommandId::SingleSweep)).await
    }

    async fn fetch_trace(&self) -> BusResult<Trace> {
        let reading = self.fetch(Command::new(CommandId::FetchTrace)).await?;
        match reading.value().as_ref() {
            Reading::Trace(trace) => Ok(trace.clone()),
            _ => Err(self.unsupported("fetch_trace")),
        }
    }

    fn analyzer_settings(&self) -> BusResult<AnalyzerSettings> {
        self.settings()
            .as_analyzer()
            .cloned()
            .ok_or_else(|| self.unsupported("analyzer_settings"))
    }
}

#[async_trait]
impl Multimeter for Instrument {
    async fn set_function(&self, function: Function) -> BusResult<()> {
        self.run(Command::new(CommandId::SetFunction).with("function", function.as_str()))
            .await
    }

    async fn set_range(&self, full_scale: Option<f64>) -> BusResult<()> {
        let command = match full_scale {
            Some(value) => Command::new(CommandId::SetRange).with("full_scale", value),
            None => Command::new(CommandId::SetRange).with("auto", true),
        };
        self.run(command).await
    }

    async fn set_digits(&self, digits: u8) -> BusResult<()> {
        self.run(Command::new(CommandId::SetDigits).with("digits", digits))
            .await
    }

    async fn set_auto_zero(&self, enabled: bool) -> BusResult<()> {
        self.run(Command::new(CommandId::SetAutoZero).with("enabled", enabled))
            .await
    }

    async fn measure(&self) -> BusResult<ScalarReading> {
        let reading = self.fetch(Command::new(CommandId::Measure)).await?;
        match reading.value().as_ref() {
            Reading::Scalar(reading) => Ok(reading.clone()),
            _ => Err(self.unsupported("measure")),
        }
    }

    fn multimeter_settings(&self) -> BusResult<MultimeterSettings> {
        self.settings()
            .as_multimeter()
            .cloned()
            .ok_or_else(|| self.unsupported("multimeter_settings"))
    }
}
