//! Immutable value types published by the engine.
//!
//! A [`Settings`] value is never edited in place. Commands either publish a
//! freshly decoded value or build a new one with a model's `patch`, which
//! copies every field the patch leaves unset.

use super::hp3478a::MultimeterSettings;
use super::hp8116a::GeneratorSettings;
use super::hp8560::AnalyzerSettings;
use serde::Serialize;
use std::sync::Arc;

/// Configuration of one instrument, as last reported by the instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Settings {
    /// Nothing decoded yet
    Unknown,
    FunctionGenerator(GeneratorSettings),
    SpectrumAnalyzer(AnalyzerSettings),
    Multimeter(MultimeterSettings),
}

impl Settings {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Settings::Unknown)
    }

    pub fn as_generator(&self) -> Option<&GeneratorSettings> {
        match self {
            Settings::FunctionGenerator(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_analyzer(&self) -> Option<&AnalyzerSettings> {
        match self {
            Settings::SpectrumAnalyzer(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_multimeter(&self) -> Option<&MultimeterSettings> {
        match self {
            Settings::Multimeter(s) => Some(s),
            _ => None,
        }
    }
}

/// Latest measurement of an instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reading {
    /// Nothing measured yet
    Unknown,
    Trace(Trace),
    Scalar(ScalarReading),
}

impl Reading {
    /// Settings in force when the reading was taken.
    pub fn settings(&self) -> Option<&Arc<Settings>> {
        match self {
            Reading::Unknown => None,
            Reading::Trace(t) => Some(&t.settings),
            Reading::Scalar(s) => Some(&s.settings),
        }
    }
}

/// Swept trace: evenly spaced samples between `start_hz` and `stop_hz`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trace {
    pub samples: Vec<f64>,
    pub unit: &'static str,
    pub start_hz: f64,
    pub stop_hz: f64,
    #[serde(skip)]
    pub settings: Arc<Settings>,
}

impl Trace {
    /// Frequency of sample `index`.
    pub fn frequency_at(&self, index: usize) -> Option<f64> {
        match self.samples.len() {
            0 => None,
            _ if index >= self.samples.len() => None,
            1 => Some(self.start_hz),
            n => {
                let step = (self.stop_hz - self.start_hz) / (n - 1) as f64;
                Some(self.start_hz + step * index as f64)
            }
        }
    }

    /// Largest sample and its frequency.
    pub fn peak(&self) -> Option<(f64, f64)> {
        let (index, value) = self
            .samples
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))?;
        Some((self.frequency_at(index)?, value))
    }
}

/// Single measured value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalarReading {
    pub value: f64,
    pub unit: &'static str,
    /// Input exceeded the selected range
    pub overload: bool,
    #[serde(skip)]
    pub settings: Arc<Settings>,
}
