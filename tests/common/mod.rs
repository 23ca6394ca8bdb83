//! Simulated instruments for the integration tests.
//!
//! Each simulator is a responder closure on a [`MockTransport`] that keeps a
//! little front-panel state and answers the way the real instrument does.

#![allow(dead_code)]

use parking_lot::Mutex;
use rust_gpib::models::hp3478a::{encode_status_bytes, Digits, Function, MultimeterSettings};
use rust_gpib::transport::{MockHandle, MockReply};
use rust_gpib::{Instrument, InstrumentOptions, MockTransport, ModelKind};
use std::sync::Arc;
use std::time::Duration;

pub const CST_DEFAULT: &str = "M1,CT0,T0,W1,H0,A0,L0,C0,D0,BUR1#,RPT0NS,STA0HZ,STP0HZ,SWT0S,MRK0HZ,FRQ1000HZ,DTY50%,WID0NS,AMP2V,OFS0V";

/// Options with short timeouts and no periodic polling.
pub fn options() -> InstrumentOptions {
    let mut options = InstrumentOptions::default();
    options.timeouts.lock = Duration::from_millis(500);
    options.timeouts.io = Duration::from_millis(100);
    options.timeouts.wait = Duration::from_secs(2);
    options.poll_interval = None;
    options
}

/// Front panel of a simulated 8116A as its 20 `CST` fields.
pub fn generator_panel() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(
        CST_DEFAULT.split(',').map(str::to_string).collect(),
    ))
}

fn set_field(panel: &Mutex<Vec<String>>, prefix: &str, index: usize, value: &str) {
    panel.lock()[index] = format!("{prefix}{}", value.replace(' ', ""));
}

pub fn install_generator(handle: &MockHandle, panel: Arc<Mutex<Vec<String>>>) {
    handle.set_responder(move |cmd| {
        let cmd = cmd.trim_end();
        match cmd {
            "CST" => return vec![MockReply::line(&panel.lock().join(","))],
            "IERR" => return vec![MockReply::line("ERR 03 ILLEGAL PARAMETER")],
            "CLR" => {
                *panel.lock() = CST_DEFAULT.split(',').map(str::to_string).collect();
                return vec![];
            }
            _ => {}
        }
        for (prefix, index) in [("FRQ ", 15), ("DTY ", 16), ("WID ", 17), ("AMP ", 18), ("OFS ", 19)] {
            if let Some(value) = cmd.strip_prefix(prefix) {
                set_field(&panel, prefix.trim_end(), index, value);
            }
        }
        for (prefix, index) in [("W", 3), ("M", 0), ("D", 8)] {
            if let Some(value) = cmd.strip_prefix(prefix) {
                if value.len() == 1 {
                    set_field(&panel, prefix, index, value);
                }
            }
        }
        vec![]
    });
}

/// Connected 8116A simulator.
pub async fn generator() -> (Instrument, MockHandle, Arc<Mutex<Vec<String>>>) {
    let transport = MockTransport::new();
    let handle = transport.handle();
    let panel = generator_panel();
    install_generator(&handle, panel.clone());
    handle.set_idle_status(0x10);
    let instrument = Instrument::connect(
        "fg",
        Box::new(transport),
        ModelKind::Hp8116a.create(),
        options(),
    )
    .await
    .unwrap();
    (instrument, handle, panel)
}

/// Trace block as an 8560 sends it: magic, u16 BE length, samples, `;`.
pub fn trace_block(samples: &[i16]) -> Vec<u8> {
    let mut block = b"#TRACE-BLOCK".to_vec();
    block.extend_from_slice(&((samples.len() * 2) as u16).to_be_bytes());
    block.extend(samples.iter().flat_map(|s| s.to_be_bytes()));
    block.push(b';');
    block
}

pub struct AnalyzerPanel {
    pub center_hz: f64,
    pub span_hz: f64,
    pub reference_level_dbm: f64,
    pub trace: Vec<i16>,
}

impl Default for AnalyzerPanel {
    fn default() -> Self {
        Self {
            center_hz: 2.5e8,
            span_hz: 1e6,
            reference_level_dbm: -10.0,
            trace: (0..601).map(|i| -8000 + i as i16).collect(),
        }
    }
}

fn parse_mz(value: &str) -> f64 {
    let value = value.trim_end_matches(';');
    let (number, scale) = if let Some(n) = value.strip_suffix(" GZ") {
        (n, 1e9)
    } else if let Some(n) = value.strip_suffix(" MZ") {
        (n, 1e6)
    } else if let Some(n) = value.strip_suffix(" KZ") {
        (n, 1e3)
    } else {
        (value.trim_end_matches(" HZ"), 1.0)
    };
    number.trim().parse::<f64>().unwrap() * scale
}

pub fn install_analyzer(handle: &MockHandle, panel: Arc<Mutex<AnalyzerPanel>>) {
    handle.set_responder(move |cmd| {
        let mut p = panel.lock();
        match cmd {
            "CF?;" => vec![MockReply::line(&format!("{:E}", p.center_hz))],
            "SP?;" => vec![MockReply::line(&format!("{:E}", p.span_hz))],
            "RL?;" => vec![MockReply::line(&format!("{:.2}", p.reference_level_dbm))],
            "RB?;" | "VB?;" => vec![MockReply::line("3.0E+03")],
            "ST?;" => vec![MockReply::line("0.050")],
            "ERR?;" => vec![MockReply::line("112")],
            "MSG?;" => vec![MockReply::line("CAL COMPLETE")],
            "ID?;" => vec![MockReply::line("HP8563A")],
            "TRA?;" => vec![MockReply::bytes(trace_block(&p.trace))],
            _ => {
                if let Some(v) = cmd.strip_prefix("CF ") {
                    p.center_hz = parse_mz(v);
                } else if let Some(v) = cmd.strip_prefix("SP ") {
                    p.span_hz = parse_mz(v);
                } else if let Some(v) = cmd.strip_prefix("RL ") {
                    p.reference_level_dbm = v.trim_end_matches(" DM;").parse().unwrap();
                }
                vec![]
            }
        }
    });
}

/// Connected 8560 simulator.
pub async fn analyzer() -> (Instrument, MockHandle, Arc<Mutex<AnalyzerPanel>>) {
    let transport = MockTransport::new();
    let handle = transport.handle();
    let panel = Arc::new(Mutex::new(AnalyzerPanel::default()));
    install_analyzer(&handle, panel.clone());
    let instrument = Instrument::connect(
        "sa",
        Box::new(transport),
        ModelKind::Hp8560.create(),
        options(),
    )
    .await
    .unwrap();
    (instrument, handle, panel)
}

pub fn multimeter_panel() -> MultimeterSettings {
    MultimeterSettings {
        function: Function::DcVolts,
        range_code: 3,
        digits: Digits::FiveHalf,
        internal_trigger: true,
        autorange: false,
        autozero: true,
        line_50hz: false,
        front_terminals: true,
        calibration_enabled: false,
        external_trigger: false,
        srq_mask: 0x01,
        error_register: 0,
        dac: 0x80,
    }
}

pub fn install_multimeter(handle: &MockHandle, panel: Arc<Mutex<MultimeterSettings>>, value: &'static str) {
    handle.set_responder(move |cmd| {
        let cmd = cmd.trim_end();
        let mut p = panel.lock();
        match cmd {
            "B" => vec![MockReply::bytes(encode_status_bytes(&p).to_vec())],
            "T3" => vec![MockReply::line(value)],
            "E" => vec![MockReply::line("044")],
            "RA" => {
                p.autorange = true;
                vec![]
            }
            _ => {
                if let Some(code) = cmd.strip_prefix('F') {
                    p.function = Function::from_code(code.parse().unwrap()).unwrap();
                } else if let Some(n) = cmd.strip_prefix('N') {
                    p.digits = match n {
                        "5" => Digits::FiveHalf,
                        "4" => Digits::FourHalf,
                        _ => Digits::ThreeHalf,
                    };
                } else if let Some(z) = cmd.strip_prefix('Z') {
                    p.autozero = z == "1";
                } else if let Some(exp) = cmd.strip_prefix('R') {
                    let exp: i64 = exp.parse().unwrap();
                    let first = match p.function {
                        Function::DcVolts => -2,
                        Function::AcVolts | Function::DcCurrent | Function::AcCurrent => -1,
                        _ => 1,
                    };
                    p.range_code = (exp - first + 1) as u8;
                    p.autorange = false;
                }
                vec![]
            }
        }
    });
}

/// Connected 3478A simulator answering every trigger with `value`.
pub async fn multimeter(value: &'static str) -> (Instrument, MockHandle, Arc<Mutex<MultimeterSettings>>) {
    let transport = MockTransport::new();
    let handle = transport.handle();
    let panel = Arc::new(Mutex::new(multimeter_panel()));
    install_multimeter(&handle, panel.clone(), value);
    let instrument = Instrument::connect(
        "dmm",
        Box::new(transport),
        ModelKind::Hp3478a.create(),
        options(),
    )
    .await
    .unwrap();
    (instrument, handle, panel)
}
