//! End-to-end behavior of the three instrument models.

mod common;

use parking_lot::Mutex;
use rust_gpib::models::hp3478a::Function;
use rust_gpib::models::hp8116a::Waveform;
use rust_gpib::transport::{BusCall, MockReply};
use rust_gpib::{
    BusError, Command, CommandId, FunctionGenerator, InstrumentListener, Multimeter, Reading,
    Settings, Snapshot, SpectrumAnalyzer, Status,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

#[tokio::test]
async fn test_generator_end_to_end() {
    let (fg, handle, _) = common::generator().await;
    assert_eq!(handle.writes(), vec!["CST\r\n"]);
    assert_eq!(fg.settings().version(), 1);

    fg.set_frequency(2.5e6).await.unwrap();
    fg.set_amplitude(0.5).await.unwrap();
    fg.set_waveform(Waveform::Square).await.unwrap();
    fg.set_output_enabled(false).await.unwrap();

    let settings = fg.generator_settings().unwrap();
    assert_eq!(settings.frequency_hz, 2.5e6);
    assert_eq!(settings.amplitude_v(), 0.5);
    assert_eq!(settings.waveform, Waveform::Square);
    assert!(settings.output_disabled);
    assert!(!settings.levels_provisional());
    assert!(fg.status().is_set(rust_gpib::StatusFlag::CommandComplete));

    let writes = handle.writes();
    assert!(writes.contains(&"FRQ 2.5 MHZ\r\n".to_string()));
    assert!(writes.contains(&"AMP 500 MV\r\n".to_string()));
    assert!(writes.contains(&"W3\r\n".to_string()));
    assert!(writes.contains(&"D1\r\n".to_string()));

    fg.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unchanged_settings_not_republished() {
    let (fg, _handle, _) = common::generator().await;
    let before = fg.settings();

    // already 1 kHz
    fg.set_frequency(1000.0).await.unwrap();
    assert_eq!(fg.settings().version(), before.version());
}

#[tokio::test]
async fn test_query_settings_returns_json() {
    let (fg, _handle, _) = common::generator().await;
    let value = fg
        .execute(Command::parse("query_settings", json!({})).unwrap())
        .await
        .unwrap();
    assert_eq!(value["kind"], "function_generator");
    assert_eq!(value["frequency_hz"], 1000.0);
}

#[tokio::test]
async fn test_nop_and_invalid_commands_touch_nothing() {
    let (fg, handle, _) = common::generator().await;
    let calls = handle.call_count();

    assert!(fg.execute(Command::new(CommandId::Nop)).await.unwrap().is_null());

    let err = fg
        .execute(Command::new(CommandId::SetFrequency).with("hz", -1.0))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Validation(_)));

    let err = fg.execute(Command::new(CommandId::SetAmplitude)).await.unwrap_err();
    assert!(matches!(err, BusError::Validation(_)));

    assert_eq!(handle.call_count(), calls);
}

#[tokio::test]
async fn test_unsupported_capability_touches_nothing() {
    let (fg, handle, _) = common::generator().await;
    let calls = handle.call_count();

    let err = fg.fetch_trace().await.unwrap_err();
    assert!(matches!(err, BusError::Unsupported { model: "hp8116a", .. }), "{err}");
    let err = fg.measure().await.unwrap_err();
    assert!(matches!(err, BusError::Unsupported { .. }));
    assert!(matches!(
        fg.analyzer_settings(),
        Err(BusError::Unsupported { .. })
    ));

    assert_eq!(handle.call_count(), calls);
}

#[tokio::test]
async fn test_analyzer_patch_and_sweep() {
    let (sa, handle, _) = common::analyzer().await;
    assert_eq!(handle.writes()[0], "TDF B;");

    let before = sa.settings().version();
    sa.set_center_frequency(300e6).await.unwrap();
    sa.set_span(2e6).await.unwrap();
    sa.set_reference_level(-20.0).await.unwrap();

    let settings = sa.analyzer_settings().unwrap();
    assert_eq!(settings.center_hz, 300e6);
    assert_eq!(settings.span_hz, 2e6);
    assert_eq!(settings.reference_level_dbm, -20.0);
    assert_eq!(settings.resolution_bandwidth_hz, 3e3);
    assert_eq!(sa.settings().version(), before + 3);
    // single-field read-back, no full re-query
    assert_eq!(
        handle.writes().iter().filter(|w| w.as_str() == "CF?;").count(),
        2
    );

    sa.single_sweep().await.unwrap();
    let trace = sa.fetch_trace().await.unwrap();
    assert_eq!(trace.samples.len(), 601);
    assert_eq!(trace.start_hz, 299e6);
    assert_eq!(trace.stop_hz, 301e6);
    assert_eq!(trace.settings.as_analyzer(), Some(&settings));

    let id = sa.execute(Command::new(CommandId::Identify)).await.unwrap();
    assert_eq!(id, "HP8563A");

    sa.shutdown().await.unwrap();
    assert_eq!(handle.writes().last().map(String::as_str), Some("CONTS;"));
}

#[tokio::test]
async fn test_multimeter_capabilities() {
    let (dmm, handle, _) = common::multimeter("+1.23456E+0").await;
    assert_eq!(handle.writes()[0], "M01\r\n");
    let settings = dmm.multimeter_settings().unwrap();
    assert_eq!(settings.function, Function::DcVolts);
    assert_eq!(settings.full_scale(), Some(3.0));

    dmm.set_function(Function::TwoWireOhms).await.unwrap();
    dmm.set_range(Some(3e3)).await.unwrap();
    dmm.set_digits(4).await.unwrap();
    dmm.set_auto_zero(false).await.unwrap();

    let settings = dmm.multimeter_settings().unwrap();
    assert_eq!(settings.function, Function::TwoWireOhms);
    assert_eq!(settings.full_scale(), Some(3e3));
    assert!(!settings.autozero);
    assert!(handle.writes().contains(&"R3\r\n".to_string()));
    assert!(handle.writes().contains(&"N4\r\n".to_string()));

    dmm.set_range(None).await.unwrap();
    assert!(dmm.multimeter_settings().unwrap().autorange);

    let reading = dmm.measure().await.unwrap();
    assert_eq!(reading.value, 1.23456);
    assert_eq!(reading.unit, "Ohm");
    assert!(matches!(*dmm.reading().value().as_ref(), Reading::Scalar(_)));

    let err = dmm.set_range(Some(42.0)).await.unwrap_err();
    assert!(matches!(err, BusError::Validation(_)));
}

#[tokio::test]
async fn test_multimeter_overload() {
    let (dmm, _handle, _) = common::multimeter("+9.99999E+9").await;
    assert!(dmm.measure().await.unwrap().overload);
}

#[tokio::test]
async fn test_measure_returns_its_own_reading() {
    let (dmm, handle, _) = common::multimeter("+1.23456E+0").await;
    // T3 answers with its own line; the second one waits for the next poll
    handle.set_responder(|cmd| match cmd.trim_end() {
        "T3" => vec![
            MockReply::line("+1.23456E+0"),
            MockReply::line("+7.77777E+0"),
        ],
        _ => vec![],
    });
    handle.set_latency(Duration::from_millis(30));
    let dmm = Arc::new(dmm);

    let measuring = tokio::spawn({
        let dmm = dmm.clone();
        async move { dmm.measure().await }
    });
    // the dispatcher holds the bus; queue a data-ready poll behind it
    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.push(MockReply::Status(0x01));
    let polling = tokio::spawn({
        let dmm = dmm.clone();
        async move { dmm.poll_now().await }
    });

    polling.await.unwrap().unwrap();
    let reading = measuring.await.unwrap().unwrap();
    assert_eq!(reading.value, 1.23456);

    let Reading::Scalar(latest) = dmm.reading().value().as_ref().clone() else {
        panic!("expected a scalar reading");
    };
    assert_eq!(latest.value, 7.77777);
}

#[tokio::test]
async fn test_fetch_outcome_carries_published_reading() {
    let (sa, _handle, _) = common::analyzer().await;
    let outcome = sa
        .execute_outcome(Command::new(CommandId::FetchTrace))
        .await
        .unwrap();
    let snapshot = outcome.reading.unwrap();
    assert_eq!(snapshot.version(), sa.reading().version());
    assert_eq!(outcome.value["samples"].as_array().map(Vec::len), Some(601));

    let outcome = sa
        .execute_outcome(Command::new(CommandId::Identify))
        .await
        .unwrap();
    assert!(outcome.reading.is_none());
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
    fail: bool,
}

impl InstrumentListener for Recorder {
    fn on_settings(&self, settings: &Snapshot<Settings>) -> anyhow::Result<()> {
        self.seen.lock().push(format!("settings:{}", settings.version()));
        if self.fail {
            anyhow::bail!("recorder refuses");
        }
        Ok(())
    }

    fn on_status(&self, status: &Snapshot<Status>) -> anyhow::Result<()> {
        self.seen.lock().push(format!("status:{:#04x}", status.raw()));
        Ok(())
    }

    fn on_reading(&self, reading: &Snapshot<Reading>) -> anyhow::Result<()> {
        self.seen.lock().push(format!("reading:{}", reading.version()));
        Ok(())
    }
}

#[tokio::test]
#[traced_test]
async fn test_listeners_see_every_publish_in_order() {
    let (fg, _handle, _) = common::generator().await;
    let failing = Arc::new(Recorder {
        fail: true,
        ..Default::default()
    });
    let healthy = Arc::new(Recorder::default());
    fg.add_listener(failing.clone());
    fg.add_listener(healthy.clone());

    fg.set_frequency(2000.0).await.unwrap();
    fg.set_frequency(3000.0).await.unwrap();
    fg.session().flush_listeners().await;

    let expected = vec!["settings:2", "status:0x10", "settings:4"];
    assert_eq!(*healthy.seen.lock(), expected);
    assert_eq!(*failing.seen.lock(), expected);
    assert!(logs_contain("Listener failed"));
}

#[tokio::test]
async fn test_shutdown_without_goodbye_sequence() {
    let (fg, handle, _) = common::generator().await;
    let session = fg.session().clone();
    fg.shutdown().await.unwrap();

    // no goodbye sequence for this model
    assert!(!handle.calls().contains(&BusCall::SerialPoll));
    assert_eq!(session.settings().version(), 1);
}
