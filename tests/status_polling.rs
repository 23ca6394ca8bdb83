//! Serial-poll decoding, follow-up queries and reading fetches.

mod common;

use rust_gpib::models::{Reading, StatusFlag};
use rust_gpib::transport::{BusCall, MockReply};
use rust_gpib::{Instrument, InstrumentOptions, MockTransport, ModelKind};
use std::time::Duration;

#[tokio::test]
async fn test_error_and_end_of_sweep() {
    let (sa, handle, _) = common::analyzer().await;
    handle.push(MockReply::Status(0x24));

    let status = sa.poll_now().await.unwrap();
    assert!(status.is_set(StatusFlag::ErrorPresent));
    assert!(status.is_set(StatusFlag::EndOfSweep));
    assert!(!status.is_set(StatusFlag::ServiceRequest));
    assert!(!status.is_set(StatusFlag::MessagePresent));
    assert_eq!(status.error_text(), Some("112"));
    assert_eq!(sa.status().raw(), 0x24);

    let reading = sa.reading();
    let Reading::Trace(trace) = reading.value().as_ref() else {
        panic!("expected a trace, got {:?}", reading.value());
    };
    assert_eq!(trace.samples.len(), 601);
    assert_eq!(trace.samples[0], -80.0);
    assert_eq!(trace.start_hz, 2.495e8);
    assert_eq!(trace.stop_hz, 2.505e8);

    let status = sa.poll_now().await.unwrap();
    assert!(status.flags().is_empty());
    assert_eq!(sa.status().raw(), 0x00);
    assert_eq!(sa.status().error_text(), None);
}

#[tokio::test]
async fn test_unchanged_status_is_not_republished() {
    let (sa, _handle, _) = common::analyzer().await;

    sa.poll_now().await.unwrap();
    let first = sa.status();
    assert!(!first.is_placeholder());

    sa.poll_now().await.unwrap();
    assert_eq!(sa.status().version(), first.version());
}

#[tokio::test]
async fn test_message_text_follow_up() {
    let (sa, handle, _) = common::analyzer().await;
    handle.push(MockReply::Status(0x02));

    let status = sa.poll_now().await.unwrap();
    assert!(status.is_set(StatusFlag::MessagePresent));
    assert_eq!(status.message_text(), Some("CAL COMPLETE"));
    assert!(handle.writes().contains(&"MSG?;".to_string()));
}

#[tokio::test]
async fn test_failed_serial_poll_publishes_nothing() {
    let (sa, handle, _) = common::analyzer().await;
    let before = sa.status();
    handle.fail_call(handle.call_count());

    assert!(sa.poll_now().await.is_err());
    assert_eq!(sa.status().version(), before.version());
}

#[tokio::test]
async fn test_failed_trace_fetch_keeps_status() {
    let (sa, handle, _) = common::analyzer().await;
    handle.push(MockReply::Status(0x04));
    // serial poll succeeds, the trace query write fails
    handle.fail_call(handle.call_count() + 1);

    let status = sa.poll_now().await.unwrap();
    assert!(status.is_set(StatusFlag::EndOfSweep));
    assert_eq!(sa.status().raw(), 0x04);
    assert!(sa.reading().is_placeholder());
}

#[tokio::test]
async fn test_service_request_wakes_poller() {
    let (sa, handle, _) = common::analyzer().await;
    let mut status = sa.subscribe_status();
    handle.push(MockReply::Status(0x50));

    sa.service_request();
    tokio::time::timeout(Duration::from_secs(1), status.changed())
        .await
        .unwrap()
        .unwrap();
    let snapshot = status.borrow().clone();
    assert!(snapshot.is_set(StatusFlag::ServiceRequest));
    assert!(snapshot.is_set(StatusFlag::CommandComplete));
}

#[tokio::test]
async fn test_periodic_polling() {
    let transport = MockTransport::new();
    let handle = transport.handle();
    common::install_generator(&handle, common::generator_panel());
    handle.set_idle_status(0x10);
    let mut options = common::options();
    options.poll_interval = Some(Duration::from_millis(20));

    let fg = Instrument::connect("fg", Box::new(transport), ModelKind::Hp8116a.create(), options)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(fg.status().is_set(StatusFlag::CommandComplete));
    let polls = handle
        .calls()
        .iter()
        .filter(|c| **c == BusCall::SerialPoll)
        .count();
    assert!(polls >= 2, "only {polls} polls");
    fg.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_multimeter_data_ready_and_error_register() {
    let (dmm, handle, _) = common::multimeter("+1.23456E+0").await;
    handle.push(MockReply::Status(0x01));
    handle.push(MockReply::line("+4.50000E-1"));

    dmm.poll_now().await.unwrap();
    let Reading::Scalar(reading) = dmm.reading().value().as_ref().clone() else {
        panic!("expected a scalar reading");
    };
    assert_eq!(reading.value, 0.45);
    assert_eq!(reading.unit, "V");
    assert!(!reading.overload);

    handle.push(MockReply::Status(0x04));
    let status = dmm.poll_now().await.unwrap();
    assert!(status.is_set(StatusFlag::ErrorPresent));
    let text = status.error_text().unwrap();
    assert!(text.contains("ROM failure"), "{text}");
    assert!(text.contains("A/D link failure"), "{text}");
}

#[test]
fn test_options_default_polls() {
    assert_eq!(
        InstrumentOptions::default().poll_interval,
        Some(Duration::from_millis(500))
    );
}
