//! End-to-end acquisition against a scripted transport: configure, arm,
//! poll, fetch, decode, publish.

mod common;

use std::time::Duration;

use common::{capture_state_response, mock_session, BulkInStep};
use hantek_dso::model::DSO2090;
use hantek_dso::settings::{HorizontalTarget, SettingsSnapshot, TriggerMode};
use hantek_dso::{build_engine, DsoEvent};

fn settings_1msps() -> SettingsSnapshot {
    let mut settings = SettingsSnapshot::default();
    settings.horizontal.target = HorizontalTarget::Samplerate(1e6);
    settings.trigger.mode = TriggerMode::Normal;
    settings
}

#[tokio::test]
async fn full_capture_cycle_publishes_a_result() {
    let (transport, session) = mock_session(512);
    // One poll sees a complete buffer at trigger point 0, followed by the
    // 2 x 10240 sample bytes in 512-byte packets.
    transport.push_bulk_in(BulkInStep::Data(capture_state_response(3, 0)));
    for packet in 0..40u32 {
        transport.push_bulk_in(BulkInStep::Data(vec![packet as u8; 512]));
    }

    let (handle, mut events, engine) = build_engine(&DSO2090, session);
    let actor = tokio::spawn(engine.run());

    handle.apply_settings(settings_1msps()).unwrap();
    handle.start_capture();

    tokio::time::timeout(Duration::from_secs(5), handle.result_ready())
        .await
        .expect("no capture published");
    let capture = handle.take_result().expect("slot empty after notification");
    let ch1 = capture.channels[0].as_ref().expect("channel 1 missing");
    let ch2 = capture.channels[1].as_ref().expect("channel 2 missing");
    assert_eq!(ch1.voltage.len(), 10240);
    assert_eq!(ch2.voltage.len(), 10240);
    assert_eq!(ch1.interval, 1e-6);
    assert_eq!(capture.samplerate, 1e6);
    assert!(!capture.append);

    // The slot is a single slot: taking it leaves it empty.
    assert!(handle.take_result().is_none());

    // Connected comes first, CaptureReady once the slot was filled.
    let first = events.recv().await.expect("event stream closed");
    assert!(matches!(first, DsoEvent::Connected));
    let mut capture_ready = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(200), events.recv()).await
    {
        if matches!(event, DsoEvent::CaptureReady) {
            capture_ready = true;
            break;
        }
    }
    assert!(capture_ready);

    handle.stop_capture();
    handle.shutdown();
    actor.await.unwrap();
}

#[tokio::test]
async fn stop_capture_returns_to_configured_without_a_result() {
    let (transport, session) = mock_session(512);
    // The device keeps waiting; no capture completes.
    for _ in 0..4 {
        transport.push_bulk_in(BulkInStep::Data(capture_state_response(0, 0)));
    }

    let (handle, mut events, engine) = build_engine(&DSO2090, session);
    let actor = tokio::spawn(engine.run());

    handle.apply_settings(settings_1msps()).unwrap();
    handle.start_capture();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.stop_capture();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(handle.take_result().is_none());
    assert!(matches!(events.recv().await, Some(DsoEvent::Connected)));

    handle.shutdown();
    actor.await.unwrap();
}

#[tokio::test]
async fn disconnect_fires_exactly_once() {
    let (transport, session) = mock_session(512);
    transport.push_bulk_in(BulkInStep::Gone);

    let (handle, mut events, engine) = build_engine(&DSO2090, session);
    let actor = tokio::spawn(engine.run());

    handle.apply_settings(settings_1msps()).unwrap();
    handle.start_capture();

    assert!(matches!(events.recv().await, Some(DsoEvent::Connected)));
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no disconnect event");
    assert!(matches!(event, Some(DsoEvent::Disconnected)));

    // No further disconnect events; the stream stays quiet.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), events.recv())
            .await
            .is_err()
    );

    handle.shutdown();
    actor.await.unwrap();
}

#[tokio::test]
async fn invalid_settings_never_reach_the_wire() {
    let (transport, session) = mock_session(512);
    let (handle, _events, _engine) = build_engine(&DSO2090, session);

    let mut settings = settings_1msps();
    settings.trigger.position = 2.0;
    assert!(handle.apply_settings(settings).is_err());
    assert!(transport.log().is_empty());
}
