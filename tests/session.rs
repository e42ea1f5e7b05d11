//! Session-level behavior against a scripted transport: speed negotiation,
//! the begin-command pairing, retry policy, multi-packet reads and
//! disconnect handling.

mod common;

use common::{capture_state_response, mock_session, BulkInStep, Op};
use hantek_dso::bulk::{BulkCommand, GetData, SetGain};
use hantek_dso::control::ConnectionSpeed;
use hantek_dso::device::{TRANSFER_ATTEMPTS, TRANSFER_ATTEMPTS_MULTI};
use hantek_dso::DsoError;

#[tokio::test]
async fn speed_maps_to_packet_size() {
    let (transport, mut session) = mock_session(64);
    transport.state().speed_byte = 0;
    assert_eq!(session.get_connection_speed().await.unwrap(), ConnectionSpeed::FullSpeed);
    assert_eq!(session.get_packet_size().await.unwrap(), 64);

    transport.state().speed_byte = 1;
    assert_eq!(session.get_packet_size().await.unwrap(), 512);

    transport.state().speed_byte = 2;
    assert!(matches!(
        session.get_packet_size().await,
        Err(DsoError::UnknownSpeed(2))
    ));
}

#[tokio::test]
async fn bulk_command_pairs_preamble_and_body() {
    let (transport, mut session) = mock_session(64);
    let frame = SetGain::new(1, 2);
    session.bulk_command(&frame, TRANSFER_ATTEMPTS).await.unwrap();

    let log = transport.log();
    // Begin-command first, then the speed query, then the frame body, with
    // nothing else in between.
    assert_eq!(
        log[0],
        Op::ControlOut {
            request: 0xb3,
            value: 0,
            data: vec![0x0f, 0x07, 0x07, 0x07, 0, 0, 0, 0, 0, 0],
        }
    );
    assert!(matches!(log[1], Op::ControlIn { request: 0xb2, .. }));
    assert_eq!(
        log[2],
        Op::BulkOut {
            endpoint: 0x02,
            data: frame.as_bytes().to_vec(),
        }
    );
    assert_eq!(log.len(), 3);
}

#[tokio::test]
async fn every_bulk_write_is_announced() {
    let (transport, mut session) = mock_session(64);
    for _ in 0..3 {
        session
            .bulk_command(&GetData::new(), TRANSFER_ATTEMPTS)
            .await
            .unwrap();
    }

    // Property: a bulk OUT is always directly preceded by its announcement
    // (modulo the unobservable speed query).
    let log: Vec<Op> = transport
        .log()
        .into_iter()
        .filter(|op| !matches!(op, Op::ControlIn { request: 0xb2, .. }))
        .collect();
    for (index, op) in log.iter().enumerate() {
        if let Op::BulkOut { data, .. } = op {
            match &log[index - 1] {
                Op::ControlOut { request: 0xb3, data: preamble, .. } => {
                    assert_eq!(preamble[1], data[0]);
                    assert_eq!(preamble[2], data[0]);
                    assert_eq!(preamble[3], data[0]);
                }
                other => panic!("bulk write preceded by {other:?}"),
            }
        }
    }
}

#[tokio::test]
async fn disabled_bulk_transfers_are_a_silent_success() {
    let (transport, mut session) = mock_session(64);
    session.set_allow_bulk(false);
    session
        .bulk_command(&GetData::new(), TRANSFER_ATTEMPTS)
        .await
        .unwrap();
    assert!(transport.log().is_empty());
}

#[tokio::test]
async fn bulk_read_refetches_speed_first() {
    let (transport, mut session) = mock_session(64);
    transport.push_bulk_in(BulkInStep::Data(capture_state_response(0, 0)));
    session.bulk_read(512, TRANSFER_ATTEMPTS).await.unwrap();

    let log = transport.log();
    assert!(matches!(log[0], Op::ControlIn { request: 0xb2, .. }));
    assert!(matches!(log[1], Op::BulkIn { endpoint: 0x86, .. }));
}

#[tokio::test]
async fn timeouts_are_retried_up_to_the_attempt_count() {
    let (transport, mut session) = mock_session(64);
    transport.push_bulk_in(BulkInStep::Timeout);
    transport.push_bulk_in(BulkInStep::Timeout);
    transport.push_bulk_in(BulkInStep::Data(vec![1, 2, 3, 4]));
    let data = session.bulk_read(4, 3).await.unwrap();
    assert_eq!(data, vec![1, 2, 3, 4]);

    let (transport, mut session) = mock_session(64);
    transport.push_bulk_in(BulkInStep::Timeout);
    transport.push_bulk_in(BulkInStep::Timeout);
    transport.push_bulk_in(BulkInStep::Data(vec![1, 2, 3, 4]));
    assert!(matches!(
        session.bulk_read(4, 2).await,
        Err(DsoError::Timeout)
    ));
}

#[tokio::test]
async fn multi_read_splits_into_ceil_len_over_packet() {
    let (transport, mut session) = mock_session(64);
    for _ in 0..3 {
        transport.push_bulk_in(BulkInStep::Data(vec![0xaa; 64]));
    }
    // 160 bytes over 64-byte packets: 64 + 64 + 32.
    let mut shortened = transport.state().bulk_in.pop_back().unwrap();
    if let BulkInStep::Data(data) = &mut shortened {
        data.truncate(32);
    }
    transport.state().bulk_in.push_back(shortened);

    let data = session.bulk_read_multi(160, TRANSFER_ATTEMPTS_MULTI).await.unwrap();
    assert_eq!(data.len(), 160);

    let requests: Vec<usize> = transport
        .log()
        .iter()
        .filter_map(|op| match op {
            Op::BulkIn { length, .. } => Some(*length),
            _ => None,
        })
        .collect();
    assert_eq!(requests, vec![64, 64, 32]);
}

#[tokio::test]
async fn multi_read_reports_short_reads() {
    let (transport, mut session) = mock_session(64);
    transport.push_bulk_in(BulkInStep::Data(vec![0u8; 64]));
    transport.push_bulk_in(BulkInStep::Data(vec![0u8; 10]));
    assert!(matches!(
        session.bulk_read_multi(160, TRANSFER_ATTEMPTS_MULTI).await,
        Err(DsoError::ShortRead {
            expected: 160,
            got: 74,
        })
    ));

    // Nothing at all arrives: the underlying error surfaces instead.
    let (transport, mut session) = mock_session(64);
    transport.push_bulk_in(BulkInStep::Timeout);
    assert!(matches!(
        session.bulk_read_multi(160, TRANSFER_ATTEMPTS_MULTI).await,
        Err(DsoError::Timeout)
    ));
}

#[tokio::test]
async fn pulled_cable_disconnects_the_session() {
    let (transport, mut session) = mock_session(64);
    transport.push_bulk_in(BulkInStep::Gone);
    assert!(matches!(
        session.bulk_read_multi(128, TRANSFER_ATTEMPTS_MULTI).await,
        Err(DsoError::NoDevice)
    ));
    assert!(!session.is_connected());

    // Everything after the disconnect fails cleanly without touching the
    // wire.
    let before = transport.log().len();
    assert!(matches!(
        session.bulk_write(&[0x05, 0x00], TRANSFER_ATTEMPTS).await,
        Err(DsoError::NoDevice)
    ));
    assert!(matches!(
        session.get_connection_speed().await,
        Err(DsoError::NoDevice)
    ));
    assert_eq!(transport.log().len(), before);

    // A fresh session (re-open, packet size re-measured) works again.
    let (_transport, mut session) = mock_session(512);
    assert_eq!(session.in_packet_length(), 512);
    assert!(session.get_connection_speed().await.is_ok());
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let (_transport, mut session) = mock_session(64);
    session.disconnect();
    session.disconnect();
    assert!(!session.is_connected());
}
