//! Common test utilities: a scripted USB transport and response builders.

// Shared across multiple test files; not every item is used in every file.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use hantek_dso::control::GET_SPEED_RESPONSE_LEN;
use hantek_dso::{DsoError, UsbSession, UsbTransport};

/// One transfer as seen by the scripted endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    ControlOut {
        request: u8,
        value: u16,
        data: Vec<u8>,
    },
    ControlIn {
        request: u8,
        length: usize,
    },
    BulkOut {
        endpoint: u8,
        data: Vec<u8>,
    },
    BulkIn {
        endpoint: u8,
        length: usize,
    },
}

/// Scripted outcome of one bulk IN transfer.
#[derive(Debug, Clone)]
pub enum BulkInStep {
    Data(Vec<u8>),
    Timeout,
    Gone,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub log: Vec<Op>,
    pub bulk_in: VecDeque<BulkInStep>,
    pub control_in: VecDeque<Vec<u8>>,
    pub speed_byte: u8,
    pub bulk_out_gone: bool,
}

/// A scripted [`UsbTransport`]. Cloning shares the state, so a test keeps a
/// view on the log while the session owns the transport.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn push_bulk_in(&self, step: BulkInStep) {
        self.state().bulk_in.push_back(step);
    }

    pub fn log(&self) -> Vec<Op> {
        self.state().log.clone()
    }
}

impl UsbTransport for MockTransport {
    async fn control_out(
        &mut self,
        request: u8,
        value: u16,
        _index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, DsoError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(Op::ControlOut {
            request,
            value,
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    async fn control_in(
        &mut self,
        request: u8,
        _value: u16,
        _index: u16,
        length: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, DsoError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(Op::ControlIn { request, length });
        if request == 0xb2 {
            let mut response = vec![0u8; GET_SPEED_RESPONSE_LEN.min(length)];
            if let Some(first) = response.first_mut() {
                *first = state.speed_byte;
            }
            return Ok(response);
        }
        Ok(state
            .control_in
            .pop_front()
            .unwrap_or_else(|| vec![0u8; length]))
    }

    async fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, DsoError> {
        let mut state = self.state.lock().unwrap();
        if state.bulk_out_gone {
            return Err(DsoError::NoDevice);
        }
        state.log.push(Op::BulkOut {
            endpoint,
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    async fn bulk_in(
        &mut self,
        endpoint: u8,
        length: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, DsoError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(Op::BulkIn { endpoint, length });
        match state.bulk_in.pop_front() {
            Some(BulkInStep::Data(data)) => Ok(data),
            Some(BulkInStep::Timeout) | None => Err(DsoError::Timeout),
            Some(BulkInStep::Gone) => Err(DsoError::NoDevice),
        }
    }
}

/// A session over a fresh scripted transport with the conventional
/// endpoints and the given IN packet length.
pub fn mock_session(in_packet_length: usize) -> (MockTransport, UsbSession<MockTransport>) {
    let transport = MockTransport::new();
    let session = UsbSession::from_transport(
        transport.clone(),
        0x86,
        0x02,
        in_packet_length,
        in_packet_length,
    );
    (transport, session)
}

/// A 512-byte capture state response with the trigger point spread over
/// bytes {2, 3, 1} = {low, mid, high}.
pub fn capture_state_response(state: u8, trigger_point: u32) -> Vec<u8> {
    let mut response = vec![0u8; 512];
    response[0] = state;
    response[2] = trigger_point as u8;
    response[3] = (trigger_point >> 8) as u8;
    response[1] = (trigger_point >> 16) as u8;
    response
}

pub fn hex_to_bytes(hex_data: &str) -> Vec<u8> {
    hex::decode(hex_data).expect("failed to decode hex")
}
