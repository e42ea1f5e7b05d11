//! USB session layer.
//!
//! One session owns the claimed vendor interface of a connected scope and
//! serializes every transfer the engine issues. The protocol has two quirks
//! this layer preserves exactly: the connection speed is re-fetched before
//! every bulk transfer, and every bulk command is announced by a
//! begin-command control write immediately before the bulk body.
//!
//! The transfer primitives sit behind [`UsbTransport`]; production code uses
//! [`NusbTransport`], tests drive the session against a scripted endpoint.

use std::future::Future;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient, RequestBuffer, TransferError};
use nusb::Interface;
use tracing::{debug, info, trace, warn};

use crate::bulk::BulkCommand;
use crate::control::{BeginCommand, ConnectionSpeed, ControlRequest, GET_SPEED_RESPONSE_LEN};
use crate::error::DsoError;
use crate::model::ModelDescriptor;

/// Timeout for single USB transfers.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_millis(500);
/// Timeout per packet of a multi-packet read.
pub const TRANSFER_TIMEOUT_MULTI: Duration = Duration::from_millis(100);
/// Transfer attempts on timeout.
pub const TRANSFER_ATTEMPTS: i32 = 3;
/// Transfer attempts per packet of a multi-packet read.
pub const TRANSFER_ATTEMPTS_MULTI: i32 = 1;

/// Raw one-shot USB operations the session is built on.
///
/// Timeouts surface as [`DsoError::Timeout`], a pulled cable as
/// [`DsoError::NoDevice`]; the session's retry and disconnect policies key
/// off those two.
pub trait UsbTransport {
    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> impl Future<Output = Result<usize, DsoError>> + Send;

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<u8>, DsoError>> + Send;

    fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> impl Future<Output = Result<usize, DsoError>> + Send;

    fn bulk_in(
        &mut self,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<u8>, DsoError>> + Send;
}

fn map_transfer_error(error: TransferError) -> DsoError {
    match error {
        TransferError::Disconnected => DsoError::NoDevice,
        other => DsoError::Transfer(other),
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    transfer: impl Future<Output = Result<T, TransferError>>,
) -> Result<T, DsoError> {
    match tokio::time::timeout(timeout, transfer).await {
        Ok(result) => result.map_err(map_transfer_error),
        Err(_) => Err(DsoError::Timeout),
    }
}

/// [`UsbTransport`] over a claimed `nusb` interface.
pub struct NusbTransport {
    interface: Interface,
}

impl NusbTransport {
    pub fn new(interface: Interface) -> Self {
        Self { interface }
    }
}

impl UsbTransport for NusbTransport {
    async fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, DsoError> {
        let transfer = self.interface.control_out(ControlOut {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request,
            value,
            index,
            data,
        });
        let completion = with_timeout(timeout, async { transfer.await.into_result() }).await?;
        Ok(completion.actual_length())
    }

    async fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, DsoError> {
        let transfer = self.interface.control_in(ControlIn {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request,
            value,
            index,
            length: length as u16,
        });
        with_timeout(timeout, async { transfer.await.into_result() }).await
    }

    async fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, DsoError> {
        let transfer = self.interface.bulk_out(endpoint, data.to_vec());
        let completion = with_timeout(timeout, async { transfer.await.into_result() }).await?;
        Ok(completion.actual_length())
    }

    async fn bulk_in(
        &mut self,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, DsoError> {
        let transfer = self.interface.bulk_in(endpoint, RequestBuffer::new(length));
        with_timeout(timeout, async { transfer.await.into_result() }).await
    }
}

/// A connected (or administratively disconnected) device session.
///
/// Not internally synchronized: exactly one actor issues transfers. Any
/// transfer observing a pulled cable marks the session disconnected; all
/// further operations fail cleanly with `NoDevice` until a fresh session is
/// opened. The interface claim is released when the session drops.
pub struct UsbSession<T: UsbTransport> {
    transport: T,
    endpoint_in: u8,
    endpoint_out: u8,
    in_packet_length: usize,
    out_packet_length: usize,
    connected: bool,
    allow_bulk: bool,
}

impl UsbSession<NusbTransport> {
    /// Find, open and claim the vendor interface of the given model.
    ///
    /// Scans the first configuration for a vendor-specific interface with
    /// exactly two endpoints and records each endpoint's maximum packet
    /// size. A device enumerated with its pre-firmware ids fails with
    /// `NeedsFirmware`.
    pub async fn open(descriptor: &ModelDescriptor) -> Result<Self, DsoError> {
        info!("searching for {}", descriptor.name());
        let mut pre_firmware = false;
        let device_info = nusb::list_devices()?
            .find(|info| {
                if descriptor.matches(info.vendor_id(), info.product_id()) {
                    return true;
                }
                if descriptor.matches_no_firmware(info.vendor_id(), info.product_id()) {
                    pre_firmware = true;
                    return true;
                }
                false
            })
            .ok_or(DsoError::DeviceNotFound)?;
        if pre_firmware {
            return Err(DsoError::NeedsFirmware(descriptor.firmware_token));
        }

        info!(
            "found {} on bus {} addr {}",
            descriptor.name(),
            device_info.bus_number(),
            device_info.device_address()
        );
        let device = device_info.open()?;

        // The scopes expose a single vendor-specific interface with one IN
        // and one OUT bulk endpoint; everything else is ignored.
        let configuration = device.active_configuration().map_err(|error| {
            DsoError::Protocol(format!("no active configuration: {error}"))
        })?;
        let mut claimed = None;
        for group in configuration.interfaces() {
            let Some(alt) = group.alt_settings().next() else {
                continue;
            };
            if alt.class() != 0xff
                || alt.subclass() != 0
                || alt.protocol() != 0
                || alt.num_endpoints() != 2
            {
                continue;
            }
            let mut in_packet_length = 0;
            let mut out_packet_length = 0;
            for endpoint in alt.endpoints() {
                if endpoint.address() == descriptor.endpoint_out {
                    out_packet_length = endpoint.max_packet_size();
                } else if endpoint.address() == descriptor.endpoint_in {
                    in_packet_length = endpoint.max_packet_size();
                }
            }
            claimed = Some((group.interface_number(), in_packet_length, out_packet_length));
            break;
        }
        let (interface_number, in_packet_length, out_packet_length) = claimed.ok_or_else(|| {
            DsoError::Protocol("no vendor interface with two endpoints".into())
        })?;
        if in_packet_length == 0 || out_packet_length == 0 {
            return Err(DsoError::Protocol(format!(
                "endpoints {:#04x}/{:#04x} not found on the vendor interface",
                descriptor.endpoint_in, descriptor.endpoint_out
            )));
        }

        let interface = device.detach_and_claim_interface(interface_number)?;
        info!(
            "claimed interface {} (in {} bytes, out {} bytes)",
            interface_number, in_packet_length, out_packet_length
        );

        Ok(Self {
            transport: NusbTransport::new(interface),
            endpoint_in: descriptor.endpoint_in,
            endpoint_out: descriptor.endpoint_out,
            in_packet_length,
            out_packet_length,
            connected: true,
            allow_bulk: true,
        })
    }
}

impl<T: UsbTransport> UsbSession<T> {
    /// Wrap an already-claimed transport. Used by tests and firmware upload.
    pub fn from_transport(
        transport: T,
        endpoint_in: u8,
        endpoint_out: u8,
        in_packet_length: usize,
        out_packet_length: usize,
    ) -> Self {
        Self {
            transport,
            endpoint_in,
            endpoint_out,
            in_packet_length,
            out_packet_length,
            connected: true,
            allow_bulk: true,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Packet length of the IN endpoint, as discovered at claim time.
    pub fn in_packet_length(&self) -> usize {
        self.in_packet_length
    }

    pub fn out_packet_length(&self) -> usize {
        self.out_packet_length
    }

    /// Replace the discovered IN packet length (diagnostic hook).
    pub fn overwrite_in_packet_length(&mut self, length: usize) {
        self.in_packet_length = length;
    }

    /// Administratively enable or disable bulk transfers for this session.
    /// While disabled, `bulk_command` succeeds without any I/O.
    pub fn set_allow_bulk(&mut self, enable: bool) {
        self.allow_bulk = enable;
    }

    /// Mark the session disconnected. Idempotent; the claim itself is
    /// released when the session drops.
    pub fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            info!("session disconnected");
        }
    }

    fn connection_lost(&mut self) {
        if self.connected {
            warn!("device vanished during transfer");
        }
        self.disconnect();
    }

    fn ensure_connected(&self) -> Result<(), DsoError> {
        if self.connected {
            Ok(())
        } else {
            Err(DsoError::NoDevice)
        }
    }

    /// Vendor control write with retry-on-timeout.
    ///
    /// `attempts < 0` retries until success or a non-timeout error.
    pub async fn control_write(
        &mut self,
        request: ControlRequest,
        data: &[u8],
        attempts: i32,
    ) -> Result<usize, DsoError> {
        self.control_write_value(request, 0, 0, data, attempts).await
    }

    pub async fn control_write_value(
        &mut self,
        request: ControlRequest,
        value: u16,
        index: u16,
        data: &[u8],
        attempts: i32,
    ) -> Result<usize, DsoError> {
        self.ensure_connected()?;
        trace!(request = ?request, bytes = hex::encode(data), "control write");
        let mut attempt = 0;
        loop {
            let result = self
                .transport
                .control_out(request.into(), value, index, data, TRANSFER_TIMEOUT)
                .await;
            match result {
                Err(DsoError::Timeout) if attempts < 0 || attempt + 1 < attempts => {
                    attempt += 1;
                }
                Err(error) if error.is_disconnect() => {
                    self.connection_lost();
                    return Err(DsoError::NoDevice);
                }
                other => return other,
            }
        }
    }

    /// Vendor control read with retry-on-timeout.
    pub async fn control_read(
        &mut self,
        request: ControlRequest,
        value: u16,
        index: u16,
        length: usize,
        attempts: i32,
    ) -> Result<Vec<u8>, DsoError> {
        self.ensure_connected()?;
        let mut attempt = 0;
        loop {
            let result = self
                .transport
                .control_in(request.into(), value, index, length, TRANSFER_TIMEOUT)
                .await;
            match result {
                Err(DsoError::Timeout) if attempts < 0 || attempt + 1 < attempts => {
                    attempt += 1;
                }
                Err(error) if error.is_disconnect() => {
                    self.connection_lost();
                    return Err(DsoError::NoDevice);
                }
                Ok(data) => {
                    trace!(request = ?request, bytes = hex::encode(&data), "control read");
                    return Ok(data);
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Query the negotiated connection speed (control-in 0xb2).
    pub async fn get_connection_speed(&mut self) -> Result<ConnectionSpeed, DsoError> {
        let response = self
            .control_read(
                ControlRequest::GetSpeed,
                0,
                0,
                GET_SPEED_RESPONSE_LEN,
                TRANSFER_ATTEMPTS,
            )
            .await?;
        ConnectionSpeed::parse(&response)
    }

    /// Maximum bulk packet size for the negotiated speed. Unknown speed
    /// levels are a hard error, never a silent default.
    pub async fn get_packet_size(&mut self) -> Result<usize, DsoError> {
        Ok(self.get_connection_speed().await?.packet_size())
    }

    async fn bulk_out_retry(
        &mut self,
        data: &[u8],
        attempts: i32,
        timeout: Duration,
    ) -> Result<usize, DsoError> {
        self.ensure_connected()?;
        let mut attempt = 0;
        loop {
            let result = self
                .transport
                .bulk_out(self.endpoint_out, data, timeout)
                .await;
            match result {
                Err(DsoError::Timeout) if attempts < 0 || attempt + 1 < attempts => {
                    attempt += 1;
                }
                Err(error) if error.is_disconnect() => {
                    self.connection_lost();
                    return Err(DsoError::NoDevice);
                }
                other => return other,
            }
        }
    }

    async fn bulk_in_retry(
        &mut self,
        length: usize,
        attempts: i32,
        timeout: Duration,
    ) -> Result<Vec<u8>, DsoError> {
        self.ensure_connected()?;
        let mut attempt = 0;
        loop {
            let result = self.transport.bulk_in(self.endpoint_in, length, timeout).await;
            match result {
                Err(DsoError::Timeout) if attempts < 0 || attempt + 1 < attempts => {
                    attempt += 1;
                }
                Err(error) if error.is_disconnect() => {
                    self.connection_lost();
                    return Err(DsoError::NoDevice);
                }
                other => return other,
            }
        }
    }

    /// Bulk write, preceded by the mandatory speed query.
    pub async fn bulk_write(&mut self, data: &[u8], attempts: i32) -> Result<usize, DsoError> {
        self.ensure_connected()?;
        self.get_connection_speed().await?;
        trace!(bytes = hex::encode(data), "bulk write");
        self.bulk_out_retry(data, attempts, TRANSFER_TIMEOUT).await
    }

    /// Bulk read, preceded by the mandatory speed query.
    pub async fn bulk_read(&mut self, length: usize, attempts: i32) -> Result<Bytes, DsoError> {
        self.ensure_connected()?;
        self.get_connection_speed().await?;
        let data = self.bulk_in_retry(length, attempts, TRANSFER_TIMEOUT).await?;
        trace!(bytes = data.len(), "bulk read");
        Ok(Bytes::from(data))
    }

    /// Send a bulk command frame: begin-command preamble first, frame body
    /// immediately after, with no transfer in between.
    ///
    /// Returns success without any I/O while bulk transfers are
    /// administratively disabled.
    pub async fn bulk_command<C>(&mut self, command: &C, attempts: i32) -> Result<usize, DsoError>
    where
        C: BulkCommand + Sync + ?Sized,
    {
        self.ensure_connected()?;
        if !self.allow_bulk {
            return Ok(0);
        }

        let begin = BeginCommand::new(command.opcode());
        self.control_write(ControlRequest::BeginCommand, begin.as_bytes(), TRANSFER_ATTEMPTS)
            .await?;
        debug!(
            opcode = command.opcode(),
            bytes = hex::encode(command.as_bytes()),
            "bulk command"
        );
        self.bulk_write(command.as_bytes(), attempts).await
    }

    /// Multi-packet bulk read of `length` bytes.
    ///
    /// Issues ceil(length / in_packet_length) reads back-to-back with the
    /// longer multi timeout and stops at the first short packet. A complete
    /// buffer is returned as is; a partial one fails with `ShortRead`, and
    /// an empty one with the underlying transfer error.
    pub async fn bulk_read_multi(
        &mut self,
        length: usize,
        attempts: i32,
    ) -> Result<Bytes, DsoError> {
        self.ensure_connected()?;
        self.get_connection_speed().await?;

        let packet_length = self.in_packet_length;
        let mut data = BytesMut::with_capacity(length);
        while data.len() < length {
            let request = (length - data.len()).min(packet_length);
            let packet = match self
                .bulk_in_retry(request, attempts, TRANSFER_TIMEOUT_MULTI)
                .await
            {
                Ok(packet) => packet,
                Err(error) => {
                    if data.is_empty() {
                        return Err(error);
                    }
                    warn!(
                        received = data.len(),
                        expected = length,
                        "multi-packet read aborted: {error}"
                    );
                    return Err(DsoError::ShortRead {
                        expected: length,
                        got: data.len(),
                    });
                }
            };
            let received = packet.len();
            data.extend_from_slice(&packet);
            if received < request {
                return Err(DsoError::ShortRead {
                    expected: length,
                    got: data.len(),
                });
            }
        }
        Ok(data.freeze())
    }
}
