//! The acquisition actor.
//!
//! One dedicated task owns the USB session and drives the capture state
//! machine; external collaborators talk to it through [`DsoHandle`] and
//! listen on the [`DsoEvent`] stream. Commands are picked up at poll
//! boundaries, so a stop request interrupts the cycle without tearing down
//! an in-flight transfer.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::bulk;
use crate::bulk::{CaptureState, CaptureStateResponse, CAPTURE_STATE_RESPONSE_LEN};
use crate::config::{compose_configuration, unfold_trigger_point, AcquisitionPlan};
use crate::control::{CalibrationData, ControlRequest, ControlValue};
use crate::device::{
    NusbTransport, UsbSession, UsbTransport, TRANSFER_ATTEMPTS, TRANSFER_ATTEMPTS_MULTI,
};
use crate::dispatch::ResultSlot;
use crate::error::DsoError;
use crate::firmware::{self, FirmwareProvider};
use crate::model::ModelDescriptor;
use crate::samples::{decode_capture, CaptureResult};
use crate::settings::{SettingsSnapshot, TriggerMode};

/// How long polling may wait for a trigger in auto mode before one is
/// forced.
pub const DEFAULT_FORCE_TRIGGER_WINDOW: Duration = Duration::from_secs(2);

/// How long to wait for renumeration after a firmware upload.
const RENUMERATION_TIMEOUT: Duration = Duration::from_secs(10);
const RENUMERATION_POLL: Duration = Duration::from_millis(500);

/// Events published to external collaborators.
#[derive(Debug)]
pub enum DsoEvent {
    Connected,
    Disconnected,
    FirmwareRequired,
    /// A fresh capture is waiting in the result slot.
    CaptureReady,
    Error(DsoError),
}

enum EngineCommand {
    ApplySettings(Box<SettingsSnapshot>),
    StartCapture,
    StopCapture,
    ForceTrigger,
    Shutdown,
}

/// Phase of the acquisition state machine, kept for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Detached,
    Connected,
    Configured,
    Armed,
    Capturing,
    Fetching,
    Delivered,
}

/// Roll-mode command sequencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RollState {
    StartSampling,
    EnableTrigger,
    ForceTrigger,
    GetData,
}

impl RollState {
    fn next(self) -> Self {
        match self {
            RollState::StartSampling => RollState::EnableTrigger,
            RollState::EnableTrigger => RollState::ForceTrigger,
            RollState::ForceTrigger => RollState::GetData,
            RollState::GetData => RollState::StartSampling,
        }
    }
}

/// Consumer-facing handle to a running acquisition actor.
#[derive(Clone)]
pub struct DsoHandle {
    descriptor: &'static ModelDescriptor,
    commands: mpsc::Sender<EngineCommand>,
    slot: Arc<ResultSlot>,
}

impl DsoHandle {
    pub fn descriptor(&self) -> &'static ModelDescriptor {
        self.descriptor
    }

    /// Validate and hand a settings snapshot to the actor. Rejected
    /// combinations never reach the device.
    pub fn apply_settings(&self, settings: SettingsSnapshot) -> Result<(), DsoError> {
        settings.validate(self.descriptor)?;
        self.commands
            .try_send(EngineCommand::ApplySettings(Box::new(settings)))
            .map_err(|_| DsoError::NoDevice)
    }

    pub fn start_capture(&self) {
        let _ = self.commands.try_send(EngineCommand::StartCapture);
    }

    pub fn stop_capture(&self) {
        let _ = self.commands.try_send(EngineCommand::StopCapture);
    }

    pub fn force_trigger(&self) {
        let _ = self.commands.try_send(EngineCommand::ForceTrigger);
    }

    pub fn shutdown(&self) {
        let _ = self.commands.try_send(EngineCommand::Shutdown);
    }

    /// Take ownership of the freshest capture, if one is waiting.
    pub fn take_result(&self) -> Option<CaptureResult> {
        self.slot.take()
    }

    /// Wait until the next capture is published.
    pub async fn result_ready(&self) {
        self.slot.ready().await;
    }
}

/// Assemble the actor, its handle and its event stream around an open
/// session.
pub fn build_engine<T: UsbTransport>(
    descriptor: &'static ModelDescriptor,
    session: UsbSession<T>,
) -> (DsoHandle, mpsc::Receiver<DsoEvent>, AcquisitionEngine<T>) {
    let (command_tx, command_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(32);
    let slot = Arc::new(ResultSlot::new());
    let handle = DsoHandle {
        descriptor,
        commands: command_tx,
        slot: Arc::clone(&slot),
    };
    let engine = AcquisitionEngine {
        descriptor,
        session,
        settings: SettingsSnapshot::default(),
        calibration: CalibrationData::default(),
        plan: None,
        state: EngineState::Detached,
        sampling: false,
        capture_started: false,
        cycle_counter: 0,
        start_cycle: 0,
        cycle_time: Duration::from_millis(100),
        waiting_since: None,
        force_trigger_window: DEFAULT_FORCE_TRIGGER_WINDOW,
        roll_state: RollState::StartSampling,
        previous_sample_count: 0,
        trigger_point: 0,
        slot,
        events: event_tx,
        commands: command_rx,
        disconnect_reported: false,
        announce_firmware: false,
    };
    (handle, event_rx, engine)
}

/// A connected oscilloscope: handle, event stream and the actor itself.
/// Await or spawn [`AcquisitionEngine::run`] to start acquisition.
pub struct Dso {
    pub handle: DsoHandle,
    pub events: mpsc::Receiver<DsoEvent>,
    pub engine: AcquisitionEngine<NusbTransport>,
}

impl Dso {
    /// Open the first device matching the descriptor. A device that
    /// enumerated with its pre-firmware ids fails with `NeedsFirmware`.
    pub async fn connect(descriptor: &'static ModelDescriptor) -> Result<Self, DsoError> {
        let session = UsbSession::open(descriptor).await?;
        let (handle, events, engine) = build_engine(descriptor, session);
        Ok(Self {
            handle,
            events,
            engine,
        })
    }

    /// Open the device, uploading firmware through the provider when the
    /// device still runs its boot loader, then waiting for renumeration.
    pub async fn connect_with_firmware(
        descriptor: &'static ModelDescriptor,
        provider: &dyn FirmwareProvider,
    ) -> Result<Self, DsoError> {
        match UsbSession::open(descriptor).await {
            Ok(session) => {
                let (handle, events, engine) = build_engine(descriptor, session);
                return Ok(Self {
                    handle,
                    events,
                    engine,
                });
            }
            Err(DsoError::NeedsFirmware(_)) => {}
            Err(error) => return Err(error),
        }

        let device_info = nusb::list_devices()?
            .find(|info| descriptor.matches_no_firmware(info.vendor_id(), info.product_id()))
            .ok_or(DsoError::DeviceNotFound)?;
        let device = device_info.open()?;
        let interface = device.detach_and_claim_interface(0)?;
        let mut transport = NusbTransport::new(interface);
        firmware::upload(&mut transport, descriptor, provider).await?;
        drop(transport);

        let deadline = Instant::now() + RENUMERATION_TIMEOUT;
        loop {
            tokio::time::sleep(RENUMERATION_POLL).await;
            match UsbSession::open(descriptor).await {
                Ok(session) => {
                    let (handle, events, mut engine) = build_engine(descriptor, session);
                    engine.announce_firmware = true;
                    return Ok(Self {
                        handle,
                        events,
                        engine,
                    });
                }
                Err(DsoError::DeviceNotFound) | Err(DsoError::NeedsFirmware(_))
                    if Instant::now() < deadline => {}
                Err(error) => return Err(error),
            }
        }
    }
}

/// The acquisition state machine. Single owner of the USB session.
pub struct AcquisitionEngine<T: UsbTransport> {
    descriptor: &'static ModelDescriptor,
    session: UsbSession<T>,
    settings: SettingsSnapshot,
    calibration: CalibrationData,
    plan: Option<AcquisitionPlan>,
    state: EngineState,
    sampling: bool,
    capture_started: bool,
    cycle_counter: u32,
    start_cycle: u32,
    cycle_time: Duration,
    waiting_since: Option<Instant>,
    force_trigger_window: Duration,
    roll_state: RollState,
    previous_sample_count: usize,
    trigger_point: u32,
    slot: Arc<ResultSlot>,
    events: mpsc::Sender<DsoEvent>,
    commands: mpsc::Receiver<EngineCommand>,
    disconnect_reported: bool,
    announce_firmware: bool,
}

impl<T: UsbTransport> AcquisitionEngine<T> {
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Change the auto-mode force-trigger window.
    pub fn set_force_trigger_window(&mut self, window: Duration) {
        self.force_trigger_window = window;
    }

    /// Run the actor until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        if self.announce_firmware {
            let _ = self.events.send(DsoEvent::FirmwareRequired).await;
        }
        self.state = EngineState::Connected;
        let _ = self.events.send(DsoEvent::Connected).await;
        info!("acquisition actor running for {}", self.descriptor.name());

        match self.read_calibration().await {
            Ok(()) => {}
            Err(error) if error.is_disconnect() => self.fail(error).await,
            Err(error) => {
                warn!("calibration read failed, keeping full-range defaults: {error}");
                let _ = self.events.send(DsoEvent::Error(error)).await;
            }
        }

        loop {
            let active = self.sampling && self.session.is_connected();
            if active {
                match timeout(self.cycle_time, self.commands.recv()).await {
                    Ok(Some(command)) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {}
                }
            } else {
                match self.commands.recv().await {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                }
            }

            if self.sampling && self.session.is_connected() {
                if let Err(error) = self.capture_cycle().await {
                    self.fail(error).await;
                }
            }
        }
        debug!("acquisition actor stopped");
    }

    async fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::ApplySettings(settings) => {
                self.settings = *settings;
                if let Err(error) = self.configure().await {
                    self.fail(error).await;
                }
            }
            EngineCommand::StartCapture => {
                if self.plan.is_none() {
                    if let Err(error) = self.configure().await {
                        self.fail(error).await;
                        return true;
                    }
                }
                if self.session.is_connected() {
                    self.sampling = true;
                    self.capture_started = false;
                    self.cycle_counter = 0;
                    self.roll_state = RollState::StartSampling;
                    self.state = EngineState::Armed;
                    debug!("capture armed");
                } else {
                    let _ = self.events.send(DsoEvent::Error(DsoError::NoDevice)).await;
                }
            }
            EngineCommand::StopCapture => {
                self.sampling = false;
                if self.session.is_connected() {
                    self.state = EngineState::Configured;
                }
                debug!("capture stopped");
            }
            EngineCommand::ForceTrigger => {
                if self.session.is_connected() {
                    if let Err(error) = self
                        .session
                        .bulk_command(&bulk::ForceTrigger::new(), TRANSFER_ATTEMPTS)
                        .await
                    {
                        self.fail(error).await;
                    }
                }
            }
            EngineCommand::Shutdown => return false,
        }
        true
    }

    /// Recompose and transmit the frame set for the current settings.
    async fn configure(&mut self) -> Result<(), DsoError> {
        let configuration =
            compose_configuration(self.descriptor, &self.settings, &self.calibration)?;
        for frame in &configuration.bulk {
            self.session
                .bulk_command(frame.as_ref(), TRANSFER_ATTEMPTS)
                .await?;
        }
        for control in &configuration.controls {
            self.session
                .control_write(control.request, &control.payload, TRANSFER_ATTEMPTS)
                .await?;
        }
        self.cycle_time = configuration
            .plan
            .cycle_time(self.session.in_packet_length());
        self.plan = Some(configuration.plan);
        if !self.sampling {
            self.state = EngineState::Configured;
        }
        debug!(
            samplerate = configuration.plan.samplerate,
            fast_rate = configuration.plan.fast_rate,
            cycle_ms = self.cycle_time.as_millis() as u64,
            "configuration pushed"
        );
        Ok(())
    }

    async fn read_calibration(&mut self) -> Result<(), DsoError> {
        let data = self
            .session
            .control_read(
                ControlRequest::Value,
                u16::from(u8::from(ControlValue::OffsetLimits)),
                0,
                CalibrationData::LEN,
                TRANSFER_ATTEMPTS,
            )
            .await?;
        self.calibration = CalibrationData::parse(&data)?;
        debug!("channel calibration loaded");
        Ok(())
    }

    async fn capture_cycle(&mut self) -> Result<(), DsoError> {
        let Some(plan) = self.plan else {
            return Ok(());
        };
        if plan.is_roll_mode() {
            self.roll_cycle(plan).await
        } else {
            self.standard_cycle(plan).await
        }
    }

    async fn standard_cycle(&mut self, plan: AcquisitionPlan) -> Result<(), DsoError> {
        self.roll_state = RollState::StartSampling;

        let response = match self.query_capture_state().await {
            Ok(response) => response,
            Err(DsoError::Protocol(reason)) => {
                // Malformed device input: drop the frame and resume polling.
                warn!("dropping capture state response: {reason}");
                return Ok(());
            }
            Err(error) => return Err(error),
        };
        self.trigger_point = unfold_trigger_point(response.trigger_point);

        match response.state {
            CaptureState::ReadyToRead => {
                self.state = EngineState::Fetching;
                self.fetch(plan, false).await?;
                if plan.trigger_mode == TriggerMode::Single && self.capture_started {
                    self.sampling = false;
                    self.state = EngineState::Configured;
                    debug!("single capture complete");
                }
                self.capture_started = false;
                if self.sampling {
                    self.start_sampling_cycle(plan).await?;
                }
            }
            CaptureState::Waiting => {
                self.previous_sample_count =
                    plan.sample_count(self.session.in_packet_length());
                if self.capture_started {
                    self.cycle_counter += 1;
                    if self.cycle_counter == self.start_cycle {
                        // The buffer has refilled since capture start; the
                        // trigger may be armed now.
                        self.session
                            .bulk_command(&bulk::EnableTrigger::new(), TRANSFER_ATTEMPTS)
                            .await?;
                        debug!("trigger enabled");
                    } else if plan.trigger_mode == TriggerMode::Auto
                        && self
                            .waiting_since
                            .is_some_and(|since| since.elapsed() >= self.force_trigger_window)
                    {
                        self.session
                            .bulk_command(&bulk::ForceTrigger::new(), TRANSFER_ATTEMPTS)
                            .await?;
                        self.waiting_since = Some(Instant::now());
                        debug!("trigger forced after timeout");
                    }
                    let cycle_ms = self.cycle_time.as_millis().max(1) as u32;
                    if self.cycle_counter < 20 || self.cycle_counter < 4000 / cycle_ms {
                        return Ok(());
                    }
                }
                self.start_sampling_cycle(plan).await?;
            }
            CaptureState::Sampling | CaptureState::Triggered => {
                self.state = EngineState::Capturing;
            }
        }
        Ok(())
    }

    async fn roll_cycle(&mut self, plan: AcquisitionPlan) -> Result<(), DsoError> {
        match self.roll_state {
            RollState::StartSampling => {
                if !self.sampling {
                    return Ok(());
                }
                self.previous_sample_count =
                    plan.sample_count(self.session.in_packet_length());
                self.session
                    .bulk_command(&bulk::CaptureStart::new(), TRANSFER_ATTEMPTS)
                    .await?;
                self.capture_started = true;
                self.state = EngineState::Capturing;
            }
            RollState::EnableTrigger => {
                self.session
                    .bulk_command(&bulk::EnableTrigger::new(), TRANSFER_ATTEMPTS)
                    .await?;
            }
            RollState::ForceTrigger => {
                self.session
                    .bulk_command(&bulk::ForceTrigger::new(), TRANSFER_ATTEMPTS)
                    .await?;
            }
            RollState::GetData => {
                if self.capture_started {
                    self.state = EngineState::Fetching;
                    self.fetch(plan, true).await?;
                }
                self.capture_started = false;
            }
        }
        self.roll_state = self.roll_state.next();
        Ok(())
    }

    async fn start_sampling_cycle(&mut self, plan: AcquisitionPlan) -> Result<(), DsoError> {
        self.session
            .bulk_command(&bulk::CaptureStart::new(), TRANSFER_ATTEMPTS)
            .await?;
        self.capture_started = true;
        self.cycle_counter = 0;
        // The trigger may only arm once the pretrigger part of the buffer
        // has been filled.
        let record_samples = plan.record_length.samples().unwrap_or(0);
        let pretrigger_ms =
            plan.trigger_position * f64::from(record_samples) / plan.samplerate * 1000.0;
        let cycle_ms = self.cycle_time.as_millis().max(1) as f64;
        self.start_cycle = (pretrigger_ms / cycle_ms) as u32 + 1;
        self.waiting_since = Some(Instant::now());
        self.state = EngineState::Capturing;
        debug!("capture started");
        Ok(())
    }

    async fn query_capture_state(&mut self) -> Result<CaptureStateResponse, DsoError> {
        self.session
            .bulk_command(&bulk::GetCaptureState::new(), 1)
            .await?;
        let data = self
            .session
            .bulk_read(CAPTURE_STATE_RESPONSE_LEN, TRANSFER_ATTEMPTS)
            .await?;
        CaptureStateResponse::parse(&data)
    }

    /// Fetch, decode and publish one capture. A short read is retried once
    /// with a fresh request before it surfaces.
    async fn fetch(&mut self, plan: AcquisitionPlan, append: bool) -> Result<(), DsoError> {
        let raw = match self.read_samples(plan).await {
            Ok(raw) => raw,
            Err(DsoError::ShortRead { expected, got }) => {
                warn!("short capture read ({got} of {expected} bytes), retrying once");
                self.read_samples(plan).await?
            }
            Err(error) => return Err(error),
        };

        let trigger_point = if append { 0 } else { self.trigger_point };
        let result = decode_capture(&raw, self.descriptor, &plan, trigger_point, append)?;
        self.slot.publish(result);
        let _ = self.events.send(DsoEvent::CaptureReady).await;
        self.state = EngineState::Delivered;
        Ok(())
    }

    async fn read_samples(&mut self, plan: AcquisitionPlan) -> Result<Bytes, DsoError> {
        self.session
            .bulk_command(&bulk::GetData::new(), 1)
            .await?;

        let mut total = plan.sample_count(self.session.in_packet_length());
        // A record-length change may leave the previous, larger capture in
        // the scope buffer; drain it completely once.
        if total < self.previous_sample_count {
            std::mem::swap(&mut total, &mut self.previous_sample_count);
        } else {
            self.previous_sample_count = total;
        }

        let length = total * self.descriptor.raw_bytes_per_sample();
        self.session
            .bulk_read_multi(length, TRANSFER_ATTEMPTS_MULTI)
            .await
    }

    /// Route a cycle failure: disconnects unwind the machine, everything
    /// else surfaces on the event stream and polling resumes.
    async fn fail(&mut self, error: DsoError) {
        if error.is_disconnect() {
            self.sampling = false;
            self.plan = None;
            self.state = EngineState::Detached;
            self.session.disconnect();
            if !self.disconnect_reported {
                self.disconnect_reported = true;
                warn!("device disconnected");
                let _ = self.events.send(DsoEvent::Disconnected).await;
            }
        } else {
            warn!("acquisition error: {error}");
            let _ = self.events.send(DsoEvent::Error(error)).await;
        }
    }
}
