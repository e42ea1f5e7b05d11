//! Control endpoint requests and frames.
//!
//! The scopes use endpoint 0 with vendor-type requests for everything that
//! is not sample traffic: the begin-command preamble, speed negotiation,
//! offset/relay hardware, and access to the calibration value store.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::byteorder::big_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::DsoError;
use crate::frame::FrameBuffer;
use crate::model::{CHANNELS, GAIN_STEPS};

/// Vendor control request codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ControlRequest {
    /// Read/write access to a [`ControlValue`] selector.
    Value = 0xa2,
    /// Read the negotiated connection speed.
    GetSpeed = 0xb2,
    /// Announce the opcode of the bulk command that follows.
    BeginCommand = 0xb3,
    /// Write the channel and trigger offsets.
    SetOffset = 0xb4,
    /// Write the relay states.
    SetRelays = 0xb5,
    SetVoltDivCh1 = 0xe0,
    SetVoltDivCh2 = 0xe1,
    SetTimeDiv = 0xe2,
    AcquireHardData = 0xe3,
}

/// Selectors for [`ControlRequest::Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ControlValue {
    /// Per-channel, per-gain-step offset calibration ranges.
    OffsetLimits = 0x08,
    /// One-byte device address.
    DeviceAddress = 0x0a,
    /// Fast-rate channel merge calibration (2250/5200 families).
    FastRateCalibration = 0x60,
    /// ETS correction values (5200 family).
    EtsCorrection = 0x70,
}

/// The speed level of the USB connection, reported by request 0xb2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ConnectionSpeed {
    /// 64 byte bulk packets.
    FullSpeed = 0,
    /// 512 byte bulk packets.
    HighSpeed = 1,
}

/// Length of the speed negotiation response.
pub const GET_SPEED_RESPONSE_LEN: usize = 10;

impl ConnectionSpeed {
    /// Parse the 10-byte response of [`ControlRequest::GetSpeed`].
    ///
    /// Unknown values are a hard error; the packet size must never be
    /// silently defaulted.
    pub fn parse(data: &[u8]) -> Result<Self, DsoError> {
        let byte = *data
            .first()
            .ok_or_else(|| DsoError::Protocol("empty speed response".into()))?;
        ConnectionSpeed::try_from(byte).map_err(|_| DsoError::UnknownSpeed(byte))
    }

    /// Maximum bulk packet size for this speed level.
    pub fn packet_size(self) -> usize {
        match self {
            ConnectionSpeed::FullSpeed => 64,
            ConnectionSpeed::HighSpeed => 512,
        }
    }
}

/// The 10-byte begin-command preamble sent on request 0xb3 before every
/// bulk command: `[0x0f, op, op, op, 0, 0, 0, 0, 0, 0]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginCommand {
    buf: FrameBuffer<10>,
}

impl BeginCommand {
    pub fn new(opcode: u8) -> Self {
        let mut buf = FrameBuffer::new();
        buf.set_byte(0, 0x0f);
        buf.set_byte(1, opcode);
        buf.set_byte(2, opcode);
        buf.set_byte(3, opcode);
        Self { buf }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }
}

/// Channel and trigger offsets, written on request 0xb4.
///
/// Each offset is a 12-bit value stored high byte first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetOffset {
    buf: FrameBuffer<17>,
}

impl SetOffset {
    pub fn new(channel1: u16, channel2: u16, trigger: u16) -> Self {
        let mut frame = Self::default();
        frame.set_channel(0, channel1);
        frame.set_channel(1, channel2);
        frame.set_trigger(trigger);
        frame
    }

    pub fn channel(&self, channel: usize) -> u16 {
        let base = channel * 2;
        u16::from(self.buf.byte(base) & 0x0f) << 8 | u16::from(self.buf.byte(base + 1))
    }

    pub fn set_channel(&mut self, channel: usize, offset: u16) {
        let base = channel * 2;
        self.buf.set_byte(base, (offset >> 8) as u8);
        self.buf.set_byte(base + 1, offset as u8);
    }

    pub fn trigger(&self) -> u16 {
        u16::from(self.buf.byte(4) & 0x0f) << 8 | u16::from(self.buf.byte(5))
    }

    pub fn set_trigger(&mut self, level: u16) {
        self.buf.set_byte(4, (level >> 8) as u8);
        self.buf.set_byte(5, level as u8);
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }
}

/// Relay states, written on request 0xb5.
///
/// Each relay byte is XOR-coded: the relay's bit value when released, its
/// complement when engaged.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetRelays {
    buf: FrameBuffer<17>,
}

impl SetRelays {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ch1_below_1v: bool,
        ch1_below_100mv: bool,
        ch1_coupling_dc: bool,
        ch2_below_1v: bool,
        ch2_below_100mv: bool,
        ch2_coupling_dc: bool,
        trigger_ext: bool,
    ) -> Self {
        let mut frame = Self::default();
        frame.set_below_1v(0, ch1_below_1v);
        frame.set_below_100mv(0, ch1_below_100mv);
        frame.set_coupling_dc(0, ch1_coupling_dc);
        frame.set_below_1v(1, ch2_below_1v);
        frame.set_below_100mv(1, ch2_below_100mv);
        frame.set_coupling_dc(1, ch2_coupling_dc);
        frame.set_trigger_ext(trigger_ext);
        frame
    }

    pub fn below_1v(&self, channel: usize) -> bool {
        if channel == 0 {
            self.buf.byte(1) & 0x04 == 0
        } else {
            self.buf.byte(4) & 0x20 == 0
        }
    }

    pub fn set_below_1v(&mut self, channel: usize, below: bool) {
        if channel == 0 {
            self.buf.set_byte(1, if below { 0xfb } else { 0x04 });
        } else {
            self.buf.set_byte(4, if below { 0xdf } else { 0x20 });
        }
    }

    pub fn below_100mv(&self, channel: usize) -> bool {
        if channel == 0 {
            self.buf.byte(2) & 0x08 == 0
        } else {
            self.buf.byte(5) & 0x40 == 0
        }
    }

    pub fn set_below_100mv(&mut self, channel: usize, below: bool) {
        if channel == 0 {
            self.buf.set_byte(2, if below { 0xf7 } else { 0x08 });
        } else {
            self.buf.set_byte(5, if below { 0xbf } else { 0x40 });
        }
    }

    pub fn coupling_dc(&self, channel: usize) -> bool {
        if channel == 0 {
            self.buf.byte(3) & 0x02 == 0
        } else {
            self.buf.byte(6) & 0x10 == 0
        }
    }

    pub fn set_coupling_dc(&mut self, channel: usize, dc: bool) {
        if channel == 0 {
            self.buf.set_byte(3, if dc { 0xfd } else { 0x02 });
        } else {
            self.buf.set_byte(6, if dc { 0xef } else { 0x10 });
        }
    }

    pub fn trigger_ext(&self) -> bool {
        self.buf.byte(7) & 0x01 == 0
    }

    pub fn set_trigger_ext(&mut self, ext: bool) {
        self.buf.set_byte(7, if ext { 0xfe } else { 0x01 });
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }
}

/// One offset calibration range, stored big-endian in the value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct OffsetRange {
    /// Channel level at the bottom of the screen.
    pub start: U16,
    /// Channel level at the top of the screen.
    pub end: U16,
}

/// Offset calibration ranges for one channel, one entry per gain step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct OffsetsPerGainStep {
    pub step: [OffsetRange; GAIN_STEPS],
}

/// The calibration blob read via [`ControlValue::OffsetLimits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CalibrationData {
    pub channel: [OffsetsPerGainStep; CHANNELS],
}

impl CalibrationData {
    pub const LEN: usize = CHANNELS * GAIN_STEPS * 4;

    pub fn parse(data: &[u8]) -> Result<Self, DsoError> {
        Self::read_from_bytes(data.get(..Self::LEN).ok_or_else(|| {
            DsoError::Protocol(format!(
                "calibration blob too short: {} of {} bytes",
                data.len(),
                Self::LEN
            ))
        })?)
        .map_err(|_| DsoError::Protocol("unreadable calibration blob".into()))
    }

    /// The (minimum, maximum) raw offset for a channel at a gain step.
    pub fn offset_range(&self, channel: usize, gain_id: usize) -> (u16, u16) {
        let range = &self.channel[channel].step[gain_id];
        (range.start.get(), range.end.get())
    }
}

impl Default for CalibrationData {
    /// Full-range defaults, used until the device blob has been read.
    fn default() -> Self {
        let range = OffsetRange {
            start: U16::new(0x0000),
            end: U16::new(0xffff),
        };
        Self {
            channel: [OffsetsPerGainStep {
                step: [range; GAIN_STEPS],
            }; CHANNELS],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_command_triplicates_opcode() {
        let begin = BeginCommand::new(0x05);
        assert_eq!(
            begin.as_bytes(),
            &[0x0f, 0x05, 0x05, 0x05, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn speed_parse_rejects_unknown() {
        assert_eq!(
            ConnectionSpeed::parse(&[0u8; 10]).unwrap(),
            ConnectionSpeed::FullSpeed
        );
        assert_eq!(
            ConnectionSpeed::parse(&[1, 0, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap(),
            ConnectionSpeed::HighSpeed
        );
        assert!(matches!(
            ConnectionSpeed::parse(&[3, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(DsoError::UnknownSpeed(3))
        ));
    }

    #[test]
    fn relays_xor_coding() {
        let mut relays = SetRelays::default();
        relays.set_below_1v(0, true);
        assert_eq!(relays.as_bytes()[1], 0xfb);
        assert!(relays.below_1v(0));
        relays.set_below_1v(0, false);
        assert_eq!(relays.as_bytes()[1], 0x04);
        assert!(!relays.below_1v(0));
    }

    #[test]
    fn calibration_blob_big_endian() {
        let mut raw = [0u8; CalibrationData::LEN];
        // channel 0, gain step 0: start 0x0102, end 0x0304
        raw[0] = 0x01;
        raw[1] = 0x02;
        raw[2] = 0x03;
        raw[3] = 0x04;
        let cal = CalibrationData::parse(&raw).unwrap();
        assert_eq!(cal.offset_range(0, 0), (0x0102, 0x0304));
    }
}
