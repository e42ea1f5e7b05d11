//! Bulk command and response frames.
//!
//! Every bulk endpoint message is a short fixed-length frame with the opcode
//! in byte 0 and packed bitfield or little-endian fields at documented
//! offsets. Several opcodes are shared between the DSO-2250 and DSO-5200
//! families with entirely different payloads; the model registry selects
//! which frame type a given opcode means for the connected device.
//!
//! Byte layouts follow the vendor protocol exactly, including the odd ones:
//! the 24-bit trigger position of `SetTriggerAndSamplerate` keeps its high
//! byte at offset 10 (not 8), and the capture-state response carries its
//! 24-bit trigger point as {low, mid, high} at offsets {2, 3, 1}.

use modular_bitfield::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::DsoError;
use crate::frame::FrameBuffer;

/// All bulk opcodes. 0x0b..=0x0f are family-overloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum BulkOpcode {
    SetFilter = 0x00,
    SetTriggerAndSamplerate = 0x01,
    ForceTrigger = 0x02,
    CaptureStart = 0x03,
    EnableTrigger = 0x04,
    GetData = 0x05,
    GetCaptureState = 0x06,
    SetGain = 0x07,
    SetLogicalData = 0x08,
    GetLogicalData = 0x09,
    /// 0x0b: DSO-2250 channel selection.
    SetChannels = 0x0b,
    /// 0x0c: DSO-2250 trigger, DSO-5200 samplerate.
    SetTriggerOrSamplerate = 0x0c,
    /// 0x0d: DSO-2250 record length, DSO-5200 buffer/pretrigger.
    SetBuffer = 0x0d,
    /// 0x0e: DSO-2250 samplerate, DSO-5200 trigger.
    SetSamplerateOrTrigger = 0x0e,
    /// 0x0f: DSO-2250 pretrigger positions.
    SetPretrigger = 0x0f,
}

/// A frame that can be sent over the bulk OUT endpoint.
///
/// The session pairs every transmission with a begin-command control
/// preamble built from `opcode()`.
pub trait BulkCommand {
    fn opcode(&self) -> u8;
    fn as_bytes(&self) -> &[u8];
}

/// Device-reported phase of the acquisition cycle.
///
/// The 5200 family reports 7 instead of 3 when the buffer is complete; both
/// decode to [`CaptureState::ReadyToRead`]. Anything outside this set is a
/// protocol error, never a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CaptureState {
    Waiting = 0,
    Triggered = 1,
    Sampling = 2,
    #[num_enum(alternatives = [7])]
    ReadyToRead = 3,
}

// Packed bitfield bytes. Field order is LSB-first, matching the wire layout
// of the vendor firmware.

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterBits {
    pub channel1: bool,
    pub channel2: bool,
    pub trigger: bool,
    #[skip]
    __: B5,
}

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GainBits {
    pub channel1: B2,
    pub channel2: B2,
    #[skip]
    __: B4,
}

/// Trigger and samplerate bits, byte 2 of `SetTriggerAndSamplerate`.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tsr1Bits {
    pub trigger_source: B2,
    pub record_length_id: B3,
    pub samplerate_id: B2,
    pub downsampling_mode: bool,
}

/// Trigger and samplerate bits, byte 3 of `SetTriggerAndSamplerate`.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tsr2Bits {
    pub used_channels: B2,
    pub fast_rate: bool,
    pub trigger_slope: bool,
    #[skip]
    __: B4,
}

/// Trigger bits of the DSO-2250 0x0c command.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CTriggerBits {
    pub trigger_source: B2,
    pub trigger_slope: bool,
    #[skip]
    __: B5,
}

/// Buffer mode bits of the DSO-5200 0x0d command.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DBufferBits {
    pub trigger_position_used: B3,
    pub record_length_id: B3,
    #[skip]
    __: B2,
}

/// Samplerate bits of the DSO-2250 0x0e command.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ESamplerateBits {
    pub fast_rate: bool,
    pub downsampling: bool,
    #[skip]
    __: B6,
}

/// Trigger and samplerate bits of the DSO-5200 0x0e command.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ETsrBits {
    pub fast_rate: bool,
    pub used_channels: B2,
    pub trigger_source: B2,
    pub trigger_slope: B2,
    pub trigger_pulse: bool,
}

/// Trigger-position-used states of the DSO-5200 0x0d command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TriggerPositionUsed {
    /// Roll mode.
    #[default]
    Off = 0,
    /// Normal operation.
    On = 7,
}

macro_rules! opcode_only_frame {
    ($(#[$doc:meta])* $name:ident, $opcode:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            buf: FrameBuffer<2>,
        }

        impl $name {
            pub const OPCODE: BulkOpcode = $opcode;

            pub fn new() -> Self {
                let mut buf = FrameBuffer::new();
                buf.set_byte(0, Self::OPCODE.into());
                Self { buf }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl BulkCommand for $name {
            fn opcode(&self) -> u8 {
                Self::OPCODE.into()
            }

            fn as_bytes(&self) -> &[u8] {
                self.buf.as_bytes()
            }
        }
    };
}

opcode_only_frame!(
    /// 0x02: forces a trigger event.
    ForceTrigger,
    BulkOpcode::ForceTrigger
);
opcode_only_frame!(
    /// 0x03: starts capturing into the sample buffer.
    CaptureStart,
    BulkOpcode::CaptureStart
);
opcode_only_frame!(
    /// 0x04: arms the trigger.
    EnableTrigger,
    BulkOpcode::EnableTrigger
);
opcode_only_frame!(
    /// 0x05: requests the sample buffer contents.
    GetData,
    BulkOpcode::GetData
);
opcode_only_frame!(
    /// 0x06: requests the capture state response.
    GetCaptureState,
    BulkOpcode::GetCaptureState
);
opcode_only_frame!(
    /// 0x09: reads the logical data byte.
    GetLogicalData,
    BulkOpcode::GetLogicalData
);

/// 0x00: channel and trigger noise filter switches.
///
/// Layout: `[0x00, 0x0f, FilterBits, 0, 0, 0, 0, 0]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetFilter {
    buf: FrameBuffer<8>,
}

impl SetFilter {
    pub const OPCODE: BulkOpcode = BulkOpcode::SetFilter;

    pub fn new(channel1: bool, channel2: bool, trigger: bool) -> Self {
        let mut frame = Self::default();
        frame.set_channel(0, channel1);
        frame.set_channel(1, channel2);
        frame.set_trigger(trigger);
        frame
    }

    fn bits(&self) -> FilterBits {
        FilterBits::from_bytes([self.buf.byte(2)])
    }

    pub fn channel(&self, channel: usize) -> bool {
        if channel == 0 {
            self.bits().channel1()
        } else {
            self.bits().channel2()
        }
    }

    pub fn set_channel(&mut self, channel: usize, filtered: bool) {
        let bits = if channel == 0 {
            self.bits().with_channel1(filtered)
        } else {
            self.bits().with_channel2(filtered)
        };
        self.buf.set_byte(2, bits.into_bytes()[0]);
    }

    pub fn trigger(&self) -> bool {
        self.bits().trigger()
    }

    pub fn set_trigger(&mut self, filtered: bool) {
        let bits = self.bits().with_trigger(filtered);
        self.buf.set_byte(2, bits.into_bytes()[0]);
    }
}

impl Default for SetFilter {
    fn default() -> Self {
        let mut buf = FrameBuffer::new();
        buf.set_byte(0, Self::OPCODE.into());
        buf.set_byte(1, 0x0f);
        Self { buf }
    }
}

impl BulkCommand for SetFilter {
    fn opcode(&self) -> u8 {
        Self::OPCODE.into()
    }

    fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }
}

/// 0x01: trigger and timebase setup for the DSO-2090/2150.
///
/// Layout: `[0x01, 0, Tsr1Bits, Tsr2Bits, Downsampler[0], Downsampler[1],
/// TriggerPosition[0], TriggerPosition[1], 0, 0, TriggerPosition[2], 0]`.
/// The high byte of the 24-bit trigger position deliberately sits at offset
/// 10 with two zero bytes in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetTriggerAndSamplerate {
    buf: FrameBuffer<12>,
}

impl SetTriggerAndSamplerate {
    pub const OPCODE: BulkOpcode = BulkOpcode::SetTriggerAndSamplerate;

    /// Reinterpret a raw 12-byte frame, e.g. one captured off the wire.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self { buf: bytes.into() }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        downsampler: u16,
        trigger_position: u32,
        trigger_source: u8,
        record_length_id: u8,
        samplerate_id: u8,
        downsampling_mode: bool,
        used_channels: u8,
        fast_rate: bool,
        trigger_slope: u8,
    ) -> Self {
        let mut frame = Self::default();
        frame.set_trigger_source(trigger_source);
        frame.set_record_length_id(record_length_id);
        frame.set_samplerate_id(samplerate_id);
        frame.set_downsampling_mode(downsampling_mode);
        frame.set_used_channels(used_channels);
        frame.set_fast_rate(fast_rate);
        frame.set_trigger_slope(trigger_slope);
        frame.set_downsampler(downsampler);
        frame.set_trigger_position(trigger_position);
        frame
    }

    fn tsr1(&self) -> Tsr1Bits {
        Tsr1Bits::from_bytes([self.buf.byte(2)])
    }

    fn set_tsr1(&mut self, bits: Tsr1Bits) {
        self.buf.set_byte(2, bits.into_bytes()[0]);
    }

    fn tsr2(&self) -> Tsr2Bits {
        Tsr2Bits::from_bytes([self.buf.byte(3)])
    }

    fn set_tsr2(&mut self, bits: Tsr2Bits) {
        self.buf.set_byte(3, bits.into_bytes()[0]);
    }

    pub fn trigger_source(&self) -> u8 {
        self.tsr1().trigger_source()
    }

    pub fn set_trigger_source(&mut self, value: u8) {
        self.set_tsr1(self.tsr1().with_trigger_source(value & 0x03));
    }

    pub fn record_length_id(&self) -> u8 {
        self.tsr1().record_length_id()
    }

    pub fn set_record_length_id(&mut self, value: u8) {
        self.set_tsr1(self.tsr1().with_record_length_id(value & 0x07));
    }

    pub fn samplerate_id(&self) -> u8 {
        self.tsr1().samplerate_id()
    }

    pub fn set_samplerate_id(&mut self, value: u8) {
        self.set_tsr1(self.tsr1().with_samplerate_id(value & 0x03));
    }

    pub fn downsampling_mode(&self) -> bool {
        self.tsr1().downsampling_mode()
    }

    pub fn set_downsampling_mode(&mut self, downsampling: bool) {
        self.set_tsr1(self.tsr1().with_downsampling_mode(downsampling));
    }

    pub fn used_channels(&self) -> u8 {
        self.tsr2().used_channels()
    }

    pub fn set_used_channels(&mut self, value: u8) {
        self.set_tsr2(self.tsr2().with_used_channels(value & 0x03));
    }

    pub fn fast_rate(&self) -> bool {
        self.tsr2().fast_rate()
    }

    pub fn set_fast_rate(&mut self, fast_rate: bool) {
        self.set_tsr2(self.tsr2().with_fast_rate(fast_rate));
    }

    pub fn trigger_slope(&self) -> u8 {
        self.tsr2().trigger_slope() as u8
    }

    pub fn set_trigger_slope(&mut self, slope: u8) {
        self.set_tsr2(self.tsr2().with_trigger_slope(slope & 0x01 != 0));
    }

    pub fn downsampler(&self) -> u16 {
        self.buf.u16_le(4)
    }

    pub fn set_downsampler(&mut self, downsampler: u16) {
        self.buf.set_u16_le(4, downsampler);
    }

    pub fn trigger_position(&self) -> u32 {
        u32::from(self.buf.u16_le(6)) | u32::from(self.buf.byte(10)) << 16
    }

    pub fn set_trigger_position(&mut self, position: u32) {
        self.buf.set_u16_le(6, position as u16);
        self.buf.set_byte(10, (position >> 16) as u8);
    }
}

impl Default for SetTriggerAndSamplerate {
    fn default() -> Self {
        let mut buf = FrameBuffer::new();
        buf.set_byte(0, Self::OPCODE.into());
        Self { buf }
    }
}

impl BulkCommand for SetTriggerAndSamplerate {
    fn opcode(&self) -> u8 {
        Self::OPCODE.into()
    }

    fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }
}

/// 0x07: per-channel hardware gain selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetGain {
    buf: FrameBuffer<8>,
}

impl SetGain {
    pub const OPCODE: BulkOpcode = BulkOpcode::SetGain;

    pub fn new(channel1: u8, channel2: u8) -> Self {
        let mut frame = Self::default();
        frame.set_gain(0, channel1);
        frame.set_gain(1, channel2);
        frame
    }

    fn bits(&self) -> GainBits {
        GainBits::from_bytes([self.buf.byte(2)])
    }

    pub fn gain(&self, channel: usize) -> u8 {
        if channel == 0 {
            self.bits().channel1()
        } else {
            self.bits().channel2()
        }
    }

    pub fn set_gain(&mut self, channel: usize, value: u8) {
        let bits = if channel == 0 {
            self.bits().with_channel1(value & 0x03)
        } else {
            self.bits().with_channel2(value & 0x03)
        };
        self.buf.set_byte(2, bits.into_bytes()[0]);
    }
}

impl Default for SetGain {
    fn default() -> Self {
        let mut buf = FrameBuffer::new();
        buf.set_byte(0, Self::OPCODE.into());
        Self { buf }
    }
}

impl BulkCommand for SetGain {
    fn opcode(&self) -> u8 {
        Self::OPCODE.into()
    }

    fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }
}

/// 0x08: writes the logical data byte. Not used by the official software.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetLogicalData {
    buf: FrameBuffer<8>,
}

impl SetLogicalData {
    pub const OPCODE: BulkOpcode = BulkOpcode::SetLogicalData;

    pub fn new(data: u8) -> Self {
        let mut frame = Self::default();
        frame.set_data(data);
        frame
    }

    pub fn data(&self) -> u8 {
        self.buf.byte(2)
    }

    pub fn set_data(&mut self, data: u8) {
        self.buf.set_byte(2, data);
    }
}

impl Default for SetLogicalData {
    fn default() -> Self {
        let mut buf = FrameBuffer::new();
        buf.set_byte(0, Self::OPCODE.into());
        Self { buf }
    }
}

impl BulkCommand for SetLogicalData {
    fn opcode(&self) -> u8 {
        Self::OPCODE.into()
    }

    fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }
}

/// 0x0b: DSO-2250 active channel selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetChannels2250 {
    buf: FrameBuffer<4>,
}

impl SetChannels2250 {
    pub const OPCODE: BulkOpcode = BulkOpcode::SetChannels;

    pub fn new(used_channels: u8) -> Self {
        let mut frame = Self::default();
        frame.set_used_channels(used_channels);
        frame
    }

    pub fn used_channels(&self) -> u8 {
        self.buf.byte(2)
    }

    pub fn set_used_channels(&mut self, value: u8) {
        self.buf.set_byte(2, value);
    }
}

impl Default for SetChannels2250 {
    fn default() -> Self {
        let mut buf = FrameBuffer::new();
        buf.set_byte(0, Self::OPCODE.into());
        Self { buf }
    }
}

impl BulkCommand for SetChannels2250 {
    fn opcode(&self) -> u8 {
        Self::OPCODE.into()
    }

    fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }
}

/// 0x0c on the DSO-2250: trigger source and slope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetTrigger2250 {
    buf: FrameBuffer<8>,
}

impl SetTrigger2250 {
    pub const OPCODE: BulkOpcode = BulkOpcode::SetTriggerOrSamplerate;

    pub fn new(trigger_source: u8, trigger_slope: u8) -> Self {
        let mut frame = Self::default();
        frame.set_trigger_source(trigger_source);
        frame.set_trigger_slope(trigger_slope);
        frame
    }

    fn bits(&self) -> CTriggerBits {
        CTriggerBits::from_bytes([self.buf.byte(2)])
    }

    pub fn trigger_source(&self) -> u8 {
        self.bits().trigger_source()
    }

    pub fn set_trigger_source(&mut self, value: u8) {
        let bits = self.bits().with_trigger_source(value & 0x03);
        self.buf.set_byte(2, bits.into_bytes()[0]);
    }

    pub fn trigger_slope(&self) -> u8 {
        self.bits().trigger_slope() as u8
    }

    pub fn set_trigger_slope(&mut self, slope: u8) {
        let bits = self.bits().with_trigger_slope(slope & 0x01 != 0);
        self.buf.set_byte(2, bits.into_bytes()[0]);
    }
}

impl Default for SetTrigger2250 {
    fn default() -> Self {
        let mut buf = FrameBuffer::new();
        buf.set_byte(0, Self::OPCODE.into());
        Self { buf }
    }
}

impl BulkCommand for SetTrigger2250 {
    fn opcode(&self) -> u8 {
        Self::OPCODE.into()
    }

    fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }
}

/// 0x0c on the DSO-5200: samplerate divider.
///
/// Layout: `[0x0c, 0, SamplerateSlow[0], SamplerateSlow[1], SamplerateFast, 0]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetSamplerate5200 {
    buf: FrameBuffer<6>,
}

impl SetSamplerate5200 {
    pub const OPCODE: BulkOpcode = BulkOpcode::SetTriggerOrSamplerate;

    /// Reinterpret a raw 6-byte frame, e.g. one captured off the wire.
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Self { buf: bytes.into() }
    }

    pub fn new(samplerate_slow: u16, samplerate_fast: u8) -> Self {
        let mut frame = Self::default();
        frame.set_samplerate_fast(samplerate_fast);
        frame.set_samplerate_slow(samplerate_slow);
        frame
    }

    pub fn samplerate_fast(&self) -> u8 {
        self.buf.byte(4)
    }

    pub fn set_samplerate_fast(&mut self, value: u8) {
        self.buf.set_byte(4, value);
    }

    pub fn samplerate_slow(&self) -> u16 {
        self.buf.u16_le(2)
    }

    pub fn set_samplerate_slow(&mut self, value: u16) {
        self.buf.set_u16_le(2, value);
    }
}

impl Default for SetSamplerate5200 {
    fn default() -> Self {
        let mut buf = FrameBuffer::new();
        buf.set_byte(0, Self::OPCODE.into());
        Self { buf }
    }
}

impl BulkCommand for SetSamplerate5200 {
    fn opcode(&self) -> u8 {
        Self::OPCODE.into()
    }

    fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }
}

/// 0x0d on the DSO-2250: record length selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetRecordLength2250 {
    buf: FrameBuffer<4>,
}

impl SetRecordLength2250 {
    pub const OPCODE: BulkOpcode = BulkOpcode::SetBuffer;

    pub fn new(record_length_id: u8) -> Self {
        let mut frame = Self::default();
        frame.set_record_length_id(record_length_id);
        frame
    }

    pub fn record_length_id(&self) -> u8 {
        self.buf.byte(2)
    }

    pub fn set_record_length_id(&mut self, value: u8) {
        self.buf.set_byte(2, value);
    }
}

impl Default for SetRecordLength2250 {
    fn default() -> Self {
        let mut buf = FrameBuffer::new();
        buf.set_byte(0, Self::OPCODE.into());
        Self { buf }
    }
}

impl BulkCommand for SetRecordLength2250 {
    fn opcode(&self) -> u8 {
        Self::OPCODE.into()
    }

    fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }
}

/// 0x0d on the DSO-5200: pretrigger positions and record length.
///
/// Layout: `[0x0d, 0, Pre[0], Pre[1], UsedPre, 0xff, Post[0], Post[1],
/// DBufferBits, 0xff]`. The 0xff sentinels at offsets 5 and 9 are part of
/// the frame and survive every setter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetBuffer5200 {
    buf: FrameBuffer<10>,
}

impl SetBuffer5200 {
    pub const OPCODE: BulkOpcode = BulkOpcode::SetBuffer;

    pub fn new(
        trigger_position_pre: u16,
        trigger_position_post: u16,
        used_pre: TriggerPositionUsed,
        used_post: TriggerPositionUsed,
        record_length_id: u8,
    ) -> Self {
        let mut frame = Self::default();
        frame.set_trigger_position_pre(trigger_position_pre);
        frame.set_trigger_position_post(trigger_position_post);
        frame.set_used_pre(used_pre);
        frame.set_used_post(used_post);
        frame.set_record_length_id(record_length_id);
        frame
    }

    pub fn trigger_position_pre(&self) -> u16 {
        self.buf.u16_le(2)
    }

    pub fn set_trigger_position_pre(&mut self, value: u16) {
        self.buf.set_u16_le(2, value);
    }

    pub fn trigger_position_post(&self) -> u16 {
        self.buf.u16_le(6)
    }

    pub fn set_trigger_position_post(&mut self, value: u16) {
        self.buf.set_u16_le(6, value);
    }

    pub fn used_pre(&self) -> u8 {
        self.buf.byte(4)
    }

    pub fn set_used_pre(&mut self, value: TriggerPositionUsed) {
        self.buf.set_byte(4, value.into());
    }

    fn dbuffer(&self) -> DBufferBits {
        DBufferBits::from_bytes([self.buf.byte(8)])
    }

    pub fn used_post(&self) -> u8 {
        self.dbuffer().trigger_position_used()
    }

    pub fn set_used_post(&mut self, value: TriggerPositionUsed) {
        let bits = self.dbuffer().with_trigger_position_used(u8::from(value) & 0x07);
        self.buf.set_byte(8, bits.into_bytes()[0]);
    }

    pub fn record_length_id(&self) -> u8 {
        self.dbuffer().record_length_id()
    }

    pub fn set_record_length_id(&mut self, value: u8) {
        let bits = self.dbuffer().with_record_length_id(value & 0x07);
        self.buf.set_byte(8, bits.into_bytes()[0]);
    }
}

impl Default for SetBuffer5200 {
    fn default() -> Self {
        let mut buf = FrameBuffer::new();
        buf.set_byte(0, Self::OPCODE.into());
        buf.set_byte(5, 0xff);
        buf.set_byte(9, 0xff);
        Self { buf }
    }
}

impl BulkCommand for SetBuffer5200 {
    fn opcode(&self) -> u8 {
        Self::OPCODE.into()
    }

    fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }
}

/// 0x0e on the DSO-2250: samplerate divider.
///
/// Layout: `[0x0e, 0, ESamplerateBits, 0, Samplerate[0], Samplerate[1], 0, 0]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetSamplerate2250 {
    buf: FrameBuffer<8>,
}

impl SetSamplerate2250 {
    pub const OPCODE: BulkOpcode = BulkOpcode::SetSamplerateOrTrigger;

    /// Reinterpret a raw 8-byte frame, e.g. one captured off the wire.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self { buf: bytes.into() }
    }

    pub fn new(fast_rate: bool, downsampling: bool, samplerate: u16) -> Self {
        let mut frame = Self::default();
        frame.set_fast_rate(fast_rate);
        frame.set_downsampling(downsampling);
        frame.set_samplerate(samplerate);
        frame
    }

    fn bits(&self) -> ESamplerateBits {
        ESamplerateBits::from_bytes([self.buf.byte(2)])
    }

    pub fn fast_rate(&self) -> bool {
        self.bits().fast_rate()
    }

    pub fn set_fast_rate(&mut self, fast_rate: bool) {
        let bits = self.bits().with_fast_rate(fast_rate);
        self.buf.set_byte(2, bits.into_bytes()[0]);
    }

    pub fn downsampling(&self) -> bool {
        self.bits().downsampling()
    }

    pub fn set_downsampling(&mut self, downsampling: bool) {
        let bits = self.bits().with_downsampling(downsampling);
        self.buf.set_byte(2, bits.into_bytes()[0]);
    }

    pub fn samplerate(&self) -> u16 {
        self.buf.u16_le(4)
    }

    pub fn set_samplerate(&mut self, samplerate: u16) {
        self.buf.set_u16_le(4, samplerate);
    }
}

impl Default for SetSamplerate2250 {
    fn default() -> Self {
        let mut buf = FrameBuffer::new();
        buf.set_byte(0, Self::OPCODE.into());
        Self { buf }
    }
}

impl BulkCommand for SetSamplerate2250 {
    fn opcode(&self) -> u8 {
        Self::OPCODE.into()
    }

    fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }
}

/// 0x0e on the DSO-5200: channel and trigger setup.
///
/// Layout: `[0x0e, 0, ETsrBits, 0, 0x02, 0, 0, 0]`. The fast-rate bit is
/// inverted on the wire; the accessors take and return the logical value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetTrigger5200 {
    buf: FrameBuffer<8>,
}

impl SetTrigger5200 {
    pub const OPCODE: BulkOpcode = BulkOpcode::SetSamplerateOrTrigger;

    pub fn new(
        trigger_source: u8,
        used_channels: u8,
        fast_rate: bool,
        trigger_slope: u8,
        trigger_pulse: bool,
    ) -> Self {
        let mut frame = Self::default();
        frame.set_trigger_source(trigger_source);
        frame.set_used_channels(used_channels);
        frame.set_fast_rate(fast_rate);
        frame.set_trigger_slope(trigger_slope);
        frame.set_trigger_pulse(trigger_pulse);
        frame
    }

    fn bits(&self) -> ETsrBits {
        ETsrBits::from_bytes([self.buf.byte(2)])
    }

    fn set_bits(&mut self, bits: ETsrBits) {
        self.buf.set_byte(2, bits.into_bytes()[0]);
    }

    pub fn trigger_source(&self) -> u8 {
        self.bits().trigger_source()
    }

    pub fn set_trigger_source(&mut self, value: u8) {
        self.set_bits(self.bits().with_trigger_source(value & 0x03));
    }

    pub fn used_channels(&self) -> u8 {
        self.bits().used_channels()
    }

    pub fn set_used_channels(&mut self, value: u8) {
        self.set_bits(self.bits().with_used_channels(value & 0x03));
    }

    /// Logical fast-rate state; stored inverted on the wire.
    pub fn fast_rate(&self) -> bool {
        !self.bits().fast_rate()
    }

    pub fn set_fast_rate(&mut self, fast_rate: bool) {
        self.set_bits(self.bits().with_fast_rate(!fast_rate));
    }

    pub fn trigger_slope(&self) -> u8 {
        self.bits().trigger_slope()
    }

    pub fn set_trigger_slope(&mut self, slope: u8) {
        self.set_bits(self.bits().with_trigger_slope(slope & 0x03));
    }

    pub fn trigger_pulse(&self) -> bool {
        self.bits().trigger_pulse()
    }

    pub fn set_trigger_pulse(&mut self, pulse: bool) {
        self.set_bits(self.bits().with_trigger_pulse(pulse));
    }
}

impl Default for SetTrigger5200 {
    fn default() -> Self {
        let mut buf = FrameBuffer::new();
        buf.set_byte(0, Self::OPCODE.into());
        buf.set_byte(4, 0x02);
        Self { buf }
    }
}

impl BulkCommand for SetTrigger5200 {
    fn opcode(&self) -> u8 {
        Self::OPCODE.into()
    }

    fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }
}

/// 0x0f: DSO-2250 pretrigger positions.
///
/// Layout: `[0x0f, 0, Post[0], Post[1], Post[2], 0, Pre[0], Pre[1], Pre[2],
/// 0, 0, 0]`. The body is 10 protocol bytes; the frame is padded to 12 with
/// trailing zeros, which the device accepts (the vendor header disagrees
/// with the vendor constructor here; the longer form is kept).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetBuffer2250 {
    buf: FrameBuffer<12>,
}

impl SetBuffer2250 {
    pub const OPCODE: BulkOpcode = BulkOpcode::SetPretrigger;

    pub fn new(trigger_position_pre: u32, trigger_position_post: u32) -> Self {
        let mut frame = Self::default();
        frame.set_trigger_position_pre(trigger_position_pre);
        frame.set_trigger_position_post(trigger_position_post);
        frame
    }

    pub fn trigger_position_post(&self) -> u32 {
        self.buf.u24_le(2)
    }

    pub fn set_trigger_position_post(&mut self, value: u32) {
        self.buf.set_u24_le(2, value);
    }

    pub fn trigger_position_pre(&self) -> u32 {
        self.buf.u24_le(6)
    }

    pub fn set_trigger_position_pre(&mut self, value: u32) {
        self.buf.set_u24_le(6, value);
    }
}

impl Default for SetBuffer2250 {
    fn default() -> Self {
        let mut buf = FrameBuffer::new();
        buf.set_byte(0, Self::OPCODE.into());
        Self { buf }
    }
}

impl BulkCommand for SetBuffer2250 {
    fn opcode(&self) -> u8 {
        Self::OPCODE.into()
    }

    fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }
}

/// Expected length of the capture state response.
pub const CAPTURE_STATE_RESPONSE_LEN: usize = 512;

/// Parsed response to [`GetCaptureState`].
///
/// Byte 0 carries the state. The 24-bit trigger point is spread over bytes
/// {2, 3, 1} = {low, mid, high}; this layout is part of the on-wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStateResponse {
    pub state: CaptureState,
    pub trigger_point: u32,
}

impl CaptureStateResponse {
    pub fn parse(data: &[u8]) -> Result<Self, DsoError> {
        if data.len() < CAPTURE_STATE_RESPONSE_LEN {
            return Err(DsoError::Protocol(format!(
                "capture state response too short: {} bytes",
                data.len()
            )));
        }
        let state = CaptureState::try_from(data[0])
            .map_err(|_| DsoError::Protocol(format!("unknown capture state {:#04x}", data[0])))?;
        let trigger_point =
            u32::from(data[2]) | u32::from(data[3]) << 8 | u32::from(data[1]) << 16;
        Ok(Self {
            state,
            trigger_point,
        })
    }
}
