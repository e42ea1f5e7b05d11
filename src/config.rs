//! Configuration derivation.
//!
//! Pure translation from a [`SettingsSnapshot`] plus a [`ModelDescriptor`]
//! into the exact frame set the device expects, together with the
//! [`AcquisitionPlan`] the capture loop and the decoder work from. No I/O
//! happens here; a snapshot that cannot be expressed fails with
//! `InvalidConfig` before anything reaches the wire.

use std::time::Duration;

use crate::bulk::{
    BulkCommand, SetBuffer2250, SetBuffer5200, SetChannels2250, SetFilter, SetGain,
    SetRecordLength2250, SetSamplerate2250, SetSamplerate5200, SetTrigger2250, SetTrigger5200,
    SetTriggerAndSamplerate, TriggerPositionUsed,
};
use crate::control::{CalibrationData, ControlRequest, SetOffset, SetRelays};
use crate::error::DsoError;
use crate::model::{CommandVariant, ModelDescriptor, RecordLength, CHANNELS};
use crate::settings::{
    Coupling, HorizontalTarget, SettingsSnapshot, TriggerMode, TriggerSource,
};

/// Left buffer edge for the 19-bit trigger position fields.
const TRIGGER_POSITION_LIMIT: u32 = 0x7ffff;
/// Left buffer edge for the 16-bit 5200 trigger position fields.
const TRIGGER_POSITION_LIMIT_5200: u32 = 0xffff;

/// Scaling information for one channel, consumed by the sample decoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelScale {
    pub used: bool,
    /// Raw sample value corresponding to 0 V, in full-scale units.
    pub zero_level: f64,
    /// Volts per full scale at the selected gain.
    pub gain_step: f64,
}

/// Everything the capture loop needs to run one acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionPlan {
    pub fast_rate: bool,
    pub downsampler: u32,
    /// Effective samplerate after divider and record-length divider, in S/s.
    pub samplerate: f64,
    pub record_length_id: usize,
    pub record_length: RecordLength,
    pub channel_used: [bool; CHANNELS],
    pub scale: [ChannelScale; CHANNELS],
    pub trigger_mode: TriggerMode,
    /// Pretrigger position as a fraction of the record.
    pub trigger_position: f64,
}

impl AcquisitionPlan {
    pub fn is_roll_mode(&self) -> bool {
        self.record_length == RecordLength::Roll
    }

    pub fn active_channel_count(&self) -> usize {
        self.channel_used.iter().filter(|&&used| used).count()
    }

    /// Raw samples held by the device buffer for one capture.
    pub fn sample_count(&self, packet_size: usize) -> usize {
        match self.record_length {
            RecordLength::Roll => packet_size,
            RecordLength::Samples(record) => {
                if self.fast_rate {
                    record as usize
                } else {
                    record as usize * self.active_channel_count()
                }
            }
        }
    }

    /// Bytes to fetch with a multi-packet read for one capture.
    pub fn read_length(&self, packet_size: usize, bytes_per_sample: usize) -> usize {
        self.sample_count(packet_size) * bytes_per_sample
    }

    /// Poll cadence: a quarter of the time the buffer needs to refill,
    /// bounded to 10..=1000 ms.
    pub fn cycle_time(&self, packet_size: usize) -> Duration {
        let millis = match self.record_length {
            RecordLength::Roll => {
                let channels = if self.fast_rate { 1 } else { CHANNELS };
                packet_size as f64 / channels as f64 / self.samplerate * 250.0
            }
            RecordLength::Samples(record) => record as f64 / self.samplerate * 250.0,
        };
        Duration::from_millis((millis as u64).clamp(10, 1000))
    }
}

/// One pending vendor control write.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlWrite {
    pub request: ControlRequest,
    pub payload: Vec<u8>,
}

/// A composed configuration: bulk frames in the model-prescribed transmit
/// order, followed by the control writes.
pub struct DeviceConfiguration {
    pub plan: AcquisitionPlan,
    pub bulk: Vec<Box<dyn BulkCommand + Send + Sync>>,
    pub controls: Vec<ControlWrite>,
}

/// Undo the device's trigger point encoding: each set bit inverts all bits
/// below it.
pub fn unfold_trigger_point(raw: u32) -> u32 {
    let mut point = raw;
    for bit in 0..24 {
        let mask = 1u32 << bit;
        if point & mask != 0 {
            point ^= mask - 1;
        }
    }
    point
}

/// The channel selection code shared by `SetTriggerAndSamplerate`,
/// `SetChannels2250` and `SetTrigger5200`. The 2250 swaps the codes for
/// "channel 2 only" and "none".
fn used_channels_code(settings: &SettingsSnapshot, variant: CommandVariant) -> u8 {
    let ch1 = settings.channels[0].used;
    let ch2 = settings.channels[1].used;
    match (ch1, ch2) {
        (true, true) => 2,
        (false, true) if variant == CommandVariant::Dso2250 => 3,
        (false, true) => 1,
        _ => 0,
    }
}

/// The trigger source code for the frame byte. The channel order is
/// inverted on the wire; special inputs sit above the channels except on
/// the 2250 where EXT is 0.
fn trigger_source_code(source: TriggerSource, variant: CommandVariant) -> u8 {
    match (variant, source) {
        (CommandVariant::Dso2250, TriggerSource::Special(_)) => 0,
        (CommandVariant::Dso2250, TriggerSource::Channel(id)) => 2 + id as u8,
        (_, TriggerSource::Special(id)) => 3 + id as u8,
        (_, TriggerSource::Channel(id)) => 1 - id as u8,
    }
}

/// Best reachable samplerate and its downsampling factor.
///
/// With `maximum` unset the result is the nearest rate at least as high as
/// the target (divider rounded down); with it set, the nearest rate at most
/// as high (divider rounded up). Dividers beyond the field range are
/// rejected, never truncated.
pub fn best_samplerate(
    descriptor: &ModelDescriptor,
    record_length_id: usize,
    fast_rate: bool,
    target: f64,
    maximum: bool,
) -> Result<(f64, u32), DsoError> {
    if target <= 0.0 {
        return Err(DsoError::InvalidConfig(format!(
            "samplerate {target} must be positive"
        )));
    }

    let limits = descriptor.limits(fast_rate);
    let buffer_divider = descriptor.buffer_dividers[record_length_id] as f64;

    // The 5200 divider is relative to the maximum rate, everything else to
    // the base rate.
    let reference = match descriptor.variant {
        CommandVariant::Dso5200 => limits.max,
        _ => limits.base,
    };

    let mut divider = reference / buffer_divider / target;
    if divider < 1.0 && (target <= limits.max / buffer_divider || !maximum) {
        return Ok((limits.max / buffer_divider, 0));
    }

    match descriptor.variant {
        CommandVariant::Standard => {
            if (maximum && divider <= 5.0) || (!maximum && divider < 6.0) {
                // Table dividers: 1, 2 and 5 exist; 3 and 4 do not.
                if maximum {
                    divider = divider.ceil();
                    if divider > 2.0 {
                        divider = 5.0;
                    }
                } else {
                    divider = divider.floor();
                    if divider > 2.0 && divider < 5.0 {
                        divider = 2.0;
                    }
                }
            } else {
                // 16-bit downsampler, even values only.
                divider = if maximum {
                    (divider / 2.0).ceil() * 2.0
                } else {
                    (divider / 2.0).floor() * 2.0
                };
            }
        }
        CommandVariant::Dso2250 | CommandVariant::Dso5200 => {
            divider = if maximum { divider.ceil() } else { divider.floor() };
        }
    }

    if divider > limits.max_downsampler as f64 {
        return Err(DsoError::InvalidConfig(format!(
            "samplerate {target} S/s needs divider {divider}, past the field limit {}",
            limits.max_downsampler
        )));
    }

    let rate = reference / divider / buffer_divider;
    Ok((rate, divider as u32))
}

/// Decode the effective samplerate out of a composed 2090/2150 frame.
pub fn decode_standard_samplerate(
    descriptor: &ModelDescriptor,
    fast_rate: bool,
    record_length_id: usize,
    frame: &SetTriggerAndSamplerate,
) -> f64 {
    let limits = descriptor.limits(fast_rate);
    let buffer_divider = descriptor.buffer_dividers[record_length_id] as f64;
    if frame.downsampling_mode() {
        let divider = 2.0 * (0x10001 - u32::from(frame.downsampler())) as f64;
        limits.base / divider / buffer_divider
    } else {
        let rate = match frame.samplerate_id() {
            0 => limits.max,
            1 => limits.base,
            2 => limits.base / 2.0,
            _ => limits.base / 5.0,
        };
        rate / buffer_divider
    }
}

/// Decode the effective samplerate out of a composed 2250 frame.
pub fn decode_2250_samplerate(
    descriptor: &ModelDescriptor,
    record_length_id: usize,
    frame: &SetSamplerate2250,
) -> f64 {
    let limits = descriptor.limits(frame.fast_rate());
    let buffer_divider = descriptor.buffer_dividers[record_length_id] as f64;
    if !frame.downsampling() {
        limits.max / buffer_divider
    } else {
        let divider = match frame.samplerate() {
            0 => 1,
            value => 0x10001 - u32::from(value),
        };
        limits.base / divider as f64 / buffer_divider
    }
}

/// Decode the effective samplerate out of a composed 5200 frame:
/// `rate = max / (twos_complement(slow) * 2 + 4 - fast)`.
pub fn decode_5200_samplerate(
    descriptor: &ModelDescriptor,
    fast_rate: bool,
    record_length_id: usize,
    frame: &SetSamplerate5200,
) -> f64 {
    let limits = descriptor.limits(fast_rate);
    let buffer_divider = descriptor.buffer_dividers[record_length_id] as f64;
    let slow = u32::from(frame.samplerate_slow().wrapping_neg());
    let divider = (slow * 2 + 4).saturating_sub(u32::from(frame.samplerate_fast()));
    if divider == 0 {
        limits.max / buffer_divider
    } else {
        limits.max / divider as f64 / buffer_divider
    }
}

fn offset_value(calibration: &CalibrationData, channel: usize, gain_id: usize, offset: f64) -> (u16, f64) {
    let (min, max) = calibration.offset_range(channel, gain_id);
    if max <= min {
        return (min, offset);
    }
    let span = f64::from(max - min);
    let value = (offset * span + f64::from(min) + 0.5) as u16;
    let value = value.clamp(min, max);
    let real = f64::from(value - min) / span;
    (value, real)
}

fn trigger_level_value(
    descriptor: &ModelDescriptor,
    calibration: &CalibrationData,
    channel: usize,
    gain_id: usize,
    offset_real: f64,
    level: f64,
) -> u16 {
    let (min, max) = if descriptor.bit_depth > 8 {
        // 10-bit models share the offset calibration range.
        calibration.offset_range(channel, gain_id)
    } else {
        (0x00, 0xfd)
    };
    if max <= min {
        return min;
    }
    let gain_step = descriptor.gain_steps[gain_id];
    let span = f64::from(max - min);
    let raw = (offset_real + level / gain_step) * span + 0.5 + f64::from(min);
    (raw as i64).clamp(i64::from(min), i64::from(max)) as u16
}

/// Compose the complete frame set for the snapshot.
pub fn compose_configuration(
    descriptor: &ModelDescriptor,
    settings: &SettingsSnapshot,
    calibration: &CalibrationData,
) -> Result<DeviceConfiguration, DsoError> {
    settings.validate(descriptor)?;
    if settings.used_channel_count() == 0 {
        return Err(DsoError::InvalidConfig("no channel enabled".into()));
    }

    let record_length_id = settings.horizontal.record_length_id;
    let buffer_divider = descriptor.buffer_dividers[record_length_id] as f64;

    // Fast-rate engages when a single channel needs more than the shared
    // buffers can sample.
    let (target, maximum) = match settings.horizontal.target {
        HorizontalTarget::Samplerate(rate) => (rate, false),
        HorizontalTarget::RecordTime(duration) => {
            let record = descriptor.single.record_lengths[record_length_id]
                .samples()
                .ok_or_else(|| {
                    DsoError::InvalidConfig(
                        "roll mode needs an explicit samplerate target".into(),
                    )
                })?;
            (f64::from(record) / duration, true)
        }
    };
    let fast_rate = descriptor.supports_fast_rate
        && settings.fast_rate_possible()
        && match settings.horizontal.target {
            HorizontalTarget::Samplerate(rate) => {
                rate > descriptor.single.max / buffer_divider
            }
            HorizontalTarget::RecordTime(_) => {
                target >= descriptor.multi.base / buffer_divider
            }
        };

    let (samplerate, downsampler) =
        best_samplerate(descriptor, record_length_id, fast_rate, target, maximum)?;

    let limits = descriptor.limits(fast_rate);
    let record_length = limits.record_lengths[record_length_id];

    // Pretrigger position in samples. Fast-rate addresses the merged
    // buffers, so the position halves.
    let record_samples = record_length.samples().unwrap_or(0);
    let mut position_samples =
        (settings.trigger.position * f64::from(record_samples)) as u32;
    if fast_rate {
        position_samples /= CHANNELS as u32;
    }

    let channels_code = used_channels_code(settings, descriptor.variant);
    let source_code = trigger_source_code(settings.trigger.source, descriptor.variant);
    let slope_code = settings.trigger.slope.raw();
    let special_trigger = matches!(settings.trigger.source, TriggerSource::Special(_));

    let mut scale = [ChannelScale {
        used: false,
        zero_level: 0.0,
        gain_step: descriptor.gain_steps[0],
    }; CHANNELS];

    // Offsets, relays and gain are shared across all variants.
    let mut offset_frame = SetOffset::default();
    let mut relays = SetRelays::default();
    let mut gain_frame = SetGain::default();
    let mut offset_real = [0.0f64; CHANNELS];
    for (index, channel) in settings.channels.iter().enumerate() {
        let gain_id = channel.gain_id;
        let (value, real) = offset_value(calibration, index, gain_id, channel.offset);
        offset_real[index] = real;
        offset_frame.set_channel(index, value);
        gain_frame.set_gain(index, descriptor.gain_index[gain_id]);
        relays.set_below_1v(index, gain_id < 3);
        relays.set_below_100mv(index, gain_id < 6);
        relays.set_coupling_dc(index, channel.coupling != Coupling::Ac);
        scale[index] = ChannelScale {
            used: channel.used,
            zero_level: real * f64::from(descriptor.full_scale()),
            gain_step: descriptor.gain_steps[gain_id],
        };
    }
    relays.set_trigger_ext(special_trigger);
    if special_trigger {
        offset_frame.set_trigger(0x7f);
    } else if let TriggerSource::Channel(id) = settings.trigger.source {
        offset_frame.set_trigger(trigger_level_value(
            descriptor,
            calibration,
            id,
            settings.channels[id].gain_id,
            offset_real[id],
            settings.trigger.level[id],
        ));
    }

    // The filter bits mark what is not taking part in the acquisition.
    let filter = SetFilter::new(
        !settings.channels[0].used,
        !settings.channels[1].used,
        special_trigger,
    );

    let roll = record_length == RecordLength::Roll;
    let mut bulk: Vec<Box<dyn BulkCommand + Send + Sync>> = Vec::new();

    match descriptor.variant {
        CommandVariant::Standard => {
            let mut tsr = SetTriggerAndSamplerate::default();
            tsr.set_trigger_source(source_code);
            tsr.set_record_length_id(record_length_id as u8);
            tsr.set_used_channels(channels_code);
            tsr.set_fast_rate(fast_rate);
            tsr.set_trigger_slope(slope_code);

            // Dividers 1, 2 and 5 go through the samplerate id table, larger
            // even values through the one's-complement downsampler field.
            if downsampler <= 5 {
                let samplerate_id = if downsampler == 0 && limits.base >= limits.max {
                    1
                } else if downsampler <= 2 {
                    downsampler as u8
                } else {
                    tsr.set_downsampler(0xffff);
                    3
                };
                tsr.set_samplerate_id(samplerate_id);
                tsr.set_downsampling_mode(false);
            } else {
                let even = downsampler & !1;
                tsr.set_downsampler((0x10001 - (even >> 1)) as u16);
                tsr.set_downsampling_mode(true);
            }

            let position = if roll {
                0x1
            } else {
                TRIGGER_POSITION_LIMIT
                    .wrapping_sub(record_samples)
                    .wrapping_add(position_samples)
                    & 0x00ff_ffff
            };
            tsr.set_trigger_position(position);

            bulk.push(Box::new(filter));
            bulk.push(Box::new(tsr));
            bulk.push(Box::new(gain_frame));
        }
        CommandVariant::Dso2250 => {
            let samplerate_frame = SetSamplerate2250::new(
                fast_rate,
                downsampler >= 1,
                if downsampler > 1 {
                    (0x10001 - downsampler) as u16
                } else {
                    0
                },
            );

            // The 512 kiS buffer spans the whole position range; keep the
            // wrap-around of the 24-bit field.
            let position_pre = TRIGGER_POSITION_LIMIT
                .wrapping_sub(record_samples)
                .wrapping_add(position_samples)
                & 0x00ff_ffff;
            let position_post = TRIGGER_POSITION_LIMIT.wrapping_sub(position_samples) & 0x00ff_ffff;

            bulk.push(Box::new(gain_frame));
            bulk.push(Box::new(SetChannels2250::new(channels_code)));
            bulk.push(Box::new(SetTrigger2250::new(source_code, slope_code)));
            bulk.push(Box::new(SetRecordLength2250::new(record_length_id as u8)));
            bulk.push(Box::new(samplerate_frame));
            bulk.push(Box::new(SetBuffer2250::new(position_pre, position_post)));
        }
        CommandVariant::Dso5200 => {
            // Split the divider into the slow (two's complement) and fast
            // parts; the fast part stays at 4 or 3 for slow rates.
            let value_slow = ((i64::from(downsampler) - 3) / 2).max(0) as u32;
            let value_fast = (4 - (i64::from(downsampler) - 2 * i64::from(value_slow))) as u8;
            let samplerate_frame =
                SetSamplerate5200::new((value_slow as u16).wrapping_neg(), value_fast);

            let used = if roll {
                TriggerPositionUsed::Off
            } else {
                TriggerPositionUsed::On
            };
            let position_pre = TRIGGER_POSITION_LIMIT_5200 - record_samples + position_samples;
            let position_post = TRIGGER_POSITION_LIMIT_5200 - position_samples;
            let buffer_frame = SetBuffer5200::new(
                position_pre as u16,
                position_post as u16,
                used,
                used,
                record_length_id as u8,
            );

            let trigger_frame = SetTrigger5200::new(
                source_code,
                channels_code,
                fast_rate,
                slope_code,
                false,
            );

            bulk.push(Box::new(filter));
            bulk.push(Box::new(gain_frame));
            bulk.push(Box::new(samplerate_frame));
            bulk.push(Box::new(buffer_frame));
            bulk.push(Box::new(trigger_frame));
        }
    }

    let controls = vec![
        ControlWrite {
            request: ControlRequest::SetOffset,
            payload: offset_frame.as_bytes().to_vec(),
        },
        ControlWrite {
            request: ControlRequest::SetRelays,
            payload: relays.as_bytes().to_vec(),
        },
    ];

    let plan = AcquisitionPlan {
        fast_rate,
        downsampler,
        samplerate,
        record_length_id,
        record_length,
        channel_used: [settings.channels[0].used, settings.channels[1].used],
        scale,
        trigger_mode: settings.trigger.mode,
        trigger_position: settings.trigger.position,
    };

    Ok(DeviceConfiguration {
        plan,
        bulk,
        controls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DSO2090, DSO2250, DSO5200};
    use crate::settings::SettingsSnapshot;

    fn snapshot(rate: f64) -> SettingsSnapshot {
        let mut settings = SettingsSnapshot::default();
        settings.horizontal.target = HorizontalTarget::Samplerate(rate);
        settings
    }

    #[test]
    fn unfold_inverts_below_set_bits() {
        // 0b100 -> the two bits below the set bit flip.
        assert_eq!(unfold_trigger_point(0b100), 0b111);
        assert_eq!(unfold_trigger_point(0), 0);
    }

    #[test]
    fn frames_transmit_in_opcode_order() {
        let config = compose_configuration(
            &DSO2250,
            &snapshot(1e6),
            &CalibrationData::default(),
        )
        .unwrap();
        let opcodes: Vec<u8> = config.bulk.iter().map(|frame| frame.opcode()).collect();
        let mut sorted = opcodes.clone();
        sorted.sort_unstable();
        assert_eq!(opcodes, sorted);
    }

    #[test]
    fn standard_table_dividers() {
        // 50 MS/s on a DSO-2090 is the base rate, divider 1.
        let (rate, downsampler) = best_samplerate(&DSO2090, 1, false, 50e6, false).unwrap();
        assert_eq!(rate, 50e6);
        assert_eq!(downsampler, 1);

        // 20 MS/s rounds down to divider 2 (3 and 4 do not exist).
        let (rate, downsampler) = best_samplerate(&DSO2090, 1, false, 20e6, false).unwrap();
        assert_eq!(downsampler, 2);
        assert_eq!(rate, 25e6);

        let (rate, downsampler) = best_samplerate(&DSO2090, 1, false, 10e6, false).unwrap();
        assert_eq!(downsampler, 5);
        assert_eq!(rate, 10e6);
    }

    #[test]
    fn oversized_divider_is_rejected() {
        assert!(matches!(
            best_samplerate(&DSO2250, 1, false, 0.5, false),
            Err(DsoError::InvalidConfig(_))
        ));
    }

    #[test]
    fn roll_mode_divides_rate_by_1000() {
        let mut settings = snapshot(50e3);
        settings.horizontal.record_length_id = 0;
        let config =
            compose_configuration(&DSO2090, &settings, &CalibrationData::default()).unwrap();
        assert!(config.plan.is_roll_mode());
        assert!(config.plan.samplerate <= 50e3);
    }

    #[test]
    fn fast_rate_engages_above_single_channel_max() {
        let mut settings = snapshot(75e6);
        settings.channels[1].used = false;
        let config =
            compose_configuration(&DSO2090, &settings, &CalibrationData::default()).unwrap();
        assert!(config.plan.fast_rate);
        assert_eq!(config.plan.samplerate, 100e6);

        // Two active channels cannot go fast; the rate caps at the shared
        // maximum instead.
        let settings = snapshot(75e6);
        let config =
            compose_configuration(&DSO2090, &settings, &CalibrationData::default()).unwrap();
        assert!(!config.plan.fast_rate);
        assert_eq!(config.plan.samplerate, 50e6);
    }

    #[test]
    fn plan_read_length_includes_expansion() {
        let config =
            compose_configuration(&DSO5200, &snapshot(1e6), &CalibrationData::default())
                .unwrap();
        let plan = &config.plan;
        // Two channels, 10240 samples each, two bytes per raw sample.
        assert_eq!(plan.sample_count(512), 20480);
        assert_eq!(plan.read_length(512, DSO5200.raw_bytes_per_sample()), 40960);
    }
}
