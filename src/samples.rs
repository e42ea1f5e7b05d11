//! Raw byte buffers to per-channel voltage series.
//!
//! The device returns the sample memory as a ring: 8-bit models interleave
//! the active channels, the 10-bit DSO-5200 family sends the 8 MSBs of every
//! sample first and packs the 2-bit remainders into a trailing section. The
//! decoder rotates the ring so the logical first sample (the trigger point)
//! sits at index 0 and applies the gain/offset scaling from the plan.

use crate::config::AcquisitionPlan;
use crate::error::DsoError;
use crate::model::{ModelDescriptor, CHANNELS};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Decoded samples of one channel.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChannelCapture {
    /// Time-ordered voltages, trigger point first.
    pub voltage: Vec<f64>,
    /// Uniform sample interval, in seconds.
    pub interval: f64,
    /// Spectrum magnitudes, filled in by the analyzer collaborator.
    pub spectrum: Vec<f64>,
    /// Frequency interval of the spectrum, in Hz.
    pub spectrum_interval: f64,
    /// Signal amplitude, filled in by the analyzer collaborator.
    pub amplitude: Option<f64>,
    /// Dominant frequency, filled in by the analyzer collaborator.
    pub frequency: Option<f64>,
}

/// One complete decoded capture, handed to the subscriber through the
/// result slot.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CaptureResult {
    pub channels: [Option<ChannelCapture>; CHANNELS],
    /// Effective samplerate of this capture, in S/s.
    pub samplerate: f64,
    /// true when the consumer should append (roll mode) instead of replace.
    pub append: bool,
}

/// Reassemble one 10-bit sample from the MSB section and the extras section.
///
/// Each even extras byte carries the low bit-pairs of two samples: the
/// earlier sample's pair in bits 7..6, the later in bits 5..4. Odd bytes are
/// reserved zero.
fn raw_sample_10bit(data: &[u8], total: usize, index: usize) -> u16 {
    let msb = u16::from(data[index]);
    let extra = data[total + (index & !1)];
    let lsb = if index % 2 == 0 {
        (extra >> 6) & 0x3
    } else {
        (extra >> 4) & 0x3
    };
    msb << 2 | u16::from(lsb)
}

/// Decode a raw capture buffer into per-channel voltages.
///
/// `trigger_point` is the already-unfolded ring index of the logical first
/// sample; the sequence is rotated so it lands at index 0.
pub fn decode_capture(
    raw: &[u8],
    descriptor: &ModelDescriptor,
    plan: &AcquisitionPlan,
    trigger_point: u32,
    append: bool,
) -> Result<CaptureResult, DsoError> {
    let bytes_per_sample = descriptor.raw_bytes_per_sample();
    if raw.is_empty() || raw.len() % bytes_per_sample != 0 {
        return Err(DsoError::Protocol(format!(
            "sample buffer of {} bytes is not divisible into {}-byte samples",
            raw.len(),
            bytes_per_sample
        )));
    }

    let total = raw.len() / bytes_per_sample;
    let stride = plan.active_channel_count().max(1);
    let per_channel = total / stride;
    let start = trigger_point as usize % total;
    let full_scale = f64::from(descriptor.full_scale());
    let interval = 1.0 / plan.samplerate;

    let mut result = CaptureResult {
        channels: Default::default(),
        samplerate: plan.samplerate,
        append,
    };

    let mut slot = 0;
    for channel in 0..CHANNELS {
        if !plan.channel_used[channel] {
            continue;
        }
        let scale = &plan.scale[channel];
        let mut voltage = Vec::with_capacity(per_channel);
        for position in 0..per_channel {
            let index = (start + position * stride + slot) % total;
            let value = if descriptor.bit_depth > 8 {
                f64::from(raw_sample_10bit(raw, total, index))
            } else {
                f64::from(raw[index])
            };
            voltage.push((value - scale.zero_level) * scale.gain_step / full_scale);
        }
        result.channels[channel] = Some(ChannelCapture {
            voltage,
            interval,
            ..Default::default()
        });
        slot += 1;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelScale, AcquisitionPlan};
    use crate::model::{RecordLength, DSO2090, DSO5200};
    use crate::settings::TriggerMode;

    fn plan(channel_used: [bool; 2], samplerate: f64) -> AcquisitionPlan {
        let scale = ChannelScale {
            used: true,
            zero_level: 0.0,
            gain_step: 1.0,
        };
        AcquisitionPlan {
            fast_rate: false,
            downsampler: 0,
            samplerate,
            record_length_id: 1,
            record_length: RecordLength::Samples(8),
            channel_used,
            scale: [scale; 2],
            trigger_mode: TriggerMode::Normal,
            trigger_position: 0.0,
        }
    }

    #[test]
    fn eight_bit_interleave_and_rotation() {
        // Two channels interleaved, ring starting at raw index 2.
        let raw = [10u8, 20, 30, 40, 50, 60, 70, 80];
        let result = decode_capture(&raw, &DSO2090, &plan([true, true], 1e6), 2, false).unwrap();
        let ch1 = result.channels[0].as_ref().unwrap();
        let ch2 = result.channels[1].as_ref().unwrap();
        // Channel slots keep their interleave order after rotation.
        let expected1: Vec<f64> = [30u8, 50, 70, 10].iter().map(|&v| f64::from(v) / 256.0).collect();
        let expected2: Vec<f64> = [40u8, 60, 80, 20].iter().map(|&v| f64::from(v) / 256.0).collect();
        assert_eq!(ch1.voltage, expected1);
        assert_eq!(ch2.voltage, expected2);
        assert_eq!(ch1.interval, 1e-6);
    }

    #[test]
    fn unused_channel_stays_empty() {
        let raw = [1u8, 2, 3, 4];
        let result = decode_capture(&raw, &DSO2090, &plan([false, true], 1e6), 0, false).unwrap();
        assert!(result.channels[0].is_none());
        assert_eq!(result.channels[1].as_ref().unwrap().voltage.len(), 4);
    }

    #[test]
    fn ten_bit_reassembly() {
        // Four samples: MSB section then extras section. The first extras
        // byte packs the bit pairs of samples 0 and 1.
        let raw = [0x80u8, 0x40, 0x00, 0x00, 0b1000_0000, 0x00, 0b0100_0000, 0x00];
        assert_eq!(raw_sample_10bit(&raw, 4, 0), 0x202);
        assert_eq!(raw_sample_10bit(&raw, 4, 1), 0x100);
        assert_eq!(raw_sample_10bit(&raw, 4, 2), 0x001);

        let result = decode_capture(&raw, &DSO5200, &plan([true, false], 1e6), 0, false).unwrap();
        let ch1 = result.channels[0].as_ref().unwrap();
        assert_eq!(ch1.voltage[0], f64::from(0x202u16) / 1024.0);
    }

    #[test]
    fn odd_length_buffer_is_rejected() {
        let raw = [0u8; 7];
        assert!(matches!(
            decode_capture(&raw, &DSO5200, &plan([true, false], 1e6), 0, false),
            Err(DsoError::Protocol(_))
        ));
    }
}
