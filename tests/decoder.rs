//! Sample decoding: interleave, 10-bit reassembly, ring rotation, scaling.

mod common;

use hantek_dso::config::{compose_configuration, AcquisitionPlan};
use hantek_dso::control::CalibrationData;
use hantek_dso::model::{DSO2090, DSO5200};
use hantek_dso::samples::decode_capture;
use hantek_dso::settings::{HorizontalTarget, SettingsSnapshot};

fn plan_for(descriptor: &hantek_dso::ModelDescriptor, single_channel: bool) -> AcquisitionPlan {
    let mut settings = SettingsSnapshot::default();
    settings.horizontal.target = HorizontalTarget::Samplerate(1e6);
    if single_channel {
        settings.channels[1].used = false;
    }
    // Neutral scaling so raw values can be checked directly.
    let mut plan = compose_configuration(descriptor, &settings, &CalibrationData::default())
        .unwrap()
        .plan;
    for scale in &mut plan.scale {
        scale.zero_level = 0.0;
        scale.gain_step = 1.0;
    }
    plan
}

#[test]
fn ten_bit_reassembly_of_first_sample() {
    // MSB payload [0x80, 0x40, ...] with extras [0b1000_0000, 0b0100_0000,
    // 0, 0]: the first sample is (0x80 << 2) | 0b10 = 0x202.
    let mut raw = vec![0x80u8, 0x40, 0x00, 0x00];
    raw.extend_from_slice(&[0b1000_0000, 0b0100_0000, 0, 0]);

    let plan = plan_for(&DSO5200, true);
    let result = decode_capture(&raw, &DSO5200, &plan, 0, false).unwrap();
    let channel = result.channels[0].as_ref().unwrap();
    assert_eq!(channel.voltage[0], f64::from(0x202u16) / 1024.0);
}

#[test]
fn eight_bit_two_channel_interleave() {
    let raw = [11u8, 21, 12, 22, 13, 23];
    let plan = plan_for(&DSO2090, false);
    let result = decode_capture(&raw, &DSO2090, &plan, 0, false).unwrap();
    let ch1: Vec<u8> = result.channels[0]
        .as_ref()
        .unwrap()
        .voltage
        .iter()
        .map(|v| (v * 256.0) as u8)
        .collect();
    let ch2: Vec<u8> = result.channels[1]
        .as_ref()
        .unwrap()
        .voltage
        .iter()
        .map(|v| (v * 256.0) as u8)
        .collect();
    assert_eq!(ch1, [11, 12, 13]);
    assert_eq!(ch2, [21, 22, 23]);
}

#[test]
fn ring_rotates_to_the_trigger_point() {
    let raw = [0u8, 1, 2, 3, 4, 5, 6, 7];
    let plan = plan_for(&DSO2090, true);
    let result = decode_capture(&raw, &DSO2090, &plan, 5, false).unwrap();
    let voltage: Vec<u8> = result.channels[0]
        .as_ref()
        .unwrap()
        .voltage
        .iter()
        .map(|v| (v * 256.0) as u8)
        .collect();
    assert_eq!(voltage, [5, 6, 7, 0, 1, 2, 3, 4]);

    // Trigger points past the buffer wrap around.
    let result = decode_capture(&raw, &DSO2090, &plan, 13, false).unwrap();
    let voltage: Vec<u8> = result.channels[0]
        .as_ref()
        .unwrap()
        .voltage
        .iter()
        .map(|v| (v * 256.0) as u8)
        .collect();
    assert_eq!(voltage[0], 5);
}

#[test]
fn voltage_scaling_uses_zero_level_and_gain() {
    let raw = [128u8, 0, 255];
    let mut plan = plan_for(&DSO2090, true);
    plan.scale[0].zero_level = 128.0;
    plan.scale[0].gain_step = 2.0;
    let result = decode_capture(&raw, &DSO2090, &plan, 0, false).unwrap();
    let voltage = &result.channels[0].as_ref().unwrap().voltage;
    assert_eq!(voltage[0], 0.0);
    assert_eq!(voltage[1], (0.0 - 128.0) * 2.0 / 256.0);
    assert_eq!(voltage[2], (255.0 - 128.0) * 2.0 / 256.0);
}

#[test]
fn interval_follows_the_effective_samplerate() {
    let raw = [0u8; 8];
    let plan = plan_for(&DSO2090, true);
    let result = decode_capture(&raw, &DSO2090, &plan, 0, false).unwrap();
    let channel = result.channels[0].as_ref().unwrap();
    assert_eq!(channel.interval, 1.0 / plan.samplerate);
    // Analyzer-owned fields start unset.
    assert!(channel.spectrum.is_empty());
    assert!(channel.amplitude.is_none());
    assert!(channel.frequency.is_none());
}
