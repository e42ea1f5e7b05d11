//! The configuration snapshot the engine consumes.
//!
//! Authored by the external settings collaborator and copied into the
//! acquisition actor on every change; the engine never shares it across
//! tasks. [`SettingsSnapshot::validate`] rejects combinations the device
//! cannot express before any I/O happens.

use strum_macros::Display;

use crate::error::DsoError;
use crate::model::{ModelDescriptor, RecordLength, CHANNELS, GAIN_STEPS, SPECIAL_CHANNELS};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Input coupling for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Coupling {
    #[strum(to_string = "AC")]
    Ac,
    #[default]
    #[strum(to_string = "DC")]
    Dc,
    #[strum(to_string = "GND")]
    Gnd,
}

/// The slope that causes a trigger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Slope {
    #[default]
    #[strum(to_string = "rising")]
    Positive,
    #[strum(to_string = "falling")]
    Negative,
}

impl Slope {
    pub fn raw(self) -> u8 {
        match self {
            Slope::Positive => 0,
            Slope::Negative => 1,
        }
    }
}

/// Trigger behavior when no event arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TriggerMode {
    /// Force a trigger after the configured window.
    #[strum(to_string = "auto")]
    Auto,
    /// Wait for a real event indefinitely.
    #[default]
    #[strum(to_string = "normal")]
    Normal,
    /// Stop after the first captured record.
    #[strum(to_string = "single")]
    Single,
}

/// What fires the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TriggerSource {
    /// A physical input channel (0-based).
    Channel(usize),
    /// A special input: 0 = EXT, 1 = EXT/10.
    Special(usize),
}

impl Default for TriggerSource {
    fn default() -> Self {
        TriggerSource::Channel(0)
    }
}

/// The viewing format requested by the scope screen; carried through for
/// the rendering collaborator, not interpreted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GraphFormat {
    #[default]
    Ty,
    Xy,
}

/// How the horizontal system picks the samplerate.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum HorizontalTarget {
    /// Meet this samplerate, in S/s.
    Samplerate(f64),
    /// Meet this record duration, in seconds.
    RecordTime(f64),
}

impl Default for HorizontalTarget {
    fn default() -> Self {
        HorizontalTarget::Samplerate(1e6)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TriggerSettings {
    pub mode: TriggerMode,
    pub source: TriggerSource,
    pub slope: Slope,
    /// Trigger level per channel, in V.
    pub level: [f64; CHANNELS],
    /// Pretrigger position as a fraction of the record, 0.0..=1.0.
    pub position: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HorizontalSettings {
    pub target: HorizontalTarget,
    /// Index into the model's record-length table; id 0 is roll mode.
    pub record_length_id: usize,
    pub format: GraphFormat,
}

impl Default for HorizontalSettings {
    fn default() -> Self {
        Self {
            target: HorizontalTarget::default(),
            record_length_id: 1,
            format: GraphFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChannelSettings {
    pub used: bool,
    /// Index into the model's gain table.
    pub gain_id: usize,
    pub coupling: Coupling,
    /// Screen offset as a fraction, 0.0..=1.0.
    pub offset: f64,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            used: true,
            gain_id: 0,
            coupling: Coupling::Dc,
            offset: 0.5,
        }
    }
}

/// Spectrum view request, carried through to the analyzer collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpectrumSettings {
    pub used: bool,
    /// Magnitude per division, in dB.
    pub magnitude: f64,
}

/// Complete device configuration as authored by the settings collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SettingsSnapshot {
    pub trigger: TriggerSettings,
    pub horizontal: HorizontalSettings,
    pub channels: [ChannelSettings; CHANNELS],
    pub spectrum: [SpectrumSettings; CHANNELS],
}

impl SettingsSnapshot {
    /// Number of channels taking part in the acquisition.
    pub fn used_channel_count(&self) -> usize {
        self.channels.iter().filter(|ch| ch.used).count()
    }

    /// Fast-rate mode is possible when at most one channel is active.
    pub fn fast_rate_possible(&self) -> bool {
        self.used_channel_count() <= 1
    }

    /// Reject combinations the device cannot express. Runs before any I/O,
    /// so a bad snapshot never corrupts device state.
    pub fn validate(&self, descriptor: &ModelDescriptor) -> Result<(), DsoError> {
        let limits = descriptor.limits(false);
        if self.horizontal.record_length_id >= limits.record_lengths.len() {
            return Err(DsoError::InvalidConfig(format!(
                "record length id {} out of range for {}",
                self.horizontal.record_length_id,
                descriptor.name()
            )));
        }
        if limits.record_lengths[self.horizontal.record_length_id] == RecordLength::Roll
            && self.trigger.mode == TriggerMode::Single
        {
            return Err(DsoError::InvalidConfig(
                "single trigger mode is meaningless in roll mode".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.trigger.position) {
            return Err(DsoError::InvalidConfig(format!(
                "pretrigger position {} outside 0.0..=1.0",
                self.trigger.position
            )));
        }
        for (index, channel) in self.channels.iter().enumerate() {
            if channel.gain_id >= GAIN_STEPS {
                return Err(DsoError::InvalidConfig(format!(
                    "gain id {} out of range on channel {}",
                    channel.gain_id, index
                )));
            }
            if !(0.0..=1.0).contains(&channel.offset) {
                return Err(DsoError::InvalidConfig(format!(
                    "offset {} outside 0.0..=1.0 on channel {}",
                    channel.offset, index
                )));
            }
            if !descriptor.coupling_options.contains(&channel.coupling) {
                return Err(DsoError::InvalidConfig(format!(
                    "{} does not support {} coupling",
                    descriptor.name(),
                    channel.coupling
                )));
            }
        }
        match self.trigger.source {
            TriggerSource::Channel(id) if id >= CHANNELS => {
                return Err(DsoError::InvalidConfig(format!(
                    "trigger channel {id} does not exist"
                )));
            }
            TriggerSource::Special(id) if id >= SPECIAL_CHANNELS => {
                return Err(DsoError::InvalidConfig(format!(
                    "special trigger input {id} does not exist"
                )));
            }
            TriggerSource::Channel(id) if !self.channels[id].used => {
                return Err(DsoError::InvalidConfig(format!(
                    "trigger channel {id} is not enabled"
                )));
            }
            _ => {}
        }
        match self.horizontal.target {
            HorizontalTarget::Samplerate(rate) if rate <= 0.0 => {
                return Err(DsoError::InvalidConfig(format!(
                    "samplerate {rate} must be positive"
                )));
            }
            HorizontalTarget::RecordTime(duration) if duration <= 0.0 => {
                return Err(DsoError::InvalidConfig(format!(
                    "record time {duration} must be positive"
                )));
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DSO2090;

    #[test]
    fn default_snapshot_is_valid() {
        SettingsSnapshot::default().validate(&DSO2090).unwrap();
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        let mut settings = SettingsSnapshot::default();
        settings.channels[1].gain_id = 9;
        assert!(matches!(
            settings.validate(&DSO2090),
            Err(DsoError::InvalidConfig(_))
        ));

        let mut settings = SettingsSnapshot::default();
        settings.trigger.position = 1.5;
        assert!(settings.validate(&DSO2090).is_err());

        let mut settings = SettingsSnapshot::default();
        settings.horizontal.record_length_id = 7;
        assert!(settings.validate(&DSO2090).is_err());
    }

    #[test]
    fn trigger_source_must_be_enabled() {
        let mut settings = SettingsSnapshot::default();
        settings.channels[1].used = false;
        settings.trigger.source = TriggerSource::Channel(1);
        assert!(settings.validate(&DSO2090).is_err());
        settings.trigger.source = TriggerSource::Special(0);
        settings.validate(&DSO2090).unwrap();
    }
}
