//! Per-model device descriptors.
//!
//! Everything the engine needs to know about a specific oscilloscope family
//! member lives in one immutable [`ModelDescriptor`]: USB ids (with and
//! without firmware), endpoints, the command-set variant that disambiguates
//! the overloaded 0x0b..0x0f opcodes, samplerate limits, record-length and
//! gain tables, and the sample bit depth.

use strum_macros::Display;

use crate::settings::Coupling;

/// Number of physical channels on all supported models.
pub const CHANNELS: usize = 2;
/// Number of special trigger channels (EXT, EXT/10).
pub const SPECIAL_CHANNELS: usize = 2;
/// Number of gain steps in the hardware tables.
pub const GAIN_STEPS: usize = 9;

/// OUT endpoint for bulk transfers.
pub const EP_OUT: u8 = 0x02;
/// IN endpoint for bulk transfers.
pub const EP_IN: u8 = 0x86;

/// Which command set the model speaks for the overloaded opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandVariant {
    /// DSO-2090/DSO-2150: everything through `SetTriggerAndSamplerate`.
    Standard,
    /// DSO-2250: 0x0b/0x0c/0x0d/0x0e/0x0f split command set.
    Dso2250,
    /// DSO-5200/DSO-5200A: 0x0c/0x0d/0x0e split command set, 10-bit samples.
    Dso5200,
}

/// One selectable sample buffer size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLength {
    /// Unbounded rolling acquisition; the effective samplerate is divided
    /// by the roll-mode buffer divider.
    Roll,
    Samples(u32),
}

impl RecordLength {
    pub fn samples(self) -> Option<u32> {
        match self {
            RecordLength::Roll => None,
            RecordLength::Samples(count) => Some(count),
        }
    }
}

/// Samplerate limits for one channel configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerateLimits {
    /// Base rate for downsampler calculations, in S/s.
    pub base: f64,
    /// Maximum reachable rate, in S/s.
    pub max: f64,
    /// Largest downsampling ratio the divider field can carry.
    pub max_downsampler: u32,
    /// Selectable record lengths, indexed by record-length id.
    pub record_lengths: &'static [RecordLength],
}

/// Supported oscilloscope models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DeviceModel {
    #[strum(to_string = "DSO-2090")]
    Dso2090,
    #[strum(to_string = "DSO-2090A")]
    Dso2090A,
    #[strum(to_string = "DSO-2150")]
    Dso2150,
    #[strum(to_string = "DSO-2250")]
    Dso2250,
    #[strum(to_string = "DSO-5200")]
    Dso5200,
    #[strum(to_string = "DSO-5200A")]
    Dso5200A,
}

/// Immutable description of one supported model, selected at match time.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub model: DeviceModel,
    /// USB ids after firmware upload.
    pub vendor_id: u16,
    pub product_id: u16,
    /// USB ids of the blank EZ-USB device before firmware upload.
    pub no_firmware_vendor_id: u16,
    pub no_firmware_product_id: u16,
    /// Name stem of the loader/firmware image pair.
    pub firmware_token: &'static str,
    pub endpoint_in: u8,
    pub endpoint_out: u8,
    pub variant: CommandVariant,
    /// Limits when both channels share the sample buffers.
    pub single: SamplerateLimits,
    /// Limits in fast-rate mode (one channel uses all buffers).
    pub multi: SamplerateLimits,
    pub supports_fast_rate: bool,
    /// Samplerate dividers per record-length id (roll mode divides by 1000).
    pub buffer_dividers: [u32; 3],
    /// Voltage steps in V per screen height, per gain id.
    pub gain_steps: [f64; GAIN_STEPS],
    /// Hardware gain selector per gain id.
    pub gain_index: [u8; GAIN_STEPS],
    /// Raw sample value at the top of the screen, per gain id.
    pub voltage_limit: [u16; GAIN_STEPS],
    pub coupling_options: &'static [Coupling],
    /// Bits per sample: 8, or 10 with the split extra-bits payload.
    pub bit_depth: u8,
}

impl ModelDescriptor {
    pub fn name(&self) -> String {
        self.model.to_string()
    }

    /// Limits for the given fast-rate state.
    pub fn limits(&self, fast_rate: bool) -> &SamplerateLimits {
        if fast_rate {
            &self.multi
        } else {
            &self.single
        }
    }

    /// Raw full-scale value for voltage conversion: 256 or 1024.
    pub fn full_scale(&self) -> u16 {
        if self.bit_depth > 8 {
            1024
        } else {
            256
        }
    }

    /// Bytes transferred per raw sample (10-bit models split samples in two).
    pub fn raw_bytes_per_sample(&self) -> usize {
        if self.bit_depth > 8 {
            2
        } else {
            1
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }

    pub fn matches_no_firmware(&self, vendor_id: u16, product_id: u16) -> bool {
        self.no_firmware_vendor_id == vendor_id && self.no_firmware_product_id == product_id
    }
}

const COUPLING_AC_DC: &[Coupling] = &[Coupling::Ac, Coupling::Dc, Coupling::Gnd];

const GAIN_STEPS_8BIT: [f64; GAIN_STEPS] = [0.08, 0.16, 0.40, 0.80, 1.60, 4.00, 8.0, 16.0, 40.0];
const VOLTAGE_LIMIT_8BIT: [u16; GAIN_STEPS] = [255; GAIN_STEPS];

pub const DSO2090: ModelDescriptor = ModelDescriptor {
    model: DeviceModel::Dso2090,
    vendor_id: 0x04b5,
    product_id: 0x2090,
    no_firmware_vendor_id: 0x04b4,
    no_firmware_product_id: 0x2090,
    firmware_token: "dso2090x86",
    endpoint_in: EP_IN,
    endpoint_out: EP_OUT,
    variant: CommandVariant::Standard,
    single: SamplerateLimits {
        base: 50e6,
        max: 50e6,
        max_downsampler: 131072,
        record_lengths: &[
            RecordLength::Roll,
            RecordLength::Samples(10240),
            RecordLength::Samples(32768),
        ],
    },
    multi: SamplerateLimits {
        base: 100e6,
        max: 100e6,
        max_downsampler: 131072,
        record_lengths: &[
            RecordLength::Roll,
            RecordLength::Samples(20480),
            RecordLength::Samples(65536),
        ],
    },
    supports_fast_rate: true,
    buffer_dividers: [1000, 1, 1],
    gain_steps: GAIN_STEPS_8BIT,
    gain_index: [0, 1, 2, 0, 1, 2, 0, 1, 2],
    voltage_limit: VOLTAGE_LIMIT_8BIT,
    coupling_options: COUPLING_AC_DC,
    bit_depth: 8,
};

/// DSO-2090A: same scope, blank chip enumerates as the bare Cypress FX2.
pub const DSO2090A: ModelDescriptor = ModelDescriptor {
    model: DeviceModel::Dso2090A,
    no_firmware_product_id: 0x8613,
    ..DSO2090
};

pub const DSO2150: ModelDescriptor = ModelDescriptor {
    model: DeviceModel::Dso2150,
    vendor_id: 0x04b5,
    product_id: 0x2150,
    no_firmware_vendor_id: 0x04b4,
    no_firmware_product_id: 0x2150,
    firmware_token: "dso2150x86",
    endpoint_in: EP_IN,
    endpoint_out: EP_OUT,
    variant: CommandVariant::Standard,
    single: SamplerateLimits {
        base: 50e6,
        max: 75e6,
        max_downsampler: 131072,
        record_lengths: &[
            RecordLength::Roll,
            RecordLength::Samples(10240),
            RecordLength::Samples(32768),
        ],
    },
    multi: SamplerateLimits {
        base: 100e6,
        max: 150e6,
        max_downsampler: 131072,
        record_lengths: &[
            RecordLength::Roll,
            RecordLength::Samples(20480),
            RecordLength::Samples(65536),
        ],
    },
    supports_fast_rate: true,
    buffer_dividers: [1000, 1, 1],
    gain_steps: GAIN_STEPS_8BIT,
    gain_index: [0, 1, 2, 0, 1, 2, 0, 1, 2],
    voltage_limit: VOLTAGE_LIMIT_8BIT,
    coupling_options: COUPLING_AC_DC,
    bit_depth: 8,
};

pub const DSO2250: ModelDescriptor = ModelDescriptor {
    model: DeviceModel::Dso2250,
    vendor_id: 0x04b5,
    product_id: 0x2250,
    no_firmware_vendor_id: 0x04b4,
    no_firmware_product_id: 0x2250,
    firmware_token: "dso2250x86",
    endpoint_in: EP_IN,
    endpoint_out: EP_OUT,
    variant: CommandVariant::Dso2250,
    single: SamplerateLimits {
        base: 100e6,
        max: 100e6,
        max_downsampler: 65536,
        record_lengths: &[
            RecordLength::Roll,
            RecordLength::Samples(10240),
            RecordLength::Samples(524288),
        ],
    },
    multi: SamplerateLimits {
        base: 200e6,
        max: 250e6,
        max_downsampler: 65536,
        record_lengths: &[
            RecordLength::Roll,
            RecordLength::Samples(20480),
            RecordLength::Samples(1048576),
        ],
    },
    supports_fast_rate: true,
    buffer_dividers: [1000, 1, 1],
    gain_steps: GAIN_STEPS_8BIT,
    gain_index: [0, 2, 3, 0, 2, 3, 0, 2, 3],
    voltage_limit: VOLTAGE_LIMIT_8BIT,
    coupling_options: COUPLING_AC_DC,
    bit_depth: 8,
};

pub const DSO5200: ModelDescriptor = ModelDescriptor {
    model: DeviceModel::Dso5200,
    vendor_id: 0x04b5,
    product_id: 0x5200,
    no_firmware_vendor_id: 0x04b4,
    no_firmware_product_id: 0x5200,
    firmware_token: "dso5200x86",
    endpoint_in: EP_IN,
    endpoint_out: EP_OUT,
    variant: CommandVariant::Dso5200,
    single: SamplerateLimits {
        base: 100e6,
        max: 125e6,
        max_downsampler: 131072,
        record_lengths: &[
            RecordLength::Roll,
            RecordLength::Samples(10240),
            RecordLength::Samples(14336),
        ],
    },
    multi: SamplerateLimits {
        base: 200e6,
        max: 250e6,
        max_downsampler: 131072,
        record_lengths: &[
            RecordLength::Roll,
            RecordLength::Samples(20480),
            RecordLength::Samples(28672),
        ],
    },
    supports_fast_rate: true,
    buffer_dividers: [1000, 1, 1],
    gain_steps: [0.16, 0.40, 0.80, 1.60, 4.00, 8.0, 16.0, 40.0, 80.0],
    gain_index: [1, 0, 0, 1, 0, 0, 1, 0, 0],
    voltage_limit: [368, 454, 908, 368, 454, 908, 368, 454, 908],
    coupling_options: COUPLING_AC_DC,
    bit_depth: 10,
};

pub const DSO5200A: ModelDescriptor = ModelDescriptor {
    model: DeviceModel::Dso5200A,
    product_id: 0x520a,
    no_firmware_product_id: 0x520a,
    firmware_token: "dso5200ax86",
    ..DSO5200
};

/// All models the driver knows about, in match order.
pub const SUPPORTED_MODELS: &[&ModelDescriptor] =
    &[&DSO2090, &DSO2090A, &DSO2150, &DSO2250, &DSO5200, &DSO5200A];

/// Result of matching a USB id pair against the registry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelMatch {
    pub descriptor: &'static ModelDescriptor,
    /// true when the device enumerated with its pre-firmware ids.
    pub needs_firmware: bool,
}

/// Look a vendor/product id pair up in the registry.
pub fn match_ids(vendor_id: u16, product_id: u16) -> Option<ModelMatch> {
    for descriptor in SUPPORTED_MODELS.iter().copied() {
        if descriptor.matches(vendor_id, product_id) {
            return Some(ModelMatch {
                descriptor,
                needs_firmware: false,
            });
        }
        if descriptor.matches_no_firmware(vendor_id, product_id) {
            return Some(ModelMatch {
                descriptor,
                needs_firmware: true,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_ids_are_distinct_per_model() {
        assert_eq!(match_ids(0x04b5, 0x2090).unwrap().descriptor.model, DeviceModel::Dso2090);
        assert_eq!(match_ids(0x04b5, 0x520a).unwrap().descriptor.model, DeviceModel::Dso5200A);
        assert!(match_ids(0x04b5, 0x9999).is_none());
    }

    #[test]
    fn pre_firmware_ids_request_upload() {
        let m = match_ids(0x04b4, 0x2250).unwrap();
        assert!(m.needs_firmware);
        assert_eq!(m.descriptor.model, DeviceModel::Dso2250);
        // The 2090A enumerates as a blank FX2.
        let m = match_ids(0x04b4, 0x8613).unwrap();
        assert!(m.needs_firmware);
        assert_eq!(m.descriptor.model, DeviceModel::Dso2090A);
    }

    #[test]
    fn bit_depth_drives_scaling() {
        assert_eq!(DSO2090.full_scale(), 256);
        assert_eq!(DSO2090.raw_bytes_per_sample(), 1);
        assert_eq!(DSO5200.full_scale(), 1024);
        assert_eq!(DSO5200.raw_bytes_per_sample(), 2);
    }
}
