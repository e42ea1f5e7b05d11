//! EZ-USB firmware upload.
//!
//! A freshly powered scope enumerates as a blank Cypress EZ-USB with the
//! pre-firmware ids from its model descriptor and only becomes an
//! oscilloscope after a loader and a firmware image have been written into
//! the controller's RAM. Images come from an injected [`FirmwareProvider`];
//! the core never reads fixed paths.

use tracing::{debug, info};

use crate::device::{UsbTransport, TRANSFER_TIMEOUT};
use crate::error::DsoError;
use crate::model::ModelDescriptor;

/// EZ-USB vendor request for RAM access.
const REQUEST_FIRMWARE_LOAD: u8 = 0xa0;
/// Address of the CPUCS register holding the 8051 in reset.
const CPUCS_ADDRESS: u16 = 0xe600;
/// Largest chunk written per control transfer.
const CHUNK_SIZE: usize = 1024;

/// One contiguous block of firmware bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareRecord {
    pub address: u16,
    pub data: Vec<u8>,
}

/// A parsed firmware image: the records of an Intel-hex file, in file order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FirmwareImage {
    pub records: Vec<FirmwareRecord>,
}

impl FirmwareImage {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Supplies the loader/firmware image pair for a model's firmware token.
pub trait FirmwareProvider {
    fn loader(&self, token: &str) -> Result<FirmwareImage, DsoError>;
    fn firmware(&self, token: &str) -> Result<FirmwareImage, DsoError>;
}

async fn set_cpu_reset<T: UsbTransport>(transport: &mut T, hold: bool) -> Result<(), DsoError> {
    let value = [u8::from(hold)];
    transport
        .control_out(REQUEST_FIRMWARE_LOAD, CPUCS_ADDRESS, 0, &value, TRANSFER_TIMEOUT)
        .await?;
    Ok(())
}

/// Write one image into controller RAM with the CPU held in reset.
pub async fn upload_image<T: UsbTransport>(
    transport: &mut T,
    image: &FirmwareImage,
) -> Result<(), DsoError> {
    if image.is_empty() {
        return Err(DsoError::Firmware("image contains no records".into()));
    }

    set_cpu_reset(transport, true).await?;
    for record in &image.records {
        let mut address = record.address;
        for chunk in record.data.chunks(CHUNK_SIZE) {
            debug!(address, len = chunk.len(), "firmware write");
            let written = transport
                .control_out(REQUEST_FIRMWARE_LOAD, address, 0, chunk, TRANSFER_TIMEOUT)
                .await?;
            if written != chunk.len() {
                return Err(DsoError::Firmware(format!(
                    "short firmware write at {address:#06x}: {written} of {} bytes",
                    chunk.len()
                )));
            }
            address = address.wrapping_add(chunk.len() as u16);
        }
    }
    set_cpu_reset(transport, false).await?;
    Ok(())
}

/// Upload the loader, then the firmware, for the given model.
///
/// After the final reset release the device renumerates with its firmware
/// ids; the caller reconnects once it reappears.
pub async fn upload<T: UsbTransport>(
    transport: &mut T,
    descriptor: &ModelDescriptor,
    provider: &dyn FirmwareProvider,
) -> Result<(), DsoError> {
    let token = descriptor.firmware_token;
    info!("uploading firmware \"{token}\" to {}", descriptor.name());
    upload_image(transport, &provider.loader(token)?).await?;
    upload_image(transport, &provider.firmware(token)?).await?;
    info!("firmware upload complete, waiting for renumeration");
    Ok(())
}
