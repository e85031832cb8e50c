use crate::cmd::{self, BootHeader, Result, RpibootError};
use crate::fs::VirtualFs;
use crate::usb::{self, UsbLink};
use crate::*;

use tracing::{debug, error, info};

/// Where a device is in the boot sequence, from the host's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Disconnected,
    Connected,
    FirstStageBoot,
    FileServing,
}

/// What a probed device is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    /// The boot ROM still needs its first stage file.
    FirstStage,
    /// The first stage is running and will request files.
    FileServer,
}
impl From<BootStage> for BootState {
    fn from(stage: BootStage) -> Self {
        match stage {
            BootStage::FirstStage => BootState::FirstStageBoot,
            BootStage::FileServer => BootState::FileServing,
        }
    }
}

/// Reads the device descriptor to tell which stage the device is in.
///
/// The boot ROM reports an `iSerialNumber` of 0 or 3; the first stage
/// firmware reports something else.
pub fn probe<L: UsbLink>(link: &mut L) -> Result<BootStage> {
    let desc = link.device_descriptor()?;
    let index = cmd::serial_index(&desc)?;
    debug!("iSerialNumber = {}", index);

    if FIRST_STAGE_SERIAL_INDICES.contains(&index) {
        Ok(BootStage::FirstStage)
    } else {
        Ok(BootStage::FileServer)
    }
}

/// Pushes the first stage boot file to the boot ROM.
///
/// Returns the device's response code. A non-zero code is logged but not
/// treated as a failure: the device is expected to drop off the bus and come
/// back asking for files either way.
pub fn first_stage_boot<L: UsbLink>(
    link: &mut L,
    fs: &VirtualFs,
    boot_file_name: &str,
) -> Result<i32> {
    let boot_file = fs
        .get_file(boot_file_name)
        .ok_or_else(|| RpibootError::BootFileMissing(boot_file_name.to_string()))?;
    let length = u32::try_from(boot_file.len()).map_err(|_| RpibootError::FileTooLarge {
        path: boot_file_name.to_string(),
        size: boot_file.len() as u64,
    })?;

    info!("sending {} ({} bytes)", boot_file_name, length);
    let header = BootHeader::new(length).to_bytes()?;
    usb::ep_write(link, &header)?;
    usb::ep_write(link, boot_file)?;

    let response = usb::ep_read(link, RESPONSE_CODE_LEN)?;
    let code = cmd::response_code(&response)?;
    if code != 0 {
        error!("first stage boot returned {}", code);
    } else {
        info!("first stage boot completed");
    }

    Ok(code)
}
