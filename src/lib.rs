//! Booting a Raspberry Pi in USB device boot mode and serving the files it asks for.
//!
//! <br>
//!
//! When a Raspberry Pi (or Compute Module) cannot find anything to boot from,
//! or is strapped into USB device boot, its mask ROM enumerates as a USB
//! device under the Broadcom vendor id and waits for a host to push it a
//! small second stage (`bootcode*.bin`). Once that runs, the device
//! re-enumerates and starts asking the host for more files (start firmware,
//! `config.txt`, EEPROM images, a `boot.img` ...) through a tiny
//! request/response file-server protocol. This is the protocol implemented by
//! the `rpiboot` tool from the `usbboot` repository.
//!
//! The crate is split into:
//!
//! - [`usb`]: the claimed device interface and the chunked read/write primitives
//! - [`boot`]: probing the boot stage and the first stage handoff
//! - [`server`]: the file-server command loop
//! - [`fs`]: the layered virtual filesystem answering file-server requests
//! - [`manager`]: device discovery, hot-plug and the single active session
//! - [`event`]: typed session notifications
//!

/// Broadcom USB Vendor ID, used by every Raspberry Pi boot ROM
pub const RPIBOOT_VID: u16 = 0x0a5c;

/// Largest single bulk OUT transfer issued by [`usb::ep_write`]
pub const MAX_TRANSFER: usize = 16 * 1024;

/// Size of a file-server command frame (4 byte command + 260 byte path)
pub const COMMAND_FRAME_LEN: usize = 264;
/// Size of the path field of a file-server command frame
pub const COMMAND_PATH_LEN: usize = COMMAND_FRAME_LEN - 4;

/// Size of the header sent ahead of the first stage boot file
pub const BOOT_HEADER_LEN: usize = 24;
/// Size of the response code the boot ROM returns after the first stage
pub const RESPONSE_CODE_LEN: usize = 4;

/// Length of a standard USB device descriptor
pub const DEVICE_DESCRIPTOR_LEN: usize = 18;
/// Offset of `iSerialNumber` within the device descriptor
pub const SERIAL_INDEX_OFFSET: usize = 16;
/// `iSerialNumber` values reported by a boot ROM that still needs its first stage
pub const FIRST_STAGE_SERIAL_INDICES: [u8; 2] = [0, 3];

/// Command and wire format module
pub mod cmd;
pub use cmd::{
    BootHeader, CommandFrame, FileServerCmdId, Result, RpibootError, TransferKind,
};

/// USB Connection Module
pub mod usb;
pub use usb::{
    DeviceId, DeviceInfo, HotplugEvent, RusbBackend, RusbLink, UsbBackend, UsbLink,
};

/// Virtual filesystem module
pub mod fs;
pub use fs::{MapMount, Mount, TarMount, VirtualFs};

/// Model and gadget tables
pub mod config;
pub use config::{Catalog, Gadget, Model};

/// Gadget asset loading
pub mod assets;
pub use assets::{AssetSource, DirAssets};

/// Session events
pub mod event;
pub use event::{DisconnectStatus, EventBus, SessionEvent, Subscription};

/// Boot stage controller
pub mod boot;
pub use boot::{BootStage, BootState};

/// File-server protocol loop
pub mod server;
pub use server::{CancelToken, Served};

/// Connection manager
pub mod manager;
pub use manager::{ActiveGadget, Attached, ConnectionManager, Session};

#[cfg(test)]
mod mock;
