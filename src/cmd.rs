use crate::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RpibootError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Bulk,
}
impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Control => write!(f, "control"),
            TransferKind::Bulk => write!(f, "bulk"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RpibootError {
    #[error("no device selected")]
    NoDeviceSelected,
    #[error("no known model for product id {0:#06x}")]
    NoModelMatched(u16),
    #[error("a gadget is already active")]
    GadgetAlreadyActive,
    #[error("gadget {gadget} is not compatible with {model}")]
    GadgetIncompatibleWithModel { gadget: String, model: String },
    #[error("unknown gadget: {0}")]
    UnknownGadget(String),
    #[error("connection manager used after teardown")]
    UsedAfterTeardown,

    #[error("usb device not found")]
    UsbDeviceNotFound,
    #[error("usb failed to open device: {0}")]
    UsbOpenFailure(rusb::Error),
    #[error("usb failed to get config descriptor: {0}")]
    UsbGetConfigDescriptorFailure(rusb::Error),
    #[error("usb device exposes no interfaces")]
    UsbNoInterfaces,
    #[error("usb interface {0} does not expose an IN and an OUT endpoint")]
    UsbMissingEndpoints(u8),
    #[error("usb failed to detach kernel driver: {0}")]
    UsbDetachKernelDriver(rusb::Error),
    #[error("usb failed to claim interface: {0}")]
    UsbClaimInterfaceFailure(rusb::Error),
    #[error("usb {0} transfer failed: {1}")]
    TransferFailure(TransferKind, rusb::Error),
    #[error("usb read returned no data")]
    EmptyTransfer,
    #[error("usb bulk write stalled after {sent} of {len} bytes")]
    StalledWrite { sent: usize, len: usize },
    #[error("usb hotplug registration failed: {0}")]
    UsbHotplugFailure(rusb::Error),

    #[error("malformed device descriptor ({0} bytes)")]
    MalformedDescriptor(usize),
    #[error("malformed command frame: {0}")]
    ProtocolParseFailure(String),
    #[error("boot file {0} not found")]
    BootFileMissing(String),
    #[error("file {path} is too large to serve ({size} bytes)")]
    FileTooLarge { path: String, size: u64 },

    #[error("asset {location} unavailable: {source}")]
    AssetUnavailable {
        location: String,
        source: std::io::Error,
    },
    #[error("failed to read boot file archive: {0}")]
    Archive(std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// File-server command codes sent by the device
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileServerCmdId {
    GetFileSize = 0,
    ReadFile = 1,
    Done = 2,
}
impl TryFrom<i32> for FileServerCmdId {
    type Error = ();

    fn try_from(x: i32) -> std::result::Result<Self, Self::Error> {
        match x {
            x if x == FileServerCmdId::GetFileSize as i32 => Ok(FileServerCmdId::GetFileSize),
            x if x == FileServerCmdId::ReadFile as i32 => Ok(FileServerCmdId::ReadFile),
            x if x == FileServerCmdId::Done as i32 => Ok(FileServerCmdId::Done),
            _ => Err(()),
        }
    }
}

/// A decoded file-server command frame
///
/// The wire layout is a little-endian `i32` command code followed by a NUL
/// terminated ASCII path in a fixed 260 byte field. The command code is kept
/// raw so that unknown codes can be reported by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub code: i32,
    pub path: String,
}
impl CommandFrame {
    /// Decodes a frame as received from the device.
    ///
    /// The boot firmware may send fewer than [`COMMAND_FRAME_LEN`] bytes; any
    /// length works as long as the code is complete and the path field holds
    /// a NUL terminator.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(RpibootError::ProtocolParseFailure(format!(
                "frame is {} bytes, too short for a command code",
                buf.len()
            )));
        }

        let code: i32 = bincode::deserialize(&buf[..4])?;

        let field = &buf[4..buf.len().min(COMMAND_FRAME_LEN)];
        let end = field
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| RpibootError::ProtocolParseFailure("path is not terminated".into()))?;

        let path = &field[..end];
        if !path.is_ascii() {
            return Err(RpibootError::ProtocolParseFailure("path is not ascii".into()));
        }
        let path = String::from_utf8_lossy(path).into_owned();

        Ok(CommandFrame { code, path })
    }

    pub fn cmd(&self) -> Option<FileServerCmdId> {
        FileServerCmdId::try_from(self.code).ok()
    }

    /// Encodes the frame the way the device lays it out, padded to [`COMMAND_FRAME_LEN`].
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; COMMAND_FRAME_LEN];
        buf[..4].copy_from_slice(&self.code.to_le_bytes());
        let path = self.path.as_bytes();
        let len = path.len().min(COMMAND_PATH_LEN - 1);
        buf[4..4 + len].copy_from_slice(&path[..len]);
        buf
    }
}

/// Header sent ahead of the first stage boot file
#[repr(C)]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BootHeader {
    length: u32,
    _reserved: [u8; BOOT_HEADER_LEN - 4],
}
impl BootHeader {
    pub fn new(length: u32) -> Self {
        BootHeader {
            length,
            _reserved: [0; BOOT_HEADER_LEN - 4],
        }
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// Decodes the signed little-endian response code returned after the first stage.
pub fn response_code(buf: &[u8]) -> Result<i32> {
    if buf.len() < RESPONSE_CODE_LEN {
        return Err(RpibootError::ProtocolParseFailure(format!(
            "response code is {} bytes",
            buf.len()
        )));
    }
    Ok(bincode::deserialize(&buf[..RESPONSE_CODE_LEN])?)
}

/// Pulls `iSerialNumber` out of a raw device descriptor.
pub fn serial_index(desc: &[u8]) -> Result<u8> {
    if desc.len() < DEVICE_DESCRIPTOR_LEN {
        return Err(RpibootError::MalformedDescriptor(desc.len()));
    }
    Ok(desc[SERIAL_INDEX_OFFSET])
}
