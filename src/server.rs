use crate::cmd::{CommandFrame, FileServerCmdId, Result};
use crate::fs::VirtualFs;
use crate::usb::{self, UsbLink};
use crate::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Stops the file-server loop before its next iteration
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Outcome of one file-server iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    /// Read the next frame.
    Continue,
    /// The device sent `Done`.
    Done,
}

/// Reads one command frame from the device and answers it.
///
/// Only a failure to read the frame is returned as an error, since there is
/// nothing left to talk to. Malformed frames, unknown files and failures
/// while answering are logged and the device is left to retry.
pub fn serve_one<L: UsbLink>(link: &mut L, fs: &VirtualFs) -> Result<Served> {
    debug!("waiting for command");
    let buf = usb::ep_read(link, COMMAND_FRAME_LEN)?;

    let frame = match CommandFrame::parse(&buf) {
        Ok(frame) => frame,
        Err(e) => {
            error!("{}", e);
            return Ok(Served::Continue);
        }
    };

    let cmd = match frame.cmd() {
        Some(cmd) => cmd,
        None => {
            warn!("unknown command {} for {:?}", frame.code, frame.path);
            return Ok(Served::Continue);
        }
    };
    debug!("{:?} {:?}", cmd, frame.path);

    match cmd {
        FileServerCmdId::GetFileSize => {
            let size = match fs.get_size(&frame.path) {
                Some(size) => size,
                None => {
                    error!("cannot get size of {}: not found", frame.path);
                    return Ok(Served::Continue);
                }
            };
            let size = match u32::try_from(size) {
                Ok(size) => size,
                Err(_) => {
                    error!("{} is too large to serve ({} bytes)", frame.path, size);
                    return Ok(Served::Continue);
                }
            };

            if let Err(e) = usb::report_size(link, size) {
                error!("failed to report size of {}: {}", frame.path, e);
            }
        }
        FileServerCmdId::ReadFile => {
            let file = match fs.get_file(&frame.path) {
                Some(file) => file,
                None => {
                    error!("cannot read {}: not found", frame.path);
                    return Ok(Served::Continue);
                }
            };

            if let Err(e) = usb::ep_write(link, file) {
                error!("failed to send {}: {}", frame.path, e);
            }
        }
        FileServerCmdId::Done => return Ok(Served::Done),
    }

    Ok(Served::Continue)
}
