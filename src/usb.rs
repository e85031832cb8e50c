use crate::cmd::{Result, RpibootError, TransferKind};
use crate::*;

use rusb::{
    Device, DeviceHandle, Direction, Hotplug, HotplugBuilder, Recipient, Registration,
    RequestType, UsbContext,
};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;
use tracing::{debug, error, info, warn};

// libusb treats a zero timeout as "wait forever"
const TRANSFER_TIMEOUT: Duration = Duration::ZERO;

const GET_DESCRIPTOR: u8 = 0x06;
const DESCRIPTOR_TYPE_DEVICE: u16 = 0x0100;

/// Position of a device on the bus, stable for as long as it stays enumerated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub bus: u8,
    pub address: u8,
}

/// What is known about a device before it is opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub vendor_id: u16,
    pub product_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    Arrived(DeviceId),
    Left(DeviceId),
}

/// The claimed vendor interface of an open device
///
/// Every vendor request issued here is `request 0` addressed to the device,
/// with a length or size split across `value` (low 16 bits) and `index`
/// (high bits).
pub trait UsbLink {
    /// Vendor control transfer OUT without a data stage.
    fn control_out(&mut self, value: u16, index: u16) -> Result<()>;
    /// Vendor control transfer IN, returns the number of bytes received.
    fn control_in(&mut self, value: u16, index: u16, buf: &mut [u8]) -> Result<usize>;
    /// Single bulk OUT transfer on the interface's OUT endpoint.
    fn bulk_out(&mut self, data: &[u8]) -> Result<usize>;
    /// Raw standard device descriptor, read from the device rather than a cache.
    fn device_descriptor(&mut self) -> Result<Vec<u8>>;
    fn serial_number(&mut self) -> Option<String>;
}

/// Source of devices: enumeration, opening and hot-plug notifications
pub trait UsbBackend {
    type Link: UsbLink;

    fn devices(&mut self) -> Result<Vec<DeviceInfo>>;
    /// Opens the device and claims its vendor interface.
    fn open(&mut self, id: DeviceId) -> Result<Self::Link>;
    fn watch(&mut self) -> Result<()>;
    fn unwatch(&mut self);
    /// Whether hot-plug notifications are being delivered. Without them
    /// departures have to be noticed by enumerating.
    fn is_watching(&self) -> bool;
    /// Waits up to `timeout` for hot-plug activity and drains what arrived.
    fn hotplug_events(&mut self, timeout: Duration) -> Result<Vec<HotplugEvent>>;
}

fn split_len(len: u32) -> (u16, u16) {
    ((len & 0xffff) as u16, (len >> 16) as u16)
}

/// Writes `buf` to the device.
///
/// The total length is announced with a vendor control transfer, then the
/// bytes follow as bulk transfers of at most [`MAX_TRANSFER`] bytes each. A
/// short bulk transfer is continued with the rest of its chunk.
pub fn ep_write<L: UsbLink>(link: &mut L, buf: &[u8]) -> Result<usize> {
    let len = u32::try_from(buf.len()).map_err(|_| RpibootError::FileTooLarge {
        path: "<write buffer>".into(),
        size: buf.len() as u64,
    })?;
    let (value, index) = split_len(len);

    link.control_out(value, index).map_err(|e| {
        error!("failed to announce write of {} bytes: {}", len, e);
        e
    })?;

    let mut sent = 0;
    for chunk in buf.chunks(MAX_TRANSFER) {
        let mut rest = chunk;
        while !rest.is_empty() {
            let n = link.bulk_out(rest).map_err(|e| {
                error!("bulk transfer failed after {} of {} bytes: {}", sent, len, e);
                e
            })?;
            if n == 0 {
                error!("bulk transfer stalled after {} of {} bytes", sent, len);
                return Err(RpibootError::StalledWrite { sent, len: buf.len() });
            }
            let n = n.min(rest.len());
            rest = &rest[n..];
            sent += n;
        }
    }

    debug!("bulk transfer sent {} bytes", sent);
    Ok(sent)
}

/// Reads `len` bytes from the device through a vendor control transfer.
pub fn ep_read<L: UsbLink>(link: &mut L, len: usize) -> Result<Vec<u8>> {
    let (value, index) = split_len(len as u32);
    let mut buf = vec![0u8; len];

    let read = link.control_in(value, index, &mut buf).map_err(|e| {
        error!("failed control transfer: {}", e);
        e
    })?;
    if read == 0 {
        error!("failed control transfer: no data returned");
        return Err(RpibootError::EmptyTransfer);
    }

    buf.truncate(read);
    Ok(buf)
}

/// Reports a file size back to the device, encoded like a write announcement.
pub fn report_size<L: UsbLink>(link: &mut L, size: u32) -> Result<()> {
    let (value, index) = split_len(size);
    link.control_out(value, index)
}

/// One interface of the active configuration: its number and the endpoints
/// of its first alternate setting, in descriptor order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceLayout {
    pub number: u8,
    pub endpoints: Vec<(Direction, u8)>,
}

/// The interface and endpoint addresses the boot protocol runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub iface: u8,
    pub in_addr: u8,
    pub out_addr: u8,
}

/// Picks the interface the boot ROM talks on.
///
/// Devices with a single interface use it. The BCM2837 can come up with a
/// mass storage interface first, so with more than one interface the second
/// one is used. Its first two endpoints are sorted into IN and OUT by
/// direction.
pub fn select_endpoints(interfaces: &[InterfaceLayout]) -> Result<Endpoints> {
    let interface = match interfaces.len() {
        0 => return Err(RpibootError::UsbNoInterfaces),
        1 => &interfaces[0],
        _ => &interfaces[1],
    };

    let mut in_addr = None;
    let mut out_addr = None;
    for &(direction, address) in interface.endpoints.iter().take(2) {
        match direction {
            Direction::In => in_addr = Some(address),
            Direction::Out => out_addr = Some(address),
        }
    }

    match (in_addr, out_addr) {
        (Some(in_addr), Some(out_addr)) => Ok(Endpoints {
            iface: interface.number,
            in_addr,
            out_addr,
        }),
        _ => Err(RpibootError::UsbMissingEndpoints(interface.number)),
    }
}

/// A claimed vendor interface on a libusb device
#[derive(Debug)]
pub struct RusbLink<T: UsbContext> {
    device: Device<T>,
    handle: DeviceHandle<T>,
    endpoints: Endpoints,
    has_kernel_driver: bool,
}
impl<T: UsbContext> Drop for RusbLink<T> {
    fn drop(&mut self) {
        let iface = self.endpoints.iface;
        if let Err(e) = self.handle.release_interface(iface) {
            debug!("could not release interface {}: {}", iface, e);
        }

        if self.has_kernel_driver {
            if let Err(e) = self.handle.attach_kernel_driver(iface) {
                warn!("could not reattach kernel driver: {}", e);
            }
        }
    }
}
impl<T: UsbContext> RusbLink<T> {
    /// Opens `device` and claims the interface picked by [`select_endpoints`].
    pub fn new(device: Device<T>) -> Result<Self> {
        let config = device
            .active_config_descriptor()
            .map_err(RpibootError::UsbGetConfigDescriptorFailure)?;

        let layouts: Vec<InterfaceLayout> = config
            .interfaces()
            .map(|interface| InterfaceLayout {
                number: interface.number(),
                endpoints: interface
                    .descriptors()
                    .next()
                    .map(|setting| {
                        setting
                            .endpoint_descriptors()
                            .map(|ep| (ep.direction(), ep.address()))
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect();
        let endpoints = select_endpoints(&layouts)?;
        let iface = endpoints.iface;
        debug!(
            "using interface {} (in {:#04x}, out {:#04x})",
            iface, endpoints.in_addr, endpoints.out_addr
        );

        let mut handle = device.open().map_err(RpibootError::UsbOpenFailure)?;

        let has_kernel_driver = match handle.kernel_driver_active(iface) {
            Ok(true) => {
                handle
                    .detach_kernel_driver(iface)
                    .map_err(RpibootError::UsbDetachKernelDriver)?;
                true
            }
            _ => false,
        };

        handle
            .claim_interface(iface)
            .map_err(RpibootError::UsbClaimInterfaceFailure)?;

        Ok(RusbLink {
            device,
            handle,
            endpoints,
            has_kernel_driver,
        })
    }
}
impl<T: UsbContext> UsbLink for RusbLink<T> {
    fn control_out(&mut self, value: u16, index: u16) -> Result<()> {
        let request_type =
            rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        self.handle
            .write_control(request_type, 0, value, index, &[], TRANSFER_TIMEOUT)
            .map_err(|e| RpibootError::TransferFailure(TransferKind::Control, e))?;
        Ok(())
    }

    fn control_in(&mut self, value: u16, index: u16, buf: &mut [u8]) -> Result<usize> {
        let request_type =
            rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        self.handle
            .read_control(request_type, 0, value, index, buf, TRANSFER_TIMEOUT)
            .map_err(|e| RpibootError::TransferFailure(TransferKind::Control, e))
    }

    fn bulk_out(&mut self, data: &[u8]) -> Result<usize> {
        self.handle
            .write_bulk(self.endpoints.out_addr, data, TRANSFER_TIMEOUT)
            .map_err(|e| RpibootError::TransferFailure(TransferKind::Bulk, e))
    }

    fn device_descriptor(&mut self) -> Result<Vec<u8>> {
        let request_type =
            rusb::request_type(Direction::In, RequestType::Standard, Recipient::Device);
        let mut buf = vec![0u8; 255];
        let len = self
            .handle
            .read_control(
                request_type,
                GET_DESCRIPTOR,
                DESCRIPTOR_TYPE_DEVICE,
                0,
                &mut buf,
                TRANSFER_TIMEOUT,
            )
            .map_err(|e| RpibootError::TransferFailure(TransferKind::Control, e))?;
        buf.truncate(len);
        Ok(buf)
    }

    fn serial_number(&mut self) -> Option<String> {
        let desc = self.device.device_descriptor().ok()?;
        self.handle.read_serial_number_string_ascii(&desc).ok()
    }
}

struct HotplugForwarder {
    tx: Sender<HotplugEvent>,
}
impl HotplugForwarder {
    fn id<T: UsbContext>(device: &Device<T>) -> DeviceId {
        DeviceId {
            bus: device.bus_number(),
            address: device.address(),
        }
    }
}
impl<T: UsbContext> Hotplug<T> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<T>) {
        let _ = self.tx.send(HotplugEvent::Arrived(Self::id(&device)));
    }

    fn device_left(&mut self, device: Device<T>) {
        let _ = self.tx.send(HotplugEvent::Left(Self::id(&device)));
    }
}

/// Devices reachable through libusb under one vendor id
pub struct RusbBackend<T: UsbContext> {
    context: T,
    vendor_id: u16,
    registration: Option<Registration<T>>,
    events: Option<Receiver<HotplugEvent>>,
}
impl<T: UsbContext + 'static> RusbBackend<T> {
    pub fn new(context: T, vendor_id: u16) -> Self {
        RusbBackend {
            context,
            vendor_id,
            registration: None,
            events: None,
        }
    }

    pub fn supports_hotplug() -> bool {
        rusb::has_hotplug()
    }

    fn find_device(&self, id: DeviceId) -> Result<Device<T>> {
        let devices = self.context.devices().map_err(RpibootError::UsbOpenFailure)?;
        devices
            .iter()
            .find(|d| d.bus_number() == id.bus && d.address() == id.address)
            .ok_or(RpibootError::UsbDeviceNotFound)
    }
}
impl<T: UsbContext + 'static> UsbBackend for RusbBackend<T> {
    type Link = RusbLink<T>;

    fn devices(&mut self) -> Result<Vec<DeviceInfo>> {
        let devices = self.context.devices().map_err(RpibootError::UsbOpenFailure)?;

        let mut found = vec![];
        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if desc.vendor_id() != self.vendor_id {
                continue;
            }
            found.push(DeviceInfo {
                id: DeviceId {
                    bus: device.bus_number(),
                    address: device.address(),
                },
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
            });
        }
        Ok(found)
    }

    fn open(&mut self, id: DeviceId) -> Result<Self::Link> {
        RusbLink::new(self.find_device(id)?)
    }

    fn watch(&mut self) -> Result<()> {
        if self.registration.is_some() {
            return Ok(());
        }
        if !rusb::has_hotplug() {
            warn!("libusb has no hotplug support, falling back to enumerating on every poll");
            return Ok(());
        }

        let (tx, rx) = mpsc::channel();
        let callback: Box<dyn Hotplug<T>> = Box::new(HotplugForwarder { tx });
        let mut builder = HotplugBuilder::new();
        builder.vendor_id(self.vendor_id).enumerate(false);
        let registration = builder
            .register(&self.context, callback)
            .map_err(RpibootError::UsbHotplugFailure)?;

        info!("watching for devices with vendor id {:#06x}", self.vendor_id);
        self.registration = Some(registration);
        self.events = Some(rx);
        Ok(())
    }

    fn unwatch(&mut self) {
        self.registration = None;
        self.events = None;
    }

    fn is_watching(&self) -> bool {
        self.registration.is_some()
    }

    fn hotplug_events(&mut self, timeout: Duration) -> Result<Vec<HotplugEvent>> {
        let events = match &self.events {
            Some(rx) => rx,
            None => {
                std::thread::sleep(timeout);
                return Ok(vec![]);
            }
        };

        self.context
            .handle_events(Some(timeout))
            .map_err(RpibootError::UsbHotplugFailure)?;
        Ok(events.try_iter().collect())
    }
}
