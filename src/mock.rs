//! In-memory stand-ins for the USB seams.

use crate::cmd::{Result, RpibootError, TransferKind};
use crate::usb::{DeviceId, DeviceInfo, HotplugEvent, UsbBackend, UsbLink};
use crate::{DEVICE_DESCRIPTOR_LEN, SERIAL_INDEX_OFFSET};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    ControlOut { value: u16, index: u16 },
    ControlIn { value: u16, index: u16, len: usize },
    BulkOut(usize),
    GetDescriptor,
}

/// Records every transfer; the log and the read queue are shared so tests
/// can keep inspecting them after a clone has been handed off. `drops`
/// counts dropped clones, which is how a closed device shows up.
#[derive(Debug, Clone)]
pub struct MockLink {
    pub log: Rc<RefCell<Vec<Transfer>>>,
    pub reads: Rc<RefCell<VecDeque<Result<Vec<u8>>>>>,
    pub bulk_data: Rc<RefCell<Vec<u8>>>,
    pub drops: Rc<RefCell<usize>>,
    descriptor: Vec<u8>,
    serial: Option<String>,
    bulk_budget: Option<usize>,
    bulk_cap: Option<usize>,
    control_out_fails: bool,
}
impl MockLink {
    pub fn new() -> Self {
        MockLink {
            log: Rc::default(),
            reads: Rc::default(),
            bulk_data: Rc::default(),
            drops: Rc::default(),
            descriptor: descriptor_with_serial_index(0),
            serial: Some("a1b2c3d4".into()),
            bulk_budget: None,
            bulk_cap: None,
            control_out_fails: false,
        }
    }

    pub fn with_serial_index(mut self, index: u8) -> Self {
        self.descriptor = descriptor_with_serial_index(index);
        self
    }

    pub fn push_read(&self, data: Vec<u8>) {
        self.reads.borrow_mut().push_back(Ok(data));
    }

    pub fn push_read_error(&self, e: rusb::Error) {
        self.reads
            .borrow_mut()
            .push_back(Err(RpibootError::TransferFailure(TransferKind::Control, e)));
    }

    pub fn fail_bulk_after(&mut self, transfers: usize) {
        self.bulk_budget = Some(transfers);
    }

    /// Accept at most `max` bytes per bulk transfer.
    pub fn cap_bulk(&mut self, max: usize) {
        self.bulk_cap = Some(max);
    }

    pub fn fail_control_out(&mut self) {
        self.control_out_fails = true;
    }

    pub fn bulk_count(&self) -> usize {
        self.log
            .borrow()
            .iter()
            .filter(|t| matches!(t, Transfer::BulkOut(_)))
            .count()
    }

    pub fn read_count(&self) -> usize {
        self.log
            .borrow()
            .iter()
            .filter(|t| matches!(t, Transfer::ControlIn { .. }))
            .count()
    }
}
impl Drop for MockLink {
    fn drop(&mut self) {
        *self.drops.borrow_mut() += 1;
    }
}
impl UsbLink for MockLink {
    fn control_out(&mut self, value: u16, index: u16) -> Result<()> {
        self.log
            .borrow_mut()
            .push(Transfer::ControlOut { value, index });
        if self.control_out_fails {
            return Err(RpibootError::TransferFailure(
                TransferKind::Control,
                rusb::Error::Pipe,
            ));
        }
        Ok(())
    }

    fn control_in(&mut self, value: u16, index: u16, buf: &mut [u8]) -> Result<usize> {
        self.log.borrow_mut().push(Transfer::ControlIn {
            value,
            index,
            len: buf.len(),
        });
        match self.reads.borrow_mut().pop_front() {
            Some(Ok(data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            Some(Err(e)) => Err(e),
            None => Err(RpibootError::TransferFailure(
                TransferKind::Control,
                rusb::Error::NoDevice,
            )),
        }
    }

    fn bulk_out(&mut self, data: &[u8]) -> Result<usize> {
        if let Some(budget) = self.bulk_budget.as_mut() {
            if *budget == 0 {
                return Err(RpibootError::TransferFailure(
                    TransferKind::Bulk,
                    rusb::Error::Pipe,
                ));
            }
            *budget -= 1;
        }
        let len = self.bulk_cap.map_or(data.len(), |cap| cap.min(data.len()));
        self.log.borrow_mut().push(Transfer::BulkOut(len));
        self.bulk_data.borrow_mut().extend_from_slice(&data[..len]);
        Ok(len)
    }

    fn device_descriptor(&mut self) -> Result<Vec<u8>> {
        self.log.borrow_mut().push(Transfer::GetDescriptor);
        Ok(self.descriptor.clone())
    }

    fn serial_number(&mut self) -> Option<String> {
        self.serial.clone()
    }
}

fn descriptor_with_serial_index(index: u8) -> Vec<u8> {
    let mut desc = vec![0u8; DEVICE_DESCRIPTOR_LEN];
    desc[0] = DEVICE_DESCRIPTOR_LEN as u8;
    desc[1] = 0x01;
    desc[SERIAL_INDEX_OFFSET] = index;
    desc
}

/// Hands out scripted links in order and replays queued hot-plug events
#[derive(Debug)]
pub struct MockBackend {
    pub devices: Rc<RefCell<Vec<DeviceInfo>>>,
    pub links: Rc<RefCell<VecDeque<MockLink>>>,
    pub events: Rc<RefCell<VecDeque<HotplugEvent>>>,
    pub opened: Rc<RefCell<Vec<DeviceId>>>,
    pub watching: Rc<RefCell<bool>>,
    hotplug: bool,
}
impl MockBackend {
    pub fn new() -> Self {
        MockBackend {
            devices: Rc::default(),
            links: Rc::default(),
            events: Rc::default(),
            opened: Rc::default(),
            watching: Rc::default(),
            hotplug: true,
        }
    }

    /// A backend whose platform never delivers hot-plug notifications.
    pub fn without_hotplug() -> Self {
        MockBackend {
            hotplug: false,
            ..MockBackend::new()
        }
    }

    pub fn handle(&self) -> MockBackend {
        MockBackend {
            devices: self.devices.clone(),
            links: self.links.clone(),
            events: self.events.clone(),
            opened: self.opened.clone(),
            watching: self.watching.clone(),
            hotplug: self.hotplug,
        }
    }

    pub fn plug(&self, info: DeviceInfo, link: MockLink) {
        self.devices.borrow_mut().push(info);
        self.links.borrow_mut().push_back(link);
    }

    pub fn unplug(&self, id: DeviceId) {
        self.devices.borrow_mut().retain(|d| d.id != id);
        self.events.borrow_mut().push_back(HotplugEvent::Left(id));
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        MockBackend::new()
    }
}
impl UsbBackend for MockBackend {
    type Link = MockLink;

    fn devices(&mut self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices.borrow().clone())
    }

    fn open(&mut self, id: DeviceId) -> Result<MockLink> {
        self.opened.borrow_mut().push(id);
        self.links
            .borrow_mut()
            .pop_front()
            .ok_or(RpibootError::UsbDeviceNotFound)
    }

    fn watch(&mut self) -> Result<()> {
        *self.watching.borrow_mut() = self.hotplug;
        Ok(())
    }

    fn unwatch(&mut self) {
        *self.watching.borrow_mut() = false;
    }

    fn is_watching(&self) -> bool {
        *self.watching.borrow()
    }

    fn hotplug_events(&mut self, _timeout: Duration) -> Result<Vec<HotplugEvent>> {
        let events: Vec<HotplugEvent> = self.events.borrow_mut().drain(..).collect();
        if !self.is_watching() {
            return Ok(vec![]);
        }
        Ok(events)
    }
}

pub fn device(address: u8, product_id: u16) -> DeviceInfo {
    DeviceInfo {
        id: DeviceId { bus: 1, address },
        vendor_id: crate::RPIBOOT_VID,
        product_id,
    }
}
