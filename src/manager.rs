use crate::assets::AssetSource;
use crate::boot::{self, BootStage, BootState};
use crate::cmd::{Result, RpibootError};
use crate::config::{Catalog, Gadget, Model};
use crate::event::{DisconnectStatus, EventBus, SessionEvent, Subscription};
use crate::fs::{MapMount, TarMount, VirtualFs};
use crate::server::{self, CancelToken, Served};
use crate::usb::{DeviceId, DeviceInfo, HotplugEvent, UsbBackend, UsbLink};

use std::time::Duration;
use tracing::{debug, error, info, warn};

/// An opened device matched against a known model
#[derive(Debug)]
pub struct Attached<L> {
    pub info: DeviceInfo,
    pub serial_number: Option<String>,
    pub model: Model,
    pub link: L,
}

/// The gadget being booted and the files it serves
#[derive(Debug)]
pub struct ActiveGadget {
    pub id: String,
    pub fs: VirtualFs,
}

/// The one device engagement the manager tracks
#[derive(Debug)]
pub enum Session<L> {
    Idle,
    Connected(Attached<L>),
    Active(Attached<L>, ActiveGadget),
    /// The device dropped off the bus mid boot (it does so after the first
    /// stage) and the gadget waits for it to re-enumerate.
    AwaitingReconnect(ActiveGadget),
}
impl<L> Default for Session<L> {
    fn default() -> Self {
        Session::Idle
    }
}
impl<L> Session<L> {
    pub fn attached(&self) -> Option<&Attached<L>> {
        match self {
            Session::Connected(attached) | Session::Active(attached, _) => Some(attached),
            _ => None,
        }
    }

    pub fn gadget(&self) -> Option<&ActiveGadget> {
        match self {
            Session::Active(_, gadget) | Session::AwaitingReconnect(gadget) => Some(gadget),
            _ => None,
        }
    }

    fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

/// Finds devices, owns the session and drives the boot sequence
///
/// Everything runs on the caller's thread. Calls that talk to a device block
/// until it answers; [`ConnectionManager::poll`] has to be called regularly
/// to pick up hot-plug activity.
pub struct ConnectionManager<B: UsbBackend, A: AssetSource> {
    backend: B,
    assets: A,
    catalog: Catalog,

    session: Session<B::Link>,
    state: BootState,
    events: EventBus<SessionEvent>,
    cancel: CancelToken,

    rescan: bool,
    dead: bool,
}
impl<B: UsbBackend, A: AssetSource> ConnectionManager<B, A> {
    /// Creates a manager and starts watching for hot-plug events.
    ///
    /// Devices that are already connected are picked up by [`Self::discover`],
    /// which is left to the caller so listeners can subscribe first.
    pub fn new(mut backend: B, assets: A, catalog: Catalog) -> Self {
        if let Err(e) = backend.watch() {
            warn!("hot-plug unavailable: {}", e);
        }

        ConnectionManager {
            backend,
            assets,
            catalog,
            session: Session::Idle,
            state: BootState::Disconnected,
            events: EventBus::new(),
            cancel: CancelToken::new(),
            rescan: false,
            dead: false,
        }
    }

    fn guard(&self) -> Result<()> {
        if self.dead {
            error!("connection manager used after teardown");
            return Err(RpibootError::UsedAfterTeardown);
        }
        Ok(())
    }

    /// Stops watching for devices and releases the session.
    ///
    /// A gadget that had not finished booting is reported as
    /// `Disconnected(Failure)`. Every later call that can fail does so with
    /// [`RpibootError::UsedAfterTeardown`].
    pub fn deinit(&mut self) {
        if self.dead {
            return;
        }
        info!("tearing down connection manager");
        if self.session.gadget().is_some() {
            warn!("gadget abandoned before the device finished booting");
            self.publish(SessionEvent::Disconnected(DisconnectStatus::Failure));
        }
        self.dead = true;
        self.cancel.cancel();
        self.backend.unwatch();
        self.session = Session::Idle;
        self.state = BootState::Disconnected;
    }

    pub fn subscribe<F>(&mut self, callback: F) -> Result<Subscription>
    where
        F: FnMut(&SessionEvent) + 'static,
    {
        self.guard()?;
        Ok(self.events.subscribe(callback))
    }

    pub fn unsubscribe(&mut self, subscription: Subscription) -> Result<bool> {
        self.guard()?;
        Ok(self.events.unsubscribe(subscription))
    }

    // The getters below never fail. After `deinit` they keep answering with
    // the torn down state: an idle session, `Disconnected`, a cancelled token.

    pub fn session(&self) -> &Session<B::Link> {
        &self.session
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Token that stops the file server between two frames.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn transition(&mut self, to: BootState) {
        if self.state != to {
            debug!("boot state {:?} -> {:?}", self.state, to);
            self.state = to;
        }
    }

    fn publish(&mut self, event: SessionEvent) {
        self.events.publish(&event);
    }

    /// Attaches the first connected device that matches a known model.
    ///
    /// Does nothing while a device is attached.
    pub fn discover(&mut self) -> Result<()> {
        self.guard()?;
        if self.session.attached().is_some() {
            debug!("device already attached, skipping discovery");
            return Ok(());
        }

        for info in self.backend.devices()? {
            if info.vendor_id != self.catalog.vendor_id {
                continue;
            }
            let model = match self.catalog.model(info.product_id) {
                Some(model) => model.clone(),
                None => {
                    warn!("unknown device model {:#06x}", info.product_id);
                    continue;
                }
            };

            match self.attach(info.clone(), model) {
                Ok(()) => {
                    info!("found device {:?}", info.id);
                    break;
                }
                Err(e) => error!("failed to attach {:?}: {}", info.id, e),
            }
        }
        Ok(())
    }

    /// Lets `pick` choose among the connected devices of known models.
    ///
    /// Returns false when `pick` chose nothing.
    pub fn request_device<F>(&mut self, pick: F) -> Result<bool>
    where
        F: FnOnce(&[DeviceInfo]) -> Option<usize>,
    {
        self.guard()?;

        let candidates: Vec<DeviceInfo> = self
            .backend
            .devices()?
            .into_iter()
            .filter(|d| d.vendor_id == self.catalog.vendor_id)
            .filter(|d| self.catalog.model(d.product_id).is_some())
            .collect();

        let info = match pick(&candidates) {
            Some(i) => candidates.get(i).cloned().ok_or(RpibootError::NoDeviceSelected)?,
            None => {
                info!("no device selected");
                return Ok(false);
            }
        };
        let model = self
            .catalog
            .model(info.product_id)
            .cloned()
            .ok_or(RpibootError::NoModelMatched(info.product_id))?;

        if let Some(attached) = self.session.attached() {
            if attached.info.id == info.id {
                return Ok(true);
            }
            debug!("replacing attached device {:?}", attached.info.id);
            self.session = match self.session.take() {
                Session::Active(_, gadget) => Session::AwaitingReconnect(gadget),
                _ => Session::Idle,
            };
        }

        self.attach(info, model)?;
        Ok(true)
    }

    fn attach(&mut self, info: DeviceInfo, model: Model) -> Result<()> {
        let mut link = self.backend.open(info.id)?;
        let serial_number = link.serial_number();
        info!(
            "attached {} ({}) serial {:?}",
            model.name, model.chipset, serial_number
        );

        let attached = Attached {
            info,
            serial_number: serial_number.clone(),
            model: model.clone(),
            link,
        };
        self.transition(BootState::Connected);

        match self.session.take() {
            Session::AwaitingReconnect(gadget) => {
                self.session = Session::Active(attached, gadget);
                self.run_gadget();
            }
            _ => {
                self.session = Session::Connected(attached);
                self.publish(SessionEvent::Connected {
                    model,
                    serial_number,
                });
            }
        }
        Ok(())
    }

    /// Ids of the gadgets the attached model can run.
    pub fn available_gadgets(&self) -> Result<Vec<String>> {
        self.guard()?;
        let attached = self
            .session
            .attached()
            .ok_or(RpibootError::NoDeviceSelected)?;

        Ok(self
            .catalog
            .gadgets_for(&attached.model)
            .into_iter()
            .map(|g| g.id.clone())
            .collect())
    }

    /// Loads the gadget's files and starts booting the attached device.
    ///
    /// A device still in its boot ROM gets the first stage and is expected to
    /// re-enumerate; [`Self::poll`] picks it back up. A device already
    /// running the first stage is served files until it sends `Done`.
    pub fn start_gadget(&mut self, gadget_id: &str) -> Result<()> {
        self.guard()?;
        if self.session.gadget().is_some() {
            return Err(RpibootError::GadgetAlreadyActive);
        }
        let attached = self
            .session
            .attached()
            .ok_or(RpibootError::NoDeviceSelected)?;
        let gadget = self
            .catalog
            .gadget(gadget_id)
            .ok_or_else(|| RpibootError::UnknownGadget(gadget_id.to_string()))?;
        if !attached.model.is_compatible(gadget_id) {
            return Err(RpibootError::GadgetIncompatibleWithModel {
                gadget: gadget_id.to_string(),
                model: attached.model.name.clone(),
            });
        }

        let fs = build_fs(&self.assets, gadget, attached.model.fs_prefix.clone())?;
        info!("starting gadget {}", gadget_id);

        self.session = match self.session.take() {
            Session::Connected(attached) => Session::Active(
                attached,
                ActiveGadget {
                    id: gadget_id.to_string(),
                    fs,
                },
            ),
            other => {
                self.session = other;
                return Err(RpibootError::NoDeviceSelected);
            }
        };

        self.run_gadget();
        Ok(())
    }

    fn run_gadget(&mut self) {
        let stage = match &mut self.session {
            Session::Active(attached, _) => boot::probe(&mut attached.link),
            _ => return,
        };
        let stage = match stage {
            Ok(stage) => stage,
            Err(e) => {
                error!("failed to read device descriptor: {}", e);
                return;
            }
        };
        self.transition(stage.into());

        match stage {
            BootStage::FirstStage => {
                if let Session::Active(attached, gadget) = &mut self.session {
                    if let Err(e) = boot::first_stage_boot(
                        &mut attached.link,
                        &gadget.fs,
                        &attached.model.boot_file_name,
                    ) {
                        error!("first stage boot failed: {}", e);
                    }
                }
            }
            BootStage::FileServer => self.serve_files(),
        }
    }

    fn serve_files(&mut self) {
        info!("serving files");
        self.cancel.reset();

        loop {
            if self.cancel.is_cancelled() {
                info!("file server cancelled");
                break;
            }

            let served = match &mut self.session {
                Session::Active(attached, gadget) => {
                    server::serve_one(&mut attached.link, &gadget.fs)
                }
                _ => break,
            };

            match served {
                Ok(Served::Continue) => {}
                Ok(Served::Done) => {
                    self.finish();
                    break;
                }
                Err(e) => {
                    warn!("file server stopped: {}", e);
                    break;
                }
            }

            // let hot-plug notifications in between frames
            if let Err(e) = self.drain_hotplug(Duration::ZERO) {
                debug!("hot-plug poll failed: {}", e);
            }
        }
    }

    fn finish(&mut self) {
        info!("boot sequence done");
        self.cancel.cancel();
        self.session = Session::Idle;
        self.transition(BootState::Disconnected);
        self.publish(SessionEvent::Disconnected(DisconnectStatus::Success));
    }

    /// Waits up to `timeout` for hot-plug activity and handles it.
    pub fn poll(&mut self, timeout: Duration) -> Result<()> {
        self.guard()?;
        self.drain_hotplug(timeout)?;

        let watching = self.backend.is_watching();
        if !watching {
            self.check_presence()?;
        }

        let awaiting = matches!(self.session, Session::AwaitingReconnect(_));
        let unattached = !watching && self.session.attached().is_none();
        if std::mem::take(&mut self.rescan) || awaiting || unattached {
            self.discover()?;
        }
        Ok(())
    }

    /// Stands in for departure notifications by looking for the attached
    /// device among the enumerated ones.
    fn check_presence(&mut self) -> Result<()> {
        let id = match self.session.attached() {
            Some(attached) => attached.info.id,
            None => return Ok(()),
        };
        if !self.backend.devices()?.iter().any(|d| d.id == id) {
            self.device_left(id);
        }
        Ok(())
    }

    fn drain_hotplug(&mut self, timeout: Duration) -> Result<()> {
        for event in self.backend.hotplug_events(timeout)? {
            match event {
                HotplugEvent::Arrived(id) => {
                    debug!("device arrived {:?}", id);
                    self.rescan = true;
                }
                HotplugEvent::Left(id) => self.device_left(id),
            }
        }
        Ok(())
    }

    fn device_left(&mut self, id: DeviceId) {
        if self.session.attached().map(|a| a.info.id) != Some(id) {
            debug!("untracked device disconnected {:?}", id);
            return;
        }

        info!("device disconnected {:?}", id);
        self.cancel.cancel();
        self.transition(BootState::Disconnected);

        match self.session.take() {
            Session::Active(_, gadget) => {
                self.session = Session::AwaitingReconnect(gadget);
                self.rescan = true;
            }
            _ => self.publish(SessionEvent::Disconnected(DisconnectStatus::Unknown)),
        }
    }
}

fn build_fs<A: AssetSource>(
    assets: &A,
    gadget: &Gadget,
    prefix: Option<String>,
) -> Result<VirtualFs> {
    let archive = TarMount::from_bytes(&assets.fetch(&gadget.bootfiles)?)?;

    let mut named = MapMount::new();
    for (name, location) in &gadget.files {
        named.insert(name.clone(), assets.fetch(location)?);
    }

    let mut fs = VirtualFs::new(prefix);
    fs.add_mount(named);
    fs.add_mount(archive);
    Ok(fs)
}
