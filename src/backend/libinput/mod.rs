//! libinput backend
//!
//! Input devices discovered by libinput. The backend itself only deals with
//! an [`InputSource`]: something that can be opened and that reports device
//! hotplug when dispatched. With the `libinput` feature the source is
//! [`UdevInputSource`], built on the `input` crate; tests and embedders with
//! their own discovery plug in a source of their own.
//!
//! libinput describes one physical device with several capabilities. Each
//! capability becomes its own [`InputDevice`], all sharing name and ids.

#[cfg(feature = "libinput")]
mod udev;

#[cfg(feature = "libinput")]
pub use self::udev::UdevInputSource;

use super::{report_misuse, Backend, BackendBase, BackendError};
use crate::event_loop::EventLoop;
use crate::input::{DeviceKind, InputDevice, InputDeviceType, TabletPadGroup};
use crate::session::Session;
use bitflags::bitflags;
use log::{debug, error, info, warn};
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceCapabilities: u32 {
        const KEYBOARD = 1 << 0;
        const POINTER = 1 << 1;
        const TOUCH = 1 << 2;
        const TABLET_TOOL = 1 << 3;
        const TABLET_PAD = 1 << 4;
        const SWITCH = 1 << 5;
    }
}

impl DeviceCapabilities {
    /// Device types to create, in announcement order.
    pub fn device_types(&self) -> Vec<InputDeviceType> {
        [
            (DeviceCapabilities::KEYBOARD, InputDeviceType::Keyboard),
            (DeviceCapabilities::POINTER, InputDeviceType::Pointer),
            (DeviceCapabilities::TOUCH, InputDeviceType::Touch),
            (DeviceCapabilities::TABLET_TOOL, InputDeviceType::TabletTool),
            (DeviceCapabilities::TABLET_PAD, InputDeviceType::TabletPad),
            (DeviceCapabilities::SWITCH, InputDeviceType::Switch),
        ]
        .into_iter()
        .filter(|(cap, _)| self.contains(*cap))
        .map(|(_, ty)| ty)
        .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PadGroupLayout {
    pub buttons: Vec<u32>,
    pub rings: Vec<u32>,
    pub strips: Vec<u32>,
    pub mode_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PadLayout {
    pub buttons: u32,
    pub rings: u32,
    pub strips: u32,
    pub groups: Vec<PadGroupLayout>,
}

/// What a source knows about a newly discovered device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    /// Source-assigned identifier, used to match the later removal.
    pub id: u64,
    pub name: String,
    pub vendor: u32,
    pub product: u32,
    pub size_mm: Option<(f64, f64)>,
    pub syspath: Option<String>,
    pub capabilities: DeviceCapabilities,
    pub pad: Option<PadLayout>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    DeviceAdded(DeviceInfo),
    DeviceRemoved(u64),
}

/// Device discovery feeding a [`LibinputBackend`].
pub trait InputSource {
    /// Begin discovery. Devices already present show up on the next dispatch.
    fn open(&mut self) -> Result<(), BackendError>;

    /// Drain pending hotplug events.
    fn dispatch(&mut self) -> Result<Vec<SourceEvent>, BackendError>;

    fn close(&mut self) {}

    /// Pollable fd, if the source has one.
    fn fd(&self) -> Option<RawFd> {
        None
    }
}

struct TrackedDevice {
    id: u64,
    devices: Vec<Rc<InputDevice>>,
}

pub struct LibinputBackend {
    base: BackendBase,
    source: RefCell<Box<dyn InputSource>>,
    tracked: RefCell<Vec<TrackedDevice>>,
}

impl LibinputBackend {
    pub fn new(
        event_loop: Rc<dyn EventLoop>,
        session: Rc<dyn Session>,
        source: Box<dyn InputSource>,
    ) -> Rc<Self> {
        debug!("Creating libinput backend on {}", session.seat_name());
        Rc::new(Self {
            base: BackendBase::new(event_loop, Some(session)),
            source: RefCell::new(source),
            tracked: RefCell::new(Vec::new()),
        })
    }

    /// Fd to poll; call [`Self::dispatch`] when it is readable.
    pub fn input_fd(&self) -> Option<RawFd> {
        self.source.borrow().fd()
    }

    /// Process pending hotplug events. Returns how many were handled.
    pub fn dispatch(&self) -> Result<usize, BackendError> {
        if self.base.is_destroyed() {
            report_misuse(&self.name(), "dispatch");
            return Ok(0);
        }
        if !self.base.is_started() {
            return Ok(0);
        }

        let events = self.source.borrow_mut().dispatch()?;
        let handled = events.len();
        for event in events {
            match event {
                SourceEvent::DeviceAdded(info) => self.handle_added(info),
                SourceEvent::DeviceRemoved(id) => self.handle_removed(id),
            }
        }
        Ok(handled)
    }

    /// Number of input devices currently exposed.
    pub fn device_count(&self) -> usize {
        self.tracked.borrow().iter().map(|tracked| tracked.devices.len()).sum()
    }

    fn handle_added(&self, info: DeviceInfo) {
        let types = info.capabilities.device_types();
        if types.is_empty() {
            debug!("Ignoring '{}': no supported capability", info.name);
            return;
        }
        if self.tracked.borrow().iter().any(|tracked| tracked.id == info.id) {
            warn!("Device '{}' ({}) announced twice", info.name, info.id);
            return;
        }
        info!("🎮 Adding input device '{}' ({:04x}:{:04x})", info.name, info.vendor, info.product);

        let devices: Vec<Rc<InputDevice>> = types
            .into_iter()
            .map(|ty| Rc::new(build_device(ty, &info)))
            .collect();
        self.tracked.borrow_mut().push(TrackedDevice {
            id: info.id,
            devices: devices.clone(),
        });
        for device in &devices {
            self.base.events.new_input.emit(device);
        }
    }

    fn handle_removed(&self, id: u64) {
        let removed = {
            let mut tracked = self.tracked.borrow_mut();
            tracked
                .iter()
                .position(|tracked| tracked.id == id)
                .map(|index| tracked.remove(index))
        };
        let Some(removed) = removed else {
            debug!("Removal of unknown device {}", id);
            return;
        };
        for device in &removed.devices {
            info!("Removing input device '{}' ({})", device.name(), device.device_type());
            device.finish();
        }
    }
}

fn build_device(ty: InputDeviceType, info: &DeviceInfo) -> InputDevice {
    let mut kind = DeviceKind::new(ty);
    let paths: Vec<String> = info.syspath.iter().cloned().collect();
    match &mut kind {
        DeviceKind::Touch(touch) => {
            if let Some((width, height)) = info.size_mm {
                touch.width_mm = width;
                touch.height_mm = height;
            }
        }
        DeviceKind::TabletTool(tablet) => {
            if let Some((width, height)) = info.size_mm {
                tablet.width_mm = width;
                tablet.height_mm = height;
            }
            tablet.paths = paths;
        }
        DeviceKind::TabletPad(pad) => {
            if let Some(layout) = &info.pad {
                pad.button_count = layout.buttons;
                pad.ring_count = layout.rings;
                pad.strip_count = layout.strips;
                for group in &layout.groups {
                    pad.add_group(TabletPadGroup::new(
                        group.buttons.clone(),
                        group.rings.clone(),
                        group.strips.clone(),
                        group.mode_count,
                    ));
                }
            }
            pad.paths = paths;
        }
        DeviceKind::Keyboard(_) | DeviceKind::Pointer(_) | DeviceKind::Switch(_) => {}
    }

    let device = InputDevice::with_kind(kind, info.name.clone()).with_ids(info.vendor, info.product);
    match info.size_mm {
        Some((width, height)) => device.with_size_mm(width, height),
        None => device,
    }
}

impl Backend for LibinputBackend {
    fn base(&self) -> &BackendBase {
        &self.base
    }

    fn name(&self) -> String {
        "libinput".to_string()
    }

    fn start(&self) -> bool {
        if let Some(result) = self.base.precheck_start(&self.name()) {
            return result;
        }
        info!("🚀 Starting libinput backend");

        if let Err(err) = self.source.borrow_mut().open() {
            error!("Failed to open input source: {}", err);
            return false;
        }
        self.base.mark_started();

        // Devices present at startup are reported by the first dispatch
        match self.dispatch() {
            Ok(count) => debug!("libinput: {} initial events", count),
            Err(err) => warn!("Initial libinput dispatch failed: {}", err),
        }
        true
    }

    fn destroy(&self) {
        if self.base.is_destroyed() {
            return;
        }
        info!("Destroying libinput backend");

        let tracked = std::mem::take(&mut *self.tracked.borrow_mut());
        for device in tracked.iter().flat_map(|tracked| tracked.devices.iter()) {
            device.finish();
        }
        self.source.borrow_mut().close();
        self.base.finish();
    }
}

impl Drop for LibinputBackend {
    fn drop(&mut self) {
        self.destroy();
    }
}
