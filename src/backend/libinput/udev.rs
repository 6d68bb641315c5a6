//! udev-backed input source on top of the `input` crate

use super::{DeviceCapabilities, DeviceInfo, InputSource, LibinputBackend, PadGroupLayout, PadLayout, SourceEvent};
use crate::backend::BackendError;
use crate::event_loop::EventLoop;
use crate::session::Session;
use input::event::{DeviceEvent, EventTrait};
use input::{Device, DeviceCapability, Event, Libinput, LibinputInterface};
use log::{debug, warn};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::rc::Rc;

/// Opens device nodes through the compositor's session.
struct SessionInterface {
    session: Rc<dyn Session>,
}

impl LibinputInterface for SessionInterface {
    fn open_restricted(&mut self, path: &Path, _flags: i32) -> Result<OwnedFd, i32> {
        self.session.open_device(path).map_err(|err| {
            warn!("libinput could not open {}: {}", path.display(), err);
            err.raw_os_error().unwrap_or(libc::EIO)
        })
    }

    fn close_restricted(&mut self, fd: OwnedFd) {
        self.session.close_device(fd);
    }
}

pub struct UdevInputSource {
    libinput: Libinput,
    seat: String,
    known: Vec<(u64, Device)>,
    next_id: u64,
}

impl UdevInputSource {
    pub fn new(session: Rc<dyn Session>, seat: &str) -> Self {
        Self {
            libinput: Libinput::new_with_udev(SessionInterface { session }),
            seat: seat.to_string(),
            known: Vec::new(),
            next_id: 1,
        }
    }

    fn describe(&mut self, device: Device) -> DeviceInfo {
        let id = self.next_id;
        self.next_id += 1;

        let mut capabilities = DeviceCapabilities::empty();
        for (cap, flag) in [
            (DeviceCapability::Keyboard, DeviceCapabilities::KEYBOARD),
            (DeviceCapability::Pointer, DeviceCapabilities::POINTER),
            (DeviceCapability::Touch, DeviceCapabilities::TOUCH),
            (DeviceCapability::TabletTool, DeviceCapabilities::TABLET_TOOL),
            (DeviceCapability::TabletPad, DeviceCapabilities::TABLET_PAD),
            (DeviceCapability::Switch, DeviceCapabilities::SWITCH),
        ] {
            if device.has_capability(cap) {
                capabilities |= flag;
            }
        }

        let pad = capabilities
            .contains(DeviceCapabilities::TABLET_PAD)
            .then(|| pad_layout(&device));

        let info = DeviceInfo {
            id,
            name: device.name().to_string(),
            vendor: device.id_vendor(),
            product: device.id_product(),
            size_mm: device.size(),
            syspath: Some(format!("/dev/input/{}", device.sysname())),
            capabilities,
            pad,
        };
        self.known.push((id, device));
        info
    }
}

fn pad_layout(device: &Device) -> PadLayout {
    let buttons = device.tablet_pad_number_of_buttons().max(0) as u32;
    let rings = device.tablet_pad_number_of_rings().max(0) as u32;
    let strips = device.tablet_pad_number_of_strips().max(0) as u32;
    let group_count = device.tablet_pad_number_of_mode_groups().max(0) as u32;

    let groups = (0..group_count)
        .filter_map(|index| device.tablet_pad_mode_group(index))
        .map(|group| PadGroupLayout {
            buttons: (0..buttons).filter(|b| group.has_button(*b)).collect(),
            rings: (0..rings).filter(|r| group.has_ring(*r)).collect(),
            strips: (0..strips).filter(|s| group.has_strip(*s)).collect(),
            mode_count: group.number_of_modes(),
        })
        .collect();

    PadLayout {
        buttons,
        rings,
        strips,
        groups,
    }
}

impl InputSource for UdevInputSource {
    fn open(&mut self) -> Result<(), BackendError> {
        debug!("Assigning libinput to {}", self.seat);
        self.libinput
            .udev_assign_seat(&self.seat)
            .map_err(|()| BackendError::Libinput(format!("failed to assign seat {}", self.seat)))
    }

    fn dispatch(&mut self) -> Result<Vec<SourceEvent>, BackendError> {
        self.libinput
            .dispatch()
            .map_err(|err| BackendError::Libinput(err.to_string()))?;

        let mut events = Vec::new();
        while let Some(event) = self.libinput.next() {
            match event {
                Event::Device(DeviceEvent::Added(added)) => {
                    let info = self.describe(added.device());
                    events.push(SourceEvent::DeviceAdded(info));
                }
                Event::Device(DeviceEvent::Removed(removed)) => {
                    let device = removed.device();
                    if let Some(index) = self.known.iter().position(|(_, known)| *known == device) {
                        let (id, _) = self.known.remove(index);
                        events.push(SourceEvent::DeviceRemoved(id));
                    }
                }
                // Input events are routed above this layer
                _ => {}
            }
        }
        Ok(events)
    }

    fn close(&mut self) {
        self.known.clear();
        self.libinput.suspend();
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.libinput.as_raw_fd())
    }
}

impl LibinputBackend {
    /// Backend over udev discovery on `seat`.
    pub fn with_udev(event_loop: Rc<dyn EventLoop>, session: Rc<dyn Session>, seat: &str) -> Rc<Self> {
        let source = UdevInputSource::new(session.clone(), seat);
        Self::new(event_loop, session, Box::new(source))
    }
}
