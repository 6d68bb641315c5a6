//! Input devices discovered by backends
//!
//! Every device shares the same record ([`InputDevice`]) and lifecycle; the
//! type-specific state lives in the [`DeviceKind`] payload. Accessors come in
//! two flavours: `try_keyboard()` and friends return `None` on a tag mismatch,
//! while `keyboard()` and friends treat a mismatch as a programming error and
//! panic.
//!
//! Devices are owned by the backend that discovered them. Everything else
//! should hold a `Weak` and listen to `events.destroy`, which fires before
//! the device releases its state.

pub mod keyboard;
pub mod tablet;

use crate::signal::Signal;
use log::debug;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;

pub use keyboard::{KeyState, Keyboard, KeyboardLeds, RepeatInfo, KEYBOARD_KEYS_CAP};
pub use tablet::{Tablet, TabletPad, TabletPadGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputDeviceType {
    Keyboard,
    Pointer,
    Touch,
    TabletTool,
    TabletPad,
    Switch,
}

impl InputDeviceType {
    pub const ALL: [InputDeviceType; 6] = [
        InputDeviceType::Keyboard,
        InputDeviceType::Pointer,
        InputDeviceType::Touch,
        InputDeviceType::TabletTool,
        InputDeviceType::TabletPad,
        InputDeviceType::Switch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InputDeviceType::Keyboard => "keyboard",
            InputDeviceType::Pointer => "pointer",
            InputDeviceType::Touch => "touch",
            InputDeviceType::TabletTool => "tablet-tool",
            InputDeviceType::TabletPad => "tablet-pad",
            InputDeviceType::Switch => "switch",
        }
    }
}

impl fmt::Display for InputDeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pointer {
    /// Output this pointer is mapped to, if any.
    pub output_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Touch {
    pub output_name: Option<String>,
    pub width_mm: f64,
    pub height_mm: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Switch;

/// Type-specific device state.
#[derive(Debug)]
pub enum DeviceKind {
    Keyboard(Keyboard),
    Pointer(Pointer),
    Touch(Touch),
    TabletTool(Tablet),
    TabletPad(TabletPad),
    Switch(Switch),
}

impl DeviceKind {
    /// Empty payload for `ty`.
    pub fn new(ty: InputDeviceType) -> Self {
        match ty {
            InputDeviceType::Keyboard => DeviceKind::Keyboard(Keyboard::default()),
            InputDeviceType::Pointer => DeviceKind::Pointer(Pointer::default()),
            InputDeviceType::Touch => DeviceKind::Touch(Touch::default()),
            InputDeviceType::TabletTool => DeviceKind::TabletTool(Tablet::default()),
            InputDeviceType::TabletPad => DeviceKind::TabletPad(TabletPad::default()),
            InputDeviceType::Switch => DeviceKind::Switch(Switch),
        }
    }

    pub fn device_type(&self) -> InputDeviceType {
        match self {
            DeviceKind::Keyboard(_) => InputDeviceType::Keyboard,
            DeviceKind::Pointer(_) => InputDeviceType::Pointer,
            DeviceKind::Touch(_) => InputDeviceType::Touch,
            DeviceKind::TabletTool(_) => InputDeviceType::TabletTool,
            DeviceKind::TabletPad(_) => InputDeviceType::TabletPad,
            DeviceKind::Switch(_) => InputDeviceType::Switch,
        }
    }

    fn release(&mut self, device_name: &str) {
        match self {
            DeviceKind::Keyboard(keyboard) => keyboard.keys.clear(),
            DeviceKind::TabletTool(tablet) => tablet.paths.clear(),
            DeviceKind::TabletPad(pad) => pad.release(device_name),
            DeviceKind::Pointer(_) | DeviceKind::Touch(_) | DeviceKind::Switch(_) => {}
        }
    }
}

#[derive(Debug, Default)]
pub struct InputDeviceEvents {
    /// Fired once by [`InputDevice::finish`], before any state is released.
    pub destroy: Signal<InputDevice>,
}

pub struct InputDevice {
    name: String,
    vendor: u32,
    product: u32,
    size_mm: Option<(f64, f64)>,
    kind: RefCell<DeviceKind>,
    finished: Cell<bool>,
    pub events: InputDeviceEvents,
}

macro_rules! variant_access {
    ($try_get:ident, $get:ident, $get_mut:ident, $variant:ident, $payload:ty, $label:literal) => {
        pub fn $try_get(&self) -> Option<Ref<'_, $payload>> {
            Ref::filter_map(self.kind.borrow(), |kind| match kind {
                DeviceKind::$variant(payload) => Some(payload),
                _ => None,
            })
            .ok()
        }

        pub fn $get(&self) -> Ref<'_, $payload> {
            match self.$try_get() {
                Some(payload) => payload,
                None => panic!(
                    "input device '{}' is a {}, not a {}",
                    self.name,
                    self.device_type(),
                    $label
                ),
            }
        }

        pub fn $get_mut(&self) -> RefMut<'_, $payload> {
            match RefMut::filter_map(self.kind.borrow_mut(), |kind| match kind {
                DeviceKind::$variant(payload) => Some(payload),
                _ => None,
            }) {
                Ok(payload) => payload,
                Err(kind) => {
                    let actual = kind.device_type();
                    drop(kind);
                    panic!("input device '{}' is a {}, not a {}", self.name, actual, $label)
                }
            }
        }
    };
}

impl InputDevice {
    /// Create a device of type `ty` with an empty payload and unknown
    /// vendor/product ids.
    pub fn init(ty: InputDeviceType, name: impl Into<String>) -> Self {
        Self::with_kind(DeviceKind::new(ty), name)
    }

    pub fn with_kind(kind: DeviceKind, name: impl Into<String>) -> Self {
        let name = name.into();
        debug!("initializing {} device '{}'", kind.device_type(), name);
        Self {
            name,
            vendor: 0,
            product: 0,
            size_mm: None,
            kind: RefCell::new(kind),
            finished: Cell::new(false),
            events: InputDeviceEvents::default(),
        }
    }

    pub fn with_ids(mut self, vendor: u32, product: u32) -> Self {
        self.vendor = vendor;
        self.product = product;
        self
    }

    pub fn with_size_mm(mut self, width: f64, height: f64) -> Self {
        self.size_mm = Some((width, height));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vendor(&self) -> u32 {
        self.vendor
    }

    pub fn product(&self) -> u32 {
        self.product
    }

    pub fn size_mm(&self) -> Option<(f64, f64)> {
        self.size_mm
    }

    pub fn device_type(&self) -> InputDeviceType {
        self.kind.borrow().device_type()
    }

    pub fn kind(&self) -> Ref<'_, DeviceKind> {
        self.kind.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }

    variant_access!(try_keyboard, keyboard, keyboard_mut, Keyboard, Keyboard, "keyboard");
    variant_access!(try_pointer, pointer, pointer_mut, Pointer, Pointer, "pointer");
    variant_access!(try_touch, touch, touch_mut, Touch, Touch, "touch");
    variant_access!(try_tablet, tablet, tablet_mut, TabletTool, Tablet, "tablet-tool");
    variant_access!(try_tablet_pad, tablet_pad, tablet_pad_mut, TabletPad, TabletPad, "tablet-pad");
    variant_access!(try_switch, switch, switch_mut, Switch, Switch, "switch");

    /// Tear the device down: emit `destroy`, then release owned state.
    /// Later calls do nothing. Dropping an unfinished device finishes it.
    pub fn finish(&self) {
        if self.finished.replace(true) {
            return;
        }
        debug!("finishing {} device '{}'", self.device_type(), self.name);

        self.events.destroy.emit(self);
        self.kind.borrow_mut().release(&self.name);
    }
}

impl Drop for InputDevice {
    fn drop(&mut self) {
        self.finish();
    }
}

impl fmt::Debug for InputDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputDevice")
            .field("name", &self.name)
            .field("type", &self.device_type())
            .field("vendor", &self.vendor)
            .field("product", &self.product)
            .field("finished", &self.finished.get())
            .finish()
    }
}
