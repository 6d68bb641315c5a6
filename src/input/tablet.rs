//! Tablet tool and tablet pad payloads
//!
//! A pad owns its mode groups, but seat-side protocol objects routinely keep
//! references to groups past the pad's lifetime. Groups are therefore shared
//! and carry an `invalidated` flag that the pad sets when it is torn down.

use log::warn;
use std::cell::Cell;
use std::rc::Rc;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tablet {
    pub width_mm: f64,
    pub height_mm: f64,
    /// Device paths backing this tablet (udev syspaths or device nodes).
    pub paths: Vec<String>,
}

/// A mode group of a tablet pad: the buttons, rings and strips that switch
/// modes together.
#[derive(Debug, Default)]
pub struct TabletPadGroup {
    pub buttons: Vec<u32>,
    pub rings: Vec<u32>,
    pub strips: Vec<u32>,
    pub mode_count: u32,
    invalidated: Cell<bool>,
}

impl TabletPadGroup {
    pub fn new(buttons: Vec<u32>, rings: Vec<u32>, strips: Vec<u32>, mode_count: u32) -> Self {
        Self {
            buttons,
            rings,
            strips,
            mode_count,
            invalidated: Cell::new(false),
        }
    }

    /// Set once the owning pad has been torn down.
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.get()
    }
}

#[derive(Debug, Default)]
pub struct TabletPad {
    pub button_count: u32,
    pub ring_count: u32,
    pub strip_count: u32,
    pub paths: Vec<String>,
    pub groups: Vec<Rc<TabletPadGroup>>,
}

impl TabletPad {
    pub fn add_group(&mut self, group: TabletPadGroup) -> Rc<TabletPadGroup> {
        let group = Rc::new(group);
        self.groups.push(group.clone());
        group
    }

    /// Drop the pad's paths and groups. Groups still referenced elsewhere
    /// survive but are marked invalidated.
    pub(crate) fn release(&mut self, device_name: &str) {
        self.paths.clear();

        let orphaned = self
            .groups
            .iter()
            .filter(|group| Rc::strong_count(group) > 1)
            .count();
        if orphaned > 0 {
            warn!(
                "tablet pad '{}' torn down with {} mode group(s) still referenced",
                device_name, orphaned
            );
        }
        for group in self.groups.drain(..) {
            group.invalidated.set(true);
        }
    }
}
