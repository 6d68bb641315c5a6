//! Headless backend
//!
//! Outputs and input devices that exist only in memory. Used for testing and
//! for running a compositor without any display hardware. Frames are paced by
//! event-loop timers through [`Output::schedule_frame`].

use super::{report_misuse, Backend, BackendBase, BufferCaps};
use crate::event_loop::EventLoop;
use crate::input::{InputDevice, InputDeviceType};
use crate::output::{Mode, Output, OutputInfo};
use log::{debug, info};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

const DEFAULT_REFRESH_MHZ: i32 = 60_000;

pub struct HeadlessBackend {
    base: BackendBase,
    outputs: RefCell<Vec<Rc<Output>>>,
    inputs: RefCell<Vec<Rc<InputDevice>>>,
    output_counter: Cell<u32>,
    input_counter: Cell<u32>,
}

impl HeadlessBackend {
    pub fn new(event_loop: Rc<dyn EventLoop>) -> Rc<Self> {
        debug!("Creating headless backend");
        Rc::new(Self {
            base: BackendBase::new(event_loop, None),
            outputs: RefCell::new(Vec::new()),
            inputs: RefCell::new(Vec::new()),
            output_counter: Cell::new(0),
            input_counter: Cell::new(0),
        })
    }

    /// Add a 60 Hz output of the given size.
    pub fn add_output(&self, width: u32, height: u32) -> Option<Rc<Output>> {
        self.add_output_with_refresh(width, height, DEFAULT_REFRESH_MHZ)
    }

    /// Add an output with a single preferred mode. It is announced right away
    /// when the backend is running, otherwise on `start()`.
    pub fn add_output_with_refresh(&self, width: u32, height: u32, refresh_mhz: i32) -> Option<Rc<Output>> {
        if self.base.is_destroyed() {
            report_misuse(&self.name(), "add_output");
            return None;
        }

        let index = self.output_counter.get() + 1;
        self.output_counter.set(index);
        let info = OutputInfo {
            name: format!("HEADLESS-{}", index),
            make: "headless".to_string(),
            model: "headless".to_string(),
            physical_size_mm: None,
            modes: vec![Mode::new(width as i32, height as i32, refresh_mhz).preferred()],
        };
        let output = Output::new(info, self.base.event_loop().clone());
        self.outputs.borrow_mut().push(output.clone());

        if self.base.is_started() {
            self.base.events.new_output.emit(&output);
        }
        Some(output)
    }

    /// Add a virtual input device, announced like [`Self::add_output`].
    pub fn add_input_device(&self, ty: InputDeviceType) -> Option<Rc<InputDevice>> {
        if self.base.is_destroyed() {
            report_misuse(&self.name(), "add_input_device");
            return None;
        }

        let index = self.input_counter.get() + 1;
        self.input_counter.set(index);
        let device = Rc::new(InputDevice::init(ty, format!("headless-{}-{}", ty, index)));
        self.inputs.borrow_mut().push(device.clone());

        if self.base.is_started() {
            self.base.events.new_input.emit(&device);
        }
        Some(device)
    }

    pub fn outputs(&self) -> Vec<Rc<Output>> {
        self.outputs.borrow().clone()
    }

    pub fn input_devices(&self) -> Vec<Rc<InputDevice>> {
        self.inputs.borrow().clone()
    }
}

impl Backend for HeadlessBackend {
    fn base(&self) -> &BackendBase {
        &self.base
    }

    fn name(&self) -> String {
        "headless".to_string()
    }

    fn start(&self) -> bool {
        if let Some(result) = self.base.precheck_start(&self.name()) {
            return result;
        }
        info!("🚀 Starting headless backend");
        self.base.mark_started();

        // Snapshot first, listeners may add more devices
        let outputs = self.outputs();
        for output in outputs.iter().filter(|output| !output.is_destroyed()) {
            self.base.events.new_output.emit(output);
        }
        let inputs = self.input_devices();
        for device in inputs.iter().filter(|device| !device.is_finished()) {
            self.base.events.new_input.emit(device);
        }
        true
    }

    fn destroy(&self) {
        if self.base.is_destroyed() {
            return;
        }
        info!("Destroying headless backend");

        let inputs = std::mem::take(&mut *self.inputs.borrow_mut());
        for device in &inputs {
            device.finish();
        }
        let outputs = std::mem::take(&mut *self.outputs.borrow_mut());
        for output in &outputs {
            output.destroy();
        }
        self.base.finish();
    }

    fn buffer_caps(&self) -> BufferCaps {
        BufferCaps::DATA_PTR | BufferCaps::DMABUF | BufferCaps::SHM
    }
}

impl Drop for HeadlessBackend {
    fn drop(&mut self) {
        self.destroy();
    }
}
