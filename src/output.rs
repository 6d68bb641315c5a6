//! Outputs announced by backends
//!
//! An [`Output`] is the backend-neutral description of a display pipeline end:
//! its identity, mode list and lifecycle signals. Outputs can be advertised to
//! clients through a [`GlobalRegistry`]; destroying the output then revokes
//! the global with the deferred-destroy dance from [`crate::global`].

use crate::event_loop::{EventLoop, TimerHandle};
use crate::global::{destroy_safe_after, Global, GlobalName, GlobalRegistry, GLOBAL_DESTROY_DELAY};
use crate::signal::Signal;
use log::{debug, info, warn};
use serde::Serialize;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Interface name used when advertising outputs.
pub const OUTPUT_INTERFACE: &str = "wl_output";
pub const OUTPUT_VERSION: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Mode {
    pub width: i32,
    pub height: i32,
    /// Refresh rate in mHz, 0 if unknown.
    pub refresh_mhz: i32,
    pub preferred: bool,
}

impl Mode {
    pub fn new(width: i32, height: i32, refresh_mhz: i32) -> Self {
        Self {
            width,
            height,
            refresh_mhz,
            preferred: false,
        }
    }

    pub fn preferred(mut self) -> Self {
        self.preferred = true;
        self
    }

    /// Duration of one refresh cycle; falls back to 60 Hz for unknown rates.
    pub fn frame_interval(&self) -> Duration {
        let refresh = if self.refresh_mhz > 0 { self.refresh_mhz } else { 60_000 };
        Duration::from_nanos(1_000_000_000_000 / refresh as u64)
    }
}

/// Static description an output is created from.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutputInfo {
    pub name: String,
    pub make: String,
    pub model: String,
    pub physical_size_mm: Option<(i32, i32)>,
    pub modes: Vec<Mode>,
}

#[derive(Debug, Default)]
pub struct OutputEvents {
    pub destroy: Signal<Output>,
    /// Fired when the output is ready for a new frame.
    pub frame: Signal<Output>,
}

pub struct Output {
    info: OutputInfo,
    current_mode: Cell<Option<Mode>>,
    enabled: Cell<bool>,
    destroyed: Cell<bool>,
    event_loop: Rc<dyn EventLoop>,
    frame_timer: Cell<Option<TimerHandle>>,
    global: RefCell<Option<(GlobalName, Box<dyn Global>)>>,
    global_destroy_delay: Cell<Duration>,
    pub events: OutputEvents,
}

impl Output {
    /// Create an output. The preferred mode (or the first one) becomes current.
    pub fn new(info: OutputInfo, event_loop: Rc<dyn EventLoop>) -> Rc<Self> {
        let current = info
            .modes
            .iter()
            .find(|mode| mode.preferred)
            .or_else(|| info.modes.first())
            .copied();
        info!("🖥️ New output {} ({} modes)", info.name, info.modes.len());

        Rc::new(Self {
            info,
            current_mode: Cell::new(current),
            enabled: Cell::new(current.is_some()),
            destroyed: Cell::new(false),
            event_loop,
            frame_timer: Cell::new(None),
            global: RefCell::new(None),
            global_destroy_delay: Cell::new(GLOBAL_DESTROY_DELAY),
            events: OutputEvents::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &OutputInfo {
        &self.info
    }

    pub fn modes(&self) -> &[Mode] {
        &self.info.modes
    }

    pub fn current_mode(&self) -> Option<Mode> {
        self.current_mode.get()
    }

    /// Switch to one of the advertised modes. Returns false for unknown modes.
    pub fn set_mode(&self, mode: Mode) -> bool {
        let known = self
            .info
            .modes
            .iter()
            .any(|m| m.width == mode.width && m.height == mode.height && m.refresh_mhz == mode.refresh_mhz);
        if !known {
            warn!("{}: rejecting unknown mode {}x{}", self.info.name, mode.width, mode.height);
            return false;
        }
        self.current_mode.set(Some(mode));
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    pub fn set_global_destroy_delay(&self, delay: Duration) {
        self.global_destroy_delay.set(delay);
    }

    /// Advertise the output in `registry`. The global's data is a
    /// `Weak<Output>`. Calling this twice returns the existing global.
    pub fn create_global(self: &Rc<Self>, registry: &GlobalRegistry) -> GlobalName {
        if let Some((name, _)) = self.global.borrow().as_ref() {
            return *name;
        }

        let data: Rc<dyn Any> = Rc::new(Rc::downgrade(self));
        let global = registry.create(OUTPUT_INTERFACE, OUTPUT_VERSION, data);
        let name = global.name();
        let global: Box<dyn Global> = Box::new(global);
        *self.global.borrow_mut() = Some((name, global));
        debug!("{}: advertised as global {}", self.info.name, name);
        name
    }

    pub fn global_name(&self) -> Option<GlobalName> {
        self.global.borrow().as_ref().map(|(name, _)| *name)
    }

    /// Arm a one-shot frame timer at the current refresh interval; `frame`
    /// fires when it expires. Does nothing while a frame is already pending
    /// or the output is disabled.
    pub fn schedule_frame(self: &Rc<Self>) {
        if self.destroyed.get() || !self.enabled.get() {
            return;
        }
        if self.frame_timer.get().is_some() {
            return;
        }
        let interval = self
            .current_mode
            .get()
            .map(|mode| mode.frame_interval())
            .unwrap_or_else(|| Mode::new(0, 0, 0).frame_interval());

        let weak: Weak<Output> = Rc::downgrade(self);
        let armed = self.event_loop.add_timer(
            interval,
            Box::new(move || {
                if let Some(output) = weak.upgrade() {
                    output.frame_timer.set(None);
                    if !output.destroyed.get() {
                        output.events.frame.emit(&output);
                    }
                }
            }),
        );
        match armed {
            Ok(handle) => self.frame_timer.set(Some(handle)),
            Err(err) => warn!("{}: failed to schedule frame: {}", self.info.name, err),
        }
    }

    /// Emit `destroy` once, cancel any pending frame and revoke the global.
    pub fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        info!("Destroying output {}", self.info.name);

        if let Some(handle) = self.frame_timer.take() {
            self.event_loop.remove_timer(handle);
        }
        self.events.destroy.emit(self);

        let global = self.global.borrow_mut().take();
        if let Some((_, global)) = global {
            destroy_safe_after(global, self.event_loop.as_ref(), self.global_destroy_delay.get());
        }
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("name", &self.info.name)
            .field("current_mode", &self.current_mode.get())
            .field("enabled", &self.enabled.get())
            .field("destroyed", &self.destroyed.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::ManualEventLoop;

    fn info() -> OutputInfo {
        OutputInfo {
            name: "HEADLESS-1".to_string(),
            make: "headless".to_string(),
            model: "headless".to_string(),
            physical_size_mm: None,
            modes: vec![Mode::new(1280, 720, 60_000), Mode::new(1920, 1080, 60_000).preferred()],
        }
    }

    #[test]
    fn test_preferred_mode_becomes_current() {
        let event_loop = Rc::new(ManualEventLoop::new());
        let output = Output::new(info(), event_loop);
        assert_eq!(output.current_mode().map(|m| m.width), Some(1920));
        assert!(output.is_enabled());
        assert!(output.set_mode(Mode::new(1280, 720, 60_000)));
        assert!(!output.set_mode(Mode::new(800, 600, 60_000)));
        assert_eq!(output.current_mode().map(|m| m.width), Some(1280));
    }

    #[test]
    fn test_frame_interval() {
        assert_eq!(Mode::new(1, 1, 60_000).frame_interval(), Duration::from_nanos(16_666_666));
        assert_eq!(Mode::new(1, 1, 0).frame_interval(), Duration::from_nanos(16_666_666));
        assert_eq!(Mode::new(1, 1, 144_000).frame_interval(), Duration::from_nanos(6_944_444));
    }

    #[test]
    fn test_schedule_frame_emits_once_per_request() {
        let event_loop = Rc::new(ManualEventLoop::new());
        let output = Output::new(info(), event_loop.clone());
        let frames = Rc::new(Cell::new(0u32));
        let counter = frames.clone();
        let _listener = output.events.frame.connect(move |_| counter.set(counter.get() + 1));

        output.schedule_frame();
        output.schedule_frame();
        assert_eq!(event_loop.pending_timers(), 1);

        event_loop.advance(Duration::from_millis(17));
        assert_eq!(frames.get(), 1);
        event_loop.advance(Duration::from_millis(100));
        assert_eq!(frames.get(), 1);
    }

    #[test]
    fn test_destroy_cancels_pending_frame() {
        let event_loop = Rc::new(ManualEventLoop::new());
        let output = Output::new(info(), event_loop.clone());
        let destroyed = Rc::new(Cell::new(0u32));
        let counter = destroyed.clone();
        let _listener = output.events.destroy.connect(move |_| counter.set(counter.get() + 1));

        output.schedule_frame();
        output.destroy();
        output.destroy();
        assert_eq!(destroyed.get(), 1);
        assert_eq!(event_loop.pending_timers(), 0);
    }

    #[test]
    fn test_destroy_revokes_global_after_delay() {
        let event_loop = Rc::new(ManualEventLoop::new());
        let registry = GlobalRegistry::new();
        let output = Output::new(info(), event_loop.clone());
        let name = output.create_global(&registry);
        assert_eq!(output.create_global(&registry), name);
        assert!(registry.bind(name, 4).is_ok());

        output.destroy();
        assert!(registry.bind(name, 4).is_err());
        assert!(registry.contains(name));

        event_loop.advance(GLOBAL_DESTROY_DELAY);
        assert!(!registry.contains(name));
    }
}
