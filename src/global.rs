//! Globals and their deferred destruction
//!
//! Removing a global and freeing it in the same dispatch races with clients
//! that saw the global announced and are about to bind it. [`destroy_safe`]
//! splits the teardown: the global stops being advertised immediately, its
//! data pointer is cleared, and the actual free happens on the event loop
//! after [`GLOBAL_DESTROY_DELAY`]. If the loop cannot take another timer the
//! global is freed right away instead of leaking. The pending free is owned by
//! its timer alone: a timer torn down without firing (loop dropped, source
//! removed) still frees the global exactly once.

use crate::event_loop::EventLoop;
use crate::signal::Signal;
use log::{debug, warn};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};
use std::time::Duration;
use thiserror::Error;
use wayland_server::backend::GlobalId;
use wayland_server::DisplayHandle;

/// Grace period between revoking a global and freeing it.
pub const GLOBAL_DESTROY_DELAY: Duration = Duration::from_millis(5000);

/// Numeric name under which a global is advertised.
pub type GlobalName = u32;

/// A resource advertised to clients.
pub trait Global {
    /// Stop advertising; binds attempted from now on fail.
    fn remove(&self);

    /// Drop the compositor-side data pointer.
    fn clear_data(&self);

    /// Free the global.
    fn destroy(self: Box<Self>);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindError {
    #[error("no global named {0}")]
    UnknownGlobal(GlobalName),

    #[error("global {0} has been removed")]
    Removed(GlobalName),

    #[error("global {name} supports version {supported}, client asked for {requested}")]
    VersionTooHigh {
        name: GlobalName,
        requested: u32,
        supported: u32,
    },
}

/// How [`destroy_safe`] disposed of the global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// Freed later, when the grace timer fires.
    Deferred,
    /// No timer could be armed; freed on the spot.
    Immediate,
}

/// Revoke `global` now and free it after [`GLOBAL_DESTROY_DELAY`].
pub fn destroy_safe(global: Box<dyn Global>, event_loop: &dyn EventLoop) -> DestroyOutcome {
    destroy_safe_after(global, event_loop, GLOBAL_DESTROY_DELAY)
}

/// [`destroy_safe`] with an explicit grace period.
pub fn destroy_safe_after(
    global: Box<dyn Global>,
    event_loop: &dyn EventLoop,
    delay: Duration,
) -> DestroyOutcome {
    global.remove();
    global.clear_data();

    // A refused callback is dropped by the loop, which frees the global on the spot.
    let mut pending = PendingDestroy(Some(global));
    match event_loop.add_timer(delay, Box::new(move || pending.free())) {
        Ok(_) => {
            debug!("global teardown deferred by {:?}", delay);
            DestroyOutcome::Deferred
        }
        Err(err) => {
            warn!("failed to arm global destroy timer ({}), destroyed immediately", err);
            DestroyOutcome::Immediate
        }
    }
}

/// A revoked global waiting for its grace timer.
///
/// Freed when the timer fires, or when the timer callback is dropped unfired.
struct PendingDestroy(Option<Box<dyn Global>>);

impl PendingDestroy {
    fn free(&mut self) {
        if let Some(global) = self.0.take() {
            global.destroy();
        }
    }
}

impl Drop for PendingDestroy {
    fn drop(&mut self) {
        self.free();
    }
}

struct GlobalEntry {
    name: GlobalName,
    interface: String,
    version: u32,
    advertised: Cell<bool>,
    data: RefCell<Option<Rc<dyn Any>>>,
}

#[derive(Debug, Default)]
pub struct RegistryEvents {
    /// Fired with the global's name when it is finally freed.
    pub destroyed: Signal<GlobalName>,
}

struct RegistryInner {
    next_name: Cell<GlobalName>,
    entries: RefCell<Vec<Rc<GlobalEntry>>>,
    events: RegistryEvents,
}

/// Advertisement list for compositor-side globals.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct GlobalRegistry {
    inner: Rc<RegistryInner>,
}

/// A global living in a [`GlobalRegistry`].
pub struct RegistryGlobal {
    entry: Rc<GlobalEntry>,
    registry: Weak<RegistryInner>,
}

/// Snapshot of an advertised global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalDescription {
    pub name: GlobalName,
    pub interface: String,
    pub version: u32,
}

impl GlobalRegistry {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RegistryInner {
                next_name: Cell::new(1),
                entries: RefCell::new(Vec::new()),
                events: RegistryEvents::default(),
            }),
        }
    }

    pub fn events(&self) -> &RegistryEvents {
        &self.inner.events
    }

    pub fn create(&self, interface: &str, version: u32, data: Rc<dyn Any>) -> RegistryGlobal {
        let name = self.inner.next_name.get();
        self.inner.next_name.set(name + 1);

        let entry = Rc::new(GlobalEntry {
            name,
            interface: interface.to_string(),
            version,
            advertised: Cell::new(true),
            data: RefCell::new(Some(data)),
        });
        self.inner.entries.borrow_mut().push(entry.clone());
        debug!("global {} created: {} v{}", name, interface, version);

        RegistryGlobal {
            entry,
            registry: Rc::downgrade(&self.inner),
        }
    }

    /// Globals a newly connecting client would be told about.
    pub fn advertised(&self) -> Vec<GlobalDescription> {
        self.inner
            .entries
            .borrow()
            .iter()
            .filter(|entry| entry.advertised.get())
            .map(|entry| GlobalDescription {
                name: entry.name,
                interface: entry.interface.clone(),
                version: entry.version,
            })
            .collect()
    }

    /// Bind to an advertised global, returning its data pointer.
    pub fn bind(&self, name: GlobalName, version: u32) -> Result<Rc<dyn Any>, BindError> {
        let entries = self.inner.entries.borrow();
        let entry = entries
            .iter()
            .find(|entry| entry.name == name)
            .ok_or(BindError::UnknownGlobal(name))?;

        if !entry.advertised.get() {
            return Err(BindError::Removed(name));
        }
        if version > entry.version {
            return Err(BindError::VersionTooHigh {
                name,
                requested: version,
                supported: entry.version,
            });
        }
        let data = entry.data.borrow().clone();
        data.ok_or(BindError::Removed(name))
    }

    /// Number of globals still allocated, advertised or not.
    pub fn len(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the global is still allocated, advertised or not.
    pub fn contains(&self, name: GlobalName) -> bool {
        self.inner
            .entries
            .borrow()
            .iter()
            .any(|entry| entry.name == name)
    }
}

impl Default for GlobalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GlobalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalRegistry")
            .field("globals", &self.inner.entries.borrow().len())
            .finish()
    }
}

impl RegistryGlobal {
    pub fn name(&self) -> GlobalName {
        self.entry.name
    }

    pub fn is_advertised(&self) -> bool {
        self.entry.advertised.get()
    }
}

impl Global for RegistryGlobal {
    fn remove(&self) {
        self.entry.advertised.set(false);
    }

    fn clear_data(&self) {
        self.entry.data.borrow_mut().take();
    }

    fn destroy(self: Box<Self>) {
        let name = self.entry.name;
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        registry
            .entries
            .borrow_mut()
            .retain(|entry| !Rc::ptr_eq(entry, &self.entry));
        debug!("global {} destroyed", name);
        registry.events.destroyed.emit(&name);
    }
}

impl fmt::Debug for RegistryGlobal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryGlobal")
            .field("name", &self.entry.name)
            .field("interface", &self.entry.interface)
            .field("advertised", &self.entry.advertised.get())
            .finish()
    }
}

/// A global created on a `wayland-server` display.
///
/// `D` is the display's state type. Global data belongs to wayland-server's
/// dispatch machinery, so [`Global::clear_data`] has nothing to clear here.
pub struct WaylandGlobal<D> {
    display: DisplayHandle,
    id: GlobalId,
    _state: PhantomData<fn() -> D>,
}

impl<D: 'static> WaylandGlobal<D> {
    pub fn new(display: DisplayHandle, id: GlobalId) -> Self {
        Self {
            display,
            id,
            _state: PhantomData,
        }
    }

    pub fn id(&self) -> &GlobalId {
        &self.id
    }
}

impl<D: 'static> Global for WaylandGlobal<D> {
    fn remove(&self) {
        self.display.disable_global::<D>(self.id.clone());
    }

    fn clear_data(&self) {}

    fn destroy(self: Box<Self>) {
        let this = *self;
        this.display.remove_global::<D>(this.id);
    }
}
