//! Backend abstraction
//!
//! A backend is a source of input devices and outputs. Every kind (headless,
//! libinput, DRM, and the multi-backend aggregate) implements [`Backend`] and
//! shares the lifecycle kept in [`BackendBase`]:
//!
//! ```text
//!   Created ──start()──► Started
//!      │                    │
//!      └──── destroy() ─────┴──► Destroyed (terminal)
//! ```
//!
//! `start()` returning false leaves the backend in `Created`; it can still be
//! destroyed. `destroy()` emits `events.destroy` exactly once, after the
//! backend has torn down the devices and outputs it owns. Any other call on a
//! destroyed backend is a programming error: it trips a debug assertion and is
//! refused (with an error log) in release builds.
//!
//! Backends use interior mutability and are shared as `Rc<dyn Backend>`; they
//! are bound to the thread running the event loop.

pub mod drm;
pub mod headless;
pub mod libinput;
pub mod multi;

use crate::config::BackendConfig;
use crate::event_loop::EventLoop;
use crate::input::{InputDevice, InputDeviceType};
use crate::output::Output;
use crate::session::Session;
use crate::signal::Signal;
use bitflags::bitflags;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::str::FromStr;
use thiserror::Error;

pub use self::drm::{DrmBackend, DrmCard, DrmDevice};
pub use self::headless::HeadlessBackend;
pub use self::libinput::{InputSource, LibinputBackend};
pub use self::multi::MultiBackend;

/// Environment variable overriding the configured backend list.
pub const BACKENDS_ENV: &str = "AXIOM_BACKENDS";

bitflags! {
    /// Kinds of buffers a backend can scan out or display.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferCaps: u32 {
        const DATA_PTR = 1 << 0;
        const DMABUF = 1 << 1;
        const SHM = 1 << 2;
    }
}

/// Clock presentation timestamps are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockId {
    #[default]
    Monotonic,
    Realtime,
}

impl ClockId {
    pub fn as_raw(&self) -> libc::clockid_t {
        match self {
            ClockId::Monotonic => libc::CLOCK_MONOTONIC,
            ClockId::Realtime => libc::CLOCK_REALTIME,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Headless,
    Libinput,
    Drm,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Headless => "headless",
            BackendKind::Libinput => "libinput",
            BackendKind::Drm => "drm",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "headless" => Ok(BackendKind::Headless),
            "libinput" => Ok(BackendKind::Libinput),
            "drm" => Ok(BackendKind::Drm),
            other => Err(BackendError::UnknownKind(other.to_string())),
        }
    }
}

/// Parse a comma separated backend list such as `"drm,libinput"`.
pub fn parse_backend_list(list: &str) -> Result<Vec<BackendKind>, BackendError> {
    list.split(',')
        .filter(|item| !item.trim().is_empty())
        .map(BackendKind::from_str)
        .collect()
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0} backend support is not compiled in")]
    Unsupported(BackendKind),

    #[error("{0} backend requires a session")]
    SessionRequired(BackendKind),

    #[error("unknown backend kind '{0}'")]
    UnknownKind(String),

    #[error("{} is not a DRM device node", .0.display())]
    NotDrmDevice(PathBuf),

    #[error("no DRM device configured")]
    NoDrmDevices,

    #[error("failed to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("DRM device {device}: {source}")]
    Drm {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("libinput: {0}")]
    Libinput(String),

    #[error("no backend could be created")]
    NoBackends,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Created,
    Started,
    Destroyed,
}

#[derive(Debug, Default)]
pub struct BackendEvents {
    /// Fired once when the backend is destroyed.
    pub destroy: Signal<()>,
    pub new_input: Signal<Rc<InputDevice>>,
    pub new_output: Signal<Rc<Output>>,
}

/// State shared by every backend kind.
pub struct BackendBase {
    pub events: BackendEvents,
    event_loop: Rc<dyn EventLoop>,
    session: Option<Rc<dyn Session>>,
    state: Cell<BackendState>,
    in_multi: Cell<bool>,
}

impl BackendBase {
    pub fn new(event_loop: Rc<dyn EventLoop>, session: Option<Rc<dyn Session>>) -> Self {
        Self {
            events: BackendEvents::default(),
            event_loop,
            session,
            state: Cell::new(BackendState::Created),
            in_multi: Cell::new(false),
        }
    }

    pub fn state(&self) -> BackendState {
        self.state.get()
    }

    pub fn is_started(&self) -> bool {
        self.state.get() == BackendState::Started
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.get() == BackendState::Destroyed
    }

    pub fn event_loop(&self) -> &Rc<dyn EventLoop> {
        &self.event_loop
    }

    pub fn session(&self) -> Option<Rc<dyn Session>> {
        self.session.clone()
    }

    /// Whether the backend is currently a member of a multi-backend.
    pub fn in_multi(&self) -> bool {
        self.in_multi.get()
    }

    pub(crate) fn set_in_multi(&self, member: bool) {
        self.in_multi.set(member);
    }

    /// Shared prologue of `start()`: `Some(result)` when the call must return
    /// right away (already started, or misuse after destroy).
    pub fn precheck_start(&self, name: &str) -> Option<bool> {
        match self.state.get() {
            BackendState::Created => None,
            BackendState::Started => Some(true),
            BackendState::Destroyed => {
                report_misuse(name, "start");
                Some(false)
            }
        }
    }

    pub fn mark_started(&self) {
        if self.state.get() == BackendState::Created {
            self.state.set(BackendState::Started);
        }
    }

    /// Move to `Destroyed` and emit `destroy`. Returns false when the
    /// backend was already destroyed, in which case nothing is emitted.
    pub fn finish(&self) -> bool {
        if self.state.replace(BackendState::Destroyed) == BackendState::Destroyed {
            return false;
        }
        self.events.destroy.emit(&());
        true
    }
}

impl fmt::Debug for BackendBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendBase")
            .field("state", &self.state.get())
            .field("in_multi", &self.in_multi.get())
            .field("has_session", &self.session.is_some())
            .finish()
    }
}

/// Flag an operation on a destroyed backend.
pub(crate) fn report_misuse(name: &str, operation: &str) {
    error!("{}: {} called on a destroyed backend", name, operation);
    debug_assert!(false, "{}: {} called on a destroyed backend", name, operation);
}

/// The contract every backend kind satisfies.
pub trait Backend {
    fn base(&self) -> &BackendBase;

    /// Human readable identifier used in logs.
    fn name(&self) -> String;

    /// Begin device discovery. Idempotent once started.
    fn start(&self) -> bool;

    /// Tear down owned devices and outputs, then emit `destroy`.
    /// Calling it again is a no-op.
    fn destroy(&self);

    fn session(&self) -> Option<Rc<dyn Session>> {
        self.base().session()
    }

    fn presentation_clock(&self) -> ClockId {
        ClockId::Monotonic
    }

    /// DRM fd for renderers and allocators, if this backend drives a GPU.
    fn drm_fd(&self) -> Option<RawFd> {
        None
    }

    fn buffer_caps(&self) -> BufferCaps {
        BufferCaps::empty()
    }

    fn events(&self) -> &BackendEvents {
        &self.base().events
    }

    fn state(&self) -> BackendState {
        self.base().state()
    }
}

/// Identity comparison for shared backends.
pub fn same_backend(a: &Rc<dyn Backend>, b: &Rc<dyn Backend>) -> bool {
    std::ptr::eq(Rc::as_ptr(a).cast::<()>(), Rc::as_ptr(b).cast::<()>())
}

/// Build a multi-backend from the configured (or `AXIOM_BACKENDS`) kinds.
///
/// Every listed kind must come up; the first failure destroys what was built
/// so far and is returned.
pub fn autocreate(
    config: &BackendConfig,
    event_loop: Rc<dyn EventLoop>,
    session: Option<Rc<dyn Session>>,
) -> Result<Rc<MultiBackend>, BackendError> {
    let kinds = match std::env::var(BACKENDS_ENV) {
        Ok(list) if !list.trim().is_empty() => {
            info!("Using backends from {}: {}", BACKENDS_ENV, list);
            parse_backend_list(&list)?
        }
        _ => config.backends.enabled.clone(),
    };

    let multi = MultiBackend::new(event_loop.clone());
    for kind in kinds {
        let created = match create_backends(kind, config, event_loop.clone(), session.clone()) {
            Ok(created) => created,
            Err(err) => {
                error!("Failed to create {} backend: {}", kind, err);
                multi.destroy();
                return Err(err);
            }
        };
        for backend in created {
            if !multi.add(backend) {
                warn!("{} backend was already part of an aggregate", kind);
            }
        }
    }

    if multi.is_empty() {
        multi.destroy();
        return Err(BackendError::NoBackends);
    }
    Ok(multi)
}

fn create_backends(
    kind: BackendKind,
    config: &BackendConfig,
    event_loop: Rc<dyn EventLoop>,
    session: Option<Rc<dyn Session>>,
) -> Result<Vec<Rc<dyn Backend>>, BackendError> {
    match kind {
        BackendKind::Headless => {
            let headless = HeadlessBackend::new(event_loop);
            for _ in 0..config.headless.outputs {
                headless.add_output_with_refresh(
                    config.headless.width,
                    config.headless.height,
                    config.headless.refresh_mhz,
                );
            }
            for ty in &config.headless.input_devices {
                headless.add_input_device(*ty);
            }
            Ok(vec![headless as Rc<dyn Backend>])
        }
        BackendKind::Drm => {
            let session = session.ok_or(BackendError::SessionRequired(kind))?;
            if config.drm.devices.is_empty() {
                return Err(BackendError::NoDrmDevices);
            }
            let mut backends: Vec<Rc<dyn Backend>> = Vec::new();
            for path in &config.drm.devices {
                match DrmBackend::open(event_loop.clone(), session.clone(), path) {
                    Ok(drm) => backends.push(drm),
                    Err(err) => {
                        for backend in &backends {
                            backend.destroy();
                        }
                        return Err(err);
                    }
                }
            }
            Ok(backends)
        }
        BackendKind::Libinput => {
            let session = session.ok_or(BackendError::SessionRequired(kind))?;
            create_libinput(event_loop, session, &config.libinput.seat)
        }
    }
}

#[cfg(feature = "libinput")]
fn create_libinput(
    event_loop: Rc<dyn EventLoop>,
    session: Rc<dyn Session>,
    seat: &str,
) -> Result<Vec<Rc<dyn Backend>>, BackendError> {
    let backend = LibinputBackend::with_udev(event_loop, session, seat);
    Ok(vec![backend as Rc<dyn Backend>])
}

#[cfg(not(feature = "libinput"))]
fn create_libinput(
    _event_loop: Rc<dyn EventLoop>,
    _session: Rc<dyn Session>,
    _seat: &str,
) -> Result<Vec<Rc<dyn Backend>>, BackendError> {
    Err(BackendError::Unsupported(BackendKind::Libinput))
}

/// Count of devices per type, used by the probe summary.
pub fn count_by_type(devices: &[Rc<InputDevice>]) -> Vec<(InputDeviceType, usize)> {
    InputDeviceType::ALL
        .iter()
        .map(|ty| (*ty, devices.iter().filter(|d| d.device_type() == *ty).count()))
        .filter(|(_, count)| *count > 0)
        .collect()
}
