//! Session and hardware collaborator
//!
//! Seat management (logind, seatd, ...) lives outside this crate. Backends
//! only need to open device nodes through whatever session the compositor
//! runs under, so that is all [`Session`] asks for.

use log::{debug, info};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Access to privileged device nodes for one seat.
pub trait Session {
    fn seat_name(&self) -> String;

    /// Whether the session currently owns the seat (false while VT-switched away).
    fn is_active(&self) -> bool;

    /// Open a device node on behalf of a backend.
    fn open_device(&self, path: &Path) -> io::Result<OwnedFd>;

    /// Hand a device back to the session.
    fn close_device(&self, fd: OwnedFd);
}

/// Session that opens device nodes directly with the process' own
/// permissions. Suitable for running as root or with ACLs on the nodes.
#[derive(Debug, Clone)]
pub struct DirectSession {
    seat: String,
}

impl DirectSession {
    pub fn new(seat: impl Into<String>) -> Self {
        let seat = seat.into();
        info!("Using direct session on {}", seat);
        Self { seat }
    }
}

impl Default for DirectSession {
    fn default() -> Self {
        Self::new("seat0")
    }
}

impl Session for DirectSession {
    fn seat_name(&self) -> String {
        self.seat.clone()
    }

    fn is_active(&self) -> bool {
        true
    }

    fn open_device(&self, path: &Path) -> io::Result<OwnedFd> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NONBLOCK)
            .open(path)?;
        debug!("opened {}", path.display());
        Ok(OwnedFd::from(file))
    }

    fn close_device(&self, fd: OwnedFd) {
        drop(fd);
    }
}

/// True for DRM device nodes (`/dev/dri/card0`, `/dev/dri/renderD128`, ...).
pub fn is_drm_path(path: &Path) -> bool {
    path.strip_prefix("/dev/dri")
        .map(|rest| !rest.as_os_str().is_empty())
        .unwrap_or(false)
}

/// True for wscons input multiplexer nodes used on the BSDs.
pub fn is_wscons_path(path: &Path) -> bool {
    let Some(name) = path.to_str() else {
        return false;
    };
    ["/dev/wskbd", "/dev/wsmouse", "/dev/wsmux"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Borrowed DRM node, used to issue master-lock ioctls on an fd the session
/// handed out.
struct MasterFd<'a>(BorrowedFd<'a>);

impl AsFd for MasterFd<'_> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0
    }
}

impl drm::Device for MasterFd<'_> {}

/// Become DRM master on `fd`.
pub fn set_master(fd: BorrowedFd<'_>) -> io::Result<()> {
    drm::Device::acquire_master_lock(&MasterFd(fd))
}

/// Release DRM master on `fd`.
pub fn drop_master(fd: BorrowedFd<'_>) -> io::Result<()> {
    drm::Device::release_master_lock(&MasterFd(fd))
}
