//! [`DrmDevice`] over a real `/dev/dri/card*` node

use super::{ConnectorInfo, DrmDevice, DrmTopology, PlaneInfo, PlaneType};
use crate::output::Mode;
use crate::session::{self, Session};
use drm::control::{connector, crtc, plane, Device as ControlDevice, ModeTypeFlags, ResourceHandles};
use drm::{ClientCapability, Device};
use log::{debug, warn};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::Path;

// Values of the "type" plane property
const DRM_PLANE_TYPE_OVERLAY: u64 = 0;
const DRM_PLANE_TYPE_PRIMARY: u64 = 1;
const DRM_PLANE_TYPE_CURSOR: u64 = 2;

pub struct DrmCard {
    fd: OwnedFd,
    name: String,
}

impl AsFd for DrmCard {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Device for DrmCard {}
impl ControlDevice for DrmCard {}

impl DrmCard {
    pub fn open(session: &dyn Session, path: &Path) -> io::Result<Self> {
        let fd = session.open_device(path)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let card = Self { fd, name };

        // Without universal planes the kernel hides primary and cursor planes
        if let Err(err) = card.set_client_capability(ClientCapability::UniversalPlanes, true) {
            warn!("{}: universal planes unavailable: {}", card.name, err);
        }
        Ok(card)
    }

    fn connector_info(
        &self,
        resources: &ResourceHandles,
        crtcs: &[crtc::Handle],
        handle: connector::Handle,
    ) -> io::Result<ConnectorInfo> {
        let info = self.get_connector(handle, false)?;

        let mut possible_crtcs = 0u32;
        for encoder in info.encoders() {
            let Ok(encoder) = self.get_encoder(*encoder) else {
                continue;
            };
            for crtc in resources.filter_crtcs(encoder.possible_crtcs()) {
                if let Some(index) = crtcs.iter().position(|c| *c == crtc).filter(|i| *i < 32) {
                    possible_crtcs |= 1 << index;
                }
            }
        }

        Ok(ConnectorInfo {
            id: u32::from(handle),
            name: format!("{}-{}", info.interface().as_str(), info.interface_id()),
            connected: info.state() == connector::State::Connected,
            possible_crtcs,
            modes: info.modes().iter().map(convert_mode).collect(),
            physical_size_mm: info.size().map(|(w, h)| (w as i32, h as i32)),
        })
    }

    fn plane_info(
        &self,
        resources: &ResourceHandles,
        crtcs: &[crtc::Handle],
        handle: plane::Handle,
    ) -> io::Result<PlaneInfo> {
        let info = self.get_plane(handle)?;
        let mut possible_crtcs = 0u32;
        for crtc in resources.filter_crtcs(info.possible_crtcs()) {
            if let Some(index) = crtcs.iter().position(|c| *c == crtc).filter(|i| *i < 32) {
                possible_crtcs |= 1 << index;
            }
        }

        Ok(PlaneInfo {
            id: u32::from(handle),
            plane_type: self.plane_type(handle)?,
            possible_crtcs,
        })
    }

    fn plane_type(&self, handle: plane::Handle) -> io::Result<PlaneType> {
        let props = self.get_properties(handle)?;
        let (ids, values) = props.as_props_and_values();
        for (id, value) in ids.iter().zip(values) {
            let prop = self.get_property(*id)?;
            if prop.name().to_bytes() == b"type" {
                return Ok(match *value {
                    DRM_PLANE_TYPE_PRIMARY => PlaneType::Primary,
                    DRM_PLANE_TYPE_CURSOR => PlaneType::Cursor,
                    DRM_PLANE_TYPE_OVERLAY => PlaneType::Overlay,
                    other => {
                        debug!("{}: plane {:?} has unknown type {}", self.name, handle, other);
                        PlaneType::Overlay
                    }
                });
            }
        }
        Ok(PlaneType::Overlay)
    }
}

/// Refresh rate in mHz, rounded the way the kernel reports vrefresh.
fn convert_mode(mode: &drm::control::Mode) -> Mode {
    let (width, height) = mode.size();
    let (_, _, htotal) = mode.hsync();
    let (_, _, vtotal) = mode.vsync();
    let refresh_mhz = if htotal == 0 || vtotal == 0 {
        mode.vrefresh() as i64 * 1000
    } else {
        let vtotal = vtotal as i64;
        (mode.clock() as i64 * 1_000_000 / htotal as i64 + vtotal / 2) / vtotal
    };

    let converted = Mode::new(width as i32, height as i32, refresh_mhz as i32);
    if mode.mode_type().contains(ModeTypeFlags::PREFERRED) {
        converted.preferred()
    } else {
        converted
    }
}

impl DrmDevice for DrmCard {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn acquire_master(&self) -> io::Result<()> {
        session::set_master(self.fd.as_fd())
    }

    fn release_master(&self) -> io::Result<()> {
        session::drop_master(self.fd.as_fd())
    }

    fn probe(&self) -> io::Result<DrmTopology> {
        let resources = self.resource_handles()?;
        let crtcs: Vec<crtc::Handle> = resources.crtcs().to_vec();

        let mut connectors = Vec::new();
        for handle in resources.connectors() {
            match self.connector_info(&resources, &crtcs, *handle) {
                Ok(info) => connectors.push(info),
                Err(err) => warn!("{}: skipping connector {:?}: {}", self.name, handle, err),
            }
        }

        let mut planes = Vec::new();
        for handle in self.plane_handles()? {
            match self.plane_info(&resources, &crtcs, handle) {
                Ok(info) => planes.push(info),
                Err(err) => warn!("{}: skipping plane {:?}: {}", self.name, handle, err),
            }
        }

        debug!(
            "{}: {} CRTCs, {} connectors, {} planes",
            self.name,
            crtcs.len(),
            connectors.len(),
            planes.len()
        );
        Ok(DrmTopology {
            crtcs: crtcs.into_iter().map(u32::from).collect(),
            connectors,
            planes,
        })
    }
}
