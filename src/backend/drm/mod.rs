//! DRM/KMS backend
//!
//! Drives one GPU. The backend never talks to the kernel directly; it works
//! on a [`DrmTopology`] snapshot provided by a [`DrmDevice`] and decides which
//! CRTC drives which connector and which planes each CRTC gets. Both
//! decisions go through [`matcher::match_obj`], seeded with the previous
//! assignment so that hotplug keeps working outputs on their pipeline.
//!
//! Every connected connector with a CRTC gets an [`Output`]. Connectors that
//! lose their CRTC, disappear or get unplugged have their output destroyed.

mod card;
pub mod matcher;

pub use card::DrmCard;

use self::matcher::{match_obj, MAX_RESOURCES, SKIP, UNMATCHED};
use super::{report_misuse, Backend, BackendBase, BackendError, BufferCaps};
use crate::event_loop::EventLoop;
use crate::output::{Mode, Output, OutputInfo};
use crate::session::{is_drm_path, Session};
use log::{debug, error, info, warn};
use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::path::Path;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneType {
    Primary,
    Cursor,
    Overlay,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorInfo {
    pub id: u32,
    /// e.g. `DP-1`, `HDMI-A-2`
    pub name: String,
    pub connected: bool,
    /// Bit `i` set when `DrmTopology::crtcs[i]` can drive this connector.
    pub possible_crtcs: u32,
    pub modes: Vec<Mode>,
    pub physical_size_mm: Option<(i32, i32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneInfo {
    pub id: u32,
    pub plane_type: PlaneType,
    /// Same indexing as [`ConnectorInfo::possible_crtcs`].
    pub possible_crtcs: u32,
}

/// KMS objects of a device at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrmTopology {
    pub crtcs: Vec<u32>,
    pub connectors: Vec<ConnectorInfo>,
    pub planes: Vec<PlaneInfo>,
}

/// Kernel side of a DRM device.
pub trait DrmDevice {
    /// Short device name, e.g. `card0`.
    fn name(&self) -> String;

    fn raw_fd(&self) -> RawFd;

    fn acquire_master(&self) -> io::Result<()>;

    fn release_master(&self) -> io::Result<()>;

    fn probe(&self) -> io::Result<DrmTopology>;
}

/// Current binding of one CRTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtcBinding {
    pub crtc: u32,
    pub connector: Option<u32>,
    pub primary_plane: Option<u32>,
    pub cursor_plane: Option<u32>,
}

struct ConnectorState {
    info: ConnectorInfo,
    /// Index into `crtcs`.
    crtc: Option<usize>,
    output: Option<Rc<Output>>,
}

#[derive(Default)]
struct KmsState {
    topology: DrmTopology,
    connectors: Vec<ConnectorState>,
    /// Per CRTC index: connector id bound to it.
    crtc_connector: Vec<Option<u32>>,
    primary: Vec<Option<u32>>,
    cursor: Vec<Option<u32>>,
}

pub struct DrmBackend {
    base: BackendBase,
    device: Box<dyn DrmDevice>,
    state: RefCell<KmsState>,
}

impl DrmBackend {
    pub fn new(
        event_loop: Rc<dyn EventLoop>,
        session: Option<Rc<dyn Session>>,
        device: Box<dyn DrmDevice>,
    ) -> Rc<Self> {
        debug!("Creating DRM backend for {}", device.name());
        Rc::new(Self {
            base: BackendBase::new(event_loop, session),
            device,
            state: RefCell::new(KmsState::default()),
        })
    }

    /// Open the DRM node at `path` through `session`.
    pub fn open(
        event_loop: Rc<dyn EventLoop>,
        session: Rc<dyn Session>,
        path: &Path,
    ) -> Result<Rc<Self>, BackendError> {
        if !is_drm_path(path) {
            return Err(BackendError::NotDrmDevice(path.to_path_buf()));
        }
        let card = DrmCard::open(session.as_ref(), path).map_err(|source| BackendError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        info!("📺 Opened DRM device {}", path.display());
        Ok(Self::new(event_loop, Some(session), Box::new(card)))
    }

    pub fn outputs(&self) -> Vec<Rc<Output>> {
        self.state
            .borrow()
            .connectors
            .iter()
            .filter_map(|connector| connector.output.clone())
            .collect()
    }

    pub fn crtc_bindings(&self) -> Vec<CrtcBinding> {
        let state = self.state.borrow();
        state
            .topology
            .crtcs
            .iter()
            .enumerate()
            .map(|(index, crtc)| CrtcBinding {
                crtc: *crtc,
                connector: state.crtc_connector.get(index).copied().flatten(),
                primary_plane: state.primary.get(index).copied().flatten(),
                cursor_plane: state.cursor.get(index).copied().flatten(),
            })
            .collect()
    }

    /// Re-probe the device after a hotplug event.
    pub fn rescan(&self) -> Result<(), BackendError> {
        if self.base.is_destroyed() {
            report_misuse(&self.name(), "rescan");
            return Ok(());
        }
        if !self.base.is_started() {
            return Ok(());
        }
        let topology = self.probe()?;
        self.apply(topology);
        Ok(())
    }

    fn probe(&self) -> Result<DrmTopology, BackendError> {
        let topology = self.device.probe().map_err(|source| BackendError::Drm {
            device: self.device.name(),
            source,
        })?;
        if topology.crtcs.len() > MAX_RESOURCES {
            warn!(
                "{}: {} CRTCs, only the first {} are used",
                self.device.name(),
                topology.crtcs.len(),
                MAX_RESOURCES
            );
        }
        Ok(topology)
    }

    fn apply(&self, topology: DrmTopology) {
        let mut doomed = Vec::new();
        let mut created = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            let previous_crtcs = std::mem::take(&mut state.crtc_connector);
            let previous_primary = std::mem::take(&mut state.primary);
            let previous_cursor = std::mem::take(&mut state.cursor);
            let old_crtc_ids = std::mem::take(&mut state.topology.crtcs);

            // Carry connector state over, dropping what vanished or was unplugged
            let mut connectors = Vec::new();
            for info in topology.connectors.iter().filter(|info| info.connected) {
                let existing = state
                    .connectors
                    .iter()
                    .position(|c| c.info.id == info.id)
                    .map(|index| state.connectors.swap_remove(index));
                let (crtc, output) = match existing {
                    Some(old) => {
                        let crtc = old
                            .crtc
                            .and_then(|index| old_crtc_ids.get(index))
                            .and_then(|id| topology.crtcs.iter().position(|crtc| crtc == id));
                        (crtc, old.output)
                    }
                    None => (None, None),
                };
                connectors.push(ConnectorState {
                    info: info.clone(),
                    crtc,
                    output,
                });
            }
            for gone in state.connectors.drain(..) {
                debug!("{}: connector {} gone", self.device.name(), gone.info.name);
                doomed.extend(gone.output);
            }
            state.connectors = connectors;

            let slots = topology.crtcs.len().min(MAX_RESOURCES);
            let crtc_connector = realloc_crtcs(&mut state.connectors, slots);
            for connector in state.connectors.iter_mut().filter(|c| c.crtc.is_none()) {
                if let Some(output) = connector.output.take() {
                    warn!("{}: no CRTC left for {}", self.device.name(), connector.info.name);
                    doomed.push(output);
                }
            }

            let active: Vec<bool> = crtc_connector.iter().map(Option::is_some).collect();
            let remap = |previous: &[Option<u32>]| -> Vec<Option<u32>> {
                (0..slots)
                    .map(|index| {
                        let old_index = old_crtc_ids.iter().position(|id| Some(id) == topology.crtcs.get(index))?;
                        previous.get(old_index).copied().flatten()
                    })
                    .collect()
            };
            state.primary = assign_planes(&topology.planes, PlaneType::Primary, &active, &remap(&previous_primary));
            state.cursor = assign_planes(&topology.planes, PlaneType::Cursor, &active, &remap(&previous_cursor));
            for (index, connector) in crtc_connector.iter().enumerate() {
                if connector.is_some() && state.primary[index].is_none() {
                    warn!("{}: CRTC {} has no primary plane", self.device.name(), topology.crtcs[index]);
                }
            }
            if previous_crtcs != crtc_connector {
                debug!("{}: CRTC assignment {:?}", self.device.name(), crtc_connector);
            }
            state.crtc_connector = crtc_connector;

            for connector in state.connectors.iter_mut() {
                if connector.crtc.is_some() && connector.output.is_none() {
                    let output = Output::new(output_info(&connector.info), self.base.event_loop().clone());
                    connector.output = Some(output.clone());
                    created.push(output);
                }
            }
            state.topology = topology;
        }

        for output in doomed {
            output.destroy();
        }
        for output in created {
            self.base.events.new_output.emit(&output);
        }
    }
}

fn output_info(connector: &ConnectorInfo) -> OutputInfo {
    OutputInfo {
        name: connector.name.clone(),
        make: "DRM".to_string(),
        model: connector.name.clone(),
        physical_size_mm: connector.physical_size_mm,
        modes: connector.modes.clone(),
    }
}

/// Bind connectors to CRTC slots. Returns, per slot, the connector id.
fn realloc_crtcs(connectors: &mut [ConnectorState], slots: usize) -> Vec<Option<u32>> {
    let slot_mask = if slots >= 32 { u32::MAX } else { (1u32 << slots) - 1 };
    let objs: Vec<u32> = connectors
        .iter()
        .map(|c| c.info.possible_crtcs & slot_mask)
        .collect();

    let mut hint = vec![UNMATCHED; slots];
    for (index, connector) in connectors.iter().enumerate() {
        if let Some(crtc) = connector.crtc.filter(|crtc| *crtc < slots) {
            hint[crtc] = index as u32;
        }
    }

    let mut out = vec![UNMATCHED; slots];
    let matched = match_obj(&objs, &hint, &mut out);
    if matched < connectors.len() {
        warn!("Only {} of {} connectors could get a CRTC", matched, connectors.len());
    }

    for connector in connectors.iter_mut() {
        connector.crtc = None;
    }
    out.iter()
        .enumerate()
        .map(|(slot, obj)| {
            let connector = connectors.get_mut(*obj as usize)?;
            connector.crtc = Some(slot);
            Some(connector.info.id)
        })
        .collect()
}

/// Give every active CRTC a plane of `plane_type`. Idle CRTCs are skipped.
fn assign_planes(
    planes: &[PlaneInfo],
    plane_type: PlaneType,
    active: &[bool],
    previous: &[Option<u32>],
) -> Vec<Option<u32>> {
    let candidates: Vec<&PlaneInfo> = planes.iter().filter(|p| p.plane_type == plane_type).collect();
    let objs: Vec<u32> = candidates.iter().map(|p| p.possible_crtcs).collect();

    let hint: Vec<u32> = active
        .iter()
        .enumerate()
        .map(|(slot, active)| {
            if !active {
                return SKIP;
            }
            previous
                .get(slot)
                .copied()
                .flatten()
                .and_then(|id| candidates.iter().position(|p| p.id == id))
                .map_or(UNMATCHED, |index| index as u32)
        })
        .collect();

    let mut out = vec![UNMATCHED; active.len()];
    match_obj(&objs, &hint, &mut out);
    out.iter()
        .map(|obj| candidates.get(*obj as usize).map(|plane| plane.id))
        .collect()
}

impl Backend for DrmBackend {
    fn base(&self) -> &BackendBase {
        &self.base
    }

    fn name(&self) -> String {
        format!("drm({})", self.device.name())
    }

    fn start(&self) -> bool {
        if let Some(result) = self.base.precheck_start(&self.name()) {
            return result;
        }
        info!("🚀 Starting DRM backend on {}", self.device.name());

        if let Err(err) = self.device.acquire_master() {
            error!("{}: could not become DRM master: {}", self.device.name(), err);
            return false;
        }
        let topology = match self.probe() {
            Ok(topology) => topology,
            Err(err) => {
                error!("{}", err);
                if let Err(err) = self.device.release_master() {
                    warn!("{}: failed to drop DRM master: {}", self.device.name(), err);
                }
                return false;
            }
        };
        self.base.mark_started();
        self.apply(topology);
        true
    }

    fn destroy(&self) {
        if self.base.is_destroyed() {
            return;
        }
        info!("Destroying DRM backend on {}", self.device.name());

        let outputs: Vec<Rc<Output>> = {
            let mut state = self.state.borrow_mut();
            let outputs = state
                .connectors
                .iter_mut()
                .filter_map(|connector| connector.output.take())
                .collect();
            *state = KmsState::default();
            outputs
        };
        for output in &outputs {
            output.destroy();
        }
        if self.base.is_started() {
            if let Err(err) = self.device.release_master() {
                warn!("{}: failed to drop DRM master: {}", self.device.name(), err);
            }
        }
        self.base.finish();
    }

    fn drm_fd(&self) -> Option<RawFd> {
        Some(self.device.raw_fd())
    }

    fn buffer_caps(&self) -> BufferCaps {
        BufferCaps::DMABUF
    }
}

impl Drop for DrmBackend {
    fn drop(&mut self) {
        self.destroy();
    }
}
