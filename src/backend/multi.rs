//! Multi-backend aggregate
//!
//! Presents several backends as one. Members' `new_input` and `new_output`
//! are re-emitted on the aggregate's own signals, whether the member was
//! added before or after the aggregate started. A backend belongs to at most
//! one aggregate at a time.
//!
//! A member destroyed on its own is dropped from the set silently;
//! `backend_remove` only fires for explicit [`MultiBackend::remove`] calls.

use super::{report_misuse, same_backend, Backend, BackendBase, BufferCaps, ClockId};
use crate::event_loop::EventLoop;
use crate::session::Session;
use crate::signal::{Listener, Signal};
use log::{debug, info, warn};
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

#[derive(Debug, Default)]
pub struct MultiEvents {
    pub backend_add: Signal<Rc<dyn Backend>>,
    pub backend_remove: Signal<Rc<dyn Backend>>,
}

struct Member {
    backend: Rc<dyn Backend>,
    listeners: Vec<Listener>,
}

impl Member {
    fn detach(&self) {
        for listener in &self.listeners {
            listener.disconnect();
        }
        self.backend.base().set_in_multi(false);
    }
}

pub struct MultiBackend {
    base: BackendBase,
    pub multi_events: MultiEvents,
    members: RefCell<Vec<Member>>,
    this: Weak<MultiBackend>,
}

impl MultiBackend {
    pub fn new(event_loop: Rc<dyn EventLoop>) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            base: BackendBase::new(event_loop, None),
            multi_events: MultiEvents::default(),
            members: RefCell::new(Vec::new()),
            this: this.clone(),
        })
    }

    /// Add `backend`. Returns false if it already belongs to an aggregate.
    pub fn add(&self, backend: Rc<dyn Backend>) -> bool {
        if self.base.is_destroyed() {
            report_misuse("multi", "add");
            return false;
        }
        if backend.base().in_multi() {
            warn!("{} is already part of a multi-backend", backend.name());
            return false;
        }
        if std::ptr::eq(Rc::as_ptr(&backend).cast::<()>(), (self as *const Self).cast::<()>()) {
            warn!("Refusing to add a multi-backend to itself");
            return false;
        }
        if backend.base().is_destroyed() {
            report_misuse(&backend.name(), "multi add");
            return false;
        }

        let forward_input = self.base.events.new_input.clone();
        let forward_output = self.base.events.new_output.clone();
        let this = self.this.clone();
        let member = Rc::downgrade(&backend);
        let listeners = vec![
            backend
                .events()
                .new_input
                .connect(move |device| forward_input.emit(device)),
            backend
                .events()
                .new_output
                .connect(move |output| forward_output.emit(output)),
            backend.events().destroy.connect(move |_| {
                if let (Some(multi), Some(member)) = (this.upgrade(), member.upgrade()) {
                    multi.handle_member_destroy(&member);
                }
            }),
        ];

        backend.base().set_in_multi(true);
        self.members.borrow_mut().push(Member {
            backend: backend.clone(),
            listeners,
        });
        debug!("Added {} to multi-backend", backend.name());
        self.multi_events.backend_add.emit(&backend);
        true
    }

    /// Take `backend` out of the aggregate and emit `backend_remove`.
    /// Allowed at any time, including after `start()`.
    pub fn remove(&self, backend: &Rc<dyn Backend>) {
        if self.base.is_destroyed() {
            report_misuse("multi", "remove");
            return;
        }
        let Some(member) = self.take_member(backend) else {
            return;
        };
        member.detach();
        debug!("Removed {} from multi-backend", member.backend.name());
        self.multi_events.backend_remove.emit(&member.backend);
    }

    fn handle_member_destroy(&self, backend: &Rc<dyn Backend>) {
        if let Some(member) = self.take_member(backend) {
            debug!("{} destroyed, leaving multi-backend", backend.name());
            member.detach();
        }
    }

    fn take_member(&self, backend: &Rc<dyn Backend>) -> Option<Member> {
        let mut members = self.members.borrow_mut();
        let index = members.iter().position(|m| same_backend(&m.backend, backend))?;
        Some(members.remove(index))
    }

    pub fn is_empty(&self) -> bool {
        self.members.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.borrow().len()
    }

    /// Visit members in insertion order.
    ///
    /// `f` must not add, remove or destroy members; doing so panics.
    pub fn for_each_backend<F>(&self, mut f: F)
    where
        F: FnMut(&Rc<dyn Backend>),
    {
        let members = self.members.borrow();
        for member in members.iter() {
            f(&member.backend);
        }
    }

    fn backends(&self) -> Vec<Rc<dyn Backend>> {
        self.members.borrow().iter().map(|m| m.backend.clone()).collect()
    }
}

impl Backend for MultiBackend {
    fn base(&self) -> &BackendBase {
        &self.base
    }

    fn name(&self) -> String {
        "multi".to_string()
    }

    /// Start every member. Failing members are logged and skipped; the
    /// aggregate fails only when members exist and none of them started.
    fn start(&self) -> bool {
        if let Some(result) = self.base.precheck_start(&self.name()) {
            return result;
        }
        let backends = self.backends();
        info!("🚀 Starting multi-backend with {} member(s)", backends.len());

        let mut started = 0;
        for backend in &backends {
            if backend.start() {
                started += 1;
            } else {
                warn!("Failed to start {} backend", backend.name());
            }
        }
        if !backends.is_empty() && started == 0 {
            return false;
        }
        self.base.mark_started();
        true
    }

    fn destroy(&self) {
        if self.base.is_destroyed() {
            return;
        }
        info!("Destroying multi-backend");

        // Members drop out through their destroy listeners
        loop {
            let next = self.members.borrow().first().map(|m| m.backend.clone());
            let Some(backend) = next else {
                break;
            };
            backend.destroy();
            if let Some(member) = self.take_member(&backend) {
                member.detach();
            }
        }
        self.base.finish();
    }

    fn session(&self) -> Option<Rc<dyn Session>> {
        self.backends().iter().find_map(|backend| backend.session())
    }

    fn presentation_clock(&self) -> ClockId {
        self.backends()
            .first()
            .map_or(ClockId::Monotonic, |backend| backend.presentation_clock())
    }

    fn drm_fd(&self) -> Option<RawFd> {
        self.backends().iter().find_map(|backend| backend.drm_fd())
    }

    fn buffer_caps(&self) -> BufferCaps {
        self.backends()
            .iter()
            .fold(BufferCaps::empty(), |caps, backend| caps | backend.buffer_caps())
    }
}

impl Drop for MultiBackend {
    fn drop(&mut self) {
        self.destroy();
    }
}
