//! Synchronous signal/listener bus
//!
//! Every producer in this crate (backends, input devices, outputs, the global
//! registry) publishes its lifecycle through a [`Signal`]. Consumers attach a
//! closure with [`Signal::connect`] and keep the returned [`Listener`] handle;
//! the handle is the only thing needed to disconnect later.
//!
//! Emission walks a snapshot of the listener list taken when `emit` starts and
//! checks each listener's connected flag right before invoking it. That gives
//! the following guarantees:
//!
//! - listeners run in registration order,
//! - a listener connected during an emission is not invoked by that emission,
//! - a listener disconnected before its turn is skipped,
//! - no listener is invoked twice by one emission.
//!
//! Signals are single-threaded (`Rc` based) and must only be touched from the
//! thread running the event loop.

use log::warn;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

type Callback<E> = Box<dyn FnMut(&E)>;

struct Slot<E: ?Sized> {
    connected: Rc<Cell<bool>>,
    callback: RefCell<Callback<E>>,
}

struct Registry<E: ?Sized> {
    slots: Vec<Rc<Slot<E>>>,
}

/// Type-erased access to a registry so that [`Listener`] handles do not need
/// to carry the event type.
trait Prune {
    fn prune(&self);
}

impl<E: ?Sized> Prune for RefCell<Registry<E>> {
    fn prune(&self) {
        // Never borrowed across callbacks, but stay quiet if it ever is; the
        // connected flag alone already keeps the slot from running.
        if let Ok(mut registry) = self.try_borrow_mut() {
            registry.slots.retain(|slot| slot.connected.get());
        }
    }
}

/// A publish point that synchronously notifies its listeners.
///
/// Cloning a `Signal` yields another handle to the same listener list, which
/// is how forwarding listeners (e.g. the multi-backend) re-emit on a signal
/// they do not own.
pub struct Signal<E: ?Sized + 'static> {
    registry: Rc<RefCell<Registry<E>>>,
}

/// Handle returned by [`Signal::connect`].
///
/// Dropping the handle does not disconnect the listener: it then stays
/// attached for as long as the signal lives.
pub struct Listener {
    connected: Rc<Cell<bool>>,
    registry: Weak<dyn Prune>,
}

impl<E: ?Sized + 'static> Signal<E> {
    pub fn new() -> Self {
        Self {
            registry: Rc::new(RefCell::new(Registry { slots: Vec::new() })),
        }
    }

    /// Attach `callback`; any context it needs is captured by the closure.
    pub fn connect<F>(&self, callback: F) -> Listener
    where
        F: FnMut(&E) + 'static,
    {
        let connected = Rc::new(Cell::new(true));
        let slot = Rc::new(Slot {
            connected: connected.clone(),
            callback: RefCell::new(Box::new(callback)),
        });
        self.registry.borrow_mut().slots.push(slot);

        let registry: Rc<dyn Prune> = self.registry.clone();
        Listener {
            connected,
            registry: Rc::downgrade(&registry),
        }
    }

    /// Invoke every listener connected at the time of the call, in order.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Rc<Slot<E>>> = self.registry.borrow().slots.clone();

        for slot in snapshot {
            if !slot.connected.get() {
                continue;
            }
            match slot.callback.try_borrow_mut() {
                Ok(mut callback) => (*callback)(event),
                Err(_) => {
                    // Nested emission reached a listener that is still running
                    warn!("skipping re-entrant invocation of a signal listener");
                }
            }
        }
    }

    /// Number of listeners currently connected.
    pub fn listener_count(&self) -> usize {
        self.registry
            .borrow()
            .slots
            .iter()
            .filter(|slot| slot.connected.get())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.listener_count() == 0
    }
}

impl<E: ?Sized + 'static> Default for Signal<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: ?Sized + 'static> Clone for Signal<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<E: ?Sized + 'static> fmt::Debug for Signal<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl Listener {
    /// Detach the listener. Safe to call from inside any callback of the same
    /// signal, including the listener's own; calling it twice is a no-op.
    pub fn disconnect(&self) {
        if self.connected.replace(false) {
            if let Some(registry) = self.registry.upgrade() {
                registry.prune();
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("connected", &self.connected.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> Rc<RefCell<Vec<&'static str>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let signal: Signal<u32> = Signal::new();
        let log = recorder();

        for name in ["l1", "l2", "l3"] {
            let log = log.clone();
            let _ = signal.connect(move |_| log.borrow_mut().push(name));
        }

        signal.emit(&7);
        assert_eq!(*log.borrow(), vec!["l1", "l2", "l3"]);
    }

    #[test]
    fn test_event_payload_is_delivered() {
        let signal: Signal<String> = Signal::new();
        let seen = Rc::new(RefCell::new(String::new()));
        let sink = seen.clone();
        let _listener = signal.connect(move |value: &String| sink.borrow_mut().push_str(value));

        signal.emit(&"HEADLESS-1".to_string());
        assert_eq!(seen.borrow().as_str(), "HEADLESS-1");
    }

    #[test]
    fn test_self_disconnect_during_emission() {
        let signal: Signal<()> = Signal::new();
        let log = recorder();
        let own_handle: Rc<RefCell<Option<Listener>>> = Rc::new(RefCell::new(None));

        let first = {
            let log = log.clone();
            signal.connect(move |_| log.borrow_mut().push("first"))
        };
        let second = {
            let log = log.clone();
            let own_handle = own_handle.clone();
            signal.connect(move |_| {
                log.borrow_mut().push("second");
                if let Some(handle) = own_handle.borrow().as_ref() {
                    handle.disconnect();
                }
            })
        };
        *own_handle.borrow_mut() = Some(second);
        let third = {
            let log = log.clone();
            signal.connect(move |_| log.borrow_mut().push("third"))
        };

        signal.emit(&());
        assert_eq!(*log.borrow(), vec!["first", "second", "third"]);

        log.borrow_mut().clear();
        signal.emit(&());
        assert_eq!(*log.borrow(), vec!["first", "third"]);
        assert_eq!(signal.listener_count(), 2);
        assert!(first.is_connected());
        assert!(third.is_connected());
    }

    #[test]
    fn test_disconnecting_a_later_listener_skips_it() {
        let signal: Signal<()> = Signal::new();
        let log = recorder();
        let victim: Rc<RefCell<Option<Listener>>> = Rc::new(RefCell::new(None));

        let _killer = {
            let log = log.clone();
            let victim = victim.clone();
            signal.connect(move |_| {
                log.borrow_mut().push("killer");
                if let Some(handle) = victim.borrow().as_ref() {
                    handle.disconnect();
                }
            })
        };
        let handle = {
            let log = log.clone();
            signal.connect(move |_| log.borrow_mut().push("victim"))
        };
        *victim.borrow_mut() = Some(handle);

        signal.emit(&());
        assert_eq!(*log.borrow(), vec!["killer"]);
    }

    #[test]
    fn test_listener_added_during_emission_waits_for_next_emission() {
        let signal: Signal<()> = Signal::new();
        let count = Rc::new(Cell::new(0u32));
        let late: Rc<RefCell<Vec<Listener>>> = Rc::new(RefCell::new(Vec::new()));

        let _adder = {
            let signal = signal.clone();
            let count = count.clone();
            let late = late.clone();
            signal.clone().connect(move |_| {
                if late.borrow().is_empty() {
                    let count = count.clone();
                    let handle = signal.connect(move |_| count.set(count.get() + 1));
                    late.borrow_mut().push(handle);
                }
            })
        };

        signal.emit(&());
        assert_eq!(count.get(), 0);
        signal.emit(&());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let signal: Signal<()> = Signal::new();
        let listener = signal.connect(|_| {});
        assert_eq!(signal.listener_count(), 1);

        listener.disconnect();
        listener.disconnect();
        assert!(!listener.is_connected());
        assert!(signal.is_empty());
    }

    #[test]
    fn test_handle_outlives_signal() {
        let signal: Signal<()> = Signal::new();
        let listener = signal.connect(|_| {});
        drop(signal);
        listener.disconnect();
        assert!(!listener.is_connected());
    }

    #[test]
    fn test_nested_emission_does_not_reenter_running_listener() {
        let signal: Signal<u32> = Signal::new();
        let calls = Rc::new(Cell::new(0u32));

        let _listener = {
            let signal = signal.clone();
            let calls = calls.clone();
            signal.clone().connect(move |depth: &u32| {
                calls.set(calls.get() + 1);
                if *depth == 0 {
                    signal.emit(&1);
                }
            })
        };

        signal.emit(&0);
        assert_eq!(calls.get(), 1);
    }
}
