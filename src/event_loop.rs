//! Event-loop collaborator
//!
//! The core never blocks and never spawns threads; the only asynchronous thing
//! it needs from its host is one-shot timers. [`EventLoop`] is that contract.
//! [`CalloopEventLoop`] plugs it into a real `calloop` loop, while
//! [`ManualEventLoop`] runs on a virtual clock driven by [`ManualEventLoop::advance`].

use calloop::timer::{TimeoutAction, Timer};
use calloop::{LoopHandle, RegistrationToken};
use log::{debug, trace};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;

/// Callback run once when a timer expires.
pub type TimerCallback = Box<dyn FnOnce()>;

/// Opaque handle identifying a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerError {
    /// The loop has no room for another timer source.
    #[error("timer capacity of {0} exhausted")]
    Exhausted(usize),

    /// The underlying event loop refused to register the source.
    #[error("failed to register timer source: {0}")]
    Register(String),
}

/// One-shot timers on the thread running the event loop.
pub trait EventLoop {
    /// Run `callback` once after `delay`. On error the callback is dropped
    /// without running.
    fn add_timer(&self, delay: Duration, callback: TimerCallback) -> Result<TimerHandle, TimerError>;

    /// Cancel a pending timer. Unknown or already fired handles are ignored.
    fn remove_timer(&self, handle: TimerHandle);
}

/// [`EventLoop`] backed by a `calloop` loop handle.
pub struct CalloopEventLoop<D: 'static> {
    handle: LoopHandle<'static, D>,
    tokens: Rc<RefCell<HashMap<u64, RegistrationToken>>>,
    next_id: Cell<u64>,
}

impl<D: 'static> CalloopEventLoop<D> {
    pub fn new(handle: LoopHandle<'static, D>) -> Self {
        Self {
            handle,
            tokens: Rc::new(RefCell::new(HashMap::new())),
            next_id: Cell::new(1),
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.tokens.borrow().len()
    }
}

impl<D: 'static> EventLoop for CalloopEventLoop<D> {
    fn add_timer(&self, delay: Duration, callback: TimerCallback) -> Result<TimerHandle, TimerError> {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let tokens = Rc::downgrade(&self.tokens);
        let mut callback = Some(callback);
        let token = self
            .handle
            .insert_source(Timer::from_duration(delay), move |_deadline, _meta, _data: &mut D| {
                if let Some(tokens) = tokens.upgrade() {
                    tokens.borrow_mut().remove(&id);
                }
                if let Some(callback) = callback.take() {
                    callback();
                }
                TimeoutAction::Drop
            })
            .map_err(|err| TimerError::Register(err.error.to_string()))?;

        self.tokens.borrow_mut().insert(id, token);
        trace!("armed calloop timer {} for {:?}", id, delay);
        Ok(TimerHandle(id))
    }

    fn remove_timer(&self, handle: TimerHandle) {
        let token = self.tokens.borrow_mut().remove(&handle.0);
        if let Some(token) = token {
            self.handle.remove(token);
            trace!("removed calloop timer {}", handle.0);
        }
    }
}

impl<D: 'static> fmt::Debug for CalloopEventLoop<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalloopEventLoop")
            .field("pending_timers", &self.pending_timers())
            .finish()
    }
}

/// Deterministic event loop running on a virtual clock.
///
/// Time only moves when [`advance`](Self::advance) is called. An optional
/// capacity bounds the number of pending timers; `add_timer` fails with
/// [`TimerError::Exhausted`] once it is reached.
pub struct ManualEventLoop {
    now: Cell<Duration>,
    next_id: Cell<u64>,
    capacity: Option<usize>,
    queue: RefCell<BTreeMap<(Duration, u64), TimerCallback>>,
    deadlines: RefCell<HashMap<u64, Duration>>,
}

impl ManualEventLoop {
    pub fn new() -> Self {
        Self {
            now: Cell::new(Duration::ZERO),
            next_id: Cell::new(1),
            capacity: None,
            queue: RefCell::new(BTreeMap::new()),
            deadlines: RefCell::new(HashMap::new()),
        }
    }

    pub fn with_timer_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    /// Current virtual time since the loop was created.
    pub fn now(&self) -> Duration {
        self.now.get()
    }

    pub fn pending_timers(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Move the clock forward by `by`, firing every timer that comes due in
    /// deadline order (ties in arming order). Timers armed by callbacks fire in
    /// the same call if their deadline falls inside the window.
    ///
    /// Returns the number of callbacks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.now.get() + by;
        let mut fired = 0;

        loop {
            let due = {
                let mut queue = self.queue.borrow_mut();
                match queue.keys().next().copied() {
                    Some(key) if key.0 <= target => queue.remove(&key).map(|cb| (key, cb)),
                    _ => None,
                }
            };
            let Some(((deadline, id), callback)) = due else {
                break;
            };

            self.deadlines.borrow_mut().remove(&id);
            self.now.set(deadline);
            callback();
            fired += 1;
        }

        self.now.set(target);
        if fired > 0 {
            debug!("manual event loop fired {} timer(s) at {:?}", fired, target);
        }
        fired
    }
}

impl Default for ManualEventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop for ManualEventLoop {
    fn add_timer(&self, delay: Duration, callback: TimerCallback) -> Result<TimerHandle, TimerError> {
        if let Some(capacity) = self.capacity {
            if self.queue.borrow().len() >= capacity {
                return Err(TimerError::Exhausted(capacity));
            }
        }

        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let deadline = self.now.get() + delay;

        self.queue.borrow_mut().insert((deadline, id), callback);
        self.deadlines.borrow_mut().insert(id, deadline);
        Ok(TimerHandle(id))
    }

    fn remove_timer(&self, handle: TimerHandle) {
        let deadline = self.deadlines.borrow_mut().remove(&handle.0);
        if let Some(deadline) = deadline {
            // Released outside the borrow; dropping a callback may run teardown
            let callback = self.queue.borrow_mut().remove(&(deadline, handle.0));
            drop(callback);
        }
    }
}

impl fmt::Debug for ManualEventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualEventLoop")
            .field("now", &self.now.get())
            .field("pending_timers", &self.pending_timers())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_timers_fire_in_deadline_order() {
        let event_loop = ManualEventLoop::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for (delay, tag) in [(30u64, "c"), (10, "a"), (20, "b")] {
            let order = order.clone();
            event_loop
                .add_timer(Duration::from_millis(delay), Box::new(move || order.borrow_mut().push(tag)))
                .unwrap();
        }

        assert_eq!(event_loop.advance(Duration::from_millis(15)), 1);
        assert_eq!(event_loop.advance(Duration::from_millis(100)), 2);
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
        assert_eq!(event_loop.pending_timers(), 0);
    }

    #[test]
    fn test_manual_timer_removal() {
        let event_loop = ManualEventLoop::new();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let handle = event_loop
            .add_timer(Duration::from_millis(5), Box::new(move || flag.set(true)))
            .unwrap();

        event_loop.remove_timer(handle);
        event_loop.remove_timer(handle);
        event_loop.advance(Duration::from_secs(1));
        assert!(!fired.get());
    }

    #[test]
    fn test_manual_capacity_exhaustion() {
        let event_loop = ManualEventLoop::with_timer_capacity(1);
        event_loop
            .add_timer(Duration::from_millis(1), Box::new(|| {}))
            .unwrap();
        let err = event_loop
            .add_timer(Duration::from_millis(1), Box::new(|| {}))
            .unwrap_err();
        assert_eq!(err, TimerError::Exhausted(1));

        event_loop.advance(Duration::from_millis(1));
        assert!(event_loop
            .add_timer(Duration::from_millis(1), Box::new(|| {}))
            .is_ok());
    }

    #[test]
    fn test_callbacks_can_rearm_within_window() {
        let event_loop = Rc::new(ManualEventLoop::new());
        let ticks = Rc::new(Cell::new(0u32));

        let inner_loop = event_loop.clone();
        let inner_ticks = ticks.clone();
        event_loop
            .add_timer(
                Duration::from_millis(10),
                Box::new(move || {
                    inner_ticks.set(inner_ticks.get() + 1);
                    let again = inner_ticks.clone();
                    inner_loop
                        .add_timer(Duration::from_millis(10), Box::new(move || again.set(again.get() + 1)))
                        .unwrap();
                }),
            )
            .unwrap();

        assert_eq!(event_loop.advance(Duration::from_millis(25)), 2);
        assert_eq!(ticks.get(), 2);
        assert_eq!(event_loop.now(), Duration::from_millis(25));
    }

    #[test]
    fn test_removed_callback_may_arm_timers_on_drop() {
        struct RearmOnDrop(Rc<ManualEventLoop>);

        impl Drop for RearmOnDrop {
            fn drop(&mut self) {
                let _ = self.0.add_timer(Duration::from_millis(1), Box::new(|| {}));
            }
        }

        let event_loop = Rc::new(ManualEventLoop::new());
        let guard = RearmOnDrop(event_loop.clone());
        let handle = event_loop
            .add_timer(Duration::from_secs(1), Box::new(move || drop(guard)))
            .unwrap();

        event_loop.remove_timer(handle);
        assert_eq!(event_loop.pending_timers(), 1);
        assert_eq!(event_loop.advance(Duration::from_millis(1)), 1);
    }

    #[test]
    fn test_calloop_timer_fires_once() {
        let mut event_loop: calloop::EventLoop<'static, u32> = calloop::EventLoop::try_new().unwrap();
        let timers = CalloopEventLoop::new(event_loop.handle());
        let fired = Rc::new(Cell::new(0u32));
        let counter = fired.clone();

        timers
            .add_timer(Duration::ZERO, Box::new(move || counter.set(counter.get() + 1)))
            .unwrap();
        assert_eq!(timers.pending_timers(), 1);

        let mut data = 0u32;
        for _ in 0..3 {
            event_loop
                .dispatch(Some(Duration::from_millis(10)), &mut data)
                .unwrap();
        }
        assert_eq!(fired.get(), 1);
        assert_eq!(timers.pending_timers(), 0);
    }
}
