// Input device and signal integration tests
//
// Device teardown as seen by a seat-like consumer that only holds weak
// references and listens for destroy.

use axiom_backend::input::{DeviceKind, KeyboardLeds, TabletPadGroup};
use axiom_backend::{Backend, HeadlessBackend, InputDevice, InputDeviceType, ManualEventLoop, Signal};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

#[test]
fn test_pointer_destroy_listener_runs_before_release() {
    let device = InputDevice::init(InputDeviceType::Pointer, "Logitech MX Master");
    assert_eq!(device.vendor(), 0);
    assert_eq!(device.product(), 0);

    let saw_pointer = Rc::new(Cell::new(false));
    let flag = saw_pointer.clone();
    let _listener = device.events.destroy.connect(move |device| {
        // State is still intact while listeners run
        flag.set(device.try_pointer().is_some() && !device.name().is_empty());
    });

    device.finish();
    assert!(saw_pointer.get());
    assert!(device.is_finished());
}

/// Minimal seat: tracks devices weakly, forgets them on destroy.
struct Seat {
    devices: RefCell<Vec<Weak<InputDevice>>>,
}

#[test]
fn test_seat_forgets_devices_on_destroy() {
    let backend = HeadlessBackend::new(Rc::new(ManualEventLoop::new()));
    let seat = Rc::new(Seat {
        devices: RefCell::new(Vec::new()),
    });

    let tracked = seat.clone();
    let _listener = backend.events().new_input.connect(move |device| {
        tracked.devices.borrow_mut().push(Rc::downgrade(device));
        let seat = tracked.clone();
        let _ = device.events.destroy.connect(move |gone| {
            seat.devices
                .borrow_mut()
                .retain(|weak| weak.upgrade().map_or(false, |d| !std::ptr::eq(&*d, gone)));
        });
    });

    backend.add_input_device(InputDeviceType::Keyboard);
    backend.add_input_device(InputDeviceType::Touch);
    assert!(backend.start());
    assert_eq!(seat.devices.borrow().len(), 2);

    backend.destroy();
    assert!(seat.devices.borrow().is_empty());
}

#[test]
fn test_keyboard_state_through_device() {
    let device = InputDevice::init(InputDeviceType::Keyboard, "AT keyboard");
    {
        let mut keyboard = device.keyboard_mut();
        assert!(keyboard.notify_key(30, true));
        assert!(keyboard.notify_key(31, true));
        assert!(!keyboard.notify_key(30, true));
        keyboard.set_leds(KeyboardLeds::CAPS_LOCK);
    }
    assert_eq!(device.keyboard().keys.pressed(), &[30, 31]);
    assert!(device.try_touch().is_none());

    device.finish();
    assert!(device.keyboard().keys.pressed().is_empty());
}

#[test]
fn test_pad_groups_outliving_pad_are_invalidated() {
    let mut kind = DeviceKind::new(InputDeviceType::TabletPad);
    let held = match &mut kind {
        DeviceKind::TabletPad(pad) => pad.add_group(TabletPadGroup::new(vec![0, 1], vec![0], vec![], 3)),
        _ => unreachable!(),
    };
    let device = InputDevice::with_kind(kind, "Wacom Pad");

    drop(device);
    assert!(held.is_invalidated());
    assert_eq!(held.mode_count, 3);
}

#[test]
#[should_panic(expected = "is a pointer, not a tablet-pad")]
fn test_wrong_variant_access_panics() {
    let device = InputDevice::init(InputDeviceType::Pointer, "Trackpoint");
    let _ = device.tablet_pad();
}

#[test]
fn test_signal_order_and_self_disconnect() {
    let signal: Signal<u32> = Signal::new();
    let calls = Rc::new(RefCell::new(Vec::new()));

    let first_handle: Rc<RefCell<Option<axiom_backend::Listener>>> = Rc::new(RefCell::new(None));
    let (sink, me) = (calls.clone(), first_handle.clone());
    *first_handle.borrow_mut() = Some(signal.connect(move |value| {
        sink.borrow_mut().push(("first", *value));
        if let Some(listener) = me.borrow().as_ref() {
            listener.disconnect();
        }
    }));
    let sink = calls.clone();
    let _second = signal.connect(move |value| sink.borrow_mut().push(("second", *value)));
    let sink = calls.clone();
    let _third = signal.connect(move |value| sink.borrow_mut().push(("third", *value)));

    signal.emit(&1);
    signal.emit(&2);
    assert_eq!(
        *calls.borrow(),
        vec![("first", 1), ("second", 1), ("third", 1), ("second", 2), ("third", 2)]
    );
    assert_eq!(signal.listener_count(), 2);
}
