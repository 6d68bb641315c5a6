//! Keyboard payload: pressed keys, LEDs and repeat settings

use bitflags::bitflags;
use log::debug;

/// Maximum number of simultaneously tracked keycodes.
pub const KEYBOARD_KEYS_CAP: usize = 32;

bitflags! {
    /// Keyboard indicator LEDs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KeyboardLeds: u32 {
        const NUM_LOCK = 1 << 0;
        const CAPS_LOCK = 1 << 1;
        const SCROLL_LOCK = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatInfo {
    /// Repeats per second; 0 disables key repeat.
    pub rate: u32,
    /// Delay before the first repeat, in milliseconds.
    pub delay: u32,
}

impl Default for RepeatInfo {
    fn default() -> Self {
        Self { rate: 25, delay: 600 }
    }
}

/// Keycodes currently held down, in press order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyState {
    pressed: Vec<u32>,
}

impl KeyState {
    /// Record a key transition. Returns whether the set of pressed keys
    /// changed; presses beyond [`KEYBOARD_KEYS_CAP`] are dropped.
    pub fn update(&mut self, keycode: u32, pressed: bool) -> bool {
        let position = self.pressed.iter().position(|&k| k == keycode);
        match (pressed, position) {
            (true, None) => {
                if self.pressed.len() >= KEYBOARD_KEYS_CAP {
                    debug!("dropping keycode {}: {} keys already held", keycode, KEYBOARD_KEYS_CAP);
                    return false;
                }
                self.pressed.push(keycode);
                true
            }
            (false, Some(index)) => {
                self.pressed.remove(index);
                true
            }
            _ => false,
        }
    }

    pub fn is_pressed(&self, keycode: u32) -> bool {
        self.pressed.contains(&keycode)
    }

    pub fn pressed(&self) -> &[u32] {
        &self.pressed
    }

    pub fn clear(&mut self) {
        self.pressed.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyboard {
    pub keys: KeyState,
    pub leds: KeyboardLeds,
    pub repeat_info: RepeatInfo,
}

impl Keyboard {
    pub fn notify_key(&mut self, keycode: u32, pressed: bool) -> bool {
        self.keys.update(keycode, pressed)
    }

    pub fn set_leds(&mut self, leds: KeyboardLeds) {
        self.leds = leds;
    }

    pub fn set_repeat_info(&mut self, rate: u32, delay: u32) {
        self.repeat_info = RepeatInfo { rate, delay };
    }
}
