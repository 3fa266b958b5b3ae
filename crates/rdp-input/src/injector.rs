//! Translates RDP input PDUs into X11/XTest events, grounded on
//! `drd_x11_input.c`.

use crate::error::InputError;
use crate::keymap;
use crate::x11_connection::X11Connection;

/// RDP pointer flags (subset), matching the bit layout of the Pointer PDU.
pub const PTR_FLAGS_MOVE: u16 = 0x0800;
pub const PTR_FLAGS_BUTTON1: u16 = 0x1000;
pub const PTR_FLAGS_BUTTON2: u16 = 0x2000;
pub const PTR_FLAGS_BUTTON3: u16 = 0x4000;
pub const PTR_FLAGS_DOWN: u16 = 0x8000;
pub const PTR_FLAGS_WHEEL: u16 = 0x0200;
pub const PTR_FLAGS_HWHEEL: u16 = 0x0400;
pub const PTR_FLAGS_WHEEL_NEGATIVE: u16 = 0x0100;
const WHEEL_ROTATION_MASK: u16 = 0x01ff;

/// X11 button numbers for the vertical/horizontal wheel.
const X11_BUTTON_WHEEL_UP: u8 = 4;
const X11_BUTTON_WHEEL_DOWN: u8 = 5;
const X11_BUTTON_HWHEEL_LEFT: u8 = 6;
const X11_BUTTON_HWHEEL_RIGHT: u8 = 7;

/// 512-entry cache, indexed by `scancode + extended ? 256 : 0`, mirroring
/// the original's flat keycode cache sized for the full XT scancode space
/// doubled for the extended flag.
const KEYCODE_CACHE_SIZE: usize = 512;

pub struct X11Injector<C: X11Connection> {
    conn: C,
    stream_width: u32,
    stream_height: u32,
    desktop_width: u32,
    desktop_height: u32,
    keycode_cache: Vec<Option<u8>>,
}

impl<C: X11Connection> X11Injector<C> {
    pub fn new(conn: C) -> Self {
        Self {
            conn,
            stream_width: 0,
            stream_height: 0,
            desktop_width: 0,
            desktop_height: 0,
            keycode_cache: vec![None; KEYCODE_CACHE_SIZE],
        }
    }

    /// Default desktop resolution used when the X11 display reports a zero
    /// size for either dimension.
    const DEFAULT_DESKTOP_WIDTH: u32 = 1920;
    const DEFAULT_DESKTOP_HEIGHT: u32 = 1080;

    pub fn update_desktop_size(&mut self, stream_width: u32, stream_height: u32, desktop_width: u32, desktop_height: u32) {
        self.stream_width = stream_width;
        self.stream_height = stream_height;
        self.desktop_width = if desktop_width == 0 { Self::DEFAULT_DESKTOP_WIDTH } else { desktop_width };
        self.desktop_height = if desktop_height == 0 { Self::DEFAULT_DESKTOP_HEIGHT } else { desktop_height };
    }

    fn cache_index(scancode: u8, extended: bool) -> usize {
        usize::from(scancode) + if extended { 256 } else { 0 }
    }

    fn resolve_keycode(&mut self, scancode: u8, extended: bool) -> Option<u8> {
        let idx = Self::cache_index(scancode, extended);
        if let Some(kc) = self.keycode_cache[idx] {
            return Some(kc);
        }

        let keysym = keymap::special_key_keysym(scancode, extended)
            .or_else(|| keymap::scancode_to_keysym(scancode, extended))?;
        let keycode = self.conn.keycode_for_keysym(keysym)?;
        self.keycode_cache[idx] = Some(keycode);
        Some(keycode)
    }

    pub fn handle_keyboard(&mut self, scancode: u8, extended: bool, down: bool) -> Result<(), InputError> {
        let Some(keycode) = self.resolve_keycode(scancode, extended) else {
            return Ok(()); // unmapped key: silently ignored, matching the original
        };
        self.conn.fake_key_event(keycode, down)
    }

    pub fn handle_unicode(&mut self, codepoint: u32, down: bool) -> Result<(), InputError> {
        let Some(keysym) = keymap::keysym_from_codepoint(codepoint) else {
            return Ok(());
        };
        let Some(keycode) = self.conn.keycode_for_keysym(keysym) else {
            return Ok(());
        };
        self.conn.fake_key_event(keycode, down)
    }

    /// Scales a stream-space coordinate into desktop space, clamping the
    /// input to the stream bounds and the output to the desktop bounds, and
    /// rounding to the nearest pixel rather than truncating.
    fn scale_x(&self, x: u16) -> i16 {
        if self.stream_width == 0 || self.stream_width == self.desktop_width {
            return x as i16;
        }
        let clamped_x = u32::from(x).min(self.stream_width.saturating_sub(1));
        let scaled = (clamped_x * self.desktop_width * 2 + self.stream_width) / (self.stream_width * 2);
        scaled.min(self.desktop_width.saturating_sub(1)) as i16
    }

    fn scale_y(&self, y: u16) -> i16 {
        if self.stream_height == 0 || self.stream_height == self.desktop_height {
            return y as i16;
        }
        let clamped_y = u32::from(y).min(self.stream_height.saturating_sub(1));
        let scaled = (clamped_y * self.desktop_height * 2 + self.stream_height) / (self.stream_height * 2);
        scaled.min(self.desktop_height.saturating_sub(1)) as i16
    }

    pub fn handle_pointer(&mut self, flags: u16, x: u16, y: u16) -> Result<(), InputError> {
        if flags & PTR_FLAGS_MOVE != 0 {
            self.conn.fake_motion_event(self.scale_x(x), self.scale_y(y))?;
        }

        // RDP button numbering is deliberately remapped: BUTTON1 (left) ->
        // X11 button 1, BUTTON3 (right) -> X11 button 2, BUTTON2 (middle)
        // -> X11 button 3.
        if flags & PTR_FLAGS_BUTTON1 != 0 {
            self.conn.fake_button_event(1, flags & PTR_FLAGS_DOWN != 0)?;
        }
        if flags & PTR_FLAGS_BUTTON3 != 0 {
            self.conn.fake_button_event(2, flags & PTR_FLAGS_DOWN != 0)?;
        }
        if flags & PTR_FLAGS_BUTTON2 != 0 {
            self.conn.fake_button_event(3, flags & PTR_FLAGS_DOWN != 0)?;
        }

        Ok(())
    }

    pub fn handle_pointer_wheel(&mut self, flags: u16) -> Result<(), InputError> {
        let rotation = flags & WHEEL_ROTATION_MASK;
        let negative = flags & PTR_FLAGS_WHEEL_NEGATIVE != 0;
        let horizontal = flags & PTR_FLAGS_HWHEEL != 0;

        let button = if horizontal {
            if negative { X11_BUTTON_HWHEEL_LEFT } else { X11_BUTTON_HWHEEL_RIGHT }
        } else if negative {
            X11_BUTTON_WHEEL_DOWN
        } else {
            X11_BUTTON_WHEEL_UP
        };

        let _ = rotation; // click count isn't modeled; one notch per event, matching drd_x11_input.c
        self.conn.fake_button_event(button, true)?;
        self.conn.fake_button_event(button, false)
    }

    pub fn flush(&self) -> Result<(), InputError> {
        self.conn.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x11_connection::tests::FakeConnection;

    fn injector_with(keysyms: &[(u32, u8)]) -> X11Injector<FakeConnection> {
        let mut conn = FakeConnection::default();
        for &(ks, kc) in keysyms {
            conn.keysyms.insert(ks, kc);
        }
        let mut injector = X11Injector::new(conn);
        injector.update_desktop_size(1920, 1080, 1920, 1080);
        injector
    }

    #[test]
    fn keyboard_event_resolves_and_caches_keycode() {
        let mut injector = injector_with(&[(0x0061, 38)]); // 'a'
        injector.handle_keyboard(0x1e, false, true).unwrap();
        injector.handle_keyboard(0x1e, false, false).unwrap();
        assert_eq!(injector.conn.keys.borrow().as_slice(), &[(38, true), (38, false)]);
    }

    #[test]
    fn unmapped_scancode_is_ignored_without_error() {
        let mut injector = injector_with(&[]);
        assert!(injector.handle_keyboard(0xee, false, true).is_ok());
        assert!(injector.conn.keys.borrow().is_empty());
    }

    #[test]
    fn pointer_button_remap_follows_original_wiring() {
        let mut injector = injector_with(&[]);
        injector
            .handle_pointer(PTR_FLAGS_BUTTON1 | PTR_FLAGS_DOWN, 0, 0)
            .unwrap();
        injector
            .handle_pointer(PTR_FLAGS_BUTTON3 | PTR_FLAGS_DOWN, 0, 0)
            .unwrap();
        injector
            .handle_pointer(PTR_FLAGS_BUTTON2 | PTR_FLAGS_DOWN, 0, 0)
            .unwrap();
        assert_eq!(
            injector.conn.buttons.borrow().as_slice(),
            &[(1, true), (2, true), (3, true)]
        );
    }

    #[test]
    fn pointer_move_scales_into_desktop_space() {
        let mut injector = injector_with(&[]);
        injector.update_desktop_size(960, 540, 1920, 1080);
        injector.handle_pointer(PTR_FLAGS_MOVE, 480, 270).unwrap();
        assert_eq!(injector.conn.motions.borrow().as_slice(), &[(960, 540)]);
    }

    #[test]
    fn pointer_scaling_rounds_to_nearest_pixel() {
        let mut injector = injector_with(&[]);
        injector.update_desktop_size(1024, 768, 1920, 1080);
        injector.handle_pointer(PTR_FLAGS_MOVE, 512, 384).unwrap();
        assert_eq!(injector.conn.motions.borrow().as_slice(), &[(960, 540)]);
    }

    #[test]
    fn pointer_scaling_clamps_to_desktop_bounds() {
        let mut injector = injector_with(&[]);
        injector.update_desktop_size(1024, 768, 1920, 1080);
        injector.handle_pointer(PTR_FLAGS_MOVE, u16::MAX, u16::MAX).unwrap();
        let (x, y) = injector.conn.motions.borrow()[0];
        assert_eq!((x, y), (1919, 1079));
    }

    #[test]
    fn zero_desktop_size_falls_back_to_defaults() {
        let mut injector = injector_with(&[]);
        injector.update_desktop_size(1024, 768, 0, 0);
        injector.handle_pointer(PTR_FLAGS_MOVE, 512, 384).unwrap();
        assert_eq!(injector.conn.motions.borrow().as_slice(), &[(960, 540)]);
    }

    #[test]
    fn wheel_event_emits_a_press_release_pair() {
        let mut injector = injector_with(&[]);
        injector.handle_pointer_wheel(PTR_FLAGS_WHEEL | 0x0078).unwrap();
        assert_eq!(
            injector.conn.buttons.borrow().as_slice(),
            &[(X11_BUTTON_WHEEL_UP, true), (X11_BUTTON_WHEEL_UP, false)]
        );
    }

    #[test]
    fn negative_horizontal_wheel_picks_left_button() {
        let mut injector = injector_with(&[]);
        injector
            .handle_pointer_wheel(PTR_FLAGS_HWHEEL | PTR_FLAGS_WHEEL_NEGATIVE | 0x0010)
            .unwrap();
        assert_eq!(
            injector.conn.buttons.borrow().as_slice(),
            &[(X11_BUTTON_HWHEEL_LEFT, true), (X11_BUTTON_HWHEEL_LEFT, false)]
        );
    }
}
