//! X11/XTest backend: injects synthetic key, motion, and button events and
//! resolves X11 keysyms to keycodes for the running X server.
//!
//! Grounded on `drd_x11_input.c`'s use of `XTestFakeKeyEvent` /
//! `XTestFakeMotionEvent` / `XTestFakeButtonEvent` and its
//! `XGetKeyboardMapping`-derived keysym lookup, translated to the X11
//! core protocol + XTEST extension requests exposed by `x11rb`.

use std::collections::HashMap;

use x11rb::connection::Connection;
use x11rb::protocol::xproto::{ConnectionExt as _, GetKeyboardMappingReply};
use x11rb::protocol::xtest::ConnectionExt as _;
use x11rb::rust_connection::RustConnection;

use crate::error::InputError;

/// Abstracts the X11/XTest primitives `X11Injector` needs, so the
/// dispatcher logic can be exercised without a live X server.
pub trait X11Connection {
    /// Resolves an X11 keysym to a keycode, allocating a spare keycode slot
    /// and remapping it via `ChangeKeyboardMapping` if the keysym isn't
    /// already bound.
    fn keycode_for_keysym(&mut self, keysym: u32) -> Option<u8>;
    fn fake_key_event(&self, keycode: u8, press: bool) -> Result<(), InputError>;
    fn fake_motion_event(&self, x: i16, y: i16) -> Result<(), InputError>;
    fn fake_button_event(&self, button: u8, press: bool) -> Result<(), InputError>;
    fn flush(&self) -> Result<(), InputError>;
}

/// Real backend talking to an X server over `x11rb`.
pub struct X11rbConnection {
    conn: RustConnection,
    min_keycode: u8,
    max_keycode: u8,
    keysyms_per_keycode: u8,
    keycode_map: Vec<u32>,
    keysym_to_keycode: HashMap<u32, u8>,
    /// Keycode reserved for remapping keysyms not present in the server's
    /// default layout (typically the highest unused keycode).
    scratch_keycode: Option<u8>,
}

impl X11rbConnection {
    pub fn connect(display_name: Option<&str>) -> Result<Self, InputError> {
        let (conn, screen_num) = x11rb::connect(display_name)
            .map_err(|e| InputError::ConnectionFailed(e.to_string()))?;

        xtest_query_version(&conn)?;

        let setup = conn.setup();
        let _ = screen_num;
        let min_keycode = setup.min_keycode;
        let max_keycode = setup.max_keycode;

        let mapping = conn
            .get_keyboard_mapping(min_keycode, max_keycode - min_keycode + 1)
            .map_err(|e| InputError::ConnectionFailed(e.to_string()))?
            .reply()
            .map_err(|e| InputError::ConnectionFailed(e.to_string()))?;

        let mut this = Self {
            conn,
            min_keycode,
            max_keycode,
            keysyms_per_keycode: mapping.keysyms_per_keycode,
            keycode_map: mapping.keysyms.clone(),
            keysym_to_keycode: HashMap::new(),
            scratch_keycode: None,
        };
        this.rebuild_reverse_map(&mapping);
        this.scratch_keycode = this.pick_scratch_keycode();
        Ok(this)
    }

    fn rebuild_reverse_map(&mut self, mapping: &GetKeyboardMappingReply) {
        self.keysym_to_keycode.clear();
        let per_code = usize::from(mapping.keysyms_per_keycode.max(1));
        for (i, chunk) in mapping.keysyms.chunks(per_code).enumerate() {
            let keycode = self.min_keycode + i as u8;
            for &ks in chunk {
                if ks != 0 {
                    self.keysym_to_keycode.entry(ks).or_insert(keycode);
                }
            }
        }
    }

    /// A keycode with no keysym bound to its first slot, used to inject
    /// keysyms the server's static layout doesn't already cover.
    fn pick_scratch_keycode(&self) -> Option<u8> {
        let per_code = usize::from(self.keysyms_per_keycode.max(1));
        for keycode in (self.min_keycode..=self.max_keycode).rev() {
            let idx = usize::from(keycode - self.min_keycode) * per_code;
            if self.keycode_map.get(idx).copied().unwrap_or(0) == 0 {
                return Some(keycode);
            }
        }
        None
    }
}

fn xtest_query_version(conn: &RustConnection) -> Result<(), InputError> {
    conn.xtest_get_version(2, 2)
        .map_err(|_| InputError::XTestUnavailable)?
        .reply()
        .map_err(|_| InputError::XTestUnavailable)?;
    Ok(())
}

impl X11Connection for X11rbConnection {
    fn keycode_for_keysym(&mut self, keysym: u32) -> Option<u8> {
        if let Some(&kc) = self.keysym_to_keycode.get(&keysym) {
            return Some(kc);
        }

        let scratch = self.scratch_keycode?;
        let per_code = usize::from(self.keysyms_per_keycode.max(1));
        let mut keysyms = vec![0u32; per_code];
        keysyms[0] = keysym;

        if self
            .conn
            .change_keyboard_mapping(1, scratch, self.keysyms_per_keycode, &keysyms)
            .is_err()
        {
            return None;
        }
        let _ = self.conn.flush();

        let idx = usize::from(scratch - self.min_keycode) * per_code;
        if idx + per_code <= self.keycode_map.len() {
            self.keycode_map[idx..idx + per_code].copy_from_slice(&keysyms);
        }
        self.keysym_to_keycode.insert(keysym, scratch);
        Some(scratch)
    }

    fn fake_key_event(&self, keycode: u8, press: bool) -> Result<(), InputError> {
        self.conn
            .xtest_fake_input(
                if press { 2 } else { 3 }, // KeyPress / KeyRelease
                keycode,
                0,
                x11rb::NONE,
                0,
                0,
                0,
            )
            .map_err(|e| InputError::ConnectionFailed(e.to_string()))?;
        Ok(())
    }

    fn fake_motion_event(&self, x: i16, y: i16) -> Result<(), InputError> {
        self.conn
            .xtest_fake_input(6, 0, 0, x11rb::NONE, x, y, 0) // MotionNotify
            .map_err(|e| InputError::ConnectionFailed(e.to_string()))?;
        Ok(())
    }

    fn fake_button_event(&self, button: u8, press: bool) -> Result<(), InputError> {
        self.conn
            .xtest_fake_input(
                if press { 4 } else { 5 }, // ButtonPress / ButtonRelease
                button,
                0,
                x11rb::NONE,
                0,
                0,
                0,
            )
            .map_err(|e| InputError::ConnectionFailed(e.to_string()))?;
        Ok(())
    }

    fn flush(&self) -> Result<(), InputError> {
        self.conn
            .flush()
            .map_err(|e| InputError::ConnectionFailed(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Records calls instead of talking to a real server, for exercising
    /// `X11Injector` without a display.
    #[derive(Default)]
    pub struct FakeConnection {
        pub keys: RefCell<Vec<(u8, bool)>>,
        pub motions: RefCell<Vec<(i16, i16)>>,
        pub buttons: RefCell<Vec<(u8, bool)>>,
        pub keysyms: HashMap<u32, u8>,
    }

    impl X11Connection for FakeConnection {
        fn keycode_for_keysym(&mut self, keysym: u32) -> Option<u8> {
            self.keysyms.get(&keysym).copied()
        }
        fn fake_key_event(&self, keycode: u8, press: bool) -> Result<(), InputError> {
            self.keys.borrow_mut().push((keycode, press));
            Ok(())
        }
        fn fake_motion_event(&self, x: i16, y: i16) -> Result<(), InputError> {
            self.motions.borrow_mut().push((x, y));
            Ok(())
        }
        fn fake_button_event(&self, button: u8, press: bool) -> Result<(), InputError> {
            self.buttons.borrow_mut().push((button, press));
            Ok(())
        }
        fn flush(&self) -> Result<(), InputError> {
            Ok(())
        }
    }

    #[test]
    fn fake_connection_records_injected_events() {
        let mut conn = FakeConnection::default();
        conn.keysyms.insert(0x61, 38);
        assert_eq!(conn.keycode_for_keysym(0x61), Some(38));
        conn.fake_key_event(38, true).unwrap();
        conn.fake_motion_event(10, 20).unwrap();
        conn.fake_button_event(1, true).unwrap();
        assert_eq!(conn.keys.borrow().as_slice(), &[(38, true)]);
        assert_eq!(conn.motions.borrow().as_slice(), &[(10, 20)]);
        assert_eq!(conn.buttons.borrow().as_slice(), &[(1, true)]);
    }
}
