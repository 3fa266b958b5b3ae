//! XT scancode (set 1) -> X11 keysym table, and the small set of special
//! keys `drd_x11_input_lookup_special_keycode` resolves by hand when the
//! main table comes up empty.
//!
//! The RDP scancode space is the same "PS/2 set 1" encoding used by the
//! original: a base byte plus an "extended" (E0-prefixed) flag.

/// Base (non-extended) scancode -> X11 keysym, standard US layout.
#[rustfmt::skip]
const BASE_TABLE: &[(u8, u32)] = &[
    (0x01, 0xff1b), // Escape
    (0x02, 0x0031), (0x03, 0x0032), (0x04, 0x0033), (0x05, 0x0034), (0x06, 0x0035),
    (0x07, 0x0036), (0x08, 0x0037), (0x09, 0x0038), (0x0a, 0x0039), (0x0b, 0x0030),
    (0x0c, 0x002d), // minus
    (0x0d, 0x003d), // equal
    (0x0e, 0xff08), // backspace
    (0x0f, 0xff09), // tab
    (0x10, 0x0071), (0x11, 0x0077), (0x12, 0x0065), (0x13, 0x0072), (0x14, 0x0074),
    (0x15, 0x0079), (0x16, 0x0075), (0x17, 0x0069), (0x18, 0x006f), (0x19, 0x0070),
    (0x1a, 0x005b), // bracketleft
    (0x1b, 0x005d), // bracketright
    (0x1c, 0xff0d), // return
    (0x1d, 0xffe3), // control_l
    (0x1e, 0x0061), (0x1f, 0x0073), (0x20, 0x0064), (0x21, 0x0066), (0x22, 0x0067),
    (0x23, 0x0068), (0x24, 0x006a), (0x25, 0x006b), (0x26, 0x006c),
    (0x27, 0x003b), // semicolon
    (0x28, 0x0027), // apostrophe
    (0x29, 0x0060), // grave
    (0x2a, 0xffe1), // shift_l
    (0x2b, 0x005c), // backslash
    (0x2c, 0x007a), (0x2d, 0x0078), (0x2e, 0x0063), (0x2f, 0x0076), (0x30, 0x0062),
    (0x31, 0x006e), (0x32, 0x006d),
    (0x33, 0x002c), // comma
    (0x34, 0x002e), // period
    (0x35, 0x002f), // slash
    (0x36, 0xffe2), // shift_r
    (0x38, 0xffe9), // alt_l
    (0x39, 0x0020), // space
    (0x3a, 0xffe5), // caps_lock
    (0x3b, 0xffbe), (0x3c, 0xffbf), (0x3d, 0xffc0), (0x3e, 0xffc1), (0x3f, 0xffc2),
    (0x40, 0xffc3), (0x41, 0xffc4), (0x42, 0xffc5), (0x43, 0xffc6), (0x44, 0xffc7),
    (0x57, 0xffc8), // F11
    (0x58, 0xffc9), // F12
];

/// Extended (E0-prefixed) scancode -> X11 keysym.
#[rustfmt::skip]
const EXTENDED_TABLE: &[(u8, u32)] = &[
    (0x1c, 0xff8d), // keypad enter
    (0x1d, 0xffe4), // control_r
    (0x38, 0xffea), // alt_r
    (0x47, 0xff50), // home
    (0x48, 0xff52), // up
    (0x49, 0xff55), // page_up
    (0x4b, 0xff51), // left
    (0x4d, 0xff53), // right
    (0x4f, 0xff57), // end
    (0x50, 0xff54), // down
    (0x51, 0xff56), // page_down
    (0x52, 0xff63), // insert
    (0x53, 0xffff), // delete
    (0x5b, 0xffeb), // super_l
    (0x5c, 0xffec), // super_r
];

/// Looks up the standard table entry for `(scancode, extended)`, returning
/// an X11 keysym if the main table covers this key.
#[must_use]
pub fn scancode_to_keysym(scancode: u8, extended: bool) -> Option<u32> {
    let table = if extended { EXTENDED_TABLE } else { BASE_TABLE };
    table
        .iter()
        .find(|&&(code, _)| code == scancode)
        .map(|&(_, keysym)| keysym)
}

const LMENU: u8 = 0x38;
const LCONTROL: u8 = 0x1d;
const LSHIFT: u8 = 0x2a;
const LWIN: u8 = 0x5b;

/// Handles the small set of keys where left/right variant selection depends
/// on the extended flag rather than a distinct scancode, mirroring
/// `drd_x11_input_lookup_special_keycode`.
#[must_use]
pub fn special_key_keysym(scancode: u8, extended: bool) -> Option<u32> {
    match scancode {
        LMENU => Some(if extended { 0xffea } else { 0xffe9 }),
        LCONTROL => Some(if extended { 0xffe4 } else { 0xffe3 }),
        LSHIFT => Some(if extended { 0xffe2 } else { 0xffe1 }),
        LWIN => Some(if extended { 0xffec } else { 0xffeb }),
        _ => None,
    }
}

/// Maps a Unicode codepoint to an X11 keysym, mirroring
/// `drd_x11_input_keysym_from_codepoint`: a handful of control characters,
/// Latin-1 passthrough, then the Unicode keysym range (codepoint | 0x01000000).
#[must_use]
pub fn keysym_from_codepoint(codepoint: u32) -> Option<u32> {
    match codepoint {
        0x0d => return Some(0xff0d), // Return
        0x0a => return Some(0xff0a), // Linefeed
        0x09 => return Some(0xff09), // Tab
        0x08 => return Some(0xff08), // BackSpace
        _ => {}
    }
    if codepoint <= 0xff {
        return Some(codepoint);
    }
    if codepoint > 0 && codepoint <= 0x0010_ffff {
        return Some(codepoint | 0x0100_0000);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_plain_letters() {
        assert_eq!(scancode_to_keysym(0x1e, false), Some(0x0061)); // 'a'
    }

    #[test]
    fn resolves_extended_arrow_keys() {
        assert_eq!(scancode_to_keysym(0x4b, true), Some(0xff51)); // left
        assert_eq!(scancode_to_keysym(0x4b, false), None);
    }

    #[test]
    fn unmapped_scancode_returns_none() {
        assert_eq!(scancode_to_keysym(0xee, false), None);
    }

    #[test]
    fn special_keys_pick_left_or_right_variant() {
        assert_eq!(special_key_keysym(LCONTROL, false), Some(0xffe3));
        assert_eq!(special_key_keysym(LCONTROL, true), Some(0xffe4));
    }

    #[test]
    fn codepoint_mapping_covers_ascii_and_supplementary_planes() {
        assert_eq!(keysym_from_codepoint('A' as u32), Some('A' as u32));
        assert_eq!(keysym_from_codepoint(0x1f600), Some(0x1f600 | 0x0100_0000));
        assert_eq!(keysym_from_codepoint(0x0d), Some(0xff0d));
    }
}
