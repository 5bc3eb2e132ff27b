/* Static translation between device key ids and Linux input event codes.
 *
 * Key ids in the main block are USB HID keyboard usages; the multimedia
 * block uses consumer-page usages truncated to one byte. Special blocks
 * (GKeys, logo, mode keys) have no input-event equivalent and only get
 * synthesised names. */

use crate::device::features::{BLOCK_GKEYS, BLOCK_KEYS, BLOCK_LOGO, BLOCK_MODES, BLOCK_MULTIMEDIA};

/* (hid usage, evdev code, name) for the main key block */
static KEYS: &[(u8, u32, &str)] = &[
    (0x04, 30, "A"),
    (0x05, 48, "B"),
    (0x06, 46, "C"),
    (0x07, 32, "D"),
    (0x08, 18, "E"),
    (0x09, 33, "F"),
    (0x0a, 34, "G"),
    (0x0b, 35, "H"),
    (0x0c, 23, "I"),
    (0x0d, 36, "J"),
    (0x0e, 37, "K"),
    (0x0f, 38, "L"),
    (0x10, 50, "M"),
    (0x11, 49, "N"),
    (0x12, 24, "O"),
    (0x13, 25, "P"),
    (0x14, 16, "Q"),
    (0x15, 19, "R"),
    (0x16, 31, "S"),
    (0x17, 20, "T"),
    (0x18, 22, "U"),
    (0x19, 47, "V"),
    (0x1a, 17, "W"),
    (0x1b, 45, "X"),
    (0x1c, 21, "Y"),
    (0x1d, 44, "Z"),
    (0x1e, 2, "1"),
    (0x1f, 3, "2"),
    (0x20, 4, "3"),
    (0x21, 5, "4"),
    (0x22, 6, "5"),
    (0x23, 7, "6"),
    (0x24, 8, "7"),
    (0x25, 9, "8"),
    (0x26, 10, "9"),
    (0x27, 11, "0"),
    (0x28, 28, "ENTER"),
    (0x29, 1, "ESC"),
    (0x2a, 14, "BACKSPACE"),
    (0x2b, 15, "TAB"),
    (0x2c, 57, "SPACE"),
    (0x2d, 12, "MINUS"),
    (0x2e, 13, "EQUAL"),
    (0x2f, 26, "LBRACE"),
    (0x30, 27, "RBRACE"),
    (0x31, 43, "BACKSLASH"),
    (0x33, 39, "SEMICOLON"),
    (0x34, 40, "QUOTE"),
    (0x35, 41, "GRAVE"),
    (0x36, 51, "COMMA"),
    (0x37, 52, "DOT"),
    (0x38, 53, "SLASH"),
    (0x39, 58, "CAPSLOCK"),
    (0x3a, 59, "F1"),
    (0x3b, 60, "F2"),
    (0x3c, 61, "F3"),
    (0x3d, 62, "F4"),
    (0x3e, 63, "F5"),
    (0x3f, 64, "F6"),
    (0x40, 65, "F7"),
    (0x41, 66, "F8"),
    (0x42, 67, "F9"),
    (0x43, 68, "F10"),
    (0x44, 87, "F11"),
    (0x45, 88, "F12"),
    (0x46, 99, "PRINT"),
    (0x47, 70, "SCROLLLOCK"),
    (0x48, 119, "PAUSE"),
    (0x49, 110, "INSERT"),
    (0x4a, 102, "HOME"),
    (0x4b, 104, "PGUP"),
    (0x4c, 111, "DELETE"),
    (0x4d, 107, "END"),
    (0x4e, 109, "PGDOWN"),
    (0x4f, 106, "RIGHT"),
    (0x50, 105, "LEFT"),
    (0x51, 108, "DOWN"),
    (0x52, 103, "UP"),
    (0x53, 69, "NUMLOCK"),
    (0x54, 98, "KPSLASH"),
    (0x55, 55, "KPASTERISK"),
    (0x56, 74, "KPMINUS"),
    (0x57, 78, "KPPLUS"),
    (0x58, 96, "KPENTER"),
    (0x59, 79, "KP1"),
    (0x5a, 80, "KP2"),
    (0x5b, 81, "KP3"),
    (0x5c, 75, "KP4"),
    (0x5d, 76, "KP5"),
    (0x5e, 77, "KP6"),
    (0x5f, 71, "KP7"),
    (0x60, 72, "KP8"),
    (0x61, 73, "KP9"),
    (0x62, 82, "KP0"),
    (0x63, 83, "KPDOT"),
    (0x64, 86, "102ND"),
    (0x65, 127, "COMPOSE"),
    (0xe0, 29, "LCTRL"),
    (0xe1, 42, "LSHIFT"),
    (0xe2, 56, "LALT"),
    (0xe3, 125, "LMETA"),
    (0xe4, 97, "RCTRL"),
    (0xe5, 54, "RSHIFT"),
    (0xe6, 100, "RALT"),
    (0xe7, 126, "RMETA"),
];

/* (consumer usage low byte, evdev code, name) for the multimedia block */
static MULTIMEDIA: &[(u8, u32, &str)] = &[
    (0xb5, 163, "NEXT"),
    (0xb6, 165, "PREVIOUS"),
    (0xb7, 166, "STOP"),
    (0xcd, 164, "PLAY"),
    (0xe2, 113, "MUTE"),
    (0xe9, 115, "VOLUMEUP"),
    (0xea, 114, "VOLUMEDOWN"),
];

/* Linux input event code for a device key, 0 when none exists. */
pub fn keycode(block_id: u16, key_id: u8) -> u32 {
    let table = match block_id {
        BLOCK_KEYS => KEYS,
        BLOCK_MULTIMEDIA => MULTIMEDIA,
        _ => return 0,
    };
    table
        .iter()
        .find(|(id, _, _)| *id == key_id)
        .map(|(_, code, _)| *code)
        .unwrap_or(0)
}

/* Fallback display name for a device key. */
pub fn key_name(block_id: u16, key_id: u8) -> String {
    let table = match block_id {
        BLOCK_KEYS => Some(KEYS),
        BLOCK_MULTIMEDIA => Some(MULTIMEDIA),
        _ => None,
    };
    if let Some(table) = table {
        if let Some((_, _, name)) = table.iter().find(|(id, _, _)| *id == key_id) {
            return (*name).to_string();
        }
    }
    match block_id {
        BLOCK_GKEYS => format!("G{key_id}"),
        BLOCK_LOGO => format!("LOGO{key_id}"),
        BLOCK_MODES => format!("MODE{key_id}"),
        _ => format!("x{key_id:02x}"),
    }
}

/* Reverse lookup used by the control tool: name to (block, key id). */
pub fn key_by_name(name: &str) -> Option<(u16, u8)> {
    let upper = name.to_ascii_uppercase();
    if let Some((id, _, _)) = KEYS.iter().find(|(_, _, n)| *n == upper) {
        return Some((BLOCK_KEYS, *id));
    }
    if let Some((id, _, _)) = MULTIMEDIA.iter().find(|(_, _, n)| *n == upper) {
        return Some((BLOCK_MULTIMEDIA, *id));
    }
    if let Some(rest) = upper.strip_prefix('G') {
        if let Ok(id) = rest.parse::<u8>() {
            return Some((BLOCK_GKEYS, id));
        }
    }
    if let Some(rest) = upper.strip_prefix("LOGO") {
        if let Ok(id) = rest.parse::<u8>() {
            return Some((BLOCK_LOGO, id));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_translate_to_evdev() {
        assert_eq!(keycode(BLOCK_KEYS, 0x04), 30); /* KEY_A */
        assert_eq!(keycode(BLOCK_KEYS, 0x16), 31); /* KEY_S */
        assert_eq!(key_name(BLOCK_KEYS, 0x04), "A");
    }

    #[test]
    fn unknown_keys_get_hex_names() {
        assert_eq!(keycode(BLOCK_KEYS, 0xd0), 0);
        assert_eq!(key_name(BLOCK_KEYS, 0xd0), "xd0");
    }

    #[test]
    fn special_blocks_synthesise_names() {
        assert_eq!(key_name(BLOCK_GKEYS, 3), "G3");
        assert_eq!(key_name(BLOCK_LOGO, 1), "LOGO1");
        assert_eq!(keycode(BLOCK_GKEYS, 3), 0);
    }

    #[test]
    fn reverse_lookup() {
        assert_eq!(key_by_name("a"), Some((BLOCK_KEYS, 0x04)));
        assert_eq!(key_by_name("F12"), Some((BLOCK_KEYS, 0x45)));
        assert_eq!(key_by_name("G5"), Some((BLOCK_GKEYS, 5)));
        assert_eq!(key_by_name("play"), Some((BLOCK_MULTIMEDIA, 0xcd)));
        assert_eq!(key_by_name("NOPE"), None);
    }
}
