//! PS/2 scancode set 1 decoding
//!
//! The IRQ handler feeds raw scancodes in; printable bytes come out into
//! the keyboard pipe the `read` syscall drains. Decoding tracks the
//! make/break state of every key in a bitmap and picks between the plain
//! and shifted US translation tables; a held caps-lock flips letter case
//! on top.

use spin::Mutex;

use crate::ipc::Pipe;

/// Decoded characters waiting for `read(0, ...)`.
pub static KEY_PIPE: Mutex<Pipe<1024>> = Mutex::new(Pipe::new());

static DECODER: Mutex<Decoder> = Mutex::new(Decoder::new());

/// Entry point for the keyboard IRQ handler.
pub fn handle_scancode(scancode: u8) {
    if let Some(byte) = DECODER.lock().process(scancode) {
        KEY_PIPE.lock().push(byte);
    }
}

const LSHIFT: u8 = 0x2A;
const RSHIFT: u8 = 0x36;
const CAPSLOCK: u8 = 0x3A;

/// US layout, unshifted. Zero marks keys that produce no byte.
#[rustfmt::skip]
static KBD_US: [u8; 128] = [
    0, 27, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0',
    b'-', b'=', 8 /* backspace */, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n',
    0 /* ctrl */,
    b'a', b's', b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`',
    0 /* left shift */, b'\\',
    b'z', b'x', b'c', b'v', b'b', b'n', b'm', b',', b'.', b'/',
    0 /* right shift */, b'*',
    0 /* alt */, b' ', 0 /* caps lock */,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, /* F1..F10 */
    0 /* num lock */, 0 /* scroll lock */,
    0 /* home */, 0 /* up */, 0 /* page up */, b'-',
    0 /* left */, 0, 0 /* right */, b'+',
    0 /* end */, 0 /* down */, 0 /* page down */, 0 /* insert */, 0 /* delete */,
    0, 0, 0, 0 /* F11 */, 0 /* F12 */,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// US layout with shift held.
#[rustfmt::skip]
static KBD_US_SHIFT: [u8; 128] = [
    0, 27, b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')',
    b'_', b'+', 8 /* backspace */, b'\t',
    b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', b'O', b'P', b'{', b'}', b'\n',
    0 /* ctrl */,
    b'A', b'S', b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':', b'"', b'~',
    0 /* left shift */, b'|',
    b'Z', b'X', b'C', b'V', b'B', b'N', b'M', b'<', b'>', b'?',
    0 /* right shift */, b'*',
    0 /* alt */, b' ', 0 /* caps lock */,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, /* F1..F10 */
    0 /* num lock */, 0 /* scroll lock */,
    0 /* home */, 0 /* up */, 0 /* page up */, b'-',
    0 /* left */, 0, 0 /* right */, b'+',
    0 /* end */, 0 /* down */, 0 /* page down */, 0 /* insert */, 0 /* delete */,
    0, 0, 0, 0 /* F11 */, 0 /* F12 */,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Scancode state machine: a make/break bitmap plus the two tables.
pub struct Decoder {
    key_state: [u8; 16],
}

impl Decoder {
    pub const fn new() -> Self {
        Self { key_state: [0; 16] }
    }

    fn is_down(&self, scancode: u8) -> bool {
        self.key_state[(scancode >> 3) as usize] & (1 << (scancode & 7)) != 0
    }

    /// Feed one scancode; returns the decoded byte for a printable make
    /// code, `None` for break codes and special keys.
    pub fn process(&mut self, scancode: u8) -> Option<u8> {
        let key = scancode & 0x7F;
        if scancode & 0x80 != 0 {
            self.key_state[(key >> 3) as usize] &= !(1 << (key & 7));
            return None;
        }
        self.key_state[(key >> 3) as usize] |= 1 << (key & 7);

        let shift = self.is_down(LSHIFT) || self.is_down(RSHIFT);
        let table = if shift { &KBD_US_SHIFT } else { &KBD_US };
        let mut byte = table[key as usize];
        if self.is_down(CAPSLOCK) && byte.is_ascii_alphabetic() {
            byte ^= 0x20;
        }
        (byte != 0).then_some(byte)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A_MAKE: u8 = 0x1E;
    const A_BREAK: u8 = 0x9E;

    #[test]
    fn plain_keys_translate() {
        let mut d = Decoder::new();
        assert_eq!(d.process(A_MAKE), Some(b'a'));
        assert_eq!(d.process(A_BREAK), None);
        assert_eq!(d.process(0x1C), Some(b'\n'));
        assert_eq!(d.process(0x39), Some(b' '));
    }

    #[test]
    fn shift_selects_the_second_table() {
        let mut d = Decoder::new();
        assert_eq!(d.process(LSHIFT), None);
        assert_eq!(d.process(A_MAKE), Some(b'A'));
        assert_eq!(d.process(0x02), Some(b'!'));
        // Releasing shift goes back to the plain table.
        assert_eq!(d.process(LSHIFT | 0x80), None);
        assert_eq!(d.process(A_MAKE), Some(b'a'));
        // Right shift works the same way.
        assert_eq!(d.process(RSHIFT), None);
        assert_eq!(d.process(A_MAKE), Some(b'A'));
    }

    #[test]
    fn held_caps_lock_flips_letters_only() {
        let mut d = Decoder::new();
        assert_eq!(d.process(CAPSLOCK), None);
        assert_eq!(d.process(A_MAKE), Some(b'A'));
        assert_eq!(d.process(0x02), Some(b'1'));
        // Shift + caps cancel out for letters.
        assert_eq!(d.process(LSHIFT), None);
        assert_eq!(d.process(A_MAKE), Some(b'a'));
    }

    #[test]
    fn special_keys_produce_nothing() {
        let mut d = Decoder::new();
        for sc in [0x3B /* F1 */, 0x48 /* up */, 0x1D /* ctrl */, 0x38 /* alt */] {
            assert_eq!(d.process(sc), None);
        }
    }
}
