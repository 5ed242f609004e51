//! VGA text-mode console
//!
//! An 80×25 array of (character, attribute) cells at physical 0xB8000,
//! reached through the low-memory window. Bytes are displayed verbatim;
//! `\n` advances the line and scrolls. Output past the right edge is
//! dropped rather than wrapped.

use core::fmt;

use spin::Mutex;

use crate::mm::LOW_MEM_BASE;

const WIDTH: usize = 80;
const HEIGHT: usize = 25;
const ATTRIBUTE: u16 = 0x0700; // light grey on black

fn buffer() -> *mut u16 {
    (LOW_MEM_BASE + 0xB8000) as *mut u16
}

/// Cursor state over the text buffer.
pub struct Console {
    column: usize,
    row: usize,
}

impl Console {
    const fn new() -> Self {
        Self { column: 0, row: 0 }
    }

    /// Place the cursor where the loader left it.
    pub fn set_cursor(&mut self, column: usize, row: usize) {
        self.column = column.min(WIDTH - 1);
        self.row = row.min(HEIGHT - 1);
    }

    pub fn clear(&mut self) {
        // SAFETY: the text buffer is always mapped in the low-mem window.
        unsafe {
            for i in 0..WIDTH * HEIGHT {
                buffer().add(i).write_volatile(ATTRIBUTE);
            }
        }
        self.column = 0;
        self.row = 0;
    }

    pub fn put_byte(&mut self, byte: u8) {
        if byte == b'\n' {
            self.column = 0;
            self.row += 1;
            if self.row == HEIGHT {
                self.scroll();
                self.row = HEIGHT - 1;
            }
            return;
        }
        if self.column < WIDTH {
            // SAFETY: row/column are kept in bounds.
            unsafe {
                buffer()
                    .add(self.row * WIDTH + self.column)
                    .write_volatile(ATTRIBUTE | u16::from(byte));
            }
        }
        self.column += 1;
    }

    fn scroll(&mut self) {
        // SAFETY: moves rows 1..25 up one line, then blanks the last row.
        unsafe {
            core::ptr::copy(buffer().add(WIDTH), buffer(), WIDTH * (HEIGHT - 1));
            for i in 0..WIDTH {
                buffer().add(WIDTH * (HEIGHT - 1) + i).write_volatile(ATTRIBUTE);
            }
        }
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.put_byte(byte);
        }
        Ok(())
    }
}

static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Seed the cursor from the loader's handoff (column in the low byte,
/// row above it).
pub fn init(cursor_pos: i32) {
    let mut console = CONSOLE.lock();
    console.set_cursor((cursor_pos & 0xFF) as usize, ((cursor_pos >> 8) & 0xFF) as usize);
}

/// Raw byte sink for the `write` syscall (fd 1).
pub fn write_bytes(bytes: &[u8]) {
    let mut console = CONSOLE.lock();
    for &byte in bytes {
        console.put_byte(byte);
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    // The console lock is held across the whole format to keep lines
    // from interleaving with IRQ-context output.
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Break the console lock so the panic report can get out even when the
/// panic interrupted a print.
///
/// # Safety
///
/// Panic path only; the previous lock holder must never run again.
pub unsafe fn force_unlock() {
    // SAFETY: contract forwarded to the caller.
    unsafe { CONSOLE.force_unlock() };
}
