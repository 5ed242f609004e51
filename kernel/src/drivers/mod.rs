//! Device support that is not architecture bring-up
//!
//! The VGA text console and the serial port live under `arch::x86` with
//! the port I/O they need; the scancode decoder is pure logic and lives
//! here.

pub mod keyboard;
