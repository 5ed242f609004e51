//! Console print macros

#[cfg(target_arch = "x86")]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::arch::x86::vga::_print(format_args!($($arg)*)));
}

#[cfg(target_arch = "x86")]
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[cfg(target_arch = "x86")]
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => ($crate::arch::x86::serial::_print(format_args!($($arg)*)));
}

#[cfg(target_arch = "x86")]
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}

// Host builds (unit tests) have no console; the macros evaporate.
#[cfg(not(target_arch = "x86"))]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {};
}

#[cfg(not(target_arch = "x86"))]
#[macro_export]
macro_rules! println {
    ($($arg:tt)*) => {};
}

#[cfg(not(target_arch = "x86"))]
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {};
}

#[cfg(not(target_arch = "x86"))]
#[macro_export]
macro_rules! serial_println {
    ($($arg:tt)*) => {};
}
