//! Kernel binary: links the library (which carries the `_start` entry
//! stub) and provides the panic handler.

#![cfg_attr(target_arch = "x86", no_std)]
#![cfg_attr(target_arch = "x86", no_main)]

#[cfg(target_arch = "x86")]
use cobalt_kernel::{println, serial_println};

#[cfg(target_arch = "x86")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    // SAFETY: the machine is going down; stop taking interrupts and
    // break the console locks so the report gets out in one piece.
    unsafe {
        x86::irq::disable();
        cobalt_kernel::arch::x86::serial::force_unlock();
        cobalt_kernel::arch::x86::vga::force_unlock();
    }
    serial_println!("KERNEL PANIC: {info}");
    println!("\nKERNEL PANIC: {info}");
    cobalt_kernel::arch::x86::halt_loop()
}

// The bare-metal image has no `main`; `_start` lives in the library.
// This stub only exists so host builds of the workspace succeed.
#[cfg(not(target_arch = "x86"))]
fn main() {}
