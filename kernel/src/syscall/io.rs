//! I/O syscalls: read, write, open
//!
//! fd 0 is the keyboard pipe, fd 1 the kernel console. Any other fd
//! reads from the ramdisk cursor — that is, from the most recently
//! opened file, matching `open`'s size-returning surface.

#[cfg(target_arch = "x86")]
use crate::drivers::keyboard;
#[cfg(target_arch = "x86")]
use crate::fs;
#[cfg(target_arch = "x86")]
use crate::mm::user;

#[cfg(target_arch = "x86")]
pub fn sys_read(fd: u32, buf: u32, len: u32, _: u32, _: u32) -> u32 {
    // SAFETY: running on the caller's address space; faults taken while
    // filling the buffer resolve through the ordinary COW path.
    let Ok(slice) = (unsafe { user::user_bytes_mut(buf, len as usize) }) else {
        return u32::MAX;
    };
    if fd == 0 {
        // Drain through a kernel bounce buffer: the user copy may page
        // fault, and neither the pipe lock nor the interrupt mask may be
        // held while that resolves (the keyboard IRQ takes both paths).
        let mut total = 0;
        let mut chunk = [0u8; 64];
        while total < slice.len() {
            let want = chunk.len().min(slice.len() - total);
            let got = crate::arch::x86::without_interrupts(|| {
                keyboard::KEY_PIPE.lock().read(&mut chunk[..want])
            });
            if got == 0 {
                break;
            }
            slice[total..total + got].copy_from_slice(&chunk[..got]);
            total += got;
        }
        total as u32
    } else {
        fs::read(slice) as u32
    }
}

#[cfg(target_arch = "x86")]
pub fn sys_write(fd: u32, buf: u32, len: u32, _: u32, _: u32) -> u32 {
    if fd != 1 {
        log::warn!("write to unsupported fd {fd}");
        return u32::MAX;
    }
    // SAFETY: running on the caller's address space.
    let Ok(slice) = (unsafe { user::user_bytes(buf, len as usize) }) else {
        return u32::MAX;
    };
    crate::arch::x86::vga::write_bytes(slice);
    len
}

/// Look a file up by exact name. Returns the file's *size*; the data is
/// then read with `read` on any fd > 0. (Historical surface, kept.)
#[cfg(target_arch = "x86")]
pub fn sys_open(path_ptr: u32, _: u32, _: u32, _: u32, _: u32) -> u32 {
    let mut path_buf = [0u8; user::MAX_PATH];
    // SAFETY: running on the caller's address space.
    let Ok(path) = (unsafe { user::user_cstr(path_ptr, &mut path_buf) }) else {
        return u32::MAX;
    };
    match fs::open(path) {
        Ok(size) => size as u32,
        Err(_) => u32::MAX,
    }
}
