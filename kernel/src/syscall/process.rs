//! Process-control syscalls: exit, yield, fork, exec
//!
//! These need more than their five register arguments: they reschedule
//! or rewrite the caller's trap frame. The dispatcher parks a pointer to
//! the live frame here for the duration of the call, mirroring the fact
//! that the frame on the kernel stack *is* the thread while it is in the
//! kernel.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::arch::TrapFrame;

static ACTIVE_FRAME: AtomicPtr<TrapFrame> = AtomicPtr::new(ptr::null_mut());

pub(super) fn enter(frame: &mut TrapFrame) {
    ACTIVE_FRAME.store(frame, Ordering::Relaxed);
}

pub(super) fn leave() {
    ACTIVE_FRAME.store(ptr::null_mut(), Ordering::Relaxed);
}

#[cfg(target_arch = "x86")]
fn active_frame<'a>() -> &'a mut TrapFrame {
    let frame = ACTIVE_FRAME.load(Ordering::Relaxed);
    assert!(!frame.is_null(), "syscall handler outside dispatch");
    // SAFETY: dispatch stored a pointer to the live trap frame on the
    // kernel stack and clears it again after the handler returns; the
    // kernel is not reentrant through the syscall gate.
    unsafe { &mut *frame }
}

#[cfg(target_arch = "x86")]
pub fn sys_exit(code: u32, _: u32, _: u32, _: u32, _: u32) -> u32 {
    crate::sched::exit_current(code as i32)
}

#[cfg(target_arch = "x86")]
pub fn sys_yield(_: u32, _: u32, _: u32, _: u32, _: u32) -> u32 {
    let frame = active_frame();
    // The saved frame is what a switched-away caller resumes from, so
    // the return value has to be in place before the switch.
    frame.set_return(0);
    crate::sched::yield_current(frame)
}

#[cfg(target_arch = "x86")]
pub fn sys_fork(_: u32, _: u32, _: u32, _: u32, _: u32) -> u32 {
    crate::sched::fork_current(active_frame())
}

/// Replace the calling thread's image with a fresh executable.
///
/// Everything that can fail is checked before the point of no return;
/// after the address-space swap the old image is gone and the only way
/// out is into the new entry point. Swapping spaces mid-syscall is safe
/// because the kernel region (and with it this stack) is mapped
/// identically in every space.
#[cfg(target_arch = "x86")]
pub fn sys_exec(path_ptr: u32, _: u32, _: u32, _: u32, _: u32) -> u32 {
    use crate::mm::{address_space, user, USER_STACK_TOP};
    use crate::{elf, fs, sched};

    let mut path_buf = [0u8; user::MAX_PATH];
    // SAFETY: running on the caller's address space.
    let Ok(path) = (unsafe { user::user_cstr(path_ptr, &mut path_buf) }) else {
        return u32::MAX;
    };
    let Ok(image) = fs::read_file(path) else {
        log::warn!("exec: {path} not found");
        return u32::MAX;
    };
    let parsed = match elf::parse(&image) {
        Ok(parsed) => parsed,
        Err(err) => {
            log::warn!("exec: {path}: {err}");
            return u32::MAX;
        }
    };
    if parsed
        .segments
        .iter()
        .any(|seg| user::check_range(seg.vaddr, seg.mem_size).is_err())
    {
        log::warn!("exec: {path}: segment outside user space");
        return u32::MAX;
    }

    log::info!("exec {path} ({} bytes)", image.len());

    // Point of no return: give the thread a fresh space and drop the old
    // one once we are off it.
    let new_dir = address_space::create();
    let old_dir = sched::with_table(|table| {
        let thread = table.get_mut(sched::current_tid());
        core::mem::replace(&mut thread.dir, new_dir)
    });
    address_space::schedule_reap(old_dir);
    // SAFETY: new_dir is a fresh directory with the shared kernel region.
    unsafe {
        address_space::switch_to(new_dir);
    }

    let entry = elf::load_into_current(&image).expect("validated image failed to load");
    sched::exec_current(entry, USER_STACK_TOP)
}
