//! Preemptive thread scheduler
//!
//! One CPU, one Running thread. Kernel paths run to completion: the only
//! places a different thread can be chosen are the explicit calls in
//! `yield`/`fork`/`exit`/segv handling and the tail of the IRQ handler
//! (the single preemption point for user code). A context switch is
//! "exit to thread" — the caller has already saved its state, the target
//! frame is loaded, and the switch never returns.

pub mod scheduler;
pub mod task;

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

pub use scheduler::{pick_next, Lcg};
pub use task::{Thread, ThreadState, ThreadTable, MAX_FDS, MAX_THREADS};

/// The thread table. Slot 0 is the idle thread.
static THREADS: Mutex<ThreadTable> = Mutex::new(ThreadTable::new());

/// PRNG feeding the reservoir picker.
static RNG: Mutex<Lcg> = Mutex::new(Lcg::new());

/// Table index of the Running thread.
static CURRENT: AtomicUsize = AtomicUsize::new(0);

/// Id of the running thread.
pub fn current_tid() -> usize {
    CURRENT.load(Ordering::Relaxed)
}

/// Run `f` with the thread table locked.
pub fn with_table<R>(f: impl FnOnce(&mut ThreadTable) -> R) -> R {
    f(&mut THREADS.lock())
}

#[cfg(target_arch = "x86")]
pub use control::*;

#[cfg(target_arch = "x86")]
mod control {
    use super::*;
    use crate::arch::TrapFrame;
    use crate::mm::{address_space, FrameIndex, VirtAddr};
    use crate::time;

    /// Create the idle thread in slot 0, running the architecture's halt
    /// loop on the boot address space.
    pub fn spawn_idle(kernel_dir: FrameIndex) {
        let mut table = THREADS.lock();
        let tid = table
            .create(None, kernel_dir, true, time::ticks())
            .expect("thread table empty at boot");
        assert_eq!(tid, 0, "idle thread must be slot 0");
        table.get_mut(tid).frame = crate::arch::x86::idle_frame();
    }

    /// Create the init thread (slot 1, pid 1) on its own address space.
    pub fn spawn_init(dir: FrameIndex, entry: u32, stack_top: u32) -> usize {
        let mut table = THREADS.lock();
        let tid = table
            .create(None, dir, true, time::ticks())
            .expect("thread table full at boot");
        assert_eq!(tid, 1, "init thread must be slot 1");
        table.get_mut(tid).frame = TrapFrame::user(entry, stack_top);
        tid
    }

    /// Leave bootstrap: hand the CPU to the init thread.
    pub fn start() -> ! {
        exit_to(1)
    }

    /// Pick the next thread and switch to it.
    ///
    /// Returns normally only when every other thread is unrunnable and
    /// either the caller may keep running (`!must_switch`) or the caller
    /// is the idle thread itself. Otherwise this exits to the chosen
    /// thread (falling back to idle) and never returns.
    pub fn schedule(current: usize, must_switch: bool) {
        let next = {
            let table = THREADS.lock();
            let mut rng = RNG.lock();
            pick_next(&table, &mut rng, current)
        };
        let next = match next {
            Some(tid) => tid,
            None => {
                if !must_switch || current == 0 {
                    return;
                }
                0
            }
        };
        exit_to(next)
    }

    /// Switch to `tid`: install its address space (reaping any directory
    /// a dying thread left behind), mark it Running, and load its frame.
    fn exit_to(tid: usize) -> ! {
        let (frame, dir) = {
            let mut table = THREADS.lock();
            let thread = table.get_mut(tid);
            debug_assert_eq!(thread.state, ThreadState::Ready);
            thread.state = ThreadState::Running;
            (thread.frame, thread.dir)
        };
        CURRENT.store(tid, Ordering::Relaxed);
        // SAFETY: `dir` is a live directory owned by `tid`; the frame was
        // saved by the thread's own trap entry (or built by spawn_*).
        unsafe {
            address_space::switch_to(dir);
            crate::arch::x86::entry::exit_to_frame(&frame)
        }
    }

    /// The `yield` operation: give up the CPU voluntarily.
    pub fn yield_current(frame: &TrapFrame) -> u32 {
        let tid = current_tid();
        {
            let mut table = THREADS.lock();
            let thread = table.get_mut(tid);
            thread.frame = *frame;
            thread.state = ThreadState::Ready;
        }
        schedule(tid, false);
        // Nobody else was runnable; keep going.
        THREADS.lock().get_mut(tid).state = ThreadState::Running;
        0
    }

    /// Preemption point at IRQ return: if the interrupted context is user
    /// mode and another thread is Ready, yield on its behalf.
    pub fn maybe_preempt(frame: &TrapFrame) {
        if !frame.is_user() {
            return;
        }
        let tid = current_tid();
        if THREADS.lock().has_ready_other_than(tid) {
            let _ = yield_current(frame);
        }
    }

    /// The `fork` operation: duplicate the address space copy-on-write
    /// and register the child with the parent's saved frame, returning 0
    /// in the child and the child's tid in the parent.
    pub fn fork_current(frame: &TrapFrame) -> u32 {
        let parent = current_tid();
        let dir = address_space::fork_current();
        let child = {
            let mut table = THREADS.lock();
            match table.create(Some(parent), dir, true, time::ticks()) {
                Ok(child) => {
                    let thread = table.get_mut(child);
                    thread.frame = *frame;
                    thread.frame.set_return(0);
                    Some(child)
                }
                Err(err) => {
                    log::warn!("fork failed: {err}");
                    None
                }
            }
        };
        match child {
            Some(child) => child as u32,
            None => {
                address_space::destroy(dir);
                u32::MAX
            }
        }
    }

    /// The `exit` operation. Records the exit code for the parent,
    /// releases the address space (after the switch away from it), and
    /// never returns.
    pub fn exit_current(code: i32) -> ! {
        let tid = current_tid();
        assert_ne!(tid, 0, "idle thread cannot exit");
        if THREADS.lock().get(tid).pid == 1 {
            panic!("init exited with code {code}");
        }
        let dir = {
            let mut table = THREADS.lock();
            // Children nobody will ever collect go with us.
            release_zombies_of(&mut table, tid);
            let parent = table.get(tid).parent;
            let keep_zombie = table.parent_alive(parent);
            let thread = table.get_mut(tid);
            thread.exit_code = code;
            thread.state = if keep_zombie {
                ThreadState::Zombie
            } else {
                ThreadState::Unused
            };
            thread.dir
        };
        log::info!("thread {tid} exited with code {code}");
        address_space::schedule_reap(dir);
        schedule(tid, true);
        unreachable!("exit_current returned from schedule");
    }

    fn release_zombies_of(table: &mut ThreadTable, parent: usize) {
        for tid in 1..MAX_THREADS {
            let t = table.get_mut(tid);
            if t.state == ThreadState::Zombie && t.parent == Some(parent) {
                t.state = ThreadState::Unused;
            }
        }
    }

    /// Restart the current thread at a new entry point on its (already
    /// swapped) address space; the tail of `exec`.
    pub fn exec_current(entry: u32, stack_top: u32) -> ! {
        let tid = current_tid();
        {
            let mut table = THREADS.lock();
            let thread = table.get_mut(tid);
            thread.frame = TrapFrame::user(entry, stack_top);
            thread.state = ThreadState::Ready;
        }
        exit_to(tid)
    }

    /// Deliver a segmentation fault to a thread. Fatal for init; for
    /// anybody else the thread dies and the system keeps going.
    pub fn signal(tid: usize, fault_addr: VirtAddr) {
        let (pid, is_current) = {
            let table = THREADS.lock();
            (table.get(tid).pid, tid == current_tid())
        };
        if pid == 1 {
            panic!("segmentation fault in init (thread {tid}) at {fault_addr}");
        }
        log::warn!("segmentation fault in thread {tid} at {fault_addr}");
        if is_current {
            let dir = {
                let mut table = THREADS.lock();
                let thread = table.get_mut(tid);
                thread.state = ThreadState::Unused;
                thread.dir
            };
            address_space::schedule_reap(dir);
            schedule(tid, true);
            unreachable!("signalled thread kept running");
        } else {
            THREADS.lock().get_mut(tid).state = ThreadState::Zombie;
        }
    }
}
