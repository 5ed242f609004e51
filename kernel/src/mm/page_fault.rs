//! Page-fault policy: privilege checks, lazy zero-fill, copy-on-write
//!
//! A present page that is not writable is in one of four states, and
//! together with the trivial writable state they form the state machine
//! the fault handler implements:
//!
//! | state | entry                    | shared | on write fault            |
//! |-------|--------------------------|--------|---------------------------|
//! | 1     | writable                 | no     | never faults              |
//! | 2     | read-only by user choice | no     | segv                      |
//! | 3     | read-only by user choice | yes    | segv                      |
//! | 4     | COW                      | no     | make writable in place    |
//! | 5     | COW                      | yes    | copy to a fresh frame     |
//!
//! The pinned zero page always counts as shared, so a write to a
//! zero-filled page resolves through state 5 like any other shared frame.
//!
//! A fault on an empty entry in user space is the lazy zero-fill path:
//! the shared zero page is installed read-only COW and the access
//! retries. Any other miss has no backing store and is fatal.

use super::{
    address_space::{Mapper, TableWindow},
    frame_allocator::RESERVED,
    page_table::{PageEntry, PageFaultCode, PageFlags},
    FrameIndex, VirtAddr, KERNEL_BASE,
};

/// What the architecture layer collected about a page fault.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    /// The faulting linear address (CR2).
    pub addr: VirtAddr,
    /// CPU error code.
    pub code: PageFaultCode,
    /// Instruction pointer at the time of the fault.
    pub ip: u32,
}

impl FaultInfo {
    fn is_user(&self) -> bool {
        self.code.contains(PageFaultCode::USER)
    }

    fn is_write(&self) -> bool {
        self.code.contains(PageFaultCode::WRITE)
    }

    fn is_present(&self) -> bool {
        self.code.contains(PageFaultCode::PRESENT)
    }
}

/// Resolution of a page fault that is not fatal to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The mapping was fixed up; flush the TLB and retry the access.
    Resolved,
    /// The faulting thread must be signalled.
    Segv,
}

/// Sharing state of a present page, the input to the write-fault policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowState {
    /// State 1: writable, exclusively owned.
    Writable,
    /// State 2: read-only by choice, exclusively owned.
    ReadOnlyExclusive,
    /// State 3: read-only by choice, shared.
    ReadOnlyShared,
    /// State 4: copy-on-write, exclusively owned.
    CowExclusive,
    /// State 5: copy-on-write, shared (or pinned, e.g. the zero page).
    CowShared,
}

impl CowState {
    /// Classify a present entry given the refcount of its frame.
    pub fn classify(entry: PageEntry, refcount: u8) -> Self {
        debug_assert!(entry.is_present());
        let shared = refcount > 1 || refcount == RESERVED;
        match (entry.is_writable(), entry.is_cow()) {
            (true, _) => Self::Writable,
            (false, true) if shared => Self::CowShared,
            (false, true) => Self::CowExclusive,
            (false, false) if shared => Self::ReadOnlyShared,
            (false, false) => Self::ReadOnlyExclusive,
        }
    }
}

/// Apply the fault policy to the space rooted at `dir`.
///
/// Returns how the fault was disposed of; conditions the design treats as
/// kernel bugs or unsatisfiable (no backing store) panic.
pub fn handle<W: TableWindow>(
    mapper: &mut Mapper<'_, W>,
    dir: FrameIndex,
    info: &FaultInfo,
    zero_frame: FrameIndex,
) -> FaultOutcome {
    // Null-pointer trap: the low 64 KiB are never mapped.
    if info.addr.is_null_trap() {
        if !info.is_user() {
            panic!(
                "kernel null dereference at {} from ip {:#010x}",
                info.addr, info.ip
            );
        }
        return FaultOutcome::Segv;
    }

    // User code reaching into the kernel region is a protection error, not
    // something the paging state machine should ever see.
    if info.is_user() && info.addr.as_u32() >= KERNEL_BASE {
        return FaultOutcome::Segv;
    }

    let entry = mapper.entry(dir, info.addr);

    if info.is_present() {
        // Bounds are fine, the page is mapped: the only legitimate cause
        // left is a write to a read-only page.
        if !info.is_write() || entry.is_writable() {
            panic!(
                "unexpected protection fault at {} (entry {:#010x}, code {:?}) from ip {:#010x}",
                info.addr,
                entry.as_raw(),
                info.code,
                info.ip
            );
        }

        match CowState::classify(entry, mapper.frames.refcount(entry.frame())) {
            CowState::Writable => unreachable!(),
            CowState::CowExclusive => {
                // Sole owner: flip the entry writable in place.
                mapper.set_entry(dir, info.addr, entry.as_writable());
                FaultOutcome::Resolved
            }
            CowState::CowShared => {
                let fresh = mapper.frames.alloc();
                mapper.win.copy_frame(fresh, entry.frame());
                mapper.frames.dec_share(entry.frame());
                let mut flags = PageFlags::WRITABLE;
                if entry.is_user() {
                    flags |= PageFlags::USER;
                }
                mapper.set_entry(dir, info.addr, PageEntry::new(fresh, flags));
                FaultOutcome::Resolved
            }
            CowState::ReadOnlyExclusive | CowState::ReadOnlyShared => {
                if info.is_user() {
                    FaultOutcome::Segv
                } else {
                    // The kernel never writes to pages the user made
                    // read-only on purpose.
                    panic!(
                        "kernel write to read-only page at {} from ip {:#010x}",
                        info.addr, info.ip
                    );
                }
            }
        }
    } else {
        // Miss. An empty entry in user space is backed by the zero page;
        // anything else has no backing store.
        if entry.is_unused() && info.addr.is_user() {
            mapper.frames.inc_share(zero_frame);
            mapper.set_entry(
                dir,
                info.addr,
                PageEntry::new(zero_frame, PageFlags::USER | PageFlags::COW),
            );
            FaultOutcome::Resolved
        } else {
            panic!(
                "unmapped address {} (entry {:#010x}, code {:?}) from ip {:#010x}",
                info.addr,
                entry.as_raw(),
                info.code,
                info.ip
            );
        }
    }
}

/// Entry from the trap table: collect CR2 and the error code, run the
/// policy, and turn a Segv into a signal on the faulting thread.
#[cfg(target_arch = "x86")]
pub fn handle_trap(frame: &mut crate::arch::TrapFrame) {
    use super::address_space;
    use crate::arch::x86::mmu;

    let addr = VirtAddr::new(mmu::fault_address());
    let info = FaultInfo {
        addr,
        code: PageFaultCode::from_bits_truncate(frame.err_code),
        ip: frame.eip,
    };
    match address_space::handle_current_fault(&info) {
        FaultOutcome::Resolved => {}
        FaultOutcome::Segv => {
            // Does not return for the running thread: it is dead and the
            // scheduler moves on.
            crate::sched::signal(crate::sched::current_tid(), addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::address_space::testing::{make_dir, test_allocator, FakeWindow};
    use crate::mm::FrameAllocator;

    const USER_PAGE: u32 = 0x10_0000;

    struct Env {
        win: FakeWindow,
        frames: FrameAllocator,
        dir: FrameIndex,
        zero: FrameIndex,
    }

    fn env() -> Env {
        let mut win = FakeWindow::new();
        let mut frames = test_allocator();
        let dir = make_dir(&mut win, &mut frames);
        // Pin a frame to act as the shared zero page.
        let zero = frames.alloc();
        frames.mark_reserved(zero, FrameIndex::new(zero.as_u32() + 1));
        Env {
            win,
            frames,
            dir,
            zero,
        }
    }

    impl Env {
        fn fault(&mut self, addr: u32, code: PageFaultCode) -> FaultOutcome {
            let mut mapper = Mapper::new(&mut self.win, &mut self.frames);
            handle(
                &mut mapper,
                self.dir,
                &FaultInfo {
                    addr: VirtAddr::new(addr),
                    code,
                    ip: 0x4_1000,
                },
                self.zero,
            )
        }

        fn map(&mut self, addr: u32, frame: FrameIndex, flags: PageFlags) {
            let mut mapper = Mapper::new(&mut self.win, &mut self.frames);
            mapper.set_entry(self.dir, VirtAddr::new(addr), PageEntry::new(frame, flags));
        }

        fn entry(&mut self, addr: u32) -> PageEntry {
            let mut mapper = Mapper::new(&mut self.win, &mut self.frames);
            mapper.entry(self.dir, VirtAddr::new(addr))
        }
    }

    #[test]
    fn cow_state_truth_table() {
        let rw = PageEntry::new(FrameIndex::new(2), PageFlags::WRITABLE | PageFlags::USER);
        let ro = PageEntry::new(FrameIndex::new(2), PageFlags::USER);
        let cow = PageEntry::new(FrameIndex::new(2), PageFlags::USER | PageFlags::COW);

        assert_eq!(CowState::classify(rw, 1), CowState::Writable);
        assert_eq!(CowState::classify(ro, 1), CowState::ReadOnlyExclusive);
        assert_eq!(CowState::classify(ro, 2), CowState::ReadOnlyShared);
        assert_eq!(CowState::classify(cow, 1), CowState::CowExclusive);
        assert_eq!(CowState::classify(cow, 2), CowState::CowShared);
        // Pinned frames (the zero page) always count as shared.
        assert_eq!(CowState::classify(cow, RESERVED), CowState::CowShared);
    }

    #[test]
    fn user_null_deref_is_segv() {
        let mut env = env();
        assert_eq!(
            env.fault(0x10, PageFaultCode::USER | PageFaultCode::WRITE),
            FaultOutcome::Segv
        );
    }

    #[test]
    #[should_panic(expected = "kernel null dereference")]
    fn kernel_null_deref_panics() {
        let mut env = env();
        let _ = env.fault(0x10, PageFaultCode::WRITE);
    }

    #[test]
    fn user_touching_kernel_space_is_segv() {
        let mut env = env();
        assert_eq!(
            env.fault(KERNEL_BASE + 0x1000, PageFaultCode::USER),
            FaultOutcome::Segv
        );
    }

    #[test]
    fn read_miss_installs_shared_zero_page() {
        let mut env = env();
        let free_before = env.frames.free_frames();

        assert_eq!(env.fault(USER_PAGE, PageFaultCode::USER), FaultOutcome::Resolved);

        let entry = env.entry(USER_PAGE);
        assert_eq!(entry.frame(), env.zero);
        assert!(entry.is_cow());
        assert!(!entry.is_writable());
        assert!(entry.is_user());
        // No frame left the free pool for the data page (the page-table
        // frame is the only allocation).
        assert_eq!(env.frames.free_frames(), free_before - 1);
        assert_eq!(env.frames.refcount(env.zero), RESERVED);
    }

    #[test]
    fn write_to_zero_page_copies_into_fresh_frame() {
        let mut env = env();
        // First touch: install the zero page...
        assert_eq!(
            env.fault(USER_PAGE, PageFaultCode::USER | PageFaultCode::WRITE),
            FaultOutcome::Resolved
        );
        // ...the retried write then faults as a present COW write.
        assert_eq!(
            env.fault(
                USER_PAGE,
                PageFaultCode::USER | PageFaultCode::WRITE | PageFaultCode::PRESENT
            ),
            FaultOutcome::Resolved
        );

        let entry = env.entry(USER_PAGE);
        assert_ne!(entry.frame(), env.zero);
        assert!(entry.is_writable());
        assert!(!entry.is_cow());
        assert!(entry.is_user());
        assert_eq!(env.frames.refcount(entry.frame()), 1);
        assert_eq!(env.frames.refcount(env.zero), RESERVED);
    }

    #[test]
    fn exclusive_cow_page_becomes_writable_in_place() {
        let mut env = env();
        let frame = env.frames.alloc();
        env.map(USER_PAGE, frame, PageFlags::USER | PageFlags::COW);

        assert_eq!(
            env.fault(
                USER_PAGE,
                PageFaultCode::USER | PageFaultCode::WRITE | PageFaultCode::PRESENT
            ),
            FaultOutcome::Resolved
        );

        let entry = env.entry(USER_PAGE);
        // Same frame, no copy: the sole owner just regains write access.
        assert_eq!(entry.frame(), frame);
        assert!(entry.is_writable());
        assert!(!entry.is_cow());
        assert_eq!(env.frames.refcount(frame), 1);
    }

    #[test]
    fn shared_cow_write_copies_and_drops_share() {
        let mut env = env();
        let frame = env.frames.alloc();
        env.frames.inc_share(frame);
        env.map(USER_PAGE, frame, PageFlags::USER | PageFlags::COW);
        env.win.write_byte(frame, 0, 0x41);

        assert_eq!(
            env.fault(
                USER_PAGE,
                PageFaultCode::USER | PageFaultCode::WRITE | PageFaultCode::PRESENT
            ),
            FaultOutcome::Resolved
        );

        let entry = env.entry(USER_PAGE);
        assert_ne!(entry.frame(), frame);
        assert!(entry.is_writable());
        // The copy carried the old contents.
        assert_eq!(env.win.read_byte(entry.frame(), 0), 0x41);
        // One share moved off the old frame.
        assert_eq!(env.frames.refcount(frame), 1);
        assert_eq!(env.frames.refcount(entry.frame()), 1);
    }

    #[test]
    fn write_to_deliberately_read_only_page_is_segv() {
        let mut env = env();
        let frame = env.frames.alloc();
        env.map(USER_PAGE, frame, PageFlags::USER);

        assert_eq!(
            env.fault(
                USER_PAGE,
                PageFaultCode::USER | PageFaultCode::WRITE | PageFaultCode::PRESENT
            ),
            FaultOutcome::Segv
        );
        // The mapping is untouched.
        let entry = env.entry(USER_PAGE);
        assert_eq!(entry.frame(), frame);
        assert!(!entry.is_writable());
    }

    #[test]
    #[should_panic(expected = "kernel write to read-only page")]
    fn kernel_write_to_read_only_page_panics() {
        let mut env = env();
        let frame = env.frames.alloc();
        env.map(USER_PAGE, frame, PageFlags::USER);
        let _ = env.fault(USER_PAGE, PageFaultCode::WRITE | PageFaultCode::PRESENT);
    }

    #[test]
    #[should_panic(expected = "unmapped address")]
    fn miss_outside_user_space_panics() {
        let mut env = env();
        let _ = env.fault(KERNEL_BASE + 0x1000, PageFaultCode::WRITE);
    }
}
