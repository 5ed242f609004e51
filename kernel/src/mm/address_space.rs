//! Address spaces: creation, copy-on-write fork, destruction
//!
//! An address space is a page-directory frame plus the user page tables
//! reachable from it. The kernel region (directory slots 1020..=1023) is
//! shared by every space; only the user slots differ. Every directory
//! keeps the recursive invariant: its last slot points at the directory
//! frame itself, so the running space exposes all of its tables through
//! the fixed window at [`PAGE_TAB_WINDOW`](super::PAGE_TAB_WINDOW).
//!
//! The walk code itself never dereferences frames directly. It goes
//! through the [`TableWindow`] seam: on the target this is a pair of
//! scratch mappings in the low-memory window, in tests it is plain heap
//! memory, which lets the fork/COW machinery run under `cargo test`.

use alloc::vec::Vec;

use super::{
    page_table::{PageEntry, PageFlags, PageTable, PAGE_TABLE_ENTRIES},
    FrameAllocator, FrameIndex, VirtAddr, KERNEL_DIR_SLOT, RECURSIVE_SLOT,
};

/// Access to physical frames holding page tables.
///
/// `table_mut` borrows the caller for the lifetime of the returned table,
/// so at most one frame is viewed at a time; implementations may back the
/// view with a single remappable scratch slot.
pub trait TableWindow {
    /// View `frame` as a page table.
    fn table_mut(&mut self, frame: FrameIndex) -> &mut PageTable;

    /// Copy one frame's 4 KiB of contents into another.
    fn copy_frame(&mut self, dst: FrameIndex, src: FrameIndex);

    /// Zero-fill a frame.
    fn zero_frame(&mut self, frame: FrameIndex);
}

/// Page-table walker bundling the window and the frame allocator.
///
/// All address-space mutation funnels through this type; it owns no state
/// of its own and can be constructed freshly for each operation.
pub struct Mapper<'a, W: TableWindow> {
    pub win: &'a mut W,
    pub frames: &'a mut FrameAllocator,
}

impl<'a, W: TableWindow> Mapper<'a, W> {
    pub fn new(win: &'a mut W, frames: &'a mut FrameAllocator) -> Self {
        Self { win, frames }
    }

    /// Read the leaf entry for `vaddr` in the space rooted at `dir`.
    /// Returns the empty entry when the covering page table is absent.
    pub fn entry(&mut self, dir: FrameIndex, vaddr: VirtAddr) -> PageEntry {
        let slot = self.win.table_mut(dir)[vaddr.dir_slot()];
        if !slot.is_present() {
            return PageEntry::empty();
        }
        self.win.table_mut(slot.frame())[vaddr.table_slot()]
    }

    /// Write the leaf entry for `vaddr`, materializing the covering page
    /// table on first use. The directory-level user bit follows the
    /// privilege invariant: user slots carry USER, kernel slots do not.
    pub fn set_entry(&mut self, dir: FrameIndex, vaddr: VirtAddr, entry: PageEntry) {
        let dir_slot = vaddr.dir_slot();
        let slot = self.win.table_mut(dir)[dir_slot];
        let table = if slot.is_present() {
            slot.frame()
        } else {
            let table = self.frames.alloc();
            self.win.zero_frame(table);
            let flags = if dir_slot < KERNEL_DIR_SLOT {
                PageFlags::WRITABLE | PageFlags::USER
            } else {
                PageFlags::WRITABLE
            };
            self.win.table_mut(dir)[dir_slot] = PageEntry::new(table, flags);
            table
        };
        self.win.table_mut(table)[vaddr.table_slot()] = entry;
    }

    /// Copy the kernel-region directory slots from `template` into `dir`
    /// and re-establish the recursive self-mapping.
    pub fn clone_kernel_region(&mut self, dir: FrameIndex, template: FrameIndex) {
        let mut kernel_slots = [PageEntry::empty(); PAGE_TABLE_ENTRIES - KERNEL_DIR_SLOT];
        {
            let src = self.win.table_mut(template);
            for (i, slot) in kernel_slots.iter_mut().enumerate() {
                *slot = src[KERNEL_DIR_SLOT + i];
            }
        }
        let dst = self.win.table_mut(dir);
        for (i, slot) in kernel_slots.iter().enumerate() {
            dst[KERNEL_DIR_SLOT + i] = *slot;
        }
        dst[RECURSIVE_SLOT] = PageEntry::new(dir, PageFlags::WRITABLE);
    }

    /// Duplicate the user region of `src_dir` into `dst_dir` (whose user
    /// slots must be empty), sharing every data frame and marking both
    /// copies of each writable page copy-on-write.
    ///
    /// Page-table pages are not shared: the child gets its own freshly
    /// allocated hierarchy so that later faults in either space stay
    /// private to it.
    pub fn fork_user(&mut self, src_dir: FrameIndex, dst_dir: FrameIndex) {
        for dir_slot in 0..KERNEL_DIR_SLOT {
            let slot = self.win.table_mut(src_dir)[dir_slot];
            if !slot.is_present() {
                continue;
            }

            let child_table = self.frames.alloc();
            self.win.zero_frame(child_table);

            let parent_table = slot.frame();
            for i in 0..PAGE_TABLE_ENTRIES {
                let entry = self.win.table_mut(parent_table)[i];
                if !entry.is_present() {
                    continue;
                }
                self.frames.inc_share(entry.frame());
                let shared = if entry.is_writable() {
                    let cow = entry.as_cow();
                    self.win.table_mut(parent_table)[i] = cow;
                    cow
                } else {
                    entry
                };
                self.win.table_mut(child_table)[i] = shared;
            }

            let flags = slot.flags() & (PageFlags::WRITABLE | PageFlags::USER);
            self.win.table_mut(dst_dir)[dir_slot] = PageEntry::new(child_table, flags);
        }
    }

    /// Tear down the user region of `dir`: drop one reference from every
    /// mapped data frame, free the page-table frames, and clear the user
    /// slots. The kernel slots survive so the directory frame can be
    /// recycled without re-initialization.
    pub fn destroy_user(&mut self, dir: FrameIndex) {
        for dir_slot in 0..KERNEL_DIR_SLOT {
            let slot = self.win.table_mut(dir)[dir_slot];
            if !slot.is_present() {
                continue;
            }
            let table = slot.frame();
            for i in 0..PAGE_TABLE_ENTRIES {
                let entry = self.win.table_mut(table)[i];
                if entry.is_present() {
                    self.frames.dec_share(entry.frame());
                }
            }
            self.frames.dec_share(table);
            self.win.table_mut(dir)[dir_slot] = PageEntry::empty();
        }
    }

    /// Number of distinct present user leaf entries (diagnostics/tests).
    pub fn count_user_pages(&mut self, dir: FrameIndex) -> usize {
        let mut count = 0;
        for dir_slot in 0..KERNEL_DIR_SLOT {
            let slot = self.win.table_mut(dir)[dir_slot];
            if !slot.is_present() {
                continue;
            }
            let table = slot.frame();
            for i in 0..PAGE_TABLE_ENTRIES {
                if self.win.table_mut(table)[i].is_present() {
                    count += 1;
                }
            }
        }
        count
    }
}

/// Cache of retired directory frames.
///
/// A destroyed directory still has valid kernel slots and cleared user
/// slots, so handing it straight to the next `create` skips the zero-fill
/// and kernel clone. Bounded; overflowing frames go back to the allocator.
pub struct DirPool {
    free: Vec<FrameIndex>,
}

/// Retired directories kept for reuse before falling back to the frame
/// allocator.
const DIR_POOL_CAP: usize = 64;

impl DirPool {
    pub const fn new() -> Self {
        Self { free: Vec::new() }
    }

    /// Take a recycled directory frame, if any.
    pub fn take(&mut self) -> Option<FrameIndex> {
        self.free.pop()
    }

    /// Return a retired directory frame to the pool; frees it when the
    /// pool is full.
    pub fn put(&mut self, dir: FrameIndex, frames: &mut FrameAllocator) {
        if self.free.len() < DIR_POOL_CAP {
            self.free.push(dir);
        } else {
            frames.dec_share(dir);
        }
    }
}

impl Default for DirPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "x86")]
pub use active::*;

/// The live address-space operations, bound to the real frame allocator
/// and the scratch-slot window.
#[cfg(target_arch = "x86")]
mod active {
    use spin::Mutex;

    use super::*;
    use crate::arch::x86::mmu::{self, scratch_window};
    use crate::mm::{
        kernel_frame,
        page_fault::{self, FaultInfo, FaultOutcome},
        FRAME_ALLOCATOR, PAGE_SIZE,
    };

    static DIR_POOL: Mutex<DirPool> = Mutex::new(DirPool::new());

    /// Directory a dying thread left behind; destroyed right after the
    /// switch to the next space.
    static PENDING_REAP: Mutex<Option<FrameIndex>> = Mutex::new(None);

    /// The permanently pinned all-zero frame backing fresh mappings.
    #[repr(C, align(4096))]
    struct ZeroPage([u8; PAGE_SIZE]);

    static ZERO_PAGE: ZeroPage = ZeroPage([0; PAGE_SIZE]);

    pub fn zero_page_frame() -> FrameIndex {
        kernel_frame(core::ptr::addr_of!(ZERO_PAGE) as u32)
    }

    /// The directory frame of the running address space (CR3).
    pub fn current_dir() -> FrameIndex {
        mmu::current_dir()
    }

    /// A fresh address space: empty user region, kernel region cloned
    /// from the running space, recursive slot established. Recycled
    /// directories skip the re-initialization.
    pub fn create() -> FrameIndex {
        let template = mmu::current_dir();
        let recycled = DIR_POOL.lock().take();
        let mut frames = FRAME_ALLOCATOR.lock();
        let mut win = scratch_window();
        let dir = match recycled {
            Some(dir) => dir,
            None => {
                let dir = frames.alloc();
                win.zero_frame(dir);
                dir
            }
        };
        Mapper::new(&mut win, &mut frames).clone_kernel_region(dir, template);
        dir
    }

    /// Fork the running space copy-on-write; returns the child's
    /// directory. Flushes the TLB because the parent's own entries just
    /// lost their write permission.
    pub fn fork_current() -> FrameIndex {
        let src = mmu::current_dir();
        let dir = create();
        {
            let mut frames = FRAME_ALLOCATOR.lock();
            let mut win = scratch_window();
            Mapper::new(&mut win, &mut frames).fork_user(src, dir);
        }
        mmu::flush_tlb();
        log::debug!(
            "forked {} -> {}, {} frames free",
            src,
            dir,
            FRAME_ALLOCATOR.lock().free_frames()
        );
        dir
    }

    /// Tear down a space that is not the running one.
    pub fn destroy(dir: FrameIndex) {
        debug_assert_ne!(dir.as_u32(), mmu::current_dir().as_u32());
        let mut frames = FRAME_ALLOCATOR.lock();
        let mut win = scratch_window();
        Mapper::new(&mut win, &mut frames).destroy_user(dir);
        DIR_POOL.lock().put(dir, &mut frames);
    }

    /// Queue `dir` for destruction at the next address-space switch (a
    /// thread cannot destroy the space it is standing on).
    pub fn schedule_reap(dir: FrameIndex) {
        let previous = PENDING_REAP.lock().replace(dir);
        debug_assert!(previous.is_none(), "reap queue overflow");
    }

    /// Install `dir` and dispose of any queued directory.
    ///
    /// # Safety
    ///
    /// `dir` must be a live directory sharing the boot kernel region.
    pub unsafe fn switch_to(dir: FrameIndex) {
        // SAFETY: contract forwarded.
        unsafe { mmu::switch_dir(dir) };
        let pending = PENDING_REAP.lock().take();
        if let Some(old) = pending {
            destroy(old);
        }
    }

    /// Apply the page-fault policy to the running space.
    pub fn handle_current_fault(info: &FaultInfo) -> FaultOutcome {
        let dir = mmu::current_dir();
        let outcome = {
            let mut frames = FRAME_ALLOCATOR.lock();
            let mut win = scratch_window();
            let mut mapper = Mapper::new(&mut win, &mut frames);
            page_fault::handle(&mut mapper, dir, info, zero_page_frame())
        };
        if outcome == FaultOutcome::Resolved {
            mmu::flush_tlb();
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Test support: a heap-backed window
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use std::boxed::Box;
    use std::collections::BTreeMap;
    use std::vec::Vec;

    use super::*;
    use crate::bootinfo::MemMapEntry;
    use crate::mm::{MAX_FRAMES, PAGE_SIZE};

    /// 4 KiB of fake physical memory.
    #[repr(C, align(4096))]
    pub struct FakeFrame(pub [u8; PAGE_SIZE]);

    /// Heap-backed [`TableWindow`] for exercising the paging core on the
    /// build host. Frames materialize zero-filled on first touch.
    pub struct FakeWindow {
        frames: BTreeMap<u32, Box<FakeFrame>>,
    }

    impl FakeWindow {
        pub fn new() -> Self {
            Self {
                frames: BTreeMap::new(),
            }
        }

        pub fn frame_mut(&mut self, frame: FrameIndex) -> &mut FakeFrame {
            self.frames
                .entry(frame.as_u32())
                .or_insert_with(|| Box::new(FakeFrame([0; PAGE_SIZE])))
        }

        pub fn read_byte(&mut self, frame: FrameIndex, offset: usize) -> u8 {
            self.frame_mut(frame).0[offset]
        }

        pub fn write_byte(&mut self, frame: FrameIndex, offset: usize, value: u8) {
            self.frame_mut(frame).0[offset] = value;
        }
    }

    impl TableWindow for FakeWindow {
        fn table_mut(&mut self, frame: FrameIndex) -> &mut PageTable {
            let raw: *mut FakeFrame = self.frame_mut(frame);
            // SAFETY: FakeFrame is a page-sized, page-aligned byte blob and
            // PageTable is a page-sized POD; reinterpreting is sound.
            unsafe { &mut *raw.cast::<PageTable>() }
        }

        fn copy_frame(&mut self, dst: FrameIndex, src: FrameIndex) {
            let data = self.frame_mut(src).0;
            self.frame_mut(dst).0 = data;
        }

        fn zero_frame(&mut self, frame: FrameIndex) {
            self.frame_mut(frame).0 = [0; PAGE_SIZE];
        }
    }

    /// A frame allocator over a fully usable fake RAM bank.
    pub fn test_allocator() -> FrameAllocator {
        let mut fa = FrameAllocator::new();
        fa.init(
            &[MemMapEntry {
                base: 0,
                length: (MAX_FRAMES * PAGE_SIZE) as u64,
                kind: 1,
                acpi: 1,
            }],
            true,
        );
        fa
    }

    /// Allocate a directory frame with an empty user region and the
    /// recursive slot established.
    pub fn make_dir(win: &mut FakeWindow, frames: &mut FrameAllocator) -> FrameIndex {
        let dir = frames.alloc();
        win.zero_frame(dir);
        win.table_mut(dir)[RECURSIVE_SLOT] = PageEntry::new(dir, PageFlags::WRITABLE);
        dir
    }

    /// Collect `(page index, frame, writable, cow)` for every present user
    /// leaf entry.
    pub fn user_mappings(
        win: &mut FakeWindow,
        frames: &mut FrameAllocator,
        dir: FrameIndex,
    ) -> Vec<(usize, FrameIndex, bool, bool)> {
        let mut mapper = Mapper::new(win, frames);
        let mut out = Vec::new();
        for dir_slot in 0..KERNEL_DIR_SLOT {
            let slot = mapper.win.table_mut(dir)[dir_slot];
            if !slot.is_present() {
                continue;
            }
            let table = slot.frame();
            for i in 0..PAGE_TABLE_ENTRIES {
                let e = mapper.win.table_mut(table)[i];
                if e.is_present() {
                    out.push((
                        dir_slot * PAGE_TABLE_ENTRIES + i,
                        e.frame(),
                        e.is_writable(),
                        e.is_cow(),
                    ));
                }
            }
        }
        out
    }
}
