//! Physical frame allocator
//!
//! Tracks every 4 KiB frame of physical memory in a flat refcount array.
//! A frame's count is the number of live page-table entries referencing
//! it; the sentinel value 255 marks frames that are permanently reserved
//! (firmware regions, the kernel image, the shared zero page). Counts on
//! reserved frames never change, which lets the copy-on-write paths treat
//! the pinned zero page like any other shared frame.

use spin::Mutex;

use super::{FrameIndex, MAX_FRAMES, PAGE_SIZE};
use crate::bootinfo::MemMapEntry;

/// Refcount value marking a permanently reserved frame.
pub const RESERVED: u8 = u8::MAX;

/// The global frame allocator.
pub static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());

/// Refcounting first-fit allocator over the physical frame array.
pub struct FrameAllocator {
    refcounts: [u8; MAX_FRAMES],
    free_frames: usize,
}

impl FrameAllocator {
    /// All frames start reserved; [`init`](Self::init) releases the usable
    /// ones.
    pub const fn new() -> Self {
        Self {
            refcounts: [RESERVED; MAX_FRAMES],
            free_frames: 0,
        }
    }

    /// Seed the allocator from the loader's memory map. Frames covered by
    /// a usable region become free; everything else stays reserved. If the
    /// A20 line is disabled every odd megabyte aliases the even one below
    /// it, so those frames are force-reserved and half the memory is lost.
    pub fn init(&mut self, memory_map: &[MemMapEntry], a20_enabled: bool) {
        for entry in memory_map {
            if !entry.is_usable() {
                continue;
            }
            let base = entry.base;
            let length = entry.length;
            // Only whole frames inside the region are usable.
            let start = ((base + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64).min(MAX_FRAMES as u64);
            let end = ((base + length) / PAGE_SIZE as u64).min(MAX_FRAMES as u64);
            log::info!(
                "usable memory {:#x}..{:#x} ({} frames)",
                base,
                base + length,
                end.saturating_sub(start)
            );
            for frame in start..end {
                if self.refcounts[frame as usize] == RESERVED {
                    self.refcounts[frame as usize] = 0;
                    self.free_frames += 1;
                }
            }
        }

        if !a20_enabled {
            log::warn!("A20 line disabled, compensating but losing half the memory");
            let frames_per_mib = (1 << 20) / PAGE_SIZE;
            let mut start = frames_per_mib;
            while start < MAX_FRAMES {
                self.mark_reserved(
                    FrameIndex::new(start as u32),
                    FrameIndex::new((start + frames_per_mib).min(MAX_FRAMES) as u32),
                );
                start += 2 * frames_per_mib;
            }
        }

        // Frame 0 holds the BIOS data area and real-mode IVT.
        self.mark_reserved(FrameIndex::new(0), FrameIndex::new(1));
    }

    /// Allocate one frame: first-fit scan for a zero refcount.
    ///
    /// # Panics
    ///
    /// Panics when no frame is free; the kernel cannot make progress
    /// without memory.
    pub fn alloc(&mut self) -> FrameIndex {
        for (index, count) in self.refcounts.iter_mut().enumerate() {
            if *count == 0 {
                *count = 1;
                self.free_frames -= 1;
                return FrameIndex::new(index as u32);
            }
        }
        panic!("out of physical frames");
    }

    /// Record one more page-table entry referencing `frame`. No-op for
    /// reserved frames.
    pub fn inc_share(&mut self, frame: FrameIndex) {
        let count = &mut self.refcounts[frame.as_usize()];
        if *count == RESERVED {
            return;
        }
        assert!(*count >= 1, "inc_share on free {frame}");
        *count += 1;
    }

    /// Drop one reference to `frame`; a frame reaching zero is free again.
    /// Returns the new count. No-op for reserved frames.
    pub fn dec_share(&mut self, frame: FrameIndex) -> u8 {
        let count = &mut self.refcounts[frame.as_usize()];
        if *count == RESERVED {
            return RESERVED;
        }
        assert!(*count >= 1, "dec_share on free {frame}");
        *count -= 1;
        if *count == 0 {
            self.free_frames += 1;
        }
        *count
    }

    /// Permanently reserve the frame range `[lo, hi)`.
    pub fn mark_reserved(&mut self, lo: FrameIndex, hi: FrameIndex) {
        for index in lo.as_usize()..hi.as_usize().min(MAX_FRAMES) {
            if self.refcounts[index] == 0 {
                self.free_frames -= 1;
            }
            self.refcounts[index] = RESERVED;
        }
    }

    /// Current reference count of `frame` (255 = reserved).
    pub fn refcount(&self, frame: FrameIndex) -> u8 {
        self.refcounts[frame.as_usize()]
    }

    pub fn is_reserved(&self, frame: FrameIndex) -> bool {
        self.refcount(frame) == RESERVED
    }

    /// Number of frames currently free.
    pub fn free_frames(&self) -> usize {
        self.free_frames
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}
