//! Kernel heap
//!
//! A free-list allocator serving `alloc::` for the kernel out of the tail
//! of the fixed kernel window, between the end of the kernel image and
//! [`KERNEL_WINDOW_END`](super::KERNEL_WINDOW_END). Initialized once
//! during bootstrap, before the first address-space operation (the
//! directory pool and the ELF loader allocate).

use linked_list_allocator::LockedHeap;

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

// Under `cargo test` the host allocator serves the test harness; the
// kernel heap is left unwired.
#[cfg(test)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand `[base, base + size)` to the allocator.
///
/// # Safety
///
/// The range must be mapped, writable, unused kernel memory, and `init`
/// must be called exactly once.
pub unsafe fn init(base: *mut u8, size: usize) {
    // SAFETY: contract forwarded to the caller.
    unsafe {
        ALLOCATOR.lock().init(base, size);
    }
}

/// Bytes currently handed out.
pub fn used() -> usize {
    ALLOCATOR.lock().used()
}

/// Bytes still available.
pub fn free() -> usize {
    ALLOCATOR.lock().free()
}
