//! Kernel bring-up
//!
//! Order matters and is the whole point of this module: console first so
//! failures are visible, then the frame allocator (paging already runs
//! on the boot tables), the heap, the descriptor tables and interrupt
//! controllers, the ramdisk, and finally the first two threads. The last
//! line of bootstrap is an exit-to-thread into init; the boot stack is
//! reused as the kernel trap stack from then on.

use crate::arch::x86::{gdt, irq, mmu, traps, vga};
use crate::bootinfo::BootData;
use crate::mm::{address_space, heap, FrameIndex, FRAME_ALLOCATOR, PAGE_SIZE, USER_STACK_TOP};
use crate::{elf, fs, logger, sched};

/// Name of the first user program in the ramdisk archive.
const INIT_IMAGE: &str = "init.elf";

pub fn run(boot: &BootData) -> ! {
    vga::init(boot.cursor_pos);
    logger::init();
    log::info!("CobaltOS v{}", env!("CARGO_PKG_VERSION"));

    // The A20 probe needs the boot identity map, so it runs before the
    // frame allocator consumes its verdict and the map goes away.
    let a20 = mmu::a20_enabled();

    {
        let mut frames = FRAME_ALLOCATOR.lock();
        frames.init(boot.memory_map(), a20);

        let (kernel_lo, kernel_hi) = mmu::kernel_image_frames();
        frames.mark_reserved(kernel_lo, kernel_hi);

        let ramdisk_lo = FrameIndex::new(boot.ramdisk_ptr >> 12);
        let ramdisk_end = boot.ramdisk_ptr + boot.ramdisk_size.max(0) as u32;
        let ramdisk_hi = FrameIndex::new((ramdisk_end + PAGE_SIZE as u32 - 1) >> 12);
        frames.mark_reserved(ramdisk_lo, ramdisk_hi);

        log::info!("{} frames free after reservations", frames.free_frames());
    }

    // The loader's low-memory records are consumed; from here on the
    // null-pointer trap is armed.
    mmu::unmap_identity();

    let (heap_base, heap_size) = mmu::heap_window();
    // SAFETY: the window is mapped kernel memory past the image, used
    // for nothing else.
    unsafe { heap::init(heap_base, heap_size) };
    log::info!("kernel heap: {} KiB", heap_size / 1024);

    gdt::init();
    traps::init();
    irq::init();
    // SAFETY: descriptor tables and controllers are live; from here the
    // kernel runs with interrupts enabled.
    unsafe { x86::irq::enable() };

    let ramdisk = mmu::map_ramdisk(boot.ramdisk_ptr, boot.ramdisk_size.max(0) as u32);
    fs::init(ramdisk);

    // Thread 0 idles on the boot address space; init gets a fresh one.
    sched::spawn_idle(mmu::boot_dir());

    let image = fs::read_file(INIT_IMAGE)
        .unwrap_or_else(|err| panic!("cannot load {INIT_IMAGE}: {err}"));
    let init_dir = address_space::create();
    // SAFETY: freshly created directory sharing the boot kernel region.
    unsafe { address_space::switch_to(init_dir) };
    let entry = elf::load_into_current(&image)
        .unwrap_or_else(|err| panic!("cannot load {INIT_IMAGE}: {err}"));
    sched::spawn_init(init_dir, entry, USER_STACK_TOP);

    log::info!("entering user space at {entry:#010x}");
    sched::start()
}
