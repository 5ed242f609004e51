//! GDT and TSS
//!
//! Four flat 4 GiB segments (kernel/user, code/data) and one TSS whose
//! only job is pointing the CPU at the kernel stack on a user-to-kernel
//! transition. Privilege separation proper is paging's job.

use core::cell::UnsafeCell;

use x86::segmentation::SegmentSelector;
use x86::Ring;

use super::entry;
use crate::arch::{KERNEL_CS, KERNEL_DS};

/// The 32-bit task state segment; only `esp0`/`ss0` matter here.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct TaskStateSegment {
    link: u32,
    esp0: u32,
    ss0: u32,
    unused: [u32; 22],
    iopb: u32,
}

impl TaskStateSegment {
    const fn empty() -> Self {
        Self {
            link: 0,
            esp0: 0,
            ss0: 0,
            unused: [0; 22],
            iopb: core::mem::size_of::<TaskStateSegment>() as u32,
        }
    }
}

/// Flat 4 GiB code or data descriptor.
const fn flat_descriptor(code: bool, ring: u8) -> u64 {
    let limit_low = 0xFFFFu64;
    let access = 0x92 | ((ring as u64) << 5) | if code { 0x08 } else { 0x00 };
    // Granularity 4 KiB, 32-bit operand size, limit 0xF_FFFF.
    let flags_limit_high = 0xCFu64;
    limit_low | (access << 40) | (flags_limit_high << 48)
}

/// TSS descriptor (available 32-bit TSS, ring 0).
fn tss_descriptor(base: u32, limit: u32) -> u64 {
    let base = base as u64;
    let limit = limit as u64;
    (limit & 0xFFFF)
        | ((base & 0xFF_FFFF) << 16)
        | (0x89u64 << 40)
        | (((limit >> 16) & 0xF) << 48)
        | (((base >> 24) & 0xFF) << 56)
}

struct GdtCell(UnsafeCell<[u64; 6]>);
// SAFETY: written once during init on the single CPU.
unsafe impl Sync for GdtCell {}

struct TssCell(UnsafeCell<TaskStateSegment>);
// SAFETY: written once during init on the single CPU.
unsafe impl Sync for TssCell {}

static GDT: GdtCell = GdtCell(UnsafeCell::new([0; 6]));
static TSS: TssCell = TssCell(UnsafeCell::new(TaskStateSegment::empty()));

/// Build and load the GDT, reload every segment register, and point the
/// TSS at the kernel stack.
pub fn init() {
    // SAFETY: single-threaded init; the statics are written before any
    // selector referencing them is loaded.
    unsafe {
        let tss = TSS.0.get();
        (*tss).esp0 = entry::kernel_stack_top();
        (*tss).ss0 = KERNEL_DS as u32;

        let gdt = GDT.0.get();
        (*gdt)[0] = 0;
        (*gdt)[1] = flat_descriptor(true, 0); // 0x08 kernel code
        (*gdt)[2] = flat_descriptor(false, 0); // 0x10 kernel data
        (*gdt)[3] = flat_descriptor(true, 3); // 0x18 user code
        (*gdt)[4] = flat_descriptor(false, 3); // 0x20 user data
        (*gdt)[5] = tss_descriptor(
            tss as u32,
            core::mem::size_of::<TaskStateSegment>() as u32 - 1,
        );

        let pointer = x86::dtables::DescriptorTablePointer {
            limit: (core::mem::size_of::<[u64; 6]>() - 1) as u16,
            base: gdt.cast::<u64>(),
        };
        x86::dtables::lgdt(&pointer);

        // Reload cs with a far return; the data selectors follow.
        core::arch::asm!(
            "push {cs}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            cs = in(reg) u32::from(KERNEL_CS),
            tmp = out(reg) _,
        );
        let kds = SegmentSelector::from_raw(KERNEL_DS);
        x86::segmentation::load_ds(kds);
        x86::segmentation::load_es(kds);
        x86::segmentation::load_fs(kds);
        x86::segmentation::load_gs(kds);
        x86::segmentation::load_ss(kds);

        x86::task::load_tr(SegmentSelector::new(5, Ring::Ring0));
    }
    log::debug!("GDT loaded, TSS stack at {:#010x}", entry::kernel_stack_top());
}
