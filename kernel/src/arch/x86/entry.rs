//! Kernel entry points: boot stub, trap stubs, exit-to-thread
//!
//! `_start` runs at the image's *physical* address with paging off; only
//! pc-relative control flow and explicitly adjusted absolute addresses
//! work until it jumps to the virtual half.
//!
//! The 256 interrupt stubs are 8 bytes each. A stub pushes a dummy error
//! code when the CPU did not, then `call`s the common path — the pushed
//! return address doubles as the vector number, which the dispatcher
//! recovers as `(return address - int_vector) / 8`.

use core::arch::{asm, global_asm};

use crate::arch::TrapFrame;
use crate::mm::{KERNEL_BASE, KERNEL_PHYS_BASE};

/// Size of the kernel trap/boot stack.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// The single kernel stack: bootstrap runs on it, and after the kernel
/// enters user space every trap from user mode lands back on its top
/// (via the TSS). Kernel paths run to completion, so one stack is
/// enough; only nested IRQs deepen it.
#[no_mangle]
static mut BOOT_STACK: [u8; KERNEL_STACK_SIZE] = [0; KERNEL_STACK_SIZE];

/// Top of the kernel stack, for the TSS esp0 field.
pub fn kernel_stack_top() -> u32 {
    // SAFETY: address-of only.
    unsafe { core::ptr::addr_of!(BOOT_STACK) as u32 + KERNEL_STACK_SIZE as u32 }
}

// Boot entry. The loader drops us here in protected mode, paging off,
// image at KERNEL_PHYS_BASE, `esi` = physical address of the BootData
// record. Relative calls survive the physical/virtual split; absolute
// symbol addresses are adjusted by hand until the far jump.
global_asm!(
    r#"
    .section .text
    .global _start
_start:
    cli
    mov eax, offset BOOT_STACK + {stack_size}
    sub eax, {kvirt}
    add eax, {kphys}
    mov esp, eax
    xor ebp, ebp
    mov ebx, esi
    mov eax, offset KERNEL_PAGES
    sub eax, {kvirt}
    add eax, {kphys}
    push eax
    call enable_boot_paging
    add esp, 4
    mov eax, offset .Lhigh_half
    jmp eax
.Lhigh_half:
    mov esp, offset BOOT_STACK + {stack_size}
    push ebx
    call kernel_entry
.Lhang:
    hlt
    jmp .Lhang
"#,
    stack_size = const KERNEL_STACK_SIZE,
    kvirt = const KERNEL_BASE,
    kphys = const KERNEL_PHYS_BASE,
);

// The interrupt stub array and the common register save/restore path.
// Vectors 8, 10-14 and 17 push a CPU error code; everybody else gets a
// dummy zero so the frame layout is uniform.
global_asm!(
    r#"
    .section .text
    .balign 8
    .global int_vector
int_vector:
    .set vector, 0
    .rept 256
    .if (vector == 8) | ((vector >= 10) & (vector <= 14)) | (vector == 17)
    call isr_common
    .balign 8
    .else
    push 0
    call isr_common
    .balign 8
    .endif
    .set vector, vector + 1
    .endr

isr_common:
    pushad
    push ds
    push es
    push fs
    push gs
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    mov eax, esp
    push eax
    call isr_handler
    add esp, 4
    pop gs
    pop fs
    pop es
    pop ds
    popad
    add esp, 8
    iretd
"#
);

extern "C" {
    /// First byte of the interrupt stub array.
    pub static int_vector: u8;
}

/// Address of stub `vector`, for building IDT gates.
pub fn stub_address(vector: usize) -> u32 {
    // SAFETY: address-of only.
    let base = unsafe { core::ptr::addr_of!(int_vector) } as u32;
    base + (vector as u32) * 8
}

/// Recover the vector number from the raw `int_no` slot (the stub's
/// pushed return address).
pub fn vector_of(frame: &TrapFrame) -> usize {
    // SAFETY: address-of only.
    let base = unsafe { core::ptr::addr_of!(int_vector) } as u32;
    ((frame.int_no - base) / 8) as usize
}

/// Staging area for resuming user-mode frames; a kernel-mode frame is
/// instead staged on the target thread's own stack so `iretd` leaves esp
/// where the thread expects it.
static mut RESTORE_AREA: TrapFrame = TrapFrame::zeroed();

/// Load `frame` into the CPU and resume whatever it describes. The
/// context switch proper: the caller has already saved the outgoing
/// thread, this never returns.
///
/// # Safety
///
/// `frame` must describe a resumable context whose code/stack mappings
/// are live in the current address space.
pub unsafe fn exit_to_frame(frame: &TrapFrame) -> ! {
    // SAFETY: interrupts stay off until iretd reloads eflags.
    unsafe {
        x86::irq::disable();
    }
    let restore = if frame.is_user() {
        // SAFETY: single CPU, interrupts off; the area is dead the
        // moment iretd completes.
        unsafe {
            let area = core::ptr::addr_of_mut!(RESTORE_AREA);
            area.write(*frame);
            area as u32
        }
    } else {
        // Kernel resume: iretd pops only eip/cs/eflags, so stage the
        // frame just below the target stack pointer. 17 dwords reach
        // through eflags; esp/ss of the frame are not consumed.
        let staging = frame.esp - 17 * 4;
        // SAFETY: the target kernel stack is live and unused below esp.
        unsafe {
            core::ptr::copy_nonoverlapping(
                (frame as *const TrapFrame).cast::<u8>(),
                staging as *mut u8,
                17 * 4,
            );
        }
        staging
    };
    // SAFETY: `restore` points at a complete frame; the pops mirror
    // isr_common exactly.
    unsafe {
        asm!(
            "mov esp, {frame}",
            "pop gs",
            "pop fs",
            "pop es",
            "pop ds",
            "popad",
            "add esp, 8",
            "iretd",
            frame = in(reg) restore,
            options(noreturn),
        )
    }
}
