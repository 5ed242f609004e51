//! Trap dispatch: the vector table and the CPU exception handlers
//!
//! A 256-entry table maps every vector to its handler at compile time.
//! CPU exceptions either panic with their name (nothing in this kernel
//! can fix them) or, for vector 14, feed the page-fault policy. Vectors
//! 32..48 belong to the IRQ controller and 0x80 is the system-call gate;
//! everything else is ignored.

use spin::Mutex;

use super::entry::{self, stub_address};
use super::irq;
use crate::arch::TrapFrame;
use crate::{mm, syscall};

/// Handler shape shared by every vector.
pub type TrapHandler = fn(&mut TrapFrame);

/// Vector of the system-call gate.
pub const SYSCALL_VECTOR: usize = 0x80;

/// Compile-time vector assignment.
const fn handler_for(vector: usize) -> Option<TrapHandler> {
    match vector {
        1 => Some(debug_trap as TrapHandler),
        2 => Some(nmi as TrapHandler),
        8 => Some(double_fault as TrapHandler),
        13 => Some(general_protection as TrapHandler),
        16 => Some(coprocessor_error as TrapHandler),
        14 => Some(page_fault as TrapHandler),
        0 | 3..=7 | 9..=12 | 17 => Some(generic_exception as TrapHandler),
        15 | 18..=31 => Some(unknown_exception as TrapHandler),
        32..=47 => Some(irq_entry as TrapHandler),
        SYSCALL_VECTOR => Some(system_call as TrapHandler),
        _ => None,
    }
}

static TRAP_TABLE: [Option<TrapHandler>; 256] = {
    let mut table: [Option<TrapHandler>; 256] = [None; 256];
    let mut vector = 0;
    while vector < 256 {
        table[vector] = handler_for(vector);
        vector += 1;
    }
    table
};

/// Vectors that must not re-enable interrupts while handled.
const fn keeps_interrupts_off(vector: usize) -> bool {
    matches!(vector, 2 | 8 | 18)
}

/// The common dispatcher behind every stub. Recovers the vector from
/// the stub return address, re-enables interrupts (except for the
/// handful of faults that must run closed), and hands the frame to the
/// vector's handler. The handler may rewrite the frame; whatever is in
/// it afterwards is what the iret epilogue resumes.
#[no_mangle]
pub extern "C" fn isr_handler(frame: *mut TrapFrame) {
    // SAFETY: the stub passes the frame it just pushed on this stack.
    let frame = unsafe { &mut *frame };
    let vector = entry::vector_of(frame);
    frame.int_no = vector as u32;

    if !keeps_interrupts_off(vector) {
        // SAFETY: kernel paths tolerate IRQ nesting; each IRQ masks its
        // own line before this point is reached again.
        unsafe { x86::irq::enable() };
    }
    if let Some(handler) = TRAP_TABLE[vector] {
        handler(frame);
    }
    // SAFETY: the iret epilogue must not be interrupted mid-restore.
    unsafe { x86::irq::disable() };
}

// ---------------------------------------------------------------------------
// CPU exceptions
// ---------------------------------------------------------------------------

const SIGFPE: i32 = 0;
const SIGTRAP: i32 = 1;
const SIGSEGV: i32 = 2;
const SIGILL: i32 = 3;
const SIGBUS: i32 = 4;

/// Signal number and name per exception vector, 0..=17.
static EXCEPTIONS: [(i32, &str); 18] = [
    (SIGFPE, "divide error"),
    (-1, "debug"),
    (-1, "non-maskable interrupt"),
    (SIGTRAP, "int3"),
    (SIGSEGV, "overflow"),
    (SIGSEGV, "bounds"),
    (SIGILL, "invalid operand"),
    (SIGSEGV, "device not available"),
    (SIGSEGV, "double fault"),
    (SIGFPE, "coprocessor segment overrun"),
    (SIGSEGV, "invalid TSS"),
    (SIGBUS, "segment not present"),
    (SIGBUS, "stack segment"),
    (-1, "general protection"),
    (-1, "page fault"),
    (SIGSEGV, "reserved"),
    (-1, "coprocessor error"),
    (SIGSEGV, "alignment check"),
];

fn generic_exception(frame: &mut TrapFrame) {
    let (signal, name) = EXCEPTIONS[frame.int_no as usize];
    panic!(
        "unhandled exception: signal {signal} ({name}) at {:#06x}:{:#010x}",
        frame.cs, frame.eip
    );
}

fn unknown_exception(frame: &mut TrapFrame) {
    panic!("unhandled exception {}", frame.int_no);
}

fn debug_trap(_frame: &mut TrapFrame) {
    panic!("debug trap");
}

fn nmi(_frame: &mut TrapFrame) {
    // Either failing hardware or a watchdog; neither is survivable here.
    panic!("non-maskable interrupt, likely hardware failure");
}

fn double_fault(_frame: &mut TrapFrame) {
    // Only a kernel bug gets the CPU here.
    panic!("kernel bug: double fault");
}

fn general_protection(frame: &mut TrapFrame) {
    panic!(
        "general protection fault (error {:#x}) at {:#06x}:{:#010x}",
        frame.err_code, frame.cs, frame.eip
    );
}

fn coprocessor_error(_frame: &mut TrapFrame) {
    panic!("x87 coprocessor error");
}

fn page_fault(frame: &mut TrapFrame) {
    mm::page_fault::handle_trap(frame);
}

fn irq_entry(frame: &mut TrapFrame) {
    irq::dispatch(frame);
}

fn system_call(frame: &mut TrapFrame) {
    syscall::dispatch(frame);
}

// ---------------------------------------------------------------------------
// IDT
// ---------------------------------------------------------------------------

/// A 32-bit interrupt gate.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    flags: u8,
    offset_high: u16,
}

impl IdtEntry {
    const MISSING: IdtEntry = IdtEntry {
        offset_low: 0,
        selector: 0,
        zero: 0,
        flags: 0,
        offset_high: 0,
    };

    /// Interrupt gate (interrupts auto-masked on entry; the dispatcher
    /// re-enables them deliberately).
    fn gate(offset: u32, dpl: u8) -> Self {
        Self {
            offset_low: offset as u16,
            selector: crate::arch::KERNEL_CS,
            zero: 0,
            flags: 0x8E | (dpl << 5),
            offset_high: (offset >> 16) as u16,
        }
    }
}

static IDT: Mutex<[IdtEntry; 256]> = Mutex::new([IdtEntry::MISSING; 256]);

/// Build and load the IDT. int3/into/bounds and the syscall gate are
/// reachable from user mode; everything else is kernel-only.
pub fn init() {
    let mut idt = IDT.lock();
    for (vector, entry) in idt.iter_mut().enumerate() {
        let dpl = if (3..=5).contains(&vector) || vector == SYSCALL_VECTOR {
            3
        } else {
            0
        };
        *entry = IdtEntry::gate(stub_address(vector), dpl);
    }

    let pointer = x86::dtables::DescriptorTablePointer {
        limit: (core::mem::size_of::<[IdtEntry; 256]>() - 1) as u16,
        base: idt.as_ptr(),
    };
    // SAFETY: the table is a static and the gates point at the stub
    // array; both live forever.
    unsafe { x86::dtables::lidt(&pointer) };
    log::debug!("trap table installed, syscall gate at {SYSCALL_VECTOR:#x}");
}
