//! The cascaded 8259A interrupt controllers and the PIT
//!
//! Hardware IRQs are remapped onto vectors 32..48. On dispatch the line
//! that fired is masked, the controller acknowledged, and the handler
//! runs with interrupts enabled — other lines may nest, the same line
//! cannot. Spurious IRQ 7/15 events are detected by reading the
//! in-service register and dropped without acknowledgement.
//!
//! The tail of the dispatcher is the kernel's only preemption point: if
//! the IRQ interrupted user code and another thread is Ready, the
//! interrupted thread yields.

use spin::Mutex;

use crate::arch::TrapFrame;
use crate::drivers::keyboard;
use crate::{sched, time};

const MASTER_PORT: u16 = 0x20;
const SLAVE_PORT: u16 = 0xA0;
const EOI: u8 = 0x20;

/// Vector base the IRQs are remapped to.
pub const IRQ_BASE: u32 = 32;

/// IRQ line of the PIT.
pub const TIMER_IRQ: u8 = 0;
/// IRQ line of the PS/2 keyboard.
pub const KEYBOARD_IRQ: u8 = 1;
/// Master line the slave controller cascades through.
const CASCADE_IRQ: u8 = 2;

type IrqHandler = fn();

static IRQ_HANDLERS: Mutex<[Option<IrqHandler>; 16]> = Mutex::new([None; 16]);

fn pic_port(irq: u8) -> u16 {
    if irq >= 8 {
        SLAVE_PORT
    } else {
        MASTER_PORT
    }
}

/// Program one 8259A: remap its vectors, select ISR reads (for spurious
/// detection), and mask every line except the cascade input.
fn init_pic(port: u16, vector_offset: u8, cascade: u8) {
    // SAFETY: the ICW sequence below is the documented 8259A setup.
    unsafe {
        // ICW1: INIT | ICW4 follows.
        x86::io::outb(port, 0x11);
        // ICW2: vector offset (multiple of 8, low bits carry the line).
        x86::io::outb(port + 1, vector_offset);
        // ICW3: cascade wiring — bitmask of the slave line on the
        // master, plain identity on the slave.
        x86::io::outb(port + 1, cascade);
        // ICW4: 8086 mode.
        x86::io::outb(port + 1, 0x01);

        // OCW3: subsequent reads from the command port return the ISR.
        x86::io::outb(port, 0x0B);

        // Mask everything; lines open as handlers register.
        let mask = if port == MASTER_PORT { !cascade } else { 0xFF };
        x86::io::outb(port + 1, mask);
    }
}

/// Program PIT channel 0 as a square-wave source at `frequency` Hz.
fn init_pit(frequency: u32) {
    const PIT_CHANNEL0: u16 = 0x40;
    const PIT_COMMAND: u16 = 0x43;
    const PIT_HZ: u32 = 1_193_182;

    let divisor = match PIT_HZ / frequency {
        0 => 1,
        d if d > 0xFFFF => 0, // 0 encodes 65536, the slowest rate
        d => d,
    };
    // SAFETY: channel 0, access mode lobyte/hibyte, mode 3.
    unsafe {
        x86::io::outb(PIT_COMMAND, 0x36);
        x86::io::outb(PIT_CHANNEL0, divisor as u8);
        x86::io::outb(PIT_CHANNEL0, (divisor >> 8) as u8);
    }
}

/// Claim an IRQ line: refuses lines that are already unmasked (someone
/// owns them), otherwise records the handler and opens the line.
pub fn register(irq: u8, handler: IrqHandler) -> bool {
    let port = pic_port(irq);
    let bit = 1u8 << (irq & 7);
    // SAFETY: read-modify-write of the interrupt mask register.
    unsafe {
        let mask = x86::io::inb(port + 1);
        if mask & bit == 0 {
            return false;
        }
        IRQ_HANDLERS.lock()[irq as usize] = Some(handler);
        x86::io::outb(port + 1, mask & !bit);
    }
    true
}

/// Remap the controllers, start the 1000 Hz timer, and wire the timer
/// and keyboard lines.
pub fn init() {
    init_pic(MASTER_PORT, IRQ_BASE as u8, 1 << CASCADE_IRQ);
    init_pic(SLAVE_PORT, IRQ_BASE as u8 + 8, CASCADE_IRQ);

    init_pit(time::TICK_HZ);
    assert!(register(TIMER_IRQ, timer_handler));
    assert!(register(KEYBOARD_IRQ, keyboard_handler));
    log::debug!("PIC remapped to vectors {IRQ_BASE}..{}", IRQ_BASE + 16);
}

fn timer_handler() {
    time::tick();
}

fn keyboard_handler() {
    // SAFETY: reading the PS/2 data port consumes the pending scancode.
    let scancode = unsafe { x86::io::inb(0x60) };
    keyboard::handle_scancode(scancode);
}

/// Entry from the trap table for vectors 32..48.
pub fn dispatch(frame: &mut TrapFrame) {
    let irq = (frame.int_no - IRQ_BASE) as u8;
    // A slave interrupt is raised through the master's cascade line, so
    // the master always needs an EOI.
    if irq >= 8 {
        // SAFETY: EOI write.
        unsafe { x86::io::outb(MASTER_PORT, EOI) };
    }

    let port = pic_port(irq);
    let bit = 1u8 << (irq & 7);

    // IRQ 7/15 fire spuriously when a line drops before the CPU
    // acknowledges; a spurious one has no in-service bit and must not
    // be acknowledged.
    if bit == 0x80 {
        // SAFETY: OCW3 above set command-port reads to return the ISR.
        let isr = unsafe { x86::io::inb(port) };
        if isr & bit == 0 {
            return;
        }
    }

    // Mask this line only, then acknowledge: every other IRQ may nest
    // while the handler runs, this one cannot.
    // SAFETY: mask/EOI writes to the owning controller.
    let saved_mask = unsafe {
        let mask = x86::io::inb(port + 1);
        x86::io::outb(port + 1, mask | bit);
        x86::io::outb(port, EOI);
        mask
    };

    let handler = IRQ_HANDLERS.lock()[irq as usize];
    match handler {
        Some(handler) => handler(),
        None => log::warn!("unhandled IRQ {irq}"),
    }

    // SAFETY: restore the mask recorded before the handler ran.
    unsafe { x86::io::outb(port + 1, saved_mask) };

    // The single preemption point: give the CPU away at IRQ return if
    // user code was interrupted and somebody else can run.
    sched::maybe_preempt(frame);
}
