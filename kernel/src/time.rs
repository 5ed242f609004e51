//! Kernel time: a free-running tick counter
//!
//! The PIT fires at 1000 Hz and the timer IRQ handler calls [`tick`];
//! nothing else writes the counter. Readers may race a tick and see the
//! previous value, which is fine for timestamps.

use core::sync::atomic::{AtomicU64, Ordering};

/// Timer interrupt frequency programmed into the PIT.
pub const TICK_HZ: u32 = 1000;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Called from the timer IRQ handler.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_accumulate() {
        let before = ticks();
        tick();
        tick();
        assert!(ticks() >= before + 2);
    }
}
