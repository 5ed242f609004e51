//! Thread records and the fixed-capacity thread table

use crate::arch::TrapFrame;
use crate::error::{KernelError, KernelResult};
use crate::mm::FrameIndex;

/// Capacity of the thread table.
pub const MAX_THREADS: usize = 1024;

/// Per-thread file-descriptor slots.
pub const MAX_FDS: usize = 16;

/// Lifecycle state of a thread-table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Free slot.
    Unused,
    /// The single thread the CPU is executing.
    Running,
    /// Runnable, waiting to be picked.
    Ready,
    /// Waiting on an event; never picked.
    Blocked,
    /// Exited, exit code held for the parent.
    Zombie,
}

/// One slot of the thread table.
///
/// `frame` is the saved register state and is only meaningful while the
/// thread is not Running; the running thread's canonical state is the
/// trap frame on the kernel stack.
#[derive(Debug, Clone, Copy)]
pub struct Thread {
    pub tid: usize,
    /// Process id: the thread's own id for a process leader, the
    /// parent's otherwise.
    pub pid: usize,
    pub parent: Option<usize>,
    pub priority: i32,
    pub state: ThreadState,
    /// Tick count at creation.
    pub created_at: u64,
    /// Directory frame of the owned address space.
    pub dir: FrameIndex,
    pub frame: TrapFrame,
    pub exit_code: i32,
    pub fd_count: usize,
    pub fds: [i32; MAX_FDS],
}

impl Thread {
    pub const UNUSED: Thread = Thread {
        tid: 0,
        pid: 0,
        parent: None,
        priority: 0,
        state: ThreadState::Unused,
        created_at: 0,
        dir: FrameIndex::new(0),
        frame: TrapFrame::zeroed(),
        exit_code: 0,
        fd_count: 0,
        fds: [0; MAX_FDS],
    };
}

/// The fixed-capacity table of all threads. Index 0 is the idle thread.
pub struct ThreadTable {
    threads: [Thread; MAX_THREADS],
}

impl ThreadTable {
    pub const fn new() -> Self {
        Self {
            threads: [Thread::UNUSED; MAX_THREADS],
        }
    }

    pub fn get(&self, tid: usize) -> &Thread {
        &self.threads[tid]
    }

    pub fn get_mut(&mut self, tid: usize) -> &mut Thread {
        &mut self.threads[tid]
    }

    /// Claim the first free slot for a new Ready thread.
    ///
    /// A process leader (`is_process`) gets its own pid; a plain thread
    /// inherits the parent's. Priority is inherited from the parent.
    pub fn create(
        &mut self,
        parent: Option<usize>,
        dir: FrameIndex,
        is_process: bool,
        now: u64,
    ) -> KernelResult<usize> {
        let (parent_pid, priority) = match parent {
            Some(p) => (self.threads[p].pid, self.threads[p].priority),
            None => (0, 0),
        };
        for tid in 0..MAX_THREADS {
            if self.threads[tid].state != ThreadState::Unused {
                continue;
            }
            self.threads[tid] = Thread {
                tid,
                pid: if is_process { tid } else { parent_pid },
                parent,
                priority,
                state: ThreadState::Ready,
                created_at: now,
                dir,
                frame: TrapFrame::zeroed(),
                exit_code: 0,
                fd_count: 0,
                fds: [0; MAX_FDS],
            };
            return Ok(tid);
        }
        Err(KernelError::ThreadTableFull)
    }

    /// Is any thread other than `tid` (and the idle thread) runnable?
    pub fn has_ready_other_than(&self, tid: usize) -> bool {
        self.threads
            .iter()
            .skip(1)
            .any(|t| t.tid != tid && t.state == ThreadState::Ready)
    }

    /// True while the parent slot still belongs to the given parent, so
    /// a dying child knows whether anyone will collect its exit code.
    pub fn parent_alive(&self, parent: Option<usize>) -> bool {
        match parent {
            Some(p) => !matches!(
                self.threads[p].state,
                ThreadState::Unused | ThreadState::Zombie
            ),
            None => false,
        }
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_assigns_slots_in_order() {
        let mut table = ThreadTable::new();
        let idle = table.create(None, FrameIndex::new(1), true, 0).unwrap();
        assert_eq!(idle, 0);
        let init = table.create(None, FrameIndex::new(2), true, 5).unwrap();
        assert_eq!(init, 1);
        assert_eq!(table.get(init).pid, 1);
        assert_eq!(table.get(init).state, ThreadState::Ready);
        assert_eq!(table.get(init).created_at, 5);
    }

    #[test]
    fn process_children_get_their_own_pid() {
        let mut table = ThreadTable::new();
        let _idle = table.create(None, FrameIndex::new(1), true, 0).unwrap();
        let init = table.create(None, FrameIndex::new(2), true, 0).unwrap();
        table.get_mut(init).priority = 7;

        let child = table.create(Some(init), FrameIndex::new(3), true, 0).unwrap();
        assert_eq!(table.get(child).pid, child);
        assert_eq!(table.get(child).parent, Some(init));
        assert_eq!(table.get(child).priority, 7);

        let worker = table.create(Some(init), FrameIndex::new(4), false, 0).unwrap();
        assert_eq!(table.get(worker).pid, table.get(init).pid);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut table = ThreadTable::new();
        let _idle = table.create(None, FrameIndex::new(1), true, 0).unwrap();
        let a = table.create(None, FrameIndex::new(2), true, 0).unwrap();
        let _b = table.create(None, FrameIndex::new(3), true, 0).unwrap();
        table.get_mut(a).state = ThreadState::Unused;
        let again = table.create(None, FrameIndex::new(4), true, 0).unwrap();
        assert_eq!(again, a);
    }

    #[test]
    fn ready_scan_ignores_idle_and_self() {
        let mut table = ThreadTable::new();
        let idle = table.create(None, FrameIndex::new(1), true, 0).unwrap();
        table.get_mut(idle).state = ThreadState::Ready;
        assert!(!table.has_ready_other_than(5));

        let a = table.create(None, FrameIndex::new(2), true, 0).unwrap();
        assert!(table.has_ready_other_than(5));
        assert!(!table.has_ready_other_than(a));
    }
}
