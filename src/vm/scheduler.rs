//! VM Scheduler: cooperative multitasking over one loaded image.
//!
//! Grounded on `original_source/src/sapphireos/vm_core.c`'s thread table
//! (`vm_thread_t`) and `vm_i8_run_threads`: each thread has a function
//! entry point and a due tick; `run_tick` advances the VM clock and
//! dispatches every thread whose due tick has arrived, in slot order,
//! until either the wall-time budget or the per-tick cycle budget is
//! exhausted. A thread that calls `suspend(n)` is rescheduled `n` ticks
//! out and dropped from this tick's dispatch.

use log::{trace, warn};

use crate::config::MAX_THREADS;
use crate::error::VmStatus;
use crate::time::MonotonicClock;
use crate::vm::image::VmImage;
use crate::vm::interp::{run, LibraryHost, StopReason, ThreadContext};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    Ready { due_tick: u64 },
}

/// One scheduled thread: its saved execution context plus the tick it
/// next becomes eligible to run.
pub struct Scheduler {
    slots: [Slot; MAX_THREADS],
    contexts: [Option<ThreadContext>; MAX_THREADS],
    tick: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        const EMPTY_SLOT: Slot = Slot::Empty;
        Scheduler {
            slots: [EMPTY_SLOT; MAX_THREADS],
            contexts: [None, None, None, None, None, None, None, None],
            tick: 0,
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Start a new thread at `entry_pc`, eligible to run immediately.
    /// Fails if every thread slot is occupied.
    pub fn thread_start(&mut self, entry_pc: u16) -> Result<usize, VmStatus> {
        let idx = self.slots.iter().position(|s| *s == Slot::Empty).ok_or(VmStatus::LoadAllocFail)?;
        self.slots[idx] = Slot::Ready { due_tick: self.tick };
        self.contexts[idx] = Some(ThreadContext::new(entry_pc));
        Ok(idx)
    }

    pub fn thread_stop(&mut self, idx: usize) {
        if idx < MAX_THREADS {
            self.slots[idx] = Slot::Empty;
            self.contexts[idx] = None;
        }
    }

    pub fn is_running(&self, idx: usize) -> bool {
        idx < MAX_THREADS && self.slots[idx] != Slot::Empty
    }

    /// Run `image.init_start` to completion once, used the first time a
    /// VM is loaded (matches the original's init/loop split instead of
    /// treating every entry point as a re-enterable thread).
    pub fn run_init<L: LibraryHost>(&mut self, image: &VmImage, lib: &mut L) -> Result<(), VmStatus> {
        let mut ctx = ThreadContext::new(image.init_start);
        match run(&mut ctx, image, lib)? {
            StopReason::Completed => Ok(()),
            StopReason::Suspended(_) => {
                warn!("init function suspended; treating as completed");
                Ok(())
            }
        }
    }

    /// Advance the scheduler's tick count by `delta_ticks` and dispatch
    /// every thread whose due tick has arrived, in slot order. `clock`
    /// bounds total wall time spent in this call to
    /// `VM_MAX_RUN_TIME_US`, matching the original's per-tick budget so a
    /// pathological image can't starve other VMs sharing the host loop.
    pub fn run_tick<L: LibraryHost, C: MonotonicClock>(
        &mut self,
        delta_ticks: u64,
        image: &VmImage,
        lib: &mut L,
        clock: &C,
    ) -> Result<(), VmStatus> {
        self.tick += delta_ticks;
        let budget_start = clock.now_ms();

        for idx in 0..MAX_THREADS {
            let due = match self.slots[idx] {
                Slot::Ready { due_tick } if due_tick <= self.tick => due_tick,
                _ => continue,
            };
            let _ = due;

            if clock.now_ms().saturating_sub(budget_start) * 1000 >= crate::config::VM_MAX_RUN_TIME_US {
                trace!("run_tick budget exhausted before thread {}", idx);
                break;
            }

            let ctx = match self.contexts[idx].as_mut() {
                Some(c) => c,
                None => continue,
            };

            match run(ctx, image, lib) {
                Ok(StopReason::Completed) => self.thread_stop(idx),
                Ok(StopReason::Suspended(delay)) => {
                    self.slots[idx] = Slot::Ready { due_tick: self.tick + delay as u64 };
                }
                Err(e) => {
                    warn!("thread {} faulted: {:?}", idx, e);
                    self.thread_stop(idx);
                }
            }
        }
        Ok(())
    }

    /// Earliest due tick among live threads, for a host that wants to
    /// sleep until the next thread actually needs the CPU.
    pub fn next_due_tick(&self) -> Option<u64> {
        self.slots
            .iter()
            .filter_map(|s| match s {
                Slot::Ready { due_tick } => Some(*due_tick),
                Slot::Empty => None,
            })
            .min()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockClock;
    use crate::vm::image::heapless_u32::List;
    use crate::vm::interp::NullLibraryHost;
    use crate::vm::isa::Opcode;

    fn counter_loop_image() -> VmImage {
        // r9 = 1; r0 += r9; r8 = 20; suspend(r8); jmp back to top
        let words: [[u8; 4]; 5] = [
            [Opcode::LdI32 as u8, 9, 1, 0],
            [Opcode::AddI32 as u8, 0, 0, 9],
            [Opcode::LdI32 as u8, 8, 20, 0],
            [Opcode::Suspend as u8, 8, 0, 0],
            [Opcode::Jmp as u8, 0, 0xfc, 0xff],
        ];
        let mut full = List::new();
        for w in &words {
            full.push(u32::from_le_bytes(*w));
        }
        VmImage {
            program_name_hash: 0,
            code: full,
            functions: [Default::default(); crate::config::VM_MAX_FUNCTIONS],
            function_count: 0,
            global_data: [0; crate::config::VM_MAX_GLOBAL_WORDS * 4],
            global_len: 0,
            constants: [0; crate::config::VM_MAX_CONST_WORDS * 4],
            constants_len: 0,
            strings: [0; crate::config::VM_MAX_STRING_POOL],
            strings_len: 0,
            init_start: 0,
            loop_start: 0,
        }
    }

    #[test]
    fn thread_suspend_resume_five_times_counts_to_five() {
        let image = counter_loop_image();
        let mut sched = Scheduler::new();
        let mut lib = NullLibraryHost;
        let clock = MockClock::new();
        let idx = sched.thread_start(0).unwrap();

        for _ in 0..5 {
            sched.run_tick(20, &image, &mut lib, &clock).unwrap();
            clock.advance(1);
        }

        let ctx = sched.contexts[idx].as_ref();
        // After 5 suspend cycles the thread is always parked mid-loop,
        // never stopped, so its context must still exist.
        assert!(ctx.is_some());
        assert_eq!(ctx.unwrap().register(0), 5);
    }
}
