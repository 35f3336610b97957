//! Scheduler state for the test kernel. The locking and thread handoff live
//! in [`crate::kernel`]; this module is the pure bookkeeping.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use constants::{DISK_SECTOR_SIZE, DISK_TRACK_SIZE};
use kernel_abstractions::{KernelPid, ProcessState, ProcessTag, Psr};

/// Interval between clock interrupts, in virtual microseconds.
pub(crate) const CLOCK_TICK_USEC: i64 = 20_000;

/// Every read of the clock input register moves time forward a little, so
/// back-to-back reads are strictly ordered like on real hardware.
pub(crate) const CLOCK_READ_COST_USEC: i64 = 4;

/// A virtual hour. Reaching it means someone is waiting for a wakeup that
/// will never come.
pub(crate) const VIRTUAL_TIME_LIMIT_USEC: i64 = 3_600_000_000;

/// Panic payload used to unwind a process thread out of user frames when it
/// quits or the machine halts. The logging hook keeps it off stderr.
pub(crate) struct ThreadExit;

pub(crate) enum HaltCause {
    Halted(i32),
    Failed(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RunState {
    Ready,
    Running,
    Blocked,
    Zombie(i32),
}

pub(crate) struct Proc {
    pub name: String,
    pub priority: u32,
    pub tag: ProcessTag,
    pub parent: Option<KernelPid>,
    pub children: Vec<KernelPid>,
    pub psr: Psr,
    pub run: RunState,
    pub joining: bool,
}

pub(crate) struct Sem {
    pub count: usize,
    pub waiters: VecDeque<KernelPid>,
}

pub(crate) struct ClockDevice {
    pub now_usec: i64,
    pub waiters: Vec<KernelPid>,
    pub aborted: bool,
}

pub(crate) struct DiskDevice {
    pub tracks: usize,
    pub current_track: usize,
    pub media: Vec<u8>,
    pub pending_status: Option<i64>,
}

impl DiskDevice {
    pub fn new(tracks: usize) -> DiskDevice {
        DiskDevice {
            tracks,
            current_track: 0,
            media: vec![0u8; tracks * DISK_TRACK_SIZE * DISK_SECTOR_SIZE],
            pending_status: None,
        }
    }

    pub fn sector_offset(&self, sector: usize) -> usize {
        (self.current_track * DISK_TRACK_SIZE + sector) * DISK_SECTOR_SIZE
    }
}

pub(crate) struct SchedState {
    pub procs: HashMap<KernelPid, Proc>,
    pub next_pid: KernelPid,
    pub root: Option<KernelPid>,
    ready: BinaryHeap<Reverse<(u32, u64, KernelPid)>>,
    seq: u64,
    pub running: Option<KernelPid>,
    pub sems: Vec<Sem>,
    pub clock: ClockDevice,
    pub disks: Vec<DiskDevice>,
    pub halt: Option<HaltCause>,
}

impl SchedState {
    pub fn new() -> SchedState {
        SchedState {
            procs: HashMap::new(),
            next_pid: 0,
            root: None,
            ready: BinaryHeap::new(),
            seq: 0,
            running: None,
            sems: Vec::new(),
            clock: ClockDevice {
                now_usec: 0,
                waiters: Vec::new(),
                aborted: false,
            },
            disks: Vec::new(),
            halt: None,
        }
    }

    pub fn current(&self) -> KernelPid {
        self.running.expect("a process is running")
    }

    pub fn current_proc(&self) -> &Proc {
        &self.procs[&self.current()]
    }

    pub fn proc_mut(&mut self, pid: KernelPid) -> &mut Proc {
        self.procs.get_mut(&pid).expect("live process")
    }

    /// Move a blocked (or brand-new) process onto the ready queue. Smaller
    /// priority wins; FIFO among equals.
    pub fn ready_proc(&mut self, pid: KernelPid) {
        let priority = self.procs[&pid].priority;
        self.proc_mut(pid).run = RunState::Ready;
        self.seq += 1;
        self.ready.push(Reverse((priority, self.seq, pid)));
    }

    /// Hand the CPU to the most urgent ready process. With nobody ready the
    /// virtual clock advances tick by tick as long as someone is waiting on
    /// it; otherwise the machine is wedged and the run fails.
    pub fn dispatch(&mut self) {
        loop {
            if self.halt.is_some() {
                self.running = None;
                return;
            }
            while let Some(Reverse((_, _, pid))) = self.ready.pop() {
                let runnable = self
                    .procs
                    .get(&pid)
                    .is_some_and(|proc| proc.run == RunState::Ready);
                if runnable {
                    self.proc_mut(pid).run = RunState::Running;
                    self.running = Some(pid);
                    return;
                }
            }
            if !self.clock.waiters.is_empty() {
                self.clock.now_usec += CLOCK_TICK_USEC;
                if self.clock.now_usec > VIRTUAL_TIME_LIMIT_USEC {
                    self.halt = Some(HaltCause::Failed(String::from(
                        "virtual clock ran away: a wakeup will never arrive",
                    )));
                    continue;
                }
                for pid in std::mem::take(&mut self.clock.waiters) {
                    self.ready_proc(pid);
                }
                continue;
            }
            self.halt = Some(HaltCause::Failed(String::from(
                "deadlock: no runnable process and no pending clock interrupt",
            )));
        }
    }

    pub fn state_of(&self, proc: &Proc) -> ProcessState {
        match proc.run {
            RunState::Running => ProcessState::Running,
            RunState::Ready => ProcessState::Ready,
            RunState::Blocked => ProcessState::Blocked,
            RunState::Zombie(_) => ProcessState::Quit,
        }
    }
}
