//! The test kernel: every `kernel-abstractions` trait implemented over std
//! threads with strictly cooperative, priority-ordered handoff.
//!
//! Exactly one process thread runs at a time. A thread gives up the CPU only
//! inside a layer-1 suspension point, where it picks the next runnable
//! process and then parks on the shared condvar until the token comes back.
//! Quitting (and machine halt) unwind the thread with a quiet panic payload.

use std::panic::{catch_unwind, panic_any, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use constants::{MAX_PROCESSES, MAX_SEMAPHORES};
use hermit_sync::SpinMutex;
use kernel_abstractions::{
    Device, DeviceError, DeviceRequest, ICpu, IDeviceBus, IDeviceQueue, IKernel, IProcessControl,
    ISemaphorePool, ITrapHandler, KernelError, KernelPid, ProcessEntry, ProcessInfo, ProcessTag,
    Psr, SemaphoreId, Trap, TrapFrame, TrapKind,
};
use timing::Microseconds;

use crate::sched::{
    DiskDevice, HaltCause, Proc, RunState, SchedState, Sem, ThreadExit, CLOCK_READ_COST_USEC,
};

pub struct TestKernel {
    me: Weak<TestKernel>,
    state: Mutex<SchedState>,
    wake: Condvar,
    handlers: SpinMutex<[Option<Arc<dyn ITrapHandler>>; 2]>,
}

fn handler_index(kind: TrapKind) -> usize {
    match kind {
        TrapKind::Syscall => 0,
        TrapKind::IllegalInstruction => 1,
    }
}

impl Default for TestKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl TestKernel {
    pub fn new() -> TestKernel {
        TestKernel {
            me: Weak::new(),
            state: Mutex::new(SchedState::new()),
            wake: Condvar::new(),
            handlers: SpinMutex::new([None, None]),
        }
    }

    /// Attach a disk unit with the given track count. Units are numbered in
    /// the order they are attached.
    pub fn with_disk(self, tracks: usize) -> Self {
        self.state().disks.push(DiskDevice::new(tracks));
        self
    }

    pub fn build(self) -> Arc<TestKernel> {
        Arc::new_cyclic(|weak| TestKernel {
            me: weak.clone(),
            ..self
        })
    }

    /// Boot the machine: run `startup` as the first kernel process and block
    /// the calling (non-process) thread until the machine halts. Returns the
    /// startup process's exit status; a wedged machine or a panicking
    /// process fails the test here.
    pub fn run(kernel: &Arc<TestKernel>, startup: impl FnOnce() -> i32 + Send + 'static) -> i32 {
        let pid = {
            let mut st = kernel.state();
            assert!(st.procs.is_empty(), "one run per test kernel");
            let pid = st.next_pid;
            st.next_pid += 1;
            st.procs.insert(
                pid,
                Proc {
                    name: String::from("startup"),
                    priority: 1,
                    tag: ProcessTag::Kernel,
                    parent: None,
                    children: Vec::new(),
                    psr: Psr::CURRENT_MODE | Psr::CURRENT_INT,
                    run: RunState::Running,
                    joining: false,
                },
            );
            st.root = Some(pid);
            st.running = Some(pid);
            pid
        };
        spawn_process_thread(kernel.clone(), pid, Box::new(startup));

        let mut st = kernel.state();
        loop {
            match &st.halt {
                Some(HaltCause::Halted(status)) => return *status,
                Some(HaltCause::Failed(message)) => {
                    let message = message.clone();
                    drop(st);
                    panic!("{message}");
                }
                None => st = kernel.wait(st),
            }
        }
    }

    /// Snapshot of the virtual clock, for assertions.
    pub fn clock_usec(&self) -> i64 {
        self.state().clock.now_usec
    }

    fn state(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, SchedState>) -> MutexGuard<'a, SchedState> {
        self.wake
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch_and_wake(&self, st: &mut SchedState) {
        st.dispatch();
        self.wake.notify_all();
    }

    /// Give up the CPU and block until it comes back. The caller must
    /// already have parked itself (waiter list + run state).
    fn suspend<'a>(
        &self,
        mut guard: MutexGuard<'a, SchedState>,
        me: KernelPid,
    ) -> MutexGuard<'a, SchedState> {
        self.dispatch_and_wake(&mut guard);
        loop {
            if guard.halt.is_some() {
                drop(guard);
                panic_any(ThreadExit);
            }
            if guard.running == Some(me) {
                return guard;
            }
            guard = self.wait(guard);
        }
    }

    fn wait_first_turn(&self, me: KernelPid) -> bool {
        let mut guard = self.state();
        loop {
            if guard.halt.is_some() {
                return false;
            }
            if guard.running == Some(me) {
                return true;
            }
            guard = self.wait(guard);
        }
    }

    /// Quit bookkeeping shared by explicit quit and falling off the entry:
    /// orphan the children, free already-quit ones, hand the status to a
    /// joining parent or halt if this was the startup process.
    fn exit_current(&self, status: i32) {
        let mut st = self.state();
        let me = st.current();
        let children = std::mem::take(&mut st.proc_mut(me).children);
        for child in children {
            if let Some(proc) = st.procs.get_mut(&child) {
                proc.parent = None;
                if matches!(proc.run, RunState::Zombie(_)) {
                    st.procs.remove(&child);
                }
            }
        }
        if st.root == Some(me) {
            st.procs.remove(&me);
            st.halt = Some(HaltCause::Halted(status));
        } else {
            match st.procs[&me].parent {
                Some(parent) => {
                    st.proc_mut(me).run = RunState::Zombie(status);
                    if st.procs[&parent].joining {
                        st.ready_proc(parent);
                    }
                }
                None => {
                    st.procs.remove(&me);
                }
            }
        }
        self.dispatch_and_wake(&mut st);
    }

    /// Wreck the machine with a diagnostic; unwinds the calling thread.
    fn failure(&self, message: String) -> ! {
        let mut st = self.state();
        if st.halt.is_none() {
            st.halt = Some(HaltCause::Failed(message));
        }
        st.running = None;
        self.wake.notify_all();
        drop(st);
        panic_any(ThreadExit)
    }

    fn fail_from_panic(&self, payload: Box<dyn std::any::Any + Send>) {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            String::from(*text)
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            String::from("process thread panicked")
        };
        let mut st = self.state();
        if st.halt.is_none() {
            st.halt = Some(HaltCause::Failed(message));
        }
        st.running = None;
        self.wake.notify_all();
    }

    /// Privileged-operation guard: in user mode the operation does not
    /// happen, the illegal-instruction trap does.
    fn check_privileged(&self) {
        let user_mode = {
            let st = self.state();
            !st.current_proc().psr.is_kernel_mode()
        };
        if user_mode {
            log::trace!("privileged operation attempted in user mode");
            self.raise_illegal_instruction();
        }
    }
}

fn spawn_process_thread(kernel: Arc<TestKernel>, pid: KernelPid, entry: ProcessEntry) {
    std::thread::Builder::new()
        .name(format!("proc-{pid}"))
        .spawn(move || {
            crate::user::set_current_kernel(kernel.clone());
            if !kernel.wait_first_turn(pid) {
                return;
            }
            match catch_unwind(AssertUnwindSafe(entry)) {
                // falling off the entry is an implicit quit
                Ok(status) => kernel.exit_current(status),
                Err(payload) if payload.is::<ThreadExit>() => {}
                Err(payload) => kernel.fail_from_panic(payload),
            }
        })
        .expect("spawn process thread");
}

impl IProcessControl for TestKernel {
    fn fork(
        &self,
        name: &str,
        priority: u32,
        _stack_size: usize,
        tag: ProcessTag,
        entry: ProcessEntry,
    ) -> Result<KernelPid, KernelError> {
        let kernel = self.me.upgrade().expect("kernel is built");
        let (pid, parent) = {
            let mut st = self.state();
            if st.procs.len() >= MAX_PROCESSES {
                return Err(KernelError::TooManyProcesses);
            }
            let parent = st.current();
            let pid = st.next_pid;
            st.next_pid += 1;
            st.procs.insert(
                pid,
                Proc {
                    name: String::from(name),
                    priority,
                    tag,
                    parent: Some(parent),
                    children: Vec::new(),
                    psr: Psr::CURRENT_MODE | Psr::CURRENT_INT,
                    run: RunState::Blocked,
                    joining: false,
                },
            );
            st.proc_mut(parent).children.push(pid);
            st.ready_proc(pid);
            (pid, parent)
        };
        spawn_process_thread(kernel, pid, entry);

        let mut st = self.state();
        if priority < st.procs[&parent].priority {
            // the child outranks us: this fork is a suspension point
            st.ready_proc(parent);
            drop(self.suspend(st, parent));
        }
        Ok(pid)
    }

    fn join(&self, tag: ProcessTag) -> Result<(KernelPid, i32), KernelError> {
        let mut st = self.state();
        let me = st.current();
        loop {
            let tagged: Vec<KernelPid> = st.procs[&me]
                .children
                .iter()
                .copied()
                .filter(|child| st.procs[child].tag == tag)
                .collect();
            if tagged.is_empty() {
                return Err(KernelError::NoChildren);
            }
            let quit = tagged
                .iter()
                .copied()
                .find(|child| matches!(st.procs[child].run, RunState::Zombie(_)));
            if let Some(child) = quit {
                let RunState::Zombie(status) = st.procs[&child].run else {
                    unreachable!()
                };
                st.proc_mut(me).children.retain(|&c| c != child);
                st.procs.remove(&child);
                return Ok((child, status));
            }
            st.proc_mut(me).joining = true;
            st.proc_mut(me).run = RunState::Blocked;
            st = self.suspend(st, me);
            st.proc_mut(me).joining = false;
        }
    }

    fn quit(&self, status: i32) -> ! {
        self.exit_current(status);
        panic_any(ThreadExit)
    }

    fn current_pid(&self) -> KernelPid {
        self.state().current()
    }

    fn proc_info(&self, pid: KernelPid) -> Result<ProcessInfo, KernelError> {
        let st = self.state();
        let proc = st.procs.get(&pid).ok_or(KernelError::InvalidPid)?;
        Ok(ProcessInfo {
            name: proc.name.clone(),
            priority: proc.priority,
            tag: proc.tag,
            state: st.state_of(proc),
            children: proc.children.clone(),
        })
    }
}

impl ISemaphorePool for TestKernel {
    fn create(&self, _name: &str, initial: usize) -> Result<SemaphoreId, KernelError> {
        let mut st = self.state();
        if st.sems.len() >= MAX_SEMAPHORES {
            return Err(KernelError::TooManySemaphores);
        }
        st.sems.push(Sem {
            count: initial,
            waiters: Default::default(),
        });
        Ok(SemaphoreId(st.sems.len() - 1))
    }

    fn up(&self, sem: SemaphoreId) {
        let mut st = self.state();
        // hand the token straight to the first waiter
        let waiter = st.sems.get_mut(sem.0).expect("semaphore exists").waiters.pop_front();
        match waiter {
            Some(waiter) => st.ready_proc(waiter),
            None => st.sems[sem.0].count += 1,
        }
    }

    fn down(&self, sem: SemaphoreId) {
        let mut st = self.state();
        let me = st.current();
        let entry = st.sems.get_mut(sem.0).expect("semaphore exists");
        if entry.count > 0 {
            entry.count -= 1;
            return;
        }
        entry.waiters.push_back(me);
        st.proc_mut(me).run = RunState::Blocked;
        drop(self.suspend(st, me));
    }
}

impl IDeviceQueue for TestKernel {
    fn wait(&self, device: Device) -> Result<i64, KernelError> {
        let mut st = self.state();
        let me = st.current();
        match device {
            Device::Clock => {
                if st.clock.aborted {
                    return Err(KernelError::WaitAborted);
                }
                st.clock.waiters.push(me);
                st.proc_mut(me).run = RunState::Blocked;
                st = self.suspend(st, me);
                if st.clock.aborted {
                    Err(KernelError::WaitAborted)
                } else {
                    Ok(st.clock.now_usec)
                }
            }
            Device::Disk { unit } => {
                let pending = st
                    .disks
                    .get_mut(unit)
                    .and_then(|disk| disk.pending_status.take());
                match pending {
                    Some(status) => Ok(status),
                    None => {
                        drop(st);
                        self.failure(format!("wait on disk {unit} with nothing in flight"))
                    }
                }
            }
        }
    }

    fn wakeup(&self, device: Device, _status: i64, abort: bool) {
        let mut st = self.state();
        match device {
            Device::Clock => {
                if abort {
                    st.clock.aborted = true;
                }
                for pid in std::mem::take(&mut st.clock.waiters) {
                    st.ready_proc(pid);
                }
            }
            Device::Disk { .. } => {}
        }
    }
}

impl IDeviceBus for TestKernel {
    fn input(&self, device: Device) -> Result<Microseconds, DeviceError> {
        self.check_privileged();
        match device {
            Device::Clock => {
                let mut st = self.state();
                st.clock.now_usec += CLOCK_READ_COST_USEC;
                Ok(Microseconds::new(st.clock.now_usec))
            }
            Device::Disk { .. } => Err(DeviceError::UnsupportedRequest),
        }
    }

    fn output(&self, device: Device, request: &DeviceRequest) -> Result<(), DeviceError> {
        self.check_privileged();
        let Device::Disk { unit } = device else {
            return Err(DeviceError::UnsupportedRequest);
        };
        let mut st = self.state();
        if st.disks.get(unit).is_none() {
            return Err(DeviceError::NoDevice);
        }
        match *request {
            DeviceRequest::Seek { track } => {
                if track >= st.disks[unit].tracks {
                    drop(st);
                    self.failure(format!("disk {unit}: seek past track {track}"));
                }
                let disk = &mut st.disks[unit];
                disk.current_track = track;
                disk.pending_status = Some(0);
            }
            DeviceRequest::ReadSector { sector, buffer } => {
                let disk = &mut st.disks[unit];
                let offset = disk.sector_offset(sector);
                // SAFETY: the submitting process owns the buffer and stays
                // blocked until the driver signals completion.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        disk.media[offset..].as_ptr(),
                        buffer,
                        constants::DISK_SECTOR_SIZE,
                    );
                }
                disk.pending_status = Some(0);
            }
            DeviceRequest::WriteSector { sector, buffer } => {
                let disk = &mut st.disks[unit];
                let offset = disk.sector_offset(sector);
                // SAFETY: as above.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        buffer,
                        disk.media[offset..].as_mut_ptr(),
                        constants::DISK_SECTOR_SIZE,
                    );
                }
                disk.pending_status = Some(0);
            }
            DeviceRequest::TrackCount { count } => {
                let disk = &mut st.disks[unit];
                // SAFETY: the probing process passes a pointer to its own
                // local and waits for the completion before reading it.
                unsafe { *count = disk.tracks };
                disk.pending_status = Some(0);
            }
        }
        Ok(())
    }
}

impl ICpu for TestKernel {
    fn psr(&self) -> Psr {
        self.state().current_proc().psr
    }

    fn set_psr(&self, psr: Psr) {
        self.check_privileged();
        let mut st = self.state();
        let me = st.current();
        st.proc_mut(me).psr = psr;
    }

    fn install_trap_handler(&self, kind: TrapKind, handler: Arc<dyn ITrapHandler>) {
        self.handlers.lock()[handler_index(kind)] = Some(handler);
    }

    fn trap(&self, frame: &mut TrapFrame) {
        let saved = {
            let mut st = self.state();
            let me = st.current();
            let saved = st.procs[&me].psr;
            st.proc_mut(me).psr = saved.trap_entry();
            saved
        };
        let handler = self.handlers.lock()[handler_index(TrapKind::Syscall)].clone();
        match handler {
            Some(handler) => handler.handle(Trap::Syscall(frame)),
            None => self.failure(String::from("syscall trap with no handler installed")),
        }
        let mut st = self.state();
        let me = st.current();
        st.proc_mut(me).psr = saved;
    }

    fn raise_illegal_instruction(&self) -> ! {
        {
            let mut st = self.state();
            let me = st.current();
            let entered = st.procs[&me].psr.trap_entry();
            st.proc_mut(me).psr = entered;
        }
        let handler = self.handlers.lock()[handler_index(TrapKind::IllegalInstruction)].clone();
        match handler {
            Some(handler) => {
                handler.handle(Trap::IllegalInstruction);
                self.failure(String::from("illegal-instruction handler returned"))
            }
            None => self.failure(String::from("illegal instruction with no handler installed")),
        }
    }

    fn halt(&self, status: i32) -> ! {
        let mut st = self.state();
        if st.halt.is_none() {
            st.halt = Some(HaltCause::Halted(status));
        }
        st.running = None;
        self.wake.notify_all();
        drop(st);
        panic_any(ThreadExit)
    }
}

impl IKernel for TestKernel {
    fn procs(&self) -> Arc<dyn IProcessControl> {
        self.me.upgrade().expect("kernel is built")
    }

    fn semaphores(&self) -> Arc<dyn ISemaphorePool> {
        self.me.upgrade().expect("kernel is built")
    }

    fn device_queue(&self) -> Arc<dyn IDeviceQueue> {
        self.me.upgrade().expect("kernel is built")
    }

    fn device_bus(&self) -> Arc<dyn IDeviceBus> {
        self.me.upgrade().expect("kernel is built")
    }

    fn cpu(&self) -> Arc<dyn ICpu> {
        self.me.upgrade().expect("kernel is built")
    }
}
