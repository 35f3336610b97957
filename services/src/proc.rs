//! User-process services: the supervisor that projects untagged layer-1
//! processes into the kernel/user split, routes traps, and implements
//! spawn/wait/terminate with orphan accounting.

use alloc::borrow::ToOwned;
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::ffi::{c_char, CStr};

use constants::syscall_ids::{
    SYS_GETPID, SYS_GETPROCINFO, SYS_GETTIMEOFDAY, SYS_SPAWN, SYS_TERMINATE, SYS_WAIT,
};
use constants::{
    ServiceError, KERNEL_FAULT_STATUS, MAX_PROCESSES, MAX_SYSCALLS, USER_FAULT_STATUS,
};
use hermit_sync::SpinMutex;
use kernel_abstractions::{
    ICpu, IKernel, KernelError, KernelPid, ProcessEntry, ProcessTag, Psr, Trap, TrapFrame,
    TrapKind, UserPid, UserProcessInfo,
};
use timing::Microseconds;

use crate::{require_kernel_mode, ISyscallHandler, ISyscallResult};

/// Start routine of a user process. Thin function pointer so it fits a trap
/// frame cell; the opaque argument travels beside it.
pub type StartRoutine = fn(usize) -> i32;

/// The sparse allow-list of syscall numbers. Anything else raises the
/// illegal-instruction trap when dispatched.
pub fn is_supported_syscall(number: usize) -> bool {
    use constants::syscall_ids::*;
    number < MAX_SYSCALLS
        && matches!(
            number,
            SYS_SPAWN..=SYS_TERMINATE | SYS_SLEEP | SYS_DISKREAD..=SYS_DISKSIZE
                | SYS_GETTIMEOFDAY..=SYS_GETPID
        )
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SlotState {
    Unused,
    Initialized,
    Terminated,
}

/// One entry of the user-process table. Slots cycle
/// Unused -> Initialized -> Terminated -> Unused; an orphan collapses from
/// Terminated (or Initialized, at its own terminate) straight back to Unused
/// because no wait will ever reap it.
#[derive(Copy, Clone)]
struct ProcessSlot {
    kernel_pid: Option<KernelPid>,
    state: SlotState,
    start: Option<(StartRoutine, usize)>,
    exit_status: i32,
    orphan: bool,
}

impl ProcessSlot {
    const UNUSED: ProcessSlot = ProcessSlot {
        kernel_pid: None,
        state: SlotState::Unused,
        start: None,
        exit_status: 0,
        orphan: false,
    };
}

fn slot_index_of(table: &[ProcessSlot; MAX_PROCESSES], kernel_pid: KernelPid) -> Option<usize> {
    table
        .iter()
        .position(|slot| slot.state != SlotState::Unused && slot.kernel_pid == Some(kernel_pid))
}

pub struct UserProcessServices {
    me: Weak<UserProcessServices>,
    kernel: Arc<dyn IKernel>,
    table: SpinMutex<[ProcessSlot; MAX_PROCESSES]>,
    handlers: SpinMutex<[Option<Arc<dyn ISyscallHandler>>; MAX_SYSCALLS]>,
}

impl UserProcessServices {
    /// Install the trap handlers and the six process-service stubs. Must run
    /// before either driver service initializes.
    pub fn init(kernel: Arc<dyn IKernel>) -> Arc<UserProcessServices> {
        require_kernel_mode(&*kernel.cpu());

        let services = Arc::new_cyclic(|me| UserProcessServices {
            me: me.clone(),
            kernel: kernel.clone(),
            table: SpinMutex::new([ProcessSlot::UNUSED; MAX_PROCESSES]),
            handlers: SpinMutex::new(core::array::from_fn(|_| None)),
        });

        let cpu = kernel.cpu();
        cpu.install_trap_handler(TrapKind::Syscall, services.clone());
        cpu.install_trap_handler(TrapKind::IllegalInstruction, services.clone());

        let stubs: [(usize, Arc<dyn ISyscallHandler>); 6] = [
            (SYS_SPAWN, Arc::new(SpawnSyscall(services.clone()))),
            (SYS_WAIT, Arc::new(WaitSyscall(services.clone()))),
            (SYS_TERMINATE, Arc::new(TerminateSyscall(services.clone()))),
            (SYS_GETTIMEOFDAY, Arc::new(GetTimeOfDaySyscall(services.clone()))),
            (SYS_GETPROCINFO, Arc::new(GetProcInfoSyscall(services.clone()))),
            (SYS_GETPID, Arc::new(GetPidSyscall(services.clone()))),
        ];
        for (number, stub) in stubs {
            services
                .set_syscall_handler(number, stub)
                .expect("process service stubs use listed numbers");
        }

        services
    }

    /// Register `handler` for a syscall number on the allow-list.
    pub fn set_syscall_handler(
        &self,
        number: usize,
        handler: Arc<dyn ISyscallHandler>,
    ) -> Result<(), ServiceError> {
        require_kernel_mode(&*self.kernel.cpu());
        if !is_supported_syscall(number) {
            return Err(ServiceError::InvalidSyscall);
        }
        self.handlers.lock()[number] = Some(handler);
        Ok(())
    }

    /// Create a user-tagged process running `func(arg)` in user mode.
    pub fn spawn(
        &self,
        name: &str,
        func: StartRoutine,
        arg: usize,
        stack_size: usize,
        priority: u32,
    ) -> Result<UserPid, ServiceError> {
        require_kernel_mode(&*self.kernel.cpu());

        let pid = {
            let mut table = self.table.lock();
            let Some(pid) = table.iter().position(|slot| slot.state == SlotState::Unused) else {
                return Err(ServiceError::TooManyProcesses);
            };
            table[pid] = ProcessSlot {
                kernel_pid: None,
                state: SlotState::Initialized,
                start: Some((func, arg)),
                exit_status: 0,
                orphan: false,
            };
            pid
        };

        let services = self.me.upgrade().expect("services created through init");
        let entry: ProcessEntry = Box::new(move || launch(services, pid));
        match self
            .kernel
            .procs()
            .fork(name, priority, stack_size, ProcessTag::User, entry)
        {
            Ok(kernel_pid) => {
                // The child may already have recorded this itself (or even
                // terminated) if it outranked us; the value is identical.
                self.table.lock()[pid].kernel_pid = Some(kernel_pid);
                Ok(pid)
            }
            Err(KernelError::TooManyProcesses) => {
                self.table.lock()[pid] = ProcessSlot::UNUSED;
                Err(ServiceError::TooManyProcesses)
            }
            Err(err) => unreachable!("fork failed: {:?}", err),
        }
    }

    /// Reap one terminated user child: returns its user pid and exit status.
    pub fn wait(&self) -> Result<(UserPid, i32), ServiceError> {
        require_kernel_mode(&*self.kernel.cpu());

        let (kernel_pid, _) = self.kernel.procs().join(ProcessTag::User).map_err(|err| {
            match err {
                KernelError::NoChildren => ServiceError::NoChildren,
                other => unreachable!("join failed: {:?}", other),
            }
        })?;

        let mut table = self.table.lock();
        let pid = slot_index_of(&table, kernel_pid).expect("joined pid has a table slot");
        assert_eq!(
            table[pid].state,
            SlotState::Terminated,
            "joined child must have terminated"
        );
        let status = table[pid].exit_status;
        table[pid] = ProcessSlot::UNUSED;
        Ok((pid, status))
    }

    /// Record the exit status, orphan the caller's children, and quit.
    pub fn terminate(&self, status: i32) -> ! {
        require_kernel_mode(&*self.kernel.cpu());

        let procs = self.kernel.procs();
        let info = procs
            .proc_info(procs.current_pid())
            .expect("caller has a process record");
        {
            let mut table = self.table.lock();
            let pid = slot_index_of(&table, procs.current_pid())
                .expect("caller occupies a user-process slot");
            table[pid].exit_status = status;
            if table[pid].orphan {
                table[pid] = ProcessSlot::UNUSED;
            } else {
                table[pid].state = SlotState::Terminated;
            }
            for &child in &info.children {
                if let Some(child_pid) = slot_index_of(&table, child) {
                    table[child_pid].orphan = true;
                    if table[child_pid].state == SlotState::Terminated {
                        table[child_pid] = ProcessSlot::UNUSED;
                    }
                }
            }
        }
        procs.quit(status)
    }

    /// The user pid of a live user process, with children translated back to
    /// user pids.
    pub fn proc_info(&self, pid: UserPid) -> Result<UserProcessInfo, ServiceError> {
        require_kernel_mode(&*self.kernel.cpu());

        let kernel_pid = {
            let table = self.table.lock();
            if pid >= MAX_PROCESSES || table[pid].state == SlotState::Unused {
                return Err(ServiceError::InvalidPid);
            }
            table[pid].kernel_pid.ok_or(ServiceError::InvalidPid)?
        };
        let info = self.kernel.procs().proc_info(kernel_pid).map_err(|err| match err {
            KernelError::InvalidPid => ServiceError::InvalidPid,
            other => unreachable!("proc info failed: {:?}", other),
        })?;

        let table = self.table.lock();
        let children = info
            .children
            .iter()
            .filter_map(|&child| slot_index_of(&table, child))
            .collect::<Vec<_>>();
        Ok(UserProcessInfo {
            name: info.name,
            priority: info.priority,
            state: info.state,
            children,
        })
    }

    /// The calling process's user pid.
    pub fn current_user_pid(&self) -> UserPid {
        require_kernel_mode(&*self.kernel.cpu());
        let table = self.table.lock();
        slot_index_of(&table, self.kernel.procs().current_pid())
            .expect("caller occupies a user-process slot")
    }

    /// Current time from the clock device.
    pub fn time_of_day(&self) -> Microseconds {
        require_kernel_mode(&*self.kernel.cpu());
        self.kernel
            .device_bus()
            .input(kernel_abstractions::Device::Clock)
            .expect("clock device is present")
    }

    /// Slots not in the Unused state; the table drains back to zero once
    /// every child has been reaped or orphaned away.
    pub fn slots_in_use(&self) -> usize {
        self.table
            .lock()
            .iter()
            .filter(|slot| slot.state != SlotState::Unused)
            .count()
    }

    fn dispatch_syscall(&self, frame: &mut TrapFrame) {
        let handler = if is_supported_syscall(frame.number) {
            self.handlers.lock()[frame.number].clone()
        } else {
            None
        };
        match handler {
            Some(handler) => {
                log::trace!("syscall {} -> {}", frame.number, handler.name());
                handler.handle(frame);
            }
            None => {
                log::warn!("syscall number {} has no handler", frame.number);
                self.kernel.cpu().raise_illegal_instruction();
            }
        }
    }

    /// A kernel-tagged offender is a kernel bug; a user-tagged offender is a
    /// contained user error.
    fn handle_illegal_instruction(&self) {
        let procs = self.kernel.procs();
        let info = procs
            .proc_info(procs.current_pid())
            .expect("current process has a record");
        match info.tag {
            ProcessTag::Kernel => {
                log::error!("illegal instruction in kernel process {:?}", info.name);
                procs.quit(KERNEL_FAULT_STATUS)
            }
            ProcessTag::User => {
                log::warn!("illegal instruction in user process {:?}", info.name);
                self.terminate(USER_FAULT_STATUS)
            }
        }
    }
}

impl kernel_abstractions::ITrapHandler for UserProcessServices {
    fn handle(&self, trap: Trap<'_>) {
        match trap {
            Trap::Syscall(frame) => self.dispatch_syscall(frame),
            Trap::IllegalInstruction => self.handle_illegal_instruction(),
        }
    }
}

/// Trampoline every spawned child starts in. Runs in kernel mode just long
/// enough to self-register and fetch its start routine, then drops the mode
/// bit (under no lock) and enters user code. The only way back out is the
/// terminate syscall.
fn launch(services: Arc<UserProcessServices>, pid: UserPid) -> i32 {
    let kernel = services.kernel.clone();
    let (func, arg) = {
        let mut table = services.table.lock();
        table[pid].kernel_pid = Some(kernel.procs().current_pid());
        table[pid].start.take().expect("start routine recorded at spawn")
    };

    drop_to_user_mode(&*kernel.cpu());
    let status = func(arg);

    let mut frame = TrapFrame::new(SYS_TERMINATE);
    frame.arg1 = status as usize;
    kernel.cpu().trap(&mut frame);
    unreachable!("terminate syscall returned")
}

fn drop_to_user_mode(cpu: &dyn ICpu) {
    let mut psr = cpu.psr();
    psr.remove(Psr::CURRENT_MODE);
    cpu.set_psr(psr);
}

struct SpawnSyscall(Arc<UserProcessServices>);

impl ISyscallHandler for SpawnSyscall {
    fn handle(&self, frame: &mut TrapFrame) {
        // SAFETY: the user trampoline packs a fn(usize) -> i32 into arg1 and
        // a NUL-terminated name pointer into arg5; both outlive the trap.
        let func: StartRoutine = unsafe { core::mem::transmute(frame.arg1) };
        let name = unsafe { CStr::from_ptr(frame.arg5 as *const c_char) }
            .to_str()
            .unwrap_or("")
            .to_owned();
        let arg = frame.arg2;
        let stack_size = frame.arg3;
        let priority = frame.arg4 as u32;

        let result = self.0.spawn(&name, func, arg, stack_size, priority);
        if let Ok(pid) = result {
            frame.arg1 = pid;
        }
        frame.arg4 = result.as_rc() as usize;
    }

    fn name(&self) -> &str {
        "sys_spawn"
    }
}

struct WaitSyscall(Arc<UserProcessServices>);

impl ISyscallHandler for WaitSyscall {
    fn handle(&self, frame: &mut TrapFrame) {
        let result = self.0.wait();
        frame.arg4 = result.as_rc() as usize;
        let (pid, status) = result.unwrap_or((0, 0));
        frame.arg1 = pid;
        frame.arg2 = status as usize;
    }

    fn name(&self) -> &str {
        "sys_wait"
    }
}

struct TerminateSyscall(Arc<UserProcessServices>);

impl ISyscallHandler for TerminateSyscall {
    fn handle(&self, frame: &mut TrapFrame) {
        self.0.terminate(frame.arg1 as i32)
    }

    fn name(&self) -> &str {
        "sys_terminate"
    }
}

struct GetTimeOfDaySyscall(Arc<UserProcessServices>);

impl ISyscallHandler for GetTimeOfDaySyscall {
    fn handle(&self, frame: &mut TrapFrame) {
        frame.arg1 = self.0.time_of_day().as_i64() as usize;
    }

    fn name(&self) -> &str {
        "sys_gettimeofday"
    }
}

struct GetProcInfoSyscall(Arc<UserProcessServices>);

impl ISyscallHandler for GetProcInfoSyscall {
    fn handle(&self, frame: &mut TrapFrame) {
        let result = self.0.proc_info(frame.arg1);
        if let Ok(info) = &result {
            // SAFETY: arg2 points at a UserProcessInfo owned by the caller
            // for the duration of the trap.
            unsafe { *(frame.arg2 as *mut UserProcessInfo) = info.clone() };
        }
        frame.arg4 = result.as_rc() as usize;
    }

    fn name(&self) -> &str {
        "sys_getprocinfo"
    }
}

struct GetPidSyscall(Arc<UserProcessServices>);

impl ISyscallHandler for GetPidSyscall {
    fn handle(&self, frame: &mut TrapFrame) {
        frame.arg1 = self.0.current_user_pid();
    }

    fn name(&self) -> &str {
        "sys_getpid"
    }
}
