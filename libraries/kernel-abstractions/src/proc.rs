use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

/// Pid in the layer-1 process table. User code never sees one of these; the
/// services translate to and from compact user pids.
pub type KernelPid = u32;

/// Handle to a layer-1 semaphore.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SemaphoreId(pub usize);

/// The population a process belongs to. Joins filter on it and the
/// illegal-instruction handler selects the fault response with it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessTag {
    Kernel,
    User,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Ready,
    Blocked,
    Quit,
}

/// Snapshot of a layer-1 process. `children` includes children that have
/// quit but are not yet joined; orphan bookkeeping depends on seeing them.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub name: String,
    pub priority: u32,
    pub tag: ProcessTag,
    pub state: ProcessState,
    pub children: Vec<KernelPid>,
}

/// Entry point of a forked kernel process. The returned status is the quit
/// status if the process falls off the end of its entry.
pub type ProcessEntry = Box<dyn FnOnce() -> i32 + Send + 'static>;

/// Compact index into the user-process table; the only pid user code sees.
pub type UserPid = usize;

/// The view of a user process returned by the GetProcInfo syscall. Children
/// are user pids; kernel pids never cross the trap boundary.
#[derive(Debug, Clone)]
pub struct UserProcessInfo {
    pub name: String,
    pub priority: u32,
    pub state: ProcessState,
    pub children: Vec<UserPid>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KernelError {
    TooManyProcesses,
    NoChildren,
    InvalidPid,
    TooManySemaphores,
    /// A device wait was cut short by an abort wakeup; drivers treat this as
    /// their shutdown signal.
    WaitAborted,
}
