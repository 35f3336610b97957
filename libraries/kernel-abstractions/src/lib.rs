//! Trait-level contract between the layer-2 services and their two
//! collaborators: the layer-1 process kernel (fork/join/quit, semaphores,
//! device wait queues) and the machine simulator (PSR, trap vector, device
//! registers).
//!
//! The services never see a concrete kernel; everything is reached through
//! an [`IKernel`] bundle so that a host-side test kernel can stand in for
//! the real thing.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

use alloc::sync::Arc;
use downcast_rs::{impl_downcast, Downcast};
use timing::Microseconds;

mod cpu;
pub use cpu::{ITrapHandler, Psr, Trap, TrapFrame, TrapKind};

mod device;
pub use device::{Device, DeviceError, DeviceRequest};

mod proc;
pub use proc::{
    KernelError, KernelPid, ProcessEntry, ProcessInfo, ProcessState, ProcessTag, SemaphoreId,
    UserPid, UserProcessInfo,
};

/// Layer-1 process control: fork, join, quit, procinfo.
pub trait IProcessControl: Downcast + Send + Sync {
    /// Fork a kernel process running `entry`. Smaller `priority` values are
    /// dispatched first; a child that outranks its parent runs before this
    /// call returns.
    fn fork(
        &self,
        name: &str,
        priority: u32,
        stack_size: usize,
        tag: ProcessTag,
        entry: ProcessEntry,
    ) -> Result<KernelPid, KernelError>;

    /// Block until a child carrying `tag` has quit, then reap it.
    fn join(&self, tag: ProcessTag) -> Result<(KernelPid, i32), KernelError>;

    /// Terminate the calling process. Does not return.
    fn quit(&self, status: i32) -> !;

    fn current_pid(&self) -> KernelPid;

    fn proc_info(&self, pid: KernelPid) -> Result<ProcessInfo, KernelError>;
}

impl_downcast!(IProcessControl);

/// Layer-1 counting semaphores.
pub trait ISemaphorePool: Downcast + Send + Sync {
    fn create(&self, name: &str, initial: usize) -> Result<SemaphoreId, KernelError>;

    /// V. Readies one waiter if any, otherwise increments the count. Never a
    /// suspension point for the caller.
    fn up(&self, sem: SemaphoreId);

    /// P. Suspends the caller while the count is zero.
    fn down(&self, sem: SemaphoreId);
}

impl_downcast!(ISemaphorePool);

/// Layer-1 per-device wait queues.
pub trait IDeviceQueue: Downcast + Send + Sync {
    /// Block until the device's next interrupt and return its status
    /// (the clock reports the current time in microseconds).
    /// [`KernelError::WaitAborted`] means a shutdown wakeup.
    fn wait(&self, device: Device) -> Result<i64, KernelError>;

    fn wakeup(&self, device: Device, status: i64, abort: bool);
}

impl_downcast!(IDeviceQueue);

/// Simulator device registers.
pub trait IDeviceBus: Downcast + Send + Sync {
    /// Read the device input register. For the clock this is the monotonic
    /// microsecond counter. Privileged.
    fn input(&self, device: Device) -> Result<Microseconds, DeviceError>;

    /// Issue a request to the device output register; completion is observed
    /// through [`IDeviceQueue::wait`]. Privileged.
    fn output(&self, device: Device, request: &DeviceRequest) -> Result<(), DeviceError>;
}

impl_downcast!(IDeviceBus);

/// Simulator CPU: processor status register and trap vector.
pub trait ICpu: Downcast + Send + Sync {
    fn psr(&self) -> Psr;

    /// Write the PSR. Privileged: clearing your own mode bit is the last
    /// privileged thing a process gets to do.
    fn set_psr(&self, psr: Psr);

    fn install_trap_handler(&self, kind: TrapKind, handler: Arc<dyn ITrapHandler>);

    /// Execute the trap instruction: enter kernel mode, run the installed
    /// syscall handler on `frame`, restore the previous PSR. Legal from user
    /// mode; this is the only way across the privilege boundary.
    fn trap(&self, frame: &mut TrapFrame);

    /// Raise the illegal-instruction trap. The installed handler decides the
    /// offender's fate; with no handler installed the machine halts.
    fn raise_illegal_instruction(&self) -> !;

    fn halt(&self, status: i32) -> !;
}

impl_downcast!(ICpu);

/// Accessor bundle handed to every service at init.
pub trait IKernel: Downcast + Send + Sync {
    fn procs(&self) -> Arc<dyn IProcessControl>;

    fn semaphores(&self) -> Arc<dyn ISemaphorePool>;

    fn device_queue(&self) -> Arc<dyn IDeviceQueue>;

    fn device_bus(&self) -> Arc<dyn IDeviceBus>;

    fn cpu(&self) -> Arc<dyn ICpu>;
}

impl_downcast!(IKernel);
