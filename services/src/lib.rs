//! Layer-2 kernel services: user-process supervision, the clock driver, and
//! the disk drivers.
//!
//! Everything here runs in kernel mode on top of the layer-1 process kernel,
//! reached through the [`kernel_abstractions::IKernel`] bundle. User code
//! reaches these services through the syscall trap only; the
//! [`UserProcessServices`] dispatcher owns the handler table and the
//! privilege boundary.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

use constants::ServiceError;
use kernel_abstractions::{ICpu, Psr, TrapFrame};

mod proc;
pub use proc::{is_supported_syscall, StartRoutine, UserProcessServices};

mod clock;
pub use clock::ClockService;

mod disk;
pub use disk::{DiskGeometry, DiskService};

/// A registered syscall handler. Handlers unpack their arguments from the
/// trap frame and pack results (and the `rc` slot) back before returning.
pub trait ISyscallHandler: Send + Sync {
    fn handle(&self, frame: &mut TrapFrame);

    fn name(&self) -> &str;
}

pub trait ISyscallResult {
    /// The value for the frame's `rc` slot: `0` on success, the error code
    /// otherwise.
    fn as_rc(&self) -> isize;
}

impl<T> ISyscallResult for Result<T, ServiceError> {
    fn as_rc(&self) -> isize {
        match self {
            Ok(_) => 0,
            Err(err) => err.code(),
        }
    }
}

/// Every service entry point runs under this guard: a caller whose mode bit
/// is clear is thrown to the illegal-instruction handler, not given an error.
pub(crate) fn require_kernel_mode(cpu: &dyn ICpu) {
    if !cpu.psr().is_kernel_mode() {
        log::error!("kernel service entered from user mode");
        cpu.raise_illegal_instruction();
    }
}

pub(crate) fn enable_interrupts(cpu: &dyn ICpu) {
    cpu.set_psr(cpu.psr() | Psr::CURRENT_INT);
}
