#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate std;

mod errno;
pub use errno::ServiceError;

pub mod syscall_ids;

/// Capacity of the user-process table; also the layer-1 process table size.
pub const MAX_PROCESSES: usize = 50;

/// Size of the syscall vector. Valid numbers are a sparse subset, see
/// [`syscall_ids`].
pub const MAX_SYSCALLS: usize = 50;

/// Layer-1 semaphore budget shared by every service.
pub const MAX_SEMAPHORES: usize = 200;

/// Smallest stack a forked process may request, in bytes.
pub const MIN_STACK: usize = 16 * 1024;

/// Priority of kernel driver processes. Smaller values are more urgent;
/// user processes are confined to 1..=6, so drivers always outrank them.
pub const DRIVER_PRIORITY: u32 = 0;

/// Exit status applied by the illegal-instruction handler to a kernel-tagged
/// offender.
pub const KERNEL_FAULT_STATUS: i32 = 1024;

/// Exit status applied by the illegal-instruction handler to a user-tagged
/// offender.
pub const USER_FAULT_STATUS: i32 = 2048;

pub const DISK_UNITS: usize = 2;

pub const DISK_SECTOR_SIZE: usize = 512;

/// Sectors per track.
pub const DISK_TRACK_SIZE: usize = 16;

// Per-unit request ring capacity. Each slot pins a completion semaphore, and
// every unit additionally owns a pending and a free-slot semaphore, so the
// capacity is kept to a fraction of the semaphore budget.
pub const DISK_QUEUE_CAPACITY: usize = MAX_SEMAPHORES / 12;

const _: () = assert!(DISK_QUEUE_CAPACITY >= 8);
