//! Host-side stand-in for the layer-1 kernel and the machine simulator.
//!
//! [`kernel::TestKernel`] implements every `kernel-abstractions` trait on top
//! of std threads, but scheduling stays faithful to the real machine: one
//! process runs at a time, control moves only at the documented suspension
//! points (fork of a higher-priority child, join, quit, semaphore P, device
//! wait), and the clock is virtual — it advances only when every process is
//! blocked, so timing tests are deterministic and instant.
//!
//! [`user`] holds the user-mode syscall trampolines the test programs call.

pub mod kernel;
pub mod user;

mod sched;

#[cfg(feature = "test_log")]
mod logging;
