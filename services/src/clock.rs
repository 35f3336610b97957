//! Clock service: one kernel driver process fielding clock interrupts and a
//! multi-client sleep primitive with per-slot wakeup semaphores.

use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

use constants::syscall_ids::SYS_SLEEP;
use constants::{ServiceError, DRIVER_PRIORITY, MAX_PROCESSES, MIN_STACK};
use hermit_sync::SpinMutex;
use kernel_abstractions::{
    Device, IKernel, KernelError, ProcessTag, SemaphoreId, TrapFrame,
};
use timing::{Microseconds, TimeSpan};

use crate::{enable_interrupts, require_kernel_mode, ISyscallHandler, ISyscallResult, UserProcessServices};

/// `active` marks slot ownership and is cleared by the sleeping process once
/// it has woken; `asleep` marks a pending wakeup and is cleared by the driver
/// when it signals. The split keeps the wakeup semaphore binary: the driver
/// never signals the same registration twice.
#[derive(Copy, Clone)]
struct SleeperSlot {
    active: bool,
    asleep: bool,
    start: Microseconds,
    duration: TimeSpan,
}

impl SleeperSlot {
    const IDLE: SleeperSlot = SleeperSlot {
        active: false,
        asleep: false,
        start: Microseconds::zero(),
        duration: TimeSpan::zero(),
    };
}

pub struct ClockService {
    kernel: Arc<dyn IKernel>,
    sleepers: SpinMutex<[SleeperSlot; MAX_PROCESSES]>,
    wakeups: Vec<SemaphoreId>,
}

impl ClockService {
    /// Create the sleeper table, register the sleep stub, and fork the clock
    /// driver above every user priority.
    pub fn init(
        kernel: Arc<dyn IKernel>,
        procs: &Arc<UserProcessServices>,
    ) -> Arc<ClockService> {
        require_kernel_mode(&*kernel.cpu());

        let semaphores = kernel.semaphores();
        let mut wakeups = Vec::with_capacity(MAX_PROCESSES);
        for slot in 0..MAX_PROCESSES {
            let sem = semaphores
                .create(&format!("sleeper{slot}"), 0)
                .expect("semaphore budget covers the sleeper table");
            wakeups.push(sem);
        }

        let service = Arc::new(ClockService {
            kernel: kernel.clone(),
            sleepers: SpinMutex::new([SleeperSlot::IDLE; MAX_PROCESSES]),
            wakeups,
        });

        procs
            .set_syscall_handler(SYS_SLEEP, Arc::new(SleepSyscall(service.clone())))
            .expect("sleep stub uses a listed number");

        enable_interrupts(&*kernel.cpu());
        let driver = service.clone();
        kernel
            .procs()
            .fork(
                "clock driver",
                DRIVER_PRIORITY,
                MIN_STACK,
                ProcessTag::Kernel,
                Box::new(move || driver.drive()),
            )
            .expect("clock driver fork");

        service
    }

    /// Block the caller for at least `seconds` whole seconds of device time.
    pub fn sleep(&self, seconds: i64) -> Result<(), ServiceError> {
        require_kernel_mode(&*self.kernel.cpu());
        if seconds < 0 {
            return Err(ServiceError::InvalidSeconds);
        }

        let now = self
            .kernel
            .device_bus()
            .input(Device::Clock)
            .expect("clock device is present");
        let slot = {
            let mut sleepers = self.sleepers.lock();
            let slot = sleepers
                .iter()
                .position(|s| !s.active)
                .expect("sleeper table outlasts the process table");
            sleepers[slot] = SleeperSlot {
                active: true,
                asleep: true,
                start: now,
                duration: TimeSpan::from_seconds(seconds),
            };
            slot
        };

        self.kernel.semaphores().down(self.wakeups[slot]);
        self.sleepers.lock()[slot].active = false;
        Ok(())
    }

    /// Abort the driver's device wait. No sleeper may register after this.
    pub fn shutdown(&self) {
        require_kernel_mode(&*self.kernel.cpu());
        self.kernel.device_queue().wakeup(Device::Clock, 0, true);
    }

    fn drive(&self) -> i32 {
        log::debug!("clock driver running");
        let queue = self.kernel.device_queue();
        loop {
            match queue.wait(Device::Clock) {
                Ok(_) => self.wake_due_sleepers(),
                Err(KernelError::WaitAborted) => break,
                Err(err) => unreachable!("clock wait failed: {:?}", err),
            }
        }
        log::debug!("clock driver stopped");
        0
    }

    /// One pass: read the clock once and signal every due sleeper before
    /// blocking again.
    fn wake_due_sleepers(&self) {
        let now = self
            .kernel
            .device_bus()
            .input(Device::Clock)
            .expect("clock device is present");
        let semaphores = self.kernel.semaphores();
        let mut sleepers = self.sleepers.lock();
        for (slot, sleeper) in sleepers.iter_mut().enumerate() {
            if sleeper.active && sleeper.asleep && now - sleeper.start >= sleeper.duration {
                sleeper.asleep = false;
                semaphores.up(self.wakeups[slot]);
            }
        }
    }
}

struct SleepSyscall(Arc<ClockService>);

impl ISyscallHandler for SleepSyscall {
    fn handle(&self, frame: &mut TrapFrame) {
        let seconds = frame.arg1 as isize as i64;
        frame.arg4 = self.0.sleep(seconds).as_rc() as usize;
    }

    fn name(&self) -> &str {
        "sys_sleep"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utilities::kernel::TestKernel;

    #[test]
    fn negative_duration_is_rejected() {
        let kernel = TestKernel::new().build();
        TestKernel::run(&kernel, {
            let kernel = kernel.clone();
            move || {
                let procs = UserProcessServices::init(kernel.clone());
                let clock = ClockService::init(kernel, &procs);
                assert_eq!(clock.sleep(-1), Err(ServiceError::InvalidSeconds));
                clock.shutdown();
                0
            }
        });
    }

    #[test]
    fn zero_duration_returns_on_the_next_tick() {
        let kernel = TestKernel::new().build();
        TestKernel::run(&kernel, {
            let kernel = kernel.clone();
            move || {
                let procs = UserProcessServices::init(kernel.clone());
                let clock = ClockService::init(kernel, &procs);
                assert_eq!(clock.sleep(0), Ok(()));
                clock.shutdown();
                0
            }
        });
    }
}
