//! The privilege boundary: privileged instructions and bad syscall numbers
//! from user mode kill the offender, never the kernel.

use constants::{MIN_STACK, USER_FAULT_STATUS};
use kernel_abstractions::{Device, IKernel, TrapFrame};
use services::UserProcessServices;
use test_utilities::kernel::TestKernel;
use test_utilities::user;

fn reads_the_clock_register(_: usize) -> i32 {
    // device registers are privileged; this never comes back
    let _ = user::current_kernel().device_bus().input(Device::Clock);
    unreachable!("survived a privileged instruction in user mode")
}

#[test]
fn privileged_instruction_terminates_the_user_process() {
    let kernel = TestKernel::new().build();
    TestKernel::run(&kernel, {
        let kernel = kernel.clone();
        move || {
            let procs = UserProcessServices::init(kernel);
            let pid = procs
                .spawn("outlaw", reads_the_clock_register, 0, MIN_STACK, 2)
                .expect("spawn");
            assert_eq!(procs.wait(), Ok((pid, USER_FAULT_STATUS)));

            // the kernel survived; service keeps working
            let pid = procs
                .spawn("survivor", |_| 3, 0, MIN_STACK, 2)
                .expect("spawn after the fault");
            assert_eq!(procs.wait(), Ok((pid, 3)));
            0
        }
    });
}

fn issues_syscall_99(_: usize) -> i32 {
    let mut frame = TrapFrame::new(99);
    user::syscall(&mut frame);
    unreachable!("survived an invalid syscall number")
}

#[test]
fn invalid_syscall_number_terminates_the_user_process() {
    let kernel = TestKernel::new().build();
    TestKernel::run(&kernel, {
        let kernel = kernel.clone();
        move || {
            let procs = UserProcessServices::init(kernel);
            let pid = procs
                .spawn("bad-number", issues_syscall_99, 0, MIN_STACK, 2)
                .expect("spawn");
            assert_eq!(procs.wait(), Ok((pid, USER_FAULT_STATUS)));
            0
        }
    });
}

fn issues_unregistered_sleep(_: usize) -> i32 {
    // a listed number whose service was never initialized
    let mut frame = TrapFrame::new(constants::syscall_ids::SYS_SLEEP);
    user::syscall(&mut frame);
    unreachable!("survived a syscall with no registered handler")
}

#[test]
fn listed_but_unregistered_syscall_terminates_the_user_process() {
    let kernel = TestKernel::new().build();
    TestKernel::run(&kernel, {
        let kernel = kernel.clone();
        move || {
            let procs = UserProcessServices::init(kernel);
            let pid = procs
                .spawn("early-riser", issues_unregistered_sleep, 0, MIN_STACK, 2)
                .expect("spawn");
            assert_eq!(procs.wait(), Ok((pid, USER_FAULT_STATUS)));
            0
        }
    });
}
