//! User-mode syscall trampolines for test programs.
//!
//! Each function packs its arguments into a [`TrapFrame`] following the
//! fixed per-syscall convention and executes the trap instruction of the
//! kernel the calling process belongs to. These are the only calls a
//! user-mode process may make; everything else is privileged.

use std::cell::RefCell;
use std::ffi::CString;
use std::sync::Arc;

use constants::syscall_ids::{
    SYS_DISKREAD, SYS_DISKSIZE, SYS_DISKWRITE, SYS_GETPID, SYS_GETPROCINFO, SYS_GETTIMEOFDAY,
    SYS_SLEEP, SYS_SPAWN, SYS_TERMINATE, SYS_WAIT,
};
use constants::{ServiceError, DISK_SECTOR_SIZE};
use kernel_abstractions::{ICpu, ProcessState, TrapFrame, UserPid, UserProcessInfo};
use timing::Microseconds;

use crate::kernel::TestKernel;

thread_local! {
    static CURRENT_KERNEL: RefCell<Option<Arc<TestKernel>>> = const { RefCell::new(None) };
}

pub(crate) fn set_current_kernel(kernel: Arc<TestKernel>) {
    CURRENT_KERNEL.with(|current| *current.borrow_mut() = Some(kernel));
}

/// The kernel the calling process belongs to. Only meaningful on a thread
/// created by that kernel's fork.
pub fn current_kernel() -> Arc<TestKernel> {
    CURRENT_KERNEL
        .with(|current| current.borrow().clone())
        .expect("called from a simulated process")
}

/// Execute the trap instruction on an arbitrary frame. Tests use this to
/// issue syscall numbers no well-behaved trampoline would.
pub fn syscall(frame: &mut TrapFrame) {
    let kernel = current_kernel();
    kernel.trap(frame);
}

fn result_of(frame: &TrapFrame) -> Result<(), ServiceError> {
    match frame.arg4 as isize {
        0 => Ok(()),
        code => Err(ServiceError::from_code(code).expect("known error code")),
    }
}

pub fn spawn(
    name: &str,
    func: fn(usize) -> i32,
    arg: usize,
    stack_size: usize,
    priority: u32,
) -> Result<UserPid, ServiceError> {
    let name = CString::new(name).expect("name contains no NUL");
    let mut frame = TrapFrame::new(SYS_SPAWN);
    frame.arg1 = func as usize;
    frame.arg2 = arg;
    frame.arg3 = stack_size;
    frame.arg4 = priority as usize;
    frame.arg5 = name.as_ptr() as usize;
    syscall(&mut frame);
    result_of(&frame).map(|_| frame.arg1)
}

pub fn wait() -> Result<(UserPid, i32), ServiceError> {
    let mut frame = TrapFrame::new(SYS_WAIT);
    syscall(&mut frame);
    result_of(&frame).map(|_| (frame.arg1, frame.arg2 as i32))
}

pub fn terminate(status: i32) -> ! {
    let mut frame = TrapFrame::new(SYS_TERMINATE);
    frame.arg1 = status as usize;
    syscall(&mut frame);
    unreachable!("terminate returned")
}

pub fn get_pid() -> UserPid {
    let mut frame = TrapFrame::new(SYS_GETPID);
    syscall(&mut frame);
    frame.arg1
}

pub fn time_of_day() -> Microseconds {
    let mut frame = TrapFrame::new(SYS_GETTIMEOFDAY);
    syscall(&mut frame);
    Microseconds::new(frame.arg1 as i64)
}

pub fn proc_info(pid: UserPid) -> Result<UserProcessInfo, ServiceError> {
    let mut info = UserProcessInfo {
        name: String::new(),
        priority: 0,
        state: ProcessState::Ready,
        children: Vec::new(),
    };
    let mut frame = TrapFrame::new(SYS_GETPROCINFO);
    frame.arg1 = pid;
    frame.arg2 = &mut info as *mut UserProcessInfo as usize;
    syscall(&mut frame);
    result_of(&frame).map(|_| info)
}

pub fn sleep(seconds: i64) -> Result<(), ServiceError> {
    let mut frame = TrapFrame::new(SYS_SLEEP);
    frame.arg1 = seconds as usize;
    syscall(&mut frame);
    result_of(&frame)
}

pub fn disk_read(
    buffer: &mut [u8],
    track: usize,
    first: usize,
    sectors: usize,
    unit: usize,
) -> Result<(), ServiceError> {
    assert_eq!(buffer.len(), sectors * DISK_SECTOR_SIZE);
    let mut frame = TrapFrame::new(SYS_DISKREAD);
    frame.arg1 = buffer.as_mut_ptr() as usize;
    frame.arg2 = sectors;
    frame.arg3 = track;
    frame.arg4 = first;
    frame.arg5 = unit;
    syscall(&mut frame);
    result_of(&frame)
}

pub fn disk_write(
    buffer: &[u8],
    track: usize,
    first: usize,
    sectors: usize,
    unit: usize,
) -> Result<(), ServiceError> {
    assert_eq!(buffer.len(), sectors * DISK_SECTOR_SIZE);
    let mut frame = TrapFrame::new(SYS_DISKWRITE);
    frame.arg1 = buffer.as_ptr() as usize;
    frame.arg2 = sectors;
    frame.arg3 = track;
    frame.arg4 = first;
    frame.arg5 = unit;
    syscall(&mut frame);
    result_of(&frame)
}

/// Returns (sector size, sectors per track, tracks per disk).
pub fn disk_size(unit: usize) -> Result<(usize, usize, usize), ServiceError> {
    let mut frame = TrapFrame::new(SYS_DISKSIZE);
    frame.arg1 = unit;
    syscall(&mut frame);
    result_of(&frame).map(|_| (frame.arg1, frame.arg2, frame.arg3))
}
