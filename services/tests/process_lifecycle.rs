//! Process lifecycle end to end: table saturation, reaping, and orphan
//! accounting, driven from user mode through the syscall trampolines.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use constants::{ServiceError, MAX_PROCESSES, MIN_STACK};
use services::{ClockService, UserProcessServices};
use test_utilities::kernel::TestKernel;
use test_utilities::user;

fn return_arg(arg: usize) -> i32 {
    arg as i32
}

fn saturation_main(_: usize) -> i32 {
    // this process, the startup process, and the clock driver hold three of
    // the layer-1 slots
    let limit = MAX_PROCESSES - 3;
    for i in 0..limit {
        user::spawn(&format!("{i}"), return_arg, 42, MIN_STACK, 5).expect("table has room");
    }
    assert_eq!(
        user::spawn("!", return_arg, 42, MIN_STACK, 5),
        Err(ServiceError::TooManyProcesses)
    );

    for _ in 0..10 {
        let (_, status) = user::wait().expect("children to reap");
        assert_eq!(status, 42);
    }

    for i in 0..10 {
        user::spawn(&format!("{i}!"), return_arg, 42, MIN_STACK, 1).expect("slots were reaped");
    }
    user::wait().expect("children to reap");
    user::spawn("!!", return_arg, 42, MIN_STACK, 1).expect("one more slot");

    user::terminate(11)
}

#[test]
fn saturating_the_process_table() {
    let kernel = TestKernel::new().build();
    let status = TestKernel::run(&kernel, {
        let kernel = kernel.clone();
        move || {
            let procs = UserProcessServices::init(kernel.clone());
            let clock = ClockService::init(kernel, &procs);
            let pid = procs
                .spawn("main", saturation_main, 0, 4 * MIN_STACK, 3)
                .expect("spawn main");
            assert_eq!(procs.wait(), Ok((pid, 11)));
            // yield long enough for the orphaned stragglers to run and
            // collapse their slots
            clock.sleep(1).expect("sleep");
            assert_eq!(procs.slots_in_use(), 0, "table drains to all-unused");
            clock.shutdown();
            0
        }
    });
    assert_eq!(status, 0);
}

static GLOBAL: AtomicI32 = AtomicI32::new(0);
static CHILD_PID: AtomicUsize = AtomicUsize::new(0);

fn orphan(arg: usize) -> i32 {
    GLOBAL.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |g| Some(g * 3)).unwrap();
    arg as i32
}

fn not_run(arg: usize) -> i32 {
    GLOBAL.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |g| Some(g * 10)).unwrap();
    arg as i32
}

fn orphanage_child(arg: usize) -> i32 {
    GLOBAL.fetch_add(5, Ordering::SeqCst);
    // the two urgent orphans preempt us one after the other; the lazy one
    // never gets scheduled at all
    user::spawn("Orphan1", orphan, 0, MIN_STACK, 2).expect("spawn orphan");
    user::spawn("Orphan2", orphan, 0, MIN_STACK, 2).expect("spawn orphan");
    user::spawn("NotRun", not_run, 0, MIN_STACK, 5).expect("spawn orphan");

    let pid = user::get_pid();
    assert_eq!(pid, CHILD_PID.load(Ordering::SeqCst));
    let info = user::proc_info(pid).expect("own proc info");
    assert_eq!(info.name, "Child");
    assert_eq!(info.children.len(), 3);

    arg as i32
}

fn orphanage_main(_: usize) -> i32 {
    let start = user::time_of_day();

    let pid = user::spawn("Child", orphanage_child, 42, MIN_STACK, 3).expect("spawn child");
    CHILD_PID.store(pid, Ordering::SeqCst);

    let (wait_pid, status) = user::wait().expect("child to reap");
    assert_eq!(GLOBAL.load(Ordering::SeqCst), 45);
    assert_eq!((wait_pid, status), (pid, 42));

    let finish = user::time_of_day();
    assert!(finish > start);

    assert_eq!(user::wait(), Err(ServiceError::NoChildren));
    user::terminate(11)
}

#[test]
fn orphans_are_left_behind() {
    let kernel = TestKernel::new().build();
    TestKernel::run(&kernel, {
        let kernel = kernel.clone();
        move || {
            let procs = UserProcessServices::init(kernel);
            let pid = procs
                .spawn("main", orphanage_main, 0, 4 * MIN_STACK, 3)
                .expect("spawn main");
            assert_eq!(procs.wait(), Ok((pid, 11)));
            // the parent is gone and nobody waits: the lazy orphan never ran
            assert_eq!(GLOBAL.load(Ordering::SeqCst), 45);
            0
        }
    });
}

fn spawn_wait_pairs(procs: &Arc<UserProcessServices>, count: usize) {
    for i in 0..count {
        procs
            .spawn(&format!("pair{i}"), return_arg, i, MIN_STACK, 1)
            .expect("spawn");
    }
    let mut statuses = Vec::new();
    for _ in 0..count {
        let (_, status) = procs.wait().expect("reap");
        statuses.push(status);
    }
    statuses.sort_unstable();
    assert_eq!(statuses, (0..count as i32).collect::<Vec<_>>());
}

#[test]
fn every_exit_is_observed_exactly_once() {
    let kernel = TestKernel::new().build();
    TestKernel::run(&kernel, {
        let kernel = kernel.clone();
        move || {
            let procs = UserProcessServices::init(kernel);
            spawn_wait_pairs(&procs, 20);
            assert_eq!(procs.wait(), Err(ServiceError::NoChildren));
            assert_eq!(procs.slots_in_use(), 0);
            0
        }
    });
}

#[test]
fn proc_info_rejects_unknown_pids() {
    let kernel = TestKernel::new().build();
    TestKernel::run(&kernel, {
        let kernel = kernel.clone();
        move || {
            let procs = UserProcessServices::init(kernel);
            assert_eq!(
                procs.proc_info(0).map(|_| ()),
                Err(ServiceError::InvalidPid)
            );
            assert_eq!(
                procs.proc_info(MAX_PROCESSES + 7).map(|_| ()),
                Err(ServiceError::InvalidPid)
            );
            0
        }
    });
}
