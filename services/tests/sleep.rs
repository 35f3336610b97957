//! Concurrent sleepers against the clock driver.

use constants::MIN_STACK;
use rand::Rng;
use services::{ClockService, UserProcessServices};
use test_utilities::kernel::TestKernel;
use test_utilities::user;
use timing::TimeSpan;

const NUM_SLEEPERS: usize = 10;

fn sleeper(seconds: usize) -> i32 {
    let start = user::time_of_day();
    user::sleep(seconds as i64).expect("sleep");
    let end = user::time_of_day();
    assert!(
        end - start >= TimeSpan::from_seconds(seconds as i64),
        "slept {} for a {seconds}s request",
        end - start,
    );
    0
}

fn sleepers_main(_: usize) -> i32 {
    let mut rng = rand::rng();
    for i in 0..NUM_SLEEPERS {
        let duration = rng.random_range(0..10);
        user::spawn(&format!("Sleeper{i}"), sleeper, duration, MIN_STACK, 5).expect("spawn");
    }
    for _ in 0..NUM_SLEEPERS {
        let (_, status) = user::wait().expect("sleeper to reap");
        assert_eq!(status, 0);
    }
    11
}

#[test]
fn every_sleeper_sleeps_long_enough() {
    let kernel = TestKernel::new().build();
    TestKernel::run(&kernel, {
        let kernel = kernel.clone();
        move || {
            let procs = UserProcessServices::init(kernel.clone());
            let clock = ClockService::init(kernel, &procs);
            let pid = procs
                .spawn("main", sleepers_main, 0, 4 * MIN_STACK, 3)
                .expect("spawn main");
            assert_eq!(procs.wait(), Ok((pid, 11)));
            clock.shutdown();
            0
        }
    });
}

fn fixed_sleeper(seconds: usize) -> i32 {
    let start = user::time_of_day();
    user::sleep(seconds as i64).expect("sleep");
    let end = user::time_of_day();
    (end - start).whole_seconds() as i32
}

#[test]
fn wakeups_come_in_deadline_order() {
    // sleepers registered longest-first still wake shortest-first
    let kernel = TestKernel::new().build();
    TestKernel::run(&kernel, {
        let kernel = kernel.clone();
        move || {
            let procs = UserProcessServices::init(kernel.clone());
            let clock = ClockService::init(kernel.clone(), &procs);
            for (i, seconds) in [9usize, 4, 1].into_iter().enumerate() {
                procs
                    .spawn(&format!("fixed{i}"), fixed_sleeper, seconds, MIN_STACK, 2)
                    .expect("spawn");
            }
            let mut slept = Vec::new();
            for _ in 0..3 {
                let (_, status) = procs.wait().expect("sleeper to reap");
                slept.push(status);
            }
            // reaped in quit order: the shortest deadline finished first
            assert_eq!(slept, vec![1, 4, 9]);
            assert!(kernel.clock_usec() >= 9_000_000);
            clock.shutdown();
            0
        }
    });
}
