//! Disk service end to end: multi-track transfers, round trips, boundary
//! behavior, and concurrent submitters.

use constants::{ServiceError, DISK_SECTOR_SIZE, DISK_TRACK_SIZE, MIN_STACK};
use kernel_abstractions::TrapFrame;
use rand::{Rng, RngCore};
use services::{DiskService, UserProcessServices};
use test_utilities::kernel::TestKernel;
use test_utilities::user;

const TRACKS: usize = 10;
const PATTERN_SECTORS: usize = 20;

fn pattern(sectors: usize) -> Vec<u8> {
    let mut buffer = vec![b' '; sectors * DISK_SECTOR_SIZE];
    for i in 0..sectors {
        let text = i.to_string();
        buffer[i * DISK_SECTOR_SIZE..][..text.len()].copy_from_slice(text.as_bytes());
    }
    buffer
}

fn multi_track_main(_: usize) -> i32 {
    let written = pattern(PATTERN_SECTORS);
    user::disk_write(&written, 0, 0, PATTERN_SECTORS, 0).expect("write");

    let mut read_back = vec![0u8; PATTERN_SECTORS * DISK_SECTOR_SIZE];
    user::disk_read(&mut read_back, 0, 0, PATTERN_SECTORS, 0).expect("read");
    assert_eq!(written, read_back);

    let (sector_size, sectors_per_track, tracks) = user::disk_size(0).expect("size");
    assert_eq!(
        (sector_size, sectors_per_track, tracks),
        (DISK_SECTOR_SIZE, DISK_TRACK_SIZE, TRACKS)
    );
    assert_eq!(user::disk_size(1), Err(ServiceError::InvalidUnit));

    11
}

#[test]
fn multi_track_write_read_round_trip() {
    let kernel = TestKernel::new().with_disk(TRACKS).build();
    TestKernel::run(&kernel, {
        let kernel = kernel.clone();
        move || {
            let procs = UserProcessServices::init(kernel.clone());
            let disk = DiskService::init(kernel, &procs);
            let pid = procs
                .spawn("main", multi_track_main, 0, 4 * MIN_STACK, 3)
                .expect("spawn main");
            assert_eq!(procs.wait(), Ok((pid, 11)));
            disk.shutdown();
            0
        }
    });
}

#[test]
fn random_round_trips() {
    let kernel = TestKernel::new().with_disk(TRACKS).build();
    TestKernel::run(&kernel, {
        let kernel = kernel.clone();
        move || {
            let procs = UserProcessServices::init(kernel.clone());
            let disk = DiskService::init(kernel, &procs);
            let mut rng = rand::rng();
            for _ in 0..5 {
                let track = rng.random_range(0..TRACKS);
                let first = rng.random_range(0..DISK_TRACK_SIZE);
                let available = TRACKS * DISK_TRACK_SIZE - (track * DISK_TRACK_SIZE + first);
                let sectors = rng.random_range(1..=available.min(3 * DISK_TRACK_SIZE));
                let mut written = vec![0u8; sectors * DISK_SECTOR_SIZE];
                rng.fill_bytes(&mut written);
                disk.write(0, track, first, sectors, &written).expect("write");
                let mut read_back = vec![0u8; sectors * DISK_SECTOR_SIZE];
                disk.read(0, track, first, sectors, &mut read_back).expect("read");
                assert_eq!(written, read_back);
            }
            disk.shutdown();
            0
        }
    });
}

fn writes_own_track(track: usize) -> i32 {
    let buffer = vec![track as u8; DISK_TRACK_SIZE * DISK_SECTOR_SIZE];
    user::disk_write(&buffer, track, 0, DISK_TRACK_SIZE, 0).expect("write");
    let mut read_back = vec![0u8; DISK_TRACK_SIZE * DISK_SECTOR_SIZE];
    user::disk_read(&mut read_back, track, 0, DISK_TRACK_SIZE, 0).expect("read");
    assert_eq!(read_back, buffer);
    0
}

#[test]
fn concurrent_submitters_are_serialized() {
    let kernel = TestKernel::new().with_disk(TRACKS).build();
    TestKernel::run(&kernel, {
        let kernel = kernel.clone();
        move || {
            let procs = UserProcessServices::init(kernel.clone());
            let disk = DiskService::init(kernel, &procs);
            for track in 0..4 {
                procs
                    .spawn(&format!("writer{track}"), writes_own_track, track, MIN_STACK, 2)
                    .expect("spawn writer");
            }
            for _ in 0..4 {
                let (_, status) = procs.wait().expect("writer to reap");
                assert_eq!(status, 0);
            }
            disk.shutdown();
            0
        }
    });
}

fn boundary_main(_: usize) -> i32 {
    // ends exactly on the last sector of the last track
    let last_track_full = vec![0x5au8; DISK_TRACK_SIZE * DISK_SECTOR_SIZE];
    user::disk_write(&last_track_full, TRACKS - 1, 0, DISK_TRACK_SIZE, 0)
        .expect("transfer ending on the last sector");

    // one sector past the end of the disk
    let overflow = vec![0u8; 2 * DISK_SECTOR_SIZE];
    assert_eq!(
        user::disk_write(&overflow, TRACKS - 1, DISK_TRACK_SIZE - 1, 2, 0),
        Err(ServiceError::InvalidSectors)
    );

    // validation failures, straight from the frame packing
    let mut buffer = [0u8; DISK_SECTOR_SIZE];
    assert_eq!(
        user::disk_read(&mut buffer, TRACKS, 0, 1, 0),
        Err(ServiceError::InvalidTrack)
    );
    assert_eq!(
        user::disk_read(&mut buffer, 0, DISK_TRACK_SIZE, 1, 0),
        Err(ServiceError::InvalidFirst)
    );
    assert_eq!(
        user::disk_read(&mut buffer, 0, 0, 1, 5),
        Err(ServiceError::InvalidUnit)
    );

    let mut frame = TrapFrame::new(constants::syscall_ids::SYS_DISKREAD);
    frame.arg2 = 1;
    frame.arg5 = 0;
    user::syscall(&mut frame);
    assert_eq!(frame.arg4 as isize, ServiceError::NullAddress.code());

    11
}

#[test]
fn boundary_transfers() {
    let kernel = TestKernel::new().with_disk(TRACKS).build();
    TestKernel::run(&kernel, {
        let kernel = kernel.clone();
        move || {
            let procs = UserProcessServices::init(kernel.clone());
            let disk = DiskService::init(kernel, &procs);
            let pid = procs
                .spawn("main", boundary_main, 0, 4 * MIN_STACK, 3)
                .expect("spawn main");
            assert_eq!(procs.wait(), Ok((pid, 11)));
            disk.shutdown();
            0
        }
    });
}
