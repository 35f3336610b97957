//! Disk service: one driver process per probed unit, serializing block-I/O
//! requests through a bounded ring with per-slot completion semaphores.

use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use constants::syscall_ids::{SYS_DISKREAD, SYS_DISKSIZE, SYS_DISKWRITE};
use constants::{
    ServiceError, DISK_QUEUE_CAPACITY, DISK_SECTOR_SIZE, DISK_TRACK_SIZE, DISK_UNITS,
    DRIVER_PRIORITY, MIN_STACK,
};
use hermit_sync::SpinMutex;
use kernel_abstractions::{
    Device, DeviceRequest, IKernel, ProcessTag, SemaphoreId, TrapFrame,
};

use crate::{enable_interrupts, require_kernel_mode, ISyscallHandler, ISyscallResult, UserProcessServices};

/// What DiskSize reports: the geometry probed at init.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DiskGeometry {
    pub sector_size: usize,
    pub sectors_per_track: usize,
    pub tracks_per_disk: usize,
}

#[derive(Debug, Copy, Clone)]
enum DiskOp {
    Read,
    Write,
}

/// One ring slot. The buffer is an address, not a reference: it belongs to
/// the submitting process, which stays blocked on the slot's completion
/// semaphore for exactly as long as the driver may touch it.
#[derive(Copy, Clone)]
struct RequestSlot {
    op: DiskOp,
    track: usize,
    first: usize,
    sectors: usize,
    buffer: usize,
    succeeded: bool,
}

impl RequestSlot {
    const EMPTY: RequestSlot = RequestSlot {
        op: DiskOp::Read,
        track: 0,
        first: 0,
        sectors: 0,
        buffer: 0,
        succeeded: false,
    };
}

/// Head advances only under the driver, tail only under producers holding
/// the ring lock; the free-slot semaphore keeps tail from lapping head.
struct RequestRing {
    slots: [RequestSlot; DISK_QUEUE_CAPACITY],
    head: usize,
    tail: usize,
}

struct DiskUnit {
    tracks: usize,
    ring: SpinMutex<RequestRing>,
    pending: SemaphoreId,
    free: SemaphoreId,
    completions: Vec<SemaphoreId>,
}

pub struct DiskService {
    kernel: Arc<dyn IKernel>,
    units: Vec<DiskUnit>,
    shutting_down: AtomicBool,
}

impl DiskService {
    /// Probe the units, build the per-unit queues, register the stubs, and
    /// fork one driver per present unit.
    pub fn init(kernel: Arc<dyn IKernel>, procs: &Arc<UserProcessServices>) -> Arc<DiskService> {
        require_kernel_mode(&*kernel.cpu());

        let bus = kernel.device_bus();
        let queue = kernel.device_queue();
        let semaphores = kernel.semaphores();

        let mut units = Vec::new();
        for unit in 0..DISK_UNITS {
            let mut tracks = 0usize;
            let probe = DeviceRequest::TrackCount { count: &mut tracks };
            if bus.output(Device::Disk { unit }, &probe).is_err() {
                break;
            }
            queue
                .wait(Device::Disk { unit })
                .expect("tracks query completes");
            log::debug!("disk unit {unit}: {tracks} tracks");

            let pending = semaphores
                .create(&format!("disk{unit} pending"), 0)
                .expect("semaphore budget covers the disk queues");
            let free = semaphores
                .create(&format!("disk{unit} free"), DISK_QUEUE_CAPACITY)
                .expect("semaphore budget covers the disk queues");
            let completions = (0..DISK_QUEUE_CAPACITY)
                .map(|slot| {
                    semaphores
                        .create(&format!("disk{unit} done{slot}"), 0)
                        .expect("semaphore budget covers the disk queues")
                })
                .collect();
            units.push(DiskUnit {
                tracks,
                ring: SpinMutex::new(RequestRing {
                    slots: [RequestSlot::EMPTY; DISK_QUEUE_CAPACITY],
                    head: 0,
                    tail: 0,
                }),
                pending,
                free,
                completions,
            });
        }

        let service = Arc::new(DiskService {
            kernel: kernel.clone(),
            units,
            shutting_down: AtomicBool::new(false),
        });

        let stubs: [(usize, Arc<dyn ISyscallHandler>); 3] = [
            (SYS_DISKREAD, Arc::new(DiskReadSyscall(service.clone()))),
            (SYS_DISKWRITE, Arc::new(DiskWriteSyscall(service.clone()))),
            (SYS_DISKSIZE, Arc::new(DiskSizeSyscall(service.clone()))),
        ];
        for (number, stub) in stubs {
            procs
                .set_syscall_handler(number, stub)
                .expect("disk stubs use listed numbers");
        }

        enable_interrupts(&*kernel.cpu());
        for unit in 0..service.units.len() {
            let driver = service.clone();
            kernel
                .procs()
                .fork(
                    &format!("disk driver {unit}"),
                    DRIVER_PRIORITY,
                    MIN_STACK,
                    ProcessTag::Kernel,
                    Box::new(move || driver.drive(unit)),
                )
                .expect("disk driver fork");
        }

        service
    }

    /// Read `sectors` sectors starting at (`track`, `first`) into `buffer`.
    /// Blocks until the unit's driver has executed the transfer.
    pub fn read(
        &self,
        unit: usize,
        track: usize,
        first: usize,
        sectors: usize,
        buffer: &mut [u8],
    ) -> Result<(), ServiceError> {
        assert_eq!(buffer.len(), sectors * DISK_SECTOR_SIZE, "buffer sized to the transfer");
        self.submit(unit, DiskOp::Read, track, first, sectors, buffer.as_mut_ptr() as usize)
    }

    /// Write counterpart of [`DiskService::read`].
    pub fn write(
        &self,
        unit: usize,
        track: usize,
        first: usize,
        sectors: usize,
        buffer: &[u8],
    ) -> Result<(), ServiceError> {
        assert_eq!(buffer.len(), sectors * DISK_SECTOR_SIZE, "buffer sized to the transfer");
        self.submit(unit, DiskOp::Write, track, first, sectors, buffer.as_ptr() as usize)
    }

    /// Geometry of a present unit.
    pub fn size(&self, unit: usize) -> Result<DiskGeometry, ServiceError> {
        require_kernel_mode(&*self.kernel.cpu());
        let device = self.units.get(unit).ok_or(ServiceError::InvalidUnit)?;
        Ok(DiskGeometry {
            sector_size: DISK_SECTOR_SIZE,
            sectors_per_track: DISK_TRACK_SIZE,
            tracks_per_disk: device.tracks,
        })
    }

    /// Units that answered the probe at init.
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Let in-flight requests finish, then stop every driver. Submissions
    /// after this point are a caller error.
    pub fn shutdown(&self) {
        require_kernel_mode(&*self.kernel.cpu());
        self.shutting_down.store(true, Ordering::Release);
        let semaphores = self.kernel.semaphores();
        for device in &self.units {
            semaphores.up(device.pending);
        }
    }

    fn submit(
        &self,
        unit: usize,
        op: DiskOp,
        track: usize,
        first: usize,
        sectors: usize,
        buffer: usize,
    ) -> Result<(), ServiceError> {
        require_kernel_mode(&*self.kernel.cpu());
        let device = self.units.get(unit).ok_or(ServiceError::InvalidUnit)?;
        if track >= device.tracks {
            return Err(ServiceError::InvalidTrack);
        }
        if first >= DISK_TRACK_SIZE {
            return Err(ServiceError::InvalidFirst);
        }
        if buffer == 0 {
            return Err(ServiceError::NullAddress);
        }

        let semaphores = self.kernel.semaphores();
        semaphores.down(device.free);
        let slot = {
            let mut ring = device.ring.lock();
            let slot = ring.tail;
            ring.slots[slot] = RequestSlot {
                op,
                track,
                first,
                sectors,
                buffer,
                succeeded: false,
            };
            ring.tail = (ring.tail + 1) % DISK_QUEUE_CAPACITY;
            slot
        };
        semaphores.up(device.pending);

        semaphores.down(device.completions[slot]);
        let succeeded = device.ring.lock().slots[slot].succeeded;
        semaphores.up(device.free);
        if succeeded {
            Ok(())
        } else {
            Err(ServiceError::InvalidSectors)
        }
    }

    fn drive(&self, unit: usize) -> i32 {
        log::debug!("disk driver {unit} running");
        let semaphores = self.kernel.semaphores();
        let device = &self.units[unit];
        loop {
            semaphores.down(device.pending);
            if self.shutting_down.load(Ordering::Acquire) {
                break;
            }
            let (slot, request) = {
                let ring = device.ring.lock();
                (ring.head, ring.slots[ring.head])
            };
            let succeeded = self.execute(unit, &request);
            {
                let mut ring = device.ring.lock();
                ring.slots[slot].succeeded = succeeded;
                ring.head = (ring.head + 1) % DISK_QUEUE_CAPACITY;
            }
            semaphores.up(device.completions[slot]);
        }
        log::debug!("disk driver {unit} stopped");
        0
    }

    /// Walk the request sector by sector, seeking across track boundaries.
    /// Running off the last track fails the request; everything already
    /// transferred stays transferred.
    fn execute(&self, unit: usize, request: &RequestSlot) -> bool {
        let tracks = self.units[unit].tracks;
        self.seek(unit, request.track);
        let mut track = request.track;
        let mut sector = request.first;
        for index in 0..request.sectors {
            if sector == DISK_TRACK_SIZE {
                track += 1;
                if track >= tracks {
                    return false;
                }
                self.seek(unit, track);
                sector = 0;
            }
            let buffer = request.buffer + index * DISK_SECTOR_SIZE;
            let operation = match request.op {
                DiskOp::Read => DeviceRequest::ReadSector {
                    sector,
                    buffer: buffer as *mut u8,
                },
                DiskOp::Write => DeviceRequest::WriteSector {
                    sector,
                    buffer: buffer as *const u8,
                },
            };
            self.issue(unit, &operation);
            sector += 1;
        }
        true
    }

    fn seek(&self, unit: usize, track: usize) {
        self.issue(unit, &DeviceRequest::Seek { track });
    }

    /// One device micro-operation: program the registers, wait for the
    /// completion interrupt.
    fn issue(&self, unit: usize, request: &DeviceRequest) {
        self.kernel
            .device_bus()
            .output(Device::Disk { unit }, request)
            .expect("probed unit accepts requests");
        self.kernel
            .device_queue()
            .wait(Device::Disk { unit })
            .expect("disk operation completes");
    }
}

struct DiskReadSyscall(Arc<DiskService>);

impl ISyscallHandler for DiskReadSyscall {
    fn handle(&self, frame: &mut TrapFrame) {
        let result = self.0.submit(
            frame.arg5,
            DiskOp::Read,
            frame.arg3,
            frame.arg4,
            frame.arg2,
            frame.arg1,
        );
        frame.arg4 = result.as_rc() as usize;
    }

    fn name(&self) -> &str {
        "sys_diskread"
    }
}

struct DiskWriteSyscall(Arc<DiskService>);

impl ISyscallHandler for DiskWriteSyscall {
    fn handle(&self, frame: &mut TrapFrame) {
        let result = self.0.submit(
            frame.arg5,
            DiskOp::Write,
            frame.arg3,
            frame.arg4,
            frame.arg2,
            frame.arg1,
        );
        frame.arg4 = result.as_rc() as usize;
    }

    fn name(&self) -> &str {
        "sys_diskwrite"
    }
}

struct DiskSizeSyscall(Arc<DiskService>);

impl ISyscallHandler for DiskSizeSyscall {
    fn handle(&self, frame: &mut TrapFrame) {
        let result = self.0.size(frame.arg1);
        if let Ok(geometry) = &result {
            frame.arg1 = geometry.sector_size;
            frame.arg2 = geometry.sectors_per_track;
            frame.arg3 = geometry.tracks_per_disk;
        }
        frame.arg4 = result.as_rc() as usize;
    }

    fn name(&self) -> &str {
        "sys_disksize"
    }
}
