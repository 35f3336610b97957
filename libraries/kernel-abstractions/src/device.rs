/// A device address: the clock, or one disk unit.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Device {
    Clock,
    Disk { unit: usize },
}

/// A disk register program. One request is one micro-operation; a multi-sector
/// transfer is a sequence of these with a device wait after each.
///
/// The buffer pointers are borrowed for the duration of the operation only:
/// the device has finished with them once the corresponding
/// [`wait`](crate::IDeviceQueue::wait) returns.
#[derive(Debug)]
pub enum DeviceRequest {
    Seek { track: usize },
    ReadSector { sector: usize, buffer: *mut u8 },
    WriteSector { sector: usize, buffer: *const u8 },
    TrackCount { count: *mut usize },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// No device is attached at that address; probing stops here.
    NoDevice,
    /// The device does not understand the request.
    UnsupportedRequest,
}
