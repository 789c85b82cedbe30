//! Driver-side request records
//!
//! A driver builds an [`IoRequest`] for every logical transfer, hands it to
//! [`crate::device::VirtioDevice::queue_request_v`] together with the
//! physical segments of the transfer, and gets it back from
//! [`crate::device::VirtioDevice::queue_dequeue`] once the device has
//! completed the chain. The queue keeps the record in a per-slot table
//! while the request is in flight; it never owns the buffers themselves.

/// One physical segment of a scatter/gather transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoVec {
    /// Device-visible (physical/bus) address of the segment
    pub addr: u64,
    /// Segment length in bytes
    pub len: u32,
}

impl IoVec {
    pub const fn new(addr: u64, len: u32) -> Self {
        Self { addr, len }
    }
}

/// Direction of a request, from the driver's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoOp {
    /// Device fills the buffer (device-writable descriptors)
    Read,
    /// Driver filled the buffer, device consumes it
    Write,
}

/// Lifecycle state of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoState {
    /// Created, not yet submitted
    Inactive,
    /// Published on the avail ring, awaiting the device
    Pending,
    /// Completed successfully
    Done,
    /// Completed with a device-reported error
    Failed,
}

/// A driver-owned I/O request record.
///
/// `buf`/`len` describe the primary payload buffer for the driver's own
/// bookkeeping; the descriptor chain itself is built from the `IoVec` slice
/// passed at submission time (header and status segments included), so the
/// two need not coincide.
#[derive(Debug)]
pub struct IoRequest {
    /// Transfer direction
    pub op: IoOp,
    /// Lifecycle state, maintained by the queue engine
    pub state: IoState,
    /// Device-visible address of the payload buffer
    pub buf: u64,
    /// Payload length in bytes
    pub len: u32,
    /// Byte count reported by the used ring at completion
    pub transferred: u32,
}

impl IoRequest {
    pub fn new(op: IoOp, buf: u64, len: u32) -> Self {
        Self {
            op,
            state: IoState::Inactive,
            buf,
            len,
            transferred: 0,
        }
    }
}

/// Classifies a completed request as `Done` or `Failed`.
///
/// How a device reports per-request errors is device specific (the block
/// device writes a status byte, input devices never fail), so the transport
/// does not guess: the driver layer installs a policy via
/// [`crate::device::VirtioDevice::set_completion_policy`] and interprets its
/// own status fields there. The default policy marks every completion
/// `Done`.
pub trait CompletionPolicy: Send + Sync {
    fn classify(&self, request: &IoRequest, used_len: u32) -> IoState;
}

/// Default policy: every completion is a success.
pub struct AlwaysDone;

impl CompletionPolicy for AlwaysDone {
    fn classify(&self, _request: &IoRequest, _used_len: u32) -> IoState {
        IoState::Done
    }
}
