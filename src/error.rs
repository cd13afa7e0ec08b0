//! Error kinds for the Block Manager and RRPC FTL (SPEC_FULL.md §7).

use core::fmt;

/// Errors surfaced by the device adapter boundary (§6 callbacks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// `submit_io` failed before completion could even be scheduled.
    IoError,
    /// `erase_block` failed.
    EraseFailed,
    /// `get_bb_tbl` failed.
    BadBlockTableFail,
    /// `get_l2p_tbl` failed.
    L2pFail,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::IoError => write!(f, "device I/O error"),
            DeviceError::EraseFailed => write!(f, "erase failed"),
            DeviceError::BadBlockTableFail => write!(f, "bad-block table read failed"),
            DeviceError::L2pFail => write!(f, "L2P table read failed"),
        }
    }
}

/// Errors surfaced by the Block Manager and RRPC FTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtlError {
    /// Pool exhaustion or allocation failure. Fatal during attach.
    OutOfMemory,
    /// No free block available even after a GC kick.
    OutOfCapacity,
    /// The requested logical range overlaps one already in flight.
    InflightConflict,
    /// `get_l2p_tbl` returned an entry `>= total_pages` that was not the
    /// unmapped sentinel. This is a device/host protocol mismatch.
    DeviceProtocol,
    /// `nr_pages_per_block` exceeds the bitmap capacity this build supports.
    GeometryInvalid,
    /// `reserved >= nr_pages`: the FTL's own headroom would exceed capacity.
    CapacityExhausted,
    /// A synchronous read or write during block reclamation failed; the
    /// block's priority-list entry has already been removed and it is left
    /// in `used` rather than erased (covers both `GCReadFail`/`GCWriteFail`).
    GcFailed,
}

impl fmt::Display for FtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FtlError::OutOfMemory => write!(f, "out of memory"),
            FtlError::OutOfCapacity => write!(f, "out of capacity"),
            FtlError::InflightConflict => write!(f, "inflight range conflict"),
            FtlError::DeviceProtocol => write!(f, "device protocol violation"),
            FtlError::GeometryInvalid => write!(f, "invalid device geometry"),
            FtlError::CapacityExhausted => write!(f, "FTL headroom exceeds device capacity"),
            FtlError::GcFailed => write!(f, "garbage collection failed to reclaim block"),
        }
    }
}

impl From<DeviceError> for FtlError {
    fn from(_: DeviceError) -> Self {
        FtlError::OutOfMemory
    }
}

/// Outcome of dispatching a single bio through `Rrpc::make_rq` (§4.2.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RqOutcome {
    /// Submitted to the device; completion will arrive via `end_io`.
    Ok,
    /// Completed immediately with success (e.g. read of an unmapped page).
    Done,
    /// Completed immediately with an I/O error.
    Err,
    /// No resource available right now (no free page, inflight conflict).
    /// The caller should requeue and, for writes, kick GC.
    Requeue,
}
