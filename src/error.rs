//! Crate-wide error taxonomy.
//!
//! Mirrors the error handling design: protocol errors and back-end I/O
//! errors are recoverable per request, guest-memory access failures are
//! treated as protocol errors, and a small set of conditions are fatal
//! to the whole process. A malformed descriptor chain (cycle, or a
//! length exceeding the queue size) is recoverable: the device front
//! end drops that one request without a used-ring entry and keeps
//! servicing the rest of the queue, so `QueueError` never reaches
//! `DeviceError` — it is handled entirely within the virtqueue walk.

use std::fmt;

use crate::mem::GuestAddr;

/// Recoverable, per-request error surfaced by a device front end.
#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("back-end I/O error: {0}")]
    BackendIo(#[from] std::io::Error),

    #[error("guest memory access error at {0:?}")]
    GuestMemory(GuestAddr),

    #[error("resource exhaustion: {0}")]
    ResourceExhausted(&'static str),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Error returned by the split-virtqueue engine while walking a chain.
#[derive(thiserror::Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum QueueError {
    #[error("descriptor chain exceeds queue size")]
    ChainTooLong,
    #[error("descriptor cycle detected")]
    Cycle,
    #[error("descriptor direction mismatch")]
    WrongDirection,
}

/// Log and abort the process. Used for conditions the spec calls fatal:
/// an `hvaddr_mem` miss, or a vmmci command issued by host-side code
/// that isn't one of the known commands.
pub fn fatal(msg: impl fmt::Display) -> ! {
    log::error!("fatal VMM error: {msg}");
    std::process::abort();
}
