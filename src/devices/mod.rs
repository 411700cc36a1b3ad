//! Device front ends: rng, blk, net, vmmci, and the read-only scsi
//! cdrom. Each owns a [`RegisterFile`](crate::regs::RegisterFile) (with
//! a device-specific config area) and one or more
//! [`VirtQueue`](crate::queue::VirtQueue)s, and is driven by MMIO
//! register accesses and queue-notify dispatch from `VmmState`.

pub mod blk;
pub mod net;
pub mod rng;
pub mod scsi;
pub mod vmmci;
