//! blk back-end: a single request queue serviced against a pluggable
//! [`StorageBackend`]. Each request chain is header (read-only), one or
//! more data descriptors, then a status byte (writable).

use crate::backend::StorageBackend;
use crate::error::DeviceResult;
use crate::irq::IrqLine;
use crate::mem::{GuestAddr, GuestMemory};
use crate::queue::{DescFlag, Descriptor, VirtQueue};
use crate::regs::{RegisterFile, ISR_QUEUE};

pub const QUEUE_SIZE: u16 = 128;
pub const SECTOR_SIZE: usize = 512;
pub const MAX_TRANSFER: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReqType {
    In,
    Out,
    Flush,
    FlushOut,
    GetId,
    ScsiCmd,
    ScsiCmdOut,
    Unknown(u32),
}

impl ReqType {
    fn from_u32(v: u32) -> ReqType {
        match v {
            0 => ReqType::In,
            1 => ReqType::Out,
            2 => ReqType::ScsiCmd,
            3 => ReqType::ScsiCmdOut,
            4 => ReqType::Flush,
            5 => ReqType::FlushOut,
            8 => ReqType::GetId,
            other => ReqType::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    IoErr = 1,
    Unsupp = 2,
}

/// Device-specific config area past the common register file: capacity
/// in 512-byte sectors and the maximum transfer size.
#[derive(Debug, Clone, Copy)]
pub struct BlkConfig {
    pub capacity: u64,
    pub max_xfer: u32,
}

pub struct VirtioBlk {
    pub regs: RegisterFile,
    pub config: BlkConfig,
    queue: VirtQueue,
    backend: Box<dyn StorageBackend>,
}

impl VirtioBlk {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        let capacity = backend.capacity_sectors();
        let regs = RegisterFile::new(0, 1, QUEUE_SIZE);
        VirtioBlk {
            regs,
            config: BlkConfig { capacity, max_xfer: MAX_TRANSFER as u32 },
            queue: VirtQueue::new(QUEUE_SIZE, GuestAddr(0)),
            backend,
        }
    }

    pub fn rebind_queue(&mut self, gpa: GuestAddr) {
        self.queue = VirtQueue::new(QUEUE_SIZE, gpa);
    }

    pub fn notify_queue(&mut self, queue: u16, mem: &dyn GuestMemory, irq: &dyn IrqLine) -> DeviceResult<()> {
        if queue != 0 {
            return Ok(());
        }
        let mut any = false;
        while let Some(head) = self.queue.pop_avail(mem) {
            match self.handle_request(mem, head) {
                Some(len) => {
                    self.queue.push_used(mem, head, len);
                    any = true;
                }
                None => {
                    log::warn!("blk: descriptor chain walk failed, aborting without used-ring publication");
                }
            }
        }
        if any {
            self.regs.raise_isr(ISR_QUEUE);
            irq.assert();
        }
        Ok(())
    }

    /// Services one request chain, returning the bytes the device
    /// reports used (conventionally 1, the status byte, but kept as a
    /// return value for symmetry with the other devices), or `None` if
    /// the chain itself is malformed (cycle/overflow) and must not be
    /// published to the used ring at all.
    fn handle_request(&mut self, mem: &dyn GuestMemory, head: u16) -> Option<u32> {
        let chain = self.queue.walk_chain(mem, head).ok()?;
        let Some((header_desc, data_descs, status_desc)) = split_chain(&chain) else {
            log::warn!("blk: malformed descriptor chain, dropping");
            return Some(0);
        };

        let mut header_bytes = [0u8; 16];
        if mem.read(GuestAddr(header_desc.addr), &mut header_bytes).is_err() {
            self.write_status(mem, status_desc, Status::IoErr);
            return Some(1);
        }
        let req_type = ReqType::from_u32(u32::from_le_bytes(header_bytes[0..4].try_into().unwrap()));
        let sector = u64::from_le_bytes(header_bytes[8..16].try_into().unwrap());

        let total_len: usize = data_descs.iter().map(|d| d.len as usize).sum();
        if total_len > MAX_TRANSFER {
            log::warn!("blk: oversized transfer of {total_len} bytes rejected");
            self.write_status(mem, status_desc, Status::IoErr);
            return Some(1);
        }

        let status = match req_type {
            ReqType::In => self.do_read(mem, sector, data_descs),
            ReqType::Out => self.do_write(mem, sector, data_descs),
            ReqType::Flush | ReqType::FlushOut | ReqType::GetId | ReqType::ScsiCmd | ReqType::ScsiCmdOut | ReqType::Unknown(_) => {
                Status::Unsupp
            }
        };
        self.write_status(mem, status_desc, status);
        Some(1)
    }

    fn do_read(&mut self, mem: &dyn GuestMemory, sector: u64, data_descs: &[Descriptor]) -> Status {
        if data_descs.iter().any(|d| !d.flags.contains(DescFlag::WRITE)) {
            return Status::IoErr;
        }
        let mut sec_bias: u64 = 0;
        for d in data_descs {
            let mut buf = vec![0u8; d.len as usize];
            let off = (sector + sec_bias) * SECTOR_SIZE as u64;
            if self.backend.read_at(off, &mut buf).is_err() {
                return Status::IoErr;
            }
            if mem.write(GuestAddr(d.addr), &buf).is_err() {
                return Status::IoErr;
            }
            sec_bias += d.len as u64 / SECTOR_SIZE as u64;
        }
        Status::Ok
    }

    fn do_write(&mut self, mem: &dyn GuestMemory, sector: u64, data_descs: &[Descriptor]) -> Status {
        if data_descs.iter().any(|d| d.flags.contains(DescFlag::WRITE)) {
            return Status::IoErr;
        }
        let mut sec_bias: u64 = 0;
        for d in data_descs {
            let mut buf = vec![0u8; d.len as usize];
            if mem.read(GuestAddr(d.addr), &mut buf).is_err() {
                return Status::IoErr;
            }
            let off = (sector + sec_bias) * SECTOR_SIZE as u64;
            if self.backend.write_at(off, &buf).is_err() {
                return Status::IoErr;
            }
            sec_bias += d.len as u64 / SECTOR_SIZE as u64;
        }
        Status::Ok
    }

    fn write_status(&self, mem: &dyn GuestMemory, status_desc: &Descriptor, status: Status) {
        let _ = mem.write(GuestAddr(status_desc.addr), &[status as u8]);
    }

    pub fn reset(&mut self) {
        self.queue.reset();
    }
}

/// Splits a chain into header, data descriptors, and the trailing
/// status descriptor. Returns `None` if the chain doesn't have at least
/// a header and a status descriptor.
fn split_chain(chain: &[Descriptor]) -> Option<(&Descriptor, &[Descriptor], &Descriptor)> {
    if chain.len() < 2 {
        return None;
    }
    let header = chain.first()?;
    let status = chain.last()?;
    let data = &chain[1..chain.len() - 1];
    Some((header, data, status))
}
