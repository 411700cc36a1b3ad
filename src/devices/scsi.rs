//! scsi cdrom back-end: a read-only ATAPI device exposed over
//! virtio-scsi. The SCSI command interpreter itself is an external
//! collaborator (`ScsiCommandProcessor`); this module only walks the
//! virtio-scsi request/response/data descriptor chain and calls into
//! it, the same shape [`blk`](crate::devices::blk) uses for its
//! storage back-end.

use crate::error::DeviceResult;
use crate::irq::IrqLine;
use crate::mem::{GuestAddr, GuestMemory};
use crate::queue::{DescFlag, Descriptor, VirtQueue};
use crate::regs::{RegisterFile, ISR_QUEUE};

pub const QUEUE_SIZE: u16 = 128;
pub const CDB_LEN: usize = 16;
pub const SENSE_LEN: usize = 18;
pub const MAX_TRANSFER: usize = 64 * 1024;

const REQ_LEN: usize = 8 + 8 + 1 + 1 + 1 + CDB_LEN;
const RESP_LEN: usize = 4 + 4 + 2 + 1 + 1 + SENSE_LEN;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum ScsiStatus {
    Good = 0,
    CheckCondition = 2,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum ScsiError {
    #[error("drive not ready")]
    NotReady,
    #[error("illegal request")]
    IllegalRequest,
}

/// The excluded collaborator: interprets a CDB against device state
/// and fills `data` with the response payload (for read commands).
pub trait ScsiCommandProcessor: Send {
    fn process(&mut self, cdb: &[u8], data: &mut [u8]) -> Result<ScsiStatus, ScsiError>;
}

pub struct VirtioScsiCdrom {
    pub regs: RegisterFile,
    queue: VirtQueue,
    processor: Box<dyn ScsiCommandProcessor>,
}

impl VirtioScsiCdrom {
    pub fn new(processor: Box<dyn ScsiCommandProcessor>) -> Self {
        VirtioScsiCdrom {
            regs: RegisterFile::new(0, 1, QUEUE_SIZE),
            queue: VirtQueue::new(QUEUE_SIZE, GuestAddr(0)),
            processor,
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
                    log::warn!("scsi: descriptor chain walk failed, aborting without used-ring publication");
                }
            }
        }
        if any {
            self.regs.raise_isr(ISR_QUEUE);
            irq.assert();
        }
        Ok(())
    }

    /// `None` only for a chain the engine itself rejects (cycle/overflow),
    /// which must not be published to the used ring at all.
    fn handle_request(&mut self, mem: &dyn GuestMemory, head: u16) -> Option<u32> {
        let chain = self.queue.walk_chain(mem, head).ok()?;
        let Some((req_desc, resp_desc, data_descs)) = split_chain(&chain) else {
            log::warn!("scsi: malformed descriptor chain, dropping");
            return Some(0);
        };

        let mut req = [0u8; REQ_LEN];
        if mem.read(GuestAddr(req_desc.addr), &mut req).is_err() {
            return Some(0);
        }
        let cdb = &req[18..18 + CDB_LEN];

        if data_descs.iter().any(|d| !d.flags.contains(DescFlag::WRITE)) {
            self.write_response(mem, resp_desc, Err(ScsiError::IllegalRequest));
            return Some(RESP_LEN as u32);
        }
        let total: usize = data_descs.iter().map(|d| d.len as usize).sum();
        if total > MAX_TRANSFER {
            log::warn!("scsi: oversized transfer of {total} bytes rejected");
            self.write_response(mem, resp_desc, Err(ScsiError::IllegalRequest));
            return Some(RESP_LEN as u32);
        }

        let mut data = vec![0u8; total];
        let outcome = self.processor.process(cdb, &mut data);
        let mut written = 0usize;
        if outcome.is_ok() {
            for d in data_descs {
                let take = (d.len as usize).min(total - written);
                if mem.write(GuestAddr(d.addr), &data[written..written + take]).is_err() {
                    self.write_response(mem, resp_desc, Err(ScsiError::IllegalRequest));
                    return Some(RESP_LEN as u32);
                }
                written += take;
            }
        }
        self.write_response(mem, resp_desc, outcome);
        Some((RESP_LEN + written) as u32)
    }

    fn write_response(&self, mem: &dyn GuestMemory, resp_desc: &Descriptor, outcome: Result<ScsiStatus, ScsiError>) {
        let mut resp = [0u8; RESP_LEN];
        let status = match outcome {
            Ok(s) => s,
            Err(_) => ScsiStatus::CheckCondition,
        };
        resp[8] = status as u8;
        if outcome.is_err() {
            resp[0..4].copy_from_slice(&(SENSE_LEN as u32).to_le_bytes());
        }
        let _ = mem.write(GuestAddr(resp_desc.addr), &resp);
    }

    pub fn reset(&mut self) {
        self.queue.reset();
    }
}

/// Splits a chain into the read-only request header, the writable
/// response descriptor, and the (possibly empty) writable data-in
/// descriptors that follow it, matching the virtio-scsi wire order
/// `request, response, data-in` for a read-only device with no
/// data-out segment.
fn split_chain(chain: &[Descriptor]) -> Option<(&Descriptor, &Descriptor, &[Descriptor])> {
    if chain.len() < 2 {
        return None;
    }
    let req = chain.first()?;
    let resp = chain.get(1)?;
    let data = &chain[2..];
    Some((req, resp, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::CountingIrqLine;
    use crate::mem::FlatGuestMemory;

    struct FakeCdrom {
        capacity_blocks: u32,
        image: Vec<u8>,
    }

    impl ScsiCommandProcessor for FakeCdrom {
        fn process(&mut self, cdb: &[u8], data: &mut [u8]) -> Result<ScsiStatus, ScsiError> {
            match cdb[0] {
                0x12 => {
                    // INQUIRY: peripheral qualifier/device type 0x05 (CD-ROM).
                    if !data.is_empty() {
                        data[0] = 0x05;
                    }
                    Ok(ScsiStatus::Good)
                }
                0x25 => {
                    // READ_CAPACITY(10): last LBA big-endian, block size big-endian.
                    if data.len() >= 8 {
                        data[0..4].copy_from_slice(&(self.capacity_blocks - 1).to_be_bytes());
                        data[4..8].copy_from_slice(&2048u32.to_be_bytes());
                    }
                    Ok(ScsiStatus::Good)
                }
                0x28 => {
                    // READ(10): lba at cdb[2..6] big-endian.
                    let lba = u32::from_be_bytes(cdb[2..6].try_into().unwrap()) as usize;
                    let off = lba * 2048;
                    if off + data.len() > self.image.len() {
                        return Err(ScsiError::IllegalRequest);
                    }
                    data.copy_from_slice(&self.image[off..off + data.len()]);
                    Ok(ScsiStatus::Good)
                }
                _ => Err(ScsiError::IllegalRequest),
            }
        }
    }

    fn write_desc(mem: &FlatGuestMemory, id: u16, d: Descriptor) {
        let mut raw = [0u8; 16];
        raw[0..8].copy_from_slice(&d.addr.to_le_bytes());
        raw[8..12].copy_from_slice(&d.len.to_le_bytes());
        raw[12..14].copy_from_slice(&d.flags.bits().to_le_bytes());
        raw[14..16].copy_from_slice(&d.next.to_le_bytes());
        mem.write(GuestAddr(id as u64 * 16), &raw).unwrap();
    }

    fn push_avail(mem: &FlatGuestMemory, q: &VirtQueue, head: u16) {
        mem.write(GuestAddr(q.avail_offset + 4), &head.to_le_bytes()).unwrap();
        mem.write(GuestAddr(q.avail_offset + 2), &1u16.to_le_bytes()).unwrap();
    }

    fn write_req(mem: &FlatGuestMemory, addr: u64, cdb: &[u8]) {
        let mut req = [0u8; REQ_LEN];
        req[18..18 + cdb.len()].copy_from_slice(cdb);
        mem.write(GuestAddr(addr), &req).unwrap();
    }

    #[test]
    fn read_capacity_reports_geometry() {
        let mem = FlatGuestMemory::new(1 << 20);
        let processor = FakeCdrom { capacity_blocks: 100, image: vec![0u8; 100 * 2048] };
        let mut scsi = VirtioScsiCdrom::new(Box::new(processor));
        scsi.rebind_queue(GuestAddr(0));

        let mut cdb = [0u8; CDB_LEN];
        cdb[0] = 0x25;
        write_req(&mem, 0x2000, &cdb);
        write_desc(&mem, 0, Descriptor { addr: 0x2000, len: REQ_LEN as u32, flags: DescFlag::NEXT, next: 1 });
        write_desc(&mem, 1, Descriptor { addr: 0x3000, len: RESP_LEN as u32, flags: DescFlag::NEXT | DescFlag::WRITE, next: 2 });
        write_desc(&mem, 2, Descriptor { addr: 0x4000, len: 8, flags: DescFlag::WRITE, next: 0 });
        push_avail(&mem, &scsi.queue, 0);

        let irq = CountingIrqLine::default();
        scsi.notify_queue(0, &mem, &irq).unwrap();

        let mut resp = [0u8; RESP_LEN];
        mem.read(GuestAddr(0x3000), &mut resp).unwrap();
        assert_eq!(resp[8], ScsiStatus::Good as u8);

        let mut data = [0u8; 8];
        mem.read(GuestAddr(0x4000), &mut data).unwrap();
        assert_eq!(u32::from_be_bytes(data[0..4].try_into().unwrap()), 99);
        assert_eq!(u32::from_be_bytes(data[4..8].try_into().unwrap()), 2048);
    }

    #[test]
    fn read10_returns_sector_from_image() {
        let mem = FlatGuestMemory::new(1 << 20);
        let mut image = vec![0u8; 4 * 2048];
        image[2048..2048 + 4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let processor = FakeCdrom { capacity_blocks: 4, image };
        let mut scsi = VirtioScsiCdrom::new(Box::new(processor));
        scsi.rebind_queue(GuestAddr(0));

        let mut cdb = [0u8; CDB_LEN];
        cdb[0] = 0x28;
        cdb[2..6].copy_from_slice(&1u32.to_be_bytes());
        write_req(&mem, 0x2000, &cdb);
        write_desc(&mem, 0, Descriptor { addr: 0x2000, len: REQ_LEN as u32, flags: DescFlag::NEXT, next: 1 });
        write_desc(&mem, 1, Descriptor { addr: 0x3000, len: RESP_LEN as u32, flags: DescFlag::NEXT | DescFlag::WRITE, next: 2 });
        write_desc(&mem, 2, Descriptor { addr: 0x4000, len: 2048, flags: DescFlag::WRITE, next: 0 });
        push_avail(&mem, &scsi.queue, 0);

        let irq = CountingIrqLine::default();
        scsi.notify_queue(0, &mem, &irq).unwrap();

        let mut data = [0u8; 4];
        mem.read(GuestAddr(0x4000), &mut data).unwrap();
        assert_eq!(data, [0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn unsupported_opcode_reports_check_condition() {
        let mem = FlatGuestMemory::new(1 << 20);
        let processor = FakeCdrom { capacity_blocks: 4, image: vec![0u8; 4 * 2048] };
        let mut scsi = VirtioScsiCdrom::new(Box::new(processor));
        scsi.rebind_queue(GuestAddr(0));

        let mut cdb = [0u8; CDB_LEN];
        cdb[0] = 0xff;
        write_req(&mem, 0x2000, &cdb);
        write_desc(&mem, 0, Descriptor { addr: 0x2000, len: REQ_LEN as u32, flags: DescFlag::NEXT, next: 1 });
        write_desc(&mem, 1, Descriptor { addr: 0x3000, len: RESP_LEN as u32, flags: DescFlag::WRITE, next: 0 });
        push_avail(&mem, &scsi.queue, 0);

        let irq = CountingIrqLine::default();
        scsi.notify_queue(0, &mem, &irq).unwrap();

        let mut resp = [0u8; RESP_LEN];
        mem.read(GuestAddr(0x3000), &mut resp).unwrap();
        assert_eq!(resp[8], ScsiStatus::CheckCondition as u8);
    }
}
