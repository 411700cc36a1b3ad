//! Save/restore framing: device registers and per-queue metadata are
//! serialised as opaque, fixed-order byte blobs (rng, blk, scsi, net,
//! vmmci). `hva`, function pointers, and timer handles never travel;
//! after restore the receiver re-resolves `hva` from `gpa * page_size`,
//! re-binds callbacks, and opens storage back-ends afresh.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::queue::VirtQueue;
use crate::regs::{DeviceStatus, QueueDescriptor, RegisterFile};

pub trait Saveable {
    fn save(&self, w: &mut dyn Write) -> io::Result<()>;
    fn restore(&mut self, r: &mut dyn Read) -> io::Result<()>;
}

impl Saveable for RegisterFile {
    fn save(&self, w: &mut dyn Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.device_feature)?;
        w.write_u32::<LittleEndian>(self.guest_feature)?;
        w.write_u32::<LittleEndian>(self.queue_select)?;
        w.write_u32::<LittleEndian>(self.device_status.bits())?;
        w.write_u8(self.isr_status)?;
        w.write_u32::<LittleEndian>(self.queues.len() as u32)?;
        for q in &self.queues {
            w.write_u32::<LittleEndian>(q.pfn)?;
            w.write_u16::<LittleEndian>(q.size)?;
        }
        Ok(())
    }

    fn restore(&mut self, r: &mut dyn Read) -> io::Result<()> {
        self.device_feature = r.read_u32::<LittleEndian>()?;
        self.guest_feature = r.read_u32::<LittleEndian>()?;
        self.queue_select = r.read_u32::<LittleEndian>()?;
        self.device_status = DeviceStatus::from_bits_truncate(r.read_u32::<LittleEndian>()?);
        self.isr_status = r.read_u8()?;
        let n = r.read_u32::<LittleEndian>()? as usize;
        self.queues.clear();
        for _ in 0..n {
            let pfn = r.read_u32::<LittleEndian>()?;
            let size = r.read_u16::<LittleEndian>()?;
            self.queues.push(QueueDescriptor { pfn, size });
        }
        Ok(())
    }
}

/// Serialises the parts of `VirtQueue` that survive a save: the
/// geometry and cursors. `gpa` is re-derived from the register file's
/// `pfn` on restore rather than serialised directly, since the pointer
/// itself never travels.
pub fn save_queue(q: &VirtQueue, w: &mut dyn Write) -> io::Result<()> {
    w.write_u16::<LittleEndian>(q.qs)?;
    w.write_u16::<LittleEndian>(q.last_avail)?;
    w.write_u16::<LittleEndian>(q.notified_avail)?;
    Ok(())
}

pub fn restore_queue(r: &mut dyn Read, gpa: crate::mem::GuestAddr) -> io::Result<VirtQueue> {
    let qs = r.read_u16::<LittleEndian>()?;
    let last_avail = r.read_u16::<LittleEndian>()?;
    let notified_avail = r.read_u16::<LittleEndian>()?;
    let mut q = VirtQueue::new(qs, gpa);
    q.last_avail = last_avail;
    q.notified_avail = notified_avail;
    Ok(q)
}
