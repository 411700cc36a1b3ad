//! rng back-end: an entropy source with a single receive queue. On
//! notify for queue 0, the head descriptor's `len` bytes are filled
//! with cryptographic randomness and written back into guest memory.

use rand::RngCore;

use crate::error::{fatal, DeviceResult};
use crate::irq::IrqLine;
use crate::mem::GuestMemory;
use crate::queue::VirtQueue;
use crate::regs::{RegisterFile, ISR_QUEUE};

pub const QUEUE_SIZE: u16 = 64;
pub const MAX_REQUEST_LEN: u32 = 64 * 1024;

pub struct VirtioRng {
    pub regs: RegisterFile,
    queue: VirtQueue,
}

impl VirtioRng {
    pub fn new() -> Self {
        VirtioRng {
            regs: RegisterFile::new(0, 1, QUEUE_SIZE),
            queue: VirtQueue::new(QUEUE_SIZE, crate::mem::GuestAddr(0)),
        }
    }

    pub fn rebind_queue(&mut self, gpa: crate::mem::GuestAddr) {
        self.queue = VirtQueue::new(QUEUE_SIZE, gpa);
    }

    /// Services a notify on queue 0. Anything other than queue 0 is a
    /// no-op per the spec ("On queue notify for queue 0 only").
    pub fn notify_queue(&mut self, queue: u16, mem: &dyn GuestMemory, irq: &dyn IrqLine) -> DeviceResult<()> {
        if queue != 0 {
            return Ok(());
        }
        while let Some(head) = self.queue.pop_avail(mem) {
            let Ok(chain) = self.queue.walk_chain(mem, head) else {
                log::warn!("rng: descriptor chain walk failed, aborting without used-ring publication");
                continue;
            };
            let Some(desc) = chain.first() else {
                log::warn!("rng: empty descriptor chain, dropping");
                continue;
            };
            if desc.len > MAX_REQUEST_LEN {
                fatal(format_args!("rng request length {} exceeds {MAX_REQUEST_LEN}", desc.len));
            }
            let mut buf = vec![0u8; desc.len as usize];
            rand::rngs::OsRng.fill_bytes(&mut buf);
            mem.write(crate::mem::GuestAddr(desc.addr), &buf)
                .map_err(|_| crate::error::DeviceError::GuestMemory(crate::mem::GuestAddr(desc.addr)))?;
            self.queue.push_used(mem, head, desc.len);
        }
        self.regs.raise_isr(ISR_QUEUE);
        irq.assert();
        Ok(())
    }

    pub fn reset(&mut self) {
        self.queue.reset();
    }
}

impl Default for VirtioRng {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::CountingIrqLine;
    use crate::mem::{FlatGuestMemory, GuestAddr};

    fn push_avail(mem: &FlatGuestMemory, q: &VirtQueue, head: u16) {
        mem.write(GuestAddr(q.gpa.0 + q.avail_offset + 4), &head.to_le_bytes()).unwrap();
        mem.write(GuestAddr(q.gpa.0 + q.avail_offset + 2), &1u16.to_le_bytes()).unwrap();
    }

    fn write_desc(mem: &FlatGuestMemory, q: &VirtQueue, id: u16, addr: u64, len: u32, flags: u16) {
        let mut raw = [0u8; 16];
        raw[0..8].copy_from_slice(&addr.to_le_bytes());
        raw[8..12].copy_from_slice(&len.to_le_bytes());
        raw[12..14].copy_from_slice(&flags.to_le_bytes());
        mem.write(GuestAddr(q.gpa.0 + id as u64 * 16), &raw).unwrap();
    }

    /// Scenario 1 from the testable-properties section: qs=64,
    /// avail.ring[0]=5, desc[5]={addr=0x1000, len=16, flags=WRITE,
    /// next=0}, avail.idx=1. The vring itself lives at a separate gpa
    /// so its own descriptor/used-ring footprint doesn't overlap the
    /// data buffer at 0x1000.
    #[test]
    fn scenario_rng_fill() {
        let mem = FlatGuestMemory::new(1 << 20);
        let mut rng = VirtioRng::new();
        rng.rebind_queue(GuestAddr(0x10000));
        write_desc(&mem, &rng.queue, 5, 0x1000, 16, crate::queue::DescFlag::WRITE.bits());
        push_avail(&mem, &rng.queue, 5);

        let irq = CountingIrqLine::default();
        rng.notify_queue(0, &mem, &irq).unwrap();

        let mut used_idx = [0u8; 2];
        mem.read(GuestAddr(rng.queue.gpa.0 + rng.queue.used_offset + 2), &mut used_idx).unwrap();
        assert_eq!(u16::from_le_bytes(used_idx), 1);

        let mut used_elem = [0u8; 8];
        mem.read(GuestAddr(rng.queue.gpa.0 + rng.queue.used_offset + 4), &mut used_elem).unwrap();
        assert_eq!(u32::from_le_bytes(used_elem[0..4].try_into().unwrap()), 5);
        assert_eq!(u32::from_le_bytes(used_elem[4..8].try_into().unwrap()), 16);

        assert_eq!(rng.regs.read_isr(), ISR_QUEUE);
        assert_eq!(irq.asserted.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn notify_on_other_queue_is_noop() {
        let mem = FlatGuestMemory::new(1 << 16);
        let mut rng = VirtioRng::new();
        let irq = CountingIrqLine::default();
        rng.notify_queue(1, &mem, &irq).unwrap();
        assert_eq!(irq.asserted.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
