//! Minimal runnable demo: boots a `VmmState` with one rng and one blk
//! device over an in-memory disk, drives both through the legacy
//! register handshake, and prints what each queue notify produced.

use virtio_backend::backend::MemBackend;
use virtio_backend::devices::blk::VirtioBlk;
use virtio_backend::devices::vmmci::VirtioVmmci;
use virtio_backend::irq::CountingIrqLine;
use virtio_backend::mem::{FlatGuestMemory, GuestAddr, GuestMemory};
use virtio_backend::queue::{DescFlag, Descriptor};
use virtio_backend::regs::{DeviceStatus, Register};
use virtio_backend::vmm::{DeviceId, VmmState, PAGE_SIZE};

struct LoggingTerminator;
impl virtio_backend::devices::vmmci::VmTerminator for LoggingTerminator {
    fn terminate(&self, disposition: virtio_backend::devices::vmmci::Command) {
        log::info!("vmmci requested VM termination: {disposition:?}");
    }
}

fn write_desc(mem: &FlatGuestMemory, base: u64, id: u16, d: Descriptor) {
    let mut raw = [0u8; 16];
    raw[0..8].copy_from_slice(&d.addr.to_le_bytes());
    raw[8..12].copy_from_slice(&d.len.to_le_bytes());
    raw[12..14].copy_from_slice(&d.flags.bits().to_le_bytes());
    raw[14..16].copy_from_slice(&d.next.to_le_bytes());
    mem.write(GuestAddr(base + id as u64 * 16), &raw).unwrap();
}

fn push_avail(mem: &FlatGuestMemory, avail_offset: u64, slot: u16, head: u16) {
    mem.write(GuestAddr(avail_offset + 4 + slot as u64 * 2), &head.to_le_bytes()).unwrap();
    mem.write(GuestAddr(avail_offset + 2), &(slot + 1).to_le_bytes()).unwrap();
}

fn main() {
    env_logger::init();

    let mem = FlatGuestMemory::new(4 << 20);
    let irq = CountingIrqLine::default();

    let disk: Vec<u8> = (0..8192).map(|i| (i % 16) as u8).collect();
    let blk = VirtioBlk::new(Box::new(MemBackend::new(disk)));
    let vmmci = VirtioVmmci::new(std::sync::Arc::new(LoggingTerminator));
    let mut vmm = VmmState::new(vec![blk], vec![], None, vmmci);

    vmm.register_write(DeviceId::Blk(0), Register::DeviceStatus, DeviceStatus::DRIVER_OK.bits(), 4, &mem, &irq)
        .unwrap();
    vmm.register_write(DeviceId::Blk(0), Register::QueuePfn, 0x10, 4, &mem, &irq).unwrap();

    let queue_base = GuestAddr(0x10 * PAGE_SIZE);
    let avail_offset = 16 * 128;

    let header_addr = queue_base.0 + 0x100_000;
    let mut header = [0u8; 16];
    header[8..16].copy_from_slice(&0u64.to_le_bytes());
    mem.write(GuestAddr(header_addr), &header).unwrap();

    write_desc(&mem, queue_base.0, 0, Descriptor { addr: header_addr, len: 16, flags: DescFlag::NEXT, next: 1 });
    write_desc(
        &mem,
        queue_base.0,
        1,
        Descriptor { addr: queue_base.0 + 0x200_000, len: 512, flags: DescFlag::NEXT | DescFlag::WRITE, next: 2 },
    );
    write_desc(
        &mem,
        queue_base.0,
        2,
        Descriptor { addr: queue_base.0 + 0x300_000, len: 1, flags: DescFlag::WRITE, next: 0 },
    );
    push_avail(&mem, queue_base.0 + avail_offset, 0, 0);

    vmm.register_write(DeviceId::Blk(0), Register::QueueNotify, 0, 4, &mem, &irq).unwrap();

    let mut status = [0u8; 1];
    mem.read(GuestAddr(queue_base.0 + 0x300_000), &mut status).unwrap();
    log::info!("blk read completed with status {}", status[0]);

    let bits = vmm.read_isr(DeviceId::Blk(0), &irq);
    log::info!(
        "isr_status after notify: {bits}, irq asserted {} time(s)",
        irq.asserted.load(std::sync::atomic::Ordering::SeqCst)
    );
}
