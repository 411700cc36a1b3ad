//! Aggregates every device front end into one value owned by the
//! parent VMM process, replacing the teacher's per-device global
//! mutable arrays (`viornd`, `vioblk[]`, `vionet[]`, ...) with fields
//! on a single `VmmState` passed into MMIO dispatch.

use crate::devices::blk::VirtioBlk;
use crate::devices::net::VirtioNet;
use crate::devices::rng::VirtioRng;
use crate::devices::scsi::VirtioScsiCdrom;
use crate::devices::vmmci::VirtioVmmci;
use crate::error::DeviceResult;
use crate::irq::{IrqLine, Reactor};
use crate::mem::GuestMemory;
use crate::regs::{Register, RegisterEffect};

/// Guest page size; `queue_pfn` is a page frame number against this.
pub const PAGE_SIZE: u64 = 4096;

/// Identifies one device instance for register/notify dispatch. `Blk`
/// and `Net` carry the index into their respective `Vec`s, since the
/// lifecycle section allows N block devices and M net devices per VM.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeviceId {
    Rng,
    Blk(usize),
    Net(usize),
    Scsi,
    Vmmci,
}

pub struct VmmState {
    pub rng: VirtioRng,
    pub blk: Vec<VirtioBlk>,
    pub net: Vec<VirtioNet>,
    pub scsi: Option<VirtioScsiCdrom>,
    pub vmmci: VirtioVmmci,
}

impl VmmState {
    pub fn new(blk: Vec<VirtioBlk>, net: Vec<VirtioNet>, scsi: Option<VirtioScsiCdrom>, vmmci: VirtioVmmci) -> Self {
        VmmState { rng: VirtioRng::new(), blk, net, scsi, vmmci }
    }

    /// Services a `queue_notify` write already decoded to a device id.
    pub fn notify_queue(&mut self, id: DeviceId, queue: u16, mem: &dyn GuestMemory, irq: &dyn IrqLine) -> DeviceResult<()> {
        match id {
            DeviceId::Rng => self.rng.notify_queue(queue, mem, irq),
            DeviceId::Blk(i) => self.blk[i].notify_queue(queue, mem, irq),
            DeviceId::Net(i) => self.net[i].notify_queue(queue, mem, irq),
            DeviceId::Scsi => {
                if let Some(scsi) = &mut self.scsi {
                    scsi.notify_queue(queue, mem, irq)?;
                }
                Ok(())
            }
            DeviceId::Vmmci => Ok(()),
        }
    }

    /// Writes a common-header register on the named device, applying
    /// whatever side effect the write produces: re-binding a queue's
    /// `gpa` on a `queue_pfn` write, dispatching a notify, or resetting
    /// per-queue state.
    pub fn register_write(
        &mut self,
        id: DeviceId,
        reg: Register,
        value: u32,
        size: u8,
        mem: &dyn GuestMemory,
        irq: &dyn IrqLine,
    ) -> DeviceResult<()> {
        let effect = self.regs_mut(id).write(reg, value, size);
        match effect {
            RegisterEffect::None => Ok(()),
            RegisterEffect::Notify(queue) => self.notify_queue(id, queue, mem, irq),
            RegisterEffect::QueuePfnChanged(queue) => {
                self.rebind_queue(id, queue as usize);
                Ok(())
            }
            RegisterEffect::Reset => {
                self.reset(id);
                Ok(())
            }
        }
    }

    pub fn register_read(&mut self, id: DeviceId, reg: Register, prior: u32, size: u8) -> u32 {
        self.regs_mut(id).read(reg, prior, size)
    }

    /// Reading `isr_status` atomically clears it and deasserts the line
    /// (the legacy read-clear-deassert pair must be a single event).
    pub fn read_isr(&mut self, id: DeviceId, irq: &dyn IrqLine) -> u8 {
        let bits = self.regs_mut(id).read_isr();
        irq.deassert();
        bits
    }

    /// Host-initiated vmmci command (shutdown/reboot/syncrtc request).
    pub fn vmmci_ctl(&mut self, cmd: crate::devices::vmmci::Command, reactor: &mut dyn Reactor, irq: &dyn IrqLine) {
        self.vmmci.vmmci_ctl(cmd, reactor, irq);
    }

    /// Guest acknowledgement, delivered as a config-area command write.
    pub fn vmmci_ack(&mut self, value: u32, reactor: &mut dyn Reactor) {
        self.vmmci.vmmci_ack(value, reactor);
    }

    fn regs_mut(&mut self, id: DeviceId) -> &mut crate::regs::RegisterFile {
        match id {
            DeviceId::Rng => &mut self.rng.regs,
            DeviceId::Blk(i) => &mut self.blk[i].regs,
            DeviceId::Net(i) => &mut self.net[i].regs,
            DeviceId::Scsi => &mut self.scsi.as_mut().expect("scsi register access with no cdrom attached").regs,
            DeviceId::Vmmci => &mut self.vmmci.regs,
        }
    }

    fn rebind_queue(&mut self, id: DeviceId, queue: usize) {
        match id {
            DeviceId::Rng => {
                let gpa = self.rng.regs.queue_gpa(queue, PAGE_SIZE);
                self.rng.rebind_queue(gpa);
            }
            DeviceId::Blk(i) => {
                let gpa = self.blk[i].regs.queue_gpa(queue, PAGE_SIZE);
                self.blk[i].rebind_queue(gpa);
            }
            DeviceId::Net(i) => {
                let gpa = self.net[i].regs.queue_gpa(queue, PAGE_SIZE);
                self.net[i].rebind_queue(queue as u16, gpa);
            }
            DeviceId::Scsi => {
                if let Some(scsi) = &mut self.scsi {
                    let gpa = scsi.regs.queue_gpa(queue, PAGE_SIZE);
                    scsi.rebind_queue(gpa);
                }
            }
            DeviceId::Vmmci => {}
        }
    }

    fn reset(&mut self, id: DeviceId) {
        match id {
            DeviceId::Rng => self.rng.reset(),
            DeviceId::Blk(i) => self.blk[i].reset(),
            DeviceId::Net(i) => self.net[i].reset(),
            DeviceId::Scsi => {
                if let Some(scsi) = &mut self.scsi {
                    scsi.reset();
                }
            }
            DeviceId::Vmmci => self.vmmci.reset(),
        }
    }
}
