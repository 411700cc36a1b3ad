//! net back-end: a paravirtual NIC bridged to a host packet tap, with
//! RX/TX queues, optional MAC locking, and a local DHCP responder hook.
//!
//! The net device is the one front end touched from two threads (the
//! event loop and a tap-ready I/O worker), so its full state lives
//! behind a `Mutex` the caller locks around `rx_poll`/`notify_queue`.

use crate::error::DeviceResult;
use crate::irq::IrqLine;
use crate::mem::{GuestAddr, GuestMemory};
use crate::queue::{DescFlag, VirtQueue};
#[cfg(test)]
use crate::queue::Descriptor;
use crate::regs::{RegisterFile, ISR_QUEUE};

pub const QUEUE_SIZE: u16 = 256;
pub const QUEUE_RX: u16 = 0;
pub const QUEUE_TX: u16 = 1;
pub const NET_HDR_SIZE: usize = 12;
pub const MIN_TXLEN: usize = 60;
pub const MAX_TXLEN: usize = 1514;
const SCRATCH_LEN: usize = 4096;

/// Something that can answer "does this frame look like a DHCP request
/// I should answer locally, and if so what's the reply". The DHCP
/// responder's packet synthesis logic is an external collaborator; this
/// crate only defines the hook point it plugs into.
pub trait DhcpResponder: Send {
    fn respond(&mut self, frame: &[u8]) -> Option<Vec<u8>>;
}

/// A responder that never answers, used when `LOCAL` isn't set.
pub struct NoDhcp;
impl DhcpResponder for NoDhcp {
    fn respond(&mut self, _frame: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

/// Something that can read/write raw Ethernet frames, standing in for
/// the host tap file descriptor. `try_read` returns `Ok(None)` on
/// `EAGAIN`-equivalent "no data"; the caller never blocks on it outside
/// that one guaranteed-ready byte the spec allows.
pub trait Tap: Send {
    fn try_read(&mut self, buf: &mut [u8]) -> std::io::Result<Option<usize>>;
    fn write(&mut self, buf: &[u8]) -> std::io::Result<()>;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum RunState {
    Reset,
    Configured,
    Running,
}

pub struct VirtioNet {
    pub regs: RegisterFile,
    pub mac: [u8; 6],
    pub locked_mac: bool,
    rx: VirtQueue,
    tx: VirtQueue,
    state: RunState,
    tap: Box<dyn Tap>,
    dhcp: Box<dyn DhcpResponder>,
}

impl VirtioNet {
    pub fn new(mac: [u8; 6], locked_mac: bool, tap: Box<dyn Tap>, dhcp: Box<dyn DhcpResponder>) -> Self {
        VirtioNet {
            regs: RegisterFile::new(0, 2, QUEUE_SIZE),
            mac,
            locked_mac,
            rx: VirtQueue::new(QUEUE_SIZE, GuestAddr(0)),
            tx: VirtQueue::new(QUEUE_SIZE, GuestAddr(0)),
            state: RunState::Reset,
            tap,
            dhcp,
        }
    }

    pub fn rebind_queue(&mut self, queue: u16, gpa: GuestAddr) {
        match queue {
            QUEUE_RX => self.rx = VirtQueue::new(QUEUE_SIZE, gpa),
            QUEUE_TX => self.tx = VirtQueue::new(QUEUE_SIZE, gpa),
            _ => {}
        }
        if self.regs.driver_ok() {
            self.state = RunState::Running;
        } else {
            self.state = RunState::Configured;
        }
    }

    pub fn reset(&mut self) {
        self.rx.reset();
        self.tx.reset();
        self.state = RunState::Reset;
    }

    fn is_multicast(mac: &[u8; 6]) -> bool {
        mac[0] & 1 != 0
    }

    /// Event-driven on tap readability: loop while the tap yields data
    /// and at least one empty avail chain remains. Raises ISR and
    /// asserts IRQ iff at least one frame was enqueued this batch.
    pub fn rx_poll(&mut self, mem: &dyn GuestMemory, irq: &dyn IrqLine) -> DeviceResult<()> {
        if self.state != RunState::Running {
            return Ok(());
        }
        self.rx.snapshot_avail(mem);
        let mut enqueued = false;
        let mut scratch = [0u8; SCRATCH_LEN];
        loop {
            if self.rx.pending() == 0 {
                break;
            }
            let n = match self.tap.try_read(&mut scratch) {
                Ok(Some(n)) => n,
                Ok(None) => break,
                Err(_) => break,
            };
            let frame = &scratch[..n];
            if frame.len() < 6 {
                continue;
            }
            let dst: [u8; 6] = frame[0..6].try_into().unwrap();
            if self.locked_mac && !Self::is_multicast(&dst) && dst != self.mac {
                continue;
            }
            if frame.len() < MIN_TXLEN || frame.len() > MAX_TXLEN {
                continue;
            }
            if self.enqueue_rx_frame(mem, frame) {
                enqueued = true;
            }
        }
        if enqueued {
            self.regs.raise_isr(ISR_QUEUE);
            irq.assert();
        }
        Ok(())
    }

    fn enqueue_rx_frame(&mut self, mem: &dyn GuestMemory, frame: &[u8]) -> bool {
        let Some(head) = self.rx.pop_avail(mem) else {
            return false;
        };
        let Ok(chain) = self.rx.walk_chain(mem, head) else {
            return false;
        };
        let mut written = 0usize;
        let mut payload_off = 0usize;
        let total = NET_HDR_SIZE + frame.len();
        for (i, d) in chain.iter().enumerate() {
            if !d.flags.contains(DescFlag::WRITE) {
                return false;
            }
            let remaining = total - written;
            if remaining == 0 {
                break;
            }
            let take = (d.len as usize).min(remaining);
            let mut buf = vec![0u8; take];
            if i == 0 && written == 0 {
                let hdr_take = take.min(NET_HDR_SIZE);
                // The legacy net header is all zero except hdr_len, which
                // equals its own size.
                if hdr_take >= 2 {
                    buf[2] = NET_HDR_SIZE as u8;
                }
                let payload_take = take - hdr_take;
                buf[hdr_take..hdr_take + payload_take]
                    .copy_from_slice(&frame[payload_off..payload_off + payload_take]);
                payload_off += payload_take;
            } else {
                buf.copy_from_slice(&frame[payload_off..payload_off + take]);
                payload_off += take;
            }
            if mem.write(GuestAddr(d.addr), &buf).is_err() {
                return false;
            }
            written += take;
        }
        self.rx.push_used(mem, head, total as u32);
        true
    }

    /// Driven by queue notify on queue 1.
    pub fn notify_queue(&mut self, queue: u16, mem: &dyn GuestMemory, irq: &dyn IrqLine) -> DeviceResult<()> {
        if queue != QUEUE_TX {
            return Ok(());
        }
        while let Some(head) = self.tx.pop_avail(mem) {
            self.drain_one_tx(mem, head);
        }
        self.regs.raise_isr(ISR_QUEUE);
        irq.assert();
        Ok(())
    }

    fn drain_one_tx(&mut self, mem: &dyn GuestMemory, head: u16) {
        let Ok(chain) = self.tx.walk_chain(mem, head) else {
            self.tx.push_used(mem, head, 0);
            return;
        };
        // Skip the virtio-net header descriptor (the first one).
        let Some((_hdr, data_descs)) = chain.split_first() else {
            self.tx.push_used(mem, head, 0);
            return;
        };

        let total: usize = data_descs.iter().map(|d| d.len as usize).sum();
        if !(MIN_TXLEN..=MAX_TXLEN).contains(&total) {
            // Scenario 4: below MIN_TXLEN, used is pushed but nothing
            // is written to the tap.
            self.tx.push_used(mem, head, 0);
            return;
        }
        if data_descs.iter().any(|d| d.flags.contains(DescFlag::WRITE)) {
            log::warn!("net: tx chain has a writable data descriptor, protocol error");
            self.tx.push_used(mem, head, 0);
            return;
        }

        let mut pkt = vec![0u8; total];
        let mut off = 0usize;
        for d in data_descs {
            let take = d.len as usize;
            if mem.read(GuestAddr(d.addr), &mut pkt[off..off + take]).is_err() {
                self.tx.push_used(mem, head, 0);
                return;
            }
            off += take;
        }

        if pkt.len() >= 6 {
            let src: [u8; 6] = pkt[6..12].try_into().unwrap_or([0; 6]);
            if self.locked_mac && src != self.mac {
                self.tx.push_used(mem, head, total as u32);
                return;
            }
        }

        if let Some(reply) = self.dhcp.respond(&pkt) {
            self.enqueue_rx_frame(mem, &reply);
        } else {
            let _ = self.tap.write(&pkt);
        }
        self.tx.push_used(mem, head, total as u32);
    }
}
