//! The legacy virtio PCI configuration register file: device/guest
//! features, queue PFN, queue size, queue select, queue notify, device
//! status, and the one-byte ISR.
//!
//! Offsets follow the legacy MMIO layout; reads and writes carry a
//! 1/2/4-byte access size. Illegal writes (`DEVICE_FEATURES`,
//! `QUEUE_SIZE`, `ISR_STATUS`) are logged and ignored. Reads of partial
//! widths preserve the untouched high bytes of the caller's register.

use crate::mem::GuestAddr;

bitflags::bitflags! {
    /// `device_status`. Writing 0 resets the device.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct DeviceStatus: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const DEVICE_NEEDS_RESET = 64;
        const FAILED = 128;
    }
}

pub const ISR_QUEUE: u8 = 1;
pub const ISR_CONFIG: u8 = 2;

/// Per-queue PFN/size bookkeeping the register file owns, separate from
/// `VirtQueue`'s runtime cursors so a `queue_pfn` write can re-resolve
/// `gpa`/`hva` without disturbing `last_avail`.
#[derive(Default, Clone, Copy)]
pub struct QueueDescriptor {
    pub pfn: u32,
    pub size: u16,
}

pub struct RegisterFile {
    pub device_feature: u32,
    pub guest_feature: u32,
    pub queue_select: u32,
    pub device_status: DeviceStatus,
    pub isr_status: u8,
    pub queues: Vec<QueueDescriptor>,
}

impl RegisterFile {
    pub fn new(device_feature: u32, num_queues: usize, queue_size: u16) -> Self {
        RegisterFile {
            device_feature,
            guest_feature: 0,
            queue_select: 0,
            device_status: DeviceStatus::empty(),
            isr_status: 0,
            queues: vec![QueueDescriptor { pfn: 0, size: queue_size }; num_queues],
        }
    }

    fn selected(&self) -> Option<&QueueDescriptor> {
        self.queues.get(self.queue_select as usize)
    }

    fn selected_mut(&mut self) -> Option<&mut QueueDescriptor> {
        self.queues.get_mut(self.queue_select as usize)
    }

    /// Width-aware read with the high-byte preservation rule: the
    /// caller's existing register value is ORed with the low
    /// `size`-byte slice of the canonical 32-bit value.
    pub fn read(&mut self, reg: Register, prior: u32, size: u8) -> u32 {
        let full = self.read_full(reg);
        merge_partial_read(prior, full, size)
    }

    fn read_full(&self, reg: Register) -> u32 {
        match reg {
            Register::DeviceFeature => self.device_feature,
            Register::GuestFeature => self.guest_feature,
            Register::QueuePfn => self.selected().map(|q| q.pfn).unwrap_or(0),
            Register::QueueSize => self.selected().map(|q| q.size as u32).unwrap_or(0),
            Register::QueueSelect => self.queue_select,
            Register::QueueNotify => 0,
            Register::DeviceStatus => self.device_status.bits(),
            Register::IsrStatus => {
                // Handled by `read_isr`; this path is only reached if a
                // caller reads ISR through the generic accessor.
                self.isr_status as u32
            }
        }
    }

    /// Writes `value`'s low `size` bytes into `reg`. Returns `Some(queue)`
    /// when the write was a `queue_notify`, so the caller can dispatch
    /// `<dev>_notifyq(queue)`; returns `Some(())`-shaped signals via the
    /// `RegisterEffect` enum for the other side-effecting writes.
    pub fn write(&mut self, reg: Register, value: u32, size: u8) -> RegisterEffect {
        let masked = mask_to_size(value, size);
        match reg {
            Register::DeviceFeature | Register::QueueSize | Register::IsrStatus => {
                log::warn!("ignored illegal write to read-only register {reg:?}");
                RegisterEffect::None
            }
            Register::GuestFeature => {
                self.guest_feature = masked;
                RegisterEffect::None
            }
            Register::QueuePfn => {
                if let Some(q) = self.selected_mut() {
                    q.pfn = masked;
                    RegisterEffect::QueuePfnChanged(self.queue_select)
                } else {
                    log::warn!("queue_pfn write with queue_select {} out of range", self.queue_select);
                    RegisterEffect::None
                }
            }
            Register::QueueSelect => {
                self.queue_select = masked;
                RegisterEffect::None
            }
            Register::QueueNotify => RegisterEffect::Notify(masked as u16),
            Register::DeviceStatus => {
                let new_status = DeviceStatus::from_bits_truncate(masked);
                if new_status.is_empty() {
                    self.reset();
                    RegisterEffect::Reset
                } else {
                    self.device_status = new_status;
                    RegisterEffect::None
                }
            }
        }
    }

    /// Reading ISR atomically clears it and signals the caller to
    /// deassert the interrupt line.
    pub fn read_isr(&mut self) -> u8 {
        let prev = self.isr_status;
        self.isr_status = 0;
        prev
    }

    /// Sets the queue-interrupt bit. Pairing with the IRQ line assertion
    /// is the caller's responsibility (see `devices::*::notify_queue`).
    pub fn raise_isr(&mut self, bits: u8) {
        self.isr_status |= bits;
    }

    fn reset(&mut self) {
        self.device_status = DeviceStatus::empty();
        self.isr_status = 0;
        for q in &mut self.queues {
            q.pfn = 0;
        }
    }

    pub fn queue_gpa(&self, queue: usize, page_size: u64) -> GuestAddr {
        GuestAddr(self.queues[queue].pfn as u64 * page_size)
    }

    pub fn queue_size(&self, queue: usize) -> u16 {
        self.queues[queue].size
    }

    pub fn driver_ok(&self) -> bool {
        self.device_status.contains(DeviceStatus::DRIVER_OK)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Register {
    DeviceFeature,
    GuestFeature,
    QueuePfn,
    QueueSize,
    QueueSelect,
    QueueNotify,
    DeviceStatus,
    IsrStatus,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RegisterEffect {
    None,
    Notify(u16),
    QueuePfnChanged(u32),
    Reset,
}

fn mask_to_size(value: u32, size: u8) -> u32 {
    match size {
        1 => value & 0xff,
        2 => value & 0xffff,
        _ => value,
    }
}

fn merge_partial_read(prior: u32, full: u32, size: u8) -> u32 {
    let low_mask = match size {
        1 => 0xff,
        2 => 0xffff,
        _ => u32::MAX,
    };
    (prior & !low_mask) | (full & low_mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isr_read_clears_and_returns_previous() {
        let mut regs = RegisterFile::new(0, 1, 64);
        regs.raise_isr(ISR_QUEUE);
        assert_eq!(regs.read_isr(), ISR_QUEUE);
        assert_eq!(regs.read_isr(), 0);
    }

    #[test]
    fn device_status_zero_resets() {
        let mut regs = RegisterFile::new(0, 1, 64);
        regs.write(Register::DeviceStatus, DeviceStatus::DRIVER_OK.bits(), 4);
        assert!(regs.driver_ok());
        let effect = regs.write(Register::DeviceStatus, 0, 4);
        assert_eq!(effect, RegisterEffect::Reset);
        assert!(!regs.driver_ok());
    }

    #[test]
    fn illegal_write_to_device_feature_is_ignored() {
        let mut regs = RegisterFile::new(0xdead, 1, 64);
        regs.write(Register::DeviceFeature, 0, 4);
        assert_eq!(regs.read(Register::DeviceFeature, 0, 4), 0xdead);
    }

    #[test]
    fn partial_read_preserves_high_bytes() {
        let mut regs = RegisterFile::new(0x1234_5678, 1, 64);
        let v = regs.read(Register::DeviceFeature, 0xffff_0000, 2);
        assert_eq!(v, 0xffff_5678);
    }

    #[test]
    fn queue_notify_write_reports_queue_index() {
        let mut regs = RegisterFile::new(0, 2, 64);
        regs.write(Register::QueueSelect, 1, 4);
        let effect = regs.write(Register::QueueNotify, 1, 4);
        assert_eq!(effect, RegisterEffect::Notify(1));
    }

    #[test]
    fn queue_pfn_write_with_out_of_range_select_is_ignored() {
        let mut regs = RegisterFile::new(0, 1, 64);
        regs.write(Register::QueueSelect, 7, 4);
        let effect = regs.write(Register::QueuePfn, 1, 4);
        assert_eq!(effect, RegisterEffect::None);
    }
}
