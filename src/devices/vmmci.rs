//! vmmci back-end: a virtqueue-less control channel for shutdown,
//! reboot, wall-clock publication, and guest RTC resync. Commands
//! travel through the device-specific config area and an ISR
//! config-change signal rather than a queue notify.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::irq::{IrqLine, Reactor, TimerHandle};
use crate::regs::{RegisterFile, ISR_CONFIG};

pub const CMD_NONE: u32 = 0;
pub const CMD_SHUTDOWN: u32 = 1;
pub const CMD_REBOOT: u32 = 2;
pub const CMD_SYNCRTC: u32 = 3;

/// Feature bit gating delivery of `SYNCRTC`; the spec requires the
/// guest to have acknowledged it before the host will send one.
pub const FEATURE_SYNCRTC: u32 = 1;

const ACK_TIMEOUT_SHORT: Duration = Duration::from_secs(3);
const ACK_TIMEOUT_LONG: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Command {
    None,
    Shutdown,
    Reboot,
    SyncRtc,
}

impl Command {
    fn from_u32(v: u32) -> Option<Command> {
        match v {
            CMD_NONE => Some(Command::None),
            CMD_SHUTDOWN => Some(Command::Shutdown),
            CMD_REBOOT => Some(Command::Reboot),
            CMD_SYNCRTC => Some(Command::SyncRtc),
            _ => None,
        }
    }

    fn to_u32(self) -> u32 {
        match self {
            Command::None => CMD_NONE,
            Command::Shutdown => CMD_SHUTDOWN,
            Command::Reboot => CMD_REBOOT,
            Command::SyncRtc => CMD_SYNCRTC,
        }
    }
}

/// Terminates the VM process with a disposition. Owned by the parent
/// VMM; this crate only defines the call it makes on timer expiry.
pub trait VmTerminator: Send + Sync {
    fn terminate(&self, disposition: Command);
}

/// Device-specific config area: a 4-byte command and a 16-byte
/// `{sec_lo, sec_hi, usec_lo, usec_hi}` wall-clock snapshot captured on
/// the first read of `sec_lo`.
pub struct VmmciConfig {
    pub command: u32,
    snapshot: Option<(u64, u64)>,
}

impl VmmciConfig {
    fn new() -> Self {
        VmmciConfig { command: CMD_NONE, snapshot: None }
    }

    /// Returns the `{sec, usec}` wall-clock pair, capturing it on first
    /// call and holding it steady for the remainder of this config
    /// generation (cleared on the next command write).
    pub fn wall_clock(&mut self) -> (u64, u64) {
        if self.snapshot.is_none() {
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
            self.snapshot = Some((now.as_secs(), now.subsec_micros() as u64));
        }
        self.snapshot.unwrap()
    }
}

pub struct VirtioVmmci {
    pub regs: RegisterFile,
    pub config: VmmciConfig,
    pending: Option<Command>,
    timer: Option<TimerHandle>,
    terminator: Arc<dyn VmTerminator>,
}

impl VirtioVmmci {
    pub fn new(terminator: Arc<dyn VmTerminator>) -> Self {
        VirtioVmmci {
            regs: RegisterFile::new(FEATURE_SYNCRTC, 0, 0),
            config: VmmciConfig::new(),
            pending: None,
            timer: None,
            terminator,
        }
    }

    fn guest_supports_syncrtc(&self) -> bool {
        self.regs.guest_feature & FEATURE_SYNCRTC != 0
    }

    /// Host-initiated command. Dropped outright unless the guest has
    /// reached `DRIVER_OK`.
    pub fn vmmci_ctl(&mut self, cmd: Command, reactor: &mut dyn Reactor, irq: &dyn IrqLine) {
        if !self.regs.driver_ok() {
            log::warn!("vmmci: ctl {cmd:?} dropped, driver not ready");
            return;
        }
        match cmd {
            Command::Shutdown | Command::Reboot => {
                // Shutdown is delivered as reboot on the wire to
                // accommodate guests lacking power-down support.
                self.config.command = Command::Reboot.to_u32();
                self.pending = Some(cmd);
                self.regs.raise_isr(ISR_CONFIG);
                irq.assert();
                self.arm_timer(reactor, ACK_TIMEOUT_SHORT, cmd);
            }
            Command::SyncRtc => {
                if !self.guest_supports_syncrtc() {
                    log::warn!("vmmci: SYNCRTC requested but guest hasn't acked the feature");
                    return;
                }
                self.config.command = Command::SyncRtc.to_u32();
                self.regs.raise_isr(ISR_CONFIG);
                irq.assert();
            }
            Command::None => {}
        }
    }

    /// Guest acknowledgement, delivered as a write to the config area's
    /// command field.
    pub fn vmmci_ack(&mut self, value: u32, reactor: &mut dyn Reactor) {
        let Some(cmd) = Command::from_u32(value) else {
            log::warn!("vmmci: ack of unknown command {value}");
            return;
        };
        match cmd {
            Command::Shutdown if self.pending.is_none() => {
                self.pending = Some(Command::Shutdown);
                self.arm_timer(reactor, ACK_TIMEOUT_SHORT, Command::Shutdown);
            }
            Command::Shutdown | Command::Reboot => {
                if self.pending.is_some() {
                    self.extend_timer(reactor, ACK_TIMEOUT_LONG);
                } else {
                    log::warn!("vmmci: ack {cmd:?} with no pending host request, ignored");
                }
            }
            Command::SyncRtc => {
                self.pending = None;
            }
            Command::None => {
                log::warn!("vmmci: ack of NONE ignored");
            }
        }
    }

    fn arm_timer(&mut self, reactor: &mut dyn Reactor, dur: Duration, disposition: Command) {
        if let Some(handle) = self.timer.take() {
            reactor.cancel_timer(handle);
        }
        let terminator = self.terminator.clone();
        self.timer = Some(reactor.timer(dur, Box::new(move || terminator.terminate(disposition))));
    }

    fn extend_timer(&mut self, reactor: &mut dyn Reactor, dur: Duration) {
        let disposition = self.pending.unwrap_or(Command::Reboot);
        self.arm_timer(reactor, dur, disposition);
    }

    pub fn reset(&mut self) {
        self.config = VmmciConfig::new();
        self.pending = None;
        self.timer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::{CountingIrqLine, ManualReactor};
    use crate::regs::{DeviceStatus, Register};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingTerminator {
        calls: AtomicUsize,
        last: std::sync::Mutex<Option<Command>>,
    }

    impl VmTerminator for RecordingTerminator {
        fn terminate(&self, disposition: Command) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(disposition);
        }
    }

    fn ready_vmmci(terminator: Arc<RecordingTerminator>) -> VirtioVmmci {
        let mut vmmci = VirtioVmmci::new(terminator);
        vmmci.regs.write(Register::DeviceStatus, DeviceStatus::DRIVER_OK.bits(), 4);
        vmmci
    }

    /// Scenario 6: `vmmci_ctl(SHUTDOWN)` with DRIVER_OK set records
    /// SHUTDOWN (delivered as REBOOT on the wire), asserts the
    /// config-change ISR bit, and arms the short timer; a guest ack of
    /// REBOOT extends it to the long timeout instead of firing early.
    #[test]
    fn scenario_vmmci_shutdown_ack() {
        let terminator = Arc::new(RecordingTerminator::default());
        let mut vmmci = ready_vmmci(terminator.clone());
        let mut reactor = ManualReactor::new();
        let irq = CountingIrqLine::default();

        vmmci.vmmci_ctl(Command::Shutdown, &mut reactor, &irq);
        assert_eq!(vmmci.config.command, CMD_REBOOT);
        assert_eq!(vmmci.regs.read_isr(), ISR_CONFIG);
        assert_eq!(irq.asserted.load(Ordering::SeqCst), 1);

        vmmci.vmmci_ack(CMD_REBOOT, &mut reactor);
        reactor.advance(ACK_TIMEOUT_SHORT);
        assert_eq!(terminator.calls.load(Ordering::SeqCst), 0, "short timer must have been replaced");

        reactor.advance(ACK_TIMEOUT_LONG);
        assert_eq!(terminator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*terminator.last.lock().unwrap(), Some(Command::Shutdown));
    }

    #[test]
    fn ctl_dropped_when_driver_not_ready() {
        let terminator = Arc::new(RecordingTerminator::default());
        let mut vmmci = VirtioVmmci::new(terminator);
        let mut reactor = ManualReactor::new();
        let irq = CountingIrqLine::default();
        vmmci.vmmci_ctl(Command::Shutdown, &mut reactor, &irq);
        assert_eq!(vmmci.config.command, CMD_NONE);
        assert_eq!(irq.asserted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn syncrtc_requires_feature_ack() {
        let terminator = Arc::new(RecordingTerminator::default());
        let mut vmmci = ready_vmmci(terminator);
        vmmci.regs.guest_feature = 0;
        let mut reactor = ManualReactor::new();
        let irq = CountingIrqLine::default();
        vmmci.vmmci_ctl(Command::SyncRtc, &mut reactor, &irq);
        assert_eq!(vmmci.config.command, CMD_NONE);
        assert_eq!(irq.asserted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn syncrtc_delivered_when_feature_acked() {
        let terminator = Arc::new(RecordingTerminator::default());
        let mut vmmci = ready_vmmci(terminator);
        vmmci.regs.guest_feature = FEATURE_SYNCRTC;
        let mut reactor = ManualReactor::new();
        let irq = CountingIrqLine::default();
        vmmci.vmmci_ctl(Command::SyncRtc, &mut reactor, &irq);
        assert_eq!(vmmci.config.command, CMD_SYNCRTC);
        assert_eq!(irq.asserted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guest_initiated_shutdown_arms_short_timer() {
        let terminator = Arc::new(RecordingTerminator::default());
        let mut vmmci = ready_vmmci(terminator.clone());
        let mut reactor = ManualReactor::new();
        vmmci.vmmci_ack(CMD_SHUTDOWN, &mut reactor);
        reactor.advance(ACK_TIMEOUT_SHORT);
        assert_eq!(terminator.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wall_clock_snapshot_is_stable_across_reads() {
        let terminator = Arc::new(RecordingTerminator::default());
        let vmmci = ready_vmmci(terminator);
        let mut config = vmmci.config;
        let first = config.wall_clock();
        let second = config.wall_clock();
        assert_eq!(first, second);
    }
}
