//! Interrupt line and event-scheduler abstractions.
//!
//! The legacy PCI interrupt is edge-triggered: setting `isr_status`'s
//! queue bit and asserting the line are a single logical event from the
//! guest's perspective, and reading `isr_status` atomically clears it
//! and deasserts the line. The real assert/deassert call goes through
//! the hypervisor's vCPU IRQ-injection interface, which is an external
//! collaborator; this crate only defines the trait boundary.

use std::time::Duration;

/// A single edge-triggered legacy PCI interrupt line. All devices in
/// this design share line 0, so the implementation is the
/// serialisation point across devices.
pub trait IrqLine: Send + Sync {
    fn assert(&self);
    fn deassert(&self);
}

/// A small scheduler abstraction standing in for the VMM's event/timer
/// loop: `watch_readable` wires tap-read-ready events, `timer` backs
/// vmmci's acknowledgement timers.
pub trait Reactor {
    fn watch_readable(&mut self, fd: std::os::fd::RawFd, cb: Box<dyn FnMut() + Send>);
    fn cancel_readable(&mut self, fd: std::os::fd::RawFd);
    fn timer(&mut self, dur: Duration, cb: Box<dyn FnOnce() + Send>) -> TimerHandle;
    fn cancel_timer(&mut self, handle: TimerHandle);
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct TimerHandle(pub u64);

/// A reactor a test drives by hand: `fire_readable`/`advance` invoke
/// the registered callbacks synchronously instead of going through a
/// real epoll loop.
type TimerEntry = (Duration, Option<Box<dyn FnOnce() + Send>>);

#[derive(Default)]
pub struct ManualReactor {
    readable: std::collections::HashMap<std::os::fd::RawFd, Box<dyn FnMut() + Send>>,
    timers: std::collections::HashMap<u64, TimerEntry>,
    next_timer: u64,
}

impl ManualReactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire_readable(&mut self, fd: std::os::fd::RawFd) {
        if let Some(cb) = self.readable.get_mut(&fd) {
            cb();
        }
    }

    /// Fires every timer whose remaining duration is at most `elapsed`.
    pub fn advance(&mut self, elapsed: Duration) {
        let due: Vec<u64> = self
            .timers
            .iter()
            .filter(|(_, (dur, _))| *dur <= elapsed)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            if let Some((_, Some(cb))) = self.timers.remove(&id) {
                cb();
            }
        }
    }
}

impl Reactor for ManualReactor {
    fn watch_readable(&mut self, fd: std::os::fd::RawFd, cb: Box<dyn FnMut() + Send>) {
        self.readable.insert(fd, cb);
    }

    fn cancel_readable(&mut self, fd: std::os::fd::RawFd) {
        self.readable.remove(&fd);
    }

    fn timer(&mut self, dur: Duration, cb: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let id = self.next_timer;
        self.next_timer += 1;
        self.timers.insert(id, (dur, Some(cb)));
        TimerHandle(id)
    }

    fn cancel_timer(&mut self, handle: TimerHandle) {
        self.timers.remove(&handle.0);
    }
}

/// A test double line that just counts assert/deassert calls.
#[derive(Default)]
pub struct CountingIrqLine {
    pub asserted: std::sync::atomic::AtomicUsize,
    pub deasserted: std::sync::atomic::AtomicUsize,
}

impl IrqLine for CountingIrqLine {
    fn assert(&self) {
        self.asserted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn deassert(&self) {
        self.deasserted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}
