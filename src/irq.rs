//! ISR top-half / worker bottom-half split.
//!
//! The actual interrupt handler only ever does three things: read and ack
//! `USBSTS`, OR the acked bits into a status accumulator, and signal the
//! worker. Everything else — error classification, reaping, roothub port
//! handling — runs in the worker task, which never holds a lock across an
//! `.await` point. `critical_section` stands in for disabling the
//! controller's IRQ line; `embassy_sync::signal::Signal` stands in for the
//! condvar a thread-based implementation would use to wake the worker.

use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

use crate::regs::{sts, OpRegs};

/// Latched, not-yet-processed `USBSTS` bits plus the wakeup for whoever is
/// waiting to process them.
pub struct IrqState {
    status: AtomicU32,
    signal: Signal<CriticalSectionRawMutex, ()>,
}

impl IrqState {
    pub const fn new() -> Self {
        Self {
            status: AtomicU32::new(0),
            signal: Signal::new(),
        }
    }

    /// Top half. Call directly from the platform's interrupt vector.
    ///
    /// Re-reads `USBSTS` until two successive reads agree before acting on
    /// it — edge-triggered delivery means the vector can fire while the
    /// register is still settling, and acking a transient read would drop
    /// bits the controller hadn't finished asserting yet. Once stable, acks
    /// only the bits actually pending, ORs them into the status word, and
    /// wakes the worker. Does no reaping, no pool access, no logging —
    /// keeping this short is what lets the rest of the driver assume the
    /// hardware status register is never read twice for the same event.
    pub fn on_interrupt(&self, op: &OpRegs) {
        critical_section::with(|_cs| {
            let mut pending = op.usbsts() & sts::WRITE_BACK_MASK;
            loop {
                let reread = op.usbsts() & sts::WRITE_BACK_MASK;
                if reread == pending {
                    break;
                }
                pending = reread;
            }
            if pending == 0 {
                return;
            }
            op.ack_usbsts(pending);
            self.status.fetch_or(pending, Ordering::AcqRel);
            self.signal.signal(());
        });
    }

    /// Bottom half: waits for the next signal, then atomically takes and
    /// clears whatever status bits have accumulated since the last pass.
    /// Coalesces naturally — if the ISR fires twice before the worker
    /// wakes, both sets of bits are picked up in one pass.
    pub async fn wait_and_take(&self) -> u32 {
        self.signal.wait().await;
        self.signal.reset();
        self.status.swap(0, Ordering::AcqRel)
    }
}

impl Default for IrqState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn is_completion(bits: u32) -> bool {
    bits & (sts::USBINT | sts::USBERRINT) != 0
}

pub fn is_port_change(bits: u32) -> bool {
    bits & sts::PORT_CHANGE != 0
}

pub fn is_async_advance(bits: u32) -> bool {
    bits & sts::IAA != 0
}

/// Terminal for the controller; no recovery is attempted.
pub fn is_system_error(bits: u32) -> bool {
    bits & sts::SYSTEM_ERROR != 0
}

pub fn is_frame_rollover(bits: u32) -> bool {
    bits & sts::FRAME_ROLLOVER != 0
}

/// Callback the worker task drives on every status pass. Implemented by
/// [`crate::hcd::EhciHcd`]; kept as a trait (rather than inlining the
/// reaper call here) so this module stays hardware-status plumbing only.
pub trait StatusHandler {
    fn handle_status(&self, bits: u32);
}

/// Runs the worker loop forever, driving `handler` on every coalesced
/// status pass. Spawn this as an `embassy_executor` task on targets that
/// have one; call it from any other async runtime otherwise.
pub async fn worker_loop<H: StatusHandler>(state: &IrqState, handler: &H) -> ! {
    loop {
        let bits = state.wait_and_take().await;
        if bits != 0 {
            handler.handle_status(bits);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler {
        calls: core::cell::Cell<u32>,
        seen: core::cell::Cell<u32>,
    }

    impl StatusHandler for CountingHandler {
        fn handle_status(&self, bits: u32) {
            self.calls.set(self.calls.get() + 1);
            self.seen.set(self.seen.get() | bits);
        }
    }

    #[test]
    fn classification_helpers_match_bit_layout() {
        assert!(is_completion(sts::USBINT));
        assert!(is_completion(sts::USBERRINT));
        assert!(is_port_change(sts::PORT_CHANGE));
        assert!(is_async_advance(sts::IAA));
        assert!(is_system_error(sts::SYSTEM_ERROR));
        assert!(is_frame_rollover(sts::FRAME_ROLLOVER));
        assert!(!is_completion(sts::PORT_CHANGE));
    }

    #[test]
    fn take_without_a_signal_is_not_exercised_here() {
        // Exercising `on_interrupt`/`wait_and_take` end-to-end needs a live
        // `OpRegs` (real or mapped MMIO) and an executor to poll the
        // `Signal`; covered by the hcd-level integration tests instead.
        let state = IrqState::new();
        assert_eq!(state.status.load(Ordering::Relaxed), 0);
    }
}
