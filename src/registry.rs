//! Process-wide `hcd_ops` registration.
//!
//! There is exactly one EHCI controller instance's operations registered
//! at a time in this crate's model; the generic USB stack looks this up
//! once at enumeration time and calls through the returned function
//! pointers from then on.

use core::cell::Cell;

use critical_section::Mutex;

use crate::stack::HcdOps;

static REGISTRY: Mutex<Cell<Option<HcdOps>>> = Mutex::new(Cell::new(None));

/// Registers this driver's downward operations with the generic USB stack.
/// Idempotent: a later call replaces an earlier registration rather than
/// erroring, since re-registration only happens on controller re-init.
pub fn hcd_register(ops: HcdOps) {
    critical_section::with(|cs| REGISTRY.borrow(cs).set(Some(ops)));
}

/// Looks up the currently registered operations, if any.
pub fn hcd_ops() -> Option<HcdOps> {
    critical_section::with(|cs| REGISTRY.borrow(cs).get())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_init() -> i32 {
        0
    }
    fn noop_enqueue(_: &crate::stack::Transfer, _: &mut crate::stack::Pipe) -> i32 {
        0
    }
    fn noop_dequeue(_: &crate::stack::Transfer) {}
    fn noop_destroy(_: &mut crate::stack::Pipe) {}
    fn noop_roothub_status() -> u32 {
        0
    }

    #[test]
    fn register_then_lookup_roundtrips() {
        let ops = HcdOps {
            init: noop_init,
            transfer_enqueue: noop_enqueue,
            transfer_dequeue: noop_dequeue,
            pipe_destroy: noop_destroy,
            get_roothub_status: noop_roothub_status,
        };
        hcd_register(ops);
        assert!(hcd_ops().is_some());
    }
}
