//! Completion reaper: walks a QH's qTD ring, classifies
//! finished transfers, re-homes the QH's cursor, and returns descriptors to
//! the pool. Driven by the worker bottom-half after the ISR wakes it; never
//! runs with the IRQ lock held.

use crate::dma::{DmaAllocator, PhysAddr};
use crate::error::Error;
use crate::pool::{DescriptorPools, QhHandle, QtdHandle};
use crate::qtd::{error_mask, QtdToken};

/// Outcome of reaping one transfer.
pub struct Reaped {
    pub status: Result<usize, Error>,
}

/// Walks the qTD ring starting at `head` looking for the first descriptor
/// the controller has finished with (token `Active` clear).
///
/// Returns `None` if `head` (and everything after it, by construction) is
/// still active — nothing to reap yet. Otherwise classifies the run: a
/// clean run to the end of the ring is `Ok(bytes)`; an error token halts
/// the walk immediately — the first error is terminal for the whole ring —
/// and is reported as `Err(Error::TransactionError(n))` where `n` counts
/// the qTDs visited with an error bit set before the ring's remainder was
/// discarded.
pub fn reap_chain<A: DmaAllocator>(pools: &mut DescriptorPools<A>, qh: QhHandle, head: QtdHandle) -> Option<Reaped> {
    let first_token = pools.qtd_hw(head).token;
    if first_token.active() {
        return None;
    }

    let mut bytes = 0usize;
    let mut error_count: u8 = 0;
    let mut cur = Some(head);

    while let Some(h) = cur {
        let token = pools.qtd_hw(h).token;
        if token.active() {
            // The ring isn't entirely done yet, but everything visited so
            // far already completed cleanly; stop here and let the next
            // interrupt reap the rest.
            break;
        }

        bytes += transferred_bytes(pools, h, token);

        if has_error(token) {
            error_count += 1;
            cur = None; // terminal: don't keep walking past the failing qTD
            break;
        }

        cur = pools.qtd_entry(h).sibling_next;
    }

    if error_count > 0 {
        free_chain(pools, head);
        rehome(pools, qh);
        return Some(Reaped {
            status: Err(Error::TransactionError(error_count)),
        });
    }

    if cur.is_none() {
        // Walk reached the end of the ring (last qTD's `sibling_next` is
        // `None`) without error: the whole transfer is done.
        free_chain(pools, head);
        rehome(pools, qh);
        return Some(Reaped { status: Ok(bytes) });
    }

    None
}

/// Checks the QH overlay itself for a halted condition not tied to any
/// particular qTD (e.g. babble on an already-retired descriptor), treating
/// it the same as a qTD-level error for reporting purposes.
pub fn reap_halted_overlay<A: DmaAllocator>(pools: &mut DescriptorPools<A>, qh: QhHandle) -> Option<Reaped> {
    let overlay = pools.qh_hw(qh).token;
    if !overlay.halted() {
        return None;
    }
    rehome(pools, qh);
    Some(Reaped {
        status: Err(Error::Halted),
    })
}

fn has_error(token: QtdToken) -> bool {
    token.into_bits() & error_mask() != 0
}

fn transferred_bytes<A: DmaAllocator>(pools: &DescriptorPools<A>, h: QtdHandle, token: QtdToken) -> usize {
    let requested = pools.qtd_entry(h).requested as usize;
    let remaining = token.total_bytes() as usize;
    requested.saturating_sub(remaining)
}

/// Returns every qTD in the ring, starting at `head`, to the pool.
fn free_chain<A: DmaAllocator>(pools: &mut DescriptorPools<A>, head: QtdHandle) {
    let mut cur = Some(head);
    while let Some(h) = cur {
        let next = pools.qtd_entry(h).sibling_next;
        pools.qtd_entry_mut(h).sibling_next = None;
        pools.qtd_entry_mut(h).owner = None;
        pools.release_qtd(h);
        cur = next;
    }
}

/// Clears the QH overlay back to an idle, re-armable state so the next
/// `transfer_enqueue` can link a fresh qTD ring onto it.
fn rehome<A: DmaAllocator>(pools: &mut DescriptorPools<A>, qh: QhHandle) {
    pools.qh_entry_mut(qh).last_qtd = None;
    let hw = pools.qh_hw_mut(qh);
    hw.next_qtd = PhysAddr::INVALID.raw();
    hw.alt_next_qtd = PhysAddr::INVALID.raw();
    hw.token = QtdToken::new();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::fake::FakeDma;
    use crate::qtd::Pid;

    fn mark_done(pools: &mut DescriptorPools<FakeDma>, h: QtdHandle, remaining: u16, error: bool) {
        let hw = pools.qtd_hw_mut(h);
        let mut t = QtdToken::new().with_pid(Pid::In as u8).with_total_bytes(remaining);
        if error {
            t = t.with_xact_err(true);
        }
        hw.token = t;
    }

    #[test]
    fn clean_single_qtd_chain_reports_done() {
        let dma = FakeDma;
        let mut pools = DescriptorPools::new(&dma, 4, 4);
        let qh = pools.alloc_qh().unwrap();
        let qtd = pools.alloc_qtd().unwrap();
        pools.qtd_entry_mut(qtd).requested = 64;
        mark_done(&mut pools, qtd, 0, false);

        let result = reap_chain(&mut pools, qh, qtd).expect("fully idle chain reaps immediately");
        assert_eq!(result.status, Ok(64));
    }

    #[test]
    fn still_active_head_reaps_nothing() {
        let dma = FakeDma;
        let mut pools = DescriptorPools::new(&dma, 4, 4);
        let qh = pools.alloc_qh().unwrap();
        let qtd = pools.alloc_qtd().unwrap();
        pools.qtd_hw_mut(qtd).token = QtdToken::new().with_active(true);

        assert!(reap_chain(&mut pools, qh, qtd).is_none());
    }

    #[test]
    fn error_on_first_qtd_is_terminal() {
        let dma = FakeDma;
        let mut pools = DescriptorPools::new(&dma, 4, 4);
        let qh = pools.alloc_qh().unwrap();
        let qtd = pools.alloc_qtd().unwrap();
        pools.qtd_entry_mut(qtd).requested = 64;
        mark_done(&mut pools, qtd, 64, true);

        let result = reap_chain(&mut pools, qh, qtd).unwrap();
        assert_eq!(result.status, Err(Error::TransactionError(1)));
    }
}
