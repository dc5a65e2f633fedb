//! Periodic schedule: the frame-indexed array that anchors interrupt QHs.
//!
//! The hardware frame list is a flat array of `EHCI_PERIODIC_SIZE` link
//! pointers; frame `i` is visited once per list traversal. An interrupt
//! endpoint with period `P` (frames) and phase `ph` needs to be reachable
//! from every frame `i` with `i mod P == ph` — `size / P` distinct array
//! slots, all pointing at the same physical QH. Since a QH has exactly one
//! `horiz_link` field, it cannot fan out to a different downstream chain
//! per slot, so this scheduler keeps each interrupt QH as the sole,
//! terminal occupant of its slot band rather than building the classic
//! shared-anchor tree: a band allocation either finds `size / P` entirely
//! free slots, or it fails. Bandwidth sharing across two interrupt
//! endpoints with overlapping residues is out of scope; exhaustion is
//! reported back to the stack, not silently degraded.

use crate::config::EHCI_PERIODIC_SIZE;
use crate::dma::{DmaAllocator, DmaBlock, PhysAddr};
use crate::error::Error;
use crate::pool::{DescriptorPools, QhHandle};
use crate::regs::OpRegs;
use crate::stack::Speed;

/// Owner bookkeeping for every frame-list slot, plus the DMA-backed
/// hardware array the controller walks.
///
/// `uframe_load` counts, per microframe (0..8), how many linked QHs start a
/// transaction there; `link_interrupt` always picks the least-loaded
/// microframe for a new QH's S-mask. This balances QH count across
/// microframes rather than accounting actual bus bandwidth in bytes — a
/// simplification consistent with the sole-occupant-band scheduling this
/// module already makes (see the module doc above).
pub struct PeriodicList {
    frame: DmaBlock,
    owner: [Option<QhHandle>; EHCI_PERIODIC_SIZE],
    uframe_load: [u32; 8],
}

impl PeriodicList {
    /// Allocates the frame-list array and initializes every entry to
    /// terminate, per the pool's allocation contract.
    pub fn new<A: DmaAllocator>(alloc: &A) -> Result<Self, Error> {
        let frame = alloc
            .alloc(EHCI_PERIODIC_SIZE * core::mem::size_of::<u32>(), 4096)
            .ok_or(Error::OutOfMemory)?;
        let list = Self {
            frame,
            owner: [None; EHCI_PERIODIC_SIZE],
            uframe_load: [0; 8],
        };
        for i in 0..EHCI_PERIODIC_SIZE {
            list.write_slot(i, PhysAddr::INVALID);
        }
        Ok(list)
    }

    pub fn phys_base(&self) -> PhysAddr {
        self.frame.phys
    }

    fn write_slot(&self, index: usize, val: PhysAddr) {
        unsafe {
            let ptr = (self.frame.virt.as_ptr() as *mut u32).add(index);
            core::ptr::write_volatile(ptr, val.raw());
        }
        crate::dma::barrier();
    }

    /// Programs `PERIODICLISTBASE` and sets the periodic-enable bit. Does
    /// not wait for `USBSTS.PS` to confirm, since that status bit only
    /// asserts once `RUN` is set; callers confirm after arming `RUN`.
    pub fn enable(&self, op: &OpRegs) {
        op.set_periodiclistbase(self.phys_base().raw());
        op.modify_usbcmd(|v| v | crate::regs::cmd::PERIODIC_ENABLE);
    }

    fn band(period: u32, phase: u32) -> impl Iterator<Item = usize> {
        let period = period as usize;
        let phase = phase as usize;
        (0..EHCI_PERIODIC_SIZE / period).map(move |k| phase + k * period)
    }

    fn band_is_free(&self, period: u32, phase: u32) -> bool {
        Self::band(period, phase).all(|slot| self.owner[slot].is_none())
    }

    /// Finds the first phase in `0..period` whose whole band is unoccupied.
    fn choose_phase(&self, period: u32) -> Option<u32> {
        (0..period).find(|&ph| self.band_is_free(period, ph))
    }

    /// Picks the microframe (0..8) with the fewest QHs currently starting a
    /// transaction there.
    fn choose_uframe(&self) -> u8 {
        (0u8..8).min_by_key(|&u| self.uframe_load[u as usize]).expect("8 microframes always present")
    }

    /// Links `qh` into the periodic schedule at the first available phase
    /// for `period`, per the band-allocation rule above, and assigns it a
    /// microframe via S-mask/C-mask. Caller holds the periodic lock.
    ///
    /// `speed` only selects the mask shape: split-transaction C-mask
    /// scheduling for low/full-speed devices behind a high-speed hub is out
    /// of scope, so every linked QH gets a single S-mask bit and a clear
    /// C-mask regardless of speed.
    pub fn link_interrupt<A: DmaAllocator>(&mut self, pools: &mut DescriptorPools<A>, period: u32, speed: Speed, qh: QhHandle) -> Result<(), Error> {
        debug_assert!(period.is_power_of_two());
        debug_assert!(period as usize <= EHCI_PERIODIC_SIZE);
        let _ = speed;

        let phase = self.choose_phase(period).ok_or(Error::InvalidConfiguration)?;
        let qh_phys = pools.qh_paddr(qh).raw() | 0b10; // type=QH

        for slot in Self::band(period, phase) {
            self.owner[slot] = Some(qh);
            self.write_slot(slot, PhysAddr(qh_phys));
        }

        let uframe = self.choose_uframe();
        self.uframe_load[uframe as usize] += 1;
        pools.qh_hw_mut(qh).set_masks(1 << uframe, 0);

        pools.qh_hw_mut(qh).horiz_link = PhysAddr::INVALID.raw();
        let entry = pools.qh_entry_mut(qh);
        entry.period = period;
        entry.phase = phase;
        entry.uframe = uframe;

        Ok(())
    }

    /// Every QH currently anchored in the periodic schedule, one entry per
    /// QH regardless of how many slots its band occupies: a QH's phase is
    /// always its band's lowest slot index, so filtering on `slot == phase`
    /// dedupes without needing a set (used by the worker to find periodic
    /// transfers to reap).
    pub fn linked_qhs<'p, A: DmaAllocator>(&'p self, pools: &'p DescriptorPools<A>) -> impl Iterator<Item = QhHandle> + 'p {
        self.owner
            .iter()
            .enumerate()
            .filter_map(move |(slot, owner)| owner.map(|h| (slot, h)))
            .filter(move |&(slot, h)| slot as u32 == pools.qh_entry(h).phase)
            .map(|(_, h)| h)
    }

    /// Removes `qh` from every slot of its previously-allocated band and
    /// frees its microframe back to the load counter.
    pub fn unlink_interrupt<A: DmaAllocator>(&mut self, pools: &mut DescriptorPools<A>, qh: QhHandle) {
        let (period, phase, uframe) = {
            let entry = pools.qh_entry(qh);
            (entry.period, entry.phase, entry.uframe)
        };
        if period == 0 {
            return; // never linked
        }
        for slot in Self::band(period, phase) {
            if self.owner[slot] == Some(qh) {
                self.owner[slot] = None;
                self.write_slot(slot, PhysAddr::INVALID);
            }
        }
        self.uframe_load[uframe as usize] = self.uframe_load[uframe as usize].saturating_sub(1);
        pools.qh_hw_mut(qh).set_masks(0, 0);
        let entry = pools.qh_entry_mut(qh);
        entry.period = 0;
        entry.phase = 0;
        entry.uframe = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::fake::FakeDma;

    #[test]
    fn first_interrupt_endpoint_gets_phase_zero() {
        let dma = FakeDma;
        let mut pools = DescriptorPools::new(&dma, 4, 4);
        let mut periodic = PeriodicList::new(&dma).unwrap();
        let qh = pools.alloc_qh().unwrap();
        periodic.link_interrupt(&mut pools, 8, Speed::High, qh).unwrap();
        assert_eq!(pools.qh_entry(qh).phase, 0);
    }

    #[test]
    fn conflicting_band_picks_next_free_phase() {
        let dma = FakeDma;
        let mut pools = DescriptorPools::new(&dma, 4, 4);
        let mut periodic = PeriodicList::new(&dma).unwrap();
        let a = pools.alloc_qh().unwrap();
        let b = pools.alloc_qh().unwrap();
        periodic.link_interrupt(&mut pools, 4, Speed::High, a).unwrap();
        periodic.link_interrupt(&mut pools, 4, Speed::High, b).unwrap();
        assert_ne!(pools.qh_entry(a).phase, pools.qh_entry(b).phase);
    }

    #[test]
    fn unlink_frees_the_band_for_reuse() {
        let dma = FakeDma;
        let mut pools = DescriptorPools::new(&dma, 4, 4);
        let mut periodic = PeriodicList::new(&dma).unwrap();
        let a = pools.alloc_qh().unwrap();
        periodic.link_interrupt(&mut pools, 2, Speed::High, a).unwrap();
        periodic.unlink_interrupt(&mut pools, a);
        let b = pools.alloc_qh().unwrap();
        periodic.link_interrupt(&mut pools, 2, Speed::High, b).unwrap();
        assert_eq!(pools.qh_entry(b).phase, 0);
    }

    #[test]
    fn linked_qhs_reports_each_anchor_once() {
        let dma = FakeDma;
        let mut pools = DescriptorPools::new(&dma, 4, 4);
        let mut periodic = PeriodicList::new(&dma).unwrap();
        let a = pools.alloc_qh().unwrap();
        let b = pools.alloc_qh().unwrap();
        periodic.link_interrupt(&mut pools, 4, Speed::High, a).unwrap(); // occupies 256 slots
        periodic.link_interrupt(&mut pools, 4, Speed::High, b).unwrap();
        let seen: alloc::vec::Vec<_> = periodic.linked_qhs(&pools).collect();
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&a) && seen.contains(&b));
    }

    #[test]
    fn link_assigns_distinct_least_loaded_microframes() {
        let dma = FakeDma;
        let mut pools = DescriptorPools::new(&dma, 4, 4);
        let mut periodic = PeriodicList::new(&dma).unwrap();
        let a = pools.alloc_qh().unwrap();
        let b = pools.alloc_qh().unwrap();
        periodic.link_interrupt(&mut pools, 4, Speed::High, a).unwrap();
        periodic.link_interrupt(&mut pools, 4, Speed::High, b).unwrap();
        assert_ne!(pools.qh_entry(a).uframe, pools.qh_entry(b).uframe);
        assert_eq!(pools.qh_hw(a).info2.smask(), 1 << pools.qh_entry(a).uframe);
    }

    #[test]
    fn unlink_returns_microframe_load_for_reuse() {
        let dma = FakeDma;
        let mut pools = DescriptorPools::new(&dma, 4, 4);
        let mut periodic = PeriodicList::new(&dma).unwrap();
        let a = pools.alloc_qh().unwrap();
        periodic.link_interrupt(&mut pools, 2, Speed::High, a).unwrap();
        let uframe_a = pools.qh_entry(a).uframe;
        periodic.unlink_interrupt(&mut pools, a);
        let b = pools.alloc_qh().unwrap();
        periodic.link_interrupt(&mut pools, 2, Speed::High, b).unwrap();
        assert_eq!(pools.qh_entry(b).uframe, uframe_a);
    }

    #[test]
    fn exhausted_band_reports_invalid_configuration() {
        let dma = FakeDma;
        let mut pools = DescriptorPools::new(&dma, 4, 4);
        let mut periodic = PeriodicList::new(&dma).unwrap();
        for _ in 0..EHCI_PERIODIC_SIZE {
            let qh = pools.alloc_qh().unwrap();
            periodic.link_interrupt(&mut pools, 1, Speed::High, qh).ok();
        }
        let one_more = pools.alloc_qh().unwrap();
        assert_eq!(periodic.link_interrupt(&mut pools, 1, Speed::High, one_more), Err(Error::InvalidConfiguration));
    }
}
